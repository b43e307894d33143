//! In-memory index of live tasks by source.
//!
//! Readers load an `Arc` snapshot and never wait on a rebuild; a rebuild
//! publishes a whole new map in one swap.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use crate::pipeline::matcher::{normalize, source_matches};
use crate::pipeline::types::ChannelRef;
use crate::tasks::model::{Task, TaskMode};

type Snapshot = HashMap<String, Vec<Task>>;

/// Normalized source identifier → active live tasks.
pub struct TaskIndex {
    snapshot: ArcSwap<Snapshot>,
}

impl Default for TaskIndex {
    fn default() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }
}

impl TaskIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from a full task list.
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let index = Self::new();
        index.rebuild(tasks);
        index
    }

    /// Replace the index contents. Inactive and history tasks are left out.
    pub fn rebuild(&self, tasks: &[Task]) {
        let mut map: Snapshot = HashMap::new();
        for task in tasks
            .iter()
            .filter(|t| t.is_active && t.mode == TaskMode::Live)
        {
            map.entry(normalize(&task.source_id))
                .or_default()
                .push(task.clone());
        }
        debug!(sources = map.len(), "Task index rebuilt");
        self.snapshot.store(Arc::new(map));
    }

    /// Tasks whose normalized source equals `source_id`.
    pub fn lookup(&self, source_id: &str) -> Vec<Task> {
        self.snapshot
            .load()
            .get(&normalize(source_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Tasks whose source matches an inbound chat, ordered by task ID.
    pub fn candidates(&self, chat: &ChannelRef) -> Vec<Task> {
        let snapshot = self.snapshot.load();
        let mut tasks: Vec<Task> = snapshot
            .iter()
            .filter(|(source, _)| source_matches(source, chat).is_match())
            .flat_map(|(_, tasks)| tasks.iter().cloned())
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Number of indexed tasks.
    pub fn len(&self) -> usize {
        self.snapshot.load().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
