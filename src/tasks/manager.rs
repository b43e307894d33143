//! Task mutations.
//!
//! Every mutation is persisted first, then the live `TaskIndex` is rebuilt
//! from the store before returning, so the next inbound message already
//! sees the change.

use std::sync::Arc;

use tracing::info;

use crate::error::{CommandError, DatabaseError};
use crate::pipeline::index::TaskIndex;
use crate::store::Database;
use crate::tasks::model::{NewTask, Task};

pub struct TaskManager {
    store: Arc<dyn Database>,
    index: Arc<TaskIndex>,
}

impl TaskManager {
    pub fn new(store: Arc<dyn Database>, index: Arc<TaskIndex>) -> Self {
        Self { store, index }
    }

    /// Rebuild the index from the store. Returns the number of stored tasks.
    pub async fn reload(&self) -> Result<usize, DatabaseError> {
        let tasks = self.store.list_tasks().await?;
        self.index.rebuild(&tasks);
        Ok(tasks.len())
    }

    pub async fn list(&self) -> Result<Vec<Task>, CommandError> {
        Ok(self.store.list_tasks().await?)
    }

    pub async fn get(&self, id: i64) -> Result<Task, CommandError> {
        self.store
            .get_task(id)
            .await?
            .ok_or(CommandError::TaskNotFound(id))
    }

    pub async fn create(&self, mut task: NewTask) -> Result<Task, CommandError> {
        task.source_id = required("source", &task.source_id)?;
        task.target_id = required("target", &task.target_id)?;

        let created = self.store.create_task(&task).await?;
        self.reload().await?;
        info!(
            task_id = created.id,
            source_id = %created.source_id,
            target_id = %created.target_id,
            mode = %created.mode,
            "Task created"
        );
        Ok(created)
    }

    pub async fn update(&self, task: &Task) -> Result<(), CommandError> {
        let mut task = task.clone();
        task.source_id = required("source", &task.source_id)?;
        task.target_id = required("target", &task.target_id)?;

        self.store.update_task(&task).await.map_err(|e| match e {
            DatabaseError::NotFound { .. } => CommandError::TaskNotFound(task.id),
            other => CommandError::Database(other),
        })?;
        self.reload().await?;
        info!(task_id = task.id, "Task updated");
        Ok(())
    }

    /// Delete a task. Deleting a missing task is not an error.
    pub async fn delete(&self, id: i64) -> Result<bool, CommandError> {
        let deleted = self.store.delete_task(id).await?;
        self.reload().await?;
        if deleted {
            info!(task_id = id, "Task deleted");
        }
        Ok(deleted)
    }

    pub async fn set_active(&self, id: i64, active: bool) -> Result<(), CommandError> {
        if !self.store.set_task_active(id, active).await? {
            return Err(CommandError::TaskNotFound(id));
        }
        self.reload().await?;
        info!(task_id = id, active, "Task state changed");
        Ok(())
    }
}

fn required(field: &str, value: &str) -> Result<String, CommandError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CommandError::MissingField(field.to_string()));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::ChannelRef;
    use crate::store::LibSqlBackend;
    use crate::tasks::model::TaskMode;

    async fn test_manager() -> (TaskManager, Arc<TaskIndex>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let index = Arc::new(TaskIndex::new());
        (TaskManager::new(store, index.clone()), index)
    }

    #[tokio::test]
    async fn create_updates_index() {
        let (manager, index) = test_manager().await;
        let task = manager.create(NewTask::new(" @News ", "@mirror")).await.unwrap();

        assert_eq!(task.source_id, "@News");
        assert_eq!(index.lookup("@news").len(), 1);
    }

    #[tokio::test]
    async fn history_tasks_stay_out_of_index() {
        let (manager, index) = test_manager().await;
        manager
            .create(NewTask::new("@news", "@mirror").with_mode(TaskMode::History))
            .await
            .unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn missing_target_is_rejected() {
        let (manager, index) = test_manager().await;
        let err = manager.create(NewTask::new("@news", "  ")).await.unwrap_err();
        assert!(matches!(err, CommandError::MissingField(ref f) if f == "target"));
        assert!(index.is_empty());
        assert!(manager.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let (manager, index) = test_manager().await;
        let task = manager.create(NewTask::new("@news", "@mirror")).await.unwrap();
        let chat = ChannelRef::new(-1).with_username("news");

        manager.set_active(task.id, false).await.unwrap();
        assert!(index.candidates(&chat).is_empty());

        manager.set_active(task.id, true).await.unwrap();
        assert_eq!(index.candidates(&chat).len(), 1);
    }

    #[tokio::test]
    async fn pause_missing_task() {
        let (manager, _) = test_manager().await;
        let err = manager.set_active(99, false).await.unwrap_err();
        assert!(matches!(err, CommandError::TaskNotFound(99)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (manager, index) = test_manager().await;
        let task = manager.create(NewTask::new("@news", "@mirror")).await.unwrap();

        assert!(manager.delete(task.id).await.unwrap());
        assert!(index.is_empty());
        assert!(!manager.delete(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn update_moves_index_entry() {
        let (manager, index) = test_manager().await;
        let mut task = manager.create(NewTask::new("@news", "@mirror")).await.unwrap();

        task.source_id = "@daily".into();
        manager.update(&task).await.unwrap();

        assert!(index.lookup("@news").is_empty());
        assert_eq!(index.lookup("@daily").len(), 1);
    }

    #[tokio::test]
    async fn update_rejects_empty_source() {
        let (manager, _) = test_manager().await;
        let mut task = manager.create(NewTask::new("@news", "@mirror")).await.unwrap();
        task.source_id = String::new();

        let err = manager.update(&task).await.unwrap_err();
        assert!(matches!(err, CommandError::MissingField(ref f) if f == "source"));
        assert_eq!(manager.get(task.id).await.unwrap().source_id, "@news");
    }
}
