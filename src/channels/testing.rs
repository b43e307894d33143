//! In-process transport that records sends, for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::channels::transport::{MessageStream, Transport};
use crate::error::ChannelError;
use crate::pipeline::types::{ChannelRef, InboundMessage, Media};

/// One recorded `send_message` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub target: String,
    pub text: String,
    pub media: Option<Media>,
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMessage>>,
    channels: Mutex<HashMap<String, ChannelRef>>,
    history: Mutex<HashMap<i64, Vec<InboundMessage>>>,
    failing_targets: Mutex<HashSet<String>>,
    failures_left: AtomicU32,
    stalls_left: AtomicU32,
    stall: Mutex<Duration>,
    rate_limits_left: AtomicU32,
    retry_after: Mutex<Option<Duration>>,
    attempts: AtomicU32,
    next_id: AtomicU32,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `identifier` resolvable.
    pub fn with_channel(self, identifier: &str, channel: ChannelRef) -> Self {
        self.channels
            .lock()
            .unwrap()
            .insert(identifier.to_string(), channel);
        self
    }

    /// Seed history for a chat, in any order.
    pub fn with_history(self, chat_id: i64, messages: Vec<InboundMessage>) -> Self {
        self.history.lock().unwrap().insert(chat_id, messages);
        self
    }

    /// Fail the next `n` sends regardless of target.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Hold the next `n` sends for `stall` before completing them.
    pub fn stall_next(&self, n: u32, stall: Duration) {
        *self.stall.lock().unwrap() = stall;
        self.stalls_left.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` sends as rate limited.
    pub fn rate_limit_next(&self, n: u32, retry_after: Option<Duration>) {
        *self.retry_after.lock().unwrap() = retry_after;
        self.rate_limits_left.store(n, Ordering::SeqCst);
    }

    /// Fail every send to `target`.
    pub fn fail_target(&self, target: &str) {
        self.failing_targets
            .lock()
            .unwrap()
            .insert(target.to_string());
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, target: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.target == target)
            .collect()
    }

    /// Total send attempts, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn send_message(
        &self,
        target: &str,
        text: &str,
        media: Option<&Media>,
    ) -> Result<i64, ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if take_one(&self.stalls_left) {
            let stall = *self.stall.lock().unwrap();
            tokio::time::sleep(stall).await;
        }

        if take_one(&self.rate_limits_left) {
            return Err(ChannelError::RateLimited {
                name: "recording".into(),
                retry_after: *self.retry_after.lock().unwrap(),
            });
        }

        if take_one(&self.failures_left) || self.failing_targets.lock().unwrap().contains(target) {
            return Err(ChannelError::SendFailed {
                name: "recording".into(),
                reason: format!("send to {target} refused"),
            });
        }

        self.sent.lock().unwrap().push(SentMessage {
            target: target.to_string(),
            text: text.to_string(),
            media: media.cloned(),
        });
        Ok(i64::from(self.next_id.fetch_add(1, Ordering::SeqCst)) + 1)
    }

    async fn resolve_channel(&self, identifier: &str) -> Result<ChannelRef, ChannelError> {
        self.channels
            .lock()
            .unwrap()
            .get(identifier)
            .cloned()
            .ok_or_else(|| ChannelError::ResolveFailed {
                name: "recording".into(),
                identifier: identifier.to_string(),
                reason: "unknown chat".into(),
            })
    }

    async fn iter_history(
        &self,
        source: &ChannelRef,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, ChannelError> {
        let mut page: Vec<InboundMessage> = self
            .history
            .lock()
            .unwrap()
            .get(&source.id)
            .into_iter()
            .flatten()
            .filter(|m| m.id > after_id)
            .cloned()
            .collect();
        page.sort_by_key(|m| m.id);
        page.truncate(limit);
        Ok(page)
    }

    async fn join_channel(&self, identifier: &str) -> Result<bool, ChannelError> {
        Ok(self.channels.lock().unwrap().contains_key(identifier))
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
