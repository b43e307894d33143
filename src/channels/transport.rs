//! Transport abstraction for chat-network I/O.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ChannelError;
use crate::pipeline::types::{ChannelRef, InboundMessage, Media};

/// Stream of inbound messages produced by a running transport.
pub type MessageStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

/// Chat-network transport. Pure I/O, no forwarding logic.
///
/// Rewriting, routing and checkpointing live in `ForwardingCoordinator`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name (e.g. "telegram").
    fn name(&self) -> &str;

    /// Start receiving messages.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Send text (and optionally media) to a target. Returns the sent message ID.
    async fn send_message(
        &self,
        target: &str,
        text: &str,
        media: Option<&Media>,
    ) -> Result<i64, ChannelError>;

    /// Resolve `@username`, bare or prefixed numeric identifiers.
    async fn resolve_channel(&self, identifier: &str) -> Result<ChannelRef, ChannelError>;

    /// Messages in `source` strictly newer than `after_id`, oldest first.
    async fn iter_history(
        &self,
        source: &ChannelRef,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, ChannelError>;

    /// Make sure the relay can read `identifier`. `Ok(false)` when it cannot.
    async fn join_channel(&self, identifier: &str) -> Result<bool, ChannelError>;

    /// Check credentials/connectivity.
    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
