//! End-to-end tests: operator commands, live forwarding and history backfill
//! against an in-memory libSQL store and a stub transport.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use channel_relay::channels::{MessageStream, Transport};
use channel_relay::commands::CommandHandler;
use channel_relay::config::{BackfillConfig, RetryPolicy};
use channel_relay::error::ChannelError;
use channel_relay::pipeline::backfill::BackfillWorker;
use channel_relay::pipeline::coordinator::ForwardingCoordinator;
use channel_relay::pipeline::index::TaskIndex;
use channel_relay::pipeline::types::{ChannelRef, InboundMessage, Media, TaskOutcome};
use channel_relay::store::{Database, LibSqlBackend};
use channel_relay::tasks::TaskManager;

/// Stub transport: known chats, recorded sends, history served from the
/// store journal like the Telegram transport does.
struct StubTransport {
    store: Arc<dyn Database>,
    chats: HashMap<String, ChannelRef>,
    sent: Mutex<Vec<(String, String)>>,
}

impl StubTransport {
    fn new(store: Arc<dyn Database>) -> Self {
        let chats = [
            ("@news", ChannelRef::new(-100123).with_username("news").with_title("News")),
            ("@mirror", ChannelRef::new(-100456).with_username("mirror").with_title("Mirror")),
            ("@audit", ChannelRef::new(-100789).with_title("Audit")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            store,
            chats,
            sent: Mutex::new(Vec::new()),
        }
    }

    fn sent_to(&self, target: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for StubTransport {
    fn name(&self) -> &str {
        "stub"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn send_message(
        &self,
        target: &str,
        text: &str,
        _media: Option<&Media>,
    ) -> Result<i64, ChannelError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((target.to_string(), text.to_string()));
        Ok(sent.len() as i64)
    }

    async fn resolve_channel(&self, identifier: &str) -> Result<ChannelRef, ChannelError> {
        self.chats
            .get(identifier)
            .cloned()
            .ok_or_else(|| ChannelError::ResolveFailed {
                name: "stub".into(),
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
        self.store
            .list_channel_messages(source.id, after_id, limit)
            .await
            .map_err(|e| ChannelError::HistoryUnavailable {
                name: "stub".into(),
                reason: e.to_string(),
            })
    }

    async fn join_channel(&self, identifier: &str) -> Result<bool, ChannelError> {
        Ok(self.chats.contains_key(identifier))
    }
}

struct Relay {
    store: Arc<dyn Database>,
    transport: Arc<StubTransport>,
    coordinator: Arc<ForwardingCoordinator>,
    commands: CommandHandler,
}

async fn relay() -> Relay {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let transport = Arc::new(StubTransport::new(Arc::clone(&store)));
    let index = Arc::new(TaskIndex::new());
    let tasks = Arc::new(TaskManager::new(Arc::clone(&store), Arc::clone(&index)));
    tasks.reload().await.unwrap();

    let retry = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        send_timeout: Duration::from_secs(1),
    };
    let coordinator = Arc::new(ForwardingCoordinator::new(
        Arc::clone(&store),
        transport.clone(),
        index,
        retry,
    ));
    let commands = CommandHandler::new(tasks, Arc::clone(&store), transport.clone());

    Relay {
        store,
        transport,
        coordinator,
        commands,
    }
}

fn news() -> ChannelRef {
    ChannelRef::new(-100123).with_username("news").with_title("News")
}

async fn command(relay: &Relay, text: &str) -> String {
    relay.commands.handle(text).await.unwrap()
}

#[tokio::test]
async fn live_message_is_rewritten_forwarded_and_reported() {
    let relay = relay().await;
    command(
        &relay,
        "/add\nsource: @news\ntarget: @mirror\nfind_user: @old\nreplace_user: @new",
    )
    .await;
    command(&relay, "/rule\nfind: promo\nreplace: SKIP_MESSAGE").await;
    command(&relay, "/log @audit").await;

    let outcomes = relay
        .coordinator
        .handle(&InboundMessage::new(7, news(), "Hi @old, see you"))
        .await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], TaskOutcome::Forwarded { task_id: 1, .. }));

    assert_eq!(relay.transport.sent_to("@mirror"), vec!["Hi @new, see you"]);
    let reports = relay.transport.sent_to("-100789");
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("Replaced '@old' -> '@new'"), "{}", reports[0]);

    let task = relay.store.get_task(1).await.unwrap().unwrap();
    assert_eq!(task.last_processed_id, 7);

    let outcomes = relay
        .coordinator
        .handle(&InboundMessage::new(8, news(), "big promo today"))
        .await;
    assert!(matches!(outcomes[0], TaskOutcome::Skipped { .. }));
    assert_eq!(relay.transport.sent_to("@mirror").len(), 1);
    assert_eq!(relay.store.get_task(1).await.unwrap().unwrap().last_processed_id, 7);
}

#[tokio::test]
async fn link_style_source_matches_channel_posts() {
    let relay = relay().await;
    let reply = command(&relay, "/add\nsource: https://t.me/news\ntarget: t.me/mirror").await;
    assert!(reply.contains("@news -> @mirror"), "{reply}");

    let outcomes = relay
        .coordinator
        .handle(&InboundMessage::new(5, news(), "hello"))
        .await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(relay.transport.sent_to("@mirror"), vec!["hello"]);
}

#[tokio::test]
async fn paused_task_receives_nothing() {
    let relay = relay().await;
    command(&relay, "/add\nsource: @news\ntarget: @mirror").await;
    assert_eq!(command(&relay, "/pause 1").await, "Task #1 paused.");

    let outcomes = relay
        .coordinator
        .handle(&InboundMessage::new(1, news(), "hello"))
        .await;
    assert!(outcomes.is_empty());
    assert!(relay.transport.sent_to("@mirror").is_empty());

    command(&relay, "/resume 1").await;
    let outcomes = relay
        .coordinator
        .handle(&InboundMessage::new(2, news(), "hello again"))
        .await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(relay.transport.sent_to("@mirror"), vec!["hello again"]);
}

#[tokio::test]
async fn history_task_backfills_journaled_posts() {
    let relay = relay().await;
    for (id, text) in [(3, "third"), (1, "first"), (2, "second")] {
        relay
            .store
            .record_channel_message(&InboundMessage::new(id, news(), text))
            .await
            .unwrap();
    }

    let reply = command(&relay, "/add\nsource: @news\ntarget: @mirror\nmode: history").await;
    assert!(reply.contains("added (history)"), "{reply}");

    // History tasks are not live.
    let outcomes = relay
        .coordinator
        .handle(&InboundMessage::new(4, news(), "live"))
        .await;
    assert!(outcomes.is_empty());

    let config = BackfillConfig {
        message_delay: Duration::ZERO,
        ..BackfillConfig::default()
    };
    let mut worker = BackfillWorker::new(
        Arc::clone(&relay.store),
        relay.transport.clone(),
        Arc::clone(&relay.coordinator),
        config,
    );
    let shutdown = AtomicBool::new(false);

    let pass = worker.run_once(&shutdown).await.unwrap();
    assert_eq!(pass.tasks, 1);
    assert_eq!(pass.forwarded, 3);
    assert_eq!(
        relay.transport.sent_to("@mirror"),
        vec!["first", "second", "third"]
    );
    assert_eq!(relay.store.get_task(1).await.unwrap().unwrap().last_processed_id, 3);

    // Caught up: nothing replays.
    let pass = worker.run_once(&shutdown).await.unwrap();
    assert_eq!(pass.forwarded, 0);
    assert_eq!(relay.transport.sent_to("@mirror").len(), 3);
}

#[tokio::test]
async fn duplicate_tasks_each_send() {
    let relay = relay().await;
    command(&relay, "/add\nsource: @news\ntarget: @mirror").await;
    command(&relay, "/add\nsource: -100123\ntarget: @mirror").await;

    let outcomes = relay
        .coordinator
        .handle(&InboundMessage::new(5, news(), "twice"))
        .await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(relay.transport.sent_to("@mirror"), vec!["twice", "twice"]);
}

#[tokio::test]
async fn add_without_target_is_refused() {
    let relay = relay().await;
    let reply = command(&relay, "/add\nsource: @news").await;
    assert_eq!(reply, "Error: `target` is required.");
    assert!(relay.store.list_tasks().await.unwrap().is_empty());
}
