//! Operator text commands.
//!
//! Commands arrive as plain messages in the admin chat. Multi-field commands
//! take a `key: value` template, one field per line:
//!
//! ```text
//! /add
//! source: @SourceChannel
//! target: @TargetChannel
//! find_user: @OldUser
//! replace_user: @NewUser
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::channels::Transport;
use crate::error::CommandError;
use crate::pipeline::matcher::canonical_identifier;
use crate::pipeline::rules::{Rule, RuleKind};
use crate::settings::GlobalSettings;
use crate::store::Database;
use crate::tasks::manager::TaskManager;
use crate::tasks::model::{NewTask, TaskConfig, TaskMode};

/// Replacement value meaning "delete the match".
const BLANK: &str = "BLANK";

const ADD_KEYS: &[&str] = &[
    "source",
    "target",
    "mode",
    "find_user",
    "replace_user",
    "find_link",
    "replace_link",
    "strip_links",
    "strip_captions",
];

const RULE_KEYS: &[&str] = &["find", "replace", "kind"];

const HELP: &str = "\
Relay commands

/list - list all tasks
/add - add a task (template below)
/del <id> - delete a task
/pause <id> - pause a task
/resume <id> - resume a task
/rules - list global rules
/rule - add a global rule (template below)
/unrule <n> - delete global rule n
/log <channel|off> - set or clear the report channel

Add task:
/add
source: @SourceChannel
target: @TargetChannel
mode: live | history (optional)
find_user: @OldUser (optional)
replace_user: @NewUser (optional)
find_link: t.me/OldLink (optional)
replace_link: t.me/NewLink (optional)
strip_links: yes | no (optional)
strip_captions: yes | no (optional)

Add global rule:
/rule
find: text
replace: new text | BLANK | SKIP_MESSAGE | DELETE_LINE
kind: text | mention | link (optional)";

pub struct CommandHandler {
    tasks: Arc<TaskManager>,
    store: Arc<dyn Database>,
    transport: Arc<dyn Transport>,
    /// Held for the whole command; settings edits are read-modify-write.
    serial: Mutex<()>,
}

impl CommandHandler {
    pub fn new(
        tasks: Arc<TaskManager>,
        store: Arc<dyn Database>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            tasks,
            store,
            transport,
            serial: Mutex::new(()),
        }
    }

    /// Run a command. `None` when `text` is not a command.
    pub async fn handle(&self, text: &str) -> Option<String> {
        let text = text.trim();
        if !text.starts_with('/') {
            return None;
        }

        let _serial = self.serial.lock().await;

        let (head, args) = text
            .split_once(char::is_whitespace)
            .unwrap_or((text, ""));
        // `/list@relay_bot` in group chats.
        let command = head.split('@').next().unwrap_or(head).to_ascii_lowercase();

        let result = match command.as_str() {
            "/help" | "/start" => Ok(HELP.to_string()),
            "/list" => self.list().await,
            "/add" => self.add(args).await,
            "/del" => self.delete(args).await,
            "/pause" => self.set_active(args, false).await,
            "/resume" => self.set_active(args, true).await,
            "/rules" => self.rules().await,
            "/rule" => self.add_rule(args).await,
            "/unrule" => self.remove_rule(args).await,
            "/log" => self.log_channel(args).await,
            _ => Err(CommandError::Usage(format!(
                "unknown command {command}. Send /help for the list."
            ))),
        };

        Some(match result {
            Ok(reply) => reply,
            Err(e) => {
                warn!(command = %command, "Command failed: {e}");
                format!("Error: {e}")
            }
        })
    }

    async fn list(&self) -> Result<String, CommandError> {
        let tasks = self.tasks.list().await?;
        if tasks.is_empty() {
            return Ok("No tasks configured.".into());
        }
        let lines: Vec<String> = tasks.iter().map(|t| t.summary()).collect();
        Ok(format!("Tasks:\n{}", lines.join("\n")))
    }

    async fn add(&self, args: &str) -> Result<String, CommandError> {
        let fields = parse_template(args, ADD_KEYS);
        let source = fields
            .get("source")
            .ok_or_else(|| CommandError::MissingField("source".into()))?;
        let target = fields
            .get("target")
            .ok_or_else(|| CommandError::MissingField("target".into()))?;

        let mode = match fields.get("mode") {
            Some(m) => m.parse::<TaskMode>().map_err(|_| CommandError::InvalidField {
                field: "mode".into(),
                value: m.clone(),
            })?,
            None => TaskMode::Live,
        };

        let config = TaskConfig {
            strip_links: flag(&fields, "strip_links")?,
            strip_captions: flag(&fields, "strip_captions")?,
        };

        let mut rules = Vec::new();
        if let Some(rule) = pair(&fields, "find_user", "replace_user", RuleKind::Mention)? {
            rules.push(rule);
        }
        if let Some(rule) = pair(&fields, "find_link", "replace_link", RuleKind::Link)? {
            rules.push(rule);
        }

        let mut notes = Vec::new();
        let (source_id, source_title) = self.resolve(source, &mut notes).await;
        let (target_id, target_title) = self.resolve(target, &mut notes).await;

        match self.transport.join_channel(&source_id).await {
            Ok(true) => {}
            Ok(false) => notes.push(format!(
                "Warning: cannot read {source_id}. Forwarding will not work until the relay can see it."
            )),
            Err(e) => notes.push(format!("Warning: could not check access to {source_id}: {e}")),
        }

        let task = self
            .tasks
            .create(
                NewTask::new(source_id, target_id)
                    .with_mode(mode)
                    .with_rules(rules)
                    .with_config(config)
                    .with_titles(source_title, target_title),
            )
            .await?;

        let mut reply = format!(
            "Task #{} added ({}): {} -> {}",
            task.id, task.mode, task.source_id, task.target_id
        );
        for note in notes {
            reply.push('\n');
            reply.push_str(&note);
        }
        Ok(reply)
    }

    /// Identifier to store and display title for operator input.
    ///
    /// A resolved chat yields its own identifier; otherwise the input is
    /// canonicalized and doubles as the title.
    async fn resolve(&self, input: &str, notes: &mut Vec<String>) -> (String, String) {
        let identifier = canonical_identifier(input);
        match self.transport.resolve_channel(&identifier).await {
            Ok(channel) => (channel.identifier(), channel.display_name()),
            Err(e) => {
                info!(identifier = %identifier, "Could not resolve chat: {e}");
                notes.push(format!(
                    "Note: could not resolve {identifier}; storing it unresolved."
                ));
                (identifier.clone(), identifier)
            }
        }
    }

    async fn delete(&self, args: &str) -> Result<String, CommandError> {
        let id = task_id(args, "/del <id>")?;
        if self.tasks.delete(id).await? {
            Ok(format!("Task #{id} deleted."))
        } else {
            Ok(format!("Task #{id} did not exist."))
        }
    }

    async fn set_active(&self, args: &str, active: bool) -> Result<String, CommandError> {
        let usage = if active { "/resume <id>" } else { "/pause <id>" };
        let id = task_id(args, usage)?;
        self.tasks.set_active(id, active).await?;
        Ok(if active {
            format!("Task #{id} resumed.")
        } else {
            format!("Task #{id} paused.")
        })
    }

    async fn rules(&self) -> Result<String, CommandError> {
        let settings = GlobalSettings::load(self.store.as_ref()).await?;
        if settings.rules.is_empty() {
            return Ok("No global rules.".into());
        }
        let lines: Vec<String> = settings
            .rules
            .iter()
            .enumerate()
            .map(|(i, r)| format!("{}. {}", i + 1, describe_rule(r)))
            .collect();
        Ok(format!("Global rules:\n{}", lines.join("\n")))
    }

    async fn add_rule(&self, args: &str) -> Result<String, CommandError> {
        let fields = parse_template(args, RULE_KEYS);
        let find = fields
            .get("find")
            .ok_or_else(|| CommandError::MissingField("find".into()))?;
        let replace = fields
            .get("replace")
            .ok_or_else(|| CommandError::MissingField("replace".into()))?;
        let kind = match fields.get("kind") {
            Some(k) => k.parse::<RuleKind>().map_err(|_| CommandError::InvalidField {
                field: "kind".into(),
                value: k.clone(),
            })?,
            None => RuleKind::Text,
        };

        let rule = Rule::new(find.as_str(), blank_to_empty(replace)).with_kind(kind);
        let description = describe_rule(&rule);
        let rules = GlobalSettings::append_rule(self.store.as_ref(), rule).await?;
        info!(position = rules.len(), "Global rule added");
        Ok(format!("Rule {} added: {description}", rules.len()))
    }

    async fn remove_rule(&self, args: &str) -> Result<String, CommandError> {
        let position: usize = args
            .trim()
            .parse()
            .map_err(|_| CommandError::Usage("/unrule <n>".into()))?;
        let removed = GlobalSettings::remove_rule(self.store.as_ref(), position)
            .await?
            .ok_or(CommandError::RuleNotFound(position))?;
        info!(position, "Global rule removed");
        Ok(format!("Rule {position} removed: {}", describe_rule(&removed)))
    }

    async fn log_channel(&self, args: &str) -> Result<String, CommandError> {
        let arg = args.trim();
        if arg.is_empty() {
            let settings = GlobalSettings::load(self.store.as_ref()).await?;
            return Ok(match settings.log_channel {
                Some(c) => format!("Reports go to {c}."),
                None => "Reporting is off.".into(),
            });
        }

        if arg.eq_ignore_ascii_case("off") {
            GlobalSettings::set_log_channel(self.store.as_ref(), None).await?;
            return Ok("Reporting is off.".into());
        }

        let channel = self
            .transport
            .resolve_channel(arg)
            .await
            .map_err(|e| CommandError::Resolve {
                identifier: arg.to_string(),
                reason: e.to_string(),
            })?;
        GlobalSettings::set_log_channel(self.store.as_ref(), Some(arg)).await?;
        Ok(format!("Reports now go to {} ({arg}).", channel.display_name()))
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────

/// Parse `key: value` lines. Keys are case-insensitive; unknown keys and
/// empty values are ignored.
fn parse_template(text: &str, keys: &[&str]) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .filter(|(k, v)| keys.contains(&k.as_str()) && !v.is_empty())
        .collect()
}

fn task_id(args: &str, usage: &str) -> Result<i64, CommandError> {
    let arg = args.trim();
    if arg.is_empty() {
        return Err(CommandError::Usage(usage.to_string()));
    }
    arg.parse()
        .map_err(|_| CommandError::InvalidTaskId(arg.to_string()))
}

fn flag(fields: &HashMap<String, String>, key: &str) -> Result<bool, CommandError> {
    let Some(value) = fields.get(key) else {
        return Ok(false);
    };
    match value.to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" | "on" | "1" => Ok(true),
        "no" | "n" | "false" | "off" | "0" => Ok(false),
        _ => Err(CommandError::InvalidField {
            field: key.to_string(),
            value: value.clone(),
        }),
    }
}

fn pair(
    fields: &HashMap<String, String>,
    find_key: &str,
    replace_key: &str,
    kind: RuleKind,
) -> Result<Option<Rule>, CommandError> {
    match (fields.get(find_key), fields.get(replace_key)) {
        (None, None) => Ok(None),
        (Some(find), Some(replace)) => Ok(Some(
            Rule::new(find.as_str(), blank_to_empty(replace)).with_kind(kind),
        )),
        (Some(_), None) => Err(CommandError::MissingField(replace_key.to_string())),
        (None, Some(_)) => Err(CommandError::MissingField(find_key.to_string())),
    }
}

fn blank_to_empty(value: &str) -> &str {
    if value.trim().eq_ignore_ascii_case(BLANK) {
        ""
    } else {
        value
    }
}

fn describe_rule(rule: &Rule) -> String {
    let replace = if rule.replace.is_empty() {
        "(delete)"
    } else {
        rule.replace.as_str()
    };
    format!("[{}] '{}' -> '{}'", rule.kind, rule.find, replace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::testing::RecordingTransport;
    use crate::pipeline::index::TaskIndex;
    use crate::pipeline::rules::SKIP_MESSAGE;
    use crate::pipeline::types::ChannelRef;
    use crate::store::LibSqlBackend;

    struct Fixture {
        handler: CommandHandler,
        store: Arc<LibSqlBackend>,
        index: Arc<TaskIndex>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let index = Arc::new(TaskIndex::new());
        let transport = Arc::new(
            RecordingTransport::new()
                .with_channel(
                    "@news",
                    ChannelRef::new(-100123).with_username("news").with_title("News"),
                )
                .with_channel(
                    "@mirror",
                    ChannelRef::new(-100456).with_username("mirror").with_title("Mirror"),
                )
                .with_channel("-100999", ChannelRef::new(-100999).with_title("Private"))
                .with_channel("@audit", ChannelRef::new(-100789).with_title("Audit")),
        );
        let tasks = Arc::new(TaskManager::new(store.clone(), index.clone()));
        Fixture {
            handler: CommandHandler::new(tasks, store.clone(), transport),
            store,
            index,
        }
    }

    async fn run(f: &Fixture, text: &str) -> String {
        f.handler.handle(text).await.unwrap()
    }

    #[tokio::test]
    async fn plain_text_is_not_a_command() {
        let f = fixture().await;
        assert!(f.handler.handle("hello").await.is_none());
    }

    #[tokio::test]
    async fn help_lists_commands() {
        let f = fixture().await;
        let reply = run(&f, "/help").await;
        assert!(reply.contains("/add"));
        assert!(reply.contains("/unrule"));
    }

    #[tokio::test]
    async fn unknown_command() {
        let f = fixture().await;
        assert!(run(&f, "/frobnicate").await.starts_with("Error: Usage"));
    }

    #[tokio::test]
    async fn add_with_legacy_template() {
        let f = fixture().await;
        let reply = run(
            &f,
            "/add\nsource: @news\nTarget: @mirror\nfind_user: @old\nreplace_user: @new\nfind_link: t.me/old\nreplace_link: BLANK\nstrip_links: yes",
        )
        .await;
        assert!(reply.starts_with("Task #1 added (live): @news -> @mirror"), "{reply}");

        let task = f.store.get_task(1).await.unwrap().unwrap();
        assert_eq!(task.source_title, "News");
        assert_eq!(task.target_title, "Mirror");
        assert!(task.config.strip_links);
        assert_eq!(
            task.rules,
            vec![
                Rule::new("@old", "@new").with_kind(RuleKind::Mention),
                Rule::new("t.me/old", "").with_kind(RuleKind::Link),
            ]
        );
        assert_eq!(f.index.lookup("@news").len(), 1);
    }

    #[tokio::test]
    async fn add_stores_resolved_identifiers() {
        let f = fixture().await;
        let reply = run(&f, "/add\nsource: https://t.me/news\ntarget: mirror").await;
        assert!(reply.starts_with("Task #1 added (live): @news -> @mirror"), "{reply}");

        let chat = ChannelRef::new(-100123).with_username("news");
        assert_eq!(f.index.candidates(&chat).len(), 1);
    }

    #[tokio::test]
    async fn add_private_source_stores_numeric_id() {
        let f = fixture().await;
        run(&f, "/add\nsource: -100999\ntarget: @mirror").await;
        let task = f.store.get_task(1).await.unwrap().unwrap();
        assert_eq!(task.source_id, "-100999");
        assert_eq!(task.source_title, "Private");
    }

    #[tokio::test]
    async fn add_without_target_is_an_error() {
        let f = fixture().await;
        let reply = run(&f, "/add\nsource: @news").await;
        assert_eq!(reply, "Error: `target` is required.");
        assert!(f.store.list_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_half_pair_is_an_error() {
        let f = fixture().await;
        let reply = run(&f, "/add\nsource: @news\ntarget: @mirror\nfind_user: @old").await;
        assert_eq!(reply, "Error: `replace_user` is required.");
    }

    #[tokio::test]
    async fn add_unreachable_source_warns() {
        let f = fixture().await;
        let reply = run(&f, "/add\nsource: @private\ntarget: @mirror\nmode: history").await;
        assert!(reply.contains("added (history)"));
        assert!(reply.contains("Warning: cannot read @private"));
        let task = f.store.get_task(1).await.unwrap().unwrap();
        assert_eq!(task.source_title, "@private");
    }

    #[tokio::test]
    async fn add_rejects_bad_mode() {
        let f = fixture().await;
        let reply = run(&f, "/add\nsource: @news\ntarget: @mirror\nmode: replay").await;
        assert!(reply.contains("Invalid value for `mode`"));
    }

    #[tokio::test]
    async fn list_delete_pause_resume() {
        let f = fixture().await;
        assert_eq!(run(&f, "/list").await, "No tasks configured.");

        run(&f, "/add\nsource: @news\ntarget: @mirror").await;
        let listing = run(&f, "/list").await;
        assert!(listing.contains("#1 News -> Mirror [live, active]"), "{listing}");

        assert_eq!(run(&f, "/pause 1").await, "Task #1 paused.");
        assert!(f.index.is_empty());
        assert_eq!(run(&f, "/resume 1").await, "Task #1 resumed.");
        assert_eq!(f.index.len(), 1);

        assert_eq!(run(&f, "/del 1").await, "Task #1 deleted.");
        assert_eq!(run(&f, "/del 1").await, "Task #1 did not exist.");
    }

    #[tokio::test]
    async fn task_id_errors() {
        let f = fixture().await;
        assert_eq!(run(&f, "/del").await, "Error: Usage: /del <id>");
        assert_eq!(run(&f, "/del abc").await, "Error: Invalid task ID: abc");
        assert_eq!(run(&f, "/pause 7").await, "Error: Task 7 not found.");
    }

    #[tokio::test]
    async fn global_rule_lifecycle() {
        let f = fixture().await;
        assert_eq!(run(&f, "/rules").await, "No global rules.");

        let reply = run(&f, "/rule\nfind: @bad_user\nreplace: @good_user\nkind: mention").await;
        assert_eq!(reply, "Rule 1 added: [mention] '@bad_user' -> '@good_user'");
        run(&f, "/rule\nfind: promo\nreplace: SKIP_MESSAGE").await;
        run(&f, "/rule\nfind: Click here\nreplace: BLANK").await;

        let listing = run(&f, "/rules").await;
        assert!(listing.contains("3. [text] 'Click here' -> '(delete)'"), "{listing}");

        let settings = GlobalSettings::load(&*f.store).await.unwrap();
        assert_eq!(settings.rules[1].replace, SKIP_MESSAGE);

        assert!(run(&f, "/unrule 2").await.starts_with("Rule 2 removed"));
        assert_eq!(run(&f, "/unrule 9").await, "Error: No global rule at position 9.");
        assert_eq!(GlobalSettings::load(&*f.store).await.unwrap().rules.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_rule_commands_all_land() {
        let f = fixture().await;
        let commands: Vec<String> = (0..8)
            .map(|i| format!("/rule\nfind: word{i}\nreplace: other{i}"))
            .collect();
        futures::future::join_all(commands.iter().map(|c| f.handler.handle(c))).await;

        let rules = GlobalSettings::load(&*f.store).await.unwrap().rules;
        assert_eq!(rules.len(), 8);
    }

    #[tokio::test]
    async fn rule_requires_find_and_replace() {
        let f = fixture().await;
        assert_eq!(run(&f, "/rule\nreplace: x").await, "Error: `find` is required.");
        assert_eq!(run(&f, "/rule\nfind: x").await, "Error: `replace` is required.");
    }

    #[tokio::test]
    async fn log_channel_commands() {
        let f = fixture().await;
        assert_eq!(run(&f, "/log").await, "Reporting is off.");
        assert_eq!(run(&f, "/log @audit").await, "Reports now go to Audit (@audit).");
        assert_eq!(run(&f, "/log").await, "Reports go to @audit.");
        assert!(run(&f, "/log @nowhere").await.starts_with("Error: Could not resolve @nowhere"));
        assert_eq!(run(&f, "/log off").await, "Reporting is off.");
    }

    #[tokio::test]
    async fn bot_suffix_is_accepted() {
        let f = fixture().await;
        assert_eq!(run(&f, "/list@relay_bot").await, "No tasks configured.");
    }

    #[test]
    fn template_parsing() {
        let fields = parse_template("\nSource: @a \nbogus: x\ntarget:\nfind: http://x", ADD_KEYS);
        assert_eq!(fields.get("source").map(String::as_str), Some("@a"));
        assert!(!fields.contains_key("bogus"));
        assert!(!fields.contains_key("target"));
    }
}
