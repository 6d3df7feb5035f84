use std::fmt::Write as _;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use snafu::ResultExt;
use strand_core::DisplayMessage;
use strand_llm::{ChatStreamClient, StreamMessages};
use strand_storage::{ConversationId, ConversationStore, MemoryStorage, SqliteStorage};

use crate::chat::{ChatSession, SendOptions, SendOutcome};
use crate::error::{AppResult, RuntimeInitSnafu, SettingsSnafu, StorageSnafu};
use crate::settings::{SettingsStore, StrandSettings};

#[derive(Parser, Debug)]
#[command(
    name = "strand",
    version,
    about = "Branching chat client for a chunked WebSocket completion endpoint"
)]
pub struct Cli {
    /// Path to the settings file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Keep conversations in memory for this run only
    #[arg(long, global = true)]
    pub ephemeral: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create a conversation and print its id
    New {
        #[arg(long)]
        title: Option<String>,
        /// Bot the conversation talks to
        #[arg(long)]
        bot: Option<String>,
    },
    /// List conversations, most recent first
    List,
    /// Print the selected path of a conversation
    Show {
        id: String,
        /// Message to select instead of the stored selection
        #[arg(long)]
        select: Option<String>,
    },
    /// Send a prompt and stream the reply
    Send {
        id: String,
        text: String,
        /// Message to reply under (defaults to the end of the selected path)
        #[arg(long)]
        parent: Option<String>,
        /// The bot retrieves knowledge before answering
        #[arg(long)]
        knowledge: bool,
        /// Show the agent thinking indicator
        #[arg(long)]
        agent: bool,
    },
    /// Stream a new reply to a user turn, resending an unanswered one
    Regenerate {
        id: String,
        /// User turn or assistant reply to regenerate (defaults to the end of the shown path)
        #[arg(long)]
        message: Option<String>,
        #[arg(long)]
        agent: bool,
    },
    /// Switch to a sibling branch at a display index
    Branch {
        id: String,
        index: usize,
        #[arg(allow_hyphen_values = true)]
        offset: isize,
    },
    /// Inspect or write the settings file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAction {
    /// Print the effective settings
    Show,
    /// Write the effective settings to the settings file
    Init,
}

pub fn run(cli: Cli) -> AppResult<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(SettingsStore::default_config_path);
    let settings_store = SettingsStore::new(config_path);

    if let Command::Config { action } = cli.command {
        return run_config(&settings_store, action);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context(RuntimeInitSnafu {
            stage: "cli-build-runtime",
        })?;
    runtime.block_on(run_chat(cli, settings_store.settings()))
}

fn run_config(store: &SettingsStore, action: ConfigAction) -> AppResult<()> {
    let settings = store.settings();
    match action {
        ConfigAction::Show => {
            println!("# {}", store.config_path().display());
            println!("{}", render_settings(&settings));
        }
        ConfigAction::Init => {
            store
                .update(settings.as_ref().clone())
                .context(SettingsSnafu {
                    stage: "cli-config-init",
                })?;
            println!("{}", store.config_path().display());
        }
    }
    Ok(())
}

async fn run_chat(cli: Cli, settings: Arc<StrandSettings>) -> AppResult<()> {
    let store: Arc<dyn ConversationStore> = if cli.ephemeral {
        Arc::new(MemoryStorage::new())
    } else {
        Arc::new(
            SqliteStorage::open(&settings.database_path)
                .await
                .context(StorageSnafu {
                    stage: "cli-open-store",
                })?,
        )
    };

    if !settings.has_token() {
        tracing::warn!("no token configured; set STRAND_TOKEN or run `strand config init`");
    }

    let client = ChatStreamClient::websocket(settings.endpoint.clone(), settings.stream_config());
    let chat = ChatSession::new(store, client, settings.default_model.clone());
    let messages = settings.stream_messages();

    match cli.command {
        Command::New { title, bot } => {
            let record = chat.create_conversation(title, bot)?;
            println!("{}", record.id);
        }
        Command::List => {
            for summary in chat.list_conversations()? {
                println!(
                    "{}\t{}\t{}",
                    summary.id, summary.updated_at_unix_seconds, summary.title
                );
            }
        }
        Command::Show { id, select } => {
            let path = chat.display(parse_id(&id)?, select.as_deref())?;
            print!("{}", render_path(&path));
        }
        Command::Send {
            id,
            text,
            parent,
            knowledge,
            agent,
        } => {
            let options = SendOptions {
                parent,
                needs_knowledge: knowledge,
                agent,
            };
            let conversation_id = parse_id(&id)?;
            let indicator = agent.then(|| spawn_thinking_indicator(&chat));
            let mut printer = PartialPrinter::new(&messages);
            let outcome = chat
                .send(conversation_id, &text, options, |text| printer.show(text))
                .await;
            if let Some(indicator) = indicator {
                indicator.abort();
            }
            finish_reply(outcome, &messages)?;
        }
        Command::Regenerate { id, message, agent } => {
            let conversation_id = parse_id(&id)?;
            let indicator = agent.then(|| spawn_thinking_indicator(&chat));
            let mut printer = PartialPrinter::new(&messages);
            let outcome = chat
                .regenerate(conversation_id, message.as_deref(), agent, |text| {
                    printer.show(text)
                })
                .await;
            if let Some(indicator) = indicator {
                indicator.abort();
            }
            finish_reply(outcome, &messages)?;
        }
        Command::Branch { id, index, offset } => {
            let path = chat.switch_branch(parse_id(&id)?, index, offset)?;
            print!("{}", render_path(&path));
        }
        Command::Config { .. } => {}
    }

    Ok(())
}

fn parse_id(raw: &str) -> AppResult<ConversationId> {
    ConversationId::parse(raw).context(StorageSnafu {
        stage: "cli-parse-conversation-id",
    })
}

fn finish_reply(outcome: AppResult<SendOutcome>, messages: &StreamMessages) -> AppResult<()> {
    println!();
    match outcome {
        Ok(outcome) => {
            tracing::debug!(
                user_message_id = %outcome.user_message_id,
                assistant_message_id = %outcome.assistant_message_id,
                "reply stored"
            );
            Ok(())
        }
        Err(error) => {
            if let Some(stream_error) = error.stream_error() {
                eprintln!("{}", messages.describe(stream_error));
            }
            Err(error)
        }
    }
}

fn spawn_thinking_indicator(chat: &ChatSession) -> tokio::task::JoinHandle<()> {
    let mut updates = chat.thinking().subscribe();
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let state = *updates.borrow_and_update();
            if state.is_active() {
                eprintln!("[thinking {:>3.0}%]", state.progress() * 100.0);
            }
        }
    })
}

/// Prints streamed text incrementally. Partials carry the full text so far,
/// so only the unseen suffix is written; placeholders are skipped.
struct PartialPrinter<'a> {
    messages: &'a StreamMessages,
    shown: String,
}

impl<'a> PartialPrinter<'a> {
    fn new(messages: &'a StreamMessages) -> Self {
        Self {
            messages,
            shown: String::new(),
        }
    }

    fn show(&mut self, text: &str) {
        if let Some(delta) = self.advance(text) {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
    }

    fn advance(&mut self, text: &str) -> Option<String> {
        if text == self.messages.retrieving_knowledge {
            return None;
        }
        let text = text
            .strip_suffix(self.messages.waiting_glyph.as_str())
            .unwrap_or(text);
        let delta = text.strip_prefix(self.shown.as_str())?;
        if delta.is_empty() {
            return None;
        }
        let delta = delta.to_string();
        self.shown.push_str(&delta);
        Some(delta)
    }
}

pub fn render_path(messages: &[DisplayMessage]) -> String {
    let mut output = String::new();
    for (index, message) in messages.iter().enumerate() {
        let branch = match message.branch_position() {
            Some((position, count)) if count > 1 => format!(" ({position}/{count})"),
            _ => String::new(),
        };
        let _ = writeln!(
            output,
            "[{index}] {role}{branch} {id}",
            role = message.role().as_str(),
            id = message.id()
        );
        for line in message.node.text_content().lines() {
            let _ = writeln!(output, "    {line}");
        }
    }
    output
}

fn render_settings(settings: &StrandSettings) -> String {
    let mut redacted = settings.clone();
    if redacted.has_token() {
        redacted.token = "********".to_string();
    }
    serde_json::to_string_pretty(&redacted).unwrap_or_else(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use strand_core::linearize;
    use strand_storage::{MessageMap, MessageNode, MessageRole};

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_branch_with_negative_offset() {
        let cli = Cli::try_parse_from(["strand", "--ephemeral", "branch", "abc", "2", "-1"])
            .expect("parse");
        assert!(cli.ephemeral);
        match cli.command {
            Command::Branch { id, index, offset } => {
                assert_eq!(id, "abc");
                assert_eq!(index, 2);
                assert_eq!(offset, -1);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn partial_printer_emits_only_new_text() {
        let messages = StreamMessages::default();
        let mut printer = PartialPrinter::new(&messages);

        assert_eq!(printer.advance("Retrieving knowledge..."), None);
        assert_eq!(printer.advance("▍"), None);
        assert_eq!(printer.advance("Hel▍").as_deref(), Some("Hel"));
        assert_eq!(printer.advance("Hello▍").as_deref(), Some("lo"));
        assert_eq!(printer.advance("Hello"), None);
    }

    #[test]
    fn render_marks_branch_points() {
        let map: MessageMap = [
            MessageNode::root().with_children(["q"]),
            MessageNode::text("q", MessageRole::User, "question")
                .with_parent("system")
                .with_children(["a1", "a2"]),
            MessageNode::text("a1", MessageRole::Assistant, "one").with_parent("q"),
            MessageNode::text("a2", MessageRole::Assistant, "two\nlines").with_parent("q"),
        ]
        .into_iter()
        .collect();

        let rendered = render_path(&linearize(&map, "a2"));

        assert_eq!(
            rendered,
            "[0] user q\n    question\n[1] assistant (2/2) a2\n    two\n    lines\n"
        );
    }
}
