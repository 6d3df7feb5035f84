use std::collections::HashSet;
use std::env;

use snafu::{OptionExt, ResultExt, Snafu};

use strand_storage::{
    ConversationId, ConversationStore, MessageNode, MessageRole, NewConversation,
    ROOT_MESSAGE_ID, SqliteStorage, StorageError,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    IdRoundtrip,
    IdInvalid,
    SchemaInit,
    ConversationCrud,
    BranchAppend,
    DanglingParent,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "id_roundtrip" => Some(Self::IdRoundtrip),
            "id_invalid" => Some(Self::IdInvalid),
            "schema_init" => Some(Self::SchemaInit),
            "conversation_crud" => Some(Self::ConversationCrud),
            "branch_append" => Some(Self::BranchAppend),
            "dangling_parent" => Some(Self::DanglingParent),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::IdRoundtrip => "id_roundtrip",
            Self::IdInvalid => "id_invalid",
            Self::SchemaInit => "schema_init",
            Self::ConversationCrud => "conversation_crud",
            Self::BranchAppend => "branch_append",
            Self::DanglingParent => "dangling_parent",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage validation failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("sqlite query failed: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    match args.scenario {
        Scenario::IdRoundtrip => run_id_roundtrip(),
        Scenario::IdInvalid => run_id_invalid(),
        Scenario::SchemaInit => run_schema_init(require_db_path(&args, "schema_init")?).await,
        Scenario::ConversationCrud => {
            run_conversation_crud(require_db_path(&args, "conversation_crud")?).await
        }
        Scenario::BranchAppend => {
            run_branch_append(require_db_path(&args, "branch_append")?).await
        }
        Scenario::DanglingParent => {
            run_dangling_parent(require_db_path(&args, "dangling_parent")?).await
        }
        Scenario::All => run_all(args.db_path.as_deref()).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
    })
}

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}

fn ensure_scenario(condition: bool, scenario: &'static str, reason: &str) -> RunnerResult<()> {
    if condition {
        return Ok(());
    }

    ScenarioFailedSnafu {
        stage: "scenario-check",
        scenario,
        reason: reason.to_string(),
    }
    .fail()
}

async fn open_storage(db_path: &str, stage: &'static str) -> RunnerResult<SqliteStorage> {
    SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu { stage })
}

fn run_id_roundtrip() -> RunnerResult<()> {
    let id = ConversationId::new_v7();
    let parsed = ConversationId::parse(&id.to_string()).context(StorageValidationSnafu {
        stage: "scenario-id-roundtrip-parse",
    })?;
    ensure_scenario(parsed == id, "id_roundtrip", "conversation id changed on roundtrip")?;
    println!("id_roundtrip=true");
    println!("runner_ok=true");
    Ok(())
}

fn run_id_invalid() -> RunnerResult<()> {
    let rejected = ConversationId::parse("not-a-valid-uuid").is_err();
    println!("invalid_id_error={rejected}");
    ensure_scenario(rejected, "id_invalid", "conversation id accepted malformed input")?;
    println!("runner_ok=true");
    Ok(())
}

async fn run_all(db_path: Option<&str>) -> RunnerResult<()> {
    run_id_roundtrip()?;
    run_id_invalid()?;

    if let Some(path) = db_path {
        run_schema_init(path).await?;
        run_conversation_crud(path).await?;
        run_branch_append(path).await?;
        run_dangling_parent(path).await?;
    }

    println!("all_passed=true");
    Ok(())
}

async fn run_schema_init(db_path: &str) -> RunnerResult<()> {
    let storage = open_storage(db_path, "scenario-schema-init-open").await?;
    let discovered_tables = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('conversations', 'messages')",
    )
    .fetch_all(storage.pool())
    .await
    .context(SqliteQuerySnafu {
        stage: "scenario-schema-init-list-tables",
    })?;

    let available_tables: HashSet<String> = discovered_tables.into_iter().collect();
    let schema_ok = ["conversations", "messages"]
        .iter()
        .all(|table_name| available_tables.contains(*table_name));

    let journal_mode = sqlx::query_scalar::<_, String>("PRAGMA journal_mode;")
        .fetch_one(storage.pool())
        .await
        .context(SqliteQuerySnafu {
            stage: "scenario-schema-init-journal-mode",
        })?
        .to_lowercase();

    println!("schema_ok={schema_ok}");
    println!("journal_mode={journal_mode}");
    ensure_scenario(schema_ok, "schema_init", "conversation tables are missing")?;
    ensure_scenario(journal_mode == "wal", "schema_init", "journal mode is not WAL")?;
    println!("runner_ok=true");
    Ok(())
}

async fn run_conversation_crud(db_path: &str) -> RunnerResult<()> {
    let storage = open_storage(db_path, "scenario-conversation-crud-open").await?;
    let created = storage
        .create_conversation(NewConversation {
            title: "QA conversation".to_string(),
            bot_id: None,
        })
        .context(StorageValidationSnafu {
            stage: "scenario-conversation-crud-create",
        })?;

    let listed = storage.list_conversations().context(StorageValidationSnafu {
        stage: "scenario-conversation-crud-list",
    })?;
    ensure_scenario(
        listed.iter().any(|summary| summary.id == created.id),
        "conversation_crud",
        "created conversation missing from list",
    )?;

    storage
        .delete_conversation(created.id)
        .context(StorageValidationSnafu {
            stage: "scenario-conversation-crud-delete",
        })?;
    let after_delete = storage
        .get_conversation(created.id)
        .context(StorageValidationSnafu {
            stage: "scenario-conversation-crud-get-deleted",
        })?;

    println!("soft_deleted={}", after_delete.is_none());
    ensure_scenario(
        after_delete.is_none(),
        "conversation_crud",
        "deleted conversation is still readable",
    )?;
    println!("runner_ok=true");
    Ok(())
}

async fn run_branch_append(db_path: &str) -> RunnerResult<()> {
    let storage = open_storage(db_path, "scenario-branch-append-open").await?;
    let created = storage
        .create_conversation(NewConversation::default())
        .context(StorageValidationSnafu {
            stage: "scenario-branch-append-create",
        })?;

    for (id, body) in [("u-1", "first draft"), ("u-2", "second draft")] {
        storage
            .append_or_update(
                created.id,
                MessageNode::text(id, MessageRole::User, body).with_parent(ROOT_MESSAGE_ID),
            )
            .context(StorageValidationSnafu {
                stage: "scenario-branch-append-append",
            })?;
    }

    let record = storage
        .get_conversation(created.id)
        .context(StorageValidationSnafu {
            stage: "scenario-branch-append-reload",
        })?
        .context(ScenarioFailedSnafu {
            stage: "scenario-branch-append-missing",
            scenario: "branch_append",
            reason: "conversation disappeared after append".to_string(),
        })?;
    let root_children = record
        .message_map
        .get(ROOT_MESSAGE_ID)
        .map(|root| root.children.clone())
        .unwrap_or_default();

    println!("root_children={}", root_children.join(","));
    println!("last_message_id={}", record.last_message_id);
    ensure_scenario(
        root_children == ["u-1", "u-2"],
        "branch_append",
        "root does not list both branches in append order",
    )?;
    ensure_scenario(
        record.last_message_id == "u-2",
        "branch_append",
        "latest append is not selected",
    )?;
    println!("runner_ok=true");
    Ok(())
}

async fn run_dangling_parent(db_path: &str) -> RunnerResult<()> {
    let storage = open_storage(db_path, "scenario-dangling-parent-open").await?;
    let created = storage
        .create_conversation(NewConversation::default())
        .context(StorageValidationSnafu {
            stage: "scenario-dangling-parent-create",
        })?;

    let record = storage
        .append_or_update(
            created.id,
            MessageNode::text("orphan", MessageRole::User, "parent was purged")
                .with_parent("purged-parent"),
        )
        .context(StorageValidationSnafu {
            stage: "scenario-dangling-parent-append",
        })?;

    let stored = record
        .message_map
        .get("orphan")
        .and_then(|node| node.parent.clone());
    println!("dangling_parent_kept={}", stored.is_some());
    ensure_scenario(
        stored.as_deref() == Some("purged-parent"),
        "dangling_parent",
        "dangling parent link was not stored as-is",
    )?;
    println!("runner_ok=true");
    Ok(())
}
