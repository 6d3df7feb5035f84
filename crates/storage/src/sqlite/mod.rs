use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection, SqlitePool};

use super::ConversationStore;
use super::error::{
    CreateSqliteDirectorySnafu, DecodeColumnSnafu, EncodeColumnSnafu, InMemoryDatabaseSnafu,
    InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, SqliteQuerySnafu, SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu,
    StorageError, StorageResult,
};
use super::ids::ConversationId;
use super::map::MessageMap;
use super::types::{
    ContentBlock, ConversationRecord, ConversationSummary, MessageNode, MessageRole,
    NewConversation, ROOT_MESSAGE_ID, unix_timestamp_seconds,
};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    /// Opens (creating if needed) a file-backed database and runs migrations.
    /// In-memory locations are rejected.
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure!(
            !is_in_memory_location(database_location),
            InMemoryDatabaseSnafu {
                stage: "sqlite-open-location",
                location: database_location,
            }
        );
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite conversation store ready");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Store traits are sync, so each call executes on a dedicated worker thread
        // with its own current-thread runtime to avoid nested-runtime blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl ConversationStore for SqliteStorage {
    fn create_conversation(&self, input: NewConversation) -> StorageResult<ConversationRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-create", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-create-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "conversation-create-begin",
            })?;

            let conversation_id = ConversationId::new_v7();
            let title = input.normalized_title();
            let now = u64_to_i64(unix_timestamp_seconds(), "conversation-create-now")?;

            sqlx::query(
                "INSERT INTO conversations (id, title, bot_id, last_message_id, created_at, updated_at, deleted_at) VALUES (?, ?, ?, ?, ?, ?, NULL)",
            )
            .bind(conversation_id.to_string())
            .bind(title.clone())
            .bind(input.bot_id.clone())
            .bind(ROOT_MESSAGE_ID)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-create-insert",
            })?;

            let root = MessageNode::root();
            write_message_row(&mut tx, conversation_id, &root, now, "conversation-create-root")
                .await?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "conversation-create-commit",
            })?;

            Ok(ConversationRecord {
                id: conversation_id,
                title,
                bot_id: input.bot_id,
                last_message_id: ROOT_MESSAGE_ID.to_string(),
                message_map: MessageMap::with_root(),
                updated_at_unix_seconds: i64_to_u64(now, "conversation-create-updated-at")?,
            })
        })
    }

    fn list_conversations(&self) -> StorageResult<Vec<ConversationSummary>> {
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-list-connect").await?;
            let rows = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, bot_id, last_message_id, updated_at FROM conversations WHERE deleted_at IS NULL ORDER BY updated_at DESC, id DESC",
            )
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            rows.into_iter()
                .map(|row| {
                    Ok(ConversationSummary {
                        id: ConversationId::parse(&row.id)?,
                        title: row.title,
                        bot_id: row.bot_id,
                        updated_at_unix_seconds: i64_to_u64(
                            row.updated_at,
                            "conversation-list-updated-at",
                        )?,
                    })
                })
                .collect()
        })
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<ConversationRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-get", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-get-connect").await?;
            load_conversation(&mut connection, conversation_id).await
        })
    }

    fn append_or_update(
        &self,
        conversation_id: ConversationId,
        node: MessageNode,
    ) -> StorageResult<ConversationRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-append-or-update", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-append-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "message-append-begin",
            })?;

            ensure_conversation_live(&mut tx, conversation_id, "message-append-scope").await?;

            // Reuse the in-memory upsert rules, then write back the two rows it can touch.
            let mut message_map = load_message_map(&mut tx, conversation_id).await?;
            let node_id = node.id.clone();
            let parent_id = node.parent.clone();
            message_map.upsert(node);

            let now = u64_to_i64(unix_timestamp_seconds(), "message-append-now")?;
            let stored = message_map.get(&node_id).context(InvariantViolationSnafu {
                stage: "message-append-upserted-node",
                details: format!("node '{node_id}' missing right after upsert"),
            })?;
            write_message_row(&mut tx, conversation_id, stored, now, "message-append-node")
                .await?;

            if let Some(parent_id) = parent_id.as_deref()
                && parent_id != node_id
                && let Some(parent) = message_map.get(parent_id)
            {
                write_message_row(&mut tx, conversation_id, parent, now, "message-append-parent")
                    .await?;
            }

            sqlx::query("UPDATE conversations SET last_message_id = ?, updated_at = ? WHERE id = ?")
                .bind(node_id.as_str())
                .bind(now)
                .bind(conversation_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-append-update-selection",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-append-commit",
            })?;

            load_conversation(&mut connection, conversation_id)
                .await?
                .context(NotFoundSnafu {
                    stage: "message-append-reload",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                })
        })
    }

    fn set_last_message(
        &self,
        conversation_id: ConversationId,
        message_id: &str,
    ) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let message_id = message_id.to_string();
        self.run_db_call("conversation-set-last-message", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-select-connect").await?;
            let result = sqlx::query(
                "UPDATE conversations SET last_message_id = ? WHERE id = ? AND deleted_at IS NULL",
            )
            .bind(message_id)
            .bind(conversation_id.to_string())
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-select-update",
            })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-select-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            Ok(())
        })
    }

    fn delete_conversation(&self, conversation_id: ConversationId) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-delete-connect").await?;
            let now = u64_to_i64(unix_timestamp_seconds(), "conversation-delete-now")?;
            let result = sqlx::query(
                "UPDATE conversations SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
            )
            .bind(now)
            .bind(now)
            .bind(conversation_id.to_string())
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-delete-update",
            })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-delete-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    bot_id: Option<String>,
    last_message_id: String,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    role: String,
    content_json: String,
    model: Option<String>,
    parent_id: Option<String>,
    children_json: String,
}

fn message_row_to_node(row: MessageRow) -> StorageResult<MessageNode> {
    let content = serde_json::from_str::<Vec<ContentBlock>>(&row.content_json).context(
        DecodeColumnSnafu {
            stage: "message-row-content",
            column: "content_json",
        },
    )?;
    let children = serde_json::from_str::<Vec<String>>(&row.children_json).context(
        DecodeColumnSnafu {
            stage: "message-row-children",
            column: "children_json",
        },
    )?;

    Ok(MessageNode {
        id: row.id,
        role: role_from_sql(&row.role)?,
        content,
        model: row.model,
        parent: row.parent_id,
        children,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

async fn load_conversation(
    connection: &mut SqliteConnection,
    conversation_id: ConversationId,
) -> StorageResult<Option<ConversationRecord>> {
    let row = sqlx::query_as::<_, ConversationRow>(
        "SELECT id, title, bot_id, last_message_id, updated_at FROM conversations WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(conversation_id.to_string())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "conversation-load-query",
    })?;

    let Some(row) = row else {
        return Ok(None);
    };

    let message_map = load_message_map(&mut *connection, conversation_id).await?;

    Ok(Some(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        title: row.title,
        bot_id: row.bot_id,
        last_message_id: row.last_message_id,
        message_map,
        updated_at_unix_seconds: i64_to_u64(row.updated_at, "conversation-load-updated-at")?,
    }))
}

async fn load_message_map(
    connection: &mut SqliteConnection,
    conversation_id: ConversationId,
) -> StorageResult<MessageMap> {
    let rows = sqlx::query_as::<_, MessageRow>(
        "SELECT id, role, content_json, model, parent_id, children_json FROM messages WHERE conversation_id = ? ORDER BY id ASC",
    )
    .bind(conversation_id.to_string())
    .fetch_all(&mut *connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "message-map-load-query",
    })?;

    rows.into_iter().map(message_row_to_node).collect()
}

async fn ensure_conversation_live(
    connection: &mut SqliteConnection,
    conversation_id: ConversationId,
    stage: &'static str,
) -> StorageResult<()> {
    let existing = sqlx::query_scalar::<_, i64>(
        "SELECT 1 FROM conversations WHERE id = ? AND deleted_at IS NULL LIMIT 1",
    )
    .bind(conversation_id.to_string())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })?;

    if existing.is_none() {
        return NotFoundSnafu {
            stage,
            entity: "conversation",
            id: conversation_id.to_string(),
        }
        .fail();
    }

    Ok(())
}

async fn write_message_row(
    connection: &mut SqliteConnection,
    conversation_id: ConversationId,
    node: &MessageNode,
    now: i64,
    stage: &'static str,
) -> StorageResult<()> {
    let content_json = serde_json::to_string(&node.content).context(EncodeColumnSnafu {
        stage,
        column: "content_json",
    })?;
    let children_json = serde_json::to_string(&node.children).context(EncodeColumnSnafu {
        stage,
        column: "children_json",
    })?;

    sqlx::query(
        "INSERT INTO messages (conversation_id, id, role, content_json, model, parent_id, children_json, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (conversation_id, id) DO UPDATE SET role = excluded.role, content_json = excluded.content_json, model = excluded.model, parent_id = excluded.parent_id, children_json = excluded.children_json, updated_at = excluded.updated_at",
    )
    .bind(conversation_id.to_string())
    .bind(node.id.as_str())
    .bind(node.role.as_str())
    .bind(content_json)
    .bind(node.model.as_deref())
    .bind(node.parent.as_deref())
    .bind(children_json)
    .bind(now)
    .bind(now)
    .execute(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })?;

    Ok(())
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "system" => Ok(MessageRole::System),
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn is_in_memory_location(database_location: &str) -> bool {
    let location = database_location.trim();
    location == ":memory:"
        || location == "sqlite::memory:"
        || location.starts_with("sqlite::memory:?")
        || location.contains("mode=memory")
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    format!("sqlite://{database_location}")
}
