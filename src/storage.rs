use crate::models::{ChatMetadata, Conversation, Message, Provider, ProviderConfig, Role};
use anyhow::Context;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Highest schema version this build knows how to produce.
pub const SCHEMA_VERSION: i64 = 3;

// Conversations and messages
const MIGRATION_V1: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    user_id TEXT NOT NULL,
    app_scope TEXT NOT NULL,
    title TEXT NOT NULL,
    created_at INTEGER NOT NULL, -- Unix Timestamp (millis)
    last_updated_at INTEGER NOT NULL, -- Unix Timestamp (millis)
    summary TEXT,
    keywords TEXT -- JSON array of strings
);
CREATE INDEX IF NOT EXISTS idx_conversations_user_app ON conversations(user_id, app_scope);
CREATE INDEX IF NOT EXISTS idx_conversations_timestamp ON conversations(last_updated_at);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    conversation_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    app_scope TEXT NOT NULL,
    role TEXT NOT NULL, -- 'user' or 'assistant'
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL, -- Unix Timestamp (millis)
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_id ON messages(conversation_id);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
";

// One provider configuration per user
const MIGRATION_V2: &str = "
CREATE TABLE IF NOT EXISTS provider_configs (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    user_id TEXT NOT NULL,
    provider TEXT, -- e.g. 'openrouter', or NULL when none selected
    api_key TEXT,
    base_url TEXT,
    updated_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_provider_configs_user_id ON provider_configs(user_id);
";

// Last-known credentials per (user, provider), consulted on provider switch
const MIGRATION_V3: &str = "
CREATE TABLE IF NOT EXISTS provider_credentials (
    user_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    api_key TEXT,
    base_url TEXT,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, provider)
);
";

const MIGRATIONS: &[(i64, &str)] = &[
    (1, MIGRATION_V1),
    (2, MIGRATION_V2),
    (3, MIGRATION_V3),
];

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    user_id: String,
    app_scope: String,
    title: String,
    created_at: i64,
    last_updated_at: i64,
    summary: Option<String>,
    keywords: Option<Json<Vec<String>>>,
}

impl ConversationRow {
    fn into_conversation(self) -> anyhow::Result<Conversation> {
        let metadata = match (self.summary, self.keywords) {
            (None, None) => None,
            (summary, keywords) => Some(ChatMetadata {
                summary: summary.unwrap_or_default(),
                keywords: keywords.map(|k| k.0).unwrap_or_default(),
            }),
        };
        Ok(Conversation {
            id: Uuid::parse_str(&self.id).context("Failed to parse conversation ID")?,
            user_id: self.user_id,
            app_scope: self.app_scope,
            title: self.title,
            created_at: from_millis(self.created_at).context("Invalid created_at timestamp")?,
            last_updated_at: from_millis(self.last_updated_at)
                .context("Invalid last_updated_at timestamp")?,
            metadata,
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    user_id: String,
    app_scope: String,
    role: String,
    content: String,
    timestamp: i64,
}

impl MessageRow {
    fn into_message(self) -> anyhow::Result<Message> {
        Ok(Message {
            id: Uuid::parse_str(&self.id).context("Failed to parse message ID")?,
            conversation_id: Uuid::parse_str(&self.conversation_id)
                .context("Failed to parse conversation ID for message")?,
            user_id: self.user_id,
            app_scope: self.app_scope,
            role: self.role.parse()?,
            content: self.content,
            timestamp: from_millis(self.timestamp).context("Invalid message timestamp")?,
        })
    }
}

#[derive(Debug, FromRow)]
struct ProviderConfigRow {
    id: String,
    user_id: String,
    provider: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    updated_at: i64,
}

impl ProviderConfigRow {
    fn into_config(self) -> anyhow::Result<ProviderConfig> {
        Ok(ProviderConfig {
            id: Uuid::parse_str(&self.id).context("Failed to parse provider config ID")?,
            user_id: self.user_id,
            provider: self
                .provider
                .as_deref()
                .map(Provider::from_str)
                .transpose()?,
            api_key: self.api_key,
            base_url: self.base_url,
            updated_at: from_millis(self.updated_at).context("Invalid updated_at timestamp")?,
        })
    }
}

#[derive(Debug, FromRow)]
struct RetainedCredentialRow {
    api_key: Option<String>,
    base_url: Option<String>,
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, user_id, app_scope, role, content, timestamp";
const CONVERSATION_COLUMNS: &str =
    "id, user_id, app_scope, title, created_at, last_updated_at, summary, keywords";
const PROVIDER_CONFIG_COLUMNS: &str = "id, user_id, provider, api_key, base_url, updated_at";

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

// Stored precision is milliseconds; hand back exactly what a re-read would return.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

#[derive(Debug, Clone)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Opens (creating if needed) the database at `db_path` and runs migrations.
    pub async fn open(db_path: &Path) -> Result<Self, anyhow::Error> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        log::info!("Connecting to database: {}", db_path.display());
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        let storage = Self { pool };
        log::info!("Database ready (schema v{})", storage.schema_version().await?);
        Ok(storage)
    }

    /// Private in-memory database. Everything goes through a single pinned
    /// connection, otherwise each pooled connection would see its own database.
    pub async fn open_in_memory() -> Result<Self, anyhow::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory database URL")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Applies every migration newer than the stored `user_version`, in one transaction.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        let mut tx = pool.begin().await.context("Failed to begin migration transaction")?;

        let current: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&mut *tx)
            .await
            .context("Failed to read schema version")?;

        if current > SCHEMA_VERSION {
            return Err(anyhow::anyhow!(
                "Database schema version {} is newer than this build supports ({})",
                current,
                SCHEMA_VERSION
            ));
        }
        if current == SCHEMA_VERSION {
            log::debug!("Database schema is current (v{})", current);
            return Ok(());
        }

        log::info!("Running database migrations from v{} to v{}...", current, SCHEMA_VERSION);
        for (version, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            sqlx::query(*sql)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to apply migration v{}", version))?;
            let pragma = format!("PRAGMA user_version = {}", version);
            sqlx::query(&pragma)
                .execute(&mut *tx)
                .await
                .context("Failed to update schema version")?;
            log::info!("Applied migration v{}", version);
        }

        tx.commit().await.context("Failed to commit migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }

    pub async fn schema_version(&self) -> Result<i64, anyhow::Error> {
        sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await
            .context("Failed to read schema version")
    }

    // --- Conversations ---

    /// Conversations owned by `user_id` under `app_scope`, most recently touched first.
    pub async fn list_conversations(
        &self,
        user_id: &str,
        app_scope: &str,
    ) -> Result<Vec<Conversation>, anyhow::Error> {
        log::debug!("Fetching conversations for user {} in scope {}", user_id, app_scope);
        let sql = format!(
            "SELECT {} FROM conversations WHERE user_id = ? AND app_scope = ?
             ORDER BY last_updated_at DESC, rowid DESC",
            CONVERSATION_COLUMNS
        );
        let rows = sqlx::query_as::<_, ConversationRow>(&sql)
            .bind(user_id)
            .bind(app_scope)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch conversations from database")?;

        let conversations = rows
            .into_iter()
            .map(ConversationRow::into_conversation)
            .collect::<Result<Vec<_>, _>>()?;

        log::info!("Fetched {} conversations", conversations.len());
        Ok(conversations)
    }

    pub async fn get_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Conversation>, anyhow::Error> {
        log::debug!("Fetching conversation with ID: {}", conversation_id);
        let sql = format!("SELECT {} FROM conversations WHERE id = ?", CONVERSATION_COLUMNS);
        sqlx::query_as::<_, ConversationRow>(&sql)
            .bind(conversation_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch conversation from database")?
            .map(ConversationRow::into_conversation)
            .transpose()
    }

    pub async fn create_conversation(
        &self,
        user_id: &str,
        app_scope: &str,
        title: &str,
    ) -> Result<Conversation, anyhow::Error> {
        log::info!("Creating new conversation for user {} in scope {}", user_id, app_scope);
        let created_at = now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            app_scope: app_scope.to_string(),
            title: title.to_string(),
            created_at,
            last_updated_at: created_at,
            metadata: None,
        };

        sqlx::query(
            r#"
            INSERT INTO conversations (id, user_id, app_scope, title, created_at, last_updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(conversation.id.to_string())
        .bind(&conversation.user_id)
        .bind(&conversation.app_scope)
        .bind(&conversation.title)
        .bind(created_at.timestamp_millis())
        .bind(created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert new conversation into database")?;

        log::info!("Successfully created conversation with ID: {}", conversation.id);
        Ok(conversation)
    }

    /// Replaces the title only. Missing conversations are ignored.
    pub async fn rename_conversation(
        &self,
        conversation_id: Uuid,
        new_title: &str,
    ) -> Result<(), anyhow::Error> {
        log::info!("Renaming conversation {} to: {}", conversation_id, new_title);
        let result = sqlx::query("UPDATE conversations SET title = ? WHERE id = ?")
            .bind(new_title)
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update conversation title in database")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to rename non-existent conversation: {}", conversation_id);
        }
        Ok(())
    }

    /// Overwrites summary and keywords wholesale. Missing conversations are ignored.
    pub async fn set_conversation_metadata(
        &self,
        conversation_id: Uuid,
        metadata: &ChatMetadata,
    ) -> Result<(), anyhow::Error> {
        log::debug!("Setting metadata for conversation {}", conversation_id);
        let result =
            sqlx::query("UPDATE conversations SET summary = ?, keywords = ? WHERE id = ?")
                .bind(&metadata.summary)
                .bind(Json(&metadata.keywords))
                .bind(conversation_id.to_string())
                .execute(&self.pool)
                .await
                .context("Failed to update conversation metadata in database")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to set metadata on non-existent conversation: {}", conversation_id);
        }
        Ok(())
    }

    /// Deletes a conversation and all of its messages in one transaction.
    pub async fn delete_conversation(&self, conversation_id: Uuid) -> Result<(), anyhow::Error> {
        let id_text = conversation_id.to_string();
        log::warn!("Deleting conversation with ID: {}", id_text);

        let mut tx = self.pool.begin().await.context("Failed to begin delete transaction")?;

        let messages = sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(&id_text)
            .execute(&mut *tx)
            .await
            .context("Failed to delete conversation messages")?;

        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(&id_text)
            .execute(&mut *tx)
            .await
            .context("Failed to delete conversation from database")?;

        tx.commit().await.context("Failed to commit conversation delete")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to delete non-existent conversation: {}", conversation_id);
        }
        log::info!(
            "Deleted conversation {} and {} messages",
            conversation_id,
            messages.rows_affected()
        );
        Ok(())
    }

    // --- Messages ---

    /// All messages of a conversation, oldest first. Equal timestamps keep insertion order.
    pub async fn get_conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<Message>, anyhow::Error> {
        log::debug!("Fetching messages for conversation ID: {}", conversation_id);
        let sql = format!(
            "SELECT {} FROM messages WHERE conversation_id = ? ORDER BY timestamp ASC, rowid ASC",
            MESSAGE_COLUMNS
        );
        let messages = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(conversation_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch messages from database")?
            .into_iter()
            .map(MessageRow::into_message)
            .collect::<Result<Vec<_>, _>>()?;

        log::info!("Fetched {} messages for conversation {}", messages.len(), conversation_id);
        Ok(messages)
    }

    pub async fn latest_message(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Message>, anyhow::Error> {
        let sql = format!(
            "SELECT {} FROM messages WHERE conversation_id = ?
             ORDER BY timestamp DESC, rowid DESC LIMIT 1",
            MESSAGE_COLUMNS
        );
        sqlx::query_as::<_, MessageRow>(&sql)
            .bind(conversation_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch latest message")?
            .map(MessageRow::into_message)
            .transpose()
    }

    /// Stores a new message and touches the owning conversation.
    pub async fn append_message(
        &self,
        conversation_id: Uuid,
        user_id: &str,
        app_scope: &str,
        content: &str,
        role: Role,
    ) -> Result<Message, anyhow::Error> {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            user_id: user_id.to_string(),
            app_scope: app_scope.to_string(),
            role,
            content: content.to_string(),
            timestamp: now(),
        };
        log::debug!("Saving message ID: {} to conversation: {}", message.id, conversation_id);

        let mut tx = self.pool.begin().await.context("Failed to begin message transaction")?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, user_id, app_scope, role, content, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.id.to_string())
        .bind(conversation_id.to_string())
        .bind(&message.user_id)
        .bind(&message.app_scope)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.timestamp.timestamp_millis())
        .execute(&mut *tx)
        .await
        .context("Failed to insert message into database")?;

        // Also update the conversation's last_updated_at timestamp
        sqlx::query("UPDATE conversations SET last_updated_at = ? WHERE id = ?")
            .bind(message.timestamp.timestamp_millis())
            .bind(conversation_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to update conversation last_updated_at timestamp")?;

        tx.commit().await.context("Failed to commit message")?;

        log::info!("Successfully saved message ID: {}", message.id);
        Ok(message)
    }

    /// Replaces a message's content and advances its timestamp, never behind any other
    /// message of the same conversation. Returns the updated record, or `None` if absent.
    pub async fn update_message_content(
        &self,
        message_id: Uuid,
        new_content: &str,
    ) -> Result<Option<Message>, anyhow::Error> {
        log::debug!("Updating content of message {}", message_id);
        let mut tx = self.pool.begin().await.context("Failed to begin update transaction")?;

        let result = sqlx::query(
            r#"
            UPDATE messages
            SET content = ?,
                timestamp = MAX(?, (SELECT MAX(m.timestamp) FROM messages m
                                    WHERE m.conversation_id = messages.conversation_id))
            WHERE id = ?
            "#,
        )
        .bind(new_content)
        .bind(now().timestamp_millis())
        .bind(message_id.to_string())
        .execute(&mut *tx)
        .await
        .context("Failed to update message content")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to update non-existent message: {}", message_id);
            return Ok(None);
        }

        let updated = fetch_message(&mut tx, message_id).await?;
        if let Some(message) = &updated {
            sqlx::query("UPDATE conversations SET last_updated_at = ? WHERE id = ?")
                .bind(message.timestamp.timestamp_millis())
                .bind(message.conversation_id.to_string())
                .execute(&mut *tx)
                .await
                .context("Failed to update conversation last_updated_at timestamp")?;
        }

        tx.commit().await.context("Failed to commit message update")?;
        Ok(updated)
    }

    // --- Provider configuration ---

    pub async fn get_provider_config(
        &self,
        user_id: &str,
    ) -> Result<Option<ProviderConfig>, anyhow::Error> {
        log::debug!("Fetching provider config for user {}", user_id);
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        fetch_provider_config(&mut conn, user_id).await
    }

    /// Creates the user's record on first call, otherwise updates it in place (same id).
    /// The credential is also retained for the selected provider.
    pub async fn save_provider_config(
        &self,
        user_id: &str,
        provider: Option<Provider>,
        api_key: Option<String>,
        base_url: Option<String>,
    ) -> Result<ProviderConfig, anyhow::Error> {
        log::info!(
            "Saving provider config for user {} (provider: {})",
            user_id,
            provider.map(Provider::as_str).unwrap_or("none")
        );
        let mut tx = self.pool.begin().await.context("Failed to begin provider transaction")?;

        let config =
            upsert_provider_config(&mut tx, user_id, provider, api_key, base_url).await?;
        if let Some(provider) = provider {
            retain_credentials(&mut tx, &config, provider).await?;
        }

        tx.commit().await.context("Failed to commit provider config")?;
        Ok(config)
    }

    /// Selects `provider`, restoring whatever credential was last saved for it, or
    /// clearing the credential when it has never been configured.
    pub async fn switch_provider(
        &self,
        user_id: &str,
        provider: Option<Provider>,
    ) -> Result<ProviderConfig, anyhow::Error> {
        let mut tx = self.pool.begin().await.context("Failed to begin provider transaction")?;

        if let Some(existing) = fetch_provider_config(&mut tx, user_id).await? {
            if existing.provider == provider {
                log::debug!("Provider for user {} unchanged", user_id);
                return Ok(existing);
            }
        }

        let retained = match provider {
            Some(p) => sqlx::query_as::<_, RetainedCredentialRow>(
                "SELECT api_key, base_url FROM provider_credentials WHERE user_id = ? AND provider = ?",
            )
            .bind(user_id)
            .bind(p.as_str())
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to fetch retained provider credentials")?,
            None => None,
        };

        log::info!(
            "Switching user {} to provider {} ({} retained credentials)",
            user_id,
            provider.map(Provider::as_str).unwrap_or("none"),
            if retained.is_some() { "restoring" } else { "no" }
        );
        let (api_key, base_url) = retained
            .map(|row| (row.api_key, row.base_url))
            .unwrap_or((None, None));
        let config = upsert_provider_config(&mut tx, user_id, provider, api_key, base_url).await?;

        tx.commit().await.context("Failed to commit provider switch")?;
        Ok(config)
    }

    /// Zeroes credential and endpoint, keeping the record's id and provider selection.
    pub async fn clear_provider_credential(&self, user_id: &str) -> Result<(), anyhow::Error> {
        let mut tx = self.pool.begin().await.context("Failed to begin provider transaction")?;

        let Some(existing) = fetch_provider_config(&mut tx, user_id).await? else {
            log::debug!("No provider config for user {}, nothing to clear", user_id);
            return Ok(());
        };
        log::warn!("Clearing provider credentials for user {}", user_id);

        sqlx::query(
            "UPDATE provider_configs SET api_key = NULL, base_url = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(now().timestamp_millis())
        .bind(existing.id.to_string())
        .execute(&mut *tx)
        .await
        .context("Failed to clear provider credentials")?;

        if let Some(provider) = existing.provider {
            sqlx::query("DELETE FROM provider_credentials WHERE user_id = ? AND provider = ?")
                .bind(user_id)
                .bind(provider.as_str())
                .execute(&mut *tx)
                .await
                .context("Failed to drop retained provider credentials")?;
        }

        tx.commit().await.context("Failed to commit credential clear")?;
        Ok(())
    }

    #[cfg(test)]
    fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn fetch_message(
    conn: &mut SqliteConnection,
    message_id: Uuid,
) -> Result<Option<Message>, anyhow::Error> {
    let sql = format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS);
    sqlx::query_as::<_, MessageRow>(&sql)
        .bind(message_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch message")?
        .map(MessageRow::into_message)
        .transpose()
}

async fn fetch_provider_config(
    conn: &mut SqliteConnection,
    user_id: &str,
) -> Result<Option<ProviderConfig>, anyhow::Error> {
    let sql = format!(
        "SELECT {} FROM provider_configs WHERE user_id = ?",
        PROVIDER_CONFIG_COLUMNS
    );
    sqlx::query_as::<_, ProviderConfigRow>(&sql)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch provider config")?
        .map(ProviderConfigRow::into_config)
        .transpose()
}

async fn upsert_provider_config(
    conn: &mut SqliteConnection,
    user_id: &str,
    provider: Option<Provider>,
    api_key: Option<String>,
    base_url: Option<String>,
) -> Result<ProviderConfig, anyhow::Error> {
    let existing = fetch_provider_config(conn, user_id).await?;
    let config = ProviderConfig {
        id: existing.map(|c| c.id).unwrap_or_else(Uuid::new_v4),
        user_id: user_id.to_string(),
        provider,
        api_key,
        base_url,
        updated_at: now(),
    };

    sqlx::query(
        r#"
        INSERT INTO provider_configs (id, user_id, provider, api_key, base_url, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET
            provider = excluded.provider,
            api_key = excluded.api_key,
            base_url = excluded.base_url,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(config.id.to_string())
    .bind(&config.user_id)
    .bind(config.provider.map(Provider::as_str))
    .bind(&config.api_key)
    .bind(&config.base_url)
    .bind(config.updated_at.timestamp_millis())
    .execute(&mut *conn)
    .await
    .context("Failed to write provider config")?;

    Ok(config)
}

async fn retain_credentials(
    conn: &mut SqliteConnection,
    config: &ProviderConfig,
    provider: Provider,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        INSERT INTO provider_credentials (user_id, provider, api_key, base_url, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(user_id, provider) DO UPDATE SET
            api_key = excluded.api_key,
            base_url = excluded.base_url,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&config.user_id)
    .bind(provider.as_str())
    .bind(&config.api_key)
    .bind(&config.base_url)
    .bind(config.updated_at.timestamp_millis())
    .execute(&mut *conn)
    .await
    .context("Failed to retain provider credentials")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> StorageManager {
        StorageManager::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn messages_come_back_in_conversation_order() {
        let storage = store().await;
        let c1 = storage.create_conversation("u1", "neural_text", "c1").await.unwrap();

        storage
            .append_message(c1.id, "u1", "neural_text", "Hello", Role::User)
            .await
            .unwrap();
        storage
            .append_message(c1.id, "u1", "neural_text", "Hi there", Role::Assistant)
            .await
            .unwrap();

        let messages = storage.get_conversation_messages(c1.id).await.unwrap();
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["Hello", "Hi there"]);
        assert!(messages[0].is_user());
        assert!(!messages[1].is_user());
    }

    #[tokio::test]
    async fn equal_timestamps_fall_back_to_insertion_order() {
        let storage = store().await;
        let conv = storage.create_conversation("u1", "neural_text", "burst").await.unwrap();

        for i in 0..20 {
            storage
                .append_message(conv.id, "u1", "neural_text", &i.to_string(), Role::User)
                .await
                .unwrap();
        }

        let messages = storage.get_conversation_messages(conv.id).await.unwrap();
        let contents: Vec<String> = messages.iter().map(|m| m.content.clone()).collect();
        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(contents, expected);
        assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let latest = storage.latest_message(conv.id).await.unwrap().unwrap();
        assert_eq!(latest.content, "19");
    }

    #[tokio::test]
    async fn delete_cascades_to_messages_only_of_that_conversation() {
        let storage = store().await;
        let doomed = storage.create_conversation("u1", "neural_text", "doomed").await.unwrap();
        let kept = storage.create_conversation("u1", "neural_text", "kept").await.unwrap();
        for text in ["a", "b", "c"] {
            storage
                .append_message(doomed.id, "u1", "neural_text", text, Role::User)
                .await
                .unwrap();
        }
        let survivor = storage
            .append_message(kept.id, "u1", "neural_text", "stay", Role::User)
            .await
            .unwrap();

        storage.delete_conversation(doomed.id).await.unwrap();

        assert!(storage.get_conversation(doomed.id).await.unwrap().is_none());
        assert!(storage.get_conversation_messages(doomed.id).await.unwrap().is_empty());
        let orphans: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
                .bind(doomed.id.to_string())
                .fetch_one(storage.pool())
                .await
                .unwrap();
        assert_eq!(orphans, 0);
        assert_eq!(
            storage.get_conversation_messages(kept.id).await.unwrap(),
            vec![survivor]
        );

        // Deleting again is harmless.
        storage.delete_conversation(doomed.id).await.unwrap();
    }

    #[tokio::test]
    async fn conversations_are_scoped_by_user_and_app() {
        let storage = store().await;
        let mine = storage.create_conversation("u1", "neural_text", "mine").await.unwrap();
        storage.create_conversation("u2", "neural_text", "theirs").await.unwrap();
        storage.create_conversation("u1", "image_gen", "other tool").await.unwrap();

        let listed = storage.list_conversations("u1", "neural_text").await.unwrap();
        assert_eq!(listed, vec![mine]);
    }

    #[tokio::test]
    async fn rename_and_metadata_touch_only_their_fields() {
        let storage = store().await;
        let conv = storage.create_conversation("u1", "neural_text", "New Chat").await.unwrap();

        storage.rename_conversation(conv.id, "Rust lifetimes").await.unwrap();
        let first = ChatMetadata {
            summary: "Borrowing".into(),
            keywords: vec!["rust".into(), "lifetimes".into()],
        };
        storage.set_conversation_metadata(conv.id, &first).await.unwrap();
        let second = ChatMetadata {
            summary: "Ownership".into(),
            keywords: vec!["ownership".into()],
        };
        storage.set_conversation_metadata(conv.id, &second).await.unwrap();

        let stored = storage.get_conversation(conv.id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Rust lifetimes");
        assert_eq!(stored.metadata, Some(second));
        assert_eq!(stored.created_at, conv.created_at);
        assert_eq!(stored.user_id, conv.user_id);

        // Absent ids are no-ops, not errors.
        storage.rename_conversation(Uuid::new_v4(), "nope").await.unwrap();
        storage
            .set_conversation_metadata(Uuid::new_v4(), &ChatMetadata::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn updated_message_keeps_identity_and_stays_last() {
        let storage = store().await;
        let conv = storage.create_conversation("u1", "neural_text", "c").await.unwrap();
        storage
            .append_message(conv.id, "u1", "neural_text", "question", Role::User)
            .await
            .unwrap();
        let answer = storage
            .append_message(conv.id, "u1", "neural_text", "first answer", Role::Assistant)
            .await
            .unwrap();

        let updated = storage
            .update_message_content(answer.id, "second answer")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.id, answer.id);
        assert!(updated.timestamp >= answer.timestamp);

        let messages = storage.get_conversation_messages(conv.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages.last(), Some(&updated));
        assert_eq!(updated.content, "second answer");
        assert_eq!(storage.latest_message(conv.id).await.unwrap(), Some(updated));

        assert!(storage
            .update_message_content(Uuid::new_v4(), "ghost")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn provider_config_is_one_record_per_user() {
        let storage = store().await;
        assert!(storage.get_provider_config("u1").await.unwrap().is_none());

        let created = storage
            .save_provider_config("u1", Some(Provider::OpenRouter), Some("k1".into()), None)
            .await
            .unwrap();
        let updated = storage
            .save_provider_config(
                "u1",
                Some(Provider::OpenRouter),
                Some("k2".into()),
                Some("https://proxy.example/v1".into()),
            )
            .await
            .unwrap();
        assert_eq!(created.id, updated.id);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM provider_configs")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);

        storage.clear_provider_credential("u1").await.unwrap();
        let cleared = storage.get_provider_config("u1").await.unwrap().unwrap();
        assert_eq!(cleared.id, created.id);
        assert_eq!(cleared.provider, Some(Provider::OpenRouter));
        assert_eq!(cleared.api_key(), None);
        assert_eq!(cleared.base_url(), None);

        // No record: clearing is a no-op.
        storage.clear_provider_credential("nobody").await.unwrap();
        assert!(storage.get_provider_config("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn switching_back_restores_retained_credentials() {
        let storage = store().await;
        storage
            .save_provider_config("u1", Some(Provider::OpenRouter), Some("k1".into()), None)
            .await
            .unwrap();

        let b = storage.switch_provider("u1", Some(Provider::OpenAi)).await.unwrap();
        assert_eq!(b.provider, Some(Provider::OpenAi));
        assert_eq!(b.api_key(), None);

        let a = storage.switch_provider("u1", Some(Provider::OpenRouter)).await.unwrap();
        assert_eq!(a.provider, Some(Provider::OpenRouter));
        assert_eq!(a.api_key(), Some("k1"));
        assert_eq!(a.id, b.id);

        let c = storage.switch_provider("u1", Some(Provider::Ollama)).await.unwrap();
        assert_eq!(c.provider, Some(Provider::Ollama));
        assert_eq!(c.api_key(), None);
    }

    #[tokio::test]
    async fn cleared_credentials_are_not_restored() {
        let storage = store().await;
        storage
            .save_provider_config("u1", Some(Provider::OpenAi), Some("sk".into()), None)
            .await
            .unwrap();
        storage.clear_provider_credential("u1").await.unwrap();
        storage.switch_provider("u1", Some(Provider::LmStudio)).await.unwrap();

        let back = storage.switch_provider("u1", Some(Provider::OpenAi)).await.unwrap();
        assert_eq!(back.api_key(), None);
    }

    #[tokio::test]
    async fn migrations_are_idempotent_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chat.sqlite");

        let storage = StorageManager::open(&path).await.unwrap();
        let conv = storage.create_conversation("u1", "neural_text", "kept").await.unwrap();
        assert_eq!(storage.schema_version().await.unwrap(), SCHEMA_VERSION);
        storage.pool().close().await;

        let reopened = StorageManager::open(&path).await.unwrap();
        assert_eq!(reopened.schema_version().await.unwrap(), SCHEMA_VERSION);
        assert_eq!(reopened.get_conversation(conv.id).await.unwrap(), Some(conv));
    }

    #[tokio::test]
    async fn v1_database_upgrades_without_touching_chats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.sqlite");

        {
            let options = SqliteConnectOptions::new().filename(&path).create_if_missing(true);
            let pool = SqlitePoolOptions::new().connect_with(options).await.unwrap();
            sqlx::query(MIGRATION_V1).execute(&pool).await.unwrap();
            sqlx::query("PRAGMA user_version = 1").execute(&pool).await.unwrap();
            sqlx::query(
                "INSERT INTO conversations (id, user_id, app_scope, title, created_at, last_updated_at)
                 VALUES (?, 'u1', 'neural_text', 'old chat', 1700000000000, 1700000000000)",
            )
            .bind(Uuid::new_v4().to_string())
            .execute(&pool)
            .await
            .unwrap();
            pool.close().await;
        }

        let storage = StorageManager::open(&path).await.unwrap();
        assert_eq!(storage.schema_version().await.unwrap(), SCHEMA_VERSION);
        let chats = storage.list_conversations("u1", "neural_text").await.unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].title, "old chat");

        storage
            .save_provider_config("u1", Some(Provider::Ollama), None, None)
            .await
            .unwrap();
        assert!(storage.get_provider_config("u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.sqlite");
        {
            let options = SqliteConnectOptions::new().filename(&path).create_if_missing(true);
            let pool = SqlitePoolOptions::new().connect_with(options).await.unwrap();
            sqlx::query("PRAGMA user_version = 99").execute(&pool).await.unwrap();
            pool.close().await;
        }

        assert!(StorageManager::open(&path).await.is_err());
    }
}
