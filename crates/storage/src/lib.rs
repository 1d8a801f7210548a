use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use shared::domain::{ChatId, ChatMode, ConferenceId, MessageId, ProfileId};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS conference_configuration (
        conference_id TEXT NOT NULL,
        key           TEXT NOT NULL,
        value         TEXT NOT NULL,
        PRIMARY KEY (conference_id, key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chat_credentials (
        scope         TEXT PRIMARY KEY,
        token         TEXT NOT NULL,
        expiry        TEXT NOT NULL,
        conference_id TEXT NOT NULL,
        updated_at    TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS text_chats (
        chat_id                TEXT PRIMARY KEY,
        conference_id          TEXT NOT NULL,
        name                   TEXT NOT NULL,
        mode                   TEXT NOT NULL,
        is_private             INTEGER NOT NULL,
        auto_watch             INTEGER NOT NULL DEFAULT 0,
        creator_id             TEXT NOT NULL,
        created_at             TEXT NOT NULL,
        dm_member1             TEXT,
        dm_member2             TEXT,
        moderation_completed   INTEGER NOT NULL DEFAULT 0,
        related_moderation_key TEXT
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS text_chats_single_moderation_hub
        ON text_chats (conference_id) WHERE mode = 'moderation_hub'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mirrored_channels (
        chat_id       TEXT PRIMARY KEY,
        conference_id TEXT NOT NULL,
        snapshot      TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mirrored_messages (
        chat_id       TEXT NOT NULL,
        message_index INTEGER NOT NULL,
        message_id    TEXT NOT NULL,
        author_id     TEXT NOT NULL,
        body          TEXT NOT NULL,
        sent_at       TEXT NOT NULL,
        PRIMARY KEY (chat_id, message_index)
    )
    "#,
];

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredential {
    pub token: String,
    pub expiry: DateTime<Utc>,
    pub conference_id: ConferenceId,
}

/// Classification record kept alongside every provider channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTextChat {
    pub chat_id: ChatId,
    pub conference_id: ConferenceId,
    pub name: String,
    pub mode: ChatMode,
    pub is_private: bool,
    pub auto_watch: bool,
    pub creator_id: ProfileId,
    pub created_at: DateTime<Utc>,
    pub dm_member1: Option<ProfileId>,
    pub dm_member2: Option<ProfileId>,
    pub moderation_completed: bool,
    pub related_moderation_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A uniqueness constraint rejected the row (duplicate id or a second moderation hub).
    Conflict,
}

#[derive(Debug, Clone)]
pub struct MirroredMessage {
    pub chat_id: ChatId,
    pub message_index: u64,
    pub message_id: MessageId,
    pub author_id: ProfileId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new().max_connections(5);
        if is_in_memory(database_url) {
            // Every in-memory connection is its own database; pin a single one for the pool's life.
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>);
        }
        let pool = pool_options.connect_with(connect_options).await?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to ensure chat storage schema")?;
        }
        Ok(())
    }

    pub async fn set_config_value(
        &self,
        conference_id: &ConferenceId,
        key: &str,
        value: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO conference_configuration (conference_id, key, value) VALUES (?, ?, ?)
             ON CONFLICT(conference_id, key) DO UPDATE SET value=excluded.value",
        )
        .bind(conference_id.as_str())
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn config_values_by_key(
        &self,
        key: &str,
        conference_id: &ConferenceId,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT value FROM conference_configuration WHERE conference_id = ? AND key = ?",
        )
        .bind(conference_id.as_str())
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to read configuration key '{key}'"))?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>(0)).collect())
    }

    pub async fn load_credential(&self, scope: &str) -> Result<Option<StoredCredential>> {
        let row = sqlx::query(
            "SELECT token, expiry, conference_id FROM chat_credentials WHERE scope = ?",
        )
        .bind(scope)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| -> Result<StoredCredential> {
            Ok(StoredCredential {
                token: r.try_get("token")?,
                expiry: r.try_get("expiry")?,
                conference_id: ConferenceId(r.try_get("conference_id")?),
            })
        })
        .transpose()
    }

    pub async fn save_credential(&self, scope: &str, credential: &StoredCredential) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_credentials (scope, token, expiry, conference_id, updated_at)
             VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(scope) DO UPDATE SET
                token=excluded.token,
                expiry=excluded.expiry,
                conference_id=excluded.conference_id,
                updated_at=CURRENT_TIMESTAMP",
        )
        .bind(scope)
        .bind(&credential.token)
        .bind(credential.expiry)
        .bind(credential.conference_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_credential(&self, scope: &str) -> Result<()> {
        sqlx::query("DELETE FROM chat_credentials WHERE scope = ?")
            .bind(scope)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_text_chat(&self, chat: &StoredTextChat) -> Result<InsertOutcome> {
        let result = sqlx::query(
            "INSERT INTO text_chats (
                chat_id, conference_id, name, mode, is_private, auto_watch, creator_id,
                created_at, dm_member1, dm_member2, moderation_completed, related_moderation_key
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(chat.chat_id.as_str())
        .bind(chat.conference_id.as_str())
        .bind(&chat.name)
        .bind(chat.mode.as_str())
        .bind(chat.is_private)
        .bind(chat.auto_watch)
        .bind(chat.creator_id.as_str())
        .bind(chat.created_at)
        .bind(chat.dm_member1.as_ref().map(ProfileId::as_str))
        .bind(chat.dm_member2.as_ref().map(ProfileId::as_str))
        .bind(chat.moderation_completed)
        .bind(chat.related_moderation_key.as_deref())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Ok(InsertOutcome::Conflict)
            }
            Err(err) => Err(err).context("failed to insert text chat record"),
        }
    }

    pub async fn text_chat(&self, chat_id: &ChatId) -> Result<Option<StoredTextChat>> {
        let row = sqlx::query("SELECT * FROM text_chats WHERE chat_id = ?")
            .bind(chat_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| text_chat_from_row(&r)).transpose()
    }

    pub async fn text_chat_by_mode(
        &self,
        conference_id: &ConferenceId,
        mode: ChatMode,
    ) -> Result<Option<StoredTextChat>> {
        let row = sqlx::query(
            "SELECT * FROM text_chats WHERE conference_id = ? AND mode = ?
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(conference_id.as_str())
        .bind(mode.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| text_chat_from_row(&r)).transpose()
    }

    /// Returns false when no record exists for the chat.
    pub async fn set_moderation_completed(&self, chat_id: &ChatId, completed: bool) -> Result<bool> {
        let result =
            sqlx::query("UPDATE text_chats SET moderation_completed = ? WHERE chat_id = ?")
                .bind(completed)
                .bind(chat_id.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns false when no record exists for the chat.
    pub async fn set_auto_watch(&self, chat_id: &ChatId, enabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE text_chats SET auto_watch = ? WHERE chat_id = ?")
            .bind(enabled)
            .bind(chat_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_text_chat(&self, chat_id: &ChatId) -> Result<()> {
        sqlx::query("DELETE FROM text_chats WHERE chat_id = ?")
            .bind(chat_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_mirrored_channel(
        &self,
        chat_id: &ChatId,
        conference_id: &ConferenceId,
        snapshot: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO mirrored_channels (chat_id, conference_id, snapshot, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(chat_id) DO UPDATE SET snapshot=excluded.snapshot, updated_at=excluded.updated_at",
        )
        .bind(chat_id.as_str())
        .bind(conference_id.as_str())
        .bind(snapshot)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mirrored_channel_snapshot(&self, chat_id: &ChatId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT snapshot FROM mirrored_channels WHERE chat_id = ?")
            .bind(chat_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn insert_mirrored_message(&self, message: &MirroredMessage) -> Result<()> {
        let index = i64::try_from(message.message_index)
            .context("message index does not fit the mirror schema")?;
        sqlx::query(
            "INSERT INTO mirrored_messages (chat_id, message_index, message_id, author_id, body, sent_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(chat_id, message_index) DO NOTHING",
        )
        .bind(message.chat_id.as_str())
        .bind(index)
        .bind(message.message_id.as_str())
        .bind(message.author_id.as_str())
        .bind(&message.body)
        .bind(message.sent_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mirrored_message_count(&self, chat_id: &ChatId) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM mirrored_messages WHERE chat_id = ?")
                .bind(chat_id.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub async fn delete_mirrored_channel(&self, chat_id: &ChatId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM mirrored_messages WHERE chat_id = ?")
            .bind(chat_id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM mirrored_channels WHERE chat_id = ?")
            .bind(chat_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn text_chat_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredTextChat> {
    let raw_mode: String = row.try_get("mode")?;
    let mode = ChatMode::parse(&raw_mode)
        .with_context(|| format!("unknown text chat mode '{raw_mode}'"))?;
    Ok(StoredTextChat {
        chat_id: ChatId(row.try_get("chat_id")?),
        conference_id: ConferenceId(row.try_get("conference_id")?),
        name: row.try_get("name")?,
        mode,
        is_private: row.try_get("is_private")?,
        auto_watch: row.try_get("auto_watch")?,
        creator_id: ProfileId(row.try_get("creator_id")?),
        created_at: row.try_get("created_at")?,
        dm_member1: row.try_get::<Option<String>, _>("dm_member1")?.map(ProfileId),
        dm_member2: row.try_get::<Option<String>, _>("dm_member2")?.map(ProfileId),
        moderation_completed: row.try_get("moderation_completed")?,
        related_moderation_key: row.try_get("related_moderation_key")?,
    })
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_in_memory(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
