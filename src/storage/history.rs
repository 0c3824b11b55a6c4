//! Per-user chat history.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::provider::ChatMessage;

/// Where conversations are kept between requests.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Stored conversation for `username`, empty if none.
    async fn load(&self, username: &str) -> Result<Vec<ChatMessage>, sqlx::Error>;

    /// Replace the stored conversation for `username`.
    async fn save(&self, username: &str, messages: &[ChatMessage]) -> Result<(), sqlx::Error>;
}

/// [`HistoryStore`] backed by the `chat_history` table, one JSON array per user.
#[derive(Clone)]
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn load(&self, username: &str) -> Result<Vec<ChatMessage>, sqlx::Error> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT messages FROM chat_history WHERE username = ?")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;

        let Some(raw) = raw else {
            return Ok(Vec::new());
        };

        match serde_json::from_str(&raw) {
            Ok(messages) => Ok(messages),
            Err(e) => {
                tracing::warn!(
                    username = %username,
                    error = %e,
                    "Invalid chat history JSON, ignoring"
                );
                Ok(Vec::new())
            }
        }
    }

    async fn save(&self, username: &str, messages: &[ChatMessage]) -> Result<(), sqlx::Error> {
        let json = serde_json::to_string(messages).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        sqlx::query(
            "INSERT INTO chat_history (username, messages, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(username) DO UPDATE SET messages = excluded.messages, updated_at = excluded.updated_at",
        )
        .bind(username)
        .bind(json)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, SqliteHistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let pool = crate::storage::init_pool(path.to_str().unwrap()).await.unwrap();
        (dir, SqliteHistoryStore::new(pool))
    }

    #[tokio::test]
    async fn test_load_missing_user_is_empty() {
        let (_dir, store) = store().await;
        assert!(store.load("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_replaces() {
        let (_dir, store) = store().await;
        let first = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        store.save("alice", &first).await.unwrap();
        assert_eq!(store.load("alice").await.unwrap(), first);

        let second = vec![ChatMessage::user("again")];
        store.save("alice", &second).await.unwrap();
        assert_eq!(store.load("alice").await.unwrap(), second);
        assert!(store.load("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_json_is_ignored() {
        let (_dir, store) = store().await;
        sqlx::query(
            "INSERT INTO chat_history (username, messages, updated_at) VALUES ('eve', 'not json', '')",
        )
            .execute(&store.pool)
            .await
            .unwrap();
        assert!(store.load("eve").await.unwrap().is_empty());
    }
}
