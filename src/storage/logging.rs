//! Request log rows and fire-and-forget writes.

use sqlx::SqlitePool;

/// A completed generation ready for database insertion.
///
/// All fields are owned so the entry can move into a spawned task.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub correlation_id: String,
    pub timestamp: String,
    pub model: String,
    pub requested_provider: String,
    /// Provider that answered; `None` on failure.
    pub provider: Option<String>,
    /// Provider calls made, successful or not.
    pub attempts: u32,
    pub latency_ms: i64,
    pub success: bool,
    pub error_message: Option<String>,
}

impl RequestLog {
    pub async fn insert(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO requests (
                correlation_id, timestamp, model, requested_provider, provider,
                attempts, latency_ms, success, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.correlation_id)
        .bind(&self.timestamp)
        .bind(&self.model)
        .bind(&self.requested_provider)
        .bind(&self.provider)
        .bind(self.attempts as i64)
        .bind(self.latency_ms)
        .bind(self.success)
        .bind(self.error_message.as_deref())
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// Spawn a fire-and-forget database write.
///
/// If the write fails, a warning is logged but the error is not propagated.
pub fn spawn_log_write(pool: &SqlitePool, log: RequestLog) {
    let pool = pool.clone();
    tokio::spawn(async move {
        if let Err(e) = log.insert(&pool).await {
            tracing::warn!(
                correlation_id = %log.correlation_id,
                error = %e,
                "Failed to write request log to database"
            );
        }
    });
}
