//! SQL table-backed queue over sqlx.
//!
//! One `githook_messages` table holds the payloads; per-consumer-group
//! offsets live in `githook_offsets`. The subscriber polls above its
//! offset and only advances it after the handler acks, which makes
//! delivery at-least-once. SQLite assumes a single writer; Postgres and
//! MySQL rely on the primary key ordering.

use async_trait::async_trait;
use bytes::Bytes;
use githook_core::{Error, Message, Result};
use sqlx::{MySqlPool, PgPool, Row, SqlitePool};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{SqlConfig, SqlDialect};
use crate::{MessageHandler, Publisher, Subscriber};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const POLL_BATCH: i64 = 32;

#[derive(Debug)]
enum Pool {
    Postgres(PgPool),
    Mysql(MySqlPool),
    Sqlite(SqlitePool),
}

/// SQL queue acting as both publisher and subscriber.
#[derive(Debug)]
pub struct SqlQueue {
    config: SqlConfig,
    pool: Pool,
    closed: AtomicBool,
    stop: CancellationToken,
}

impl SqlQueue {
    /// Connect and (optionally) create the queue tables.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] on connection or schema failure.
    pub async fn connect(config: SqlConfig) -> Result<Self> {
        let pool = match config.driver {
            SqlDialect::Postgres => Pool::Postgres(
                PgPool::connect(&config.dsn).await.map_err(Error::transport)?,
            ),
            SqlDialect::Mysql => Pool::Mysql(
                MySqlPool::connect(&config.dsn).await.map_err(Error::transport)?,
            ),
            SqlDialect::Sqlite => {
                // In-memory SQLite databases are per-connection; pin the
                // pool to one connection so every query sees the same db.
                let max = if config.dsn.contains(":memory:") { 1 } else { 5 };
                Pool::Sqlite(
                    sqlx::sqlite::SqlitePoolOptions::new()
                        .max_connections(max)
                        .connect(&config.dsn)
                        .await
                        .map_err(Error::transport)?,
                )
            }
        };
        let queue = Self {
            config,
            pool,
            closed: AtomicBool::new(false),
            stop: CancellationToken::new(),
        };
        if queue.config.auto_initialize_schema {
            queue.initialize_schema().await?;
        }
        Ok(queue)
    }

    async fn initialize_schema(&self) -> Result<()> {
        let statements: &[&str] = match self.pool {
            Pool::Postgres(_) => &[
                "CREATE TABLE IF NOT EXISTS githook_messages (
                    id BIGSERIAL PRIMARY KEY,
                    topic TEXT NOT NULL,
                    payload BYTEA NOT NULL,
                    metadata TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )",
                "CREATE INDEX IF NOT EXISTS githook_messages_topic_id
                    ON githook_messages (topic, id)",
                "CREATE TABLE IF NOT EXISTS githook_offsets (
                    consumer_group TEXT NOT NULL,
                    topic TEXT NOT NULL,
                    last_id BIGINT NOT NULL,
                    PRIMARY KEY (consumer_group, topic)
                )",
            ],
            Pool::Mysql(_) => &[
                "CREATE TABLE IF NOT EXISTS githook_messages (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    topic VARCHAR(255) NOT NULL,
                    payload LONGBLOB NOT NULL,
                    metadata TEXT NOT NULL,
                    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                    INDEX githook_messages_topic_id (topic, id)
                )",
                "CREATE TABLE IF NOT EXISTS githook_offsets (
                    consumer_group VARCHAR(255) NOT NULL,
                    topic VARCHAR(255) NOT NULL,
                    last_id BIGINT NOT NULL,
                    PRIMARY KEY (consumer_group, topic)
                )",
            ],
            Pool::Sqlite(_) => &[
                "CREATE TABLE IF NOT EXISTS githook_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    topic TEXT NOT NULL,
                    payload BLOB NOT NULL,
                    metadata TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                )",
                "CREATE INDEX IF NOT EXISTS githook_messages_topic_id
                    ON githook_messages (topic, id)",
                "CREATE TABLE IF NOT EXISTS githook_offsets (
                    consumer_group TEXT NOT NULL,
                    topic TEXT NOT NULL,
                    last_id INTEGER NOT NULL,
                    PRIMARY KEY (consumer_group, topic)
                )",
            ],
        };
        for statement in statements {
            self.execute(statement).await?;
        }
        debug!(driver = ?self.config.driver, "sql queue schema initialized");
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        match &self.pool {
            Pool::Postgres(pool) => sqlx::query(sql).execute(pool).await.map(|_| ()),
            Pool::Mysql(pool) => sqlx::query(sql).execute(pool).await.map(|_| ()),
            Pool::Sqlite(pool) => sqlx::query(sql).execute(pool).await.map(|_| ()),
        }
        .map_err(Error::transport)
    }

    async fn insert_message(&self, topic: &str, payload: &[u8], metadata: &str) -> Result<()> {
        match &self.pool {
            Pool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO githook_messages (topic, payload, metadata) VALUES ($1, $2, $3)",
                )
                .bind(topic)
                .bind(payload)
                .bind(metadata)
                .execute(pool)
                .await
                .map(|_| ())
            }
            Pool::Mysql(pool) => {
                sqlx::query(
                    "INSERT INTO githook_messages (topic, payload, metadata) VALUES (?, ?, ?)",
                )
                .bind(topic)
                .bind(payload)
                .bind(metadata)
                .execute(pool)
                .await
                .map(|_| ())
            }
            Pool::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO githook_messages (topic, payload, metadata) VALUES (?, ?, ?)",
                )
                .bind(topic)
                .bind(payload)
                .bind(metadata)
                .execute(pool)
                .await
                .map(|_| ())
            }
        }
        .map_err(Error::transport)
    }

    async fn current_offset(&self, group: &str, topic: &str) -> Result<i64> {
        let row = match &self.pool {
            Pool::Postgres(pool) => sqlx::query(
                "SELECT last_id FROM githook_offsets WHERE consumer_group = $1 AND topic = $2",
            )
            .bind(group)
            .bind(topic)
            .fetch_optional(pool)
            .await
            .map_err(Error::transport)?
            .map(|r| r.get::<i64, _>("last_id")),
            Pool::Mysql(pool) => sqlx::query(
                "SELECT last_id FROM githook_offsets WHERE consumer_group = ? AND topic = ?",
            )
            .bind(group)
            .bind(topic)
            .fetch_optional(pool)
            .await
            .map_err(Error::transport)?
            .map(|r| r.get::<i64, _>("last_id")),
            Pool::Sqlite(pool) => sqlx::query(
                "SELECT last_id FROM githook_offsets WHERE consumer_group = ? AND topic = ?",
            )
            .bind(group)
            .bind(topic)
            .fetch_optional(pool)
            .await
            .map_err(Error::transport)?
            .map(|r| r.get::<i64, _>("last_id")),
        };
        Ok(row.unwrap_or(0))
    }

    async fn store_offset(&self, group: &str, topic: &str, last_id: i64) -> Result<()> {
        match &self.pool {
            Pool::Postgres(pool) => sqlx::query(
                "INSERT INTO githook_offsets (consumer_group, topic, last_id)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (consumer_group, topic) DO UPDATE SET last_id = $3",
            )
            .bind(group)
            .bind(topic)
            .bind(last_id)
            .execute(pool)
            .await
            .map(|_| ()),
            Pool::Mysql(pool) => sqlx::query(
                "INSERT INTO githook_offsets (consumer_group, topic, last_id)
                 VALUES (?, ?, ?)
                 ON DUPLICATE KEY UPDATE last_id = VALUES(last_id)",
            )
            .bind(group)
            .bind(topic)
            .bind(last_id)
            .execute(pool)
            .await
            .map(|_| ()),
            Pool::Sqlite(pool) => sqlx::query(
                "INSERT OR REPLACE INTO githook_offsets (consumer_group, topic, last_id)
                 VALUES (?, ?, ?)",
            )
            .bind(group)
            .bind(topic)
            .bind(last_id)
            .execute(pool)
            .await
            .map(|_| ()),
        }
        .map_err(Error::transport)
    }

    async fn fetch_batch(&self, topic: &str, after: i64) -> Result<Vec<(i64, Vec<u8>, String)>> {
        let rows = match &self.pool {
            Pool::Postgres(pool) => sqlx::query(
                "SELECT id, payload, metadata FROM githook_messages
                 WHERE topic = $1 AND id > $2 ORDER BY id LIMIT $3",
            )
            .bind(topic)
            .bind(after)
            .bind(POLL_BATCH)
            .fetch_all(pool)
            .await
            .map_err(Error::transport)?
            .into_iter()
            .map(|r| {
                (
                    r.get::<i64, _>("id"),
                    r.get::<Vec<u8>, _>("payload"),
                    r.get::<String, _>("metadata"),
                )
            })
            .collect(),
            Pool::Mysql(pool) => sqlx::query(
                "SELECT id, payload, metadata FROM githook_messages
                 WHERE topic = ? AND id > ? ORDER BY id LIMIT ?",
            )
            .bind(topic)
            .bind(after)
            .bind(POLL_BATCH)
            .fetch_all(pool)
            .await
            .map_err(Error::transport)?
            .into_iter()
            .map(|r| {
                (
                    r.get::<i64, _>("id"),
                    r.get::<Vec<u8>, _>("payload"),
                    r.get::<String, _>("metadata"),
                )
            })
            .collect(),
            Pool::Sqlite(pool) => sqlx::query(
                "SELECT id, payload, metadata FROM githook_messages
                 WHERE topic = ? AND id > ? ORDER BY id LIMIT ?",
            )
            .bind(topic)
            .bind(after)
            .bind(POLL_BATCH)
            .fetch_all(pool)
            .await
            .map_err(Error::transport)?
            .into_iter()
            .map(|r| {
                (
                    r.get::<i64, _>("id"),
                    r.get::<Vec<u8>, _>("payload"),
                    r.get::<String, _>("metadata"),
                )
            })
            .collect(),
        };
        Ok(rows)
    }
}

#[async_trait]
impl Publisher for SqlQueue {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("sql queue"));
        }
        let metadata_json = serde_json::to_string(metadata)?;
        self.insert_message(topic, payload, &metadata_json).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.stop.cancel();
        Ok(())
    }
}

#[async_trait]
impl Subscriber for SqlQueue {
    async fn start(
        &self,
        ctx: CancellationToken,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<()> {
        let group = if self.config.consumer_group.is_empty() {
            "githook"
        } else {
            &self.config.consumer_group
        };
        let mut offset = self.current_offset(group, topic).await?;
        debug!(topic = %topic, group = %group, offset, "sql queue consumer started");

        loop {
            tokio::select! {
                () = ctx.cancelled() => return Ok(()),
                () = self.stop.cancelled() => return Ok(()),
                () = tokio::time::sleep(POLL_INTERVAL) => {
                    for (id, payload, metadata_json) in self.fetch_batch(topic, offset).await? {
                        let metadata: HashMap<String, String> =
                            serde_json::from_str(&metadata_json).unwrap_or_default();
                        let message = Message {
                            payload: Bytes::from(payload),
                            metadata,
                            topic: topic.to_string(),
                        };
                        match handler(message).await {
                            Ok(()) => {
                                offset = id;
                                self.store_offset(group, topic, offset).await?;
                            }
                            Err(e) => {
                                // Do not advance: the row redelivers on
                                // the next poll.
                                warn!(topic = %topic, id, error = %e, "sql queue handler failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.stop.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn sqlite_config() -> SqlConfig {
        serde_json::from_value(serde_json::json!({
            "driver": "sqlite",
            "dsn": "sqlite::memory:",
            "consumer_group": "test",
            "auto_initialize_schema": true
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn publish_then_consume_in_order() {
        let queue = Arc::new(SqlQueue::connect(sqlite_config()).await.unwrap());

        for n in 0..3 {
            let mut metadata = HashMap::new();
            metadata.insert("n".to_string(), n.to_string());
            queue
                .publish("t1", format!("payload-{n}").as_bytes(), &metadata)
                .await
                .unwrap();
        }

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        let handler: MessageHandler = Arc::new(move |msg: Message| {
            let seen = seen_in_handler.clone();
            Box::pin(async move {
                seen.lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&msg.payload).into_owned());
                Ok(())
            })
        });

        let ctx = CancellationToken::new();
        let consumer = queue.clone();
        let task = {
            let ctx = ctx.clone();
            tokio::spawn(async move { consumer.start(ctx, "t1", handler).await })
        };

        tokio::time::sleep(Duration::from_millis(800)).await;
        ctx.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(
            seen.lock().unwrap().clone(),
            vec!["payload-0", "payload-1", "payload-2"]
        );
    }

    #[tokio::test]
    async fn failed_handler_redelivers() {
        let queue = Arc::new(SqlQueue::connect(sqlite_config()).await.unwrap());
        queue.publish("t2", b"only", &HashMap::new()).await.unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let handler: MessageHandler = Arc::new(move |_msg: Message| {
            let counter = counter.clone();
            Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(Error::Other("transient".into()))
                } else {
                    Ok(())
                }
            })
        });

        let ctx = CancellationToken::new();
        let consumer = queue.clone();
        let task = {
            let ctx = ctx.clone();
            tokio::spawn(async move { consumer.start(ctx, "t2", handler).await })
        };

        tokio::time::sleep(Duration::from_millis(900)).await;
        ctx.cancel();
        task.await.unwrap().unwrap();

        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }
}
