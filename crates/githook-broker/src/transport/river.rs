//! RiverQueue publisher: inserts jobs into a Postgres river job table.
//!
//! Publisher-only; jobs are worked by River workers, not by the githook
//! worker runtime.

use async_trait::async_trait;
use githook_core::{meta, Error, Result};
use hex::ToHex;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::config::RiverConfig;
use crate::Publisher;

/// Publisher inserting River jobs.
#[derive(Debug)]
pub struct RiverPublisher {
    config: RiverConfig,
    pool: PgPool,
    closed: AtomicBool,
}

impl RiverPublisher {
    /// Connect to Postgres and validate the table reference.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for a malformed `table`;
    /// [`Error::Transport`] when Postgres is unreachable.
    pub async fn connect(config: RiverConfig) -> Result<Self> {
        config.schema_table()?;
        let pool = PgPool::connect(&config.dsn).await.map_err(Error::transport)?;
        Ok(Self {
            config,
            pool,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Publisher for RiverPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("riverqueue publisher"));
        }
        let (schema, table) = self.config.schema_table()?;
        let queue = if self.config.queue.is_empty() {
            "default"
        } else {
            &self.config.queue
        };
        let kind = if self.config.kind.is_empty() {
            "githook_event"
        } else {
            &self.config.kind
        };

        // Queue drivers stamp their own routing keys into the metadata
        // the worker sees; here that lives inside the job args.
        let mut job_metadata = metadata.clone();
        job_metadata.insert(meta::QUEUE.to_string(), queue.to_string());
        job_metadata.insert(meta::KIND.to_string(), kind.to_string());

        let args = serde_json::json!({
            "topic": topic,
            "payload_hex": payload.encode_hex::<String>(),
            "metadata": job_metadata,
        });

        // Identifiers cannot be bound; they come from validated config.
        let sql = format!(
            "INSERT INTO {schema}.{table} (args, kind, queue, max_attempts, priority, state, scheduled_at, created_at)
             VALUES ($1, $2, $3, $4, 1, 'available', now(), now())
             RETURNING id"
        );
        let row = sqlx::query(&sql)
            .bind(&args)
            .bind(kind)
            .bind(queue)
            .bind(i32::try_from(self.config.max_workers.max(1)).unwrap_or(1))
            .fetch_one(&self.pool)
            .await
            .map_err(Error::transport)?;
        let job_id: i64 = row.get("id");

        debug!(job_id, queue = %queue, kind = %kind, topic = %topic, "river job inserted");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
