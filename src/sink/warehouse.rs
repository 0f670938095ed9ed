//! Durable warehouse sink for closed windows
//!
//! Every closed window becomes one row keyed by `(metric, group_key,
//! window_start)`. Upserts are guarded by the batch id: a row is only
//! overwritten by a strictly newer batch, so replaying a batch after a crash
//! rewrites nothing.

use super::{Sink, SinkBatch};
use crate::config::WarehouseConfig;
use crate::error::{SinkError, SinkResult};
use crate::window::ClosedWindow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

const SINK_NAME: &str = "warehouse";

/// One finalized window as stored in the warehouse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRow {
    pub metric: String,
    pub group_key: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub value: i64,
    pub event_count: i64,
    /// Batch that produced this version of the row
    pub last_updated_batch_id: i64,
    pub updated_at: DateTime<Utc>,
}

impl WindowRow {
    fn from_closed(window: &ClosedWindow, batch_id: u64) -> Self {
        Self {
            metric: window.id.metric.name().to_string(),
            group_key: window.id.key.to_key_string(),
            window_start: window.id.bounds.start,
            window_end: window.id.bounds.end,
            value: window.value as i64,
            event_count: window.event_count as i64,
            last_updated_batch_id: batch_id as i64,
            updated_at: Utc::now(),
        }
    }
}

/// Storage backend behind the warehouse sink
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Upserts rows; a row only replaces one with a smaller batch id
    async fn upsert(&self, rows: &[WindowRow]) -> SinkResult<()>;
}

/// Delivers closed windows to a durable store
pub struct WarehouseSink {
    store: Box<dyn DurableStore>,
}

impl WarehouseSink {
    pub fn new(store: Box<dyn DurableStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Sink for WarehouseSink {
    fn name(&self) -> &'static str {
        SINK_NAME
    }

    async fn deliver(&self, batch: &SinkBatch) -> SinkResult<()> {
        if batch.windows.is_empty() {
            return Ok(());
        }
        let rows: Vec<WindowRow> = batch
            .windows
            .iter()
            .map(|w| WindowRow::from_closed(w, batch.batch_id))
            .collect();
        self.store.upsert(&rows).await?;
        debug!(
            partition_id = batch.partition_id,
            batch_id = batch.batch_id,
            rows = rows.len(),
            "upserted closed windows"
        );
        Ok(())
    }
}

/// Postgres-backed durable store
pub struct PostgresWarehouse {
    pool: PgPool,
    table: String,
}

impl PostgresWarehouse {
    /// Connects a pool sized per the configuration
    pub async fn connect(config: &WarehouseConfig) -> SinkResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(classify_sqlx)?;

        info!(table = %config.table, "connected warehouse pool");
        Ok(Self {
            pool,
            table: config.table.clone(),
        })
    }
}

#[async_trait]
impl DurableStore for PostgresWarehouse {
    async fn upsert(&self, rows: &[WindowRow]) -> SinkResult<()> {
        // Table name comes from trusted configuration, not user input
        let statement = format!(
            "INSERT INTO {} \
             (metric, group_key, window_start, window_end, value, event_count, \
              last_updated_batch_id, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (metric, group_key, window_start) DO UPDATE SET \
               window_end = EXCLUDED.window_end, \
               value = EXCLUDED.value, \
               event_count = EXCLUDED.event_count, \
               last_updated_batch_id = EXCLUDED.last_updated_batch_id, \
               updated_at = EXCLUDED.updated_at \
             WHERE {}.last_updated_batch_id < EXCLUDED.last_updated_batch_id",
            self.table, self.table
        );

        let mut tx = self.pool.begin().await.map_err(classify_sqlx)?;
        for row in rows {
            sqlx::query(&statement)
                .bind(&row.metric)
                .bind(&row.group_key)
                .bind(row.window_start)
                .bind(row.window_end)
                .bind(row.value)
                .bind(row.event_count)
                .bind(row.last_updated_batch_id)
                .bind(row.updated_at)
                .execute(&mut *tx)
                .await
                .map_err(classify_sqlx)?;
        }
        tx.commit().await.map_err(classify_sqlx)?;
        Ok(())
    }
}

fn classify_sqlx(err: sqlx::Error) -> SinkError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Tls(_) => SinkError::Transient {
            sink: SINK_NAME.to_string(),
            reason: err.to_string(),
        },
        _ => SinkError::Permanent {
            sink: SINK_NAME.to_string(),
            reason: err.to_string(),
        },
    }
}

/// In-memory durable store for tests
#[derive(Default)]
pub struct MemoryWarehouse {
    rows: Mutex<HashMap<(String, String, DateTime<Utc>), WindowRow>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all stored rows, sorted for stable assertions
    pub fn rows(&self) -> Vec<WindowRow> {
        let guard = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<WindowRow> = guard.values().cloned().collect();
        rows.sort_by(|a, b| {
            a.window_start
                .cmp(&b.window_start)
                .then_with(|| a.metric.cmp(&b.metric))
                .then_with(|| a.group_key.cmp(&b.group_key))
        });
        rows
    }

    pub fn get(&self, metric: &str, group_key: &str, window_start: DateTime<Utc>) -> Option<WindowRow> {
        let guard = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .get(&(metric.to_string(), group_key.to_string(), window_start))
            .cloned()
    }
}

#[async_trait]
impl DurableStore for MemoryWarehouse {
    async fn upsert(&self, rows: &[WindowRow]) -> SinkResult<()> {
        let mut guard = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        for row in rows {
            let key = (
                row.metric.clone(),
                row.group_key.clone(),
                row.window_start,
            );
            match guard.get(&key) {
                Some(existing) if existing.last_updated_batch_id >= row.last_updated_batch_id => {}
                _ => {
                    guard.insert(key, row.clone());
                }
            }
        }
        Ok(())
    }
}
