//! Redis cache sink for live dashboard counters
//!
//! Closed windows and batch events are projected into the cache structures
//! the dashboards read:
//!
//! - `{prefix}count:{event_type}` — additive event counter, 24 hour TTL
//! - `{prefix}active_users` — set of recently active user ids, 1 hour TTL
//! - `{prefix}popular_pages` — sorted set scored by page views
//! - `{prefix}popular_products` — sorted set scored by product views
//!
//! Increments are not naturally idempotent, so every mutation carries a
//! per-key applied-marker written atomically with it. A retry after a
//! partial failure re-runs only the mutations that never landed; marked
//! ones are skipped.

use super::{Sink, SinkBatch};
use crate::config::RedisCacheConfig;
use crate::error::{SinkError, SinkResult};
use crate::window::{ClosedWindow, MetricId};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Script};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

const SINK_NAME: &str = "cache";

const COUNTER_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const ACTIVE_USERS_TTL: Duration = Duration::from_secs(60 * 60);
const APPLIED_MARKER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Counter-shaped storage behind the cache sink
///
/// Every mutation is guarded: if the `guard` marker already exists the call
/// is a no-op returning `false`, otherwise the mutation and the marker land
/// atomically and the call returns `true`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Adds to a counter and refreshes its TTL
    async fn incr_by(&self, key: &str, amount: i64, ttl: Duration, guard: &str)
        -> SinkResult<bool>;

    /// Adds members to a set and refreshes its TTL
    async fn add_to_set(
        &self,
        key: &str,
        members: &[String],
        ttl: Duration,
        guard: &str,
    ) -> SinkResult<bool>;

    /// Adds to one member's score in a sorted set
    async fn incr_sorted(&self, key: &str, member: &str, amount: i64, guard: &str)
        -> SinkResult<bool>;
}

/// Projects batches into dashboard counters
pub struct CacheSink {
    store: Box<dyn CounterStore>,
    key_prefix: String,
}

impl CacheSink {
    pub fn new(store: Box<dyn CounterStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.key_prefix, suffix)
    }

    /// Guard key for one window's mutation within one batch
    fn window_guard(&self, batch: &SinkBatch, window: &ClosedWindow) -> String {
        self.key(&format!(
            "applied:{}:{}:{}:{}:{}",
            batch.partition_id,
            batch.batch_id,
            window.id.metric.name(),
            window.id.key.to_key_string(),
            window.id.bounds.start.timestamp_millis()
        ))
    }
}

#[async_trait]
impl Sink for CacheSink {
    fn name(&self) -> &'static str {
        SINK_NAME
    }

    async fn deliver(&self, batch: &SinkBatch) -> SinkResult<()> {
        let mut replayed = 0u64;

        for window in &batch.windows {
            let guard = self.window_guard(batch, window);
            let applied = match window.id.metric {
                MetricId::ActiveUsers => {
                    // Keyed by event type; event_count is the raw event count
                    let key = self.key(&format!("count:{}", window.id.key.value()));
                    self.store
                        .incr_by(&key, window.event_count as i64, COUNTER_TTL, &guard)
                        .await?
                }
                MetricId::PageViews => {
                    self.store
                        .incr_sorted(
                            &self.key("popular_pages"),
                            window.id.key.value(),
                            window.value as i64,
                            &guard,
                        )
                        .await?
                }
                MetricId::ProductViews => {
                    self.store
                        .incr_sorted(
                            &self.key("popular_products"),
                            window.id.key.value(),
                            window.value as i64,
                            &guard,
                        )
                        .await?
                }
                // Cart totals only live in the warehouse
                MetricId::AddToCart => continue,
            };
            if !applied {
                replayed += 1;
            }
        }

        let user_ids: Vec<String> = batch
            .events
            .iter()
            .map(|routed| routed.event.user_id.clone())
            .collect();
        if !user_ids.is_empty() {
            let guard = self.key(&format!(
                "applied:{}:{}:users",
                batch.partition_id, batch.batch_id
            ));
            self.store
                .add_to_set(&self.key("active_users"), &user_ids, ACTIVE_USERS_TTL, &guard)
                .await?;
        }

        debug!(
            partition_id = batch.partition_id,
            batch_id = batch.batch_id,
            windows = batch.windows.len(),
            replayed,
            users = user_ids.len(),
            "cache updated"
        );
        Ok(())
    }
}

/// Redis-backed counter store using pre-compiled scripts for atomic updates
pub struct RedisCounterStore {
    connection: ConnectionManager,
    scripts: CacheScripts,
}

struct CacheScripts {
    incr_with_ttl: Script,
    sadd_with_ttl: Script,
    zincr: Script,
}

// Each script checks KEYS[2] (the guard), performs the mutation on KEYS[1],
// and writes the guard in the same atomic execution. Returns 1 when the
// mutation was applied, 0 when the guard already existed.
impl CacheScripts {
    fn new() -> Self {
        Self {
            incr_with_ttl: Script::new(
                r"
                if redis.call('EXISTS', KEYS[2]) == 1 then
                    return 0
                end
                redis.call('INCRBY', KEYS[1], ARGV[1])
                redis.call('EXPIRE', KEYS[1], ARGV[2])
                redis.call('SET', KEYS[2], '1')
                redis.call('EXPIRE', KEYS[2], ARGV[3])
                return 1
                ",
            ),
            sadd_with_ttl: Script::new(
                r"
                if redis.call('EXISTS', KEYS[2]) == 1 then
                    return 0
                end
                for i = 3, #ARGV do
                    redis.call('SADD', KEYS[1], ARGV[i])
                end
                redis.call('EXPIRE', KEYS[1], ARGV[1])
                redis.call('SET', KEYS[2], '1')
                redis.call('EXPIRE', KEYS[2], ARGV[2])
                return 1
                ",
            ),
            zincr: Script::new(
                r"
                if redis.call('EXISTS', KEYS[2]) == 1 then
                    return 0
                end
                redis.call('ZINCRBY', KEYS[1], ARGV[1], ARGV[2])
                redis.call('SET', KEYS[2], '1')
                redis.call('EXPIRE', KEYS[2], ARGV[3])
                return 1
                ",
            ),
        }
    }
}

impl RedisCounterStore {
    /// Connects to Redis per the cache configuration
    pub async fn connect(config: &RedisCacheConfig) -> SinkResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(classify_redis)?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(classify_redis)?;
        info!(prefix = %config.key_prefix, "connected cache store");
        Ok(Self {
            connection,
            scripts: CacheScripts::new(),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_by(
        &self,
        key: &str,
        amount: i64,
        ttl: Duration,
        guard: &str,
    ) -> SinkResult<bool> {
        let mut conn = self.connection.clone();
        let applied: i64 = self
            .scripts
            .incr_with_ttl
            .key(key)
            .key(guard)
            .arg(amount)
            .arg(ttl.as_secs())
            .arg(APPLIED_MARKER_TTL.as_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(classify_redis)?;
        Ok(applied == 1)
    }

    async fn add_to_set(
        &self,
        key: &str,
        members: &[String],
        ttl: Duration,
        guard: &str,
    ) -> SinkResult<bool> {
        let mut conn = self.connection.clone();
        let mut invocation = self.scripts.sadd_with_ttl.key(key);
        invocation.key(guard);
        invocation.arg(ttl.as_secs());
        invocation.arg(APPLIED_MARKER_TTL.as_secs());
        for member in members {
            invocation.arg(member);
        }
        let applied: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(classify_redis)?;
        Ok(applied == 1)
    }

    async fn incr_sorted(
        &self,
        key: &str,
        member: &str,
        amount: i64,
        guard: &str,
    ) -> SinkResult<bool> {
        let mut conn = self.connection.clone();
        let applied: i64 = self
            .scripts
            .zincr
            .key(key)
            .key(guard)
            .arg(amount)
            .arg(member)
            .arg(APPLIED_MARKER_TTL.as_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(classify_redis)?;
        Ok(applied == 1)
    }
}

fn classify_redis(err: redis::RedisError) -> SinkError {
    if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
        SinkError::Transient {
            sink: SINK_NAME.to_string(),
            reason: err.to_string(),
        }
    } else {
        SinkError::Permanent {
            sink: SINK_NAME.to_string(),
            reason: err.to_string(),
        }
    }
}

/// In-memory counter store for tests
#[derive(Default)]
pub struct MemoryCounterStore {
    inner: Mutex<MemoryCounters>,
}

#[derive(Default)]
struct MemoryCounters {
    counters: HashMap<String, i64>,
    sets: HashMap<String, HashSet<String>>,
    sorted: HashMap<String, HashMap<String, i64>>,
    markers: HashSet<String>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, key: &str) -> i64 {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.counters.get(key).copied().unwrap_or(0)
    }

    pub fn set_members(&self, key: &str) -> Vec<String> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut members: Vec<String> = guard
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn sorted_score(&self, key: &str, member: &str) -> i64 {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .sorted
            .get(key)
            .and_then(|z| z.get(member))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_by(
        &self,
        key: &str,
        amount: i64,
        _ttl: Duration,
        guard: &str,
    ) -> SinkResult<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.markers.insert(guard.to_string()) {
            return Ok(false);
        }
        *inner.counters.entry(key.to_string()).or_insert(0) += amount;
        Ok(true)
    }

    async fn add_to_set(
        &self,
        key: &str,
        members: &[String],
        _ttl: Duration,
        guard: &str,
    ) -> SinkResult<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.markers.insert(guard.to_string()) {
            return Ok(false);
        }
        let set = inner.sets.entry(key.to_string()).or_default();
        for member in members {
            set.insert(member.clone());
        }
        Ok(true)
    }

    async fn incr_sorted(
        &self,
        key: &str,
        member: &str,
        amount: i64,
        guard: &str,
    ) -> SinkResult<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.markers.insert(guard.to_string()) {
            return Ok(false);
        }
        *inner
            .sorted
            .entry(key.to_string())
            .or_default()
            .entry(member.to_string())
            .or_insert(0) += amount;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ActivityEvent, EventType, GroupKey};
    use crate::router::RoutedEvent;
    use crate::watermark::Watermark;
    use crate::window::{ClosedWindow, WindowBounds, WindowId};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn closed(metric: MetricId, key: GroupKey, value: u64, event_count: u64) -> ClosedWindow {
        ClosedWindow {
            id: WindowId {
                metric,
                key,
                bounds: WindowBounds::new(
                    Utc.timestamp_millis_opt(0).unwrap(),
                    Utc.timestamp_millis_opt(300_000).unwrap(),
                ),
            },
            value,
            event_count,
        }
    }

    fn batch_with(windows: Vec<ClosedWindow>, user_ids: &[&str]) -> SinkBatch {
        let events = user_ids
            .iter()
            .map(|user_id| RoutedEvent {
                event: ActivityEvent::new(
                    format!("e-{user_id}"),
                    *user_id,
                    EventType::PageView,
                    Utc.timestamp_millis_opt(1_000).unwrap(),
                ),
                pipelines: MetricId::pipelines_for(EventType::PageView),
            })
            .collect();
        SinkBatch {
            partition_id: 0,
            batch_id: 1,
            windows,
            events,
            watermark: Watermark::new(900_000),
        }
    }

    struct SharedStore(Arc<MemoryCounterStore>);

    #[async_trait]
    impl CounterStore for SharedStore {
        async fn incr_by(
            &self,
            key: &str,
            amount: i64,
            ttl: Duration,
            guard: &str,
        ) -> SinkResult<bool> {
            self.0.incr_by(key, amount, ttl, guard).await
        }
        async fn add_to_set(
            &self,
            key: &str,
            members: &[String],
            ttl: Duration,
            guard: &str,
        ) -> SinkResult<bool> {
            self.0.add_to_set(key, members, ttl, guard).await
        }
        async fn incr_sorted(
            &self,
            key: &str,
            member: &str,
            amount: i64,
            guard: &str,
        ) -> SinkResult<bool> {
            self.0.incr_sorted(key, member, amount, guard).await
        }
    }

    /// Fails sorted-set updates a fixed number of times, after the other
    /// mutations of the batch already landed
    struct SortedSetOutage {
        inner: Arc<MemoryCounterStore>,
        failures_left: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl CounterStore for SortedSetOutage {
        async fn incr_by(
            &self,
            key: &str,
            amount: i64,
            ttl: Duration,
            guard: &str,
        ) -> SinkResult<bool> {
            self.inner.incr_by(key, amount, ttl, guard).await
        }
        async fn add_to_set(
            &self,
            key: &str,
            members: &[String],
            ttl: Duration,
            guard: &str,
        ) -> SinkResult<bool> {
            self.inner.add_to_set(key, members, ttl, guard).await
        }
        async fn incr_sorted(
            &self,
            key: &str,
            member: &str,
            amount: i64,
            guard: &str,
        ) -> SinkResult<bool> {
            use std::sync::atomic::Ordering;
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
            {
                return Err(SinkError::Transient {
                    sink: "cache".into(),
                    reason: "connection reset".into(),
                });
            }
            self.inner.incr_sorted(key, member, amount, guard).await
        }
    }

    fn shared_sink() -> (Arc<MemoryCounterStore>, CacheSink) {
        let store = Arc::new(MemoryCounterStore::new());
        let sink = CacheSink::new(Box::new(SharedStore(store.clone())), "user_activity:");
        (store, sink)
    }

    #[tokio::test]
    async fn test_counters_updated_from_windows() {
        let (store, sink) = shared_sink();
        let windows = vec![
            closed(
                MetricId::ActiveUsers,
                GroupKey::EventType("page_view".into()),
                2,
                5,
            ),
            closed(MetricId::PageViews, GroupKey::Page("/home".into()), 4, 4),
            closed(
                MetricId::ProductViews,
                GroupKey::Product("p-9".into()),
                3,
                3,
            ),
        ];
        sink.deliver(&batch_with(windows, &["u1", "u2"])).await.unwrap();

        assert_eq!(store.counter("user_activity:count:page_view"), 5);
        assert_eq!(
            store.sorted_score("user_activity:popular_pages", "/home"),
            4
        );
        assert_eq!(
            store.sorted_score("user_activity:popular_products", "p-9"),
            3
        );
        assert_eq!(
            store.set_members("user_activity:active_users"),
            vec!["u1".to_string(), "u2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_replayed_batch_is_skipped() {
        let (store, sink) = shared_sink();
        let batch = batch_with(
            vec![closed(
                MetricId::PageViews,
                GroupKey::Page("/home".into()),
                4,
                4,
            )],
            &["u1"],
        );

        sink.deliver(&batch).await.unwrap();
        sink.deliver(&batch).await.unwrap();

        assert_eq!(
            store.sorted_score("user_activity:popular_pages", "/home"),
            4
        );
    }

    #[tokio::test]
    async fn test_partial_failure_retry_does_not_double_count() {
        let store = Arc::new(MemoryCounterStore::new());
        let sink = CacheSink::new(
            Box::new(SortedSetOutage {
                inner: store.clone(),
                failures_left: std::sync::atomic::AtomicU32::new(1),
            }),
            "user_activity:",
        );
        let batch = batch_with(
            vec![
                closed(
                    MetricId::ActiveUsers,
                    GroupKey::EventType("page_view".into()),
                    2,
                    3,
                ),
                closed(MetricId::PageViews, GroupKey::Page("/home".into()), 4, 4),
            ],
            &["u1"],
        );

        // First delivery lands the counter, then dies on the sorted set
        assert!(sink.deliver(&batch).await.is_err());
        assert_eq!(store.counter("user_activity:count:page_view"), 3);

        // The retry must skip the counter and finish the rest
        sink.deliver(&batch).await.unwrap();
        assert_eq!(store.counter("user_activity:count:page_view"), 3);
        assert_eq!(
            store.sorted_score("user_activity:popular_pages", "/home"),
            4
        );
        assert_eq!(
            store.set_members("user_activity:active_users"),
            vec!["u1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_add_to_cart_has_no_cache_projection() {
        let (store, sink) = shared_sink();
        let batch = batch_with(
            vec![closed(
                MetricId::AddToCart,
                GroupKey::Product("p-1".into()),
                2,
                2,
            )],
            &[],
        );
        sink.deliver(&batch).await.unwrap();

        assert_eq!(store.sorted_score("user_activity:popular_products", "p-1"), 0);
    }
}
