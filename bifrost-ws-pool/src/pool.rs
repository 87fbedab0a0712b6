use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::clock::MonotonicClock;
use crate::clock::RealClock;
use crate::error::PoolError;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifies one provider endpoint's connection bucket (spec §4.C
/// `PoolKey(provider, key_id, endpoint)`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub provider: String,
    pub key_id: String,
    pub endpoint: String,
}

/// A leased or idle upstream connection. Implementors are expected to be
/// internally thread-safe for one concurrent reader and one concurrent
/// writer (spec §4.C); the pool itself only ever touches `is_closed`.
#[async_trait]
pub trait UpstreamConn: Send + Sync + 'static {
    fn is_closed(&self) -> bool;
    async fn close(&self);
}

/// Dials a fresh connection for a pool key. Not in scope: the concrete
/// provider wire handshake; callers supply this per provider.
#[async_trait]
pub trait Dialer<C: UpstreamConn>: Send + Sync {
    async fn dial(&self, key: &PoolKey, headers: &HeaderMap) -> Result<C, PoolError>;
}

struct Slot<C> {
    conn: Arc<C>,
    created_at_millis: i64,
    last_used_millis: i64,
}

/// Caps applied on `Return` (spec §4.C): violating either closes the
/// connection instead of pooling it.
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub max_idle_per_key: usize,
    pub max_total_connections: usize,
    pub idle_timeout: Duration,
    pub max_connection_lifetime: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_idle_per_key: 4,
            max_total_connections: 256,
            idle_timeout: Duration::from_secs(90),
            max_connection_lifetime: Duration::from_secs(3600),
        }
    }
}

struct Inner<C> {
    buckets: StdMutex<HashMap<PoolKey, Vec<Slot<C>>>>,
    closed: AtomicBool,
    limits: PoolLimits,
    clock: Arc<dyn MonotonicClock>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

/// Lease/return pool of idle upstream WebSocket connections, keyed by
/// `(provider, key_id, endpoint)` (spec §4.C). The pool owns idle
/// connections; once leased via `get`, the caller owns the connection
/// until `return_conn`, `discard`, or pool `close`.
pub struct Pool<C: UpstreamConn> {
    inner: Arc<Inner<C>>,
}

impl<C: UpstreamConn> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<C: UpstreamConn> Pool<C> {
    pub fn new(limits: PoolLimits) -> Self {
        Self::with_clock(limits, Arc::new(RealClock::default()))
    }

    pub fn with_clock(limits: PoolLimits, clock: Arc<dyn MonotonicClock>) -> Self {
        let inner = Arc::new(Inner {
            buckets: StdMutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            limits,
            clock,
            sweeper: StdMutex::new(None),
        });
        let pool = Self { inner };
        pool.spawn_sweeper(DEFAULT_SWEEP_INTERVAL);
        pool
    }

    fn spawn_sweeper(&self, interval: Duration) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                sweep(&inner).await;
            }
        });
        *self.inner.sweeper.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn is_expired(&self, slot: &Slot<C>) -> bool {
        let now = self.inner.clock.now_millis();
        let age = now - slot.created_at_millis;
        let idle = now - slot.last_used_millis;
        age >= self.inner.limits.max_connection_lifetime.as_millis() as i64
            || idle >= self.inner.limits.idle_timeout.as_millis() as i64
    }

    /// Pops the most recently returned live connection for `key`, dialling
    /// a fresh one if the bucket is empty or every pooled entry was stale.
    pub async fn get(&self, key: &PoolKey, headers: &HeaderMap, dialer: &dyn Dialer<C>) -> Result<Arc<C>, PoolError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        loop {
            let candidate = {
                let mut buckets = self.inner.buckets.lock().unwrap_or_else(|e| e.into_inner());
                buckets.get_mut(key).and_then(|stack| stack.pop())
            };
            match candidate {
                Some(slot) if slot.conn.is_closed() || self.is_expired(&slot) => {
                    slot.conn.close().await;
                    continue;
                }
                Some(slot) => return Ok(slot.conn),
                None => {
                    let conn = tokio::time::timeout(DEFAULT_HANDSHAKE_TIMEOUT, dialer.dial(key, headers))
                        .await
                        .map_err(|_| PoolError::HandshakeTimeout {
                            endpoint: key.endpoint.clone(),
                            elapsed_ms: DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
                        })??;
                    return Ok(Arc::new(conn));
                }
            }
        }
    }

    /// Pushes `conn` back onto its bucket, subject to `MaxIdlePerKey` and
    /// `MaxTotalConnections`; violating either closes the connection
    /// instead of pooling it.
    pub async fn return_conn(&self, key: &PoolKey, conn: Arc<C>) {
        if self.inner.closed.load(Ordering::SeqCst) || conn.is_closed() {
            conn.close().await;
            return;
        }
        let now = self.inner.clock.now_millis();
        let should_close = {
            let mut buckets = self.inner.buckets.lock().unwrap_or_else(|e| e.into_inner());
            let total: usize = buckets.values().map(|v| v.len()).sum();
            let stack = buckets.entry(key.clone()).or_default();
            if stack.len() >= self.inner.limits.max_idle_per_key
                || total >= self.inner.limits.max_total_connections
            {
                true
            } else {
                stack.push(Slot { conn: Arc::clone(&conn), created_at_millis: now, last_used_millis: now });
                false
            }
        };
        if should_close {
            conn.close().await;
        }
    }

    pub async fn discard(&self, conn: Arc<C>) {
        conn.close().await;
    }

    /// Idempotent: closes every idle connection and refuses further `get`.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = self.inner.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        let drained: Vec<Slot<C>> = {
            let mut buckets = self.inner.buckets.lock().unwrap_or_else(|e| e.into_inner());
            buckets.drain().flat_map(|(_, stack)| stack).collect()
        };
        for slot in drained {
            slot.conn.close().await;
        }
    }
}

async fn sweep<C: UpstreamConn>(inner: &Inner<C>) {
    let now = inner.clock.now_millis();
    let expired: Vec<Arc<C>> = {
        let mut buckets = inner.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let mut expired = Vec::new();
        for stack in buckets.values_mut() {
            stack.retain(|slot| {
                let age = now - slot.created_at_millis;
                let idle = now - slot.last_used_millis;
                let expired_or_closed = slot.conn.is_closed()
                    || age >= inner.limits.max_connection_lifetime.as_millis() as i64
                    || idle >= inner.limits.idle_timeout.as_millis() as i64;
                if expired_or_closed {
                    expired.push(Arc::clone(&slot.conn));
                }
                !expired_or_closed
            });
        }
        expired
    };
    if !expired.is_empty() {
        trace!(count = expired.len(), "ws pool sweeper closed expired connections");
    }
    for conn in expired {
        conn.close().await;
    }
}
