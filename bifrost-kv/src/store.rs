use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::trace;

use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::error::KvError;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Absolute nanoseconds since the epoch; 0 means "never expires".
    expires_at: i64,
}

impl Entry {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at != 0 && self.expires_at <= now
    }
}

/// Gossip hook: fired on every locally-originated mutation so a caller can
/// fan the change out to peers. `SetRemote` never calls this (spec §4.B
/// "prevents gossip loops").
pub trait ReplicationDelegate: Send + Sync {
    fn on_set(&self, key: &str, value: &Value, expires_at: i64);
    fn on_delete(&self, key: &str);
}

/// Reconstructs a concrete value from the raw JSON bytes a gossip peer sent
/// for `SetRemote`. The registration table is walked in registration order;
/// the first prefix match wins (spec §4.B).
pub type TypeDecoder = Box<dyn Fn(&[u8]) -> Option<Value> + Send + Sync>;

struct Inner {
    data: RwLock<HashMap<String, Entry>>,
    closed: AtomicBool,
    clock: Arc<dyn Clock>,
    default_ttl_nanos: i64,
    decoders: StdMutex<Vec<(String, TypeDecoder)>>,
    delegate: StdMutex<Option<Arc<dyn ReplicationDelegate>>>,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

/// In-memory TTL map with lazy eviction, a background sweeper, and a gossip
/// replication hook (spec §4.B). Cheaply cloneable; clones share one
/// underlying map.
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<Inner>,
}

impl KvStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self::with_clock_and_interval(default_ttl, Arc::new(SystemClock), DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_clock(default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self::with_clock_and_interval(default_ttl, clock, DEFAULT_SWEEP_INTERVAL)
    }

    /// A non-positive `sweep_interval` is normalised to the default 30s
    /// (spec §4.B sweeper invariant).
    pub fn with_clock_and_interval(default_ttl: Duration, clock: Arc<dyn Clock>, sweep_interval: Duration) -> Self {
        let sweep_interval = if sweep_interval.is_zero() { DEFAULT_SWEEP_INTERVAL } else { sweep_interval };
        let inner = Arc::new(Inner {
            data: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            clock,
            default_ttl_nanos: default_ttl.as_nanos() as i64,
            decoders: StdMutex::new(Vec::new()),
            delegate: StdMutex::new(None),
            sweeper: StdMutex::new(None),
        });

        let store = Self { inner };
        store.spawn_sweeper(sweep_interval);
        store
    }

    fn spawn_sweeper(&self, interval: Duration) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                let now = inner.clock.now_nanos();
                let mut data = inner.data.write().await;
                let before = data.len();
                data.retain(|_, entry| !entry.is_expired(now));
                let reaped = before - data.len();
                if reaped > 0 {
                    trace!(reaped, "kv sweeper reaped expired entries");
                }
            }
        });
        *self.inner.sweeper.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub fn set_replication_delegate(&self, delegate: Arc<dyn ReplicationDelegate>) {
        *self.inner.delegate.lock().unwrap_or_else(|e| e.into_inner()) = Some(delegate);
    }

    /// Registers a decoder for keys starting with `prefix`; first match wins.
    pub fn register_type_decoder(&self, prefix: impl Into<String>, decoder: TypeDecoder) {
        self.inner.decoders.lock().unwrap_or_else(|e| e.into_inner()).push((prefix.into(), decoder));
    }

    fn check_open(&self) -> Result<(), KvError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(KvError::Closed);
        }
        Ok(())
    }

    fn check_key(key: &str) -> Result<(), KvError> {
        if key.is_empty() {
            return Err(KvError::EmptyKey);
        }
        Ok(())
    }

    fn expires_at_for(&self, ttl_ms: Option<i64>) -> Result<i64, KvError> {
        match ttl_ms {
            None => Ok(if self.inner.default_ttl_nanos == 0 {
                0
            } else {
                self.inner.clock.now_nanos() + self.inner.default_ttl_nanos
            }),
            Some(ms) if ms < 0 => Err(KvError::NegativeTtl(ms)),
            Some(0) => Ok(0),
            Some(ms) => Ok(self.inner.clock.now_nanos() + ms * 1_000_000),
        }
    }

    fn notify_set(&self, key: &str, value: &Value, expires_at: i64) {
        if let Some(delegate) = self.inner.delegate.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            delegate.on_set(key, value, expires_at);
        }
    }

    fn notify_delete(&self, key: &str) {
        if let Some(delegate) = self.inner.delegate.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            delegate.on_delete(key);
        }
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<(), KvError> {
        self.set_with_ttl_ms(key, value, None).await
    }

    pub async fn set_with_ttl(&self, key: &str, value: Value, ttl_ms: i64) -> Result<(), KvError> {
        self.set_with_ttl_ms(key, value, Some(ttl_ms)).await
    }

    async fn set_with_ttl_ms(&self, key: &str, value: Value, ttl_ms: Option<i64>) -> Result<(), KvError> {
        self.check_open()?;
        Self::check_key(key)?;
        let expires_at = self.expires_at_for(ttl_ms)?;
        {
            let mut data = self.inner.data.write().await;
            data.insert(key.to_string(), Entry { value: value.clone(), expires_at });
        }
        self.notify_set(key, &value, expires_at);
        Ok(())
    }

    /// Returns `true` iff the insert actually happened: an existing expired
    /// key counts as absent (spec §8 Testable Property 5).
    pub async fn set_if_absent(&self, key: &str, value: Value, ttl_ms: i64) -> Result<bool, KvError> {
        self.check_open()?;
        Self::check_key(key)?;
        let expires_at = self.expires_at_for(Some(ttl_ms))?;
        let now = self.inner.clock.now_nanos();
        let inserted = {
            let mut data = self.inner.data.write().await;
            let occupied_and_live = data.get(key).is_some_and(|e| !e.is_expired(now));
            if occupied_and_live {
                false
            } else {
                data.insert(key.to_string(), Entry { value: value.clone(), expires_at });
                true
            }
        };
        if inserted {
            self.notify_set(key, &value, expires_at);
        }
        Ok(inserted)
    }

    /// Applies a gossiped absolute timestamp without firing the replication
    /// delegate (spec §4.B "prevents gossip loops"). Walks registered type
    /// decoders by prefix, first match wins; falls back to plain JSON.
    pub async fn set_remote(&self, key: &str, json_bytes: &[u8], expires_at: i64) -> Result<(), KvError> {
        self.check_open()?;
        Self::check_key(key)?;
        let value = self.decode_remote(key, json_bytes);
        let mut data = self.inner.data.write().await;
        data.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    fn decode_remote(&self, key: &str, json_bytes: &[u8]) -> Value {
        let decoders = self.inner.decoders.lock().unwrap_or_else(|e| e.into_inner());
        for (prefix, decode) in decoders.iter() {
            if key.starts_with(prefix.as_str())
                && let Some(value) = decode(json_bytes)
            {
                return value;
            }
        }
        serde_json::from_slice(json_bytes).unwrap_or(Value::Null)
    }

    /// Lazy eviction with a double-checked lock: a fast path under the read
    /// lock, then a confirm-and-delete under the write lock so concurrent
    /// readers never observe an expired entry (spec §4.B invariant).
    pub async fn get(&self, key: &str) -> Result<Value, KvError> {
        self.check_open()?;
        Self::check_key(key)?;
        let now = self.inner.clock.now_nanos();
        {
            let data = self.inner.data.read().await;
            match data.get(key) {
                Some(entry) if !entry.is_expired(now) => return Ok(entry.value.clone()),
                Some(_) => {}
                None => return Err(KvError::NotFound),
            }
        }
        let mut data = self.inner.data.write().await;
        match data.get(key) {
            Some(entry) if entry.is_expired(now) => {
                data.remove(key);
                Err(KvError::NotFound)
            }
            Some(entry) => Ok(entry.value.clone()),
            None => Err(KvError::NotFound),
        }
    }

    pub async fn get_and_delete(&self, key: &str) -> Result<Value, KvError> {
        self.check_open()?;
        Self::check_key(key)?;
        let now = self.inner.clock.now_nanos();
        let removed = {
            let mut data = self.inner.data.write().await;
            match data.remove(key) {
                Some(entry) if !entry.is_expired(now) => Some(entry.value),
                _ => None,
            }
        };
        match removed {
            Some(value) => {
                self.notify_delete(key);
                Ok(value)
            }
            None => Err(KvError::NotFound),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool, KvError> {
        self.check_open()?;
        Self::check_key(key)?;
        let deleted = {
            let mut data = self.inner.data.write().await;
            data.remove(key).is_some()
        };
        if deleted {
            self.notify_delete(key);
        }
        Ok(deleted)
    }

    /// Updates the expiry of an existing, non-expired key.
    pub async fn touch(&self, key: &str, ttl_ms: i64) -> Result<(), KvError> {
        self.check_open()?;
        Self::check_key(key)?;
        if ttl_ms < 0 {
            return Err(KvError::NegativeTtl(ttl_ms));
        }
        let expires_at = self.expires_at_for(Some(ttl_ms))?;
        let now = self.inner.clock.now_nanos();
        let mut data = self.inner.data.write().await;
        match data.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = expires_at;
                Ok(())
            }
            _ => Err(KvError::NotFound),
        }
    }

    /// Opportunistically reaps expired entries while counting.
    pub async fn len(&self) -> usize {
        if self.inner.closed.load(Ordering::SeqCst) {
            return 0;
        }
        let now = self.inner.clock.now_nanos();
        let mut data = self.inner.data.write().await;
        data.retain(|_, entry| !entry.is_expired(now));
        data.len()
    }

    /// Idempotent: stops the sweeper and causes future mutating operations
    /// to return `KvError::Closed`.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = self.inner.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        debug!("kv store closed");
    }
}
