use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use crate::error::SessionError;
use crate::pool::UpstreamConn;

/// One client WebSocket's state: at most one pinned upstream connection and
/// the id of the last response chunk observed (spec §4.D). `upstream` and
/// `last_response_id` are independently locked so a reader of one never
/// blocks a writer of the other.
pub struct Session<C: UpstreamConn> {
    upstream: StdMutex<Option<Arc<C>>>,
    last_response_id: StdMutex<Option<String>>,
}

impl<C: UpstreamConn> Default for Session<C> {
    fn default() -> Self {
        Self { upstream: StdMutex::new(None), last_response_id: StdMutex::new(None) }
    }
}

impl<C: UpstreamConn> Session<C> {
    pub fn pin_upstream(&self, conn: Arc<C>) {
        *self.upstream.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn);
    }

    pub fn upstream(&self) -> Option<Arc<C>> {
        self.upstream.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Updates `last_response_id` only when the chunk actually carries one
    /// (spec §4.D).
    pub fn observe_response_id(&self, response_id: Option<&str>) {
        if let Some(id) = response_id {
            *self.last_response_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
        }
    }

    pub fn last_response_id(&self) -> Option<String> {
        self.last_response_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn close_pinned_upstream(&self) {
        let pinned = self.upstream.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(conn) = pinned {
            conn.close().await;
        }
    }

    /// Unpins the upstream without closing it: used when the caller has
    /// already handed the connection to `Pool::discard` itself (spec §4.I
    /// step 7, a mid-stream upstream error discards the connection without
    /// tearing down the whole session).
    pub fn clear_upstream(&self) {
        *self.upstream.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Tracks `client_conn → Session` with a hard cap on live sessions (spec
/// §4.D). A session's pinned upstream is request-scoped: removing the
/// session always closes it rather than returning it to the pool.
pub struct SessionManager<C: UpstreamConn> {
    sessions: StdMutex<HashMap<String, Arc<Session<C>>>>,
    max_connections: usize,
}

impl<C: UpstreamConn> SessionManager<C> {
    pub fn new(max_connections: usize) -> Self {
        Self { sessions: StdMutex::new(HashMap::new()), max_connections }
    }

    pub fn create(&self, client_conn: impl Into<String>) -> Result<Arc<Session<C>>, SessionError> {
        let client_conn = client_conn.into();
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if !sessions.contains_key(&client_conn) && sessions.len() >= self.max_connections {
            return Err(SessionError::ConnectionLimit { limit: self.max_connections });
        }
        let session = sessions.entry(client_conn).or_insert_with(|| Arc::new(Session::default()));
        Ok(Arc::clone(session))
    }

    pub fn get(&self, client_conn: &str) -> Option<Arc<Session<C>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).get(client_conn).cloned()
    }

    /// Idempotent: removing an unknown `client_conn` is a no-op.
    pub async fn remove(&self, client_conn: &str) {
        let removed = self.sessions.lock().unwrap_or_else(|e| e.into_inner()).remove(client_conn);
        if let Some(session) = removed {
            session.close_pinned_upstream().await;
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Snapshots the map, replaces it with an empty one, then closes every
    /// session's upstream outside the lock (spec §4.D).
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Session<C>>> = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *sessions).into_values().collect()
        };
        for session in drained {
            session.close_pinned_upstream().await;
        }
    }
}
