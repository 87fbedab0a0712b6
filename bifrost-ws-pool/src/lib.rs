//! Upstream WebSocket pool and per-client session tracking (spec §4.C, §4.D).

mod clock;
mod error;
mod pool;
mod session;

pub use clock::FakeClock;
pub use clock::MonotonicClock;
pub use clock::RealClock;
pub use error::PoolError;
pub use error::SessionError;
pub use pool::DEFAULT_HANDSHAKE_TIMEOUT;
pub use pool::Dialer;
pub use pool::Pool;
pub use pool::PoolKey;
pub use pool::PoolLimits;
pub use pool::UpstreamConn;
pub use session::Session;
pub use session::SessionManager;
