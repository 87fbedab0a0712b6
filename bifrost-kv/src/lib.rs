//! TTL key-value store with gossip replication hooks (spec §4.B).

mod clock;
mod error;
mod store;

pub use clock::Clock;
pub use clock::FakeClock;
pub use clock::SystemClock;
pub use error::KvError;
pub use store::KvStore;
pub use store::ReplicationDelegate;
pub use store::TypeDecoder;
