use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("key must not be empty")]
    EmptyKey,
    #[error("ttl must be >= 0, got {0}ms")]
    NegativeTtl(i64),
    #[error("store is closed")]
    Closed,
    #[error("key not found")]
    NotFound,
}
