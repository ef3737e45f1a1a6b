//! Error taxonomy for the synchronization engine

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Transient ledger/transport failure. Retried where it was issued.
    #[error("transport error: {0}")]
    Transport(String),

    /// Historical scan gave up after exhausting retries on one window
    #[error("backfill failed for {ticker} in blocks [{from_block}, {to_block}]: {reason}")]
    BackfillFailed { ticker: String, from_block: u64, to_block: u64, reason: String },

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("subscription lost: {0}")]
    SubscriptionLost(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        SyncError::Transport(err.to_string())
    }
}

impl From<sled::Error> for SyncError {
    fn from(err: sled::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::Config(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
