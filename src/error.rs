//! Error types for activity-relay.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The subscription scope does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("store query timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Failures the poller absorbs by retrying on the next tick.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Store(e) => is_transient_sqlx(e),
            Error::StoreTimeout(_) | Error::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// Connection and contention failures. Decode and schema errors are bugs
/// and never heal on retry.
fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| {
            // 08: connection exception, 53: insufficient resources,
            // 57P0x: server shutting down, 40001/40P01: serialization, deadlock.
            code.starts_with("08")
                || code.starts_with("53")
                || code.starts_with("57P0")
                || code == "40001"
                || code == "40P01"
        }),
        _ => false,
    }
}


pub type Result<T> = std::result::Result<T, Error>;
