use thiserror::Error;

use crate::database::embedded::RedbError;
#[cfg(feature = "postgres")]
use crate::database::postgres::PgError;

/// Graph store errors
#[derive(Debug, Error)]
pub enum Error {
    /// a channel id that is neither a valid display form nor a raw id
    #[error("invalid channel id: {0}")]
    InvalidChannelId(String),
    /// a timestamp that cannot be parsed or is out of range
    #[error("invalid date: {0}")]
    InvalidDate(String),
    #[error("invalid network: {0}")]
    InvalidNetwork(String),
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("unknown edge activity type: {0}")]
    InvalidActivityType(String),
    /// a required argument or attribute is missing
    #[error("missing attribute: {0}")]
    MissingAttribute(String),
    #[error("unsupported comparator: {0}")]
    UnsupportedComparator(String),
    #[error("invalid expression: {0}")]
    InvalidExpression(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// a row could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),
    /// the operation needs a backend that is not configured
    #[error("not configured: {0}")]
    NotConfigured(&'static str),
    /// a conditional write precondition failed
    #[error("conditional check failed: {0}")]
    Conflict(String),
    /// the remote backend rejected the request for lack of capacity
    #[error("throughput exceeded: {0}")]
    Throughput(String),
    /// the authoritative source failed
    #[error("source error: {0}")]
    Source(String),
    /// underlying database error
    #[error("database error: {0}")]
    Redb(#[from] RedbError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    /// underlying database error
    Postgres(#[from] PgError),
    #[cfg(feature = "postgres")]
    #[error("connection pool error: {0}")]
    Pool(String),
}

impl Error {
    /// Malformed or missing input, detected before any I/O
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidChannelId(_)
                | Error::InvalidDate(_)
                | Error::InvalidNetwork(_)
                | Error::InvalidPublicKey(_)
                | Error::InvalidActivityType(_)
                | Error::MissingAttribute(_)
                | Error::UnsupportedComparator(_)
                | Error::InvalidExpression(_)
                | Error::InvalidConfig(_)
                | Error::Codec(_)
                | Error::NotConfigured(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Errors where re-reading and trying again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::Throughput(_))
    }
}
