//! Error taxonomy shared by the codec, the wire layer, the connection pool and cursors.
//!
//! # Overview
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is the single
//! [`Error`] enum defined here. The variants fall into four families:
//!
//! - Transport: [`Error::ConnectionFailure`], its retryable flavour [`Error::AutoReconnect`],
//!   the non-transient [`Error::Configuration`], pool exhaustion and raw I/O errors.
//! - Server: [`Error::OperationFailure`] for rejected commands and acknowledged writes.
//! - Caller misuse: [`Error::InvalidOperation`].
//! - Codec: [`Error::InvalidBson`], [`Error::InvalidDocument`], [`Error::InvalidName`],
//!   [`Error::InvalidStringData`] and [`Error::InvalidId`].
//!
//! Callers are expected to retry on [`Error::is_retryable`] and treat configuration or
//! misuse errors as defects.
use std::{io, time::Duration};

use thiserror::Error;

use crate::protocol::TransportError;

#[derive(Debug, Error)]
pub enum Error {
    /// A socket-level failure; the outcome of the last operation is unknown.
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    /// A transient connection failure. Retrying after rediscovery is reasonable.
    #[error("auto reconnect: {0}")]
    AutoReconnect(String),

    /// A node is not usable with the current configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No socket slot could be locked before the acquire timeout expired.
    #[error("pool exhausted: slot {slot} not available within {timeout:?}")]
    PoolExhausted { slot: usize, timeout: Duration },

    /// The server rejected a command or an acknowledged write reported an error.
    #[error("operation failure: {message}")]
    OperationFailure { message: String, code: Option<i32> },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid bson: {0}")]
    InvalidBson(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid string data: {0}")]
    InvalidStringData(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Io(e) => Error::Io(e),
            TransportError::Frame(message) => Error::ConnectionFailure(message),
        }
    }
}

impl Error {
    pub(crate) fn operation(message: impl Into<String>, code: Option<i32>) -> Self {
        Error::OperationFailure {
            message: message.into(),
            code,
        }
    }

    /// True for every error that belongs to the connection-failure family.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailure(_)
                | Error::AutoReconnect(_)
                | Error::Configuration(_)
                | Error::Io(_)
        )
    }

    /// True when the failure is believed transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::AutoReconnect(_))
    }

    /// Server error code carried by an [`Error::OperationFailure`], if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::OperationFailure { code, .. } => *code,
            _ => None,
        }
    }
}
