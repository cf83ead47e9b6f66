//! User-facing error type returned by every fallible SDK operation.

use serde::{Deserialize, Serialize};

use crate::status::StatusCode;

/// Error kind surfaced to SDK callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    BadParam,
    System,
    NoAuth,
    Timeout,
    Busy,
    TxnFail,
    NotImplemented,
}

/// An error kind plus a human-readable reason.
///
/// The batch engine maps transport and server statuses onto this type before
/// any user callback runs; no panic crosses an RPC boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {reason}")]
pub struct ErrorCode {
    pub kind: ErrorKind,
    pub reason: String,
}

impl ErrorCode {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, reason)
    }

    pub fn bad_param(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadParam, reason)
    }

    pub fn system(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, reason)
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, reason)
    }

    pub fn busy(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, reason)
    }

    /// Map a master-side status onto the user-facing kind space.
    pub fn from_master_status(status: StatusCode) -> Option<Self> {
        let kind = match status {
            StatusCode::MasterOk | StatusCode::Ok => return None,
            StatusCode::TableNotExist | StatusCode::TableNotFound => ErrorKind::NotFound,
            StatusCode::TableExist
            | StatusCode::InvalidArgument
            | StatusCode::TableStatusDisable
            | StatusCode::TableStatusEnable => ErrorKind::BadParam,
            StatusCode::NotPermission => ErrorKind::NoAuth,
            StatusCode::TxnFail => ErrorKind::TxnFail,
            _ => ErrorKind::System,
        };
        Some(Self::new(kind, format!("master status: {status}")))
    }
}

pub type SdkResult<T> = Result<T, ErrorCode>;
