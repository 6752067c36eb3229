use thiserror::Error;

use crate::{record::Fence, store::StoreError};

/// Which side of the wire a failure belongs to.
///
/// Client faults are expected outcomes the caller can act on (back off,
/// re-acquire, fix the request). Server faults are infrastructure trouble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ClientFault,
    ServerFault,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("lease {name:?} is held by another client")]
    LeaseHeld { name: String },

    /// `fence` is `None` when the caller presented a negative fence.
    #[error("lease {name:?} has expired or {}", stale_fence(.fence.as_ref()))]
    LeaseExpiredOrFenced { name: String, fence: Option<Fence> },

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::LeaseHeld { .. }
            | Error::LeaseExpiredOrFenced { .. }
            | Error::MalformedInput(_) => ErrorKind::ClientFault,
            Error::StoreUnavailable(_) => ErrorKind::ServerFault,
        }
    }
}

fn stale_fence(fence: Option<&Fence>) -> String {
    match fence {
        Some(fence) => format!("fence {fence} is stale"),
        None => "fence is negative".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
