#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Named, time-bounded leases with fencing tokens, arbitrated by a
//! conditional key-value store.
//!
//! Every protocol operation is a single conditional update against a
//! [`store::ConditionalStore`]; the store is the only source of truth.

pub mod error;
pub mod memory;
pub mod protocol;
pub mod record;
pub mod sqlite;
pub mod store;
pub mod time;

pub mod test_utils;

pub use error::{Error, ErrorKind, Result};
pub use memory::InMemoryStore;
pub use protocol::LeaseProtocol;
pub use record::{Fence, LeaseRecord};
pub use sqlite::SqliteStore;
pub use store::{Condition, ConditionalStore, Mutation, StoreError, UpdateOutcome};
pub use time::{Clock, ManualClock, SystemClock, Timestamp};
