//! HTTP lease service over the [`fence`] lease protocol.

pub mod cli;
pub mod config;
pub mod error;
pub mod server;

pub use cli::Cli;
pub use config::{BackendConfig, Config};
pub use error::ApiError;
pub use server::{router, AppState};
