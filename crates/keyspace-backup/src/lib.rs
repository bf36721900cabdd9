pub mod backup;
pub mod cluster;
pub mod collab;
pub mod compress;
pub mod config;
pub mod error;
pub mod history;
pub mod log_sanitize;
pub mod logging;
mod process;
pub mod remote;
pub mod restore;
pub mod snapshot;
pub mod store;

pub use error::{Error, Result};
