//! JSON-RPC API for daemon IPC.
//!
//! This module provides a JSON-RPC interface for communication between
//! the castkeeper CLI (or the podcast app backend) and the castkeeperd daemon.

pub mod handlers;
pub mod server;
pub mod types;

pub use handlers::{token_error, ApiState, CastkeeperApiImpl, CastkeeperApiServer};
pub use server::{start_server, ServerHandle};
pub use types::*;
