//! Client side of the castkeeper daemon API.

pub mod client;

pub use client::{default_socket_path, DaemonClient, RpcError};
