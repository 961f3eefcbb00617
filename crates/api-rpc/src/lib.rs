//! JSON-RPC API Layer
//!
//! Thin adapter over the job orchestrator. Every job method names the
//! session token returned by `session.open.v1`.

pub mod error;
pub mod handler;
pub mod server;
pub mod types;

pub use handler::RpcHandler;
pub use server::{RpcServer, RpcServerConfig};
