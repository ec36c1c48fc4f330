//! Client for the userspace NVMe-oF target daemon's JSON-RPC control socket.
//!
//! [`client`] carries the transport, [`methods`] the typed calls, and
//! [`types`] the decoded responses. The `mock` feature adds an in-memory
//! daemon for tests.

pub mod client;
pub mod error;
pub mod methods;
#[cfg(feature = "mock")]
pub mod mock;
pub mod types;

pub use client::{Connect, DEFAULT_SOCKET_PATH, JsonRpcClient, RpcClient, UnixConnector};
pub use error::{Result, RpcError};
pub use methods::{AddHost, CreateSubsystem, CreateTransport, NamespaceParams, SpdkRpc};
pub use types::*;
