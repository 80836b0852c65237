//! # zrpc
//!
//! Asynchronous RPC over persistent streams with heartbeat liveness.
//!
//! One connection carries many concurrent exchanges. Each exchange is a
//! [`Channel`] keyed by the id of its first event, so replies are routed back
//! to their caller no matter how they interleave. While an exchange is open
//! both ends send heartbeats, and an exchange whose remote falls silent fails
//! with [`RpcError::LostRemote`] instead of waiting forever.
//!
//! ```no_run
//! # async fn demo() -> zrpc::Result<()> {
//! use zrpc::{Client, Server, Value};
//!
//! let server = Server::bind("tcp://127.0.0.1:4242").await?;
//! server
//!     .register_task("hello", |args: Vec<Value>| async move {
//!         let name = args.first().and_then(Value::as_str).unwrap_or("World");
//!         anyhow::Ok(Value::from(format!("Hello,{}", name)))
//!     })
//!     .await?;
//!
//! let client = Client::connect("tcp://127.0.0.1:4242").await?;
//! let reply = client.invoke("hello", vec![Value::from("World")]).await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use zrpc_proto as proto;

/// Error types for RPC operations
pub mod error;

/// Liveness and queue settings
pub mod config;

/// Endpoints, connecting and listening
pub mod transport;

/// Logical exchanges over a shared connection
pub mod channel;

/// Connection multiplexing and heartbeat supervision
pub mod multiplexer;

/// Client-side invocation
pub mod client;

/// Task registry and dispatch
pub mod server;

/// Typed decoding of reply arguments
pub mod reply;

pub use error::{RemoteException, RpcError};
pub use config::ChannelConfig;
pub use transport::Endpoint;
pub use channel::{Channel, ChannelState};
pub use multiplexer::{InboundCall, Multiplexer};
pub use client::{Client, ClientBuilder, StreamError};
pub use server::{Server, ServerBuilder, StreamTask, Task};
pub use reply::decode_args;
pub use zrpc_proto::{Event, Value};

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
