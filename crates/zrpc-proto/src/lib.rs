//! # zrpc Protocol
//!
//! Wire definitions for zrpc: the dynamically typed [`Value`], the
//! `[header, name, args]` [`Event`] envelope with its [`EventCodec`], and the
//! length-prefixed [`FrameCodec`] that carries envelopes over byte streams.

#![warn(missing_docs)]

/// Dynamically typed argument values
pub mod value;

/// Event envelope and codec
pub mod event;

/// Length-prefixed framing for async streams
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use value::Value;
pub use event::{Event, EventCodec, Header};
pub use codec::FrameCodec;
pub use error::ProtocolError;
