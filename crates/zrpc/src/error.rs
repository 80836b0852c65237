//! Error types for the zrpc library

use std::fmt;
use thiserror::Error;
use zrpc_proto::{ProtocolError, Value};

/// Main error type for zrpc operations
#[derive(Debug, Error)]
pub enum RpcError {
    /// Transport connect or bind failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Endpoint string not understood
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Outgoing event could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// Incoming frame could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Remote stopped answering within the liveness threshold
    #[error("Lost remote after missing heartbeats")]
    LostRemote,

    /// The remote task raised an error
    #[error("Remote exception: {0}")]
    Remote(RemoteException),

    /// A task with this name is already registered
    #[error("Task already registered: {0}")]
    DuplicateTask(String),

    /// The channel or its multiplexer is gone
    #[error("Channel closed")]
    ChannelClosed,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// The remote exception, if this error carries one
    pub fn remote(&self) -> Option<&RemoteException> {
        match self {
            Self::Remote(exception) => Some(exception),
            _ => None,
        }
    }
}

impl From<ProtocolError> for RpcError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Encode(msg) => Self::Encode(msg),
            ProtocolError::Io(e) => Self::Io(e),
            ProtocolError::FrameTooLarge { size, max } => {
                Self::Encode(format!("frame too large: {} bytes (max: {})", size, max))
            }
            other => Self::Decode(other.to_string()),
        }
    }
}

/// Error reported by the remote side in an `ERR` event
///
/// Two argument layouts are understood: `[description]`, and the
/// `[name, description, traceback]` form used by other implementations.
/// The original args are kept untouched in [`RemoteException::args`].
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteException {
    /// Exception name, when the remote supplied one
    pub name: Option<String>,
    /// Human readable description
    pub description: String,
    /// Raw args of the `ERR` event
    pub args: Vec<Value>,
}

impl RemoteException {
    /// Build from the args of an `ERR` event
    pub fn from_args(args: Vec<Value>) -> Self {
        let strings: Vec<Option<&str>> = args.iter().map(Value::as_str).collect();
        let (name, description) = match strings.as_slice() {
            [Some(description)] => (None, description.to_string()),
            [Some(name), Some(description), ..] => {
                (Some(name.to_string()), description.to_string())
            }
            _ => (None, Value::Array(args.clone()).to_string()),
        };
        Self {
            name,
            description,
            args,
        }
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.description),
            None => write!(f, "{}", self.description),
        }
    }
}

impl std::error::Error for RemoteException {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_description() {
        let exception = RemoteException::from_args(vec![Value::from("boom")]);
        assert_eq!(exception.name, None);
        assert_eq!(exception.description, "boom");
        assert_eq!(exception.to_string(), "boom");
    }

    #[test]
    fn test_named_exception_with_traceback() {
        let exception = RemoteException::from_args(vec![
            Value::from("ValueError"),
            Value::from("bad input"),
            Value::from("Traceback ..."),
        ]);
        assert_eq!(exception.name.as_deref(), Some("ValueError"));
        assert_eq!(exception.description, "bad input");
        assert_eq!(exception.args.len(), 3);
        assert_eq!(exception.to_string(), "ValueError: bad input");
    }

    #[test]
    fn test_unstructured_args() {
        let exception = RemoteException::from_args(vec![Value::from(3)]);
        assert_eq!(exception.description, "[3]");

        let empty = RemoteException::from_args(Vec::new());
        assert_eq!(empty.description, "[]");
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: RpcError = ProtocolError::Decode("bad".to_string()).into();
        assert!(matches!(err, RpcError::Decode(_)));

        let err: RpcError = ProtocolError::InvalidFrame.into();
        assert!(matches!(err, RpcError::Decode(_)));

        let err = RpcError::Remote(RemoteException::from_args(vec![Value::from("x")]));
        assert_eq!(err.remote().map(|e| e.description.as_str()), Some("x"));
    }
}
