//! Typed views over reply arguments

use crate::{Result, RpcError};
use serde::de::DeserializeOwned;
use zrpc_proto::Value;

/// Decode ordered reply args into `T`
///
/// The args are read as one msgpack array, so structs and tuples are filled
/// positionally and a single-element reply can be read as a one-field tuple.
pub fn decode_args<T: DeserializeOwned>(args: &[Value]) -> Result<T> {
    let bytes = rmp_serde::to_vec(args).map_err(|e| RpcError::Encode(e.to_string()))?;
    rmp_serde::from_slice(&bytes).map_err(|e| RpcError::Decode(e.to_string()))
}
