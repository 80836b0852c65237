//! Client-side invocation
//!
//! Every call opens its own channel on the client's single connection, sends
//! one request event and then waits on that channel only. The channel is
//! closed however the call ends.

use crate::config::ChannelConfig;
use crate::error::RemoteException;
use crate::multiplexer::Multiplexer;
use crate::reply::decode_args;
use crate::transport::{self, Endpoint};
use crate::{Channel, Result, RpcError};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use zrpc_proto::event::{ERR, OK, STREAM};
use zrpc_proto::Value;

/// Failure of a streaming call, with whatever arrived before it
///
/// For an `ERR` event the last element of `received` holds the error's args.
/// Transport and liveness failures leave `received` empty.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct StreamError {
    /// Items received before the failure
    pub received: Vec<Vec<Value>>,
    /// What went wrong
    #[source]
    pub source: RpcError,
}

impl StreamError {
    fn empty(source: RpcError) -> Self {
        Self {
            received: Vec::new(),
            source,
        }
    }
}

impl From<StreamError> for RpcError {
    fn from(err: StreamError) -> Self {
        err.source
    }
}

/// Builder for configuring a client
pub struct ClientBuilder {
    endpoint: String,
    config: ChannelConfig,
}

impl ClientBuilder {
    /// Create a new client builder
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            config: ChannelConfig::default(),
        }
    }

    /// Set the heartbeat interval; the liveness threshold is twice this
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the per-channel inbound queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the largest frame accepted or produced
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Connect and start the multiplexer
    pub async fn connect(self) -> Result<Client> {
        let endpoint: Endpoint = self.endpoint.parse()?;
        let connection = transport::connect(&endpoint).await?;
        info!("Connected to {}", endpoint);

        Ok(Client {
            mux: Multiplexer::new(connection, self.config),
            endpoint,
        })
    }
}

/// RPC client bound to one connection
pub struct Client {
    mux: Multiplexer,
    endpoint: Endpoint,
}

impl Client {
    /// Connect to `endpoint` with default settings
    pub async fn connect(endpoint: &str) -> Result<Self> {
        ClientBuilder::new(endpoint).connect().await
    }

    /// Start configuring a client
    pub fn builder(endpoint: &str) -> ClientBuilder {
        ClientBuilder::new(endpoint)
    }

    /// Endpoint this client is connected to
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Call `name` and wait for its single reply
    ///
    /// An `ERR` reply becomes [`RpcError::Remote`], whose
    /// [`RemoteException::args`] keep the reply args. If the remote stops
    /// sending heartbeats the call fails with [`RpcError::LostRemote`].
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        debug!("Invoking {} with {} args", name, args.len());
        let mut channel = self.mux.open_channel().await?;
        let result = invoke_on(&mut channel, name, args).await;
        channel.close().await;
        result
    }

    /// Call a streaming task and collect every item it sends
    ///
    /// `STREAM` events accumulate; `OK` adds its args and ends the call;
    /// `ERR` adds its args and ends it with an error. Any other event name
    /// ends the call successfully without adding anything, which is how a
    /// `STREAM_DONE` terminator is handled.
    pub async fn invoke_stream(
        &self,
        name: &str,
        args: Vec<Value>,
    ) -> std::result::Result<Vec<Vec<Value>>, StreamError> {
        debug!("Invoking {} with {} args in streaming mode", name, args.len());
        let mut channel = self.mux.open_channel().await.map_err(StreamError::empty)?;
        let result = invoke_stream_on(&mut channel, name, args).await;
        channel.close().await;
        result
    }

    /// Call `name` and decode the reply args positionally into `T`
    pub async fn invoke_reply<T>(&self, name: &str, args: Vec<Value>) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let reply = self.invoke(name, args).await?;
        decode_args(&reply)
    }

    /// Shut the connection down, failing calls still in flight
    pub async fn close(mut self) {
        self.mux.shutdown().await;
        info!("Closed client for {}", self.endpoint);
    }
}

async fn invoke_on(channel: &mut Channel, name: &str, args: Vec<Value>) -> Result<Vec<Value>> {
    channel.send_event(name, args).await?;
    let reply = channel.recv().await?;

    if reply.name == ERR {
        Err(RpcError::Remote(RemoteException::from_args(reply.args)))
    } else {
        Ok(reply.args)
    }
}

async fn invoke_stream_on(
    channel: &mut Channel,
    name: &str,
    args: Vec<Value>,
) -> std::result::Result<Vec<Vec<Value>>, StreamError> {
    channel.send_event(name, args).await.map_err(StreamError::empty)?;

    let mut received = Vec::new();
    loop {
        // Liveness and transport failures discard what was streamed so far
        let event = channel.recv().await.map_err(StreamError::empty)?;
        match event.name.as_str() {
            STREAM => received.push(event.args),
            OK => {
                received.push(event.args);
                return Ok(received);
            }
            ERR => {
                let exception = RemoteException::from_args(event.args.clone());
                received.push(event.args);
                return Err(StreamError {
                    received,
                    source: RpcError::Remote(exception),
                });
            }
            other => {
                debug!("Stream on channel {} ended by {}", channel.id(), other);
                return Ok(received);
            }
        }
    }
}
