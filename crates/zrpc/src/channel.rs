//! Logical RPC exchanges multiplexed over one connection

use crate::multiplexer::Shared;
use crate::{Result, RpcError};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use zrpc_proto::event::{ERR, STREAM};
use zrpc_proto::{Event, Header, Value};

/// Client-side progress of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Opened, nothing sent yet
    Idle,
    /// Request sent, waiting for the remote
    Sent,
    /// A reply event arrived
    Received,
    /// A `STREAM` event arrived and more are expected
    Streaming,
    /// The remote answered with `ERR`
    ErrGotten,
    /// The remote went silent past the liveness threshold
    Lost,
    /// Closed and unregistered
    ///
    /// [`Channel::close`] consumes the channel, so this terminal state is
    /// implied and never returned by [`Channel::state`].
    Closed,
}

/// One logical exchange with its own inbound queue and error slot
///
/// The owning multiplexer only keeps a lookup entry keyed by [`Channel::id`].
/// Dropping a channel unregisters it; [`Channel::close`] does so immediately.
pub struct Channel {
    id: String,
    events: mpsc::Receiver<Event>,
    error: oneshot::Receiver<RpcError>,
    failed: bool,
    state: ChannelState,
    inbound: bool,
    shared: Arc<Shared>,
    closed: bool,
}

impl Channel {
    pub(crate) fn new(
        id: String,
        events: mpsc::Receiver<Event>,
        error: oneshot::Receiver<RpcError>,
        inbound: bool,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            events,
            error,
            failed: false,
            state: ChannelState::Idle,
            inbound,
            shared,
            closed: false,
        }
    }

    /// Correlation id of this exchange
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether the remote opened this exchange
    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    /// Send an event on this exchange and keep its heartbeat running
    ///
    /// The first event of a locally opened exchange carries the channel id as
    /// its `message_id`; every other event gets a fresh id and points back at
    /// the channel through `response_to`.
    pub async fn send_event(&mut self, name: &str, args: Vec<Value>) -> Result<()> {
        let header = if self.state == ChannelState::Idle && !self.inbound {
            Header {
                message_id: self.id.clone(),
                ..Header::new()
            }
        } else {
            Header::response_to(self.id.clone())
        };

        self.shared
            .send(&Event::with_header(header, name, args))
            .await?;

        if self.state == ChannelState::Idle {
            self.state = ChannelState::Sent;
        }
        self.shared.start_heartbeat(&self.id).await;
        Ok(())
    }

    /// Wait for the next event or for the error slot, whichever comes first
    pub async fn recv(&mut self) -> Result<Event> {
        let result = tokio::select! {
            biased;
            event = self.events.recv() => event.ok_or(RpcError::ChannelClosed),
            err = &mut self.error, if !self.failed => {
                self.failed = true;
                Err(err.unwrap_or(RpcError::ChannelClosed))
            }
        };

        match &result {
            Ok(event) if event.name == ERR => self.state = ChannelState::ErrGotten,
            Ok(event) if event.name == STREAM => self.state = ChannelState::Streaming,
            Ok(_) => self.state = ChannelState::Received,
            Err(RpcError::LostRemote) => self.state = ChannelState::Lost,
            Err(_) => {}
        }
        result
    }

    /// Stop the heartbeat and unregister from the multiplexer
    pub async fn close(mut self) {
        self.closed = true;
        self.shared.unregister(&self.id).await;
        debug!("Closed channel {}", self.id);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.closed {
            self.shared.unregister_later(&self.id);
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}
