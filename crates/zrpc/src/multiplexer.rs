//! Connection multiplexing and heartbeat liveness
//!
//! A [`Multiplexer`] owns one physical connection and runs three tasks on it:
//!
//! - a writer that is the only code touching the write half, so frames from
//!   concurrently open channels are never interleaved;
//! - a receive loop that decodes every frame and routes it by correlation id,
//!   either into an open [`Channel`] or, when nothing matches, to the server
//!   side as a new [`InboundCall`];
//! - a heartbeat sweeper that ticks once per interval, emits heartbeats for
//!   every active channel and fails channels whose remote has been silent for
//!   longer than the liveness threshold.

use crate::channel::Channel;
use crate::config::ChannelConfig;
use crate::transport::Connection;
use crate::{Result, RpcError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zrpc_proto::{Event, EventCodec, FrameCodec};

/// Outbound frames waiting for the writer
const OUTBOUND_CAPACITY: usize = 1024;

/// A new exchange opened by the remote
#[derive(Debug)]
pub struct InboundCall {
    /// Channel to reply on
    pub channel: Channel,
    /// The event that opened the exchange
    pub event: Event,
}

/// Lookup entry for an open channel
struct ChannelEntry {
    events: mpsc::Sender<Event>,
    error: Option<oneshot::Sender<RpcError>>,
    last_seen: Instant,
    heartbeat: bool,
}

/// State shared between the multiplexer tasks and its channels
pub(crate) struct Shared {
    channels: Mutex<HashMap<String, ChannelEntry>>,
    outbound: mpsc::Sender<Bytes>,
    encoder: FrameCodec,
    closed_tx: mpsc::UnboundedSender<String>,
    connected: AtomicBool,
    config: ChannelConfig,
}

impl Shared {
    /// Create and register a channel
    async fn register(self: &Arc<Self>, id: String, inbound: bool) -> Channel {
        let (events_tx, events_rx) = mpsc::channel(self.config.queue_capacity);
        let (error_tx, error_rx) = oneshot::channel();

        let entry = ChannelEntry {
            events: events_tx,
            error: Some(error_tx),
            last_seen: Instant::now(),
            heartbeat: false,
        };
        self.channels.lock().await.insert(id.clone(), entry);

        debug!("Opened channel {} (inbound={})", id, inbound);
        Channel::new(id, events_rx, error_rx, inbound, Arc::clone(self))
    }

    /// Encode an event and queue it for the writer
    pub(crate) async fn send(&self, event: &Event) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RpcError::Connection("connection closed".to_string()));
        }

        let payload = EventCodec::encode(event)?;
        let frame = self.encoder.encode_frame(&payload)?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| RpcError::ChannelClosed)
    }

    /// Start heartbeat emission for a channel; a no-op when already running
    pub(crate) async fn start_heartbeat(&self, id: &str) {
        let mut channels = self.channels.lock().await;
        if let Some(entry) = channels.get_mut(id) {
            if !entry.heartbeat {
                entry.heartbeat = true;
                entry.last_seen = Instant::now();
            }
        }
    }

    /// Remove a channel's lookup entry
    pub(crate) async fn unregister(&self, id: &str) {
        self.channels.lock().await.remove(id);
    }

    /// Remove a channel's lookup entry from a synchronous context
    pub(crate) fn unregister_later(&self, id: &str) {
        // The sweeper drains this queue; if it is gone the map goes with it
        let _ = self.closed_tx.send(id.to_string());
    }

    /// Deliver a decoded frame to its channel or to the inbound queue
    async fn route(self: &Arc<Self>, event: Event, inbound: Option<&mpsc::Sender<InboundCall>>) {
        let id = event.correlation_id().to_string();

        let sender = {
            let mut channels = self.channels.lock().await;
            match channels.get_mut(&id) {
                Some(entry) => {
                    entry.last_seen = Instant::now();
                    if event.is_heartbeat() {
                        return;
                    }
                    Some(entry.events.clone())
                }
                None => None,
            }
        };

        match sender {
            // Never wait on one channel: the receive loop serves all of them
            Some(sender) => match sender.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    warn!("Channel {} queue is full, dropping {} event", id, event.name);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Channel {} went away before delivery", id);
                    self.unregister(&id).await;
                }
            },
            None => self.accept(id, event, inbound).await,
        }
    }

    /// Handle a frame that matches no open channel
    async fn accept(self: &Arc<Self>, id: String, event: Event, inbound: Option<&mpsc::Sender<InboundCall>>) {
        if event.is_heartbeat() {
            debug!("Dropping heartbeat for closed channel {}", id);
            return;
        }
        if event.header.response_to.is_some() {
            debug!("Dropping late {} event for closed channel {}", event.name, id);
            return;
        }
        let Some(inbound) = inbound else {
            warn!("Dropping unsolicited {} event {}: no server on this connection", event.name, id);
            return;
        };

        let channel = self.register(id, true).await;
        // The caller keeps hearing from us while the task runs
        self.start_heartbeat(channel.id()).await;
        if inbound.send(InboundCall { channel, event }).await.is_err() {
            warn!("Server dispatch queue closed, dropping inbound exchange");
        }
    }

    /// Emit heartbeats and fail channels whose remote went silent
    async fn sweep(&self) {
        let now = Instant::now();
        let threshold = self.config.liveness_threshold();
        let mut beats = Vec::new();

        {
            let mut channels = self.channels.lock().await;
            for (id, entry) in channels.iter_mut() {
                if !entry.heartbeat {
                    continue;
                }
                if now.duration_since(entry.last_seen) > threshold {
                    warn!("Channel {} lost its remote after {:?} of silence", id, threshold);
                    entry.heartbeat = false;
                    if let Some(error) = entry.error.take() {
                        let _ = error.send(RpcError::LostRemote);
                    }
                    continue;
                }
                beats.push(Event::heartbeat(id));
            }
        }

        for beat in beats {
            let frame = EventCodec::encode(&beat)
                .and_then(|payload| self.encoder.encode_frame(&payload));
            match frame {
                Ok(frame) => {
                    if self.outbound.try_send(frame).is_err() {
                        debug!("Outbound queue full, skipping heartbeat");
                    }
                }
                Err(e) => error!("Failed to encode heartbeat: {}", e),
            }
        }
    }

    /// Fail every open channel, e.g. when the connection is gone
    async fn fail_all<F>(&self, make_error: F)
    where
        F: Fn() -> RpcError,
    {
        self.connected.store(false, Ordering::SeqCst);
        let mut channels = self.channels.lock().await;
        for entry in channels.values_mut() {
            entry.heartbeat = false;
            if let Some(error) = entry.error.take() {
                let _ = error.send(make_error());
            }
        }
    }
}

/// Owner of one physical connection and all channels on it
pub struct Multiplexer {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Multiplexer {
    /// Start a multiplexer that only opens exchanges (client side)
    pub fn new<C: Connection>(connection: C, config: ChannelConfig) -> Self {
        Self::start(connection, config, None)
    }

    /// Start a multiplexer that hands unmatched exchanges to `inbound`
    pub fn with_inbound<C: Connection>(
        connection: C,
        config: ChannelConfig,
        inbound: mpsc::Sender<InboundCall>,
    ) -> Self {
        Self::start(connection, config, Some(inbound))
    }

    fn start<C: Connection>(
        connection: C,
        config: ChannelConfig,
        inbound: Option<mpsc::Sender<InboundCall>>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(connection);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            channels: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            encoder: FrameCodec::with_max_frame_size(config.max_frame_size),
            closed_tx,
            connected: AtomicBool::new(true),
            config: config.clone(),
        });

        let tasks = vec![
            tokio::spawn(write_loop(writer, outbound_rx, Arc::clone(&shared), shutdown_rx.clone())),
            tokio::spawn(read_loop(
                reader,
                FrameCodec::with_max_frame_size(config.max_frame_size),
                Arc::clone(&shared),
                inbound,
                shutdown_rx.clone(),
            )),
            tokio::spawn(heartbeat_loop(Arc::clone(&shared), closed_rx, shutdown_rx)),
        ];

        Self {
            shared,
            shutdown_tx,
            tasks,
        }
    }

    /// Open a new exchange with a fresh id
    pub async fn open_channel(&self) -> Result<Channel> {
        if !self.is_connected() {
            return Err(RpcError::Connection("connection closed".to_string()));
        }
        Ok(self.shared.register(Uuid::new_v4().to_string(), false).await)
    }

    /// Number of channels currently registered
    pub async fn channel_count(&self) -> usize {
        self.shared.channels.lock().await.len()
    }

    /// Whether the connection is still usable
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Stop all tasks and fail in-flight exchanges with [`RpcError::ChannelClosed`]
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Multiplexer task ended abnormally: {}", e);
            }
        }
        self.shared.fail_all(|| RpcError::ChannelClosed).await;
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn write_loop<C: AsyncWrite>(
    mut writer: WriteHalf<C>,
    mut outbound: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let written = match writer.write_all(&frame).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    error!("Failed to write frame: {}", e);
                    shared.fail_all(|| RpcError::Connection(format!("write failed: {}", e))).await;
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    let _ = writer.shutdown().await;
    debug!("Writer stopped");
}

async fn read_loop<C: AsyncRead>(
    mut reader: ReadHalf<C>,
    mut codec: FrameCodec,
    shared: Arc<Shared>,
    inbound: Option<mpsc::Sender<InboundCall>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = codec.read_frame(&mut reader) => {
                match frame {
                    Ok(Some(frame)) => match EventCodec::decode(&frame) {
                        Ok(event) => shared.route(event, inbound.as_ref()).await,
                        Err(e) => warn!("Dropping undecodable frame: {}", e),
                    },
                    Ok(None) => {
                        info!("Connection closed by remote");
                        shared.fail_all(|| RpcError::Connection("connection closed by remote".to_string())).await;
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read frame: {}", e);
                        shared.fail_all(|| RpcError::Connection(format!("read failed: {}", e))).await;
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                shared.fail_all(|| RpcError::ChannelClosed).await;
                break;
            }
        }
    }

    debug!("Receive loop stopped");
}

async fn heartbeat_loop(
    shared: Arc<Shared>,
    mut closed: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => shared.sweep().await,
            Some(id) = closed.recv() => {
                shared.unregister(&id).await;
                debug!("Unregistered dropped channel {}", id);
            }
            _ = shutdown.changed() => break,
        }
    }

    debug!("Heartbeat sweeper stopped");
}
