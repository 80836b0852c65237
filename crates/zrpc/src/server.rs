//! Task registry and dispatch loop

use crate::config::ChannelConfig;
use crate::multiplexer::{InboundCall, Multiplexer};
use crate::transport::{Endpoint, Listener};
use crate::{Result, RpcError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use zrpc_proto::event::{ERR, OK, STREAM, STREAM_DONE};
use zrpc_proto::Value;

/// Inbound exchanges waiting for dispatch
const DISPATCH_CAPACITY: usize = 256;

/// Streamed items produced but not yet sent
const STREAM_CAPACITY: usize = 16;

/// Handler for a task that answers with a single value
#[async_trait]
pub trait Task: Send + Sync {
    /// Run the task on the call's ordered arguments
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> Task for F
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        self(args).await
    }
}

/// Handler for a task that answers with a stream of values
///
/// Every value pushed into `items` goes out as one `STREAM` event right away.
/// Returning `Ok` ends the stream with `STREAM_DONE`; returning an error ends
/// it with `ERR`. A send into `items` fails once the caller is gone.
#[async_trait]
pub trait StreamTask: Send + Sync {
    /// Run the task, pushing items as they are produced
    async fn call(&self, args: Vec<Value>, items: mpsc::Sender<Value>) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> StreamTask for F
where
    F: Fn(Vec<Value>, mpsc::Sender<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn call(&self, args: Vec<Value>, items: mpsc::Sender<Value>) -> anyhow::Result<()> {
        self(args, items).await
    }
}

#[derive(Clone)]
enum Registered {
    Single(Arc<dyn Task>),
    Stream(Arc<dyn StreamTask>),
}

type Registry = Arc<RwLock<HashMap<String, Registered>>>;

/// Builder for configuring a server
pub struct ServerBuilder {
    endpoint: String,
    config: ChannelConfig,
}

impl ServerBuilder {
    /// Create a new server builder
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

    /// Bind the listening socket
    pub async fn bind(self) -> Result<Server> {
        let endpoint: Endpoint = self.endpoint.parse()?;
        let listener = Listener::bind(&endpoint).await?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Server {
            listener,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            connections: Mutex::new(Vec::new()),
            config: self.config,
            shutdown_tx,
        })
    }
}

/// RPC server: a task registry plus the loop that dispatches inbound calls
pub struct Server {
    listener: Listener,
    tasks: Registry,
    connections: Mutex<Vec<Multiplexer>>,
    config: ChannelConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Bind to `endpoint` with default settings
    pub async fn bind(endpoint: &str) -> Result<Self> {
        ServerBuilder::new(endpoint).bind().await
    }

    /// Start configuring a server
    pub fn builder(endpoint: &str) -> ServerBuilder {
        ServerBuilder::new(endpoint)
    }

    /// Endpoint clients should connect to
    pub fn local_endpoint(&self) -> String {
        self.listener.local_endpoint().to_string()
    }

    /// Register a single-reply task under `name`
    pub async fn register_task<T>(&self, name: impl Into<String>, task: T) -> Result<()>
    where
        T: Task + 'static,
    {
        self.register(name.into(), Registered::Single(Arc::new(task))).await
    }

    /// Register a streaming task under `name`
    pub async fn register_stream_task<T>(&self, name: impl Into<String>, task: T) -> Result<()>
    where
        T: StreamTask + 'static,
    {
        self.register(name.into(), Registered::Stream(Arc::new(task))).await
    }

    async fn register(&self, name: String, task: Registered) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&name) {
            return Err(RpcError::DuplicateTask(name));
        }
        debug!("Registered task {}", name);
        tasks.insert(name, task);
        Ok(())
    }

    /// Accept connections and dispatch inbound calls until [`Server::close`]
    ///
    /// Each inbound exchange runs on its own task, so a slow handler never
    /// holds up the receive loops or heartbeats of other exchanges.
    pub async fn listen(&self) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        let (inbound_tx, mut inbound_rx) = mpsc::channel(DISPATCH_CAPACITY);
        let mut prune = interval(self.config.heartbeat_interval);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Serving on {}", self.local_endpoint());

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((connection, peer)) => {
                        info!("Accepted connection from {}", peer);
                        let mux = Multiplexer::with_inbound(
                            connection,
                            self.config.clone(),
                            inbound_tx.clone(),
                        );
                        self.connections.lock().await.push(mux);
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
                Some(call) = inbound_rx.recv() => {
                    tokio::spawn(dispatch(call, Arc::clone(&self.tasks)));
                }
                _ = prune.tick() => {
                    let mut connections = self.connections.lock().await;
                    let before = connections.len();
                    connections.retain(Multiplexer::is_connected);
                    if connections.len() < before {
                        debug!("Dropped {} closed connections", before - connections.len());
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        let open = std::mem::take(&mut *self.connections.lock().await);
        info!("Server on {} stopped with {} open connections", self.local_endpoint(), open.len());
        Ok(())
    }

    /// Number of accepted connections still tracked by [`Server::listen`]
    ///
    /// Closed connections are released within one heartbeat interval.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Stop [`Server::listen`] and drop every accepted connection
    pub fn close(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Run one inbound call to completion and close its channel
async fn dispatch(call: InboundCall, tasks: Registry) {
    let InboundCall { mut channel, event } = call;
    let name = event.name;
    let args = event.args;
    let task = tasks.read().await.get(&name).cloned();
    debug!("Dispatching {} on channel {}", name, channel.id());

    let result = match task {
        None => {
            warn!("No task registered for {}", name);
            let description = format!("method not found: {}", name);
            channel.send_event(ERR, vec![Value::from(description)]).await
        }
        Some(Registered::Single(task)) => {
            let outcome = tokio::spawn(async move { task.call(args).await }).await;
            match flatten(&name, outcome) {
                Ok(value) => channel.send_event(OK, vec![value]).await,
                Err(description) => channel.send_event(ERR, vec![Value::from(description)]).await,
            }
        }
        Some(Registered::Stream(task)) => {
            let (items_tx, mut items_rx) = mpsc::channel(STREAM_CAPACITY);
            let handle = tokio::spawn(async move { task.call(args, items_tx).await });

            let mut streamed = Ok(());
            while let Some(item) = items_rx.recv().await {
                if let Err(e) = channel.send_event(STREAM, vec![item]).await {
                    streamed = Err(e);
                    break;
                }
            }
            // Unblocks a handler still pushing after a failed send
            drop(items_rx);

            let outcome = flatten(&name, handle.await);
            match (streamed, outcome) {
                (Err(e), _) => Err(e),
                (Ok(()), Ok(())) => channel.send_event(STREAM_DONE, Vec::new()).await,
                (Ok(()), Err(description)) => {
                    channel.send_event(ERR, vec![Value::from(description)]).await
                }
            }
        }
    };

    if let Err(e) = result {
        warn!("Failed to reply on channel {}: {}", channel.id(), e);
    }
    channel.close().await;
}

/// Turn a handler outcome into a value or an error description
fn flatten<T>(
    name: &str,
    outcome: std::result::Result<anyhow::Result<T>, tokio::task::JoinError>,
) -> std::result::Result<T, String> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            debug!("Task {} failed: {:#}", name, e);
            Err(e.to_string())
        }
        Err(e) => {
            warn!("Task {} did not complete: {}", name, e);
            Err(format!("task {} did not complete", name))
        }
    }
}
