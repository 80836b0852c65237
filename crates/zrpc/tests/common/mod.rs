//! Shared helpers for zrpc integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;
use zrpc::proto::{Event, EventCodec, FrameCodec};
use zrpc::{Server, Value};

/// Heartbeat interval short enough to exercise liveness in tests
pub const FAST_HEARTBEAT: Duration = Duration::from_millis(50);

/// Install a test subscriber once; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Server listening on its own task
pub struct RunningServer {
    pub server: Arc<Server>,
    pub endpoint: String,
    pub handle: JoinHandle<zrpc::Result<()>>,
}

impl RunningServer {
    pub fn start(server: Server) -> Self {
        let server = Arc::new(server);
        let endpoint = server.local_endpoint();
        let listening = Arc::clone(&server);
        let handle = tokio::spawn(async move { listening.listen().await });
        Self {
            server,
            endpoint,
            handle,
        }
    }

    pub async fn stop(self) {
        self.server.close();
        let _ = tokio::time::timeout(Duration::from_secs(1), self.handle).await;
    }
}

/// Raw TCP peer that answers the first request with fixed events
///
/// Returns the endpoint to connect to. Heartbeats from the client are read
/// and ignored; the peer never sends any of its own.
pub async fn scripted_peer(replies: Vec<(&'static str, Vec<Value>)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let mut codec = FrameCodec::new();

        let request = loop {
            let frame = match codec.read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                _ => return,
            };
            let event = EventCodec::decode(&frame).unwrap();
            if !event.is_heartbeat() {
                break event;
            }
        };

        for (name, args) in replies {
            let event = Event::reply(&request.header.message_id, name, args);
            let payload = EventCodec::encode(&event).unwrap();
            codec.write_frame(&mut writer, &payload).await.unwrap();
        }

        while let Ok(Some(_)) = codec.read_frame(&mut reader).await {}
    });

    format!("tcp://{}", addr)
}
