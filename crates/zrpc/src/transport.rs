//! Endpoint parsing and byte-stream transports
//!
//! Endpoints are transport addresses such as `tcp://127.0.0.1:4242`,
//! `ipc:///tmp/zrpc.sock` or `inproc://jobs`. Each connection is a plain byte
//! stream; message boundaries are added on top by the frame codec.
//!
//! An `inproc` name is served by a Unix socket in the temporary directory, so
//! a client and server in the same process only need to agree on the name.

use crate::{Result, RpcError};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Any bidirectional byte stream a multiplexer can run on
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased connection
pub type BoxedConnection = Box<dyn Connection>;

/// Parsed transport address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `tcp://host:port`
    Tcp(String),
    /// `ipc://path`, a Unix domain socket
    #[cfg(unix)]
    Ipc(PathBuf),
    /// `inproc://name`, a named in-process endpoint
    #[cfg(unix)]
    Inproc(String),
}

#[cfg(unix)]
impl Endpoint {
    /// Socket path backing a Unix-socket endpoint
    fn socket_path(&self) -> Option<PathBuf> {
        match self {
            Self::Tcp(_) => None,
            Self::Ipc(path) => Some(path.clone()),
            Self::Inproc(name) => {
                let file: String = name
                    .chars()
                    .map(|c| match c {
                        'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
                        _ => '_',
                    })
                    .collect();
                Some(std::env::temp_dir().join(format!("zrpc-inproc-{}.sock", file)))
            }
        }
    }
}

impl FromStr for Endpoint {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            if addr.is_empty() {
                return Err(RpcError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Self::Tcp(addr.to_string()));
        }

        #[cfg(unix)]
        if let Some(path) = s.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(RpcError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Self::Ipc(PathBuf::from(path)));
        }

        #[cfg(unix)]
        if let Some(name) = s.strip_prefix("inproc://") {
            if name.is_empty() {
                return Err(RpcError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Self::Inproc(name.to_string()));
        }

        Err(RpcError::InvalidEndpoint(s.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{}", addr),
            #[cfg(unix)]
            Self::Ipc(path) => write!(f, "ipc://{}", path.display()),
            #[cfg(unix)]
            Self::Inproc(name) => write!(f, "inproc://{}", name),
        }
    }
}

/// Open a connection to `endpoint`
pub async fn connect(endpoint: &Endpoint) -> Result<BoxedConnection> {
    debug!("Connecting to {}", endpoint);
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str())
                .await
                .map_err(|e| RpcError::Connection(format!("{}: {}", endpoint, e)))?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Endpoint::Ipc(_) | Endpoint::Inproc(_) => {
            let path = endpoint
                .socket_path()
                .ok_or_else(|| RpcError::InvalidEndpoint(endpoint.to_string()))?;
            let stream = UnixStream::connect(&path)
                .await
                .map_err(|e| RpcError::Connection(format!("{}: {}", endpoint, e)))?;
            Ok(Box::new(stream))
        }
    }
}

/// Remove a socket file left behind by an earlier listener of the same name
///
/// A name whose socket still accepts connections is in use.
#[cfg(unix)]
async fn claim_inproc_path(endpoint: &Endpoint, path: &std::path::Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if UnixStream::connect(path).await.is_ok() {
        return Err(RpcError::Connection(format!("{}: address in use", endpoint)));
    }
    debug!("Removing stale socket {}", path.display());
    std::fs::remove_file(path)?;
    Ok(())
}

enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// Bound listening socket
pub struct Listener {
    inner: ListenerKind,
    endpoint: Endpoint,
}

impl Listener {
    /// Bind to `endpoint`
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        let inner = match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str())
                    .await
                    .map_err(|e| RpcError::Connection(format!("{}: {}", endpoint, e)))?;
                ListenerKind::Tcp(listener)
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => {
                let listener = UnixListener::bind(path)
                    .map_err(|e| RpcError::Connection(format!("{}: {}", endpoint, e)))?;
                ListenerKind::Unix(listener)
            }
            #[cfg(unix)]
            Endpoint::Inproc(_) => {
                let path = endpoint
                    .socket_path()
                    .ok_or_else(|| RpcError::InvalidEndpoint(endpoint.to_string()))?;
                claim_inproc_path(endpoint, &path).await?;
                let listener = UnixListener::bind(&path)
                    .map_err(|e| RpcError::Connection(format!("{}: {}", endpoint, e)))?;
                ListenerKind::Unix(listener)
            }
        };

        let endpoint = match &inner {
            ListenerKind::Tcp(listener) => Endpoint::Tcp(listener.local_addr()?.to_string()),
            #[cfg(unix)]
            ListenerKind::Unix(_) => endpoint.clone(),
        };

        info!("Listening on {}", endpoint);
        Ok(Self { inner, endpoint })
    }

    /// Endpoint actually bound; a TCP port of 0 is resolved
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Wait for the next incoming connection, returning it with a peer label
    pub async fn accept(&self) -> Result<(BoxedConnection, String)> {
        match &self.inner {
            ListenerKind::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            ListenerKind::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), self.endpoint.to_string()))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Endpoint::Inproc(_) = self.endpoint {
            if let Some(path) = self.endpoint.socket_path() {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let endpoint: Endpoint = "tcp://127.0.0.1:4242".parse().unwrap();
        assert_eq!(endpoint, Endpoint::Tcp("127.0.0.1:4242".to_string()));
        assert_eq!(endpoint.to_string(), "tcp://127.0.0.1:4242");
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_ipc() {
        let endpoint: Endpoint = "ipc:///tmp/zrpc.sock".parse().unwrap();
        assert_eq!(endpoint, Endpoint::Ipc(PathBuf::from("/tmp/zrpc.sock")));
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_inproc() {
        let endpoint: Endpoint = "inproc://request-response".parse().unwrap();
        assert_eq!(endpoint, Endpoint::Inproc("request-response".to_string()));
        assert_eq!(endpoint.to_string(), "inproc://request-response");

        let path = endpoint.socket_path().unwrap();
        assert!(path.starts_with(std::env::temp_dir()));
        assert!(path.to_string_lossy().ends_with("zrpc-inproc-request-response.sock"));
    }

    #[cfg(unix)]
    #[test]
    fn test_inproc_names_stay_in_temp_dir() {
        let endpoint: Endpoint = "inproc://../../etc/x".parse().unwrap();
        let path = endpoint.socket_path().unwrap();
        assert_eq!(path.parent(), Some(std::env::temp_dir().as_path()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_inproc_bind_connect_and_cleanup() {
        let endpoint: Endpoint = format!("inproc://transport-{}", uuid::Uuid::new_v4())
            .parse()
            .unwrap();
        let path = endpoint.socket_path().unwrap();

        let listener = Listener::bind(&endpoint).await.unwrap();
        assert_eq!(listener.local_endpoint(), &endpoint);
        assert!(matches!(
            Listener::bind(&endpoint).await,
            Err(RpcError::Connection(_))
        ));

        let (connected, accepted) = tokio::join!(connect(&endpoint), listener.accept());
        connected.unwrap();
        accepted.unwrap();

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        for bad in ["udp://1.2.3.4:5", "127.0.0.1:80", "tcp://", "inproc://"] {
            assert!(matches!(bad.parse::<Endpoint>(), Err(RpcError::InvalidEndpoint(_))));
        }
    }

    #[tokio::test]
    async fn test_bind_resolves_port_zero() {
        let listener = Listener::bind(&"tcp://127.0.0.1:0".parse().unwrap()).await.unwrap();
        match listener.local_endpoint() {
            Endpoint::Tcp(addr) => assert!(!addr.ends_with(":0")),
            #[cfg(unix)]
            other => panic!("unexpected endpoint {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = Listener::bind(&"tcp://127.0.0.1:0".parse().unwrap()).await.unwrap();
        let endpoint = listener.local_endpoint().clone();
        drop(listener);

        let result = connect(&endpoint).await;
        assert!(matches!(result, Err(RpcError::Connection(_))));
    }
}
