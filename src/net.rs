use std::io;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::error::RpcError;

/// Any bidirectional byte stream a connection can run over: a TCP stream, a
/// unix socket, or an HTTP-upgraded stream.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// Every connection is wrapped in one buffered stream so the Option line,
/// the HTTP head and the codec records all share the same buffer.
pub type BufConn = BufStream<Box<dyn IoStream>>;

/// Read half of a connection, owned by the codec loop / reader task.
pub type ConnReader = tokio::io::ReadHalf<BufConn>;

/// Write half of a connection, serialized by the send lock.
pub type ConnWriter = tokio::io::WriteHalf<BufConn>;

/// Unify behavior of tcp & unix socket listener.
pub enum UnifyListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl std::fmt::Display for UnifyListener {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Tcp(l) => match l.local_addr() {
                Ok(a) => write!(f, "tcp listener {}", a),
                Err(_) => write!(f, "tcp listener"),
            },
            Self::Unix(l) => match l.local_addr() {
                Ok(a) => write!(f, "unix listener {:?}", a),
                Err(_) => write!(f, "unix listener"),
            },
        }
    }
}

impl UnifyListener {
    /// `network` is `"tcp"` or `"unix"`; `address` is a socket address or a
    /// filesystem path respectively.
    pub async fn bind(network: &str, address: &str) -> io::Result<Self> {
        match network {
            "tcp" => Ok(Self::Tcp(TcpListener::bind(address).await?)),
            "unix" => {
                let path = std::path::Path::new(address);
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Ok(Self::Unix(UnixListener::bind(path)?))
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported network {:?}", other),
            )),
        }
    }

    pub async fn accept(&self) -> io::Result<Box<dyn IoStream>> {
        match self {
            Self::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream))
            }
            Self::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }

    /// The bound address, useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<String> {
        match self {
            Self::Tcp(l) => Ok(l.local_addr()?.to_string()),
            Self::Unix(l) => {
                let addr = l.local_addr()?;
                match addr.as_pathname() {
                    Some(p) => Ok(p.display().to_string()),
                    None => Err(io::Error::new(io::ErrorKind::InvalidData, "unnamed unix addr")),
                }
            }
        }
    }
}

/// Open a stream to `address` over `network`, bounded by `connect_timeout`
/// (zero disables the limit).
pub async fn connect(
    network: &str,
    address: &str,
    connect_timeout: Duration,
) -> Result<Box<dyn IoStream>, RpcError> {
    let dial = async {
        match network {
            "tcp" => {
                let stream = TcpStream::connect(address).await?;
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream) as Box<dyn IoStream>)
            }
            "unix" => {
                let stream = UnixStream::connect(address).await?;
                Ok(Box::new(stream) as Box<dyn IoStream>)
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported network {:?}", other),
            )),
        }
    };
    let stream = if connect_timeout.is_zero() {
        dial.await?
    } else {
        match tokio::time::timeout(connect_timeout, dial).await {
            Ok(r) => r?,
            Err(_) => return Err(RpcError::ConnectTimeout),
        }
    };
    debug!("rpc client: connected to {}:{}", network, address);
    Ok(stream)
}
