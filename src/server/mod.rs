use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config;

/// Opaque handle for one accepted connection. Issued monotonically by the
/// server and never reused for the process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey(u64);

impl SessionKey {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        source: io::Error,
    },
    StreamClone {
        source: io::Error,
    },
    SpawnThread {
        name: String,
        source: io::Error,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::StreamClone { source } => {
                write!(f, "failed to clone accepted TCP stream for full duplex IO: {source}")
            }
            Self::SpawnThread { name, source } => {
                write!(f, "failed to spawn connection thread '{name}': {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {}

/// Frames queued for a connection's writer thread.
#[derive(Debug, PartialEq, Eq)]
pub enum Outbound {
    Frame(Vec<u8>),
    /// Flush what is queued, then shut the socket down.
    Close,
}

/// The manager's handle to one peer. Writes never block the caller: frames
/// are handed to a dedicated writer thread.
pub struct PeerConnection {
    key: SessionKey,
    peer_addr: SocketAddr,
    outbound: Mutex<Sender<Outbound>>,
    stream: Option<TcpStream>,
}

impl PeerConnection {
    /// Wires an accepted stream to a writer thread. The returned stream is
    /// the read half for the caller's reader.
    pub fn attach(
        key: SessionKey,
        stream: TcpStream,
        peer_addr: SocketAddr,
        stall_timeout: Duration,
    ) -> Result<(Self, TcpStream), ServerError> {
        stream
            .set_nodelay(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        stream
            .set_nonblocking(false)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        stream
            .set_write_timeout(Some(stall_timeout))
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;

        let writer = stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;
        let control = stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;

        let (tx, rx) = mpsc::channel();
        spawn_writer(key, writer, rx)?;

        Ok((
            Self {
                key,
                peer_addr,
                outbound: Mutex::new(tx),
                stream: Some(control),
            },
            stream,
        ))
    }

    /// A connection with no socket behind it; outbound frames are delivered
    /// to the returned receiver.
    pub fn detached(key: SessionKey, peer_addr: SocketAddr) -> (Self, Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                key,
                peer_addr,
                outbound: Mutex::new(tx),
                stream: None,
            },
            rx,
        )
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queues a frame. Returns false when the writer is gone.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.push(Outbound::Frame(frame))
    }

    /// Queues a close after every frame already queued.
    pub fn close(&self) {
        self.push(Outbound::Close);
    }

    /// Tears the socket down immediately, dropping queued frames.
    pub fn shutdown(&self) {
        if let Some(stream) = &self.stream {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.push(Outbound::Close);
    }

    fn push(&self, item: Outbound) -> bool {
        match self.outbound.lock() {
            Ok(sender) => sender.send(item).is_ok(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("key", &self.key)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

fn spawn_writer(
    key: SessionKey,
    mut stream: TcpStream,
    outbound: Receiver<Outbound>,
) -> Result<JoinHandle<()>, ServerError> {
    let name = format!("ds-writer-{}", key.as_u64());
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            while let Ok(item) = outbound.recv() {
                match item {
                    Outbound::Frame(frame) => {
                        if stream.write_all(&frame).and_then(|()| stream.flush()).is_err() {
                            let _ = stream.shutdown(Shutdown::Both);
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = stream.shutdown(Shutdown::Both);
                        break;
                    }
                }
            }
        })
        .map_err(|source| ServerError::SpawnThread { name, source })
}

pub struct TcpServer {
    listener: TcpListener,
    next_session_key: AtomicU64,
}

impl TcpServer {
    pub fn bind(config: &config::ServerConfig) -> Result<Self, ServerError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            next_session_key: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Non-blocking accept; `Ok(None)` when nothing is pending.
    pub fn try_accept(&self) -> io::Result<Option<(SessionKey, TcpStream, SocketAddr)>> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                let key = SessionKey(self.next_session_key.fetch_add(1, Ordering::Relaxed));
                Ok(Some((key, stream, peer_addr)))
            }
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(source),
        }
    }
}
