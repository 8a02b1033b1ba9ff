use std::fmt;
use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::json;

use crate::logging::{LogLevel, Logger};
use crate::server::{PeerConnection, SessionKey, TcpServer};
use crate::wire::codec::{CodecError, WireCodec};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    Oversized { limit: usize },
    ReadFailed { message: String },
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed the connection"),
            Self::Oversized { limit } => write!(f, "message exceeded {limit} bytes"),
            Self::ReadFailed { message } => write!(f, "read failed: {message}"),
        }
    }
}

/// One thing the control thread has to react to.
#[derive(Debug)]
pub enum Readiness {
    Accepted {
        key: SessionKey,
        connection: Arc<PeerConnection>,
    },
    Message {
        key: SessionKey,
        frame: Vec<u8>,
    },
    Closed {
        key: SessionKey,
        reason: CloseReason,
    },
}

impl Readiness {
    pub fn key(&self) -> SessionKey {
        match self {
            Self::Accepted { key, .. } | Self::Message { key, .. } | Self::Closed { key, .. } => {
                *key
            }
        }
    }
}

#[derive(Debug)]
pub enum MultiplexerError {
    LocalAddr(io::Error),
    SpawnAcceptor(io::Error),
    AlreadyStopped,
    JoinFailed,
}

impl fmt::Display for MultiplexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalAddr(source) => write!(f, "failed to read listener address: {source}"),
            Self::SpawnAcceptor(source) => write!(f, "failed to spawn acceptor thread: {source}"),
            Self::AlreadyStopped => write!(f, "multiplexer is already stopped"),
            Self::JoinFailed => write!(f, "acceptor thread join failed"),
        }
    }
}

impl std::error::Error for MultiplexerError {}

#[derive(Clone, Copy, Debug)]
pub struct MultiplexerConfig {
    pub codec: WireCodec,
    pub stall_timeout: Duration,
}

/// Funnels accepts, inbound lines and disconnects from every I/O thread into
/// one ordered queue drained by the control thread.
pub struct Multiplexer {
    local_addr: SocketAddr,
    events: Receiver<Readiness>,
    stop_signal: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl Multiplexer {
    pub fn start(
        server: TcpServer,
        config: MultiplexerConfig,
        logger: Arc<Logger>,
    ) -> Result<Self, MultiplexerError> {
        let local_addr = server.local_addr().map_err(MultiplexerError::LocalAddr)?;
        let (tx, rx) = mpsc::channel();
        let stop_signal = Arc::new(AtomicBool::new(false));

        let acceptor_stop = Arc::clone(&stop_signal);
        let acceptor = thread::Builder::new()
            .name("ds-acceptor".to_owned())
            .spawn(move || run_acceptor(server, config, tx, acceptor_stop, logger))
            .map_err(MultiplexerError::SpawnAcceptor)?;

        Ok(Self {
            local_addr,
            events: rx,
            stop_signal,
            acceptor: Some(acceptor),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Blocks up to `timeout` for the first event, then takes whatever else
    /// is already queued, up to `max_events` in total.
    pub fn wait(&self, timeout: Duration, max_events: usize) -> Vec<Readiness> {
        let mut ready = Vec::new();
        if max_events == 0 {
            return ready;
        }

        match self.events.recv_timeout(timeout) {
            Ok(event) => ready.push(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return ready,
        }

        while ready.len() < max_events {
            match self.events.try_recv() {
                Ok(event) => ready.push(event),
                Err(_) => break,
            }
        }

        ready
    }

    /// Stops accepting. Established connections stay up until the manager
    /// shuts them down.
    pub fn stop(&mut self) -> Result<(), MultiplexerError> {
        self.stop_signal.store(true, Ordering::SeqCst);
        let handle = self.acceptor.take().ok_or(MultiplexerError::AlreadyStopped)?;
        handle.join().map_err(|_| MultiplexerError::JoinFailed)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
    }
}

fn run_acceptor(
    server: TcpServer,
    config: MultiplexerConfig,
    events: Sender<Readiness>,
    stop_signal: Arc<AtomicBool>,
    logger: Arc<Logger>,
) {
    while !stop_signal.load(Ordering::SeqCst) {
        match server.try_accept() {
            Ok(Some((key, stream, peer_addr))) => {
                if !attach_connection(key, stream, peer_addr, config, &events, &logger) {
                    break;
                }
            }
            Ok(None) => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(error) => {
                logger.warn(
                    Some("multiplexer::accept"),
                    &format!("accept failed: {error}"),
                );
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

/// Returns false once the control thread has gone away.
fn attach_connection(
    key: SessionKey,
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: MultiplexerConfig,
    events: &Sender<Readiness>,
    logger: &Logger,
) -> bool {
    let (connection, read_half) = match PeerConnection::attach(key, stream, peer_addr, config.stall_timeout) {
        Ok(attached) => attached,
        Err(error) => {
            logger.warn(
                Some("multiplexer::accept"),
                &format!("dropping connection from {peer_addr}: {error}"),
            );
            return true;
        }
    };
    let connection = Arc::new(connection);

    logger.log(
        LogLevel::Debug,
        Some("multiplexer::accept"),
        "Accepted connection",
        Some(json!({
            "session": key.to_string(),
            "peer_addr": peer_addr.to_string()
        })),
    );

    if events
        .send(Readiness::Accepted {
            key,
            connection: Arc::clone(&connection),
        })
        .is_err()
    {
        connection.shutdown();
        return false;
    }

    let reader_events = events.clone();
    let codec = config.codec;
    let spawned = thread::Builder::new()
        .name(format!("ds-reader-{}", key.as_u64()))
        .spawn(move || run_reader(key, read_half, codec, reader_events));
    if let Err(error) = spawned {
        logger.warn(
            Some("multiplexer::accept"),
            &format!("failed to spawn reader for {key}: {error}"),
        );
        connection.shutdown();
        return events
            .send(Readiness::Closed {
                key,
                reason: CloseReason::ReadFailed {
                    message: error.to_string(),
                },
            })
            .is_ok();
    }

    true
}

fn run_reader(key: SessionKey, stream: TcpStream, codec: WireCodec, events: Sender<Readiness>) {
    let mut reader = BufReader::new(stream);

    let reason = loop {
        match codec.read_frame(&mut reader) {
            Ok(Some(frame)) => {
                if events.send(Readiness::Message { key, frame }).is_err() {
                    return;
                }
            }
            Ok(None) => break CloseReason::PeerClosed,
            Err(CodecError::MessageTooLarge { limit }) => break CloseReason::Oversized { limit },
            Err(error) => {
                break CloseReason::ReadFailed {
                    message: error.to_string(),
                }
            }
        }
    };

    let _ = events.send(Readiness::Closed { key, reason });
}
