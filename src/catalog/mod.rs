use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::config::{CatalogConfig, DEFAULT_CATALOG_PORT};
use crate::logging::{LogLevel, Logger};

const TICK: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum CatalogError {
    InvalidHost { host: String },
    Resolve { host: String, source: io::Error },
    Socket(io::Error),
    Spawn(io::Error),
    Send { target: SocketAddr, source: io::Error },
    Encode(serde_json::Error),
    InvalidInterval { provided_seconds: u64 },
    AlreadyRunning,
    JoinFailed,
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHost { host } => write!(f, "invalid catalog host '{host}'"),
            Self::Resolve { host, source } => {
                write!(f, "failed to resolve catalog host '{host}': {source}")
            }
            Self::Socket(source) => write!(f, "failed to open catalog socket: {source}"),
            Self::Spawn(source) => write!(f, "failed to spawn catalog thread: {source}"),
            Self::Send { target, source } => {
                write!(f, "failed to send catalog update to {target}: {source}")
            }
            Self::Encode(source) => write!(f, "failed to encode catalog update: {source}"),
            Self::InvalidInterval { provided_seconds } => write!(
                f,
                "catalog update interval must be at least 1 second, got {provided_seconds}"
            ),
            Self::AlreadyRunning => write!(f, "catalog reporter is already running"),
            Self::JoinFailed => write!(f, "catalog reporter thread join failed"),
        }
    }
}

impl std::error::Error for CatalogError {}

/// Somewhere a status document can be advertised.
pub trait CatalogPublisher: Send {
    /// Returns how many destinations accepted the document.
    fn publish(&self, document: &Value) -> Result<usize, CatalogError>;
}

/// Splits `host[:port]`, defaulting the port.
pub fn parse_catalog_host(raw: &str) -> Result<(String, u16), CatalogError> {
    let raw = raw.trim();
    let invalid = || CatalogError::InvalidHost {
        host: raw.to_owned(),
    };

    let (host, port) = match raw.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (raw, DEFAULT_CATALOG_PORT),
    };
    if host.is_empty() || port == 0 {
        return Err(invalid());
    }
    Ok((host.to_owned(), port))
}

/// Sends the document as one UDP datagram to every catalog host.
pub struct UdpCatalogPublisher {
    socket: UdpSocket,
    hosts: Vec<(String, u16)>,
}

impl UdpCatalogPublisher {
    pub fn new(hosts: &[String]) -> Result<Self, CatalogError> {
        let hosts = hosts
            .iter()
            .map(|host| parse_catalog_host(host))
            .collect::<Result<Vec<_>, _>>()?;
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(CatalogError::Socket)?;
        Ok(Self { socket, hosts })
    }
}

impl CatalogPublisher for UdpCatalogPublisher {
    fn publish(&self, document: &Value) -> Result<usize, CatalogError> {
        let datagram = serde_json::to_vec(document).map_err(CatalogError::Encode)?;
        let mut delivered = 0;
        let mut first_error = None;

        for (host, port) in &self.hosts {
            let target = (host.as_str(), *port)
                .to_socket_addrs()
                .map_err(|source| CatalogError::Resolve {
                    host: host.clone(),
                    source,
                })
                .and_then(|mut addrs| {
                    addrs.next().ok_or_else(|| CatalogError::InvalidHost { host: host.clone() })
                });

            let outcome = target.and_then(|target| {
                self.socket
                    .send_to(&datagram, target)
                    .map_err(|source| CatalogError::Send { target, source })
            });
            match outcome {
                Ok(_) => delivered += 1,
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) if delivered == 0 => Err(error),
            _ => Ok(delivered),
        }
    }
}

/// Periodically advertises the manager on its own thread.
pub struct CatalogReporter {
    interval: Duration,
    document: Arc<Mutex<Value>>,
    force_signal: Arc<AtomicBool>,
    stop_signal: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CatalogReporter {
    pub fn new(interval: Duration, document: Value) -> Result<Self, CatalogError> {
        if interval.is_zero() {
            return Err(CatalogError::InvalidInterval { provided_seconds: 0 });
        }

        Ok(Self {
            interval,
            document: Arc::new(Mutex::new(document)),
            force_signal: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    pub fn from_config(config: &CatalogConfig, document: Value) -> Result<Self, CatalogError> {
        if config.update_interval_seconds == 0 {
            return Err(CatalogError::InvalidInterval {
                provided_seconds: config.update_interval_seconds,
            });
        }
        Self::new(Duration::from_secs(config.update_interval_seconds), document)
    }

    /// Starts publishing; the first update goes out immediately.
    pub fn start(
        &mut self,
        publisher: Box<dyn CatalogPublisher>,
        logger: Arc<Logger>,
    ) -> Result<(), CatalogError> {
        if self.worker.is_some() {
            return Err(CatalogError::AlreadyRunning);
        }

        self.stop_signal.store(false, Ordering::SeqCst);
        self.force_signal.store(true, Ordering::SeqCst);
        let stop_signal = Arc::clone(&self.stop_signal);
        let force_signal = Arc::clone(&self.force_signal);
        let document = Arc::clone(&self.document);
        let interval = self.interval;

        let worker = thread::Builder::new()
            .name("ds-catalog".to_owned())
            .spawn(move || {
                let mut last_published: Option<Instant> = None;
                while !stop_signal.load(Ordering::SeqCst) {
                    let due = last_published.map_or(true, |at| at.elapsed() >= interval);
                    if force_signal.swap(false, Ordering::SeqCst) || due {
                        let snapshot = match document.lock() {
                            Ok(document) => document.clone(),
                            Err(_) => break,
                        };
                        match publisher.publish(&snapshot) {
                            Ok(delivered) => logger.log(
                                LogLevel::Debug,
                                Some("catalog::publish"),
                                "Catalog update sent",
                                Some(json!({ "delivered": delivered })),
                            ),
                            Err(error) => logger.warn(
                                Some("catalog::publish"),
                                &format!("catalog update failed: {error}"),
                            ),
                        }
                        last_published = Some(Instant::now());
                    }
                    thread::sleep(TICK.min(interval));
                }
            })
            .map_err(CatalogError::Spawn)?;

        self.worker = Some(worker);
        Ok(())
    }

    /// Replaces the advertised document and publishes it on the next tick.
    pub fn refresh(&self, document: Value) {
        if let Ok(mut current) = self.document.lock() {
            *current = document;
        }
        self.force();
    }

    pub fn force(&self) {
        self.force_signal.store(true, Ordering::SeqCst);
    }

    pub fn stop(&mut self) -> Result<(), CatalogError> {
        self.stop_signal.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker.take() {
            return handle.join().map_err(|_| CatalogError::JoinFailed);
        }

        Ok(())
    }
}

impl Drop for CatalogReporter {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
