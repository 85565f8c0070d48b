//! UDP datagram mesh transport.
//!
//! Each node binds one socket and addresses a fixed roster of peers. A
//! worker thread owns the socket on a single-threaded runtime; the engine
//! side stays synchronous and non-blocking:
//! - `send_to` queues the datagram for the worker
//! - `recv` drains frames the worker already mapped back to a peer
//! - datagrams from addresses outside the roster are dropped and counted

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use bytes::BytesMut;
use slate_core::PeerId;
use slate_transport::MeshTransport;
use thiserror::Error;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tracing::{debug, warn};

/// Largest payload a single IPv4 datagram can carry.
pub const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Clone)]
pub struct UdpMeshConfig {
    pub bind_addr: SocketAddr,
    /// Roster of reachable peers and where to send to them.
    pub peers: Vec<(PeerId, SocketAddr)>,
    pub outbound_queue_capacity: usize,
    pub inbound_queue_capacity: usize,
}

impl UdpMeshConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            peers: Vec::new(),
            outbound_queue_capacity: 1024,
            inbound_queue_capacity: 1024,
        }
    }

    pub fn with_peer(mut self, peer: impl Into<PeerId>, addr: SocketAddr) -> Self {
        self.peers.push((peer.into(), addr));
        self
    }
}

#[derive(Debug, Error)]
pub enum UdpMeshError {
    #[error("transport is closed")]
    Closed,
    #[error("outbound queue is full")]
    QueueFull,
    #[error("peer {0} has no configured address")]
    UnknownPeer(PeerId),
    #[error("datagram exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Point-in-time copy of the worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpMeshMetrics {
    pub outbound_queued: u64,
    pub datagrams_sent: u64,
    pub send_errors: u64,
    pub datagrams_received: u64,
    pub unknown_sources: u64,
    pub inbound_dropped: u64,
}

#[derive(Debug, Default)]
struct UdpMeshMetricsInner {
    outbound_queued: AtomicU64,
    datagrams_sent: AtomicU64,
    send_errors: AtomicU64,
    datagrams_received: AtomicU64,
    unknown_sources: AtomicU64,
    inbound_dropped: AtomicU64,
}

pub struct UdpMesh {
    peers: Vec<PeerId>,
    addrs: HashMap<PeerId, SocketAddr>,
    local_addr: SocketAddr,
    outbound_tx: tokio_mpsc::Sender<(SocketAddr, Vec<u8>)>,
    inbound_rx: mpsc::Receiver<(PeerId, Vec<u8>)>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    metrics: Arc<UdpMeshMetricsInner>,
}

impl UdpMesh {
    /// Bind `config.bind_addr` and start the worker.
    pub fn connect(config: UdpMeshConfig) -> Result<Self, UdpMeshError> {
        let socket = std::net::UdpSocket::bind(config.bind_addr)?;
        Self::with_socket(socket, config)
    }

    /// Start the worker on an already-bound socket. `config.bind_addr` is
    /// ignored here; tests use this to learn ephemeral ports up front.
    pub fn with_socket(
        socket: std::net::UdpSocket,
        config: UdpMeshConfig,
    ) -> Result<Self, UdpMeshError> {
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        let peers: Vec<PeerId> = config.peers.iter().map(|(p, _)| p.clone()).collect();
        let addrs: HashMap<PeerId, SocketAddr> = config.peers.iter().cloned().collect();
        let sources: HashMap<SocketAddr, PeerId> = config
            .peers
            .iter()
            .map(|(p, a)| (*a, p.clone()))
            .collect();

        let (outbound_tx, outbound_rx) =
            tokio_mpsc::channel::<(SocketAddr, Vec<u8>)>(config.outbound_queue_capacity);
        let (inbound_tx, inbound_rx) =
            mpsc::sync_channel::<(PeerId, Vec<u8>)>(config.inbound_queue_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let running = Arc::new(AtomicBool::new(true));
        let metrics = Arc::new(UdpMeshMetricsInner::default());
        let worker_running = Arc::clone(&running);
        let worker_metrics = Arc::clone(&metrics);

        let worker = thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(_) => {
                    worker_running.store(false, Ordering::Relaxed);
                    return;
                }
            };

            runtime.block_on(run_udp_worker(
                socket,
                sources,
                worker_running,
                worker_metrics,
                outbound_rx,
                inbound_tx,
                shutdown_rx,
            ));
        });

        Ok(Self {
            peers,
            addrs,
            local_addr,
            outbound_tx,
            inbound_rx,
            shutdown_tx: Some(shutdown_tx),
            worker: Some(worker),
            running,
            metrics,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn metrics_snapshot(&self) -> UdpMeshMetrics {
        UdpMeshMetrics {
            outbound_queued: self.metrics.outbound_queued.load(Ordering::Relaxed),
            datagrams_sent: self.metrics.datagrams_sent.load(Ordering::Relaxed),
            send_errors: self.metrics.send_errors.load(Ordering::Relaxed),
            datagrams_received: self.metrics.datagrams_received.load(Ordering::Relaxed),
            unknown_sources: self.metrics.unknown_sources.load(Ordering::Relaxed),
            inbound_dropped: self.metrics.inbound_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for UdpMesh {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl MeshTransport for UdpMesh {
    type Error = UdpMeshError;

    fn send_to(&mut self, peer: &PeerId, bytes: &[u8]) -> Result<(), Self::Error> {
        let addr = *self
            .addrs
            .get(peer)
            .ok_or_else(|| UdpMeshError::UnknownPeer(peer.clone()))?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(UdpMeshError::PayloadTooLarge {
                limit: MAX_DATAGRAM,
            });
        }
        self.outbound_tx
            .try_send((addr, bytes.to_vec()))
            .map_err(|err| match err {
                tokio_mpsc::error::TrySendError::Full(_) => UdpMeshError::QueueFull,
                tokio_mpsc::error::TrySendError::Closed(_) => UdpMeshError::Closed,
            })
            .map(|_| {
                self.metrics.outbound_queued.fetch_add(1, Ordering::Relaxed);
            })
    }

    fn recv(&mut self) -> Option<(PeerId, Vec<u8>)> {
        self.inbound_rx.try_recv().ok()
    }

    /// The configured roster. UDP keeps no session state, so membership is
    /// presence in the roster, not liveness.
    fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.clone()
    }
}

async fn run_udp_worker(
    socket: std::net::UdpSocket,
    sources: HashMap<SocketAddr, PeerId>,
    running: Arc<AtomicBool>,
    metrics: Arc<UdpMeshMetricsInner>,
    mut outbound_rx: tokio_mpsc::Receiver<(SocketAddr, Vec<u8>)>,
    inbound_tx: mpsc::SyncSender<(PeerId, Vec<u8>)>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let socket = match tokio::net::UdpSocket::from_std(socket) {
        Ok(socket) => socket,
        Err(error) => {
            warn!(%error, "udp worker could not adopt socket");
            running.store(false, Ordering::Relaxed);
            return;
        }
    };
    let mut buf = BytesMut::zeroed(MAX_DATAGRAM);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                break;
            }
            maybe_out = outbound_rx.recv() => {
                match maybe_out {
                    Some((addr, bytes)) => {
                        match socket.send_to(&bytes, addr).await {
                            Ok(_) => {
                                metrics.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(error) => {
                                metrics.send_errors.fetch_add(1, Ordering::Relaxed);
                                debug!(%addr, %error, "udp send failed");
                            }
                        }
                    }
                    None => break,
                }
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, addr)) => {
                        metrics.datagrams_received.fetch_add(1, Ordering::Relaxed);
                        match sources.get(&addr) {
                            Some(peer) => {
                                let frame = buf[..len].to_vec();
                                if inbound_tx.try_send((peer.clone(), frame)).is_err() {
                                    metrics.inbound_dropped.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            None => {
                                metrics.unknown_sources.fetch_add(1, Ordering::Relaxed);
                                debug!(%addr, "dropping datagram from unknown source");
                            }
                        }
                    }
                    Err(error) => {
                        debug!(%error, "udp recv failed");
                    }
                }
            }
        }
    }

    running.store(false, Ordering::Relaxed);
}
