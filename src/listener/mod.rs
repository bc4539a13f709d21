//! Shared network listeners.
//!
//! Exactly one socket exists per (protocol, port). Every source using that
//! port registers a route keyed by its peer IP (or the `0.0.0.0` wildcard)
//! and the listener hands each inbound message to at most one of them.

pub mod registry;
mod tcp;
mod udp;

pub use registry::{ListenerProvider, ListenerRegistry};

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::{ErrorKind, Protocol, WILDCARD_IP};

/// Largest single datagram or line accepted.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("failed to bind {protocol} {address}: {source}")]
    Bind {
        protocol: Protocol,
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("route '{peer}' is already registered on {protocol} port {port}")]
    RouteConflict {
        peer: String,
        protocol: Protocol,
        port: u16,
    },
    #[error("listener for {protocol} port {port} is closed")]
    Closed { protocol: Protocol, port: u16 },
}

impl ListenerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ListenerError::Bind { .. } => ErrorKind::ListenerBind,
            ListenerError::RouteConflict { .. } | ListenerError::Closed { .. } => {
                ErrorKind::Configuration
            }
        }
    }
}

/// Receives messages routed by a listener. Called on the socket read path,
/// so implementations must not block.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, data: &[u8], peer_ip: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Exact,
    Wildcard,
    Dropped,
}

type Routes = HashMap<String, Arc<dyn MessageHandler>>;

pub(crate) struct Shared {
    protocol: Protocol,
    port: u16,
    routes: RwLock<Routes>,
    received: AtomicU64,
    unrouted: AtomicU64,
}

impl Shared {
    fn lookup(&self, peer_ip: &str) -> (RouteOutcome, Option<Arc<dyn MessageHandler>>) {
        let routes = self.routes.read();
        if let Some(handler) = routes.get(peer_ip) {
            return (RouteOutcome::Exact, Some(Arc::clone(handler)));
        }
        if let Some(handler) = routes.get(WILDCARD_IP) {
            return (RouteOutcome::Wildcard, Some(Arc::clone(handler)));
        }
        (RouteOutcome::Dropped, None)
    }

    pub(crate) fn dispatch(&self, data: &[u8], peer: IpAddr) -> RouteOutcome {
        self.received.fetch_add(1, Ordering::Relaxed);
        let peer_ip = peer.to_canonical().to_string();
        let (outcome, handler) = self.lookup(&peer_ip);
        match handler {
            Some(handler) => handler.handle_message(data, &peer_ip),
            None => {
                self.unrouted.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    protocol = %self.protocol,
                    port = self.port,
                    peer = %peer_ip,
                    "No source registered for peer, dropping message"
                );
            }
        }
        outcome
    }
}

/// One bound socket plus its peer-IP routing table.
pub struct ListenerMultiplexer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ListenerMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerMultiplexer")
            .field("protocol", &self.shared.protocol)
            .field("local_addr", &self.local_addr)
            .field("sources", &self.source_count())
            .finish()
    }
}

impl ListenerMultiplexer {
    /// Binds `0.0.0.0:port` and starts the read loop. Must be called from
    /// within a tokio runtime.
    pub fn start(protocol: Protocol, port: u16) -> Result<Self, ListenerError> {
        Self::start_on(
            protocol,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        )
    }

    pub fn start_on(protocol: Protocol, address: SocketAddr) -> Result<Self, ListenerError> {
        let cancel = CancellationToken::new();
        let bind_error = |source| ListenerError::Bind {
            protocol,
            address,
            source,
        };

        let (local_addr, shared, task) = match protocol {
            Protocol::Udp => {
                let socket = udp::bind(address).map_err(bind_error)?;
                let local_addr = socket.local_addr().map_err(bind_error)?;
                let shared = Self::shared(protocol, local_addr.port());
                let task = tokio::spawn(udp::run(socket, Arc::clone(&shared), cancel.clone()));
                (local_addr, shared, task)
            }
            Protocol::Tcp => {
                let listener = tcp::bind(address).map_err(bind_error)?;
                let local_addr = listener.local_addr().map_err(bind_error)?;
                let shared = Self::shared(protocol, local_addr.port());
                let task = tokio::spawn(tcp::run(listener, Arc::clone(&shared), cancel.clone()));
                (local_addr, shared, task)
            }
        };

        tracing::info!(protocol = %protocol, address = %local_addr, "Listener started");
        Ok(Self {
            shared,
            local_addr,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    fn shared(protocol: Protocol, port: u16) -> Arc<Shared> {
        Arc::new(Shared {
            protocol,
            port,
            routes: RwLock::new(HashMap::new()),
            received: AtomicU64::new(0),
            unrouted: AtomicU64::new(0),
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.shared.protocol
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registers a route. `peer_key` is a canonical IP string or `0.0.0.0`.
    pub fn add_source(
        &self,
        peer_key: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ListenerError> {
        if self.cancel.is_cancelled() {
            return Err(ListenerError::Closed {
                protocol: self.shared.protocol,
                port: self.shared.port,
            });
        }

        let mut routes = self.shared.routes.write();
        if routes.contains_key(peer_key) {
            return Err(ListenerError::RouteConflict {
                peer: peer_key.to_string(),
                protocol: self.shared.protocol,
                port: self.shared.port,
            });
        }
        routes.insert(peer_key.to_string(), handler);
        tracing::debug!(
            protocol = %self.shared.protocol,
            port = self.shared.port,
            peer = %peer_key,
            sources = routes.len(),
            "Route registered"
        );
        Ok(())
    }

    pub fn remove_source(&self, peer_key: &str) -> bool {
        let removed = self.shared.routes.write().remove(peer_key).is_some();
        if removed {
            tracing::debug!(
                protocol = %self.shared.protocol,
                port = self.shared.port,
                peer = %peer_key,
                "Route removed"
            );
        }
        removed
    }

    pub fn source_count(&self) -> usize {
        self.shared.routes.read().len()
    }

    /// Which route a message from `peer` would take.
    pub fn route(&self, peer: IpAddr) -> RouteOutcome {
        self.shared.lookup(&peer.to_canonical().to_string()).0
    }

    /// Routes one message as if it had arrived on the socket.
    pub fn dispatch(&self, data: &[u8], peer: IpAddr) -> RouteOutcome {
        self.shared.dispatch(data, peer)
    }

    pub fn received_count(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    pub fn unrouted_count(&self) -> u64 {
        self.shared.unrouted.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Closes the socket. Routes are left in place but nothing reaches them.
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if let Some(task) = self.task.lock().as_ref() {
            task.abort();
        }
        tracing::info!(
            protocol = %self.shared.protocol,
            address = %self.local_addr,
            "Listener stopped"
        );
    }

    /// Stops the listener and waits until its socket has been dropped, so the
    /// port can be bound again right away.
    pub async fn close(&self) {
        self.stop();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
            && e.is_panic()
        {
            tracing::error!(address = %self.local_addr, error = %e, "Listener task panicked");
        }
    }
}

impl Drop for ListenerMultiplexer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<(String, String)>>,
    }

    impl MessageHandler for Recorder {
        fn handle_message(&self, data: &[u8], peer_ip: &str) {
            self.messages
                .lock()
                .push((String::from_utf8_lossy(data).into_owned(), peer_ip.to_string()));
        }
    }

    fn local(protocol: Protocol) -> ListenerMultiplexer {
        ListenerMultiplexer::start_on(protocol, "127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn exact_match_wins_over_wildcard() {
        let listener = local(Protocol::Udp);
        let exact = Arc::new(Recorder::default());
        let wildcard = Arc::new(Recorder::default());
        listener.add_source("10.0.0.1", exact.clone()).unwrap();
        listener.add_source(WILDCARD_IP, wildcard.clone()).unwrap();

        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.9".parse().unwrap();
        assert_eq!(listener.dispatch(b"one", a), RouteOutcome::Exact);
        assert_eq!(listener.dispatch(b"two", b), RouteOutcome::Wildcard);

        assert_eq!(exact.messages.lock().len(), 1);
        assert_eq!(wildcard.messages.lock()[0], ("two".to_string(), "10.0.0.9".to_string()));
        listener.stop();
    }

    #[tokio::test]
    async fn unmatched_peer_is_dropped_and_counted() {
        let listener = local(Protocol::Udp);
        listener
            .add_source("10.0.0.1", Arc::new(Recorder::default()))
            .unwrap();

        assert_eq!(
            listener.dispatch(b"x", "10.0.0.2".parse().unwrap()),
            RouteOutcome::Dropped
        );
        assert_eq!(listener.unrouted_count(), 1);
        assert_eq!(listener.received_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_route_is_a_conflict() {
        let listener = local(Protocol::Tcp);
        listener
            .add_source(WILDCARD_IP, Arc::new(Recorder::default()))
            .unwrap();
        let err = listener
            .add_source(WILDCARD_IP, Arc::new(Recorder::default()))
            .unwrap_err();
        assert!(matches!(err, ListenerError::RouteConflict { .. }));
        assert_eq!(err.kind(), ErrorKind::Configuration);

        assert!(listener.remove_source(WILDCARD_IP));
        assert_eq!(listener.source_count(), 0);
    }

    #[tokio::test]
    async fn mapped_ipv6_peers_match_ipv4_routes() {
        let listener = local(Protocol::Udp);
        listener
            .add_source("10.0.0.1", Arc::new(Recorder::default()))
            .unwrap();
        assert_eq!(
            listener.route("::ffff:10.0.0.1".parse().unwrap()),
            RouteOutcome::Exact
        );
    }

    #[tokio::test]
    async fn second_bind_on_same_port_fails() {
        let first = local(Protocol::Tcp);
        let err = ListenerMultiplexer::start_on(Protocol::Tcp, first.local_addr()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ListenerBind);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_port_can_be_bound_again_at_once() {
        for protocol in [Protocol::Udp, Protocol::Tcp] {
            let first = local(protocol);
            let address = first.local_addr();
            first.close().await;

            let second = ListenerMultiplexer::start_on(protocol, address).unwrap();
            assert_eq!(second.local_addr(), address);
            second.close().await;
        }
    }

    #[tokio::test]
    async fn stopped_listener_refuses_routes() {
        let listener = local(Protocol::Udp);
        listener.stop();
        assert!(!listener.is_running());
        assert!(matches!(
            listener.add_source(WILDCARD_IP, Arc::new(Recorder::default())),
            Err(ListenerError::Closed { .. })
        ));
    }
}
