//! Server network layer: TCP accept loop, per-connection readers and the
//! single outbound sender

use crate::registry::ConnectionRegistry;
use bytes::Bytes;
use log::{debug, error, info, warn};
use shared::frame;
use shared::outbound::{run_sender, OutboundQueue, OutboundReceiver};
use shared::{ConnectionId, InboundMessage, Lifecycle, NetError, Result, ServiceState};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How long `stop` waits for the sender to finish its final drain
pub const SENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A single write that takes longer than this counts as a failed connection
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

pub type DroppedListener = Arc<dyn Fn(ConnectionId) + Send + Sync>;

/// What the session layer and the tick loop need from the server transport
pub trait ServerTransport: Send + Sync + 'static {
    /// Queues `payload` for `recipient`. Never blocks.
    fn send_message(&self, recipient: ConnectionId, payload: &[u8]) -> Result<()>;

    /// Pops the oldest inbound message, if any
    fn next_message(&self) -> Option<InboundMessage>;

    /// Pops the oldest dropped connection, if any
    fn next_disconnected(&self) -> Option<ConnectionId>;

    fn is_connected(&self, id: &ConnectionId) -> bool;

    fn add_connection_dropped_listener(&self, listener: DroppedListener);
}

/// Write side of one live connection, as stored in the registry
#[derive(Clone)]
pub struct ConnectionHandle {
    peer: SocketAddr,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    cancel: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// Returns the handle and the receiver its reader task watches.
    fn new(peer: SocketAddr, writer: OwnedWriteHalf) -> (Self, watch::Receiver<bool>) {
        let (cancel, cancelled) = watch::channel(false);
        let handle = Self {
            peer,
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            cancel: Arc::new(cancel),
        };
        (handle, cancelled)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Stops the reader task, releasing the read half of the socket
    fn cancel_reader(&self) {
        self.cancel.send_replace(true);
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Error shutting down connection to {}: {}", self.peer, e);
        }
    }
}

struct OutgoingMessage {
    recipient: ConnectionId,
    handle: ConnectionHandle,
    record: Bytes,
}

/// State shared between the server handle and its I/O tasks
struct Shared {
    registry: ConnectionRegistry<ConnectionHandle>,
    outbound: OutboundQueue<OutgoingMessage>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    dropped_tx: mpsc::UnboundedSender<ConnectionId>,
    dropped_rx: Mutex<mpsc::UnboundedReceiver<ConnectionId>>,
    listeners: RwLock<Vec<DroppedListener>>,
    shutdown: Arc<AtomicBool>,
    shutdown_signal: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn push_incoming(&self, message: InboundMessage) {
        if self.inbound_tx.send(message).is_err() {
            error!("Inbound queue closed, dropping message");
        }
    }

    /// Tears down `id` once. Later calls for the same id find nothing to do,
    /// so observers hear about each connection exactly once.
    async fn drop_connection(&self, id: ConnectionId) {
        let Some(handle) = self.registry.remove(&id) else {
            return;
        };

        info!("Connection {} from {} dropped", id, handle.peer);
        handle.cancel_reader();
        if timeout(WRITE_TIMEOUT, handle.close()).await.is_err() {
            debug!("Timed out closing connection {}", id);
        }

        self.report_dropped(id);
    }

    fn report_dropped(&self, id: ConnectionId) {
        if self.dropped_tx.send(id).is_err() {
            error!("Disconnected queue closed, dropping notification for {}", id);
        }
        self.notify_dropped(id);
    }

    fn notify_dropped(&self, id: ConnectionId) {
        let listeners: Vec<DroppedListener> = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(id))).is_err() {
                warn!("Connection dropped listener panicked for {}", id);
            }
        }
    }
}

/// Authoritative TCP transport.
///
/// Owns the registry, the inbound queue and the bounded outbound queue.
/// Reading happens on one task per connection; all writing happens on the
/// single sender task, so messages for a connection leave in queue order.
pub struct NetworkServer {
    bind_addr: SocketAddr,
    shared: Arc<Shared>,
    lifecycle: Lifecycle,
    outbound_rx: Mutex<Option<OutboundReceiver<OutgoingMessage>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    sender_task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkServer {
    pub fn new(bind_addr: SocketAddr, max_outgoing: usize) -> Result<Self> {
        let (outbound, outbound_rx) = OutboundQueue::bounded(max_outgoing)?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (dropped_tx, dropped_rx) = mpsc::unbounded_channel();
        let (shutdown_signal, _) = watch::channel(false);

        Ok(Self {
            bind_addr,
            shared: Arc::new(Shared {
                registry: ConnectionRegistry::new(),
                outbound,
                inbound_tx,
                inbound_rx: Mutex::new(inbound_rx),
                dropped_tx,
                dropped_rx: Mutex::new(dropped_rx),
                listeners: RwLock::new(Vec::new()),
                shutdown: Arc::new(AtomicBool::new(false)),
                shutdown_signal,
            }),
            lifecycle: Lifecycle::new(),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            sender_task: Mutex::new(None),
        })
    }

    /// Binds the listener and starts the accept loop and the sender.
    ///
    /// A bind failure leaves the transport `Failed` and is returned as
    /// [`NetError::StartupFailed`].
    pub async fn start(&self) -> Result<()> {
        if !self
            .lifecycle
            .transition(ServiceState::New, ServiceState::Starting)
        {
            return Err(NetError::ServiceFailed);
        }

        let listener = match TcpListener::bind(self.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind {}: {}", self.bind_addr, e);
                self.lifecycle.set(ServiceState::Failed);
                return Err(NetError::StartupFailed(e));
            }
        };

        let local_addr = listener.local_addr()?;
        *lock(&self.local_addr) = Some(local_addr);
        info!("Server listening on {}", local_addr);

        let Some(outbound_rx) = lock(&self.outbound_rx).take() else {
            self.lifecycle.set(ServiceState::Failed);
            return Err(NetError::ServiceFailed);
        };

        let sender = tokio::spawn(Self::run_network_sender(
            Arc::clone(&self.shared),
            outbound_rx,
        ));
        *lock(&self.sender_task) = Some(sender);

        let accept = tokio::spawn(Self::accept_loop(listener, Arc::clone(&self.shared)));
        *lock(&self.accept_task) = Some(accept);

        self.lifecycle.set(ServiceState::Running);
        Ok(())
    }

    pub async fn await_running(&self) -> Result<()> {
        self.lifecycle.await_running().await
    }

    pub async fn await_terminated(&self, limit: Duration) -> Result<()> {
        self.lifecycle.await_terminated(limit).await
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    /// Address actually bound, available once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn connected_ids(&self) -> Vec<ConnectionId> {
        self.shared.registry.ids()
    }

    /// Stops accepting, gives the sender one bounded final drain, then
    /// closes every connection.
    pub async fn stop(&self) -> Result<()> {
        if !self
            .lifecycle
            .transition(ServiceState::Running, ServiceState::Stopping)
        {
            if self
                .lifecycle
                .transition(ServiceState::New, ServiceState::Terminated)
            {
                debug!("Network server stopped before it was started");
            }
            return Ok(());
        }

        info!("Stopping network server");
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.shutdown_signal.send_replace(true);

        let sender = lock(&self.sender_task).take();
        if let Some(sender) = sender {
            match timeout(SENDER_DRAIN_TIMEOUT, sender).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Sender task failed: {}", e),
                Err(_) => warn!("Sender did not drain within {:?}", SENDER_DRAIN_TIMEOUT),
            }
        }

        let accept = lock(&self.accept_task).take();
        if let Some(accept) = accept {
            accept.abort();
            let _ = accept.await;
        }

        for (id, handle) in self.shared.registry.remove_all() {
            debug!("Closing connection {}", id);
            handle.cancel_reader();
            if timeout(WRITE_TIMEOUT, handle.close()).await.is_err() {
                debug!("Timed out closing connection {}", id);
            }
            self.shared.report_dropped(id);
        }

        self.lifecycle.set(ServiceState::Terminated);
        info!("Network server terminated");
        Ok(())
    }

    async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
        let mut shutdown_rx = shared.shutdown_signal.subscribe();

        loop {
            let stopping = *shutdown_rx.borrow_and_update();
            if stopping {
                break;
            }

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => Self::register_connection(&shared, stream, peer),
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = shutdown_rx.changed() => break,
            }
        }

        debug!("Accept loop stopped");
    }

    fn register_connection(shared: &Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let (reader, writer) = stream.into_split();
        let id = ConnectionId::new();
        let (handle, cancelled) = ConnectionHandle::new(peer, writer);
        shared.registry.register(id, handle);
        info!("Connection {} accepted from {}", id, peer);

        tokio::spawn(Self::connection_reader(
            id,
            reader,
            cancelled,
            Arc::clone(shared),
        ));
    }

    /// Reads records until the peer goes away, sends something invalid or
    /// the connection is dropped from the write side.
    async fn connection_reader(
        id: ConnectionId,
        mut reader: OwnedReadHalf,
        mut cancelled: watch::Receiver<bool>,
        shared: Arc<Shared>,
    ) {
        let mut shutdown_rx = shared.shutdown_signal.subscribe();

        loop {
            let stopping = *shutdown_rx.borrow_and_update() || *cancelled.borrow_and_update();
            if stopping {
                return;
            }

            let record = tokio::select! {
                biased;
                _ = cancelled.changed() => return,
                _ = shutdown_rx.changed() => return,
                record = frame::read_record(&mut reader) => record,
            };

            match record {
                Ok(Some(record)) => match frame::decode(&record) {
                    Ok(payload) => shared.push_incoming(InboundMessage::new(id, payload)),
                    Err(e) => {
                        info!("Connection {} sent a malformed frame: {}", id, e);
                        break;
                    }
                },
                Ok(None) => {
                    debug!("Connection {} closed by peer", id);
                    break;
                }
                Err(e) => {
                    info!("Error reading from connection {}: {}", id, e);
                    break;
                }
            }
        }

        shared.drop_connection(id).await;
    }

    async fn run_network_sender(shared: Arc<Shared>, outbound_rx: OutboundReceiver<OutgoingMessage>) {
        let shutdown = Arc::clone(&shared.shutdown);
        run_sender(outbound_rx, shutdown, move |message: OutgoingMessage| {
            let shared = Arc::clone(&shared);
            async move {
                let written = {
                    let mut writer = message.handle.writer.lock().await;
                    timeout(WRITE_TIMEOUT, frame::write_record(&mut *writer, &message.record)).await
                };

                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("Failed to send to connection {}: {}", message.recipient, e);
                        shared.drop_connection(message.recipient).await;
                    }
                    Err(_) => {
                        warn!("Timed out sending to connection {}", message.recipient);
                        shared.drop_connection(message.recipient).await;
                    }
                }
            }
        })
        .await;
    }
}

impl ServerTransport for NetworkServer {
    fn send_message(&self, recipient: ConnectionId, payload: &[u8]) -> Result<()> {
        let handle = self
            .shared
            .registry
            .lookup(&recipient)
            .ok_or(NetError::NotConnected(recipient))?;
        let record = frame::encode_record(payload)?;

        self.shared.outbound.enqueue(OutgoingMessage {
            recipient,
            handle,
            record,
        })
    }

    fn next_message(&self) -> Option<InboundMessage> {
        lock(&self.shared.inbound_rx).try_recv().ok()
    }

    fn next_disconnected(&self) -> Option<ConnectionId> {
        lock(&self.shared.dropped_rx).try_recv().ok()
    }

    fn is_connected(&self, id: &ConnectionId) -> bool {
        self.shared.registry.contains(id)
    }

    fn add_connection_dropped_listener(&self, listener: DroppedListener) {
        self.shared
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }
}
