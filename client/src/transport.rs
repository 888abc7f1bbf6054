//! Client network layer: one TCP connection to the host, a reader task and
//! the outbound sender

use bytes::Bytes;
use log::{debug, info, warn};
use shared::frame;
use shared::outbound::{run_sender, OutboundQueue, OutboundReceiver};
use shared::{Lifecycle, NetError, Result, ServiceState};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const SENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What the client session needs from its transport
pub trait ClientTransport: Send + Sync + 'static {
    /// Starts connecting in the background. A no-op while a connection
    /// exists or an attempt is in flight.
    fn connect(&self, server: SocketAddr) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn is_connecting(&self) -> bool;

    /// Queues `payload` for the server. Never blocks.
    fn send_message(&self, payload: &[u8]) -> Result<()>;

    fn next_message(&self) -> Option<Bytes>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write half of the live connection plus the switch that stops its reader
struct Connection {
    generation: u64,
    writer: OwnedWriteHalf,
    cancel: watch::Sender<bool>,
}

struct Shared {
    connection: tokio::sync::Mutex<Option<Connection>>,
    generation: AtomicU64,
    connected: AtomicBool,
    connecting: AtomicBool,
    outbound: OutboundQueue<Bytes>,
    /// Payloads tagged with the generation of the connection they arrived on
    inbound_tx: mpsc::UnboundedSender<(u64, Bytes)>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<(u64, Bytes)>>,
    shutdown: Arc<AtomicBool>,
    shutdown_signal: watch::Sender<bool>,
}

impl Shared {
    /// Forgets connection `generation` if it is still the current one.
    async fn disconnect(&self, generation: u64) {
        let mut slot = self.connection.lock().await;
        let current = matches!(slot.as_ref(), Some(live) if live.generation == generation);
        if !current {
            return;
        }

        if let Some(mut connection) = slot.take() {
            connection.cancel.send_replace(true);
            let _ = connection.writer.shutdown().await;
        }
        self.connected.store(false, Ordering::Release);
        info!("Disconnected from server");
    }

    async fn establish(self: Arc<Self>, server: SocketAddr) {
        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(server)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Failed to connect to {}: {}", server, e);
                self.connecting.store(false, Ordering::Release);
                return;
            }
            Err(_) => {
                warn!("Timed out connecting to {}", server);
                self.connecting.store(false, Ordering::Release);
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let (reader, writer) = stream.into_split();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (cancel, cancelled) = watch::channel(false);

        *self.connection.lock().await = Some(Connection {
            generation,
            writer,
            cancel,
        });
        self.connected.store(true, Ordering::Release);
        self.connecting.store(false, Ordering::Release);
        info!("Connected to {}", server);

        tokio::spawn(Self::read_loop(self, reader, generation, cancelled));
    }

    /// Reads records for connection `generation` until it fails or is
    /// disconnected from the write side.
    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        generation: u64,
        mut cancelled: watch::Receiver<bool>,
    ) {
        let mut shutdown_rx = self.shutdown_signal.subscribe();

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
                    Ok(payload) => {
                        if self.inbound_tx.send((generation, payload)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        info!("Server sent a malformed frame: {}", e);
                        break;
                    }
                },
                Ok(None) => {
                    debug!("Server closed the connection");
                    break;
                }
                Err(e) => {
                    info!("Error reading from server: {}", e);
                    break;
                }
            }
        }

        self.disconnect(generation).await;
    }

    async fn write(&self, record: Bytes) {
        let mut slot = self.connection.lock().await;
        let Some(connection) = slot.as_mut() else {
            debug!("Dropping outgoing message, not connected");
            return;
        };
        let generation = connection.generation;

        let result = timeout(
            WRITE_TIMEOUT,
            frame::write_record(&mut connection.writer, &record),
        )
        .await;
        drop(slot);

        let failed = match result {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                warn!("Failed to send to server: {}", e);
                true
            }
            Err(_) => {
                warn!("Timed out sending to server");
                true
            }
        };
        if failed {
            self.disconnect(generation).await;
        }
    }
}

/// Client transport engine.
///
/// `connect` may be called again after the connection drops; the session
/// layer does so on its next update.
pub struct NetworkClient {
    shared: Arc<Shared>,
    lifecycle: Lifecycle,
    outbound_rx: Mutex<Option<OutboundReceiver<Bytes>>>,
    sender_task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkClient {
    pub fn new(max_outgoing: usize) -> Result<Self> {
        let (outbound, outbound_rx) = OutboundQueue::bounded(max_outgoing)?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_signal, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(Shared {
                connection: tokio::sync::Mutex::new(None),
                generation: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                outbound,
                inbound_tx,
                inbound_rx: Mutex::new(inbound_rx),
                shutdown: Arc::new(AtomicBool::new(false)),
                shutdown_signal,
            }),
            lifecycle: Lifecycle::new(),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            sender_task: Mutex::new(None),
        })
    }

    /// Starts the sender. Connecting is a separate step.
    pub fn start(&self) -> Result<()> {
        if !self
            .lifecycle
            .transition(ServiceState::New, ServiceState::Starting)
        {
            return Err(NetError::ServiceFailed);
        }

        let Some(outbound_rx) = lock(&self.outbound_rx).take() else {
            self.lifecycle.set(ServiceState::Failed);
            return Err(NetError::ServiceFailed);
        };

        let shared = Arc::clone(&self.shared);
        let shutdown = Arc::clone(&self.shared.shutdown);
        let sender = tokio::spawn(run_sender(outbound_rx, shutdown, move |record: Bytes| {
            let shared = Arc::clone(&shared);
            async move { shared.write(record).await }
        }));
        *lock(&self.sender_task) = Some(sender);

        self.lifecycle.set(ServiceState::Running);
        Ok(())
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    pub async fn await_running(&self) -> Result<()> {
        self.lifecycle.await_running().await
    }

    pub async fn await_terminated(&self, limit: Duration) -> Result<()> {
        self.lifecycle.await_terminated(limit).await
    }

    /// Gives queued messages one drain attempt, then closes the connection.
    pub async fn stop(&self) -> Result<()> {
        if !self
            .lifecycle
            .transition(ServiceState::Running, ServiceState::Stopping)
        {
            self.lifecycle
                .transition(ServiceState::New, ServiceState::Terminated);
            return Ok(());
        }

        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.shutdown_signal.send_replace(true);

        let sender = lock(&self.sender_task).take();
        if let Some(sender) = sender {
            if timeout(SENDER_DRAIN_TIMEOUT, sender).await.is_err() {
                warn!("Sender did not drain within {:?}", SENDER_DRAIN_TIMEOUT);
            }
        }

        let generation = self.shared.generation.load(Ordering::Acquire);
        self.shared.disconnect(generation).await;

        self.lifecycle.set(ServiceState::Terminated);
        debug!("Client transport terminated");
        Ok(())
    }
}

impl ClientTransport for NetworkClient {
    fn connect(&self, server: SocketAddr) -> Result<()> {
        if self.lifecycle.state() != ServiceState::Running {
            return Err(NetError::ServiceFailed);
        }
        if self.shared.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        if self
            .shared
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        debug!("Connecting to {}", server);
        tokio::spawn(Arc::clone(&self.shared).establish(server));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn is_connecting(&self) -> bool {
        self.shared.connecting.load(Ordering::Acquire)
    }

    fn send_message(&self, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(NetError::Disconnected);
        }
        let record = frame::encode_record(payload)?;
        self.shared.outbound.enqueue(record)
    }

    /// Pops the oldest payload received on the current connection.
    /// Leftovers from earlier connections are discarded.
    fn next_message(&self) -> Option<Bytes> {
        let current = self.shared.generation.load(Ordering::Acquire);
        let mut inbound = lock(&self.shared.inbound_rx);
        while let Ok((generation, payload)) = inbound.try_recv() {
            if generation == current {
                return Some(payload);
            }
            debug!("Discarding message from connection generation {}", generation);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn running_client() -> NetworkClient {
        let client = NetworkClient::new(16).unwrap();
        client.start().unwrap();
        client
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_invalid_capacity_is_rejected() {
        assert!(matches!(
            NetworkClient::new(0),
            Err(NetError::InvalidQueueCapacity(0))
        ));
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let client = running_client().await;
        assert!(matches!(
            client.send_message(b"hello"),
            Err(NetError::Disconnected)
        ));
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_requires_running_transport() {
        let client = NetworkClient::new(16).unwrap();
        let addr = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(client.connect(addr), Err(NetError::ServiceFailed)));
    }

    #[tokio::test]
    async fn test_round_trip_with_server_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = running_client().await;

        client.connect(addr).unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();
        assert!(wait_until(|| client.is_connected()).await);
        assert!(!client.is_connecting());

        client.send_message(b"ping").unwrap();
        let frame = frame::read_record(&mut server_side).await.unwrap().unwrap();
        assert_eq!(&frame::decode(&frame).unwrap()[..], b"ping");

        let reply = frame::encode_record(b"pong").unwrap();
        server_side.write_all(&reply).await.unwrap();
        let mut received = None;
        for _ in 0..200 {
            received = client.next_message();
            if received.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(received.as_deref(), Some(&b"pong"[..]));

        tokio_test::assert_ok!(client.stop().await);
        assert_eq!(client.state(), ServiceState::Terminated);
        let mut rest = Vec::new();
        server_side.read_to_end(&mut rest).await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_marker_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = running_client().await;
        client.connect(listener.local_addr().unwrap()).unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();
        assert!(wait_until(|| client.is_connected()).await);

        let mut bogus = 6u32.to_be_bytes().to_vec();
        bogus.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        server_side.write_all(&bogus).await.unwrap();

        assert!(wait_until(|| !client.is_connected()).await);
        assert!(client.next_message().is_none());
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_after_server_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = running_client().await;

        client.connect(addr).unwrap();
        let (first, _) = listener.accept().await.unwrap();
        assert!(wait_until(|| client.is_connected()).await);
        drop(first);
        assert!(wait_until(|| !client.is_connected()).await);

        tokio_test::assert_ok!(client.connect(addr));
        let (_second, _) = listener.accept().await.unwrap();
        assert!(wait_until(|| client.is_connected()).await);
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_messages_from_previous_connection_are_discarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = running_client().await;

        client.connect(addr).unwrap();
        let (mut first, _) = listener.accept().await.unwrap();
        assert!(wait_until(|| client.is_connected()).await);
        first
            .write_all(&frame::encode_record(b"stale").unwrap())
            .await
            .unwrap();
        drop(first);
        assert!(wait_until(|| !client.is_connected()).await);

        client.connect(addr).unwrap();
        let (mut second, _) = listener.accept().await.unwrap();
        assert!(wait_until(|| client.is_connected()).await);
        assert!(client.next_message().is_none());

        second
            .write_all(&frame::encode_record(b"fresh").unwrap())
            .await
            .unwrap();
        let mut received = None;
        for _ in 0..200 {
            received = client.next_message();
            if received.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(received.as_deref(), Some(&b"fresh"[..]));
        client.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_connect_clears_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = running_client().await;
        client.connect(addr).unwrap();
        assert!(wait_until(|| !client.is_connecting()).await);
        assert!(!client.is_connected());
        client.stop().await.unwrap();
    }
}
