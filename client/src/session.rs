//! Client half of the session handshake
//!
//! `Disconnected -> Connecting -> AwaitingAuthReply -> Authenticated -> Joined`.
//! Whenever the transport is found disconnected the session goes back to
//! `Disconnected`, reconnects and authenticates again on a later update.

use crate::transport::ClientTransport;
use log::{debug, info, warn};
use shared::{Color, ConnectionId, EntityUpdate, Envelope, InputSnapshot};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub name: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secret: secret.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    AwaitingAuthReply,
    Authenticated,
    Joined,
    /// The server refused the credentials; waits for [`ClientSession::retry_with`]
    Rejected,
}

pub struct ClientSession<T: ClientTransport> {
    transport: Arc<T>,
    server: SocketAddr,
    credentials: Credentials,
    nickname: String,
    state: ClientState,
    identity: Option<ConnectionId>,
    color: Color,
    input: InputSnapshot,
    input_dirty: bool,
    snapshot: Option<Vec<EntityUpdate>>,
    snapshots_received: u64,
}

impl<T: ClientTransport> ClientSession<T> {
    pub fn new(
        transport: Arc<T>,
        server: SocketAddr,
        credentials: Credentials,
        nickname: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            server,
            credentials,
            nickname: nickname.into(),
            state: ClientState::Disconnected,
            identity: None,
            color: Color::WHITE,
            input: InputSnapshot::default(),
            input_dirty: false,
            snapshot: None,
            snapshots_received: 0,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Identity the server assigned on the last successful authentication
    pub fn identity(&self) -> Option<ConnectionId> {
        self.identity
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn latest_snapshot(&self) -> Option<&[EntityUpdate]> {
        self.snapshot.as_deref()
    }

    pub fn snapshots_received(&self) -> u64 {
        self.snapshots_received
    }

    /// This client's own player entity in the latest snapshot
    pub fn own_entity(&self) -> Option<&EntityUpdate> {
        let identity = self.identity?;
        self.latest_snapshot()?
            .iter()
            .find(|entity| entity.is_player() && entity.entity_id == identity.uuid())
    }

    /// Replaces the held keys. Sent on the next update once joined.
    pub fn set_input(&mut self, input: InputSnapshot) {
        if input != self.input {
            self.input = input;
            self.input_dirty = true;
        }
    }

    /// After a rejection, tries again with new credentials.
    pub fn retry_with(&mut self, credentials: Credentials) {
        self.credentials = credentials;
        if self.state == ClientState::Rejected {
            if self.transport.is_connected() {
                self.authenticate();
            } else {
                self.state = ClientState::Disconnected;
            }
        }
    }

    /// Advances the handshake and processes everything the server sent.
    pub fn update(&mut self) {
        if !self.transport.is_connected() {
            self.reconnect();
            return;
        }

        if matches!(
            self.state,
            ClientState::Disconnected | ClientState::Connecting
        ) {
            self.authenticate();
        }

        while let Some(payload) = self.transport.next_message() {
            match Envelope::decode(&payload) {
                Ok(envelope) => self.handle(envelope),
                Err(e) => warn!("Ignoring undecodable message from server: {}", e),
            }
        }

        if self.state == ClientState::Joined && self.input_dirty {
            if self.send(&Envelope::ClientInput(self.input)) {
                self.input_dirty = false;
            }
        }
    }

    fn reconnect(&mut self) {
        self.discard_stale_messages();

        if !matches!(
            self.state,
            ClientState::Disconnected | ClientState::Connecting
        ) {
            info!("Lost connection to server, reconnecting");
            self.identity = None;
            self.snapshot = None;
            self.state = ClientState::Disconnected;
        }

        if self.transport.is_connecting() {
            self.state = ClientState::Connecting;
            return;
        }

        match self.transport.connect(self.server) {
            Ok(()) => self.state = ClientState::Connecting,
            Err(e) => warn!("Could not start connecting to {}: {}", self.server, e),
        }
    }

    /// Whatever is still queued belongs to the connection that just dropped.
    fn discard_stale_messages(&self) {
        let mut discarded = 0;
        while self.transport.next_message().is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!("Discarded {} messages from the previous connection", discarded);
        }
    }

    fn authenticate(&mut self) {
        let request = Envelope::AuthenticateRequest {
            name: self.credentials.name.clone(),
            secret: self.credentials.secret.clone(),
        };
        if self.send(&request) {
            debug!("Authenticating as {}", self.credentials.name);
            self.state = ClientState::AwaitingAuthReply;
        }
    }

    fn join(&mut self) {
        let request = Envelope::JoinRequest {
            nickname: self.nickname.clone(),
        };
        if self.send(&request) {
            self.state = ClientState::Joined;
            self.input_dirty = !self.input.is_idle();
        }
    }

    fn handle(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::AuthenticationReply {
                authenticated,
                identity,
                assigned_color,
            } => {
                if self.state != ClientState::AwaitingAuthReply {
                    debug!("Ignoring authentication reply in state {:?}", self.state);
                    return;
                }

                if authenticated {
                    self.identity = identity;
                    self.color = assigned_color.unwrap_or(Color::WHITE);
                    self.state = ClientState::Authenticated;
                    info!("Authenticated, identity {:?}", self.identity);
                    self.join();
                } else {
                    warn!("Server rejected credentials for {}", self.credentials.name);
                    self.state = ClientState::Rejected;
                }
            }
            Envelope::StateSnapshot { entities } => {
                self.snapshots_received += 1;
                self.snapshot = Some(entities);
            }
            other => warn!("Unexpected {} from server", other.kind()),
        }
    }

    fn send(&self, envelope: &Envelope) -> bool {
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode {}: {}", envelope.kind(), e);
                return false;
            }
        };

        match self.transport.send_message(&payload) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send {}: {}", envelope.kind(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use shared::{EntityKind, NetError, Result};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockTransport {
        connected: AtomicBool,
        connects: AtomicUsize,
        sent: Mutex<Vec<Envelope>>,
        inbound: Mutex<Vec<Bytes>>,
    }

    impl MockTransport {
        fn push(&self, envelope: Envelope) {
            self.inbound
                .lock()
                .unwrap()
                .push(Bytes::from(envelope.encode().unwrap()));
        }

        fn take_sent(&self) -> Vec<Envelope> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl ClientTransport for MockTransport {
        fn connect(&self, _server: SocketAddr) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn is_connecting(&self) -> bool {
            false
        }

        fn send_message(&self, payload: &[u8]) -> Result<()> {
            if !self.is_connected() {
                return Err(NetError::Disconnected);
            }
            self.sent
                .lock()
                .unwrap()
                .push(Envelope::decode(payload).unwrap());
            Ok(())
        }

        fn next_message(&self) -> Option<Bytes> {
            let mut inbound = self.inbound.lock().unwrap();
            if inbound.is_empty() {
                None
            } else {
                Some(inbound.remove(0))
            }
        }
    }

    fn session() -> (Arc<MockTransport>, ClientSession<MockTransport>) {
        let transport = Arc::new(MockTransport::default());
        let session = ClientSession::new(
            Arc::clone(&transport),
            "127.0.0.1:1666".parse().unwrap(),
            Credentials::new("alice", "pw"),
            "Al",
        );
        (transport, session)
    }

    fn auth_request() -> Envelope {
        Envelope::AuthenticateRequest {
            name: "alice".to_string(),
            secret: "pw".to_string(),
        }
    }

    #[test]
    fn test_connects_then_authenticates() {
        let (transport, mut session) = session();

        session.update();
        assert_eq!(session.state(), ClientState::Connecting);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);

        session.update();
        assert_eq!(session.state(), ClientState::AwaitingAuthReply);
        assert_eq!(transport.take_sent(), vec![auth_request()]);
    }

    #[test]
    fn test_join_sent_right_after_accepted_reply() {
        let (transport, mut session) = session();
        session.update();
        session.update();
        transport.take_sent();

        let id = ConnectionId::new();
        let color = Color::new(1, 2, 3);
        transport.push(Envelope::accepted(id, color));
        session.update();

        assert_eq!(session.state(), ClientState::Joined);
        assert_eq!(session.identity(), Some(id));
        assert_eq!(session.color(), color);
        assert_eq!(
            transport.take_sent(),
            vec![Envelope::JoinRequest {
                nickname: "Al".to_string()
            }]
        );
    }

    #[test]
    fn test_missing_color_falls_back_to_white() {
        let (transport, mut session) = session();
        session.update();
        session.update();

        transport.push(Envelope::AuthenticationReply {
            authenticated: true,
            identity: Some(ConnectionId::new()),
            assigned_color: None,
        });
        session.update();

        assert_eq!(session.color(), Color::WHITE);
    }

    #[test]
    fn test_rejection_then_retry() {
        let (transport, mut session) = session();
        session.update();
        session.update();
        transport.take_sent();

        transport.push(Envelope::rejected());
        session.update();
        assert_eq!(session.state(), ClientState::Rejected);
        assert!(session.identity().is_none());
        assert!(transport.take_sent().is_empty());

        session.update();
        assert_eq!(session.state(), ClientState::Rejected);

        session.retry_with(Credentials::new("bob", "pw2"));
        assert_eq!(session.state(), ClientState::AwaitingAuthReply);
        assert_eq!(
            transport.take_sent(),
            vec![Envelope::AuthenticateRequest {
                name: "bob".to_string(),
                secret: "pw2".to_string(),
            }]
        );
    }

    #[test]
    fn test_input_sent_only_when_joined_and_changed() {
        let (transport, mut session) = session();
        let input = InputSnapshot::new(false, false, true, false);
        session.set_input(input);
        session.update();
        session.update();
        transport.push(Envelope::accepted(ConnectionId::new(), Color::WHITE));
        session.update();

        let sent = transport.take_sent();
        assert_eq!(sent.last(), Some(&Envelope::ClientInput(input)));

        session.set_input(input);
        session.update();
        assert!(transport.take_sent().is_empty());
    }

    #[test]
    fn test_drop_triggers_reconnect_and_reauth() {
        let (transport, mut session) = session();
        session.update();
        session.update();
        transport.push(Envelope::accepted(ConnectionId::new(), Color::WHITE));
        session.update();
        transport.take_sent();

        transport.connected.store(false, Ordering::SeqCst);
        session.update();
        assert_eq!(session.state(), ClientState::Connecting);
        assert!(session.identity().is_none());
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);

        session.update();
        assert_eq!(transport.take_sent(), vec![auth_request()]);
    }

    #[test]
    fn test_reply_from_dropped_connection_is_discarded() {
        let (transport, mut session) = session();
        session.update();
        session.update();
        assert_eq!(session.state(), ClientState::AwaitingAuthReply);

        let old = ConnectionId::new();
        transport.push(Envelope::accepted(old, Color::WHITE));
        transport.connected.store(false, Ordering::SeqCst);
        session.update();
        session.update();
        assert_eq!(session.state(), ClientState::AwaitingAuthReply);
        assert!(session.identity().is_none());
        assert_eq!(transport.take_sent(), vec![auth_request(), auth_request()]);

        let fresh = ConnectionId::new();
        transport.push(Envelope::accepted(fresh, Color::WHITE));
        session.update();
        assert_eq!(session.state(), ClientState::Joined);
        assert_eq!(session.identity(), Some(fresh));
    }

    #[test]
    fn test_snapshot_is_kept_and_own_entity_found() {
        let (transport, mut session) = session();
        session.update();
        session.update();
        let id = ConnectionId::new();
        transport.push(Envelope::accepted(id, Color::WHITE));
        transport.push(Envelope::StateSnapshot {
            entities: vec![EntityUpdate {
                entity_id: id.uuid(),
                x: 1.0,
                y: 2.0,
                kind: EntityKind::Player {
                    score: 0,
                    name: "Al".to_string(),
                    color: Color::WHITE,
                },
            }],
        });
        session.update();

        assert_eq!(session.snapshots_received(), 1);
        assert_eq!(session.latest_snapshot().map(|s| s.len()), Some(1));
        assert!(session.own_entity().is_some());
    }
}
