//! Server side of the session handshake: authenticate, join, then input.
//!
//! Handlers run on dispatch workers, never on the tick task, so they do not
//! touch the simulation. Every change the simulation needs is pushed as a
//! [`SimCommand`] and applied by the tick loop at the start of its next tick.

use crate::transport::ServerTransport;
use crate::utils::ColorPicker;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use shared::protocol::credentials_valid;
use shared::{Color, ConnectionId, Envelope, InboundMessage, InputSnapshot};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Joined,
}

/// Simulation change requested by a handler, applied on the tick task
#[derive(Debug, Clone, PartialEq)]
pub enum SimCommand {
    AddPlayer {
        id: ConnectionId,
        nickname: String,
        color: Color,
    },
    RemovePlayer {
        id: ConnectionId,
    },
    PlayerInput {
        id: ConnectionId,
        input: InputSnapshot,
    },
}

#[derive(Debug, Clone, Copy)]
struct Session {
    state: SessionState,
    color: Color,
}

/// Anything the dispatch pool can hand inbound messages to
pub trait MessageHandler: Send + Sync + 'static {
    fn handle_message(&self, message: InboundMessage);
}

pub struct SessionHandler<T: ServerTransport> {
    transport: Arc<T>,
    sessions: DashMap<ConnectionId, Session>,
    colors: ColorPicker,
    commands: mpsc::UnboundedSender<SimCommand>,
}

impl<T: ServerTransport> SessionHandler<T> {
    /// Creates the handler and subscribes it to dropped connections.
    pub fn new(transport: Arc<T>) -> (Arc<Self>, mpsc::UnboundedReceiver<SimCommand>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            transport: Arc::clone(&transport),
            sessions: DashMap::new(),
            colors: ColorPicker::new(),
            commands,
        });

        let weak: Weak<Self> = Arc::downgrade(&handler);
        transport.add_connection_dropped_listener(Arc::new(move |id: ConnectionId| {
            if let Some(handler) = weak.upgrade() {
                handler.connection_dropped(id);
            }
        }));

        (handler, command_rx)
    }

    pub fn state_of(&self, id: &ConnectionId) -> SessionState {
        self.sessions
            .get(id)
            .map(|session| session.state)
            .unwrap_or(SessionState::Unauthenticated)
    }

    pub fn joined_connections(&self) -> Vec<ConnectionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().state == SessionState::Joined)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Ends the session for `id`, removing its player if it had joined.
    /// Safe to call more than once.
    pub fn connection_dropped(&self, id: ConnectionId) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            debug!("Session for {} ended in state {:?}", id, session.state);
            if session.state == SessionState::Joined {
                self.push(SimCommand::RemovePlayer { id });
            }
        }
    }

    fn authenticate(&self, id: ConnectionId, name: &str, secret: &str) {
        if let Some((_, previous)) = self.sessions.remove(&id) {
            info!("Connection {} re-authenticating", id);
            if previous.state == SessionState::Joined {
                self.push(SimCommand::RemovePlayer { id });
            }
        }

        let reply = if credentials_valid(name, secret) {
            let color = self.colors.next_color();
            self.sessions.insert(
                id,
                Session {
                    state: SessionState::Authenticated,
                    color,
                },
            );
            info!("Connection {} authenticated as {}", id, name);
            Envelope::accepted(id, color)
        } else {
            info!("Connection {} failed authentication", id);
            Envelope::rejected()
        };

        self.reply(id, &reply);
    }

    fn join(&self, id: ConnectionId, nickname: String) {
        let Some(mut session) = self.sessions.get_mut(&id) else {
            warn!("Ignoring JoinRequest from unauthenticated connection {}", id);
            return;
        };

        match session.state {
            SessionState::Authenticated => {
                session.state = SessionState::Joined;
                let color = session.color;
                drop(session);

                info!("Connection {} joined as {}", id, nickname);
                self.push(SimCommand::AddPlayer {
                    id,
                    nickname,
                    color,
                });
            }
            SessionState::Joined => debug!("Connection {} already joined", id),
            SessionState::Unauthenticated => {
                warn!("Ignoring JoinRequest from unauthenticated connection {}", id)
            }
        }
    }

    fn input(&self, id: ConnectionId, input: InputSnapshot) {
        if self.state_of(&id) == SessionState::Joined {
            self.push(SimCommand::PlayerInput { id, input });
        } else {
            debug!("Ignoring input from connection {} that has not joined", id);
        }
    }

    fn reply(&self, id: ConnectionId, envelope: &Envelope) {
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode {}: {}", envelope.kind(), e);
                return;
            }
        };

        if let Err(e) = self.transport.send_message(id, &payload) {
            warn!("Failed to send {} to {}: {}", envelope.kind(), id, e);
        }
    }

    fn push(&self, command: SimCommand) {
        if self.commands.send(command).is_err() {
            error!("Simulation command queue closed");
        }
    }
}

impl<T: ServerTransport> MessageHandler for SessionHandler<T> {
    fn handle_message(&self, message: InboundMessage) {
        let InboundMessage { source, payload } = message;

        if !self.transport.is_connected(&source) {
            debug!("Dropping message from closed connection {}", source);
            return;
        }

        let envelope = match Envelope::decode(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Ignoring undecodable message from {}: {}", source, e);
                return;
            }
        };

        match envelope {
            Envelope::AuthenticateRequest { name, secret } => {
                self.authenticate(source, &name, &secret)
            }
            Envelope::JoinRequest { nickname } => self.join(source, nickname),
            Envelope::ClientInput(input) => self.input(source, input),
            other @ (Envelope::AuthenticationReply { .. } | Envelope::StateSnapshot { .. }) => {
                warn!("Connection {} sent server-only {}", source, other.kind())
            }
        }
    }
}
