//! # Client Library
//!
//! This library provides the client side of the real-time transport: a TCP
//! connection to the authoritative host plus the session handshake that turns
//! that connection into a joined player receiving state snapshots.
//!
//! ## Module Organization
//!
//! ### Transport Module (`transport`)
//! Owns the socket and the background tasks:
//! - Connecting in the background so the caller's loop never blocks
//! - A reader task validating frames and queueing payloads
//! - The bounded outbound queue and its single sender task
//! - Reconnecting on demand after the connection drops
//!
//! ### Session Module (`session`)
//! Drives `Disconnected -> Connecting -> AwaitingAuthReply -> Authenticated -> Joined`:
//! - Authenticates again every time it finds the transport disconnected
//! - Sends the join request as soon as authentication succeeds
//! - Forwards held-key input once joined, only when it changes
//! - Keeps the latest snapshot for whoever renders or inspects it
//!
//! ### Config Module (`config`)
//! Command line flags and validated settings for the client binary.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::session::{ClientSession, Credentials};
//! use client::transport::NetworkClient;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(NetworkClient::new(100)?);
//!     transport.start()?;
//!
//!     let mut session = ClientSession::new(
//!         Arc::clone(&transport),
//!         "127.0.0.1:1666".parse()?,
//!         Credentials::new("alice", "secret"),
//!         "Al",
//!     );
//!
//!     let mut interval = tokio::time::interval(std::time::Duration::from_millis(30));
//!     loop {
//!         interval.tick().await;
//!         session.update();
//!         if let Some(me) = session.own_entity() {
//!             println!("I am at ({}, {})", me.x, me.y);
//!         }
//!     }
//! }
//! ```

pub mod config;
pub mod session;
pub mod transport;
