//! # Authoritative Host Library
//!
//! This library provides the host side of the real-time transport. It accepts
//! TCP connections, assigns each one a durable [`shared::ConnectionId`], runs
//! the session handshake and drives a fixed-rate loop that advances the
//! simulation and broadcasts a snapshot to every joined connection.
//!
//! ## Core Responsibilities
//!
//! ### Connection Management
//! The [`transport::NetworkServer`] owns the listening socket and one reader
//! task per connection. Writes for every connection go through a single
//! bounded outbound queue and one sender task, so a full queue surfaces as
//! backpressure to the producer instead of blocking it.
//!
//! ### Session Protocol
//! Each connection moves through `Unauthenticated -> Authenticated -> Joined`.
//! Input is only accepted from joined connections; a join before a
//! successful authentication is ignored.
//!
//! ### Authoritative Simulation
//! The simulation is touched only by the tick task. Session handlers queue
//! their changes as commands which the tick applies before advancing.
//!
//! ## Module Organization
//!
//! - `registry`: lock-free map from connection identity to write handle
//! - `transport`: accept loop, readers, sender and the dropped-connection
//!   observers
//! - `session`: handshake state machine and simulation commands
//! - `dispatch`: worker pool that keeps per-connection message order
//! - `game` / `physics`: the simulation interface and the reference board
//! - `tick`: the fixed-rate drain / advance / broadcast loop
//! - `config`: command line and validated host settings
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::game::GameBoard;
//! use server::tick::{TickLoop, TickSettings, Ticker};
//! use server::transport::NetworkServer;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(NetworkServer::new("0.0.0.0:1666".parse()?, 100)?);
//!     transport.start().await?;
//!
//!     let ticker = Ticker::new(Arc::clone(&transport), GameBoard::new(), 4);
//!     let tick_loop = TickLoop::start(ticker, TickSettings::default())?;
//!
//!     // ... later
//!     tick_loop.stop();
//!     tick_loop.await_terminated(Duration::from_secs(30)).await?;
//!     transport.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod game;
pub mod physics;
pub mod registry;
pub mod session;
pub mod tick;
pub mod transport;
pub mod utils;
