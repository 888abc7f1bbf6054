//! Fixed-rate tick loop: drain inbound, advance the simulation, broadcast

use crate::dispatch::Dispatcher;
use crate::game::Simulation;
use crate::session::{SessionHandler, SimCommand};
use crate::transport::ServerTransport;
use log::{debug, error, info, warn};
use shared::{Envelope, Lifecycle, Result, ServiceState};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Measured deltas above this are treated as a stall and capped
pub const MAX_TICK_DELTA: Duration = Duration::from_millis(250);

const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct TickSettings {
    pub period: Duration,
    pub initial_delay: Duration,
}

impl Default for TickSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(30),
            initial_delay: Duration::from_millis(300),
        }
    }
}

/// What happened during one tick
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickReport {
    pub dispatched: usize,
    pub delta: Duration,
    pub broadcast: usize,
    pub failed: usize,
}

/// Everything one tick touches. Owned by the tick task alone.
pub struct Ticker<T: ServerTransport, S: Simulation> {
    transport: Arc<T>,
    sessions: Arc<SessionHandler<T>>,
    dispatcher: Dispatcher<SessionHandler<T>>,
    commands: mpsc::UnboundedReceiver<SimCommand>,
    simulation: S,
    last_tick: Option<Instant>,
}

impl<T: ServerTransport, S: Simulation> Ticker<T, S> {
    pub fn new(transport: Arc<T>, simulation: S, dispatch_workers: usize) -> Self {
        let (sessions, commands) = SessionHandler::new(Arc::clone(&transport));
        let dispatcher = Dispatcher::new(Arc::clone(&sessions), dispatch_workers);

        Self {
            transport,
            sessions,
            dispatcher,
            commands,
            simulation,
            last_tick: None,
        }
    }

    pub fn simulation(&self) -> &S {
        &self.simulation
    }

    pub fn sessions(&self) -> &Arc<SessionHandler<T>> {
        &self.sessions
    }

    /// Runs one tick as of `now`.
    pub fn tick_once(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        while let Some(message) = self.transport.next_message() {
            self.dispatcher.dispatch(message);
            report.dispatched += 1;
        }
        while let Some(id) = self.transport.next_disconnected() {
            self.sessions.connection_dropped(id);
        }

        self.apply_commands();

        report.delta = self.measure_delta(now);
        self.simulation.advance(report.delta);

        let snapshot = Envelope::StateSnapshot {
            entities: self.simulation.snapshot(),
        };
        let payload = match snapshot.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode snapshot: {}", e);
                return report;
            }
        };

        for id in self.sessions.joined_connections() {
            match self.transport.send_message(id, &payload) {
                Ok(()) => report.broadcast += 1,
                Err(e) => {
                    warn!("Failed to send snapshot to {}: {}", id, e);
                    report.failed += 1;
                }
            }
        }

        report
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SimCommand::AddPlayer {
                    id,
                    nickname,
                    color,
                } => {
                    if self.transport.is_connected(&id) {
                        self.simulation.add_player(id, nickname, color);
                    } else {
                        debug!("Connection {} closed before its player was added", id);
                        self.sessions.connection_dropped(id);
                    }
                }
                SimCommand::RemovePlayer { id } => {
                    self.simulation.remove_player(&id);
                }
                SimCommand::PlayerInput { id, input } => self.simulation.set_input(&id, input),
            }
        }
    }

    fn measure_delta(&mut self, now: Instant) -> Duration {
        let delta = self
            .last_tick
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or(Duration::ZERO);
        self.last_tick = Some(now);

        if delta > MAX_TICK_DELTA {
            warn!(
                "Tick delta of {:?} exceeds {:?}, capping",
                delta, MAX_TICK_DELTA
            );
            return MAX_TICK_DELTA;
        }
        delta
    }

    async fn shutdown(self) {
        self.dispatcher.shutdown(DISPATCH_DRAIN_TIMEOUT).await;
    }
}

/// Handle to the running tick task
pub struct TickLoop {
    lifecycle: Arc<Lifecycle>,
    stop_signal: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TickLoop {
    /// Spawns the tick task. The first tick fires after `initial_delay`,
    /// then once per `period`; late ticks are skipped rather than bunched.
    pub fn start<T, S>(ticker: Ticker<T, S>, settings: TickSettings) -> Result<Self>
    where
        T: ServerTransport,
        S: Simulation,
    {
        if settings.period.is_zero() {
            return Err(shared::NetError::InvalidConfig(
                "tick period must be non-zero".to_string(),
            ));
        }

        let lifecycle = Arc::new(Lifecycle::new());
        let (stop_signal, stop_rx) = watch::channel(false);
        lifecycle.set(ServiceState::Starting);

        let task = tokio::spawn(Self::run(
            ticker,
            settings,
            Arc::clone(&lifecycle),
            stop_rx,
        ));

        Ok(Self {
            lifecycle,
            stop_signal,
            task: Mutex::new(Some(task)),
        })
    }

    async fn run<T, S>(
        mut ticker: Ticker<T, S>,
        settings: TickSettings,
        lifecycle: Arc<Lifecycle>,
        mut stop_rx: watch::Receiver<bool>,
    ) where
        T: ServerTransport,
        S: Simulation,
    {
        let mut interval = interval_at(Instant::now() + settings.initial_delay, settings.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        lifecycle.set(ServiceState::Running);
        info!("Tick loop running every {:?}", settings.period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Instant::now();
                    match catch_unwind(AssertUnwindSafe(|| ticker.tick_once(now))) {
                        Ok(report) => {
                            if report.failed > 0 {
                                debug!("Tick finished with {} failed sends", report.failed);
                            }
                        }
                        Err(_) => error!("Tick panicked, continuing with the next one"),
                    }
                }
                _ = stop_rx.changed() => break,
            }
        }

        ticker.shutdown().await;
        lifecycle.set(ServiceState::Terminated);
        info!("Tick loop terminated");
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    pub async fn await_running(&self) -> Result<()> {
        self.lifecycle.await_running().await
    }

    /// Signals the loop to stop after the tick in progress
    pub fn stop(&self) {
        if self.lifecycle.transition(ServiceState::Running, ServiceState::Stopping) {
            debug!("Stopping tick loop");
        }
        self.stop_signal.send_replace(true);
    }

    pub async fn await_terminated(&self, limit: Duration) -> Result<()> {
        let result = self.lifecycle.await_terminated(limit).await;
        if result.is_ok() {
            let task = self
                .task
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(task) = task {
                let _ = task.await;
            }
        }
        result
    }
}
