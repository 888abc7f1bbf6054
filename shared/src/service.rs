//! Start / await-running / stop / await-terminated lifecycle shared by the
//! transports and the tick loop.

use crate::error::{NetError, Result};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl ServiceState {
    pub fn is_finished(self) -> bool {
        matches!(self, ServiceState::Terminated | ServiceState::Failed)
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    state: watch::Sender<ServiceState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ServiceState::New);
        Self { state }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn set(&self, next: ServiceState) {
        self.state.send_replace(next);
    }

    /// Moves `from -> to` only if the current state is `from`.
    pub fn transition(&self, from: ServiceState, to: ServiceState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == from {
                *current = to;
                true
            } else {
                false
            }
        })
    }

    /// Resolves once the service runs, or fails if it ended up in any
    /// terminal state first.
    pub async fn await_running(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ServiceState::Running => return Ok(()),
                ServiceState::Failed | ServiceState::Terminated | ServiceState::Stopping => {
                    return Err(NetError::ServiceFailed)
                }
                ServiceState::New | ServiceState::Starting => {}
            }
            if rx.changed().await.is_err() {
                return Err(NetError::ServiceFailed);
            }
        }
    }

    pub async fn await_terminated(&self, limit: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                if rx.borrow_and_update().is_finished() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| NetError::ShutdownTimeout)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_await_running_resolves_after_start() {
        let lifecycle = Arc::new(Lifecycle::new());
        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.await_running().await })
        };

        lifecycle.set(ServiceState::Starting);
        lifecycle.set(ServiceState::Running);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_await_running_fails_on_failure() {
        let lifecycle = Lifecycle::new();
        lifecycle.set(ServiceState::Failed);
        assert!(matches!(
            lifecycle.await_running().await,
            Err(NetError::ServiceFailed)
        ));
    }

    #[tokio::test]
    async fn test_await_terminated_times_out() {
        let lifecycle = Lifecycle::new();
        lifecycle.set(ServiceState::Stopping);
        let result = lifecycle
            .await_terminated(Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(NetError::ShutdownTimeout)));

        lifecycle.set(ServiceState::Terminated);
        assert!(lifecycle
            .await_terminated(Duration::from_millis(20))
            .await
            .is_ok());
    }

    #[test]
    fn test_transition_only_from_expected_state() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.transition(ServiceState::New, ServiceState::Starting));
        assert!(!lifecycle.transition(ServiceState::New, ServiceState::Starting));
        assert_eq!(lifecycle.state(), ServiceState::Starting);
    }
}
