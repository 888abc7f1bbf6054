//! Worker pool handing inbound messages to the session handler
//!
//! A connection always maps to the same worker, so its messages are handled
//! in the order they arrived while different connections proceed in parallel.

use crate::session::MessageHandler;
use log::{debug, error, warn};
use shared::InboundMessage;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub struct Dispatcher<H: MessageHandler> {
    handler: Arc<H>,
    workers: Vec<mpsc::UnboundedSender<InboundMessage>>,
    tasks: Vec<JoinHandle<()>>,
}

fn handle_guarded<H: MessageHandler>(handler: &H, message: InboundMessage) {
    let source = message.source;
    if catch_unwind(AssertUnwindSafe(|| handler.handle_message(message))).is_err() {
        error!("Handler panicked on message from {}", source);
    }
}

impl<H: MessageHandler> Dispatcher<H> {
    /// Spawns `workers` tasks. With zero workers every message is handled
    /// inline on the caller.
    pub fn new(handler: Arc<H>, workers: usize) -> Self {
        let mut senders = Vec::with_capacity(workers);
        let mut tasks = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, mut rx) = mpsc::unbounded_channel::<InboundMessage>();
            let handler = Arc::clone(&handler);
            tasks.push(tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    handle_guarded(handler.as_ref(), message);
                }
                debug!("Dispatch worker {} stopped", index);
            }));
            senders.push(tx);
        }

        Self {
            handler,
            workers: senders,
            tasks,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn dispatch(&self, message: InboundMessage) {
        if self.workers.is_empty() {
            handle_guarded(self.handler.as_ref(), message);
            return;
        }

        let index = (message.source.as_u128() % self.workers.len() as u128) as usize;
        if let Err(mpsc::error::SendError(message)) = self.workers[index].send(message) {
            warn!("Dispatch worker {} is gone, handling inline", index);
            handle_guarded(self.handler.as_ref(), message);
        }
    }

    /// Lets the workers finish what is queued, waiting at most `limit`.
    pub async fn shutdown(self, limit: Duration) {
        let Self { workers, tasks, .. } = self;
        drop(workers);

        for task in tasks {
            if timeout(limit, task).await.is_err() {
                warn!("Dispatch worker did not finish within {:?}", limit);
            }
        }
    }
}
