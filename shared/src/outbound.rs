//! Bounded outbound queue and the sender loop that drains it
//!
//! Producers never block: a full queue fails the enqueue with
//! [`NetError::OutgoingQueueFull`] and the caller decides whether to drop
//! the message. One sender task per transport drains the queue, so messages
//! are written in enqueue order.

use crate::error::{NetError, Result};
use log::debug;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;

/// Exclusive upper bound for the queue capacity
pub const MAX_QUEUE_CAPACITY: usize = 1000;

/// How long the sender blocks on an empty queue before re-checking shutdown
pub const SEND_POLL_INTERVAL: Duration = Duration::from_millis(30);

pub fn validate_capacity(capacity: usize) -> Result<()> {
    if capacity == 0 || capacity >= MAX_QUEUE_CAPACITY {
        return Err(NetError::InvalidQueueCapacity(capacity));
    }
    Ok(())
}

#[derive(Debug)]
pub struct OutboundQueue<M> {
    tx: mpsc::Sender<M>,
}

impl<M> Clone for OutboundQueue<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[derive(Debug)]
pub struct OutboundReceiver<M> {
    rx: mpsc::Receiver<M>,
}

impl<M> OutboundQueue<M> {
    pub fn bounded(capacity: usize) -> Result<(Self, OutboundReceiver<M>)> {
        validate_capacity(capacity)?;
        let (tx, rx) = mpsc::channel(capacity);
        Ok((Self { tx }, OutboundReceiver { rx }))
    }

    /// Queues `message` without waiting for a free slot.
    pub fn enqueue(&self, message: M) -> Result<()> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(NetError::OutgoingQueueFull),
            Err(TrySendError::Closed(_)) => Err(NetError::QueueClosed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Number of queued messages not yet taken by the sender
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Poll<M> {
    Message(M),
    Idle,
    Closed,
}

impl<M> OutboundReceiver<M> {
    async fn poll(&mut self, wait: Duration) -> Poll<M> {
        match timeout(wait, self.rx.recv()).await {
            Ok(Some(message)) => Poll::Message(message),
            Ok(None) => Poll::Closed,
            Err(_) => Poll::Idle,
        }
    }

    fn try_next(&mut self) -> Option<M> {
        self.rx.try_recv().ok()
    }
}

/// Drains `queue` until `shutdown` is raised, calling `send` once per message.
///
/// Each iteration waits at most [`SEND_POLL_INTERVAL`] for a message and then
/// keeps going only while more messages are immediately available. After
/// shutdown is observed the queue gets one final drain so that in-flight
/// messages are attempted before the loop returns.
pub async fn run_sender<M, F, Fut>(
    mut queue: OutboundReceiver<M>,
    shutdown: Arc<AtomicBool>,
    mut send: F,
) where
    F: FnMut(M) -> Fut,
    Fut: Future<Output = ()>,
{
    while !shutdown.load(Ordering::Acquire) {
        match queue.poll(SEND_POLL_INTERVAL).await {
            Poll::Message(message) => {
                send(message).await;
                while let Some(message) = queue.try_next() {
                    send(message).await;
                }
            }
            Poll::Idle => {}
            Poll::Closed => {
                debug!("Outbound queue closed, sender exiting");
                return;
            }
        }
    }

    let mut drained = 0usize;
    while let Some(message) = queue.try_next() {
        send(message).await;
        drained += 1;
    }
    debug!("Sender loop stopped after draining {} messages", drained);
}
