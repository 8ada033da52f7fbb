//! Fan-out from one input channel to many bounded subscriber outputs.
//!
//! Registration and broadcast share one lock, held for a whole broadcast
//! pass. A subscriber whose receiver has gone away is removed on the next
//! pass. A subscriber that stays full for longer than the overflow timeout is
//! dropped so one slow reader cannot stall the rest.

use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type SubscriptionId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MuxError {
    #[error("multiplexer has shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Copy)]
pub struct MuxOptions {
    pub subscriber_buffer: usize,
    pub overflow_timeout: Duration,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            subscriber_buffer: 100,
            overflow_timeout: Duration::from_secs(1),
        }
    }
}

struct State<T> {
    outputs: HashMap<SubscriptionId, mpsc::Sender<T>>,
    next_id: SubscriptionId,
    shut_down: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    options: MuxOptions,
}

pub struct Multiplexer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Multiplexer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Multiplexer<T> {
    /// Start broadcasting everything received on `input`. The returned task
    /// finishes once `input` closes and every subscriber has been closed.
    pub fn spawn(input: mpsc::Receiver<T>, options: MuxOptions) -> (Self, JoinHandle<()>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                outputs: HashMap::new(),
                next_id: 0,
                shut_down: false,
            }),
            options,
        });
        let task = tokio::spawn(run(Arc::clone(&shared), input));
        (Self { shared }, task)
    }

    /// Register a fresh bounded output.
    pub async fn subscribe(&self) -> Result<Subscription<T>, MuxError> {
        let (tx, rx) = mpsc::channel(self.shared.options.subscriber_buffer.max(1));
        let id = self.attach(tx).await?;
        Ok(Subscription {
            id,
            rx,
            mux: Arc::downgrade(&self.shared),
        })
    }

    /// Register a caller-owned sink. The multiplexer keeps one clone of
    /// `out`; unsubscribing drops only that clone, so the receiver sees the
    /// end of the stream only once every other clone is gone too.
    pub(crate) async fn attach(&self, out: mpsc::Sender<T>) -> Result<SubscriptionId, MuxError> {
        let mut state = self.shared.state.lock().await;
        if state.shut_down {
            return Err(MuxError::ShutDown);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.outputs.insert(id, out);
        debug!(subscription = id, total = state.outputs.len(), "subscriber added");
        Ok(id)
    }

    /// Remove an output and drop the multiplexer's sender for it, which
    /// closes a `subscribe`d output. Returns false if it was already gone.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.shared.state.lock().await.outputs.remove(&id).is_some();
        if removed {
            debug!(subscription = id, "subscriber removed");
        }
        removed
    }

    pub async fn subscriber_count(&self) -> usize {
        self.shared.state.lock().await.outputs.len()
    }

    pub async fn is_shut_down(&self) -> bool {
        self.shared.state.lock().await.shut_down
    }
}

async fn run<T: Clone + Send + 'static>(shared: Arc<Shared<T>>, mut input: mpsc::Receiver<T>) {
    let overflow = shared.options.overflow_timeout;
    while let Some(value) = input.recv().await {
        let mut state = shared.state.lock().await;
        let mut dead = Vec::new();
        for (&id, out) in state.outputs.iter() {
            match out.try_send(value.clone()) {
                Ok(()) => {}
                Err(TrySendError::Closed(_)) => dead.push(id),
                Err(TrySendError::Full(pending)) => {
                    match tokio::time::timeout(overflow, out.send(pending)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => dead.push(id),
                        Err(_) => {
                            warn!(subscription = id, "subscriber stalled past overflow timeout; dropping");
                            dead.push(id);
                        }
                    }
                }
            }
        }
        for id in dead {
            state.outputs.remove(&id);
            debug!(subscription = id, "subscriber closed; removed");
        }
    }

    let mut state = shared.state.lock().await;
    let closed = state.outputs.len();
    state.outputs.clear();
    state.shut_down = true;
    info!(closed, "multiplexer input closed; shut down");
}

/// A registered output. Dropping it releases the slot.
pub struct Subscription<T> {
    id: SubscriptionId,
    rx: mpsc::Receiver<T>,
    mux: Weak<Shared<T>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        // Best effort; a contended lock leaves removal to the next broadcast pass.
        if let Some(shared) = self.mux.upgrade() {
            if let Ok(mut state) = shared.state.try_lock() {
                state.outputs.remove(&self.id);
            }
        }
    }
}
