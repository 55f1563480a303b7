//! Sensors (C8): cold, subscribable sources of state-mutation closures.
//!
//! A sensor's underlying source is never started until the first
//! `subscribe` call, mirroring the lazily-spawned channel pair in the
//! teacher's `agent::secretary::connection::ChannelConnection`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// State shared between the runtime, its actions, and all subscribed
/// sensors. A single mutex serializes every mutation (§5: "no two state
/// mutations interleave").
pub type SharedState = Arc<Mutex<Value>>;

/// One state mutation produced by a sensor's source.
pub type Mutation = Box<dyn FnOnce(&mut Value) + Send>;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A factory for a subscribable mutation stream. Implementors own whatever
/// produces mutations (a poll loop, a webhook listener, a file watcher);
/// `subscribe` is where that source actually starts running.
#[async_trait]
pub trait Sensor: Send + Sync {
    async fn subscribe(&self, state: SharedState) -> SensorHandle;
}

/// A [`Sensor`] built from a repeatedly-invoked async poll function. Each
/// call produces the next [`Mutation`], or `None` to end the stream.
pub struct PollSensor<F> {
    poll: Arc<F>,
    started: Arc<AtomicUsize>,
}

impl<F> PollSensor<F>
where
    F: Fn() -> BoxFuture<'static, Option<Mutation>> + Send + Sync + 'static,
{
    pub fn new(poll: F) -> Self {
        PollSensor {
            poll: Arc::new(poll),
            started: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of times this sensor's source has actually been started, for
    /// asserting the lazy-start contract in tests.
    pub fn start_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> Sensor for PollSensor<F>
where
    F: Fn() -> BoxFuture<'static, Option<Mutation>> + Send + Sync + 'static,
{
    async fn subscribe(&self, state: SharedState) -> SensorHandle {
        self.started.fetch_add(1, Ordering::SeqCst);
        let (update_tx, update_rx) = mpsc::channel(1);
        let poll = self.poll.clone();
        let task = tokio::spawn(async move {
            loop {
                match (poll)().await {
                    Some(mutation) => {
                        let mut guard = state.lock().await;
                        mutation(&mut guard);
                        drop(guard);
                        if update_tx.send(()).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        });
        SensorHandle {
            task,
            updates: update_rx,
        }
    }
}

/// Handle returned by [`Sensor::subscribe`]. `next_update` resolves once per
/// applied mutation, used by the runtime's follow mode to know when to
/// replan; `unsubscribe` aborts the spawned source task.
pub struct SensorHandle {
    task: JoinHandle<()>,
    updates: mpsc::Receiver<()>,
}

impl SensorHandle {
    pub async fn next_update(&mut self) -> Option<()> {
        self.updates.recv().await
    }

    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for SensorHandle {
    /// Aborts the source task if the handle is dropped without an explicit
    /// `unsubscribe()` (e.g. when a follower task draining it is itself
    /// aborted), so a sensor's source never outlives its last handle.
    fn drop(&mut self) {
        self.task.abort();
    }
}
