//! Output fan-out for interactive sessions.
//!
//! One `OutputSink` per session produces sanitized chunks; any number of
//! `Subscription`s taken from the matching `OutputSource` consume them
//! independently. Dropping a `Subscription` detaches it and never affects
//! the session or other subscribers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// One unit produced by a session's output source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Chunk(String),
    End,
}

struct Shared {
    tx: broadcast::Sender<OutputEvent>,
    ended: AtomicBool,
}

impl Shared {
    fn finish(&self) -> bool {
        if self.ended.swap(true, Ordering::SeqCst) {
            return false;
        }
        // No receivers is fine: late subscribers see `ended` instead.
        let _ = self.tx.send(OutputEvent::End);
        true
    }
}

struct SinkInner {
    shared: Arc<Shared>,
}

impl Drop for SinkInner {
    fn drop(&mut self) {
        self.shared.finish();
    }
}

/// Producer side. Cloneable so that several reader tasks (stdout, stderr,
/// process exit watcher) can share one source. `End` is emitted exactly
/// once: on the first `finish()` or when the last clone is dropped.
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<SinkInner>,
}

/// Subscribe side, held by the session registry.
#[derive(Clone)]
pub struct OutputSource {
    shared: Arc<Shared>,
}

pub fn channel() -> (OutputSink, OutputSource) {
    channel_with_capacity(DEFAULT_CAPACITY)
}

pub fn channel_with_capacity(capacity: usize) -> (OutputSink, OutputSource) {
    let (tx, _) = broadcast::channel(capacity);
    let shared = Arc::new(Shared {
        tx,
        ended: AtomicBool::new(false),
    });
    (
        OutputSink {
            inner: Arc::new(SinkInner {
                shared: shared.clone(),
            }),
        },
        OutputSource { shared },
    )
}

impl OutputSink {
    /// Publish a chunk. Empty chunks and chunks after `End` are dropped.
    pub fn send(&self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() || self.is_finished() {
            return;
        }
        let _ = self.inner.shared.tx.send(OutputEvent::Chunk(text));
    }

    /// Emit the terminal `End`. Returns false if it was already emitted.
    pub fn finish(&self) -> bool {
        self.inner.shared.finish()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.shared.ended.load(Ordering::SeqCst)
    }
}

impl OutputSource {
    pub fn subscribe(&self) -> Subscription {
        let rx = self.shared.tx.subscribe();
        // Checked after subscribing so an End sent in between is not lost.
        let ended_at_subscribe = self.shared.ended.load(Ordering::SeqCst);
        Subscription {
            rx,
            ended_at_subscribe,
            done: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.tx.receiver_count()
    }
}

/// One consumer of an output source.
pub struct Subscription {
    rx: broadcast::Receiver<OutputEvent>,
    ended_at_subscribe: bool,
    done: bool,
}

impl Subscription {
    /// Next event in production order. Yields `End` exactly once, then `None`.
    pub async fn recv(&mut self) -> Option<OutputEvent> {
        if self.done {
            return None;
        }

        let event = if self.ended_at_subscribe {
            self.rx.try_recv().unwrap_or(OutputEvent::End)
        } else {
            loop {
                match self.rx.recv().await {
                    Ok(event) => break event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "output subscriber lagged, chunks dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break OutputEvent::End,
                }
            }
        };

        if event == OutputEvent::End {
            self.done = true;
        }
        Some(event)
    }
}
