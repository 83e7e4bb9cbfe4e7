//! Broadcast channel between instances of one document.
//!
//! Delivery is unordered at-most-once with no acknowledgement: a handle that
//! is closed, slow, or not yet open simply misses the message. Eventual
//! convergence is the sync client's job, not the channel's.
//!
//! Implementations:
//! - `LocalHub` - in-process topics over unbounded mpsc, also used in tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::ids::DocumentId;
use crate::messages::BroadcastMessage;

/// One endpoint on a per-document broadcast topic.
///
/// A handle never receives its own publishes.
pub trait DocumentChannel: Send + Sync {
    /// Fire-and-forget broadcast to every other open handle on the topic.
    fn publish(&self, message: BroadcastMessage);

    /// Stream of messages published by other handles.
    fn subscribe(&self) -> UnboundedReceiver<BroadcastMessage>;

    /// Detach from the topic. Idempotent; also happens on drop.
    fn close(&self);
}

struct TopicSubscriber {
    handle: u64,
    sender: UnboundedSender<BroadcastMessage>,
}

#[derive(Default)]
struct Topic {
    subscribers: Mutex<Vec<TopicSubscriber>>,
    next_handle: AtomicU64,
}

/// Process-wide registry of broadcast topics, one per document id.
///
/// Cheap to clone; clones share the same topics.
#[derive(Clone, Default)]
pub struct LocalHub {
    topics: Arc<Mutex<HashMap<DocumentId, Arc<Topic>>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a handle on the document's topic, creating the topic on first
    /// use.
    pub fn open(&self, document_id: &DocumentId) -> LocalChannel {
        let topic = {
            let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(topics.entry(document_id.clone()).or_default())
        };
        let handle = topic.next_handle.fetch_add(1, Ordering::Relaxed);
        trace!(document = %document_id, handle, "opened broadcast handle");
        LocalChannel {
            handle,
            topic,
            closed: AtomicBool::new(false),
        }
    }
}

/// A `DocumentChannel` backed by a `LocalHub` topic.
pub struct LocalChannel {
    handle: u64,
    topic: Arc<Topic>,
    closed: AtomicBool,
}

impl DocumentChannel for LocalChannel {
    fn publish(&self, message: BroadcastMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut subscribers = self
            .topic
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // Sends to dropped receivers fail; prune those entries as we go.
        subscribers.retain(|subscriber| {
            if subscriber.handle == self.handle {
                return true;
            }
            subscriber.sender.send(message.clone()).is_ok()
        });
    }

    fn subscribe(&self) -> UnboundedReceiver<BroadcastMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if !self.closed.load(Ordering::SeqCst) {
            self.topic
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(TopicSubscriber {
                    handle: self.handle,
                    sender,
                });
        }
        receiver
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.topic
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|subscriber| subscriber.handle != self.handle);
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.close();
    }
}
