//! In-process bus.
//!
//! Delivers messages to every matching subscriber through a bounded queue per
//! subscriber. A subscriber whose queue is full loses the message (at-most-once
//! delivery, as with a real broker's slow-consumer handling).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::{Bus, Message, Subscription};
use crate::error::TransportError;
use crate::subject;

/// Default per-subscriber queue depth.
const DEFAULT_QUEUE_SIZE: usize = 1024;

/// In-process [`Bus`]. Clones share the same subscriber table.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

struct Inner {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    queue_size: usize,
}

struct Subscriber {
    id: u64,
    pattern: String,
    tx: mpsc::Sender<Message>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_queue_size(DEFAULT_QUEUE_SIZE)
    }

    /// Creates a bus whose subscribers buffer at most `queue_size` messages.
    pub fn with_queue_size(queue_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                queue_size: queue_size.max(1),
            }),
        }
    }

    /// Closes the bus: every subscription ends and later calls fail.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.lock().clear();
        debug!("Memory bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions whose pattern matches `subject`.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.inner
            .lock()
            .iter()
            .filter(|s| subject::matches(&s.pattern, subject))
            .count()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_subscriber(inner: &Weak<Inner>, id: u64) {
    if let Some(inner) = inner.upgrade() {
        inner.lock().retain(|s| s.id != id);
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, msg: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        subject::validate_publish(&msg.subject)?;

        let mut delivered = 0usize;
        {
            let subscribers = self.inner.lock();
            for sub in subscribers
                .iter()
                .filter(|s| subject::matches(&s.pattern, &msg.subject))
            {
                match sub.tx.try_send(msg.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            subject = %msg.subject,
                            pattern = %sub.pattern,
                            "Slow consumer, dropping message"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }

        if delivered == 0 && msg.reply.is_some() {
            return Err(TransportError::NoResponders {
                subject: msg.subject,
            });
        }

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        subject::validate_pattern(pattern)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.inner.queue_size);
        self.inner.lock().push(Subscriber {
            id,
            pattern: pattern.to_string(),
            tx,
        });

        let weak = Arc::downgrade(&self.inner);
        Ok(Subscription::new(pattern, rx, move || {
            remove_subscriber(&weak, id)
        }))
    }
}
