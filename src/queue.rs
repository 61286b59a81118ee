use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Info,
    Success,
    Warning,
    Error,
}

/// A transient chat/UI message. Never persisted; lives only for the duration
/// of queue draining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiMessage {
    pub content: String,
    pub kind: MessageKind,
}

impl UiMessage {
    pub fn info(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: MessageKind::Info,
        }
    }

    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: MessageKind::Success,
        }
    }

    pub fn warning(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: MessageKind::Warning,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: MessageKind::Error,
        }
    }

    /// Severity-marked rendering for the UI transport.
    pub fn render(&self) -> String {
        match self.kind {
            MessageKind::Info => self.content.clone(),
            MessageKind::Success => format!("✅ {}", self.content),
            MessageKind::Warning => format!("⚠️ {}", self.content),
            MessageKind::Error => format!("❌ {}", self.content),
        }
    }
}

/// The UI/chat transport messages are delivered into.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, message: UiMessage) -> Result<()>;
}

/// Strict FIFO delivery no matter how many producers enqueue concurrently.
///
/// Producers push under a lock; whichever caller claims the drain flag
/// becomes the single drainer and awaits each delivery to completion before
/// popping the next. A later-enqueued message can never be displayed before
/// an earlier one, even if its producer's task resumes first.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Mutex<VecDeque<UiMessage>>,
    draining: AtomicBool,
    sink: Arc<dyn MessageSink>,
}

impl MessageQueue {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                sink,
            }),
        }
    }

    /// Enqueues a message. If no drain is in progress, the caller becomes the
    /// drainer and this call resolves once the queue is empty; a delivery
    /// failure then propagates to it (the transport is likely broken, and
    /// retry policy belongs to a higher layer). Otherwise this returns
    /// immediately and the running drainer delivers the message in turn.
    pub async fn add(&self, message: UiMessage) -> Result<()> {
        self.push(message);
        if self.try_claim_drain() {
            return self.drain().await;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, message: UiMessage) {
        if let Ok(mut queue) = self.inner.queue.lock() {
            queue.push_back(message);
        }
    }

    fn pop(&self) -> Option<UiMessage> {
        self.inner.queue.lock().ok().and_then(|mut q| q.pop_front())
    }

    fn try_claim_drain(&self) -> bool {
        self.inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn drain(&self) -> Result<()> {
        loop {
            match self.pop() {
                Some(message) => {
                    if let Err(e) = self.inner.sink.deliver(message).await {
                        // Clear the flag first so a future add() can restart
                        // draining, then let the failure propagate.
                        self.inner.draining.store(false, Ordering::Release);
                        return Err(e);
                    }
                }
                None => {
                    self.inner.draining.store(false, Ordering::Release);
                    // A producer may have pushed after our empty pop but
                    // before the flag cleared; reclaim and keep going so the
                    // message is not stranded.
                    if !self.is_empty() && self.try_claim_drain() {
                        continue;
                    }
                    return Ok(());
                }
            }
        }
    }
}
