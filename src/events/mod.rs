//! Human-readable call event log
//!
//! The transport pushes one line per notable event. Lines are timestamped,
//! kept newest first in a bounded buffer and fanned out to live subscribers.
//! Pushing is best-effort and never fails.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

/// Default number of lines kept
pub const DEFAULT_CAPACITY: usize = 200;

/// Live subscriber queue depth
const SUBSCRIBER_DEPTH: usize = 256;

/// Receiver of event lines
pub trait EventSink: Send + Sync {
    /// Record one event line
    fn push(&self, line: &str);
}

/// Bounded newest-first event log
#[derive(Clone)]
pub struct EventLog {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
    live: broadcast::Sender<String>,
}

impl EventLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(SUBSCRIBER_DEPTH);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
            live,
        }
    }

    /// All retained lines, newest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent line
    #[must_use]
    pub fn latest(&self) -> Option<String> {
        self.lines.lock().ok().and_then(|l| l.front().cloned())
    }

    /// Stream of lines pushed after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.live.subscribe()
    }

    /// Drop every retained line
    pub fn clear(&self) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.clear();
        }
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventSink for EventLog {
    fn push(&self, line: &str) {
        tracing::debug!(event = line, "call event");

        let stamped = format!("[{}] {line}", chrono::Local::now().format("%H:%M:%S"));
        if let Ok(mut lines) = self.lines.lock() {
            lines.push_front(stamped.clone());
            lines.truncate(self.capacity);
        }
        // No subscribers is fine
        let _ = self.live.send(stamped);
    }
}
