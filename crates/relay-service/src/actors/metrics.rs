//! Actor bookkeeping: mailbox depth and connection counts.
//!
//! | Level | Relay mailbox depth |
//! |-------|---------------------|
//! | Normal | < 100 |
//! | Warning | 100-500 |
//! | Critical | > 500 |

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub const MAILBOX_NORMAL: usize = 100;
pub const MAILBOX_WARNING: usize = 500;

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

impl MailboxLevel {
    #[must_use]
    pub const fn for_depth(depth: usize) -> Self {
        if depth > MAILBOX_WARNING {
            MailboxLevel::Critical
        } else if depth > MAILBOX_NORMAL {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Mailbox monitor shared between a handle (enqueue side) and its actor
/// (dequeue side).
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    /// Record a message being added to the mailbox.
    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);

        match MailboxLevel::for_depth(new_depth) {
            MailboxLevel::Critical => {
                warn!(
                    target: "relay.actor.mailbox",
                    actor_id = %self.actor_id,
                    depth = new_depth,
                    threshold = MAILBOX_WARNING,
                    "Mailbox depth critical"
                );
            }
            // Log once when crossing into warning
            MailboxLevel::Warning if new_depth == MAILBOX_NORMAL + 1 => {
                debug!(
                    target: "relay.actor.mailbox",
                    actor_id = %self.actor_id,
                    depth = new_depth,
                    "Mailbox depth elevated"
                );
            }
            _ => {}
        }
    }

    /// Record a message being taken off the mailbox and processed.
    pub fn record_dequeue(&self) {
        // Saturate at zero: a message sent before the monitor existed
        // must not wrap the counter.
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(1))
            });
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        MailboxLevel::for_depth(self.current_depth())
    }
}

/// Counters shared by the relay actor and every connection actor.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    active_connections: AtomicUsize,
    messages_routed: AtomicU64,
    messages_dropped: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the new connection count.
    pub fn connection_opened(&self) -> usize {
        self.active_connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the new connection count.
    pub fn connection_closed(&self) -> usize {
        self.active_connections
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1)
    }

    pub fn record_routed(&self) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_routed(&self) -> u64 {
        self.messages_routed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }
}
