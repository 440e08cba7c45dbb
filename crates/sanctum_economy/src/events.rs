//! # Outcome Events
//!
//! Post-commit fan-out to decoupled listeners.
//!
//! ```text
//! ┌──────────────┐ commit ┌──────────┐  bounded  ┌──────────────┐
//! │ Orchestrator │───────>│ EventBus │──────────>│ subscriber A │
//! └──────────────┘        │          │  channel  └──────────────┘
//!                         │ backlog  │──────────>┌──────────────┐
//!                         └──────────┘           │ subscriber B │
//!                                                └──────────────┘
//! ```
//!
//! Events are published only after the transaction they describe has
//! committed. Each subscriber has its own bounded channel; an event that
//! does not fit waits in that subscriber's backlog and is retried on the
//! next publish or [`EventBus::flush`]. Delivery is at-least-once and in
//! id order per subscriber, so listeners with side effects should filter
//! through an [`IdempotentConsumer`].
//!
//! A backlog never grows past its limit. A subscriber that stops reading
//! loses its oldest undelivered events first, and the loss is counted in
//! [`EventBus::dropped_count`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::account::{ItemId, PlayerId, StackId, Tier};
use crate::currency::CurrencyKind;
use crate::journal::EntryId;

/// Default per-subscriber channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Default per-subscriber backlog limit.
pub const DEFAULT_BACKLOG_LIMIT: usize = 65_536;

/// Monotonic event id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event:{}", self.0)
    }
}

/// What happened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutcomePayload {
    /// Currency granted.
    CurrencyGranted {
        /// Currency.
        kind: CurrencyKind,
        /// Balance change after modifiers and cap.
        delta: i64,
    },
    /// Currency consumed.
    CurrencyConsumed {
        /// Currency.
        kind: CurrencyKind,
        /// Amount removed.
        amount: u64,
    },
    /// Currency moved between players. Published once per side.
    Transfer {
        /// Sender.
        from: PlayerId,
        /// Recipient.
        to: PlayerId,
        /// Currency.
        kind: CurrencyKind,
        /// Amount debited.
        amount: u64,
    },
    /// Copies added by an administrative grant.
    CollectibleGranted {
        /// Item.
        base_id: ItemId,
        /// Tier.
        tier: Tier,
        /// Copies added.
        quantity: u32,
    },
    /// A fusion committed.
    Fusion {
        /// Source stack.
        source: StackId,
        /// Source tier.
        tier: Tier,
        /// Next tier produced.
        success: bool,
        /// Shards granted on failure.
        shards_awarded: u64,
    },
    /// A summon batch committed.
    Summon {
        /// Items produced, in order.
        items: Vec<ItemId>,
        /// Any unit was forced by pity.
        pity_triggered: bool,
    },
}

/// One published event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutcomeEvent {
    /// Unique, increasing id.
    pub id: EventId,
    /// Player the event is about.
    pub player: PlayerId,
    /// Journal entries written by the same commit.
    pub entries: Vec<EntryId>,
    /// Details.
    pub payload: OutcomePayload,
}

struct Subscriber {
    sender: Sender<OutcomeEvent>,
    backlog: VecDeque<OutcomeEvent>,
    dropped: u64,
}

impl Subscriber {
    /// Queues an event, evicting the oldest ones past `limit`.
    fn enqueue(&mut self, event: OutcomeEvent, limit: usize) {
        self.backlog.push_back(event);
        while self.backlog.len() > limit {
            if let Some(evicted) = self.backlog.pop_front() {
                self.dropped += 1;
                warn!(
                    event_id = evicted.id.0,
                    dropped = self.dropped,
                    "event backlog full; dropping oldest event"
                );
            }
        }
    }

    /// Pushes backlog into the channel. Returns `false` once disconnected.
    fn drain_backlog(&mut self) -> bool {
        while let Some(event) = self.backlog.pop_front() {
            match self.sender.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.backlog.push_front(event);
                    return true;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
        true
    }
}

/// Fan-out of committed outcomes.
pub struct EventBus {
    capacity: usize,
    backlog_limit: usize,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus with the given per-subscriber channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Sets how many undelivered events each subscriber may hold.
    #[must_use]
    pub fn with_backlog_limit(mut self, limit: usize) -> Self {
        self.backlog_limit = limit.max(1);
        self
    }

    /// Registers a subscriber. It receives events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        let (sender, receiver) = bounded(self.capacity);
        self.subscribers.lock().push(Subscriber {
            sender,
            backlog: VecDeque::new(),
            dropped: 0,
        });
        EventReceiver { receiver }
    }

    /// Publishes an event to every subscriber.
    pub fn publish(&self, player: PlayerId, entries: Vec<EntryId>, payload: OutcomePayload) -> EventId {
        let mut subscribers = self.subscribers.lock();
        // Ids are assigned under the lock so every subscriber sees them in order.
        let id = EventId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let event = OutcomeEvent {
            id,
            player,
            entries,
            payload,
        };

        subscribers.retain_mut(|sub| {
            sub.enqueue(event.clone(), self.backlog_limit);
            let connected = sub.drain_backlog();
            if !connected {
                debug!("event subscriber disconnected");
            } else if sub.backlog.len() == self.capacity {
                warn!(backlog = sub.backlog.len(), "event subscriber falling behind");
            }
            connected
        });
        id
    }

    /// Retries every backlog. Returns events still waiting.
    pub fn flush(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain_mut(Subscriber::drain_backlog);
        subscribers.iter().map(|sub| sub.backlog.len()).sum()
    }

    /// Events waiting in backlogs.
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.subscribers.lock().iter().map(|sub| sub.backlog.len()).sum()
    }

    /// Events evicted from the backlogs of live subscribers.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.subscribers.lock().iter().map(|sub| sub.dropped).sum()
    }

    /// Live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Receiving end of one subscription.
pub struct EventReceiver {
    receiver: Receiver<OutcomeEvent>,
}

impl EventReceiver {
    /// All events currently in the channel.
    pub fn drain(&self) -> Vec<OutcomeEvent> {
        self.receiver.try_iter().collect()
    }

    /// One event, if any.
    pub fn try_recv(&self) -> Option<OutcomeEvent> {
        self.receiver.try_recv().ok()
    }

    /// One event, waiting at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<OutcomeEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Events in the channel.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }
}

/// Filters redelivered events by remembering the last id handled per player.
#[derive(Debug, Default)]
pub struct IdempotentConsumer {
    last_processed: HashMap<PlayerId, EventId>,
}

impl IdempotentConsumer {
    /// Empty consumer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time an event is seen, recording it.
    pub fn accept(&mut self, event: &OutcomeEvent) -> bool {
        match self.last_processed.get(&event.player) {
            Some(last) if *last >= event.id => false,
            _ => {
                self.last_processed.insert(event.player, event.id);
                true
            }
        }
    }

    /// Last id handled for a player.
    #[must_use]
    pub fn last_processed(&self, player: PlayerId) -> Option<EventId> {
        self.last_processed.get(&player).copied()
    }
}
