//! In-process fan-out of committed changes to live subscribers.
//!
//! Every subscription has its own bounded queue. Publishing never waits on a
//! subscriber: if a queue is full the subscription is closed instead, and the
//! client is expected to resynchronise with a fresh list request.
//!
//! Writers go through a [`Reservation`], which holds back an event until
//! every lower sequence number on the same table has been settled, so
//! subscribers see each table's events in sequence order.

mod event;
mod sequencer;
mod subscription;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::auth::Principal;
use crate::data_types::{Operation, SequenceNumber};
use crate::expr::Predicate;
use crate::schema::TableDefinition;

pub use event::ChangeEvent;
pub use sequencer::Reservation;
use sequencer::Sequencers;
pub use subscription::{CloseReason, Subscription, SubscriptionHandle, SubscriptionState};
use subscription::Delivery;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct RealtimeBus {
    subscribers: DashMap<String, Vec<Arc<Subscription>>>,
    sequencers: Sequencers,
    capacity: usize,
}

impl Default for RealtimeBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl RealtimeBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            sequencers: Sequencers::default(),
            capacity: capacity.max(1),
        }
    }

    /// Register a subscription on `table`. The filter must already have been
    /// validated against the table; the read policy is bound to `principal`
    /// now and kept for the lifetime of the subscription.
    pub fn subscribe(
        self: &Arc<Self>,
        table: &TableDefinition,
        filter: Option<Predicate>,
        principal: Arc<Principal>,
    ) -> SubscriptionHandle {
        let (sender, receiver) = tokio::sync::mpsc::channel(self.capacity);
        let policy = table.policy(Operation::Read).bind(principal);
        let subscription = Arc::new(Subscription::new(&table.name, filter, policy, sender));

        self.subscribers
            .entry(table.name.clone())
            .or_default()
            .push(subscription.clone());
        subscription.mark_subscribed();
        crate::metrics::subscriptions_changed(1);
        debug!(
            subscription = subscription.id(),
            table = table.name.as_str(),
            "Subscribed"
        );

        SubscriptionHandle::new(subscription, receiver, self.clone())
    }

    /// Claim `sequence` on `table` for a write that is about to commit.
    pub fn reserve(self: &Arc<Self>, table: &str, sequence: SequenceNumber) -> Reservation {
        Reservation::new(self.clone(), table, sequence)
    }

    /// Reservations on `table` that are unsettled or waiting on a lower one.
    pub fn pending_events(&self, table: &str) -> usize {
        self.sequencers.pending(table)
    }

    /// Offer an event to every subscription on its table right away,
    /// bypassing sequencing. Returns the number of subscriptions it was
    /// enqueued for.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        crate::metrics::event_published(&event.table);

        // Work on a copy of the list so that no map lock is held while
        // offering to individual subscribers.
        let Some(subscribers) = self.subscribers.get(&event.table).map(|s| s.clone()) else {
            return 0;
        };

        let mut delivered = 0;
        let mut closed = false;
        for subscription in subscribers {
            match subscription.offer(event) {
                Delivery::Delivered => {
                    delivered += 1;
                    crate::metrics::event_delivered(&event.table);
                }
                Delivery::Skipped => {}
                Delivery::Closed => closed = true,
            }
        }

        if closed {
            self.remove_where(&event.table, |s| s.is_closed());
        }
        debug!(
            table = event.table.as_str(),
            sequence = event.sequence,
            delivered,
            "Published change event"
        );
        delivered
    }

    pub fn unsubscribe(&self, subscription: &Arc<Subscription>) {
        self.remove_where(subscription.table(), |s| Arc::ptr_eq(s, subscription));
    }

    pub fn subscriber_count(&self, table: &str) -> usize {
        self.subscribers.get(table).map_or(0, |s| s.len())
    }

    /// Drop subscriptions that are closed or whose receiver is gone.
    /// Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let tables: Vec<String> = self.subscribers.iter().map(|e| e.key().clone()).collect();
        tables
            .iter()
            .map(|table| self.remove_where(table, |s| s.is_closed() || s.is_abandoned()))
            .sum()
    }

    /// Periodically [`Self::sweep`] until `shutdown` fires or the bus is
    /// dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let bus = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(bus) = bus.upgrade() else { break };
                let removed = bus.sweep();
                if removed > 0 {
                    debug!(removed, "Swept abandoned realtime subscriptions");
                }
            }
        })
    }

    fn remove_where(&self, table: &str, predicate: impl Fn(&Arc<Subscription>) -> bool) -> usize {
        let removed = match self.subscribers.get_mut(table) {
            Some(mut subscribers) => {
                let before = subscribers.len();
                subscribers.retain(|s| !predicate(s));
                before - subscribers.len()
            }
            None => 0,
        };
        self.subscribers.remove_if(table, |_, s| s.is_empty());

        if removed > 0 {
            crate::metrics::subscriptions_changed(-(removed as i64));
        }
        removed
    }
}
