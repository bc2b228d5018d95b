use std::sync::Arc;

use parking_lot::Mutex;
use strum_macros::{AsRefStr, Display, IntoStaticStr};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::{ChangeEvent, RealtimeBus};
use crate::auth::Principal;
use crate::data_types::{Record, SequenceNumber};
use crate::expr::Predicate;
use crate::policy::BoundPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionState {
    Connecting,
    Subscribed,
    Streaming,
    Closed,
}

/// Why the server closed a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum CloseReason {
    /// The subscriber's queue was full.
    Overflow,
    /// An event arrived with a lower sequence number than one already
    /// delivered.
    OutOfOrder,
    /// The receiving side went away.
    Disconnected,
}

pub(super) enum Delivery {
    Delivered,
    Skipped,
    Closed,
}

#[derive(Debug)]
struct Outbox {
    sender: Option<mpsc::Sender<ChangeEvent>>,
    last_sequence: SequenceNumber,
}

#[derive(Debug)]
struct Lifecycle {
    state: SubscriptionState,
    close_reason: Option<CloseReason>,
}

/// One live connection's interest in a table.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    table: String,
    filter: Option<Predicate>,
    policy: BoundPolicy,
    outbox: Mutex<Outbox>,
    lifecycle: Mutex<Lifecycle>,
}

impl Subscription {
    pub(super) fn new(
        table: &str,
        filter: Option<Predicate>,
        policy: BoundPolicy,
        sender: mpsc::Sender<ChangeEvent>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            table: table.to_string(),
            filter,
            policy,
            outbox: Mutex::new(Outbox {
                sender: Some(sender),
                last_sequence: SequenceNumber::MIN,
            }),
            lifecycle: Mutex::new(Lifecycle {
                state: SubscriptionState::Connecting,
                close_reason: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn principal(&self) -> &Principal {
        self.policy.principal()
    }

    pub fn state(&self) -> SubscriptionState {
        self.lifecycle.lock().state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lifecycle.lock().close_reason
    }

    /// Move forward through the state machine; `Closed` is terminal.
    fn transition(&self, to: SubscriptionState) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != SubscriptionState::Closed && lifecycle.state != to {
            debug!(subscription = %self.id, from = %lifecycle.state, %to, "Subscription state");
            lifecycle.state = to;
        }
    }

    pub(super) fn mark_subscribed(&self) {
        self.transition(SubscriptionState::Subscribed);
    }

    pub(super) fn mark_streaming(&self) {
        self.transition(SubscriptionState::Streaming);
    }

    /// Close the subscription and drop its sender, so that the receiver
    /// ends once the already queued events have been read.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == SubscriptionState::Closed {
                return;
            }
            lifecycle.state = SubscriptionState::Closed;
            lifecycle.close_reason = Some(reason);
        }
        self.outbox.lock().sender = None;

        if reason != CloseReason::Disconnected {
            warn!(subscription = %self.id, table = %self.table, %reason, "Closing realtime subscription");
            crate::metrics::subscription_dropped(&self.table, reason.into());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SubscriptionState::Closed
    }

    /// True if the receiving side has gone away without an explicit close.
    pub(super) fn is_abandoned(&self) -> bool {
        self.outbox
            .lock()
            .sender
            .as_ref()
            .map_or(true, |s| s.is_closed())
    }

    /// Both the subscriber's own filter and the table's read policy (bound
    /// to the subscriber) have to pass.
    pub fn matches(&self, record: &Record) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |f| f.matches(record, self.policy.principal()))
            && self.policy.matches(record)
    }

    /// Try to enqueue an event without blocking.
    pub(super) fn offer(&self, event: &ChangeEvent) -> Delivery {
        if !self.matches(&event.record) {
            return Delivery::Skipped;
        }

        let failure = {
            let mut guard = self.outbox.lock();
            let outbox = &mut *guard;
            // The sequence check and the send happen under the same lock, so
            // two publishers can't interleave between them.
            if event.sequence < outbox.last_sequence {
                CloseReason::OutOfOrder
            } else {
                let Some(sender) = outbox.sender.as_ref() else {
                    return Delivery::Closed;
                };
                match sender.try_send(event.clone()) {
                    Ok(()) => {
                        outbox.last_sequence = event.sequence;
                        return Delivery::Delivered;
                    }
                    Err(TrySendError::Full(_)) => CloseReason::Overflow,
                    Err(TrySendError::Closed(_)) => CloseReason::Disconnected,
                }
            }
        };

        self.close(failure);
        Delivery::Closed
    }
}

/// The receiving end of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct SubscriptionHandle {
    subscription: Arc<Subscription>,
    receiver: mpsc::Receiver<ChangeEvent>,
    bus: Arc<RealtimeBus>,
}

impl SubscriptionHandle {
    pub(super) fn new(
        subscription: Arc<Subscription>,
        receiver: mpsc::Receiver<ChangeEvent>,
        bus: Arc<RealtimeBus>,
    ) -> Self {
        Self {
            subscription,
            receiver,
            bus,
        }
    }

    pub fn id(&self) -> &str {
        self.subscription.id()
    }

    pub fn subscription(&self) -> &Arc<Subscription> {
        &self.subscription
    }

    /// Next delivered event. `None` once the subscription is closed and
    /// its queue drained; [`Self::close_reason`] then says why.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.subscription.mark_streaming();
        self.receiver.recv().await
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.subscription.close_reason()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.subscription.close(CloseReason::Disconnected);
        self.bus.unsubscribe(&self.subscription);
    }
}
