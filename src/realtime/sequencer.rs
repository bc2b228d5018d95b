//! Per-table ordering of committed events.
//!
//! Writers take their sequence number inside the transaction, but commit and
//! publish on their own schedule. A writer reserves its number as soon as it
//! has it; an event is only fanned out once every lower reservation on the
//! same table has either been published or released.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::{ChangeEvent, RealtimeBus};
use crate::data_types::SequenceNumber;

/// Sequence numbers of rolled back writes get handed out again, so two
/// reservations can briefly share a number; the ticket tells them apart.
type SlotKey = (SequenceNumber, u64);

#[derive(Debug, Default)]
pub(super) struct Sequencer {
    slots: BTreeMap<SlotKey, Option<ChangeEvent>>,
}

impl Sequencer {
    /// Pop events from the front for as long as they are ready.
    fn drain_ready(&mut self, mut deliver: impl FnMut(&ChangeEvent)) {
        while let Some(entry) = self.slots.first_entry() {
            if entry.get().is_none() {
                break;
            }
            if let Some(event) = entry.remove() {
                deliver(&event);
            }
        }
    }

    pub(super) fn pending(&self) -> usize {
        self.slots.len()
    }
}

#[derive(Debug, Default)]
pub(super) struct Sequencers {
    tables: DashMap<String, Arc<Mutex<Sequencer>>>,
    tickets: AtomicU64,
}

impl Sequencers {
    fn table(&self, table: &str) -> Arc<Mutex<Sequencer>> {
        self.tables.entry(table.to_string()).or_default().clone()
    }

    pub(super) fn pending(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |s| s.lock().pending())
    }
}

/// A claim on a sequence number by a write that hasn't committed yet.
/// Dropping it without [`Reservation::publish`] releases the claim.
#[derive(Debug)]
pub struct Reservation {
    bus: Arc<RealtimeBus>,
    table: String,
    key: SlotKey,
    settled: bool,
}

impl Reservation {
    pub(super) fn new(bus: Arc<RealtimeBus>, table: &str, sequence: SequenceNumber) -> Self {
        let ticket = bus.sequencers.tickets.fetch_add(1, Ordering::Relaxed);
        let key = (sequence, ticket);
        bus.sequencers.table(table).lock().slots.insert(key, None);
        Self {
            bus,
            table: table.to_string(),
            key,
            settled: false,
        }
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.key.0
    }

    /// Hand over the committed event. It is fanned out now, or as soon as
    /// the writes holding lower numbers settle.
    pub fn publish(mut self, event: ChangeEvent) {
        self.settle(Some(event));
    }

    fn settle(&mut self, event: Option<ChangeEvent>) {
        if self.settled {
            return;
        }
        self.settled = true;

        let sequencer = self.bus.sequencers.table(&self.table);
        // The fan-out happens under this table's lock so that two settling
        // writers can't deliver out of order.
        let mut sequencer = sequencer.lock();
        match event {
            Some(event) => {
                sequencer.slots.insert(self.key, Some(event));
            }
            None => {
                debug!(table = %self.table, sequence = self.key.0, "Sequence released");
                sequencer.slots.remove(&self.key);
            }
        }
        sequencer.drain_ready(|event| {
            self.bus.publish(event);
        });
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.settle(None);
    }
}
