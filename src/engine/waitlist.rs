use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

/// A preferred slot in the tenant's local calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub time: TimeOfDay,
}

impl SlotKey {
    pub fn of(entry: &WaitlistEntry) -> Self {
        Self { date: entry.preferred_date, time: entry.preferred_time_slot }
    }
}

/// All waitlist entries of a tenant plus a FIFO queue of active entries per slot.
#[derive(Debug, Default)]
pub struct WaitlistLedger {
    entries: HashMap<Ulid, WaitlistEntry>,
    /// Active entry ids ordered by `(created_at, id)`.
    queues: BTreeMap<SlotKey, Vec<Ulid>>,
}

impl WaitlistLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries still queued for a slot. Finished entries do not count.
    pub fn active_len(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }

    pub fn get(&self, id: &Ulid) -> Option<&WaitlistEntry> {
        self.entries.get(id)
    }

    /// The client's active entry for a slot, if any.
    pub fn find_active(&self, client_id: Ulid, key: SlotKey) -> Option<&WaitlistEntry> {
        self.queue(key).find(|e| e.client_id == client_id)
    }

    /// Active entries for one slot in FIFO order.
    pub fn queue(&self, key: SlotKey) -> impl Iterator<Item = &WaitlistEntry> {
        self.queues
            .get(&key)
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id))
    }

    pub fn active_keys(&self) -> Vec<SlotKey> {
        self.queues.keys().copied().collect()
    }

    /// 1-based place among the active entries this one competes with.
    pub fn position(&self, id: &Ulid) -> Option<usize> {
        let entry = self.entries.get(id)?;
        if !entry.status.is_active() {
            return None;
        }
        let ahead = self
            .queue(SlotKey::of(entry))
            .take_while(|e| e.id != entry.id)
            .filter(|e| match (e.studio_id, entry.studio_id) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            })
            .count();
        Some(ahead + 1)
    }

    /// Offers still awaiting an answer for exactly this place and time.
    pub fn outstanding_offers(&self, studio_id: Ulid, span: &Span) -> u32 {
        self.entries
            .values()
            .filter(|e| matches!(e.status, WaitlistStatus::Notified | WaitlistStatus::Approved))
            .filter(|e| {
                e.offer
                    .as_ref()
                    .is_some_and(|o| o.studio_id == studio_id && o.span == *span)
            })
            .count() as u32
    }

    /// Every entry, oldest first.
    pub fn all(&self) -> Vec<&WaitlistEntry> {
        let mut all: Vec<&WaitlistEntry> = self.entries.values().collect();
        all.sort_by_key(|e| (e.created_at, e.id));
        all
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::WaitlistJoined { entry } => {
                if let Some(old) = self.entries.insert(entry.id, entry.clone()) {
                    self.dequeue(&old);
                }
                if entry.status.is_active() {
                    self.enqueue(entry.id);
                }
            }
            Event::WaitlistTransitioned { id, to, at, offer, session_id } => {
                let Some(entry) = self.entries.get_mut(id) else { return };
                entry.status = *to;
                match to {
                    WaitlistStatus::Notified => {
                        entry.notified_at = Some(*at);
                        entry.offer = offer.clone();
                    }
                    WaitlistStatus::Pending => entry.offer = None,
                    WaitlistStatus::Booked => entry.session_id = *session_id,
                    WaitlistStatus::Approved | WaitlistStatus::Cancelled | WaitlistStatus::Expired => {}
                }
                if !to.is_active() {
                    let entry = entry.clone();
                    self.dequeue(&entry);
                }
            }
            Event::WaitlistBooked { session, entry_id, offer } => {
                let Some(entry) = self.entries.get_mut(entry_id) else { return };
                entry.status = WaitlistStatus::Booked;
                entry.session_id = Some(session.id);
                if offer.is_some() {
                    entry.notified_at = Some(session.created_at);
                    entry.offer = offer.clone();
                }
                let entry = entry.clone();
                self.dequeue(&entry);
            }
            Event::WaitlistPassedOver { id, release } => {
                if let Some(entry) = self.entries.get_mut(id) {
                    entry.passed_over = Some(*release);
                }
            }
            _ => {}
        }
    }

    fn enqueue(&mut self, id: Ulid) {
        let Some(entry) = self.entries.get(&id) else { return };
        let key = (entry.created_at, entry.id);
        let queue = self.queues.entry(SlotKey::of(entry)).or_default();
        let entries = &self.entries;
        let pos = queue.partition_point(|other| {
            entries
                .get(other)
                .is_some_and(|o| (o.created_at, o.id) <= key)
        });
        queue.insert(pos, id);
    }

    fn dequeue(&mut self, entry: &WaitlistEntry) {
        let key = SlotKey::of(entry);
        if let Some(queue) = self.queues.get_mut(&key) {
            queue.retain(|id| *id != entry.id);
            if queue.is_empty() {
                self.queues.remove(&key);
            }
        }
    }

    /// Every entry in its current state, oldest first.
    pub fn snapshot(&self) -> Vec<Event> {
        self.all()
            .into_iter()
            .map(|entry| Event::WaitlistJoined { entry: entry.clone() })
            .collect()
    }
}
