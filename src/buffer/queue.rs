use super::events::{Event, EventMask, Shrink};
use crate::error::{DmxError, Result};
use log::error;

/// Result of a successful [`EventQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The event was stored
    Queued,
    /// The event was dropped: its kind is disabled or the reader already
    /// consumed the bytes it describes
    Suppressed,
}

/// Fixed-size circular queue of events describing a ring buffer's contents.
///
/// Three cursors split the slots into arcs: `read..notified` holds events the
/// consumer already fetched but whose bytes are still in the ring,
/// `notified..write` holds events not yet fetched. One slot is kept free, so a
/// queue of `N` slots holds at most `N - 1` events.
#[derive(Debug)]
pub struct EventQueue {
    slots: Vec<Option<Event>>,
    read: usize,
    notified: usize,
    write: usize,
    pending_byte_debt: usize,
    wakeup_events: usize,
    mask: EventMask,
    untracked_data_reads: bool,
    ring_capacity: usize,
}

impl EventQueue {
    /// Creates a queue with `slots` entries describing a ring of
    /// `ring_capacity` bytes.
    pub fn new(slots: usize, ring_capacity: usize) -> Self {
        Self {
            slots: vec![None; slots.max(2)],
            read: 0,
            notified: 0,
            write: 0,
            pending_byte_debt: 0,
            wakeup_events: 0,
            mask: EventMask::default(),
            untracked_data_reads: false,
            ring_capacity,
        }
    }

    fn advance(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    /// Number of slots, one of which is always kept free.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Events stored, fetched or not.
    pub fn len(&self) -> usize {
        (self.write + self.slots.len() - self.read) % self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    pub fn is_full(&self) -> bool {
        self.advance(self.write) == self.read
    }

    /// Events waiting to be fetched by [`pop_next`](Self::pop_next).
    pub fn pending(&self) -> usize {
        (self.write + self.slots.len() - self.notified) % self.slots.len()
    }

    /// Queued events that count toward the wakeup threshold.
    pub fn wakeup_events(&self) -> usize {
        self.wakeup_events
    }

    /// Bytes the consumer read ahead of any recorded event.
    pub fn pending_byte_debt(&self) -> usize {
        self.pending_byte_debt
    }

    pub fn mask(&self) -> EventMask {
        self.mask
    }

    pub fn set_mask(&mut self, mask: EventMask) {
        self.mask = mask;
    }

    /// When set, consumed bytes are not matched against data events and
    /// fetched events are dropped right away.
    pub fn set_untracked_data_reads(&mut self, untracked: bool) {
        self.untracked_data_reads = untracked;
    }

    pub fn untracked_data_reads(&self) -> bool {
        self.untracked_data_reads
    }

    pub(crate) fn set_ring_capacity(&mut self, capacity: usize) {
        self.ring_capacity = capacity;
    }

    /// Whether enough wakeup-eligible events are queued to signal priority.
    pub fn threshold_reached(&self) -> bool {
        self.wakeup_events > 0 && self.wakeup_events >= self.mask.wakeup_threshold
    }

    /// Drops every event and the byte debt. The mask is kept.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.read = 0;
        self.notified = 0;
        self.write = 0;
        self.pending_byte_debt = 0;
        self.wakeup_events = 0;
    }

    /// Appends an event.
    ///
    /// Disabled kinds are suppressed. While the consumer is ahead of the
    /// recorded events, data events are first shrunk by the outstanding debt
    /// and suppressed if nothing is left; other events are suppressed outright.
    ///
    /// # Errors
    ///
    /// Returns [`DmxError::EventOverflow`] if every usable slot is taken.
    pub fn push(&mut self, mut event: Event) -> Result<PushOutcome> {
        let kind = event.kind();
        if self.mask.disable.contains(kind) {
            return Ok(PushOutcome::Suppressed);
        }

        if self.pending_byte_debt > 0 {
            let Some(range) = event.range_mut() else {
                return Ok(PushOutcome::Suppressed);
            };
            match range.shrink(self.pending_byte_debt, self.ring_capacity) {
                Shrink::Retired { consumed } => {
                    self.pending_byte_debt -= consumed;
                    return Ok(PushOutcome::Suppressed);
                }
                Shrink::Partial => self.pending_byte_debt = 0,
            }
        }

        if self.is_full() {
            error!("event queue overflow, dropping {:?}", kind);
            return Err(DmxError::EventOverflow);
        }

        self.slots[self.write] = Some(event);
        self.write = self.advance(self.write);
        if !self.mask.no_wakeup.contains(kind) {
            self.wakeup_events += 1;
        }
        Ok(PushOutcome::Queued)
    }

    /// Fetches the oldest event not yet handed to the consumer.
    pub fn pop_next(&mut self) -> Option<Event> {
        if self.notified == self.write {
            return None;
        }

        let event = self.slots[self.notified].clone()?;
        self.notified = self.advance(self.notified);
        if !self.mask.no_wakeup.contains(event.kind()) {
            self.wakeup_events = self.wakeup_events.saturating_sub(1);
        }
        if self.untracked_data_reads {
            self.slots[self.read] = None;
            self.read = self.advance(self.read);
        }
        Some(event)
    }

    /// Applies `consumed` bytes of reader progress to the queued events.
    ///
    /// Fetched events are retired or shrunk first. Remaining bytes then eat
    /// into unfetched events, which are dropped without being delivered once
    /// their bytes are gone. Anything left over becomes debt against the next
    /// data event pushed.
    pub fn reconcile_consumed_bytes(&mut self, consumed: usize) {
        if self.untracked_data_reads {
            return;
        }

        let mut left = consumed;
        while left > 0 && self.read != self.notified {
            match self.shrink_slot(self.read, left) {
                Some(used) => {
                    left -= used;
                    self.slots[self.read] = None;
                    self.read = self.advance(self.read);
                }
                None => left = 0,
            }
        }

        while left > 0 && self.notified != self.write {
            match self.shrink_slot(self.notified, left) {
                Some(used) => {
                    left -= used;
                    let no_wakeup = self.slots[self.notified]
                        .as_ref()
                        .is_some_and(|event| self.mask.no_wakeup.contains(event.kind()));
                    if !no_wakeup {
                        self.wakeup_events = self.wakeup_events.saturating_sub(1);
                    }
                    self.slots[self.notified] = None;
                    self.notified = self.advance(self.notified);
                }
                None => left = 0,
            }
            self.read = self.notified;
        }

        self.pending_byte_debt += left;
    }

    /// Shrinks the event at `index` by up to `bytes`. Returns the bytes used
    /// if the event is retired, `None` if it absorbed all of them.
    fn shrink_slot(&mut self, index: usize, bytes: usize) -> Option<usize> {
        let capacity = self.ring_capacity;
        let event = self.slots[index].as_mut()?;
        match event.range_mut() {
            None => Some(0),
            Some(range) => match range.shrink(bytes, capacity) {
                Shrink::Retired { consumed } => Some(consumed),
                Shrink::Partial => None,
            },
        }
    }
}
