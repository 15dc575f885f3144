//! # Output Buffers
//!
//! Every filter and the DVR reader deliver data through an [`Output`]: a byte
//! [`RingBuffer`] plus an [`EventQueue`] whose data events point into it.
//! Producers append bytes and then post the event describing them; consumers
//! read bytes and the queue is reconciled so that events whose bytes are gone
//! are never delivered as if they were still whole.
//!
//! ```rust
//! use dmxcore::buffer::{DataRange, Event, Output, RingBuffer};
//!
//! let mut out = Output::new(RingBuffer::new(64), 8);
//! let start = out.ring.write_offset();
//! out.ring.write(b"section!").unwrap();
//! out.post(Event::NewSection(DataRange::contiguous(start, 8)));
//!
//! let mut buf = [0u8; 8];
//! assert_eq!(out.read(&mut buf), 8);
//! assert_eq!(&buf, b"section!");
//! // the event's bytes are consumed, so it is dropped undelivered
//! assert_eq!(out.events.pop_next(), None);
//! ```

/// Event types and byte ranges
pub mod events;
/// The event queue
pub mod queue;
/// The byte ring
pub mod ring;


pub use events::{
    DataRange, EsData, Event, EventKind, EventKinds, EventMask, IndexEntry, PesInfo, RangeFlags,
    Shrink,
};
pub use queue::{EventQueue, PushOutcome};
pub use ring::{LatchedError, RingBuffer};

use crate::error::{DmxError, Result};
use log::{debug, warn};

/// Snapshot of an output's fill level and cursors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStatus {
    /// Error latched on the ring, if any; reading the status clears it
    pub error: Option<LatchedError>,
    /// Bytes waiting to be read
    pub fullness: usize,
    /// Bytes that can still be written
    pub free_bytes: usize,
    pub read_offset: usize,
    pub write_offset: usize,
    pub size: usize,
}

/// Bytes written since the last recording chunk or PES unit boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PendingUnit {
    pub start: usize,
    pub size: usize,
}

/// A ring buffer together with the events describing its contents.
#[derive(Debug)]
pub struct Output {
    pub ring: RingBuffer,
    pub events: EventQueue,
    pub(crate) unit: PendingUnit,
}

impl Output {
    pub fn new(ring: RingBuffer, event_slots: usize) -> Self {
        let events = EventQueue::new(event_slots, ring.capacity());
        Self {
            ring,
            events,
            unit: PendingUnit::default(),
        }
    }

    /// Reports the fill level and takes the latched error.
    pub fn status(&mut self) -> BufferStatus {
        BufferStatus {
            error: self.ring.take_error(),
            fullness: self.ring.available(),
            free_bytes: self.ring.free(),
            read_offset: self.ring.read_offset(),
            write_offset: self.ring.write_offset(),
            size: self.ring.capacity(),
        }
    }

    /// Empties the ring and the queue and rewinds the cursors.
    pub fn reset(&mut self) {
        self.events.reset();
        self.ring.reset();
        self.unit = PendingUnit::default();
    }

    /// Drops pending bytes and events without moving the write cursor.
    ///
    /// Returns the number of bytes discarded.
    pub fn flush(&mut self) -> usize {
        let dropped = self.ring.available();
        self.ring.flush();
        self.events.reset();
        self.unit = PendingUnit {
            start: self.ring.write_offset(),
            size: 0,
        };
        dropped
    }

    /// Releases `n` bytes without copying them out.
    ///
    /// # Errors
    ///
    /// Returns [`DmxError::InvalidArgument`] if fewer than `n` bytes are
    /// buffered.
    pub fn consume(&mut self, n: usize) -> Result<()> {
        let available = self.ring.available();
        if n > available {
            return Err(DmxError::invalid(format!(
                "release of {n} bytes with only {available} buffered"
            )));
        }
        self.ring.skip(n);
        self.events.reconcile_consumed_bytes(n);
        Ok(())
    }

    /// Reads into `dest` and reconciles the queue with the bytes taken.
    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        let n = self.ring.read(dest);
        self.events.reconcile_consumed_bytes(n);
        n
    }

    /// Handles a write that did not fit.
    ///
    /// With auto-flush everything buffered is dropped and the output keeps
    /// accepting data; otherwise an overflow is latched until acknowledged.
    /// Returns whether the output was flushed.
    pub fn overflow(&mut self, auto_flush: bool) -> bool {
        if auto_flush {
            let dropped = self.flush();
            debug!("output overflow, auto-flushed {} bytes", dropped);
            true
        } else {
            self.ring.latch(LatchedError::Overflow);
            false
        }
    }

    /// Queues an event; returns whether it was queued.
    ///
    /// A full queue latches [`LatchedError::EventOverflow`] unless another
    /// error is already latched. Losing a data event also flushes the output,
    /// so no bytes stay buffered without an event describing them.
    pub fn post(&mut self, event: Event) -> bool {
        let is_data = event.is_data();
        match self.events.push(event) {
            Ok(outcome) => outcome == PushOutcome::Queued,
            Err(_) => {
                let latched = self.ring.error().unwrap_or(LatchedError::EventOverflow);
                if is_data {
                    let dropped = self.flush();
                    warn!("event queue full, flushed {} bytes", dropped);
                }
                self.ring.latch(latched);
                false
            }
        }
    }

    /// Installs new storage of `size` bytes and resets the output.
    ///
    /// Returns the previous storage.
    pub fn install(&mut self, storage: Option<Vec<u8>>, size: usize) -> Option<Vec<u8>> {
        let old = self.ring.replace_storage(storage, size);
        self.events.set_ring_capacity(size);
        self.reset();
        old
    }

    /// Removes the storage; the output then accepts and yields nothing.
    pub fn detach(&mut self) -> Option<Vec<u8>> {
        self.ring.detach()
    }

    /// Whether a reader or poller has something to look at.
    pub fn readable(&self) -> bool {
        !self.ring.is_empty() || self.events.pending() > 0
    }
}
