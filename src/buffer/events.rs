use crate::utils::{ring_distance, wrap_add};
use std::ops::BitOr;

/// Event types a filter can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A complete section was written to the output
    NewSection,
    /// A complete PES unit was written to the output
    NewPes,
    /// A recording chunk of TS packets is ready
    NewRecordingChunk,
    /// The engine filled a decoder buffer
    NewEsData,
    /// Output data was lost
    BufferOverflow,
    /// No section arrived before the deadline
    SectionTimeout,
    /// A section was dropped because its CRC failed
    SectionCrcError,
    /// End of stream reached on the input
    Eos,
    /// A marker passed through the input
    Marker,
    /// A PCR was extracted
    NewPcr,
    /// An index entry was produced
    NewIndexEntry,
    /// The transport scrambling bits changed
    ScramblingStatusChange,
}

impl EventKind {
    /// Bit used for this kind inside [`EventKinds`].
    pub const fn bit(self) -> u32 {
        1 << self as u32
    }
}

/// Set of event kinds, used for disable and no-wakeup masks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventKinds(u32);

impl EventKinds {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub const fn with(self, kind: EventKind) -> Self {
        Self(self.0 | kind.bit())
    }

    pub const fn without(self, kind: EventKind) -> Self {
        Self(self.0 & !kind.bit())
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<EventKind> for EventKinds {
    fn from(kind: EventKind) -> Self {
        Self(kind.bit())
    }
}

impl BitOr for EventKinds {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOr<EventKind> for EventKinds {
    type Output = Self;

    fn bitor(self, rhs: EventKind) -> Self {
        self.with(rhs)
    }
}

/// Per-output event filtering and wakeup policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask {
    /// Kinds that are never queued
    pub disable: EventKinds,
    /// Kinds that are queued but do not count toward the wakeup threshold
    pub no_wakeup: EventKinds,
    /// Number of wakeup-eligible events that makes the output signal priority
    pub wakeup_threshold: usize,
}

impl Default for EventMask {
    fn default() -> Self {
        Self {
            disable: EventKinds::empty(),
            no_wakeup: EventKinds::empty(),
            wakeup_threshold: 1,
        }
    }
}

impl EventMask {
    /// Mask a freshly opened filter starts with: decoder ES data is off.
    pub fn filter_default() -> Self {
        Self {
            disable: EventKind::NewEsData.into(),
            ..Self::default()
        }
    }
}

/// Status bits attached to data-bearing events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeFlags {
    /// Continuity counter error detected in the unit
    pub cc_error: bool,
    /// Discontinuity indicator was set
    pub discontinuity: bool,
    /// PES packet length did not match the payload
    pub length_error: bool,
}

/// Byte range of an event inside the owning ring buffer.
///
/// `base_offset` is where the unit's bytes begin in the ring, `start_offset`
/// where its payload begins (after any header gap), `total_length` covers
/// everything from `base_offset` and `actual_length` only the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataRange {
    pub base_offset: usize,
    pub start_offset: usize,
    pub actual_length: usize,
    pub total_length: usize,
    pub flags: RangeFlags,
}

/// Outcome of applying consumed bytes to a [`DataRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shrink {
    /// The range was fully consumed; `consumed` bytes of the input were used
    Retired { consumed: usize },
    /// The range still has unread bytes; all input was used
    Partial,
}

impl DataRange {
    /// A range whose payload starts at its base.
    pub fn contiguous(offset: usize, length: usize) -> Self {
        Self {
            base_offset: offset,
            start_offset: offset,
            actual_length: length,
            total_length: length,
            flags: RangeFlags::default(),
        }
    }

    /// Removes `consumed` bytes from the front of the range.
    ///
    /// Bytes eaten out of the header gap only move the base; bytes past it also
    /// move the payload start and shorten the payload.
    pub fn shrink(&mut self, consumed: usize, capacity: usize) -> Shrink {
        if self.total_length <= consumed {
            return Shrink::Retired {
                consumed: self.total_length,
            };
        }

        self.total_length -= consumed;
        let gap = ring_distance(self.base_offset, self.start_offset, capacity);
        if consumed <= gap {
            self.base_offset = wrap_add(self.base_offset, consumed, capacity);
        } else {
            let past = consumed - gap;
            self.start_offset = wrap_add(self.start_offset, past, capacity);
            self.actual_length = self.actual_length.saturating_sub(past);
            self.base_offset = self.start_offset;
        }
        Shrink::Partial
    }
}

/// Timing and error counters reported with a PES unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PesInfo {
    pub stc: u64,
    pub tei_counter: u32,
    pub cont_err_counter: u32,
    pub ts_packets_num: u32,
}

/// Decoder buffer fill reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EsData {
    pub buf_handle: i32,
    pub cookie: u32,
    pub offset: u32,
    pub data_len: u32,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub stc: u64,
    pub tei_counter: u32,
    pub cont_err_counter: u32,
    pub ts_packets_num: u32,
    pub ts_dropped_bytes: u32,
}

/// Video index entry produced on a recording output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexEntry {
    pub pid: u16,
    pub types: u64,
    pub pts: Option<u64>,
    pub stc: u64,
    pub byte_offset: u64,
}

/// An event queued on a filter or DVR output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    NewSection(DataRange),
    NewPes { range: DataRange, info: PesInfo },
    NewRecordingChunk(DataRange),
    NewEsData(EsData),
    BufferOverflow,
    SectionTimeout,
    SectionCrcError,
    Eos,
    Marker { id: u64 },
    NewPcr { pcr: u64, stc: u64, discontinuity: bool },
    NewIndexEntry(IndexEntry),
    ScramblingStatusChange(u8),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NewSection(_) => EventKind::NewSection,
            Event::NewPes { .. } => EventKind::NewPes,
            Event::NewRecordingChunk(_) => EventKind::NewRecordingChunk,
            Event::NewEsData(_) => EventKind::NewEsData,
            Event::BufferOverflow => EventKind::BufferOverflow,
            Event::SectionTimeout => EventKind::SectionTimeout,
            Event::SectionCrcError => EventKind::SectionCrcError,
            Event::Eos => EventKind::Eos,
            Event::Marker { .. } => EventKind::Marker,
            Event::NewPcr { .. } => EventKind::NewPcr,
            Event::NewIndexEntry(_) => EventKind::NewIndexEntry,
            Event::ScramblingStatusChange(_) => EventKind::ScramblingStatusChange,
        }
    }

    /// The ring range this event describes, for data-bearing kinds.
    pub fn range(&self) -> Option<&DataRange> {
        match self {
            Event::NewSection(range)
            | Event::NewPes { range, .. }
            | Event::NewRecordingChunk(range) => Some(range),
            _ => None,
        }
    }

    pub(crate) fn range_mut(&mut self) -> Option<&mut DataRange> {
        match self {
            Event::NewSection(range)
            | Event::NewPes { range, .. }
            | Event::NewRecordingChunk(range) => Some(range),
            _ => None,
        }
    }

    pub fn is_data(&self) -> bool {
        self.range().is_some()
    }
}
