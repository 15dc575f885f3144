use crate::error::{DmxError, Result};
use bytes::Bytes;
use std::time::Duration;

/// Bytes in the user-facing section pattern.
pub const SECTION_PATTERN_LEN: usize = 16;
/// Bytes in the engine's section pattern.
pub const ENGINE_PATTERN_LEN: usize = 18;
/// Most cipher operations accepted per PID.
pub const MAX_CIPHER_OPS: usize = 5;
/// Most PIDs a packetized-stream filter may carry.
pub const MAX_PIDS: usize = 16;

/// Section match pattern as configured by the consumer.
///
/// A section matches when, for every byte `i` with a non-zero mask, the
/// masked section byte equals the masked value (mode bit set) or differs from
/// it (mode bit clear).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionPattern {
    pub value: [u8; SECTION_PATTERN_LEN],
    pub mask: [u8; SECTION_PATTERN_LEN],
    pub mode: [u8; SECTION_PATTERN_LEN],
}

impl SectionPattern {
    /// Matches every section whose first byte is `table_id`.
    pub fn table_id(table_id: u8) -> Self {
        let mut pattern = Self::default();
        pattern.value[0] = table_id;
        pattern.mask[0] = 0xff;
        pattern.mode[0] = 0xff;
        pattern
    }
}

/// Section match pattern in the engine's layout.
///
/// Bytes 1 and 2 line up with the section length field, which is never
/// matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnginePattern {
    pub value: [u8; ENGINE_PATTERN_LEN],
    pub mask: [u8; ENGINE_PATTERN_LEN],
    /// Inverted mode: a set bit asks for inequality
    pub mode: [u8; ENGINE_PATTERN_LEN],
}

/// Options of a section filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionFlags {
    pub check_crc: bool,
    /// Stop delivering after the first section
    pub oneshot: bool,
    pub immediate_start: bool,
}

/// Configuration of a section filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionFilterParams {
    pub pid: u16,
    pub filter: SectionPattern,
    /// Deadline for the first section, 0 for none
    pub timeout_ms: u32,
    pub flags: SectionFlags,
}

impl SectionFilterParams {
    pub fn new(pid: u16, filter: SectionPattern) -> Self {
        Self {
            pid,
            filter,
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms as u64))
    }

    /// Converts the pattern to the engine layout.
    pub fn to_engine_layout(&self) -> EnginePattern {
        let mut value = [0u8; ENGINE_PATTERN_LEN];
        let mut mask = [0u8; ENGINE_PATTERN_LEN];
        let mut mode = [0u8; ENGINE_PATTERN_LEN];
        let filter = &self.filter;

        value[0] = filter.value[0];
        mask[0] = filter.mask[0];
        mode[0] = !filter.mode[0];
        value[3..].copy_from_slice(&filter.value[1..]);
        mask[3..].copy_from_slice(&filter.mask[1..]);
        for (dst, src) in mode[3..].iter_mut().zip(&filter.mode[1..]) {
            *dst = !src;
        }
        // the length bytes stay unmatched
        mask[1] = 0;
        mask[2] = 0;
        mode[1] = 0;
        mode[2] = 0;

        EnginePattern { value, mask, mode }
    }
}

/// Where a packetized-stream filter delivers its data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PesOutput {
    /// Straight to a decoder; nothing is buffered here
    Decoder,
    /// PES payload into the filter's own buffer
    #[default]
    Tap,
    /// TS packets into the shared DVR output
    TsTap,
    /// TS packets into the filter's own buffer
    TsDemuxTap,
}

impl PesOutput {
    /// Outputs that carry whole TS packets.
    pub fn is_ts(self) -> bool {
        matches!(self, PesOutput::TsTap | PesOutput::TsDemuxTap)
    }
}

/// Elementary stream role of a PID, with its decoder index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PesType {
    Audio(u8),
    Video(u8),
    Teletext(u8),
    Subtitle(u8),
    Pcr(u8),
    #[default]
    Other,
}

impl PesType {
    /// Decoder slot and PES-PID table index, if any.
    pub fn slot(self) -> Option<(usize, u8)> {
        match self {
            PesType::Audio(n) => Some((0, n)),
            PesType::Video(n) => Some((1, n)),
            PesType::Teletext(n) => Some((2, n)),
            PesType::Subtitle(n) => Some((3, n)),
            PesType::Pcr(n) => Some((4, n)),
            PesType::Other => None,
        }
    }

    pub fn validate(self) -> Result<()> {
        match self.slot() {
            Some((_, n)) if n > 3 => Err(DmxError::invalid(format!(
                "decoder index {n} out of range"
            ))),
            _ => Ok(()),
        }
    }
}

/// Video codec hint passed to the engine for decoder outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    #[default]
    Unknown,
    Mpeg2,
    H264,
    Hevc,
    Vc1,
}

/// Configuration of a packetized-stream filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PesFilterParams {
    pub pid: u16,
    pub output: PesOutput,
    pub pes_type: PesType,
    pub immediate_start: bool,
    /// Bytes per recording chunk on TS outputs, clamped at start
    pub rec_chunk_size: usize,
    pub video_codec: VideoCodec,
}

impl PesFilterParams {
    pub fn new(pid: u16, output: PesOutput) -> Self {
        Self {
            pid,
            output,
            ..Self::default()
        }
    }
}

/// TS packet framing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TspFormat {
    #[default]
    Ts188,
    /// Four timestamp bytes after each packet
    Ts192Tail,
    /// Four timestamp bytes before each packet
    Ts192Head,
}

impl TspFormat {
    pub fn packet_size(self) -> usize {
        match self {
            TspFormat::Ts188 => 188,
            TspFormat::Ts192Tail | TspFormat::Ts192Head => 192,
        }
    }
}

/// Who provides the storage of a buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BufferMode {
    #[default]
    Internal,
    External,
}

/// Flow control between the engine and consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PlaybackMode {
    /// The engine drops data a consumer is too slow for
    #[default]
    Push,
    /// The engine waits for consumers to make room
    Pull,
}

/// Input the engine demultiplexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// A live frontend
    Front(u8),
    /// Bytes written to the DVR input
    Dvr(u8),
}

impl Default for Source {
    fn default() -> Self {
        Source::Front(0)
    }
}

impl Source {
    pub fn is_dvr(self) -> bool {
        matches!(self, Source::Dvr(_))
    }
}

/// Decoder buffers for a decoder-output filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderBuffers {
    pub buffers_size: usize,
    /// External buffer handles; empty for internal buffers
    pub handles: Vec<i32>,
    pub is_linear: bool,
}

impl DecoderBuffers {
    pub fn internal(size: usize) -> Self {
        Self {
            buffers_size: size,
            ..Self::default()
        }
    }

    pub fn is_external(&self) -> bool {
        !self.handles.is_empty()
    }
}

/// One descrambling or encryption step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CipherOp {
    pub encrypt: bool,
    pub key_ladder_id: u32,
}

/// Cipher pipeline applied to one PID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CipherOps {
    pub pid: u16,
    pub operations: Vec<CipherOp>,
}

/// Secure-path configuration of a filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecureMode {
    pub is_secured: bool,
}

/// Video indexing configuration of one PID.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexingParams {
    pub pid: u16,
    pub enable: bool,
    /// Index entry types to generate
    pub types: u64,
}

/// Parameters the engine needs to run a TS feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsFeedParams {
    pub pid: u16,
    pub output: PesOutput,
    pub pes_type: PesType,
    /// Decoder buffer size for decoder outputs
    pub decoder_buffer_size: usize,
}

/// TS packets the engine re-inserts into a recording at a fixed interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsInsertion {
    /// Consumer-chosen handle, unique per filter
    pub identifier: u32,
    pub repetition: Duration,
    pub packets: Bytes,
}

/// Out-of-band command injected into the raw input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobCommand {
    /// No more input follows
    Eos,
    /// Tag the current position; reported back as a marker event
    Marker(u64),
}

/// System time clock sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StcReading {
    pub num: u32,
    /// Divisor that brings `stc` to 90 kHz
    pub base: u32,
    pub stc: u64,
}

/// Poll result for a filter or DVR handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    /// Overflow latched or enough wakeup events queued
    pub priority: bool,
}
