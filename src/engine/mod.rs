//! # Demux Engine Interface
//!
//! The engine does the actual transport-stream parsing. This crate only talks
//! to it through the traits below: [`DemuxEngine`] for device-wide calls,
//! [`TsFeed`] and [`SectionFeed`] for the per-PID handles it hands out, and
//! [`FeedSink`], which this crate implements and the engine calls when data
//! is ready.
//!
//! Most optional engine operations have default bodies that report the
//! operation as unsupported or succeed as a no-op, matching how an engine
//! without the feature behaves.

/// Engine capability descriptions
pub mod caps;

pub use caps::{BufferCaps, CapFlags, DemuxCaps};

use crate::buffer::{BufferStatus, EsData, IndexEntry};
use crate::device::params::{
    CipherOps, EnginePattern, IndexingParams, OobCommand, PlaybackMode, SecureMode, Source,
    StcReading, TsFeedParams, TspFormat, VideoCodec,
};
use crate::error::{DmxError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Handle of a section filter within its feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionFilterId(pub usize);

/// Details of a completed PES unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PesEnd {
    /// Header bytes before the payload
    pub start_gap: usize,
    /// Payload bytes
    pub actual_length: usize,
    pub discontinuity: bool,
    pub length_mismatch: bool,
    pub stc: u64,
    pub tei_counter: u32,
    pub cont_err_counter: u32,
    pub ts_packets_num: u32,
}

/// What a structured data-ready notification reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataStatus {
    /// Plain data
    Ok,
    /// Data that completes a PES unit
    PesEnd(PesEnd),
    Pcr {
        pcr: u64,
        stc: u64,
        discontinuity: bool,
    },
    Index(IndexEntry),
    DecoderBuffer(EsData),
    Marker(u64),
    ScramblingStatus(u8),
    Eos,
    /// A section failed its CRC check
    CrcError,
    /// Data that follows a continuity error
    MissedError,
    /// The engine lost data
    Overrun,
}

/// Structured notification from a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataReady {
    pub status: DataStatus,
    pub data: Bytes,
}

impl DataReady {
    pub fn new(status: DataStatus) -> Self {
        Self {
            status,
            data: Bytes::new(),
        }
    }

    pub fn with_data(status: DataStatus, data: impl Into<Bytes>) -> Self {
        Self {
            status,
            data: data.into(),
        }
    }
}

/// Receiver of a feed's output, implemented by this crate.
///
/// The engine may call these from any task or thread, concurrently for
/// different feeds.
#[async_trait]
pub trait FeedSink: Send + Sync {
    /// Copies data given as up to two segments.
    fn deliver(&self, first: &[u8], second: &[u8]) -> Result<()>;

    /// Handles a structured notification.
    fn data_ready(&self, ready: DataReady) -> Result<()>;

    /// Waits until `required` bytes fit in the output, as pull mode needs.
    ///
    /// # Errors
    ///
    /// [`DmxError::NoSpace`] when `wait` is false and there is no room,
    /// [`DmxError::Teardown`] once the device shuts down, or the latched
    /// output error.
    async fn wait_for_space(&self, required: usize, wait: bool) -> Result<()>;
}

/// A TS feed handed out by the engine.
pub trait TsFeed: Send + Sync {
    fn set(&self, params: &TsFeedParams) -> Result<()>;
    fn start_filtering(&self) -> Result<()>;
    fn stop_filtering(&self) -> Result<()>;

    fn set_tsp_out_format(&self, _format: TspFormat) -> Result<()> {
        Ok(())
    }

    fn set_secure_mode(&self, _mode: &SecureMode) -> Result<()> {
        Ok(())
    }

    fn set_cipher_ops(&self, _ops: &CipherOps) -> Result<()> {
        Ok(())
    }

    fn set_video_codec(&self, _codec: VideoCodec) -> Result<()> {
        Ok(())
    }

    fn set_indexing(&self, _params: &IndexingParams) -> Result<()> {
        Err(DmxError::unsupported("indexing"))
    }

    fn oob_command(&self, _cmd: OobCommand) -> Result<()> {
        Ok(())
    }

    /// Drops data the engine still holds for this feed.
    fn flush_buffer(&self, _len: usize) -> Result<()> {
        Ok(())
    }

    /// Reports bytes the consumer released.
    fn notify_data_read(&self, _len: usize) -> Result<()> {
        Ok(())
    }

    fn scrambling_bits(&self) -> Result<u8> {
        Err(DmxError::unsupported("scrambling bits"))
    }

    fn reuse_decoder_buffer(&self, _cookie: u32) -> Result<()> {
        Err(DmxError::NoDevice("no decoder buffer".to_string()))
    }

    fn decoder_buffer_status(&self) -> Result<BufferStatus> {
        Err(DmxError::NoDevice("no decoder buffer".to_string()))
    }

    fn ts_insertion_init(&self) -> Result<()> {
        Ok(())
    }

    fn ts_insertion_terminate(&self) -> Result<()> {
        Ok(())
    }

    fn ts_insertion_insert(&self, _packets: &[u8]) -> Result<()> {
        Err(DmxError::unsupported("ts insertion"))
    }
}

/// A section feed handed out by the engine; one per PID, shared by filters.
pub trait SectionFeed: Send + Sync {
    fn set(&self, pid: u16, check_crc: bool) -> Result<()>;
    fn allocate_filter(
        &self,
        pattern: &EnginePattern,
        sink: Arc<dyn FeedSink>,
    ) -> Result<SectionFilterId>;
    fn release_filter(&self, filter: SectionFilterId) -> Result<()>;
    fn start_filtering(&self) -> Result<()>;
    fn stop_filtering(&self) -> Result<()>;

    fn set_secure_mode(&self, _mode: &SecureMode) -> Result<()> {
        Ok(())
    }

    fn set_cipher_ops(&self, _ops: &CipherOps) -> Result<()> {
        Ok(())
    }

    fn oob_command(&self, _cmd: OobCommand) -> Result<()> {
        Ok(())
    }

    fn flush_buffer(&self, _len: usize) -> Result<()> {
        Ok(())
    }

    fn notify_data_read(&self, _filter: SectionFilterId, _len: usize) -> Result<()> {
        Ok(())
    }

    fn scrambling_bits(&self) -> Result<u8> {
        Err(DmxError::unsupported("scrambling bits"))
    }
}

/// Device-wide entry points of the engine.
#[async_trait]
pub trait DemuxEngine: Send + Sync {
    /// Capabilities, or `None` when the engine does not describe them.
    fn caps(&self) -> Option<DemuxCaps> {
        None
    }

    /// TS packet size of the raw input.
    fn tsp_size(&self) -> usize {
        188
    }

    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn allocate_ts_feed(&self, sink: Arc<dyn FeedSink>) -> Result<Arc<dyn TsFeed>>;
    fn release_ts_feed(&self, feed: Arc<dyn TsFeed>) -> Result<()>;
    fn allocate_section_feed(&self) -> Result<Arc<dyn SectionFeed>>;
    fn release_section_feed(&self, feed: Arc<dyn SectionFeed>) -> Result<()>;

    /// Feeds raw input. May wait while consumers are full in pull mode.
    async fn write(&self, _data: &[u8]) -> Result<usize> {
        Err(DmxError::unsupported("raw input"))
    }

    /// Makes a pending [`write`](Self::write) return early.
    fn write_cancel(&self) {}

    /// Switches the engine to reading from memory.
    fn attach_memory_input(&self) -> Result<()> {
        Err(DmxError::unsupported("memory input"))
    }

    fn detach_memory_input(&self) -> Result<()> {
        Ok(())
    }

    fn set_playback_mode(&self, _mode: PlaybackMode) -> Result<()> {
        Err(DmxError::unsupported("playback mode"))
    }

    fn set_source(&self, _source: Source) -> Result<()> {
        Ok(())
    }

    fn set_tsp_format(&self, _format: TspFormat) -> Result<()> {
        Err(DmxError::unsupported("input packet format"))
    }

    fn get_stc(&self, _num: u32) -> Result<StcReading> {
        Err(DmxError::unsupported("stc"))
    }

    /// PIDs of the audio, video, teletext, subtitle and PCR streams.
    fn get_pes_pids(&self) -> Result<[u16; 5]> {
        Err(DmxError::unsupported("pes pids"))
    }
}

impl fmt::Debug for dyn DemuxEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DemuxEngine")
            .field("caps", &self.caps())
            .field("tsp_size", &self.tsp_size())
            .finish()
    }
}
