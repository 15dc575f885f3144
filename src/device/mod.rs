//! # Demux Device
//!
//! The device owns a fixed table of filter slots and the DVR paths, and
//! routes engine callbacks into the right output. Consumers get a [`Filter`]
//! handle per opened slot; dropping the handle frees the slot.
//!
//! ```rust
//! # use dmxcore::{DeviceConfig, Demux, Result};
//! # use dmxcore::device::params::{SectionFilterParams, SectionPattern};
//! # async fn run(demux: Demux) -> Result<()> {
//! let filter = demux.open_filter()?;
//! let mut params = SectionFilterParams::new(0x0000, SectionPattern::table_id(0x00));
//! params.flags.immediate_start = true;
//! filter.set_section_filter(params)?;
//!
//! let mut pat = [0u8; 1024];
//! let n = filter.read(&mut pat, false).await?;
//! println!("PAT section of {} bytes", n);
//! # Ok(())
//! # }
//! ```
//!
//! Locks are always taken in this order: filter configuration, device table,
//! filter data, DVR output. Engine calls are made with at most the first two
//! held, since the engine may call back into a sink at any time.

mod filter;
mod insertion;
/// Parameter and descriptor types
pub mod params;
mod read;
mod sink;

pub use filter::{Filter, FilterState};

use crate::buffer::{EventMask, Output, RingBuffer};
use crate::config::DeviceConfig;
use crate::dvr::{DvrInput, DvrOutput, DvrReader, DvrWriter};
use crate::engine::{DemuxCaps, DemuxEngine, SectionFeed};
use crate::error::{DmxError, Result};
use filter::FilterShared;
use log::{debug, info};
use params::{PlaybackMode, Source, StcReading, TspFormat};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

/// State shared by every sink, timer and worker of one device.
pub(crate) struct Context {
    pub config: DeviceConfig,
    /// Auto-flush as allowed by both the configuration and the engine
    pub auto_flush: bool,
    pub exit: AtomicBool,
    /// The DVR writer is closing
    pub input_exit: AtomicBool,
    pub pull_mode: AtomicBool,
    pub dvr: DvrOutput,
    pub runtime: Handle,
}

impl Context {
    pub fn exiting(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    pub fn pull_mode(&self) -> bool {
        self.pull_mode.load(Ordering::Acquire)
    }
}

/// A section feed shared by every running section filter on its PID.
pub(crate) struct SharedSectionFeed {
    pub feed: Arc<dyn SectionFeed>,
    pub users: usize,
}

/// Device-wide state behind the device lock.
pub(crate) struct DeviceTable {
    pub section_feeds: HashMap<u16, SharedSectionFeed>,
    pub playback_mode: PlaybackMode,
    pub source: Source,
}

pub(crate) struct DeviceShared {
    pub engine: Arc<dyn DemuxEngine>,
    pub ctx: Arc<Context>,
    pub filters: Vec<Arc<FilterShared>>,
    pub table: Mutex<DeviceTable>,
    pub dvr_in: DvrInput,
}

impl DeviceShared {
    pub fn caps(&self) -> Option<DemuxCaps> {
        self.engine.caps()
    }

    /// Wakes every waiter on every output of the device.
    pub fn wake_all(&self) {
        for filter in &self.filters {
            filter.notify.notify_waiters();
        }
        self.ctx.dvr.notify.notify_waiters();
        self.dvr_in.notify.notify_waiters();
    }
}

/// A demux device bound to one engine.
#[derive(Clone)]
pub struct Demux {
    shared: Arc<DeviceShared>,
}

impl Demux {
    /// Opens the engine and prepares the filter table.
    ///
    /// Must be called from within a tokio runtime; timers and the DVR worker
    /// are spawned on it.
    ///
    /// # Errors
    ///
    /// Fails if the configuration does not validate, no runtime is running
    /// or the engine refuses to open.
    pub fn new(engine: Arc<dyn DemuxEngine>, config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| DmxError::NoDevice(format!("no tokio runtime: {e}")))?;
        engine.open()?;

        let caps = engine.caps();
        let auto_flush = config.auto_flush && caps.map_or(true, |c| c.flags.auto_buffer_flush);
        debug!(
            "demux device: {} filters, auto flush {}",
            config.filter_count, auto_flush
        );

        let mut dvr_out = Output::new(
            RingBuffer::detached(config.dvr_buffer_size),
            config.event_queue_slots,
        );
        dvr_out.events.set_mask(EventMask::default());

        let ctx = Arc::new(Context {
            auto_flush,
            exit: AtomicBool::new(false),
            input_exit: AtomicBool::new(false),
            pull_mode: AtomicBool::new(false),
            dvr: DvrOutput::new(dvr_out),
            runtime,
            config: config.clone(),
        });

        let filters = (0..config.filter_count)
            .map(|id| Arc::new(FilterShared::new(id, ctx.clone())))
            .collect();

        let shared = Arc::new(DeviceShared {
            dvr_in: DvrInput::new(&config),
            engine,
            ctx,
            filters,
            table: Mutex::new(DeviceTable {
                section_feeds: HashMap::new(),
                playback_mode: PlaybackMode::Push,
                source: Source::default(),
            }),
        });
        Ok(Self { shared })
    }

    /// Opens a free filter slot.
    ///
    /// # Errors
    ///
    /// [`DmxError::NoFreeFilter`] when every slot is taken,
    /// [`DmxError::Teardown`] after [`shutdown`](Self::shutdown).
    pub fn open_filter(&self) -> Result<Filter> {
        if self.shared.ctx.exiting() {
            return Err(DmxError::Teardown);
        }
        let slot = self
            .shared
            .filters
            .iter()
            .find(|filter| filter.try_allocate())
            .cloned()
            .ok_or(DmxError::NoFreeFilter)?;
        debug!("filter {} allocated", slot.id);
        Ok(Filter::new(self.shared.clone(), slot))
    }

    /// Opens the single DVR reader.
    pub fn open_dvr_reader(&self) -> Result<DvrReader> {
        DvrReader::open(self.shared.clone())
    }

    /// Opens the single DVR writer and starts feeding the engine.
    pub fn open_dvr_writer(&self) -> Result<DvrWriter> {
        DvrWriter::open(self.shared.clone())
    }

    pub fn caps(&self) -> Option<DemuxCaps> {
        self.shared.caps()
    }

    pub fn playback_mode(&self) -> PlaybackMode {
        self.shared.table.lock().playback_mode
    }

    pub fn source(&self) -> Source {
        self.shared.table.lock().source
    }

    /// Whether overflowing outputs are flushed instead of latching an error.
    pub fn auto_flush(&self) -> bool {
        self.shared.ctx.auto_flush
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.shared.ctx.config
    }

    /// Selects the input the engine demultiplexes.
    pub fn set_source(&self, source: Source) -> Result<()> {
        let mut table = self.shared.table.lock();
        self.shared.engine.set_source(source)?;
        table.source = source;
        Ok(())
    }

    /// Sets the TS packet format of the raw input.
    pub fn set_ts_packet_format(&self, format: TspFormat) -> Result<()> {
        self.shared.engine.set_tsp_format(format)
    }

    pub fn get_stc(&self, num: u32) -> Result<StcReading> {
        self.shared.engine.get_stc(num)
    }

    /// PIDs of the audio, video, teletext, subtitle and PCR streams.
    pub fn pes_pids(&self) -> Result<[u16; 5]> {
        self.shared.engine.get_pes_pids()
    }

    /// Marks the device as exiting, wakes every waiter and closes the engine.
    ///
    /// Blocked operations return [`DmxError::Teardown`]; open handles stay
    /// valid but no longer make progress.
    pub fn shutdown(&self) -> Result<()> {
        if self.shared.ctx.exit.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("demux device shutting down");
        self.shared.ctx.input_exit.store(true, Ordering::Release);
        self.shared.engine.write_cancel();
        self.shared.wake_all();
        self.shared.engine.close()
    }
}

impl std::fmt::Debug for Demux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Demux")
            .field("filters", &self.shared.filters.len())
            .field("auto_flush", &self.shared.ctx.auto_flush)
            .field("exiting", &self.shared.ctx.exiting())
            .finish()
    }
}
