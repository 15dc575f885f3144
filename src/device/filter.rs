use super::insertion::Insertion;
use super::params::{
    BufferMode, CipherOps, DecoderBuffers, IndexingParams, PesFilterParams, PesOutput, PesType,
    PlaybackMode, SectionFilterParams, SecureMode, Source, TsFeedParams, TspFormat, VideoCodec,
    MAX_CIPHER_OPS, MAX_PIDS,
};
use super::sink::FilterSink;
use super::{Context, DeviceShared, DeviceTable, SharedSectionFeed};
use crate::buffer::{Event, EventKind, EventMask, Output, RingBuffer};
use crate::engine::{BufferCaps, DemuxCaps, FeedSink, SectionFeed, SectionFilterId, TsFeed};
use crate::error::{DmxError, Result};
use crate::utils::align_down;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

/// Lifecycle of a filter slot.
///
/// `Free → Allocated → Set → Go`, and from `Go` on to `Done` (one-shot
/// section delivered), `TimedOut` (section deadline expired) or back to `Set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterState {
    Free,
    Allocated,
    Set,
    Go,
    Done,
    TimedOut,
}

/// What a filter was configured as.
#[derive(Debug, Clone, Default)]
pub(crate) enum FilterKind {
    #[default]
    Unset,
    Section(SectionFilterParams),
    Pes(PesFilterParams),
}

impl FilterKind {
    pub fn pes_output(&self) -> Option<PesOutput> {
        match self {
            FilterKind::Pes(params) => Some(params.output),
            _ => None,
        }
    }
}

/// One PID of a packetized-stream filter with its running feed.
pub(crate) struct PidFeed {
    pub pid: u16,
    pub ts: Option<Arc<dyn TsFeed>>,
    pub cipher: CipherOps,
    pub indexing: IndexingParams,
}

impl PidFeed {
    fn new(pid: u16) -> Self {
        Self {
            pid,
            ts: None,
            cipher: CipherOps {
                pid,
                ..CipherOps::default()
            },
            indexing: IndexingParams {
                pid,
                ..IndexingParams::default()
            },
        }
    }
}

/// A running section filter inside a shared section feed.
pub(crate) struct SectionBinding {
    pub pid: u16,
    pub feed: Arc<dyn SectionFeed>,
    pub filter: SectionFilterId,
}

/// Per-filter configuration, guarded by the configuration lock.
#[derive(Default)]
pub(crate) struct FilterConfig {
    pub kind: FilterKind,
    pub pids: Vec<PidFeed>,
    pub section: Option<SectionBinding>,
    pub section_cipher: CipherOps,
    pub buffer_mode: BufferMode,
    pub tsp_format: TspFormat,
    pub decoder_buffers: DecoderBuffers,
    pub secure_mode: SecureMode,
    pub insertions: Vec<Insertion>,
    pub rec_chunk: usize,
}

impl FilterConfig {
    fn new(decoder_buffer_size: usize) -> Self {
        Self {
            decoder_buffers: DecoderBuffers::internal(decoder_buffer_size),
            ..Self::default()
        }
    }

    /// Feed of the first PID, which carries filter-wide engine calls.
    pub fn first_ts(&self) -> Option<Arc<dyn TsFeed>> {
        self.pids.first().and_then(|p| p.ts.clone())
    }

    pub fn pid_feed_mut(&mut self, pid: u16) -> Option<&mut PidFeed> {
        self.pids.iter_mut().find(|p| p.pid == pid)
    }
}

/// Progress through the section being read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SectionFraming {
    /// Body bytes of the current section still to read; 0 between sections
    pub remaining: usize,
    pub header: [u8; 3],
    pub header_len: usize,
}

/// Data-path state, guarded by the short lock shared with engine callbacks.
pub(crate) struct FilterData {
    pub state: FilterState,
    pub eos: bool,
    pub output: Output,
    pub deadline: Option<AbortHandle>,
    pub deadline_generation: u64,
    pub framing: SectionFraming,
}

impl FilterData {
    pub fn cancel_deadline(&mut self) {
        if let Some(task) = self.deadline.take() {
            task.abort();
        }
        self.deadline_generation = self.deadline_generation.wrapping_add(1);
    }
}

/// A filter slot of the device table.
pub(crate) struct FilterShared {
    pub id: usize,
    pub ctx: Arc<Context>,
    pub config: Mutex<FilterConfig>,
    pub data: Mutex<FilterData>,
    pub notify: Notify,
    /// Serializes consumer reads so section framing stays consistent
    pub reader: tokio::sync::Mutex<()>,
}

impl FilterShared {
    pub fn new(id: usize, ctx: Arc<Context>) -> Self {
        let mut output = Output::new(
            RingBuffer::detached(ctx.config.filter_buffer_size),
            ctx.config.event_queue_slots,
        );
        output.events.set_mask(EventMask::filter_default());
        Self {
            id,
            config: Mutex::new(FilterConfig::new(ctx.config.decoder_buffer_size)),
            data: Mutex::new(FilterData {
                state: FilterState::Free,
                eos: false,
                output,
                deadline: None,
                deadline_generation: 0,
                framing: SectionFraming::default(),
            }),
            notify: Notify::new(),
            reader: tokio::sync::Mutex::new(()),
            ctx,
        }
    }

    pub fn state(&self) -> FilterState {
        self.data.lock().state
    }

    /// Claims the slot if it is free, resetting it to a fresh configuration.
    pub fn try_allocate(&self) -> bool {
        let mut config = self.config.lock();
        let mut data = self.data.lock();
        if data.state != FilterState::Free {
            return false;
        }
        *config = FilterConfig::new(self.ctx.config.decoder_buffer_size);
        data.output.install(None, self.ctx.config.filter_buffer_size);
        data.output.events.set_mask(EventMask::filter_default());
        data.output.events.set_untracked_data_reads(false);
        data.framing = SectionFraming::default();
        data.eos = false;
        data.state = FilterState::Allocated;
        true
    }

    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Latches the section timeout if `generation` is still the armed deadline.
    fn expire(&self, generation: u64) {
        let mut data = self.data.lock();
        if data.deadline_generation != generation || data.state != FilterState::Go {
            return;
        }
        data.deadline = None;
        data.output.ring.latch(crate::buffer::LatchedError::Timeout);
        data.state = FilterState::TimedOut;
        data.output.post(Event::SectionTimeout);
        drop(data);
        debug!("filter {} section deadline expired", self.id);
        self.wake();
    }

    fn arm_deadline(self: &Arc<Self>, data: &mut FilterData, timeout: Duration) {
        data.cancel_deadline();
        let generation = data.deadline_generation;
        let filter: Weak<FilterShared> = Arc::downgrade(self);
        let task = self.ctx.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(filter) = filter.upgrade() {
                filter.expire(generation);
            }
        });
        data.deadline = Some(task.abort_handle());
    }
}

/// Recording chunk size for a TS output: at least `min`, below the buffer
/// size and a whole number of packets.
pub(crate) fn rec_chunk_size(requested: usize, min: usize, buffer_size: usize, tsp: usize) -> usize {
    let mut chunk = requested.max(min);
    if chunk >= buffer_size {
        chunk = buffer_size >> 2;
    }
    align_down(chunk, tsp).max(tsp)
}

/// Limits that apply to a filter's own buffer, if the engine describes any.
fn buffer_caps(caps: &DemuxCaps, config: &FilterConfig) -> Option<BufferCaps> {
    match &config.kind {
        FilterKind::Unset | FilterKind::Section(_) => Some(caps.section),
        FilterKind::Pes(params) => match params.output {
            PesOutput::Decoder => None,
            PesOutput::Tap => Some(caps.pes),
            PesOutput::TsTap | PesOutput::TsDemuxTap => {
                Some(*caps.recording(config.tsp_format.packet_size()))
            }
        },
    }
}

fn configure_ts_feed(
    ts: &dyn TsFeed,
    params: &TsFeedParams,
    config: &FilterConfig,
    pid_feed: &PidFeed,
    codec: VideoCodec,
) -> Result<()> {
    ts.set(params)?;
    ts.set_tsp_out_format(config.tsp_format)?;
    ts.set_secure_mode(&config.secure_mode)?;
    ts.set_cipher_ops(&pid_feed.cipher)?;
    if matches!(params.pes_type, PesType::Video(_)) {
        ts.set_video_codec(codec)?;
    }
    if params.output.is_ts() && pid_feed.indexing.enable {
        ts.set_indexing(&pid_feed.indexing)?;
    }
    Ok(())
}

/// Handle to an opened filter slot. Dropping it stops the filter and frees
/// the slot.
pub struct Filter {
    pub(crate) dev: Arc<DeviceShared>,
    pub(crate) shared: Arc<FilterShared>,
}

impl Filter {
    pub(crate) fn new(dev: Arc<DeviceShared>, shared: Arc<FilterShared>) -> Self {
        Self { dev, shared }
    }

    /// Index of the slot in the device table.
    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn state(&self) -> FilterState {
        self.shared.state()
    }

    /// Configures the filter for sections, stopping it first if running.
    pub fn set_section_filter(&self, params: SectionFilterParams) -> Result<()> {
        let mut config = self.shared.config.lock();
        self.stop_locked(&mut config)?;
        self.reset_locked(&mut config);

        config.kind = FilterKind::Section(params);
        config.section_cipher = CipherOps {
            pid: params.pid,
            ..CipherOps::default()
        };
        self.shared.data.lock().state = FilterState::Set;

        if params.flags.immediate_start {
            self.start_locked(&mut config)?;
        }
        Ok(())
    }

    /// Configures the filter for a packetized stream on `params.pid`.
    pub fn set_pes_filter(&self, params: PesFilterParams) -> Result<()> {
        let mut config = self.shared.config.lock();
        self.stop_locked(&mut config)?;
        self.reset_locked(&mut config);
        params.pes_type.validate()?;

        config.kind = FilterKind::Pes(params);
        self.shared.data.lock().state = FilterState::Set;
        self.add_pid_locked(&mut config, params.pid)?;

        if params.immediate_start {
            self.start_locked(&mut config)?;
        }
        Ok(())
    }

    /// Starts delivery, restarting the filter if it already runs.
    pub fn start(&self) -> Result<()> {
        let mut config = self.shared.config.lock();
        self.start_locked(&mut config)
    }

    /// Stops delivery and drops everything buffered.
    pub fn stop(&self) -> Result<()> {
        let mut config = self.shared.config.lock();
        self.stop_locked(&mut config)
    }

    /// Adds a PID to a packetized-stream filter. Only demux-tap outputs carry
    /// more than one PID.
    pub fn add_pid(&self, pid: u16) -> Result<()> {
        let mut config = self.shared.config.lock();
        self.add_pid_locked(&mut config, pid)
    }

    /// Removes a PID; the last one can't be removed.
    pub fn remove_pid(&self, pid: u16) -> Result<()> {
        let mut config = self.shared.config.lock();
        let output = match &config.kind {
            FilterKind::Pes(params) if self.state() >= FilterState::Set => params.output,
            _ => return Err(DmxError::invalid("not a configured stream filter")),
        };
        if config.pids.len() <= 1 {
            return Err(DmxError::invalid("cannot remove the last pid"));
        }
        let index = config
            .pids
            .iter()
            .position(|p| p.pid == pid)
            .ok_or_else(|| DmxError::invalid(format!("pid {pid:#x} not in filter")))?;

        let removed = config.pids.remove(index);
        if let Some(ts) = removed.ts {
            if output == PesOutput::TsTap {
                self.shared.ctx.dvr.unregister(&ts);
            }
            if let Err(e) = ts.stop_filtering() {
                warn!("filter {}: stopping pid {:#x} failed: {}", self.id(), pid, e);
            }
            self.dev.engine.release_ts_feed(ts)?;
        }
        Ok(())
    }

    /// Replaces the internal buffer with one of `size` bytes.
    pub fn set_buffer_size(&self, size: usize) -> Result<()> {
        let config = self.shared.config.lock();
        let mut data = self.shared.data.lock();
        if data.output.ring.capacity() == size {
            return Ok(());
        }
        if size == 0 || config.buffer_mode == BufferMode::External {
            return Err(DmxError::invalid("buffer size"));
        }
        if data.state >= FilterState::Go {
            return Err(DmxError::busy("filter is running"));
        }
        data.output.install(Some(vec![0; size]), size);
        debug!("filter {} buffer resized to {}", self.id(), size);
        Ok(())
    }

    /// Switches between crate-allocated and caller-provided storage.
    ///
    /// Any current storage is dropped; external mode requires the engine to
    /// allow caller-provided buffers for this filter's output class.
    pub fn set_buffer_mode(&self, mode: BufferMode) -> Result<()> {
        let mut config = self.shared.config.lock();
        if self.state() >= FilterState::Go {
            return Err(DmxError::busy("filter is running"));
        }
        if mode == BufferMode::External {
            let allowed = self
                .dev
                .caps()
                .and_then(|caps| buffer_caps(&caps, &config))
                .map_or(false, |class| class.external);
            if !allowed {
                return Err(DmxError::invalid("external buffers not supported"));
            }
        }
        if config.buffer_mode == mode {
            return Ok(());
        }
        config.buffer_mode = mode;
        self.shared.data.lock().output.detach();
        Ok(())
    }

    /// Installs caller-provided storage; requires external mode.
    pub fn set_buffer(&self, storage: Vec<u8>) -> Result<()> {
        let config = self.shared.config.lock();
        let mut data = self.shared.data.lock();
        if data.state >= FilterState::Go {
            return Err(DmxError::busy("filter is running"));
        }
        if storage.is_empty() || config.buffer_mode == BufferMode::Internal {
            return Err(DmxError::invalid("external buffer"));
        }
        let size = storage.len();
        data.output.install(Some(storage), size);
        Ok(())
    }

    pub fn set_ts_out_format(&self, format: TspFormat) -> Result<()> {
        let mut config = self.shared.config.lock();
        if self.state() >= FilterState::Go {
            return Err(DmxError::busy("filter is running"));
        }
        config.tsp_format = format;
        Ok(())
    }

    /// Sets the size of internally allocated decoder buffers.
    pub fn set_decoder_buffer_size(&self, size: usize) -> Result<()> {
        let mut config = self.shared.config.lock();
        if let Some(caps) = self.dev.caps() {
            if !caps.decoder.accepts(size) {
                return Err(DmxError::invalid(format!("decoder buffer size {size}")));
            }
        }
        if size == 0 {
            return Err(DmxError::invalid("zero decoder buffer size"));
        }
        if config.decoder_buffers.buffers_size == size {
            return Ok(());
        }
        if self.state() >= FilterState::Go {
            return Err(DmxError::busy("filter is running"));
        }
        config.decoder_buffers = DecoderBuffers::internal(size);
        Ok(())
    }

    /// Describes the decoder buffers, internal or by external handles.
    pub fn set_decoder_buffer(&self, buffers: DecoderBuffers) -> Result<()> {
        let mut config = self.shared.config.lock();
        let caps = self
            .dev
            .caps()
            .ok_or_else(|| DmxError::invalid("engine describes no decoder buffers"))?;
        let decoder = caps.decoder;
        let num = buffers.handles.len();

        if !decoder.accepts(buffers.buffers_size) {
            return Err(DmxError::invalid("decoder buffer size"));
        }
        if buffers.buffers_size == 0 || (buffers.is_linear && (num <= 1 || num > 32)) {
            return Err(DmxError::invalid("decoder buffer layout"));
        }
        if buffers.is_external() {
            if (!decoder.linear_group && num > 1) || !decoder.external || num > decoder.max_buffer_num
            {
                return Err(DmxError::invalid("external decoder buffers not supported"));
            }
        } else if !decoder.internal || buffers.is_linear {
            return Err(DmxError::invalid("internal decoder buffers not supported"));
        }
        if self.state() >= FilterState::Go {
            return Err(DmxError::busy("filter is running"));
        }
        config.decoder_buffers = buffers;
        Ok(())
    }

    /// Hands a consumed decoder buffer back to the engine.
    pub fn reuse_decoder_buffer(&self, cookie: u32) -> Result<()> {
        let config = self.shared.config.lock();
        {
            let data = self.shared.data.lock();
            let es_events = !data
                .output
                .events
                .mask()
                .disable
                .contains(EventKind::NewEsData);
            let decoder = config.kind.pes_output() == Some(PesOutput::Decoder);
            if data.state != FilterState::Go || !decoder || !es_events {
                return Err(DmxError::denied("not a running decoder filter with es events"));
            }
        }
        let ts = config
            .first_ts()
            .ok_or_else(|| DmxError::NoDevice("no feed".to_string()))?;
        ts.reuse_decoder_buffer(cookie)
    }

    /// Changes which events are queued and which count toward wakeups.
    ///
    /// Buffer overflow is always queued and always wakes.
    pub fn set_event_mask(&self, mut mask: EventMask) -> Result<()> {
        let _config = self.shared.config.lock();
        let mut data = self.shared.data.lock();
        if mask.wakeup_threshold >= data.output.events.capacity() {
            return Err(DmxError::invalid("wakeup threshold exceeds queue"));
        }
        if data.state == FilterState::Go {
            return Err(DmxError::busy("filter is running"));
        }
        mask.disable = mask.disable.without(EventKind::BufferOverflow);
        mask.no_wakeup = mask.no_wakeup.without(EventKind::BufferOverflow);
        data.output.events.set_mask(mask);
        Ok(())
    }

    pub fn event_mask(&self) -> EventMask {
        self.shared.data.lock().output.events.mask()
    }

    /// Enables or disables video indexing on one PID of a TS output.
    pub fn set_indexing_params(&self, params: IndexingParams) -> Result<()> {
        let mut config = self.shared.config.lock();
        let supported = self.dev.caps().map_or(false, |c| c.flags.video_indexing);
        let state = self.state();
        let ts_output = config.kind.pes_output().map_or(false, PesOutput::is_ts);
        if !supported || state < FilterState::Set || !ts_output {
            return Err(DmxError::invalid("indexing needs a configured TS output"));
        }
        if params.enable && params.types == 0 {
            return Err(DmxError::invalid("no index types"));
        }
        let pid_feed = config
            .pid_feed_mut(params.pid)
            .ok_or_else(|| DmxError::invalid(format!("pid {:#x} not in filter", params.pid)))?;
        pid_feed.indexing = params;
        if state == FilterState::Go {
            if let Some(ts) = &pid_feed.ts {
                ts.set_indexing(&params)?;
            }
        }
        Ok(())
    }

    /// Sets the cipher pipeline of one PID; needs secure mode unless empty.
    pub fn set_cipher(&self, ops: CipherOps) -> Result<()> {
        let mut config = self.shared.config.lock();
        let caps = self
            .dev
            .caps()
            .ok_or_else(|| DmxError::invalid("engine describes no cipher support"))?;
        if ops.operations.len() > caps.num_cipher_ops || ops.operations.len() > MAX_CIPHER_OPS {
            return Err(DmxError::invalid("too many cipher operations"));
        }
        let state = self.state();
        if state < FilterState::Set || state > FilterState::Go {
            return Err(DmxError::denied("filter is not configured"));
        }
        if !config.secure_mode.is_secured && !ops.operations.is_empty() {
            return Err(DmxError::denied("cipher needs secure mode"));
        }

        match config.kind.clone() {
            FilterKind::Pes(_) => {
                let pid_feed = config
                    .pid_feed_mut(ops.pid)
                    .ok_or_else(|| DmxError::invalid(format!("pid {:#x} not in filter", ops.pid)))?;
                if state == FilterState::Go {
                    if let Some(ts) = &pid_feed.ts {
                        ts.set_cipher_ops(&ops)?;
                    }
                }
                pid_feed.cipher = ops;
            }
            FilterKind::Section(params) if params.pid == ops.pid => {
                if state == FilterState::Go {
                    if let Some(binding) = &config.section {
                        binding.feed.set_cipher_ops(&ops)?;
                    }
                }
                config.section_cipher = ops;
            }
            _ => return Err(DmxError::invalid(format!("pid {:#x} not in filter", ops.pid))),
        }
        Ok(())
    }

    pub fn set_secure_mode(&self, mode: SecureMode) -> Result<()> {
        let mut config = self.shared.config.lock();
        if self.state() == FilterState::Go {
            return Err(DmxError::busy("filter is running"));
        }
        config.secure_mode = mode;
        Ok(())
    }

    /// Switches the device between push and pull flow control.
    ///
    /// Pull mode needs a DVR source and engine support.
    pub fn set_playback_mode(&self, mode: PlaybackMode) -> Result<()> {
        let _config = self.shared.config.lock();
        let mut table = self.dev.table.lock();
        if mode == PlaybackMode::Pull {
            let pull_capable = self.dev.caps().map_or(false, |c| c.flags.pull_mode);
            if !table.source.is_dvr() || !pull_capable {
                return Err(DmxError::denied("pull mode needs a dvr source"));
            }
        }
        if self.state() == FilterState::Go {
            return Err(DmxError::busy("filter is running"));
        }
        self.dev.engine.set_playback_mode(mode)?;
        table.playback_mode = mode;
        self.shared
            .ctx
            .pull_mode
            .store(mode == PlaybackMode::Pull, Ordering::Release);
        debug!("playback mode set to {:?}", mode);
        Ok(())
    }

    /// Selects the device input; refused while this filter runs.
    pub fn set_source(&self, source: Source) -> Result<()> {
        let _config = self.shared.config.lock();
        if self.state() == FilterState::Go {
            return Err(DmxError::busy("filter is running"));
        }
        let mut table = self.dev.table.lock();
        self.dev.engine.set_source(source)?;
        table.source = source;
        Ok(())
    }

    /// Current scrambling control bits of `pid`.
    pub fn scrambling_bits(&self, pid: u16) -> Result<u8> {
        let config = self.shared.config.lock();
        if self.state() != FilterState::Go {
            return Err(DmxError::invalid("filter is not running"));
        }
        match &config.kind {
            FilterKind::Section(_) => match &config.section {
                Some(binding) => binding.feed.scrambling_bits(),
                None => Err(DmxError::invalid("no section feed")),
            },
            FilterKind::Pes(_) => config
                .pids
                .iter()
                .find(|p| p.pid == pid)
                .and_then(|p| p.ts.as_ref())
                .ok_or_else(|| DmxError::invalid(format!("pid {pid:#x} not in filter")))?
                .scrambling_bits(),
            FilterKind::Unset => Err(DmxError::invalid("filter is not configured")),
        }
    }

    /// Drops everything buffered and tells the engine.
    pub fn flush_buffer(&self) -> Result<()> {
        let config = self.shared.config.lock();
        if self.state() != FilterState::Go {
            return Err(DmxError::invalid("filter is not running"));
        }
        let flushed = if config.kind.pes_output() == Some(PesOutput::TsTap) {
            let flushed = self.shared.ctx.dvr.output.lock().flush();
            self.shared.ctx.dvr.notify.notify_waiters();
            flushed
        } else {
            let flushed = self.shared.data.lock().output.flush();
            self.shared.wake();
            flushed
        };
        debug!("filter {} flushed {} bytes", self.id(), flushed);
        match &config.kind {
            FilterKind::Pes(_) => match config.first_ts() {
                Some(ts) => ts.flush_buffer(flushed),
                None => Ok(()),
            },
            FilterKind::Section(_) => match &config.section {
                Some(binding) => binding.feed.flush_buffer(flushed),
                None => Ok(()),
            },
            FilterKind::Unset => Ok(()),
        }
    }

    pub(crate) fn add_pid_locked(&self, config: &mut FilterConfig, pid: u16) -> Result<()> {
        let params = match &config.kind {
            FilterKind::Pes(params) if self.state() >= FilterState::Set => *params,
            _ => return Err(DmxError::invalid("not a configured stream filter")),
        };
        if config.pids.iter().any(|p| p.pid == pid) {
            return Ok(());
        }
        if params.output != PesOutput::TsDemuxTap && !config.pids.is_empty() {
            return Err(DmxError::invalid("only demux-tap outputs take several pids"));
        }
        if config.pids.len() >= MAX_PIDS {
            return Err(DmxError::invalid("too many pids"));
        }

        config.pids.push(PidFeed::new(pid));
        if self.state() >= FilterState::Go {
            let index = config.pids.len() - 1;
            if let Err(e) = self.start_feed(config, index, &params) {
                config.pids.pop();
                return Err(e);
            }
        }
        Ok(())
    }

    fn reset_locked(&self, config: &mut FilterConfig) {
        let mut data = self.shared.data.lock();
        if data.state >= FilterState::Set {
            config.pids.clear();
            config.kind = FilterKind::Unset;
            data.state = FilterState::Allocated;
        }
    }

    pub(crate) fn start_locked(&self, config: &mut FilterConfig) -> Result<()> {
        let state = self.state();
        if state < FilterState::Set {
            return Err(DmxError::invalid("filter is not configured"));
        }
        if state >= FilterState::Go {
            self.stop_locked(config)?;
        }

        let caps = self.dev.caps();
        if !self.buffer_size_fits(config, caps.as_ref()) {
            return Err(DmxError::invalid("buffer size not supported by engine"));
        }
        self.prepare_storage(config, caps.as_ref())?;

        match config.kind.clone() {
            FilterKind::Section(params) => {
                self.start_section(config, &params)?;
                let mut data = self.shared.data.lock();
                if let Some(timeout) = params.timeout() {
                    self.shared.arm_deadline(&mut data, timeout);
                }
                data.state = FilterState::Go;
            }
            FilterKind::Pes(params) => {
                self.start_pes(config, &params)?;
                self.shared.data.lock().state = FilterState::Go;
                self.start_insertions(config);
            }
            FilterKind::Unset => return Err(DmxError::invalid("filter is not configured")),
        }
        debug!("filter {} started", self.id());
        self.shared.wake();
        Ok(())
    }

    fn buffer_size_fits(&self, config: &FilterConfig, caps: Option<&DemuxCaps>) -> bool {
        let Some(caps) = caps else {
            return true;
        };
        let Some(class) = buffer_caps(caps, config) else {
            return true;
        };
        let size = if config.kind.pes_output() == Some(PesOutput::TsTap) {
            self.shared.ctx.dvr.output.lock().ring.capacity()
        } else {
            self.shared.data.lock().output.ring.capacity()
        };
        class.accepts(size)
    }

    fn prepare_storage(&self, config: &mut FilterConfig, caps: Option<&DemuxCaps>) -> Result<()> {
        let external_only = caps
            .and_then(|caps| buffer_caps(caps, config))
            .map_or(false, |class| class.external_only());
        let output = config.kind.pes_output();

        let mut data = self.shared.data.lock();
        if !data.output.ring.has_storage() {
            if matches!(output, Some(PesOutput::Decoder | PesOutput::TsTap)) {
                config.buffer_mode = BufferMode::Internal;
            }
            if output != Some(PesOutput::TsTap)
                && (config.buffer_mode == BufferMode::External || external_only)
            {
                return Err(DmxError::OutOfMemory("no external buffer set".to_string()));
            }
            let size = data.output.ring.capacity();
            data.output.install(Some(vec![0; size]), size);
        } else if config.buffer_mode == BufferMode::Internal && external_only {
            return Err(DmxError::OutOfMemory(
                "engine needs an external buffer".to_string(),
            ));
        }
        data.eos = false;
        data.output.reset();
        Ok(())
    }

    fn start_section(&self, config: &mut FilterConfig, params: &SectionFilterParams) -> Result<()> {
        let mut table = self.dev.table.lock();
        let pid = params.pid;

        let feed = match table.section_feeds.get(&pid) {
            Some(shared) => {
                let feed = shared.feed.clone();
                feed.stop_filtering()?;
                feed
            }
            None => {
                let feed = self.dev.engine.allocate_section_feed()?;
                let configured = feed
                    .set(pid, params.flags.check_crc)
                    .and_then(|_| feed.set_secure_mode(&config.secure_mode))
                    .and_then(|_| feed.set_cipher_ops(&config.section_cipher));
                if let Err(e) = configured {
                    if let Err(release) = self.dev.engine.release_section_feed(feed) {
                        warn!("releasing section feed failed: {}", release);
                    }
                    return Err(e);
                }
                table.section_feeds.insert(
                    pid,
                    SharedSectionFeed {
                        feed: feed.clone(),
                        users: 0,
                    },
                );
                feed
            }
        };

        let sink: Arc<dyn FeedSink> = Arc::new(FilterSink::section(
            self.shared.clone(),
            params.flags.oneshot,
        ));
        let filter = match feed.allocate_filter(&params.to_engine_layout(), sink) {
            Ok(filter) => filter,
            Err(e) => {
                self.restart_or_release(&mut table, pid, feed);
                return Err(e);
            }
        };
        if let Some(shared) = table.section_feeds.get_mut(&pid) {
            shared.users += 1;
        }

        {
            let mut data = self.shared.data.lock();
            data.framing = SectionFraming::default();
            let untracked = data
                .output
                .events
                .mask()
                .disable
                .contains(EventKind::NewSection);
            data.output.events.set_untracked_data_reads(untracked);
        }

        let binding = SectionBinding { pid, feed, filter };
        if let Err(e) = binding.feed.start_filtering() {
            self.release_section(&mut table, binding);
            return Err(e);
        }
        config.section = Some(binding);
        Ok(())
    }

    /// Drops this filter from its shared section feed.
    fn release_section(&self, table: &mut DeviceTable, binding: SectionBinding) {
        if let Err(e) = binding.feed.stop_filtering() {
            warn!("filter {}: stopping section feed failed: {}", self.id(), e);
        }
        if let Err(e) = binding.feed.release_filter(binding.filter) {
            warn!("filter {}: releasing section filter failed: {}", self.id(), e);
        }
        if let Some(shared) = table.section_feeds.get_mut(&binding.pid) {
            shared.users = shared.users.saturating_sub(1);
        }
        self.restart_or_release(table, binding.pid, binding.feed);
    }

    /// Restarts a shared section feed for its remaining users, or releases it.
    fn restart_or_release(&self, table: &mut DeviceTable, pid: u16, feed: Arc<dyn SectionFeed>) {
        let users = table.section_feeds.get(&pid).map_or(0, |shared| shared.users);
        if users > 0 {
            if let Err(e) = feed.start_filtering() {
                warn!("restarting section feed on pid {:#x} failed: {}", pid, e);
            }
            return;
        }
        table.section_feeds.remove(&pid);
        if let Err(e) = self.dev.engine.release_section_feed(feed) {
            warn!("releasing section feed on pid {:#x} failed: {}", pid, e);
        }
    }

    fn start_pes(&self, config: &mut FilterConfig, params: &PesFilterParams) -> Result<()> {
        let ctx = &self.shared.ctx;
        let tsp = config.tsp_format.packet_size();
        {
            let mut data = self.shared.data.lock();
            config.rec_chunk = rec_chunk_size(
                params.rec_chunk_size,
                ctx.config.min_rec_chunk_size,
                data.output.ring.capacity(),
                tsp,
            );
            let disabled = data.output.events.mask().disable;
            match params.output {
                PesOutput::TsTap => {
                    drop(data);
                    let mut dvr = ctx.dvr.output.lock();
                    let untracked = dvr
                        .events
                        .mask()
                        .disable
                        .contains(EventKind::NewRecordingChunk);
                    dvr.events.set_untracked_data_reads(untracked);
                }
                PesOutput::TsDemuxTap => data
                    .output
                    .events
                    .set_untracked_data_reads(disabled.contains(EventKind::NewRecordingChunk)),
                PesOutput::Tap => data
                    .output
                    .events
                    .set_untracked_data_reads(disabled.contains(EventKind::NewPes)),
                PesOutput::Decoder => data.output.events.set_untracked_data_reads(true),
            }
        }

        for index in 0..config.pids.len() {
            if let Err(e) = self.start_feed(config, index, params) {
                warn!("filter {}: starting pid feed failed: {}", self.id(), e);
                self.stop_pes(config, params.output);
                return Err(e);
            }
        }
        Ok(())
    }

    fn start_feed(
        &self,
        config: &mut FilterConfig,
        index: usize,
        params: &PesFilterParams,
    ) -> Result<()> {
        let sink: Arc<dyn FeedSink> = Arc::new(FilterSink::pes(
            self.shared.clone(),
            params.output,
            config.rec_chunk,
        ));
        let ts = self.dev.engine.allocate_ts_feed(sink)?;
        if params.output == PesOutput::TsTap {
            self.shared.ctx.dvr.register(ts.clone());
        }

        let pid_feed = &config.pids[index];
        let feed_params = TsFeedParams {
            pid: pid_feed.pid,
            output: params.output,
            pes_type: params.pes_type,
            decoder_buffer_size: config.decoder_buffers.buffers_size,
        };
        let started = configure_ts_feed(&*ts, &feed_params, config, pid_feed, params.video_codec)
            .and_then(|_| ts.start_filtering());
        if let Err(e) = started {
            if params.output == PesOutput::TsTap {
                self.shared.ctx.dvr.unregister(&ts);
            }
            if let Err(release) = self.dev.engine.release_ts_feed(ts) {
                warn!("releasing ts feed failed: {}", release);
            }
            return Err(e);
        }
        config.pids[index].ts = Some(ts);
        Ok(())
    }

    /// Stops and releases every PID feed, cancelling insertions in between.
    fn stop_pes(&self, config: &mut FilterConfig, output: PesOutput) {
        let mut stopped = Vec::new();
        for pid_feed in config.pids.iter_mut() {
            if let Some(ts) = pid_feed.ts.take() {
                if output == PesOutput::TsTap {
                    self.shared.ctx.dvr.unregister(&ts);
                }
                if let Err(e) = ts.stop_filtering() {
                    warn!("filter {}: stopping pid {:#x} failed: {}", self.id(), pid_feed.pid, e);
                }
                stopped.push(ts);
            }
        }

        let mut cancelled = false;
        for insertion in config.insertions.iter_mut() {
            cancelled |= insertion.cancel();
        }
        if cancelled {
            if let Some(first) = stopped.first() {
                if let Err(e) = first.ts_insertion_terminate() {
                    warn!("filter {}: ending insertions failed: {}", self.id(), e);
                }
            }
        }

        for ts in stopped {
            if let Err(e) = self.dev.engine.release_ts_feed(ts) {
                warn!("filter {}: releasing ts feed failed: {}", self.id(), e);
            }
        }
    }

    pub(crate) fn stop_locked(&self, config: &mut FilterConfig) -> Result<()> {
        if self.state() < FilterState::Go {
            return Ok(());
        }

        match config.kind.clone() {
            FilterKind::Section(_) => {
                {
                    let mut data = self.shared.data.lock();
                    data.state = FilterState::Set;
                    data.cancel_deadline();
                }
                if let Some(binding) = config.section.take() {
                    let mut table = self.dev.table.lock();
                    self.release_section(&mut table, binding);
                }
            }
            FilterKind::Pes(params) => {
                self.shared.data.lock().state = FilterState::Set;
                self.stop_pes(config, params.output);
            }
            FilterKind::Unset => {
                self.shared.data.lock().state = FilterState::Set;
            }
        }

        self.shared.data.lock().output.reset();
        debug!("filter {} stopped", self.id());
        self.shared.wake();
        self.shared.ctx.dvr.notify.notify_waiters();
        Ok(())
    }

    /// Stops the filter and returns the slot to the free pool.
    fn free(&self) {
        let mut config = self.shared.config.lock();
        if let Err(e) = self.stop_locked(&mut config) {
            warn!("filter {}: stop on close failed: {}", self.id(), e);
        }
        self.reset_locked(&mut config);
        config.insertions.clear();

        let mut data = self.shared.data.lock();
        data.cancel_deadline();
        data.output.install(None, self.shared.ctx.config.filter_buffer_size);
        data.state = FilterState::Free;
        drop(data);
        debug!("filter {} freed", self.id());
        self.shared.wake();
    }
}

impl Drop for Filter {
    fn drop(&mut self) {
        self.free();
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}
