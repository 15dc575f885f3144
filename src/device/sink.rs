use super::filter::{FilterShared, FilterState};
use super::params::PesOutput;
use crate::buffer::{DataRange, Event, EventKind, LatchedError, Output, PesInfo, RangeFlags};
use crate::engine::{DataReady, DataStatus, FeedSink, PesEnd};
use crate::error::{DmxError, Result};
use crate::utils::{wait_until, wrap_add};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;

enum SinkRole {
    Section { oneshot: bool },
    Pes { output: PesOutput, rec_chunk: usize },
}

/// Routes one feed's callbacks into its filter's output, or into the DVR
/// output for TS-tap filters.
pub(crate) struct FilterSink {
    filter: Arc<FilterShared>,
    role: SinkRole,
}

impl FilterSink {
    pub fn section(filter: Arc<FilterShared>, oneshot: bool) -> Self {
        Self {
            filter,
            role: SinkRole::Section { oneshot },
        }
    }

    pub fn pes(filter: Arc<FilterShared>, output: PesOutput, rec_chunk: usize) -> Self {
        Self {
            filter,
            role: SinkRole::Pes { output, rec_chunk },
        }
    }

    fn to_dvr(&self) -> bool {
        matches!(
            self.role,
            SinkRole::Pes {
                output: PesOutput::TsTap,
                ..
            }
        )
    }

    fn wake(&self) {
        if self.to_dvr() {
            self.filter.ctx.dvr.notify.notify_waiters();
        } else {
            self.filter.wake();
        }
    }

    fn deliver_section(&self, oneshot: bool, first: &[u8], second: &[u8]) -> Result<()> {
        let mut data = self.filter.data.lock();
        if data.output.ring.error().is_some() {
            drop(data);
            self.filter.wake();
            return Ok(());
        }
        if data.state != FilterState::Go || data.eos {
            return Ok(());
        }
        let events = &data.output.events;
        if !events.mask().disable.contains(EventKind::NewSection) && events.is_full() {
            warn!("filter {}: event queue full, section dropped", self.filter.id);
            data.output.ring.latch(LatchedError::EventOverflow);
            drop(data);
            self.filter.wake();
            return Ok(());
        }

        let len = first.len() + second.len();
        if len == 0 {
            data.output.post(Event::SectionCrcError);
            drop(data);
            self.filter.wake();
            return Ok(());
        }

        data.cancel_deadline();
        if data.output.ring.free() < len {
            debug!("filter {}: section of {} bytes overflows", self.filter.id, len);
            data.output.overflow(self.filter.ctx.auto_flush);
        } else {
            let start = data.output.ring.write_offset();
            data.output.ring.write(first)?;
            data.output.ring.write(second)?;
            data.output
                .post(Event::NewSection(DataRange::contiguous(start, len)));
            if oneshot {
                data.state = FilterState::Done;
            }
        }
        drop(data);
        self.filter.wake();
        Ok(())
    }

    fn section_ready(&self, oneshot: bool, ready: DataReady) -> Result<()> {
        let mut data = self.filter.data.lock();
        if data.output.ring.error() == Some(LatchedError::Timeout)
            || data.state != FilterState::Go
            || data.eos
        {
            return Ok(());
        }

        if ready.data.is_empty() {
            match ready.status {
                DataStatus::CrcError => {
                    data.output.post(Event::SectionCrcError);
                }
                DataStatus::Eos => {
                    data.eos = true;
                    data.output.post(Event::Eos);
                }
                DataStatus::Marker(id) => {
                    data.output.post(Event::Marker { id });
                }
                DataStatus::ScramblingStatus(bits) => {
                    data.output.post(Event::ScramblingStatusChange(bits));
                }
                DataStatus::Overrun => {
                    data.output.overflow(self.filter.ctx.auto_flush);
                }
                _ => return Ok(()),
            }
            drop(data);
            self.filter.wake();
            return Ok(());
        }

        let len = ready.data.len();
        data.cancel_deadline();
        if data.output.ring.free() < len {
            debug!("filter {}: section of {} bytes overflows", self.filter.id, len);
            data.output.overflow(self.filter.ctx.auto_flush);
        } else {
            let mut range = DataRange::contiguous(data.output.ring.write_offset(), len);
            range.flags.cc_error = ready.status == DataStatus::MissedError;
            data.output.ring.write(&ready.data)?;
            data.output.post(Event::NewSection(range));
            if oneshot {
                data.state = FilterState::Done;
            }
        }
        drop(data);
        self.filter.wake();
        Ok(())
    }

    fn deliver_ts(
        &self,
        output: PesOutput,
        rec_chunk: usize,
        first: &[u8],
        second: &[u8],
    ) -> Result<()> {
        if output == PesOutput::Decoder {
            return Ok(());
        }
        let mut data = self.filter.data.lock();
        if data.state != FilterState::Go || data.eos {
            return Ok(());
        }
        let auto_flush = self.filter.ctx.auto_flush;
        let result = if output == PesOutput::TsTap {
            let mut dvr = self.filter.ctx.dvr.output.lock();
            copy_into(&mut dvr, output, rec_chunk, auto_flush, first, second)
        } else {
            copy_into(&mut data.output, output, rec_chunk, auto_flush, first, second)
        };
        drop(data);
        self.wake();
        result
    }

    fn pes_ready(&self, output: PesOutput, rec_chunk: usize, ready: DataReady) -> Result<()> {
        let mut data = self.filter.data.lock();
        if data.state != FilterState::Go || data.eos {
            return Ok(());
        }
        let auto_flush = self.filter.ctx.auto_flush;
        let result = if output == PesOutput::TsTap {
            let mut dvr = self.filter.ctx.dvr.output.lock();
            let result = structured_into(&mut dvr, output, rec_chunk, auto_flush, &ready);
            if ready.status == DataStatus::Eos {
                data.eos = true;
            }
            result
        } else {
            let result = structured_into(&mut data.output, output, rec_chunk, auto_flush, &ready);
            if ready.status == DataStatus::Eos {
                data.eos = true;
            }
            result
        };
        drop(data);
        self.wake();
        result
    }

    fn target_space(&self, required: usize, wait: bool) -> Option<Result<()>> {
        let ctx = &self.filter.ctx;
        if ctx.exiting() || ctx.input_exit.load(Ordering::Acquire) {
            return Some(Err(DmxError::Teardown));
        }
        let data = self.filter.data.lock();
        let check = |out: &Output| -> Option<Result<()>> {
            if !out.ring.has_storage() || data.state != FilterState::Go {
                return Some(Err(DmxError::invalid("output is not running")));
            }
            if let Some(err) = out.ring.error() {
                return Some(Err(err.into()));
            }
            if out.ring.free() >= required && !out.events.is_full() {
                return Some(Ok(()));
            }
            if !wait {
                return Some(Err(DmxError::NoSpace));
            }
            None
        };
        if self.to_dvr() {
            let dvr = ctx.dvr.output.lock();
            check(&dvr)
        } else {
            check(&data.output)
        }
    }
}

/// Copies raw TS data and emits recording chunks once enough accumulated.
fn copy_into(
    out: &mut Output,
    output: PesOutput,
    rec_chunk: usize,
    auto_flush: bool,
    first: &[u8],
    second: &[u8],
) -> Result<()> {
    if !out.ring.has_storage() {
        return Ok(());
    }
    if let Some(err) = out.ring.error() {
        return Err(err.into());
    }
    let len = first.len() + second.len();
    if out.unit.size == 0 {
        out.unit.start = out.ring.write_offset();
    }
    if out.ring.free() < len {
        if out.overflow(auto_flush) {
            return Ok(());
        }
        return Err(DmxError::BufferOverflow);
    }

    out.ring.write(first)?;
    out.ring.write(second)?;
    out.unit.size += len;
    if output.is_ts() && out.unit.size >= rec_chunk {
        let range = DataRange::contiguous(out.unit.start, out.unit.size);
        out.post(Event::NewRecordingChunk(range));
        out.unit.size = 0;
    }
    Ok(())
}

/// Applies a structured notification to a packetized-stream output.
fn structured_into(
    out: &mut Output,
    output: PesOutput,
    rec_chunk: usize,
    auto_flush: bool,
    ready: &DataReady,
) -> Result<()> {
    let capacity = out.ring.capacity();
    match &ready.status {
        DataStatus::Overrun => {
            if out.ring.error().is_none() && !out.overflow(auto_flush) {
                return Err(DmxError::BufferOverflow);
            }
            return Ok(());
        }
        DataStatus::Eos => {
            if output.is_ts() && out.unit.size > 0 {
                let range = DataRange::contiguous(out.unit.start, out.unit.size);
                out.post(Event::NewRecordingChunk(range));
                out.unit.start = wrap_add(out.unit.start, out.unit.size, capacity);
                out.unit.size = 0;
            }
            out.post(Event::Eos);
            return Ok(());
        }
        DataStatus::Marker(id) => {
            out.post(Event::Marker { id: *id });
        }
        DataStatus::Pcr {
            pcr,
            stc,
            discontinuity,
        } => {
            out.post(Event::NewPcr {
                pcr: *pcr,
                stc: *stc,
                discontinuity: *discontinuity,
            });
        }
        DataStatus::Index(entry) => {
            out.post(Event::NewIndexEntry(*entry));
        }
        DataStatus::ScramblingStatus(bits) => {
            out.post(Event::ScramblingStatusChange(*bits));
        }
        DataStatus::DecoderBuffer(es) => {
            out.post(Event::NewEsData(*es));
        }
        _ => {}
    }

    if output == PesOutput::Decoder || !out.ring.has_storage() {
        return Ok(());
    }
    if let Some(err) = out.ring.error() {
        return Err(err.into());
    }

    let len = ready.data.len();
    if len > 0 {
        if out.ring.free() < len {
            if out.overflow(auto_flush) {
                return Ok(());
            }
            return Err(DmxError::BufferOverflow);
        }
        if out.unit.size == 0 {
            out.unit.start = out.ring.write_offset();
        }
        out.ring.write(&ready.data)?;
        out.unit.size += len;
    }

    if output == PesOutput::Tap {
        if let DataStatus::PesEnd(end) = &ready.status {
            close_pes(out, end);
        }
    } else if output.is_ts() {
        while out.unit.size >= rec_chunk {
            let range = DataRange::contiguous(out.unit.start, rec_chunk);
            out.unit.start = wrap_add(out.unit.start, rec_chunk, capacity);
            out.unit.size -= rec_chunk;
            out.post(Event::NewRecordingChunk(range));
        }
    }
    Ok(())
}

/// Posts the event for a completed PES unit; empty units are not reported.
fn close_pes(out: &mut Output, end: &PesEnd) {
    if out.unit.size == 0 {
        return;
    }
    let capacity = out.ring.capacity();
    let range = DataRange {
        base_offset: out.unit.start,
        start_offset: wrap_add(out.unit.start, end.start_gap, capacity),
        actual_length: end.actual_length,
        total_length: out.unit.size,
        flags: RangeFlags {
            cc_error: false,
            discontinuity: end.discontinuity,
            length_error: end.length_mismatch,
        },
    };
    let info = PesInfo {
        stc: end.stc,
        tei_counter: end.tei_counter,
        cont_err_counter: end.cont_err_counter,
        ts_packets_num: end.ts_packets_num,
    };
    out.post(Event::NewPes { range, info });
    out.unit.size = 0;
}

#[async_trait]
impl FeedSink for FilterSink {
    fn deliver(&self, first: &[u8], second: &[u8]) -> Result<()> {
        match self.role {
            SinkRole::Section { oneshot } => self.deliver_section(oneshot, first, second),
            SinkRole::Pes { output, rec_chunk } => self.deliver_ts(output, rec_chunk, first, second),
        }
    }

    fn data_ready(&self, ready: DataReady) -> Result<()> {
        match self.role {
            SinkRole::Section { oneshot } => self.section_ready(oneshot, ready),
            SinkRole::Pes { output, rec_chunk } => self.pes_ready(output, rec_chunk, ready),
        }
    }

    async fn wait_for_space(&self, required: usize, wait: bool) -> Result<()> {
        let notify = if self.to_dvr() {
            &self.filter.ctx.dvr.notify
        } else {
            &self.filter.notify
        };
        wait_until(notify, || self.target_space(required, wait)).await
    }
}
