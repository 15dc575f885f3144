use super::filter::{Filter, FilterKind, FilterState};
use super::params::{PesOutput, Readiness};
use crate::buffer::{BufferStatus, Event, LatchedError};
use crate::error::{DmxError, Result};
use crate::utils::wait_until;
use log::debug;

/// Bytes of the section header that carry the section length.
const SECTION_HEADER_LEN: usize = 3;

impl Filter {
    /// Reads buffered data, waiting for some unless `nonblocking`.
    ///
    /// Section filters never return bytes of two sections in one call. Returns
    /// `Ok(0)` once an end-of-stream or one-shot filter has drained.
    ///
    /// # Errors
    ///
    /// The latched overflow, event overflow or timeout (reported once),
    /// [`DmxError::WouldBlock`] when nothing is buffered and `nonblocking` is
    /// set, [`DmxError::NotRunning`] when the filter stops while waiting and
    /// [`DmxError::Teardown`] once the device shuts down.
    pub async fn read(&self, buf: &mut [u8], nonblocking: bool) -> Result<usize> {
        let _reader = self.shared.reader.lock().await;
        {
            let data = self.shared.data.lock();
            if data.eos && data.output.ring.is_empty() {
                return Ok(0);
            }
        }

        let is_section = matches!(self.shared.config.lock().kind, FilterKind::Section(_));
        let n = if is_section {
            self.read_section(buf, nonblocking).await?
        } else {
            self.read_buffer(buf, nonblocking).await?
        };

        if n > 0 {
            self.notify_data_read(n);
            if self.shared.ctx.pull_mode() {
                self.shared.wake();
            }
        }
        Ok(n)
    }

    async fn read_buffer(&self, dest: &mut [u8], nonblocking: bool) -> Result<usize> {
        if dest.is_empty() {
            return Ok(0);
        }
        let shared = &self.shared;
        let n = wait_until(&shared.notify, || {
            let mut data = shared.data.lock();
            if !data.output.ring.has_storage() {
                return Some(Ok(0));
            }
            if let Some(err) = data.output.ring.take_error() {
                return Some(Err(err.into()));
            }
            if !data.output.ring.is_empty() {
                return Some(Ok(data.output.read(dest)));
            }
            if shared.ctx.exiting() {
                return Some(Err(DmxError::Teardown));
            }
            match data.state {
                FilterState::Go if data.eos => Some(Ok(0)),
                FilterState::Go if nonblocking => Some(Err(DmxError::WouldBlock)),
                FilterState::Go => None,
                FilterState::Done => Some(Ok(0)),
                _ => Some(Err(DmxError::NotRunning)),
            }
        })
        .await?;

        if n > 0 {
            shared.wake();
        }
        Ok(n)
    }

    /// Reads the 3-byte header first, then at most the rest of that section.
    async fn read_section(&self, buf: &mut [u8], nonblocking: bool) -> Result<usize> {
        let mut framing = self.shared.data.lock().framing;
        let mut done = 0;

        if framing.remaining == 0 {
            let want = (SECTION_HEADER_LEN - framing.header_len).min(buf.len());
            if want == 0 {
                return Ok(0);
            }
            let n = match self.read_buffer(&mut buf[..want], nonblocking).await {
                Ok(n) => n,
                Err(e) => {
                    self.shared.data.lock().framing.header_len = 0;
                    return Err(e);
                }
            };
            let start = framing.header_len;
            framing.header[start..start + n].copy_from_slice(&buf[..n]);
            framing.header_len += n;
            done = n;

            if framing.header_len < SECTION_HEADER_LEN {
                self.shared.data.lock().framing = framing;
                return Ok(done);
            }
            framing.remaining =
                (((framing.header[1] as usize) << 8) | framing.header[2] as usize) & 0x0fff;
            framing.header_len = 0;
            self.shared.data.lock().framing = framing;
            if done == buf.len() || framing.remaining == 0 {
                return Ok(done);
            }
        }

        let count = (buf.len() - done).min(framing.remaining);
        match self
            .read_buffer(&mut buf[done..done + count], nonblocking)
            .await
        {
            Ok(n) => {
                self.shared.data.lock().framing.remaining -= n;
                Ok(done + n)
            }
            Err(e) if done > 0 => {
                // the header went out, so the error waits for the next call
                if let Some(latched) = LatchedError::from_error(&e) {
                    self.shared.data.lock().output.ring.latch(latched);
                }
                Ok(done)
            }
            Err(e) => Err(e),
        }
    }

    /// Forwards consumed bytes to the engine feed.
    fn notify_data_read(&self, n: usize) {
        let config = self.shared.config.lock();
        let result = match &config.kind {
            FilterKind::Section(_) => config
                .section
                .as_ref()
                .map(|binding| binding.feed.notify_data_read(binding.filter, n)),
            FilterKind::Pes(_) => config.first_ts().map(|ts| ts.notify_data_read(n)),
            FilterKind::Unset => None,
        };
        if let Some(Err(e)) = result {
            debug!("filter {}: data read notification failed: {}", self.id(), e);
        }
    }

    /// Takes the next event.
    ///
    /// A latched overflow is reported first, as [`Event::BufferOverflow`];
    /// reporting an overflow or a section timeout clears the latched error.
    ///
    /// # Errors
    ///
    /// [`DmxError::EventOverflow`] once after events were lost to a full
    /// queue, [`DmxError::NoData`] when nothing is pending.
    pub fn next_event(&self) -> Result<Event> {
        let mut data = self.shared.data.lock();
        let event = match data.output.ring.error() {
            Some(LatchedError::Overflow) => Event::BufferOverflow,
            Some(LatchedError::EventOverflow) => {
                data.output.ring.take_error();
                drop(data);
                self.shared.wake();
                return Err(DmxError::EventOverflow);
            }
            _ => data.output.events.pop_next().ok_or(DmxError::NoData)?,
        };
        if matches!(event, Event::BufferOverflow | Event::SectionTimeout) {
            data.output.ring.take_error();
        }
        drop(data);

        if self.shared.ctx.pull_mode() {
            self.shared.wake();
        }
        Ok(event)
    }

    /// Fill level of the filter buffer; clears the latched error.
    ///
    /// Decoder-output filters report the engine's decoder buffer instead.
    pub fn buffer_status(&self) -> Result<BufferStatus> {
        {
            let config = self.shared.config.lock();
            if config.kind.pes_output() == Some(PesOutput::Decoder) {
                return match config.first_ts() {
                    Some(ts) => ts.decoder_buffer_status(),
                    None => Err(DmxError::NoDevice("no decoder feed".to_string())),
                };
            }
        }
        let mut data = self.shared.data.lock();
        if !data.output.ring.has_storage() {
            return Err(DmxError::invalid("filter has no buffer"));
        }
        Ok(data.output.status())
    }

    /// Releases `n` bytes without reading them.
    pub fn release_data(&self, n: usize) -> Result<()> {
        {
            let mut data = self.shared.data.lock();
            if !data.output.ring.has_storage() {
                return Err(DmxError::invalid("filter has no buffer"));
            }
            if n == 0 {
                return Ok(());
            }
            data.output.consume(n)?;
        }
        self.notify_data_read(n);
        self.shared.wake();
        Ok(())
    }

    /// Snapshot of what a reader would find.
    pub fn poll(&self) -> Readiness {
        let data = self.shared.data.lock();
        if !matches!(
            data.state,
            FilterState::Go | FilterState::Done | FilterState::TimedOut
        ) {
            return Readiness::default();
        }
        let error = data.output.ring.error();
        Readiness {
            readable: error.is_some() || !data.output.ring.is_empty(),
            writable: false,
            error: error.is_some(),
            priority: matches!(
                error,
                Some(LatchedError::Overflow | LatchedError::EventOverflow)
            ) || data.output.events.threshold_reached(),
        }
    }
}
