use crate::buffer::{BufferStatus, Event, EventKind, EventMask, LatchedError};
use crate::device::params::{BufferMode, Readiness};
use crate::device::DeviceShared;
use crate::error::{DmxError, Result};
use crate::utils::wait_until;
use log::{debug, info};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// The single consumer of the DVR output.
///
/// Dropping the reader releases its buffer and lets another one open.
pub struct DvrReader {
    dev: Arc<DeviceShared>,
    gate: tokio::sync::Mutex<()>,
}

impl DvrReader {
    pub(crate) fn open(dev: Arc<DeviceShared>) -> Result<Self> {
        let ctx = &dev.ctx;
        if ctx.exiting() {
            return Err(DmxError::Teardown);
        }
        if ctx.dvr.reader_open.swap(true, Ordering::AcqRel) {
            return Err(DmxError::busy("dvr reader already open"));
        }

        *ctx.dvr.buffer_mode.lock() = BufferMode::Internal;
        let size = ctx.config.dvr_buffer_size;
        let mut output = ctx.dvr.output.lock();
        output.install(Some(vec![0; size]), size);
        output.events.set_mask(EventMask::default());
        drop(output);

        info!("dvr reader opened with {} byte buffer", size);
        Ok(Self {
            dev,
            gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Reads recorded TS data, waiting for some unless `nonblocking`.
    ///
    /// # Errors
    ///
    /// The latched overflow (reported once), [`DmxError::WouldBlock`],
    /// [`DmxError::InvalidArgument`] when the buffer size does not suit the
    /// engine, and [`DmxError::Teardown`] once the device shuts down.
    pub async fn read(&self, buf: &mut [u8], nonblocking: bool) -> Result<usize> {
        let ctx = &self.dev.ctx;
        if ctx.exiting() {
            return Err(DmxError::Teardown);
        }
        if !self.size_fits() {
            return Err(DmxError::invalid("dvr buffer size not supported"));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let _gate = self.gate.lock().await;
        let n = wait_until(&ctx.dvr.notify, || {
            let mut output = ctx.dvr.output.lock();
            if !output.ring.has_storage() {
                return Some(Ok(0));
            }
            if let Some(err) = output.ring.take_error() {
                return Some(Err(err.into()));
            }
            if !output.ring.is_empty() {
                return Some(Ok(output.read(buf)));
            }
            if ctx.exiting() {
                return Some(Err(DmxError::Teardown));
            }
            if nonblocking {
                return Some(Err(DmxError::WouldBlock));
            }
            None
        })
        .await?;

        if n > 0 {
            self.notify_data_read(n);
            ctx.dvr.notify.notify_waiters();
        }
        Ok(n)
    }

    fn size_fits(&self) -> bool {
        let Some(caps) = self.dev.caps() else {
            return true;
        };
        let capacity = self.dev.ctx.dvr.output.lock().ring.capacity();
        caps.recording(self.dev.engine.tsp_size()).accepts(capacity)
    }

    fn notify_data_read(&self, n: usize) {
        if let Some(feed) = self.dev.ctx.dvr.first_feed() {
            if let Err(e) = feed.notify_data_read(n) {
                debug!("dvr data read notification failed: {}", e);
            }
        }
    }

    /// Takes the next event; a latched overflow comes first.
    ///
    /// Lost events are reported once as [`DmxError::EventOverflow`].
    pub fn next_event(&self) -> Result<Event> {
        let dvr = &self.dev.ctx.dvr;
        let mut output = dvr.output.lock();
        let event = match output.ring.error() {
            Some(LatchedError::Overflow) => {
                output.ring.take_error();
                Event::BufferOverflow
            }
            Some(LatchedError::EventOverflow) => {
                output.ring.take_error();
                drop(output);
                dvr.notify.notify_waiters();
                return Err(DmxError::EventOverflow);
            }
            _ => output.events.pop_next().ok_or(DmxError::NoData)?,
        };
        drop(output);

        if self.dev.ctx.pull_mode() {
            dvr.notify.notify_waiters();
        }
        Ok(event)
    }

    pub fn set_event_mask(&self, mut mask: EventMask) -> Result<()> {
        let mut output = self.dev.ctx.dvr.output.lock();
        if mask.wakeup_threshold >= output.events.capacity() {
            return Err(DmxError::invalid("wakeup threshold exceeds queue"));
        }
        mask.disable = mask.disable.without(EventKind::BufferOverflow);
        mask.no_wakeup = mask.no_wakeup.without(EventKind::BufferOverflow);
        output.events.set_mask(mask);
        Ok(())
    }

    pub fn event_mask(&self) -> EventMask {
        self.dev.ctx.dvr.output.lock().events.mask()
    }

    /// Fill level of the DVR buffer; clears the latched error.
    pub fn buffer_status(&self) -> BufferStatus {
        self.dev.ctx.dvr.output.lock().status()
    }

    /// Releases `n` bytes without reading them.
    pub fn release_data(&self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        self.dev.ctx.dvr.output.lock().consume(n)?;
        self.notify_data_read(n);
        self.dev.ctx.dvr.notify.notify_waiters();
        Ok(())
    }

    /// Drops everything buffered, in this crate and in the engine.
    pub fn flush_buffer(&self) -> Result<()> {
        let dvr = &self.dev.ctx.dvr;
        let flushed = dvr.output.lock().flush();
        dvr.notify.notify_waiters();
        debug!("dvr output flushed {} bytes", flushed);
        match dvr.first_feed() {
            Some(feed) => feed.flush_buffer(flushed),
            None => Ok(()),
        }
    }

    /// Replaces the internal buffer with one of `size` bytes.
    pub fn set_buffer_size(&self, size: usize) -> Result<()> {
        let dvr = &self.dev.ctx.dvr;
        let mode = *dvr.buffer_mode.lock();
        let mut output = dvr.output.lock();
        if output.ring.capacity() == size {
            return Ok(());
        }
        if size == 0 || mode == BufferMode::External {
            return Err(DmxError::invalid("dvr buffer size"));
        }
        output.install(Some(vec![0; size]), size);
        debug!("dvr output resized to {}", size);
        Ok(())
    }

    /// Switches between crate-allocated and caller-provided storage.
    pub fn set_buffer_mode(&self, mode: BufferMode) -> Result<()> {
        let dvr = &self.dev.ctx.dvr;
        if mode == BufferMode::External {
            let tsp_size = self.dev.engine.tsp_size();
            let allowed = self
                .dev
                .caps()
                .map_or(false, |caps| caps.recording(tsp_size).external);
            if !allowed {
                return Err(DmxError::invalid("external dvr buffers not supported"));
            }
        }
        let mut current = dvr.buffer_mode.lock();
        if *current == mode {
            return Ok(());
        }
        *current = mode;

        let mut output = dvr.output.lock();
        if mode == BufferMode::Internal {
            let size = self.dev.ctx.config.dvr_buffer_size;
            output.install(Some(vec![0; size]), size);
        } else {
            output.detach();
        }
        Ok(())
    }

    /// Installs caller-provided storage; requires external mode.
    pub fn set_buffer(&self, storage: Vec<u8>) -> Result<()> {
        let dvr = &self.dev.ctx.dvr;
        let mode = *dvr.buffer_mode.lock();
        if storage.is_empty() || mode == BufferMode::Internal {
            return Err(DmxError::invalid("external dvr buffer"));
        }
        let size = storage.len();
        dvr.output.lock().install(Some(storage), size);
        Ok(())
    }

    pub fn poll(&self) -> Readiness {
        let output = self.dev.ctx.dvr.output.lock();
        let error = output.ring.error();
        Readiness {
            readable: error.is_some() || !output.ring.is_empty(),
            writable: false,
            error: error.is_some(),
            priority: matches!(
                error,
                Some(LatchedError::Overflow | LatchedError::EventOverflow)
            ) || output.events.threshold_reached(),
        }
    }
}

impl Drop for DvrReader {
    fn drop(&mut self) {
        let dvr = &self.dev.ctx.dvr;
        dvr.output.lock().detach();
        dvr.notify.notify_waiters();
        dvr.reader_open.store(false, Ordering::Release);
        info!("dvr reader closed");
    }
}

impl std::fmt::Debug for DvrReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let output = self.dev.ctx.dvr.output.lock();
        f.debug_struct("DvrReader")
            .field("size", &output.ring.capacity())
            .field("available", &output.ring.available())
            .finish()
    }
}
