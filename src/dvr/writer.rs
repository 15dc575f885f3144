use super::command::CommandRing;
use super::worker;
use crate::buffer::{BufferStatus, RingBuffer};
use crate::device::params::{OobCommand, Readiness};
use crate::device::DeviceShared;
use crate::error::{DmxError, Result};
use crate::utils::wait_until;
use log::{info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// The single producer of raw transport stream.
///
/// Bytes written here are handed to the engine by a background worker.
/// Prefer [`close`](Self::close), which waits for the worker to stop;
/// dropping the writer aborts it instead.
pub struct DvrWriter {
    dev: Arc<DeviceShared>,
    worker: Option<JoinHandle<()>>,
}

impl DvrWriter {
    pub(crate) fn open(dev: Arc<DeviceShared>) -> Result<Self> {
        let ctx = &dev.ctx;
        let input = &dev.dvr_in;
        if ctx.exiting() {
            return Err(DmxError::Teardown);
        }
        if input.writer_open.swap(true, Ordering::AcqRel) {
            return Err(DmxError::busy("dvr writer already open"));
        }
        if let Err(e) = dev.engine.attach_memory_input() {
            input.writer_open.store(false, Ordering::Release);
            return Err(e);
        }

        ctx.input_exit.store(false, Ordering::Release);
        {
            let mut state = input.state.lock();
            state.ring = RingBuffer::new(ctx.config.dvr_buffer_size);
            state.commands = CommandRing::new(ctx.config.dvr_command_slots);
            state.processing = false;
        }
        let worker = ctx.runtime.spawn(worker::run(dev.clone()));

        info!("dvr writer opened");
        Ok(Self {
            dev,
            worker: Some(worker),
        })
    }

    fn stopping(&self) -> bool {
        self.dev.ctx.exiting() || self.dev.ctx.input_exit.load(Ordering::Acquire)
    }

    /// Buffers `data` for the engine, waiting for room unless `nonblocking`.
    ///
    /// Returns the bytes accepted, which is less than `data.len()` only for
    /// a nonblocking write that filled the ring.
    ///
    /// # Errors
    ///
    /// [`DmxError::WouldBlock`] when nothing fits, in the ring or as a feed
    /// command, and `nonblocking` is set,
    /// the latched input error, or [`DmxError::Teardown`] once the device
    /// or the writer shuts down.
    pub async fn write(&self, data: &[u8], nonblocking: bool) -> Result<usize> {
        let input = &self.dev.dvr_in;
        if self.stopping() {
            return Err(DmxError::Teardown);
        }
        {
            let state = input.state.lock();
            if !state.ring.has_storage() {
                return Err(DmxError::invalid("dvr input has no buffer"));
            }
            let full = state.ring.free() == 0 || !state.commands.can_push_feed();
            if nonblocking && full && !data.is_empty() {
                return Err(DmxError::WouldBlock);
            }
        }

        let mut written = 0;
        while written < data.len() {
            let rest = &data[written..];
            let step = wait_until(&input.notify, || {
                if self.stopping() {
                    return Some(Err(DmxError::Teardown));
                }
                let mut state = input.state.lock();
                if !state.ring.has_storage() {
                    return Some(Ok(0));
                }
                if let Some(err) = state.ring.take_error() {
                    state.ring.flush();
                    return Some(Err(err.into()));
                }
                let free = state.ring.free();
                if free == 0 || !state.commands.can_push_feed() {
                    return nonblocking.then_some(Ok(0));
                }
                let n = free.min(rest.len());
                if let Err(e) = state.ring.write(&rest[..n]) {
                    return Some(Err(e));
                }
                Some(state.commands.push_feed(n).map(|()| n))
            })
            .await?;

            if step == 0 {
                break;
            }
            written += step;
            input.notify.notify_waiters();
        }
        Ok(written)
    }

    /// Queues an out-of-band command behind the data written so far.
    ///
    /// # Errors
    ///
    /// [`DmxError::PermissionDenied`] unless the device reads from DVR
    /// input, [`DmxError::CommandOverflow`] when the command ring is full.
    pub fn push_oob(&self, command: OobCommand) -> Result<()> {
        if !self.dev.table.lock().source.is_dvr() {
            return Err(DmxError::denied("out-of-band commands need dvr input"));
        }
        self.dev.dvr_in.state.lock().commands.push_oob(command)?;
        self.dev.dvr_in.notify.notify_waiters();
        Ok(())
    }

    /// Fill level of the input ring; clears the latched error.
    pub fn buffer_status(&self) -> BufferStatus {
        let mut state = self.dev.dvr_in.state.lock();
        let ring = &mut state.ring;
        BufferStatus {
            error: ring.take_error(),
            fullness: ring.available(),
            free_bytes: ring.free(),
            read_offset: ring.read_offset(),
            write_offset: ring.write_offset(),
            size: ring.capacity(),
        }
    }

    /// Replaces the input ring with one of `size` bytes.
    ///
    /// # Errors
    ///
    /// [`DmxError::Busy`] while the worker is handing bytes to the engine.
    pub fn set_buffer_size(&self, size: usize) -> Result<()> {
        let mut state = self.dev.dvr_in.state.lock();
        if state.ring.capacity() == size {
            return Ok(());
        }
        if size == 0 {
            return Err(DmxError::invalid("dvr input buffer size"));
        }
        if state.processing {
            return Err(DmxError::busy("dvr input is being processed"));
        }
        state.ring.replace_storage(Some(vec![0; size]), size);
        Ok(())
    }

    pub fn poll(&self) -> Readiness {
        let state = self.dev.dvr_in.state.lock();
        let error = state.ring.error().is_some();
        Readiness {
            readable: false,
            writable: state.ring.has_storage()
                && state.ring.free() > 0
                && state.commands.can_push_feed(),
            error,
            priority: false,
        }
    }

    /// Stops the worker, waits for it and releases the input.
    pub async fn close(mut self) -> Result<()> {
        self.signal_exit();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!("dvr input worker ended abnormally: {}", e);
            }
        }
        self.release()
    }

    fn signal_exit(&self) {
        self.dev.ctx.input_exit.store(true, Ordering::Release);
        self.dev.engine.write_cancel();
        self.dev.wake_all();
    }

    fn release(&self) -> Result<()> {
        let input = &self.dev.dvr_in;
        {
            let mut state = input.state.lock();
            state.ring.detach();
            state.commands.clear();
            state.processing = false;
        }
        input.notify.notify_waiters();
        input.writer_open.store(false, Ordering::Release);
        info!("dvr writer closed");
        self.dev.engine.detach_memory_input()
    }
}

impl Drop for DvrWriter {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.signal_exit();
            worker.abort();
            if let Err(e) = self.release() {
                warn!("releasing dvr input failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for DvrWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.dev.dvr_in.state.lock();
        f.debug_struct("DvrWriter")
            .field("size", &state.ring.capacity())
            .field("buffered", &state.ring.available())
            .field("commands", &state.commands.len())
            .finish()
    }
}
