//! # DVR Paths
//!
//! The DVR output collects the TS packets of every TS-tap filter into one
//! shared ring; a single [`DvrReader`] consumes it. The DVR input takes raw
//! transport stream from a single [`DvrWriter`]: written bytes land in an
//! input ring and a command is queued, and a background worker hands the
//! bytes to the engine in packet-sized chunks.
//!
//! ```rust
//! # use dmxcore::{Demux, Result};
//! # use dmxcore::device::params::OobCommand;
//! # async fn run(demux: Demux, ts: &[u8]) -> Result<()> {
//! let writer = demux.open_dvr_writer()?;
//! writer.write(ts, false).await?;
//! writer.push_oob(OobCommand::Eos)?;
//! writer.close().await?;
//! # Ok(())
//! # }
//! ```

mod command;
mod reader;
mod worker;
mod writer;

pub use reader::DvrReader;
pub use writer::DvrWriter;

use crate::buffer::{Output, RingBuffer};
use crate::config::DeviceConfig;
use crate::device::params::BufferMode;
use crate::engine::TsFeed;
use command::CommandRing;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::Notify;

/// The shared output of TS-tap filters.
pub(crate) struct DvrOutput {
    pub output: Mutex<Output>,
    pub notify: Notify,
    /// Running TS-tap feeds; the first one receives reader notifications
    pub feeds: Mutex<Vec<Arc<dyn TsFeed>>>,
    pub buffer_mode: Mutex<BufferMode>,
    pub reader_open: AtomicBool,
}

fn same_feed(a: &Arc<dyn TsFeed>, b: &Arc<dyn TsFeed>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl DvrOutput {
    pub fn new(output: Output) -> Self {
        Self {
            output: Mutex::new(output),
            notify: Notify::new(),
            feeds: Mutex::new(Vec::new()),
            buffer_mode: Mutex::new(BufferMode::Internal),
            reader_open: AtomicBool::new(false),
        }
    }

    pub fn register(&self, feed: Arc<dyn TsFeed>) {
        self.feeds.lock().push(feed);
    }

    pub fn unregister(&self, feed: &Arc<dyn TsFeed>) {
        self.feeds.lock().retain(|f| !same_feed(f, feed));
    }

    pub fn first_feed(&self) -> Option<Arc<dyn TsFeed>> {
        self.feeds.lock().first().cloned()
    }
}

/// Input ring, command ring and worker bookkeeping.
pub(crate) struct InputState {
    pub ring: RingBuffer,
    pub commands: CommandRing,
    /// The worker is between taking bytes and accounting for them
    pub processing: bool,
}

/// The raw-input path.
pub(crate) struct DvrInput {
    pub state: Mutex<InputState>,
    pub notify: Notify,
    pub writer_open: AtomicBool,
}

impl DvrInput {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            state: Mutex::new(InputState {
                ring: RingBuffer::detached(config.dvr_buffer_size),
                commands: CommandRing::new(config.dvr_command_slots),
                processing: false,
            }),
            notify: Notify::new(),
            writer_open: AtomicBool::new(false),
        }
    }
}
