#![doc(html_root_url = "https://docs.rs/dmxcore/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::missing_crate_level_docs)]

//! # dmxcore - Demultiplexer Device Core
//!
//! `dmxcore` is the consumer-facing half of a transport stream demultiplexer.
//! The actual parsing is done by an engine behind the [`DemuxEngine`] trait;
//! this crate owns everything between that engine and the applications
//! reading from it.
//!
//! ## Features
//!
//! ### Filters
//! - Section filters with 16-byte match/mask/mode patterns, one-shot mode,
//!   CRC checking and a deadline for the first section
//! - PES filters feeding a decoder, a PES tap, a TS tap into the shared DVR
//!   output or a per-filter recording
//! - Multiple PIDs per recording filter, video indexing, cipher operations
//!   and periodic TS packet insertion
//!
//! ### Output Buffers
//! - A byte ring per filter with all-or-nothing writes and a latched error
//! - An event queue that stays consistent with the ring when consumers mix
//!   plain reads with event-driven reads
//! - Overflow handling by auto-flush or by latching an error
//!
//! ### DVR Paths
//! - A shared recording output for TS-tap filters
//! - Raw transport stream input with out-of-band commands, handed to the
//!   engine by a background worker
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dmxcore::device::params::{SectionFilterParams, SectionPattern};
//! use dmxcore::{DemuxEngine, DeviceConfig, Demux};
//! use std::sync::Arc;
//!
//! # fn engine() -> Arc<dyn DemuxEngine> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let demux = Demux::new(engine(), DeviceConfig::load()?)?;
//!
//!     // Collect the PAT
//!     let filter = demux.open_filter()?;
//!     let mut params = SectionFilterParams::new(0x0000, SectionPattern::table_id(0x00));
//!     params.flags.immediate_start = true;
//!     filter.set_section_filter(params)?;
//!
//!     let mut section = [0u8; 4096];
//!     let n = filter.read(&mut section, false).await?;
//!     println!("PAT: {:02x?}", &section[..n]);
//!
//!     demux.shutdown()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - `buffer`: Rings, events and the event queue
//! - `device`: The demux device, filters and their parameters
//! - `dvr`: DVR output reader and raw-input writer
//! - `engine`: Traits the engine implements, and its capabilities
//! - `config`: Device sizing and policy
//! - `error`: Error types and the error class mapping
//! - `utils`: Ring arithmetic and async waiting helpers

/// Output rings and event queues
pub mod buffer;

/// Device configuration
pub mod config;

/// The demux device and its filters
pub mod device;

/// DVR output and raw input
pub mod dvr;

/// Engine interface
pub mod engine;

/// Error types and utilities
pub mod error;

/// Common utilities and helper functions
pub mod utils;

pub use buffer::{BufferStatus, Event, EventMask, Output, RingBuffer};
pub use config::DeviceConfig;
pub use device::{Demux, Filter, FilterState};
pub use dvr::{DvrReader, DvrWriter};
pub use engine::{DemuxCaps, DemuxEngine, FeedSink, SectionFeed, TsFeed};
pub use error::{DmxError, ErrorClass, Result};
