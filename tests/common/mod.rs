#![allow(dead_code)]

use async_trait::async_trait;
use dmxcore::device::params::{
    CipherOps, EnginePattern, IndexingParams, OobCommand, PlaybackMode, Source, StcReading,
    TsFeedParams, TspFormat,
};
use dmxcore::engine::{BufferCaps, CapFlags, SectionFilterId};
use dmxcore::utils::wait_until;
use dmxcore::{
    Demux, DemuxCaps, DemuxEngine, DeviceConfig, DmxError, FeedSink, Result, SectionFeed, TsFeed,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub const TSP: usize = 188;
pub const WAIT: Duration = Duration::from_secs(5);

/// Small sizes so overflows are easy to provoke.
pub fn test_config() -> DeviceConfig {
    DeviceConfig {
        filter_count: 4,
        filter_buffer_size: 4096,
        dvr_buffer_size: 64 * TSP,
        event_queue_slots: 16,
        dvr_command_slots: 8,
        min_rec_chunk_size: 4 * TSP,
        ..DeviceConfig::default()
    }
}

pub fn open_demux(config: DeviceConfig) -> (Demux, Arc<MockEngine>) {
    open_engine(config, MockEngine::default())
}

/// Like [`open_demux`], with an engine advertising `caps`.
pub fn open_demux_with_caps(config: DeviceConfig, caps: DemuxCaps) -> (Demux, Arc<MockEngine>) {
    open_engine(
        config,
        MockEngine {
            caps: Some(caps),
            ..MockEngine::default()
        },
    )
}

fn open_engine(config: DeviceConfig, engine: MockEngine) -> (Demux, Arc<MockEngine>) {
    let engine = Arc::new(engine);
    let demux = Demux::new(engine.clone(), config).expect("demux opens");
    (demux, engine)
}

/// Every feature on, every buffer class accepting up to 1 MiB.
pub fn full_caps() -> DemuxCaps {
    let buffers = BufferCaps::unrestricted(1 << 20);
    DemuxCaps {
        flags: CapFlags {
            auto_buffer_flush: true,
            pull_mode: true,
            ts_insertion: true,
            video_indexing: true,
            secured_input_playback: true,
        },
        num_cipher_ops: 4,
        section: buffers,
        pes: buffers,
        recording_188: buffers,
        recording_192: buffers,
        playback_188: buffers,
        playback_192: buffers,
        decoder: BufferCaps {
            max_buffer_num: 8,
            ..buffers
        },
    }
}

/// A section with the given table id and `body_len` body bytes.
pub fn section(table_id: u8, body_len: usize) -> Vec<u8> {
    let mut bytes = vec![table_id, 0xb0 | ((body_len >> 8) as u8 & 0x0f), body_len as u8];
    bytes.extend((0..body_len).map(|i| i as u8));
    bytes
}

/// `count` TS packets with the given PID.
pub fn packets(pid: u16, count: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(count * TSP);
    for cc in 0..count {
        let mut packet = vec![0xff; TSP];
        packet[0] = 0x47;
        packet[1] = (pid >> 8) as u8 & 0x1f;
        packet[2] = pid as u8;
        packet[3] = 0x10 | (cc as u8 & 0x0f);
        bytes.extend_from_slice(&packet);
    }
    bytes
}

/// Waits for `check` to hold, re-checked on every engine call.
pub async fn settle<F: FnMut() -> bool>(engine: &MockEngine, mut check: F) {
    tokio::time::timeout(WAIT, wait_until(&engine.activity, || check().then_some(())))
        .await
        .expect("engine reached the expected state");
}

pub struct MockTsFeed {
    pub sink: Arc<dyn FeedSink>,
    pub params: Mutex<Option<TsFeedParams>>,
    pub running: AtomicBool,
    pub oob: Mutex<Vec<OobCommand>>,
    pub data_read: AtomicUsize,
    pub inserted: Mutex<Vec<Vec<u8>>>,
    pub inserting: AtomicBool,
    pub indexing: Mutex<Vec<IndexingParams>>,
    pub cipher: Mutex<Vec<CipherOps>>,
    pub reused: Mutex<Vec<u32>>,
    activity: Arc<Notify>,
}

impl TsFeed for MockTsFeed {
    fn set(&self, params: &TsFeedParams) -> Result<()> {
        *self.params.lock() = Some(*params);
        Ok(())
    }

    fn start_filtering(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_filtering(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn oob_command(&self, cmd: OobCommand) -> Result<()> {
        self.oob.lock().push(cmd);
        self.activity.notify_waiters();
        Ok(())
    }

    fn notify_data_read(&self, len: usize) -> Result<()> {
        self.data_read.fetch_add(len, Ordering::SeqCst);
        Ok(())
    }

    fn set_cipher_ops(&self, ops: &CipherOps) -> Result<()> {
        self.cipher.lock().push(ops.clone());
        Ok(())
    }

    fn set_indexing(&self, params: &IndexingParams) -> Result<()> {
        self.indexing.lock().push(*params);
        Ok(())
    }

    fn scrambling_bits(&self) -> Result<u8> {
        Ok(0b10)
    }

    fn reuse_decoder_buffer(&self, cookie: u32) -> Result<()> {
        self.reused.lock().push(cookie);
        Ok(())
    }

    fn ts_insertion_init(&self) -> Result<()> {
        self.inserting.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ts_insertion_terminate(&self) -> Result<()> {
        self.inserting.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn ts_insertion_insert(&self, packets: &[u8]) -> Result<()> {
        self.inserted.lock().push(packets.to_vec());
        self.activity.notify_waiters();
        Ok(())
    }
}

pub struct MockSectionFeed {
    pub pid: Mutex<Option<u16>>,
    pub filters: Mutex<Vec<(SectionFilterId, Arc<dyn FeedSink>)>>,
    pub running: AtomicBool,
    pub oob: Mutex<Vec<OobCommand>>,
    next_filter: AtomicUsize,
    activity: Arc<Notify>,
}

impl MockSectionFeed {
    /// Hands one section to every filter on the feed, as matching would.
    pub fn deliver(&self, section: &[u8]) {
        let sinks: Vec<_> = self.filters.lock().iter().map(|(_, s)| s.clone()).collect();
        for sink in sinks {
            sink.deliver(section, &[]).expect("section sinks accept data");
        }
    }
}

impl SectionFeed for MockSectionFeed {
    fn set(&self, pid: u16, _check_crc: bool) -> Result<()> {
        *self.pid.lock() = Some(pid);
        Ok(())
    }

    fn allocate_filter(
        &self,
        _pattern: &EnginePattern,
        sink: Arc<dyn FeedSink>,
    ) -> Result<SectionFilterId> {
        let id = SectionFilterId(self.next_filter.fetch_add(1, Ordering::SeqCst));
        self.filters.lock().push((id, sink));
        Ok(id)
    }

    fn release_filter(&self, filter: SectionFilterId) -> Result<()> {
        let mut filters = self.filters.lock();
        let before = filters.len();
        filters.retain(|(id, _)| *id != filter);
        if filters.len() == before {
            return Err(DmxError::InvalidArgument("unknown filter".to_string()));
        }
        Ok(())
    }

    fn start_filtering(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_filtering(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn oob_command(&self, cmd: OobCommand) -> Result<()> {
        self.oob.lock().push(cmd);
        self.activity.notify_waiters();
        Ok(())
    }
}

/// Engine double that records every call and never parses anything.
#[derive(Default)]
pub struct MockEngine {
    pub caps: Option<DemuxCaps>,
    pub ts_feeds: Mutex<Vec<Arc<MockTsFeed>>>,
    pub section_feeds: Mutex<Vec<Arc<MockSectionFeed>>>,
    pub released_ts: AtomicUsize,
    pub released_sections: AtomicUsize,
    pub written: Mutex<Vec<u8>>,
    pub memory_input: AtomicBool,
    pub source: Mutex<Option<Source>>,
    pub tsp_format: Mutex<Option<TspFormat>>,
    pub activity: Arc<Notify>,
}

impl MockEngine {
    pub fn ts_feed(&self, index: usize) -> Arc<MockTsFeed> {
        self.ts_feeds.lock()[index].clone()
    }

    pub fn section_feed(&self, index: usize) -> Arc<MockSectionFeed> {
        self.section_feeds.lock()[index].clone()
    }

    pub fn written_len(&self) -> usize {
        self.written.lock().len()
    }
}

#[async_trait]
impl DemuxEngine for MockEngine {
    fn caps(&self) -> Option<DemuxCaps> {
        self.caps
    }

    fn allocate_ts_feed(&self, sink: Arc<dyn FeedSink>) -> Result<Arc<dyn TsFeed>> {
        let feed = Arc::new(MockTsFeed {
            sink,
            params: Mutex::new(None),
            running: AtomicBool::new(false),
            oob: Mutex::new(Vec::new()),
            data_read: AtomicUsize::new(0),
            inserted: Mutex::new(Vec::new()),
            inserting: AtomicBool::new(false),
            indexing: Mutex::new(Vec::new()),
            cipher: Mutex::new(Vec::new()),
            reused: Mutex::new(Vec::new()),
            activity: self.activity.clone(),
        });
        self.ts_feeds.lock().push(feed.clone());
        Ok(feed)
    }

    fn release_ts_feed(&self, _feed: Arc<dyn TsFeed>) -> Result<()> {
        self.released_ts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn allocate_section_feed(&self) -> Result<Arc<dyn SectionFeed>> {
        let feed = Arc::new(MockSectionFeed {
            pid: Mutex::new(None),
            filters: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            oob: Mutex::new(Vec::new()),
            next_filter: AtomicUsize::new(0),
            activity: self.activity.clone(),
        });
        self.section_feeds.lock().push(feed.clone());
        Ok(feed)
    }

    fn release_section_feed(&self, _feed: Arc<dyn SectionFeed>) -> Result<()> {
        self.released_sections.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        self.written.lock().extend_from_slice(data);
        self.activity.notify_waiters();
        Ok(data.len())
    }

    fn attach_memory_input(&self) -> Result<()> {
        self.memory_input.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn detach_memory_input(&self) -> Result<()> {
        self.memory_input.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_source(&self, source: Source) -> Result<()> {
        *self.source.lock() = Some(source);
        Ok(())
    }

    fn set_playback_mode(&self, _mode: PlaybackMode) -> Result<()> {
        Ok(())
    }

    fn set_tsp_format(&self, format: TspFormat) -> Result<()> {
        *self.tsp_format.lock() = Some(format);
        Ok(())
    }

    fn get_stc(&self, num: u32) -> Result<StcReading> {
        Ok(StcReading {
            num,
            base: 1,
            stc: 0x1_2345_6789,
        })
    }

    fn get_pes_pids(&self) -> Result<[u16; 5]> {
        Ok([0x101, 0x100, 0x1fff, 0x1fff, 0x100])
    }
}
