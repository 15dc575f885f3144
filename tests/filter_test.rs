mod common;

#[cfg(test)]
mod tests {
    use crate::common::{full_caps, open_demux, open_demux_with_caps, section, test_config};
    use bytes::Bytes;
    use dmxcore::buffer::{DataRange, EventKind, EventMask, LatchedError, PesInfo};
    use dmxcore::device::params::{
        PesFilterParams, PesOutput, PlaybackMode, SectionFilterParams, SectionPattern, Source,
    };
    use dmxcore::engine::{DataReady, DataStatus, PesEnd};
    use dmxcore::{DmxError, Event, FilterState};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    const WAIT: Duration = Duration::from_secs(5);
    const BLOCKED: Duration = Duration::from_millis(50);

    fn running_section(pid: u16) -> SectionFilterParams {
        let mut params = SectionFilterParams::new(pid, SectionPattern::table_id(0x00));
        params.flags.immediate_start = true;
        params
    }

    #[tokio::test]
    async fn test_filter_lifecycle() {
        let (demux, _engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        assert_eq!(filter.state(), FilterState::Allocated);

        assert!(matches!(filter.start(), Err(DmxError::InvalidArgument(_))));

        let params = SectionFilterParams::new(0x10, SectionPattern::table_id(0x42));
        filter.set_section_filter(params).unwrap();
        assert_eq!(filter.state(), FilterState::Set);

        filter.start().unwrap();
        assert_eq!(filter.state(), FilterState::Go);
        // starting again restarts
        filter.start().unwrap();
        assert_eq!(filter.state(), FilterState::Go);

        filter.stop().unwrap();
        assert_eq!(filter.state(), FilterState::Set);
    }

    #[tokio::test]
    async fn test_filter_slots_run_out() {
        let (demux, _engine) = open_demux(test_config().with_filter_count(2));
        let first = demux.open_filter().unwrap();
        let _second = demux.open_filter().unwrap();
        assert!(matches!(demux.open_filter(), Err(DmxError::NoFreeFilter)));

        let freed = first.id();
        drop(first);
        let again = demux.open_filter().unwrap();
        assert_eq!(again.id(), freed);
        assert_eq!(again.state(), FilterState::Allocated);
    }

    #[tokio::test]
    async fn test_reads_stop_at_section_boundaries() {
        let (demux, engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        filter.set_section_filter(running_section(0x00)).unwrap();

        let feed = engine.section_feed(0);
        let first = section(0x00, 5);
        let second = section(0x00, 2);
        feed.deliver(&first);
        feed.deliver(&second);

        let mut buf = [0u8; 64];
        let n = filter.read(&mut buf, false).await.unwrap();
        assert_eq!(&buf[..n], &first[..]);
        let n = filter.read(&mut buf, false).await.unwrap();
        assert_eq!(&buf[..n], &second[..]);

        assert!(matches!(
            filter.read(&mut buf, true).await,
            Err(DmxError::WouldBlock)
        ));
    }

    #[tokio::test]
    async fn test_read_pends_until_a_section_arrives() {
        let (demux, engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        filter.set_section_filter(running_section(0x00)).unwrap();

        let mut buf = [0u8; 32];
        let mut read = task::spawn(filter.read(&mut buf, false));
        assert_pending!(read.poll());

        engine.section_feed(0).deliver(&section(0x00, 4));
        assert!(read.is_woken());
        assert_eq!(assert_ready_ok!(read.poll()), 7);
    }

    #[tokio::test]
    async fn test_short_reads_resume_inside_a_section() {
        let (demux, engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        filter.set_section_filter(running_section(0x00)).unwrap();

        let whole = section(0x00, 10);
        engine.section_feed(0).deliver(&whole);

        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        while out.len() < whole.len() {
            let n = filter.read(&mut buf, true).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, whole);
    }

    #[tokio::test]
    async fn test_section_feed_is_shared_per_pid() {
        let (demux, engine) = open_demux(test_config());
        let a = demux.open_filter().unwrap();
        let b = demux.open_filter().unwrap();
        a.set_section_filter(running_section(0x11)).unwrap();
        b.set_section_filter(running_section(0x11)).unwrap();

        assert_eq!(engine.section_feeds.lock().len(), 1);
        let feed = engine.section_feed(0);
        assert_eq!(feed.filters.lock().len(), 2);
        assert_eq!(*feed.pid.lock(), Some(0x11));

        let sdt = section(0x42, 8);
        feed.deliver(&sdt);
        let mut buf = [0u8; 32];
        assert_eq!(a.read(&mut buf, true).await.unwrap(), sdt.len());
        assert_eq!(b.read(&mut buf, true).await.unwrap(), sdt.len());

        drop(a);
        assert_eq!(engine.released_sections.load(Ordering::SeqCst), 0);
        assert!(feed.running.load(Ordering::SeqCst));

        drop(b);
        assert_eq!(engine.released_sections.load(Ordering::SeqCst), 1);
        assert!(feed.filters.lock().is_empty());
    }

    #[tokio::test]
    async fn test_oneshot_filter_delivers_once() {
        let (demux, engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        let mut params = running_section(0x00);
        params.flags.oneshot = true;
        filter.set_section_filter(params).unwrap();

        let feed = engine.section_feed(0);
        let pat = section(0x00, 9);
        feed.deliver(&pat);
        feed.deliver(&section(0x00, 9));
        assert_eq!(filter.state(), FilterState::Done);

        let mut buf = [0u8; 64];
        assert_eq!(filter.read(&mut buf, false).await.unwrap(), pat.len());
        assert_eq!(filter.read(&mut buf, false).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_section_deadline_expires() {
        let (demux, _engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        let mut params = running_section(0x00);
        params.timeout_ms = 100;
        filter.set_section_filter(params).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(filter.state(), FilterState::TimedOut);
        assert!(filter.poll().error);

        let mut buf = [0u8; 16];
        assert!(matches!(
            filter.read(&mut buf, false).await,
            Err(DmxError::Timeout)
        ));
        assert_eq!(filter.next_event().unwrap(), Event::SectionTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_section_cancels_deadline() {
        let (demux, engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        let mut params = running_section(0x00);
        params.timeout_ms = 100;
        filter.set_section_filter(params).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.section_feed(0).deliver(&section(0x00, 4));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(filter.state(), FilterState::Go);
        assert!(matches!(filter.next_event().unwrap(), Event::NewSection(_)));
    }

    #[tokio::test]
    async fn test_overflow_auto_flushes() {
        let (demux, engine) = open_demux(test_config());
        assert!(demux.auto_flush());
        let filter = demux.open_filter().unwrap();
        filter.set_section_filter(running_section(0x00)).unwrap();

        let feed = engine.section_feed(0);
        feed.deliver(&section(0x00, 3000));
        feed.deliver(&section(0x00, 3000));

        let status = filter.buffer_status().unwrap();
        assert_eq!(status.error, None);
        assert_eq!(status.fullness, 0);
        assert!(matches!(filter.next_event(), Err(DmxError::NoData)));

        // the output keeps accepting data
        feed.deliver(&section(0x00, 10));
        assert_eq!(filter.buffer_status().unwrap().fullness, 13);
    }

    #[tokio::test]
    async fn test_overflow_latches_without_auto_flush() {
        let mut config = test_config();
        config.auto_flush = false;
        let (demux, engine) = open_demux(config);
        let filter = demux.open_filter().unwrap();
        filter.set_section_filter(running_section(0x00)).unwrap();

        let feed = engine.section_feed(0);
        let kept = section(0x00, 3000);
        feed.deliver(&kept);
        feed.deliver(&section(0x00, 3000));
        assert!(filter.poll().priority);

        let mut buf = vec![0u8; 4096];
        assert!(matches!(
            filter.read(&mut buf, false).await,
            Err(DmxError::BufferOverflow)
        ));
        // reported once; the data from before the overflow is still there
        assert_eq!(filter.read(&mut buf, false).await.unwrap(), kept.len());
    }

    #[tokio::test]
    async fn test_overflow_event_clears_latch() {
        let mut config = test_config();
        config.auto_flush = false;
        let (demux, engine) = open_demux(config);
        let filter = demux.open_filter().unwrap();
        filter.set_section_filter(running_section(0x00)).unwrap();

        let feed = engine.section_feed(0);
        feed.deliver(&section(0x00, 3000));
        feed.deliver(&section(0x00, 3000));

        assert_eq!(filter.next_event().unwrap(), Event::BufferOverflow);
        assert!(matches!(filter.next_event().unwrap(), Event::NewSection(_)));
        assert_eq!(filter.buffer_status().unwrap().error, None);
    }

    #[tokio::test]
    async fn test_stop_wakes_blocked_reader() {
        let (demux, _engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        filter.set_section_filter(running_section(0x00)).unwrap();

        let mut buf = [0u8; 16];
        let (read, _) = futures::join!(filter.read(&mut buf, false), async {
            tokio::task::yield_now().await;
            filter.stop().unwrap();
        });
        assert!(matches!(read, Err(DmxError::NotRunning)));
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_readers() {
        let (demux, _engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        filter.set_section_filter(running_section(0x00)).unwrap();

        let mut buf = [0u8; 16];
        let (read, _) = futures::join!(filter.read(&mut buf, false), async {
            tokio::task::yield_now().await;
            demux.shutdown().unwrap();
        });
        assert!(matches!(read, Err(DmxError::Teardown)));
        assert!(matches!(demux.open_filter(), Err(DmxError::Teardown)));
    }

    #[tokio::test]
    async fn test_event_mask_rules() {
        let (demux, _engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        assert!(filter
            .event_mask()
            .disable
            .contains(EventKind::NewEsData));

        let too_high = EventMask {
            wakeup_threshold: 16,
            ..EventMask::default()
        };
        assert!(matches!(
            filter.set_event_mask(too_high),
            Err(DmxError::InvalidArgument(_))
        ));

        let mut mask = EventMask::default();
        mask.disable = mask.disable.with(EventKind::BufferOverflow);
        filter.set_event_mask(mask).unwrap();
        assert!(!filter.event_mask().disable.contains(EventKind::BufferOverflow));

        filter.set_section_filter(running_section(0x00)).unwrap();
        assert!(matches!(
            filter.set_event_mask(EventMask::default()),
            Err(DmxError::Busy(_))
        ));
    }

    #[tokio::test]
    async fn test_buffer_size_is_fixed_while_running() {
        let (demux, _engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        filter.set_buffer_size(8192).unwrap();
        filter.set_section_filter(running_section(0x00)).unwrap();
        assert_eq!(filter.buffer_status().unwrap().size, 8192);

        assert!(matches!(filter.set_buffer_size(1024), Err(DmxError::Busy(_))));
        assert!(filter.set_buffer_size(8192).is_ok());
    }

    #[tokio::test]
    async fn test_pes_tap_reports_units() {
        let (demux, engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        let mut params = PesFilterParams::new(0x100, PesOutput::Tap);
        params.immediate_start = true;
        filter.set_pes_filter(params).unwrap();

        let feed = engine.ts_feed(0);
        assert!(feed.running.load(Ordering::SeqCst));
        assert_eq!(feed.params.lock().map(|p| p.pid), Some(0x100));

        feed.sink
            .data_ready(DataReady::with_data(DataStatus::Ok, vec![1u8; 100]))
            .unwrap();
        let end = PesEnd {
            start_gap: 9,
            actual_length: 141,
            stc: 90_000,
            ts_packets_num: 1,
            ..PesEnd::default()
        };
        feed.sink
            .data_ready(DataReady::with_data(DataStatus::PesEnd(end), vec![2u8; 50]))
            .unwrap();

        let expected = Event::NewPes {
            range: DataRange {
                base_offset: 0,
                start_offset: 9,
                actual_length: 141,
                total_length: 150,
                ..DataRange::default()
            },
            info: PesInfo {
                stc: 90_000,
                ts_packets_num: 1,
                ..PesInfo::default()
            },
        };
        assert_eq!(filter.next_event().unwrap(), expected);

        let mut buf = [0u8; 256];
        assert_eq!(filter.read(&mut buf, false).await.unwrap(), 150);
        assert_eq!(feed.data_read.load(Ordering::SeqCst), 150);
    }

    #[tokio::test]
    async fn test_pes_eos_drains_then_ends() {
        let (demux, engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        let mut params = PesFilterParams::new(0x100, PesOutput::Tap);
        params.immediate_start = true;
        filter.set_pes_filter(params).unwrap();

        let sink = engine.ts_feed(0).sink.clone();
        sink.data_ready(DataReady::with_data(DataStatus::Ok, Bytes::from_static(b"tail")))
            .unwrap();
        sink.data_ready(DataReady::new(DataStatus::Eos)).unwrap();
        // ignored after end of stream
        sink.data_ready(DataReady::with_data(DataStatus::Ok, vec![0u8; 10]))
            .unwrap();

        let mut buf = [0u8; 32];
        assert_eq!(filter.read(&mut buf, false).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"tail");
        assert_eq!(filter.read(&mut buf, false).await.unwrap(), 0);
        assert_eq!(filter.next_event().unwrap(), Event::Eos);
    }

    #[tokio::test]
    async fn test_recording_chunks() {
        let (demux, engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        let mut params = PesFilterParams::new(0x200, PesOutput::TsDemuxTap);
        params.immediate_start = true;
        filter.set_pes_filter(params).unwrap();

        let sink = engine.ts_feed(0).sink.clone();
        let packets = crate::common::packets(0x200, 5);
        sink.deliver(&packets[..3 * 188], &packets[3 * 188..]).unwrap();

        // the minimum chunk is four packets
        assert_eq!(
            filter.next_event().unwrap(),
            Event::NewRecordingChunk(DataRange::contiguous(0, 5 * 188))
        );
        assert!(matches!(filter.next_event(), Err(DmxError::NoData)));
    }

    #[tokio::test]
    async fn test_demux_tap_takes_several_pids() {
        let (demux, engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        let mut params = PesFilterParams::new(0x200, PesOutput::TsDemuxTap);
        params.immediate_start = true;
        filter.set_pes_filter(params).unwrap();

        filter.add_pid(0x201).unwrap();
        assert_eq!(engine.ts_feeds.lock().len(), 2);
        assert!(engine.ts_feed(1).running.load(Ordering::SeqCst));

        filter.remove_pid(0x200).unwrap();
        assert!(matches!(
            filter.remove_pid(0x201),
            Err(DmxError::InvalidArgument(_))
        ));

        let tap = demux.open_filter().unwrap();
        tap.set_pes_filter(PesFilterParams::new(0x300, PesOutput::Tap))
            .unwrap();
        assert!(matches!(tap.add_pid(0x301), Err(DmxError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_status_reports_overflow_once() {
        let mut config = test_config();
        config.auto_flush = false;
        let (demux, engine) = open_demux(config);
        let filter = demux.open_filter().unwrap();
        let mut params = PesFilterParams::new(0x100, PesOutput::Tap);
        params.immediate_start = true;
        filter.set_pes_filter(params).unwrap();

        let sink = engine.ts_feed(0).sink.clone();
        let result = sink.data_ready(DataReady::with_data(DataStatus::Ok, vec![0u8; 5000]));
        assert!(matches!(result, Err(DmxError::BufferOverflow)));

        let status = filter.buffer_status().unwrap();
        assert_eq!(status.error, Some(LatchedError::Overflow));
        assert_eq!(filter.buffer_status().unwrap().error, None);
    }

    #[tokio::test]
    async fn test_header_read_keeps_payload_error() {
        let mut config = test_config();
        config.auto_flush = false;
        let (demux, engine) = open_demux(config);
        let filter = demux.open_filter().unwrap();
        filter.set_section_filter(running_section(0x00)).unwrap();

        // only the header of a section has arrived
        let feed = engine.section_feed(0);
        let truncated = section(0x00, 10);
        feed.deliver(&truncated[..3]);

        let mut buf = [0u8; 64];
        let mut read = task::spawn(filter.read(&mut buf, false));
        assert_pending!(read.poll());

        feed.deliver(&section(0x00, 5000));
        assert!(read.is_woken());
        assert_eq!(assert_ready_ok!(read.poll()), 3);
        drop(read);

        assert_eq!(
            filter.buffer_status().unwrap().error,
            Some(LatchedError::Overflow)
        );
    }

    #[tokio::test]
    async fn test_full_event_queue_is_reported() {
        let mut config = test_config();
        config.event_queue_slots = 2;
        let (demux, engine) = open_demux(config);
        let filter = demux.open_filter().unwrap();
        filter.set_section_filter(running_section(0x00)).unwrap();

        let feed = engine.section_feed(0);
        feed.deliver(&section(0x00, 5));
        feed.deliver(&section(0x00, 5));
        assert!(filter.poll().priority);

        assert!(matches!(filter.next_event(), Err(DmxError::EventOverflow)));
        assert_eq!(
            filter.next_event().unwrap(),
            Event::NewSection(DataRange::contiguous(0, 8))
        );
        assert!(matches!(filter.next_event(), Err(DmxError::NoData)));
        assert_eq!(filter.buffer_status().unwrap().fullness, 8);
    }

    #[tokio::test]
    async fn test_lost_recording_chunk_flushes() {
        let mut config = test_config();
        config.event_queue_slots = 2;
        let (demux, engine) = open_demux(config);
        let filter = demux.open_filter().unwrap();
        let mut params = PesFilterParams::new(0x200, PesOutput::TsDemuxTap);
        params.immediate_start = true;
        filter.set_pes_filter(params).unwrap();

        // two minimum chunks, with room for one event
        let sink = engine.ts_feed(0).sink.clone();
        let packets = crate::common::packets(0x200, 8);
        sink.data_ready(DataReady::with_data(DataStatus::Ok, packets))
            .unwrap();

        assert!(matches!(filter.next_event(), Err(DmxError::EventOverflow)));
        assert!(matches!(filter.next_event(), Err(DmxError::NoData)));
        assert_eq!(filter.buffer_status().unwrap().fullness, 0);

        let more = crate::common::packets(0x200, 4);
        sink.data_ready(DataReady::with_data(DataStatus::Ok, more))
            .unwrap();
        assert_eq!(
            filter.next_event().unwrap(),
            Event::NewRecordingChunk(DataRange::contiguous(8 * 188, 4 * 188))
        );
    }

    #[tokio::test]
    async fn test_space_wait_follows_ring_fill() {
        let (demux, engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        let mut params = PesFilterParams::new(0x100, PesOutput::Tap);
        params.immediate_start = true;
        filter.set_pes_filter(params).unwrap();

        let sink = engine.ts_feed(0).sink.clone();
        sink.data_ready(DataReady::with_data(DataStatus::Ok, vec![7u8; 4000]))
            .unwrap();
        assert!(matches!(
            sink.wait_for_space(1000, false).await,
            Err(DmxError::NoSpace)
        ));

        let mut wait = sink.wait_for_space(1000, true);
        assert!(timeout(BLOCKED, &mut wait).await.is_err());
        let mut buf = vec![0u8; 2000];
        assert_eq!(filter.read(&mut buf, true).await.unwrap(), 2000);
        timeout(WAIT, wait).await.expect("read frees space").unwrap();

        let mut wait = sink.wait_for_space(3000, true);
        assert!(timeout(BLOCKED, &mut wait).await.is_err());
        demux.shutdown().unwrap();
        assert!(matches!(
            timeout(WAIT, wait).await.expect("shutdown wakes waiters"),
            Err(DmxError::Teardown)
        ));
    }

    #[tokio::test]
    async fn test_pull_mode_space_follows_events() {
        let mut config = test_config();
        config.event_queue_slots = 4;
        let (demux, engine) = open_demux_with_caps(config, full_caps());
        demux.set_source(Source::Dvr(0)).unwrap();
        let filter = demux.open_filter().unwrap();
        filter.set_playback_mode(PlaybackMode::Pull).unwrap();
        // without pes events, fetched events free their slot right away
        let mut mask = EventMask::default();
        mask.disable = mask.disable.with(EventKind::NewPes);
        filter.set_event_mask(mask).unwrap();
        let mut params = PesFilterParams::new(0x100, PesOutput::Tap);
        params.immediate_start = true;
        filter.set_pes_filter(params).unwrap();

        let sink = engine.ts_feed(0).sink.clone();
        for id in 0..3 {
            sink.data_ready(DataReady::new(DataStatus::Marker(id)))
                .unwrap();
        }
        assert!(matches!(
            sink.wait_for_space(188, false).await,
            Err(DmxError::NoSpace)
        ));

        let mut wait = sink.wait_for_space(188, true);
        assert!(timeout(BLOCKED, &mut wait).await.is_err());
        assert_eq!(filter.next_event().unwrap(), Event::Marker { id: 0 });
        timeout(WAIT, wait)
            .await
            .expect("next_event frees a slot")
            .unwrap();

        sink.data_ready(DataReady::new(DataStatus::Marker(3)))
            .unwrap();
        let mut wait = sink.wait_for_space(188, true);
        assert!(timeout(BLOCKED, &mut wait).await.is_err());
        filter.stop().unwrap();
        assert!(matches!(
            timeout(WAIT, wait).await.expect("stop wakes waiters"),
            Err(DmxError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_release_data_reconciles_events() {
        let (demux, engine) = open_demux(test_config());
        let filter = demux.open_filter().unwrap();
        filter.set_section_filter(running_section(0x00)).unwrap();

        let feed = engine.section_feed(0);
        feed.deliver(&section(0x00, 5));
        feed.deliver(&section(0x00, 5));

        // the first section goes entirely, the second loses its header
        filter.release_data(12).unwrap();
        assert_eq!(
            filter.next_event().unwrap(),
            Event::NewSection(DataRange::contiguous(12, 4))
        );
        assert!(matches!(
            filter.release_data(5),
            Err(DmxError::InvalidArgument(_))
        ));

        filter.release_data(4).unwrap();
        assert!(matches!(filter.next_event(), Err(DmxError::NoData)));
        assert_eq!(filter.buffer_status().unwrap().fullness, 0);
    }
}
