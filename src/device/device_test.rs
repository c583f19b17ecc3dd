use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::config::{AutoStmHeuristics, DeviceSettings, SchedulerType};
use crate::device::Device;
use crate::error::Error;
use crate::file::{FileId, FileLocationResolver, OpenMode};
use crate::hook::IoHook;
use crate::stream::auto_stream::GetBufferResult;
use crate::stream::{AutoStream, StdStream, StreamStatus};
use crate::test_util::{pattern, BlockingMedia, DeferredMedia, MemoryMedia, TestResolver};

const KIB: u32 = 1024;

fn blocking_device(
    pool: u32,
    granularity: u32,
    cache: bool,
) -> (Arc<Device>, Arc<MemoryMedia>, Arc<TestResolver>) {
    let media = MemoryMedia::new(512);
    let resolver = TestResolver::new(media.clone(), 0);
    let settings = DeviceSettings::default()
        .with_io_memory_size(pool)
        .with_granularity(granularity)
        .with_stream_cache(cache);
    let hook = IoHook::Blocking(BlockingMedia::new(media.clone()));
    let device = Device::create_manual(&settings, hook, Some(resolver.clone()), 0).unwrap();
    (device, media, resolver)
}

fn deferred_device(
    pool: u32,
    granularity: u32,
    cache: bool,
    max_io: u32,
) -> (
    Arc<Device>,
    Arc<MemoryMedia>,
    Arc<TestResolver>,
    Arc<DeferredMedia>,
) {
    let media = MemoryMedia::new(512);
    let resolver = TestResolver::new(media.clone(), 0);
    let settings = DeviceSettings::default()
        .with_io_memory_size(pool)
        .with_granularity(granularity)
        .with_stream_cache(cache)
        .with_scheduler_type(SchedulerType::DeferredLinedUp)
        .with_max_concurrent_io(max_io);
    let hook = DeferredMedia::new(media.clone(), false);
    let device =
        Device::create_manual(&settings, IoHook::Deferred(hook.clone()), Some(resolver.clone()), 0)
            .unwrap();
    (device, media, resolver, hook)
}

fn open_std(
    device: &Arc<Device>,
    resolver: &Arc<TestResolver>,
    file_id: FileId,
    open_mode: OpenMode,
) -> Arc<StdStream> {
    let outcome = resolver
        .open_by_id(file_id, open_mode, None, true)
        .expect("open failed");
    let stream = device
        .create_std(outcome.desc.clone(), open_mode)
        .expect("create failed");
    stream.common.set_file_open(outcome.desc);
    stream
}

fn open_auto(
    device: &Arc<Device>,
    resolver: &Arc<TestResolver>,
    file_id: FileId,
    heuristics: &AutoStmHeuristics,
) -> Arc<AutoStream> {
    let outcome = resolver
        .open_by_id(file_id, OpenMode::Read, None, true)
        .expect("open failed");
    let stream = device
        .create_auto(outcome.desc.clone(), Some(file_id), heuristics, None)
        .expect("create failed");
    stream.common.set_file_open(outcome.desc);
    stream
}

fn heuristics(throughput: f32, priority: i8) -> AutoStmHeuristics {
    AutoStmHeuristics {
        throughput,
        priority,
        ..AutoStmHeuristics::default()
    }
}

#[test]
fn test_std_read_slices_to_granularity() {
    let (device, media, resolver) = blocking_device(64 * KIB, 16 * KIB, false);
    media.add_patterned_file(1, 20 * KIB as usize);

    let stream = open_std(&device, &resolver, 1, OpenMode::Read);
    assert_eq!(
        stream.read(BytesMut::zeroed(20 * KIB as usize), false, 50, 1.0),
        Ok(20 * KIB)
    );
    assert_eq!(stream.status(), StreamStatus::Pending);

    device.perform_io();
    assert_eq!(stream.status(), StreamStatus::Pending);
    device.perform_io();
    assert_eq!(stream.status(), StreamStatus::Completed);

    // One full-granularity slice, one 4 KiB tail.
    assert_eq!(media.read_count(), 2);

    let data = stream.take_data().expect("no data after completion");
    assert_eq!(data.len(), 20 * KIB as usize);
    for (i, byte) in data.iter().enumerate() {
        assert_eq!(*byte, pattern(1, i), "corruption at {}", i);
    }

    assert_eq!(stream.position().0, 20 * KIB as u64);
    stream.destroy();
    device.perform_io();
}

#[test]
fn test_std_write_then_read_round_trip() {
    let (device, media, resolver) = blocking_device(64 * KIB, 16 * KIB, false);

    let payload: Vec<u8> = (0..8 * KIB as usize).map(|i| pattern(77, i)).collect();
    let writer = open_std(&device, &resolver, 77, OpenMode::Write);
    assert_eq!(
        writer.write(Bytes::from(payload.clone()), false, 50, 1.0),
        Ok(8 * KIB)
    );
    device.perform_io();
    assert_eq!(writer.status(), StreamStatus::Completed);
    writer.destroy();
    device.perform_io();

    assert_eq!(media.file_data(77).as_deref(), Some(&payload[..]));

    let reader = open_std(&device, &resolver, 77, OpenMode::Read);
    assert_eq!(
        reader.read(BytesMut::zeroed(8 * KIB as usize), false, 50, 1.0),
        Ok(8 * KIB)
    );
    device.perform_io();
    assert_eq!(reader.status(), StreamStatus::Completed);
    assert_eq!(&reader.take_data().unwrap()[..], &payload[..]);
    reader.destroy();
    device.perform_io();
}

#[test]
fn test_std_zero_size_read_completes_immediately() {
    let (device, media, resolver) = blocking_device(64 * KIB, 16 * KIB, false);
    media.add_patterned_file(1, 16 * KIB as usize);
    let stream = open_std(&device, &resolver, 1, OpenMode::Read);
    assert_eq!(stream.read(BytesMut::new(), false, 50, 1.0), Ok(0));
    assert_eq!(stream.status(), StreamStatus::Completed);
    stream.destroy();
    device.perform_io();
}

#[test]
fn test_std_rejects_misaligned_and_busy_requests() {
    let (device, media, resolver) = blocking_device(64 * KIB, 16 * KIB, false);
    media.add_patterned_file(1, 16 * KIB as usize);
    let stream = open_std(&device, &resolver, 1, OpenMode::Read);

    // Not a multiple of the low-level block size.
    assert_eq!(
        stream.read(BytesMut::zeroed(100), false, 50, 1.0),
        Err(Error::ErrRequestSizeNotBlockAligned)
    );
    // Bad heuristics.
    assert_eq!(
        stream.read(BytesMut::zeroed(512), false, 127, 1.0),
        Err(Error::ErrInvalidParameter)
    );
    assert_eq!(
        stream.read(BytesMut::zeroed(512), false, 50, -1.0),
        Err(Error::ErrInvalidParameter)
    );

    assert_eq!(stream.read(BytesMut::zeroed(512), false, 50, 1.0), Ok(512));
    // A second operation while one is pending.
    assert_eq!(
        stream.read(BytesMut::zeroed(512), false, 50, 1.0),
        Err(Error::ErrOperationPending)
    );
    device.perform_io();
    stream.destroy();
    device.perform_io();
}

#[test]
fn test_scheduler_priority_wins_among_starving() {
    let (device, media, resolver) = blocking_device(128 * KIB, 16 * KIB, false);
    media.add_patterned_file(1, 64 * KIB as usize);
    media.add_patterned_file(2, 64 * KIB as usize);

    let low = open_auto(&device, &resolver, 1, &heuristics(1000.0, 10));
    let high = open_auto(&device, &resolver, 2, &heuristics(1000.0, 100));
    low.start().unwrap();
    high.start().unwrap();

    // Both are starving (nothing buffered): the higher priority goes first.
    let (task, deadline) = device.find_next_task().expect("nothing scheduled");
    assert_eq!(deadline, 0.0);
    assert_eq!(task.common().priority(), 100);

    low.destroy();
    high.destroy();
    device.perform_io();
}

#[test]
fn test_scheduler_round_robin_by_wait_time() {
    let (device, media, resolver) = blocking_device(128 * KIB, 16 * KIB, false);
    media.add_patterned_file(1, 64 * KIB as usize);
    media.add_patterned_file(2, 64 * KIB as usize);

    let a = open_auto(&device, &resolver, 1, &heuristics(1000.0, 50));
    let b = open_auto(&device, &resolver, 2, &heuristics(1000.0, 50));
    a.start().unwrap();
    b.start().unwrap();

    // Same priority, both starving: the one that waited longest wins.
    a.common
        .io_start_time
        .store(8, std::sync::atomic::Ordering::Relaxed);
    b.common
        .io_start_time
        .store(2, std::sync::atomic::Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(20));

    let (task, _) = device.find_next_task().expect("nothing scheduled");
    assert!(Arc::ptr_eq(
        match &task {
            crate::stream::Task::Auto(s) => s,
            _ => panic!("expected automatic stream"),
        },
        &b
    ));

    a.destroy();
    b.destroy();
    device.perform_io();
}

#[test]
fn test_starving_stream_beats_buffered_stream() {
    let (device, media, resolver) = blocking_device(128 * KIB, 16 * KIB, false);
    media.add_patterned_file(1, 64 * KIB as usize);
    media.add_patterned_file(2, 64 * KIB as usize);

    let a = open_auto(&device, &resolver, 1, &heuristics(1000.0, 100));
    let b = open_auto(&device, &resolver, 2, &heuristics(1000.0, 10));
    a.start().unwrap();
    // Buffer one block for a; b stays empty.
    device.perform_io();
    assert!(a.virtual_buffering_size() > 0);
    b.start().unwrap();

    // b is starving, a is not: b wins despite the lower priority.
    let (task, deadline) = device.find_next_task().expect("nothing scheduled");
    assert_eq!(deadline, 0.0);
    assert_eq!(task.common().priority(), 10);

    a.destroy();
    b.destroy();
    device.perform_io();
    device.perform_io();
}

#[test]
fn test_auto_eviction_cycles_single_slot() {
    let (device, media, resolver) = blocking_device(16 * KIB, 16 * KIB, true);
    media.add_patterned_file(5, 64 * KIB as usize);

    let stream = open_auto(&device, &resolver, 5, &heuristics(1000.0, 50));
    stream.start().unwrap();

    let mut collected = Vec::new();
    for chunk in 0..4 {
        device.perform_io();
        let result = stream.get_buffer(false).expect("stream failed");
        let buffer = match result {
            GetBufferResult::DataReady(buffer) => buffer,
            GetBufferResult::NoMoreData(Some(buffer)) => buffer,
            other => panic!("no data for chunk {}: {:?}", chunk, other),
        };
        assert_eq!(buffer.len(), 16 * KIB as usize);
        collected.extend_from_slice(buffer.data());
        stream.release_buffer().unwrap();
    }

    assert_eq!(collected.len(), 64 * KIB as usize);
    for (i, byte) in collected.iter().enumerate() {
        assert_eq!(*byte, pattern(5, i), "corruption at {}", i);
    }
    // One slot recycled once per chunk.
    assert_eq!(media.read_count(), 4);

    stream.destroy();
    device.perform_io();
}

#[test]
fn test_auto_cache_hit_across_streams() {
    let (device, media, resolver) = blocking_device(128 * KIB, 16 * KIB, true);
    media.add_patterned_file(9, 64 * KIB as usize);

    // Nominal buffering below one granularity: a single transfer satisfies
    // the first stream.
    let first = open_auto(&device, &resolver, 9, &heuristics(40.0, 50));
    first.start().unwrap();
    device.perform_io();
    assert_eq!(media.read_count(), 1);
    first.destroy();
    device.perform_io();

    // The second stream finds the same data in cache: no low-level read.
    let second = open_auto(&device, &resolver, 9, &heuristics(40.0, 50));
    second.start().unwrap();
    let result = second.get_buffer(false).expect("stream failed");
    match result {
        GetBufferResult::DataReady(buffer) => {
            assert_eq!(buffer.len(), 16 * KIB as usize);
            for (i, byte) in buffer.data().iter().enumerate() {
                assert_eq!(*byte, pattern(9, i));
            }
        }
        other => panic!("expected cached data, got {:?}", other),
    }
    assert_eq!(media.read_count(), 1, "cache hit still hit the backend");

    second.release_buffer().unwrap();
    second.destroy();
    device.perform_io();
}

#[test]
fn test_memory_full_falls_back_to_standard_streams() {
    let (device, media, resolver) = blocking_device(16 * KIB, 16 * KIB, false);
    media.add_patterned_file(1, 64 * KIB as usize);
    media.add_patterned_file(2, 16 * KIB as usize);

    let auto = open_auto(&device, &resolver, 1, &heuristics(1000.0, 50));
    auto.start().unwrap();
    device.perform_io();
    assert!(auto.virtual_buffering_size() > 0);

    let std = open_std(&device, &resolver, 2, OpenMode::Read);
    assert_eq!(
        std.read(BytesMut::zeroed(16 * KIB as usize), false, 50, 10.0),
        Ok(16 * KIB)
    );

    // The automatic stream still needs buffering, its deadline is the
    // smallest, but the pool is exhausted: its next preparation aborts and
    // flags memory-idle.
    device.perform_io();
    assert!(device.cannot_schedule_auto_streams());

    // Next pass only considers standard streams.
    let (task, _) = device.find_next_task().expect("standard stream starved");
    assert!(task.is_std());
    device.perform_io();
    assert_eq!(std.status(), StreamStatus::Completed);

    std.destroy();
    auto.destroy();
    device.perform_io();
    device.perform_io();
}

#[test]
fn test_force_cleanup_kills_strictly_lower_priority() {
    let (device, media, resolver) = blocking_device(64 * KIB, 16 * KIB, false);
    media.add_patterned_file(1, 16 * KIB as usize);
    media.add_patterned_file(2, 16 * KIB as usize);

    let low = open_std(&device, &resolver, 1, OpenMode::Read);
    let same = open_std(&device, &resolver, 2, OpenMode::Read);
    low.read(BytesMut::zeroed(16 * KIB as usize), false, 10, 1.0)
        .unwrap();
    same.read(BytesMut::zeroed(16 * KIB as usize), false, 50, 1.0)
        .unwrap();

    // Equal priority is never killed; strictly lower is.
    device.force_cleanup(true, 50);
    assert_eq!(low.status(), StreamStatus::Error);
    assert_eq!(same.status(), StreamStatus::Pending);

    device.perform_io();
    assert_eq!(same.status(), StreamStatus::Completed);
    low.destroy();
    same.destroy();
    device.perform_io();
}

/// Pin budget enforcement: a higher-priority pin evicts a lower one.
#[test]
fn test_caching_budget_bumps_lower_priority() {
    let media = MemoryMedia::new(512);
    let resolver = TestResolver::new(media.clone(), 0);
    for file in [1u32, 2, 3] {
        media.add_patterned_file(file, 16 * KIB as usize);
    }

    let settings = DeviceSettings::default()
        .with_io_memory_size(128 * KIB)
        .with_granularity(16 * KIB)
        .with_stream_cache(true)
        .with_max_cache_pinned_bytes(32 * KIB);
    let hook = IoHook::Blocking(BlockingMedia::new(media.clone()));
    let device = Device::create_manual(&settings, hook, Some(resolver.clone()), 0).unwrap();

    let mut pin = |file: FileId, priority: i8| -> Arc<AutoStream> {
        let outcome = resolver.open_by_id(file, OpenMode::Read, None, true).unwrap();
        let stream = device
            .create_caching_stream(outcome.desc.clone(), Some(file), 16 * KIB, priority)
            .unwrap();
        stream.common.set_file_open(outcome.desc);
        stream.start().unwrap();
        stream
    };

    let f1 = pin(1, 50);
    device.perform_io();
    assert_eq!(f1.virtual_buffering_size(), 16 * KIB);

    let f2 = pin(2, 50);
    device.perform_io();
    assert_eq!(f2.virtual_buffering_size(), 16 * KIB);

    // The budget is full: pinning a higher-priority file bumps one of the
    // priority-50 streams.
    let f3 = pin(3, 100);
    device.perform_io();
    assert_eq!(f3.virtual_buffering_size(), 16 * KIB);
    let survivors = [f1.virtual_buffering_size(), f2.virtual_buffering_size()];
    assert!(survivors.contains(&0), "nothing was bumped: {:?}", survivors);
    assert_eq!(
        f1.virtual_buffering_size() + f2.virtual_buffering_size() + f3.virtual_buffering_size(),
        32 * KIB
    );

    f1.destroy();
    f2.destroy();
    f3.destroy();
    device.perform_io();
}

#[test]
fn test_deferred_out_of_order_completion() {
    let (device, media, resolver, hook) = deferred_device(64 * KIB, 16 * KIB, false, 4);
    media.add_patterned_file(4, 32 * KIB as usize);

    let stream = open_auto(&device, &resolver, 4, &heuristics(1000.0, 50));
    stream.start().unwrap();

    device.perform_io();
    device.perform_io();
    assert_eq!(hook.queued(), 2);

    // The second request completes first: it must be held back.
    assert!(hook.pump_index(1));
    assert!(matches!(
        stream.get_buffer(false),
        Ok(GetBufferResult::NoDataReady)
    ));

    // Once its predecessor lands, both are promoted in order.
    assert!(hook.pump_one());
    let mut collected = Vec::new();
    for _ in 0..2 {
        match stream.get_buffer(false).unwrap() {
            GetBufferResult::DataReady(buffer) | GetBufferResult::NoMoreData(Some(buffer)) => {
                collected.extend_from_slice(buffer.data());
                stream.release_buffer().unwrap();
            }
            other => panic!("missing ordered data: {:?}", other),
        }
    }
    for (i, byte) in collected.iter().enumerate() {
        assert_eq!(*byte, pattern(4, i), "out-of-order corruption at {}", i);
    }

    stream.destroy();
    device.perform_io();
}

/// Cancelling mid-flight settles every transfer and reaches the backend once
/// per request.
#[test]
fn test_deferred_cancel_settles_all_transfers() {
    let (device, media, resolver, hook) = deferred_device(256 * KIB, 16 * KIB, false, 4);
    media.add_patterned_file(6, 64 * KIB as usize);

    let stream = open_std(&device, &resolver, 6, OpenMode::Read);
    assert_eq!(
        stream.read(BytesMut::zeroed(64 * KIB as usize), false, 50, 1.0),
        Ok(64 * KIB)
    );
    for _ in 0..4 {
        device.perform_io();
    }
    assert_eq!(hook.queued(), 4);

    let cancelling = {
        let stream = stream.clone();
        std::thread::spawn(move || stream.cancel())
    };

    // The cancel handshake reaches the backend once per transfer before the
    // caller blocks on settlement.
    let deadline = Instant::now() + Duration::from_secs(2);
    while media.cancel_count() < 4 {
        assert!(Instant::now() < deadline, "cancel never reached the backend");
        std::thread::sleep(Duration::from_millis(1));
    }

    hook.pump_all();
    cancelling.join().unwrap();

    assert_eq!(stream.status(), StreamStatus::Cancelled);
    assert_eq!(device.inner.lock().live_transfers(), 0);
    assert!(stream.take_data().is_none());

    stream.destroy();
    device.perform_io();
}

#[test]
fn test_cancelling_one_observer_keeps_the_transfer() {
    let (device, media, resolver, hook) = deferred_device(128 * KIB, 16 * KIB, true, 4);
    media.add_patterned_file(7, 32 * KIB as usize);

    let a = open_auto(&device, &resolver, 7, &heuristics(40.0, 50));
    let b = open_auto(&device, &resolver, 7, &heuristics(40.0, 50));
    a.start().unwrap();
    device.perform_io();
    b.start().unwrap();
    device.perform_io();
    assert_eq!(hook.queued(), 1);

    // a loses interest while b still observes the transfer: the backend must
    // not see a cancel, and b still gets its completion.
    a.destroy();
    assert_eq!(media.cancel_count(), 0);

    hook.pump_all();
    match b.get_buffer(false).unwrap() {
        GetBufferResult::DataReady(buffer) | GetBufferResult::NoMoreData(Some(buffer)) => {
            for (i, byte) in buffer.data().iter().enumerate() {
                assert_eq!(*byte, pattern(7, i));
            }
        }
        other => panic!("surviving observer missed its data: {:?}", other),
    }

    b.release_buffer().unwrap();
    b.destroy();
    device.perform_io();
    device.perform_io();
}

#[test]
fn test_deferred_observer_shares_inflight_transfer() {
    let (device, media, resolver, hook) = deferred_device(128 * KIB, 16 * KIB, true, 4);
    media.add_patterned_file(8, 32 * KIB as usize);

    let a = open_auto(&device, &resolver, 8, &heuristics(40.0, 50));
    let b = open_auto(&device, &resolver, 8, &heuristics(40.0, 50));
    a.start().unwrap();
    device.perform_io();
    assert_eq!(hook.queued(), 1);

    // b wants the same region while the transfer is still in flight: it
    // attaches as an observer instead of issuing its own request.
    b.start().unwrap();
    device.perform_io();
    assert_eq!(hook.queued(), 1, "observer issued a duplicate request");

    hook.pump_all();
    assert_eq!(media.read_count(), 1);
    for stream in [&a, &b] {
        match stream.get_buffer(false).unwrap() {
            GetBufferResult::DataReady(buffer) | GetBufferResult::NoMoreData(Some(buffer)) => {
                assert_eq!(buffer.len(), 16 * KIB as usize);
            }
            other => panic!("observer missed completion: {:?}", other),
        }
        stream.release_buffer().unwrap();
    }

    a.destroy();
    b.destroy();
    device.perform_io();
    device.perform_io();
}
