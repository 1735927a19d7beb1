use std::{num::NonZeroU32, sync::Arc, time::Duration};
use tilecast::{
    adaptation::TrackSet,
    catchup::{CatchupScheduler, StitchTask},
    config::{CatchupConfig, StitchConfig},
    packet::{PacketQueue, PacketSource},
    TilecastError,
};

use crate::{
    common::{erp_registry, feed, wait_until},
    AssertWrapper,
};

const SAMPLES: u64 = 30;
const TIMEOUT: Duration = Duration::from_secs(10);

fn tracks() -> TrackSet {
    let registry = erp_registry(1, 2, false);
    registry.iter().cloned().collect()
}

fn config(workers: u32, max_stale_retries: u32) -> CatchupConfig {
    CatchupConfig {
        workers: NonZeroU32::new(workers).unwrap(),
        queue_capacity: 16,
        max_stale_retries,
        ..Default::default()
    }
}

#[test]
fn test_task_starts_at_key_frame_and_ends_with_eos() {
    let queue = Arc::new(PacketQueue::new(SAMPLES));
    feed(&queue, &[1, 2], 60..90, SAMPLES);

    let scheduler = CatchupScheduler::builder(config(1, 3))
        .gop_size(10)
        .start(queue.clone())
        .assert_success();
    scheduler
        .enqueue(StitchTask::new(3, 60, tracks()).trigger_pts(75))
        .assert_success();

    assert!(wait_until(TIMEOUT, || scheduler.stats().executed() == 1));
    let packets = scheduler.outputs().drain_round_robin();
    let pts: Vec<u64> = packets.iter().map(|p| p.pts).collect();
    assert_eq!(pts, (70..90).collect::<Vec<_>>());
    assert!(packets.iter().all(|p| p.catchup && p.output_slot == 1));
    assert!(packets.last().assert_success().eos);
    assert_eq!(packets.iter().filter(|p| p.eos).count(), 1);
}

#[test]
fn test_trigger_is_inherited() {
    let queue = Arc::new(PacketQueue::new(SAMPLES));
    feed(&queue, &[1, 2], 0..30, SAMPLES);

    let scheduler = CatchupScheduler::builder(config(1, 3))
        .gop_size(10)
        .start(queue.clone())
        .assert_success();
    assert_eq!(scheduler.latest_trigger_pts(), None);
    scheduler.add_trigger_pts(21);
    scheduler
        .enqueue(StitchTask::new(1, 0, tracks()))
        .assert_success();

    assert!(wait_until(TIMEOUT, || scheduler.stats().executed() == 1));
    let packets = scheduler.outputs().drain_round_robin();
    assert_eq!(packets.first().map(|p| p.pts), Some(20));
    assert_eq!(packets.len(), 10);
}

#[test]
fn test_stale_task_is_dropped_after_retries() {
    let queue = Arc::new(PacketQueue::new(SAMPLES));
    feed(&queue, &[1, 2], 60..90, SAMPLES);

    let scheduler = CatchupScheduler::builder(config(1, 4))
        .start(queue.clone())
        .assert_success();
    scheduler
        .enqueue(StitchTask::new(3, 60, tracks()))
        .assert_success();
    assert!(wait_until(TIMEOUT, || scheduler.stats().executed() == 1));
    let frames = scheduler.stats().frames();

    // behind the worker, then a duplicate
    scheduler
        .enqueue(StitchTask::new(2, 30, tracks()))
        .assert_success();
    scheduler
        .enqueue(StitchTask::new(3, 60, tracks()))
        .assert_success();

    assert!(wait_until(TIMEOUT, || scheduler.stats().dropped() == 2));
    let stats = scheduler.stats().snapshot();
    assert_eq!(stats.executed, 1);
    assert_eq!(stats.stale_retries, 8);
    assert_eq!(stats.frames, frames);
}

#[test]
fn test_workers_fill_their_own_slots() {
    let queue = Arc::new(PacketQueue::new(SAMPLES));
    feed(&queue, &[1, 2], 0..60, SAMPLES);

    let scheduler = CatchupScheduler::builder(config(2, 3))
        .gop_size(30)
        .start(queue.clone())
        .assert_success();
    assert_eq!(scheduler.active_workers(), 2);

    // one segment at a time, both tasks read the same queue
    scheduler
        .enqueue(StitchTask::new(1, 0, tracks()))
        .assert_success();
    assert!(wait_until(TIMEOUT, || scheduler.stats().executed() == 1));
    scheduler
        .enqueue(StitchTask::new(2, 30, tracks()))
        .assert_success();
    assert!(wait_until(TIMEOUT, || scheduler.stats().executed() == 2));

    let packets = scheduler.outputs().drain_round_robin();
    assert_eq!(packets.len(), 60);
    assert!(packets.iter().all(|p| p.output_slot == 1 || p.output_slot == 2));
    assert!(scheduler.outputs().is_empty());
}

#[test]
fn test_stop_with_queued_tasks() {
    // nothing to stitch, the first task waits for packets forever
    let queue = Arc::new(PacketQueue::new(SAMPLES));
    let source: Arc<dyn PacketSource> = queue.clone();

    let mut scheduler = CatchupScheduler::builder(config(1, 3))
        .stitch(StitchConfig {
            poll_interval_ms: 5,
            max_wait_retries: u32::MAX,
        })
        .start(source)
        .assert_success();
    for segment in 1..=5 {
        scheduler
            .enqueue(StitchTask::new(segment, (segment - 1) * SAMPLES, tracks()))
            .assert_success();
    }
    assert_eq!(Arc::strong_count(&queue), 2);

    scheduler.stop();
    assert_eq!(scheduler.active_workers(), 0);
    assert_eq!(scheduler.stats().executed(), 0);
    assert_eq!(scheduler.stats().frames(), 0);
    // the worker released its source
    assert_eq!(Arc::strong_count(&queue), 1);

    assert!(matches!(
        scheduler.enqueue(StitchTask::new(6, 150, tracks())),
        Err(TilecastError::StreamStopped)
    ));
    scheduler.stop();
}

#[test]
fn test_full_queue_rejects_tasks() {
    let queue = Arc::new(PacketQueue::new(SAMPLES));
    let scheduler = CatchupScheduler::builder(CatchupConfig {
        queue_capacity: 1,
        ..config(1, 3)
    })
    .stitch(StitchConfig {
        poll_interval_ms: 5,
        max_wait_retries: u32::MAX,
    })
    .start(queue.clone())
    .assert_success();

    let mut rejected = 0;
    for segment in 1..=5 {
        let task = StitchTask::new(segment, (segment - 1) * SAMPLES, tracks());
        if let Err(e) = scheduler.enqueue(task) {
            assert!(matches!(e, TilecastError::CatchupQueueFull));
            rejected += 1;
        }
    }
    assert!(rejected > 0);
    assert_eq!(scheduler.stats().dropped(), rejected);
}
