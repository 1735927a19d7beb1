//! Re-stitching of segments whose tile selection went stale.
//!
//! Tasks flow through a bounded channel to a fixed pool of worker threads. Each worker owns its
//! stitcher and writes to its own output slot, so workers never share merge state.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    adaptation::TrackSet,
    config::{CatchupConfig, StitchConfig},
    error::{TilecastError, TilecastResult},
    packet::{MergedPacket, PacketSource},
    stitch::{StitchOutcome, TileStitcher},
};

#[derive(Debug, Clone)]
pub struct StitchTask {
    /// Segment number of the range to re-stitch
    pub segment: u64,
    /// First pts of the segment to re-stitch
    pub target_pts_base: u64,
    pub tracks: TrackSet,
    pub enqueued_at: Instant,
    /// Pose pts that invalidated the previous selection
    pub trigger_pts: Option<u64>,
    attempts: u32,
}

impl StitchTask {
    pub fn new(segment: u64, target_pts_base: u64, tracks: TrackSet) -> Self {
        Self {
            segment,
            target_pts_base,
            tracks,
            enqueued_at: Instant::now(),
            trigger_pts: None,
            attempts: 0,
        }
    }

    pub fn trigger_pts(mut self, pts: u64) -> Self {
        self.trigger_pts = Some(pts);
        self
    }

    /// Frame to start stitching at: the key frame at or before the trigger, kept inside the
    /// segment `[target_pts_base, end)`.
    pub fn start_pts(&self, gop_size: u64, end: u64) -> u64 {
        let Some(trigger) = self.trigger_pts else {
            return self.target_pts_base;
        };
        if trigger < self.target_pts_base || trigger >= end {
            return self.target_pts_base;
        }
        let gop = gop_size.max(1);
        (trigger / gop * gop).max(self.target_pts_base)
    }
}

#[derive(Debug, Default)]
pub struct CatchupStats {
    executed: AtomicUsize,
    dropped: AtomicUsize,
    stale_retries: AtomicUsize,
    frames: AtomicUsize,
}

impl CatchupStats {
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stale_retries(&self) -> usize {
        self.stale_retries.load(Ordering::Relaxed)
    }

    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CatchupSnapshot {
        CatchupSnapshot {
            executed: self.executed(),
            dropped: self.dropped(),
            stale_retries: self.stale_retries(),
            frames: self.frames(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CatchupSnapshot {
    pub executed: usize,
    pub dropped: usize,
    pub stale_retries: usize,
    pub frames: usize,
}

/// Merged packets of every catch-up slot. Index `0` belongs to slot `1`.
#[derive(Debug, Default)]
pub struct CatchupOutputs {
    slots: Mutex<Vec<VecDeque<MergedPacket>>>,
}

impl CatchupOutputs {
    fn new(slots: usize) -> Self {
        Self {
            slots: Mutex::new(vec![VecDeque::new(); slots]),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<VecDeque<MergedPacket>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, slot: usize, packet: MergedPacket) {
        if let Some(queue) = self.lock().get_mut(slot.saturating_sub(1)) {
            queue.push_back(packet);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every slot round-robin.
    ///
    /// Slots holding packets are renumbered `1..=k` in slot order so consumers see dense ids.
    pub fn drain_round_robin(&self) -> Vec<MergedPacket> {
        let mut slots = self.lock();
        let mut ready: Vec<(usize, &mut VecDeque<MergedPacket>)> = slots
            .iter_mut()
            .filter(|q| !q.is_empty())
            .enumerate()
            .map(|(index, queue)| (index + 1, queue))
            .collect();

        let mut drained = Vec::new();
        loop {
            let mut progressed = false;
            for (slot, queue) in ready.iter_mut() {
                if let Some(mut packet) = queue.pop_front() {
                    packet.output_slot = *slot;
                    drained.push(packet);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        drained
    }
}

pub struct CatchupSchedulerBuilder {
    config: CatchupConfig,
    stitch: StitchConfig,
    gop_size: u64,
    wait_budget: Option<Duration>,
}

impl CatchupSchedulerBuilder {
    pub fn new(config: CatchupConfig) -> Self {
        Self {
            config,
            stitch: StitchConfig::default(),
            gop_size: 1,
            wait_budget: None,
        }
    }

    pub fn stitch(mut self, stitch: StitchConfig) -> Self {
        self.stitch = stitch;
        self
    }

    pub fn gop_size(mut self, gop_size: u64) -> Self {
        self.gop_size = gop_size.max(1);
        self
    }

    pub fn wait_budget(mut self, budget: Duration) -> Self {
        self.wait_budget = Some(budget);
        self
    }

    pub fn start(self, source: Arc<dyn PacketSource>) -> TilecastResult<CatchupScheduler> {
        let workers = self.config.workers.get() as usize;
        let (task_tx, task_rx) = crossbeam_channel::bounded(self.config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

        let shared = Arc::new(Shared {
            stopped: AtomicBool::new(false),
            outputs: CatchupOutputs::new(workers),
            stats: CatchupStats::default(),
            active_workers: AtomicUsize::new(0),
        });

        tracing::info!("Start catch-up scheduler with {workers} worker(s).");
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let mut stitcher = TileStitcher::new(self.stitch.clone()).output_slot(index + 1);
            if let Some(budget) = self.wait_budget {
                stitcher = stitcher.wait_budget(budget);
            }

            let worker = Worker {
                stitcher,
                last_completed: None,
                gop_size: self.gop_size,
                max_stale_retries: self.config.max_stale_retries,
                source: source.clone(),
                shared: shared.clone(),
                requeue: task_tx.clone(),
            };
            let tasks = task_rx.clone();
            let shutdown = shutdown_rx.clone();

            shared.active_workers.fetch_add(1, Ordering::SeqCst);
            let handle = std::thread::Builder::new()
                .name(format!("catchup-{}", index + 1))
                .spawn(move || worker.run(tasks, shutdown));
            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    shared.active_workers.fetch_sub(1, Ordering::SeqCst);
                    shared.stopped.store(true, Ordering::SeqCst);
                    drop(shutdown_tx);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        Ok(CatchupScheduler {
            tasks: Some(task_tx),
            shutdown: Some(shutdown_tx),
            trigger_pts: AtomicU64::new(u64::MAX),
            shared,
            workers: handles,
        })
    }
}

struct Shared {
    stopped: AtomicBool,
    outputs: CatchupOutputs,
    stats: CatchupStats,
    active_workers: AtomicUsize,
}

pub struct CatchupScheduler {
    tasks: Option<Sender<StitchTask>>,
    shutdown: Option<Sender<()>>,
    trigger_pts: AtomicU64,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl CatchupScheduler {
    pub fn builder(config: CatchupConfig) -> CatchupSchedulerBuilder {
        CatchupSchedulerBuilder::new(config)
    }

    /// Remember the pose pts that invalidated the current selection.
    ///
    /// Tasks enqueued afterwards without their own trigger inherit it.
    pub fn add_trigger_pts(&self, pts: u64) {
        self.trigger_pts.store(pts, Ordering::Release);
    }

    pub fn latest_trigger_pts(&self) -> Option<u64> {
        match self.trigger_pts.load(Ordering::Acquire) {
            u64::MAX => None,
            pts => Some(pts),
        }
    }

    pub fn enqueue(&self, mut task: StitchTask) -> TilecastResult<()> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(TilecastError::StreamStopped);
        }
        let Some(tasks) = &self.tasks else {
            return Err(TilecastError::StreamStopped);
        };
        if task.tracks.is_empty() {
            return Err(TilecastError::EmptySelection);
        }
        if task.trigger_pts.is_none() {
            task.trigger_pts = self.latest_trigger_pts();
        }

        task.enqueued_at = Instant::now();
        let target = task.target_pts_base;
        match tasks.try_send(task) {
            Ok(()) => {
                tracing::debug!("Catch-up task for {target} queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Catch-up queue is full, task for {target} rejected");
                self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(TilecastError::CatchupQueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(TilecastError::StreamStopped),
        }
    }

    pub fn outputs(&self) -> &CatchupOutputs {
        &self.shared.outputs
    }

    pub fn stats(&self) -> &CatchupStats {
        &self.shared.stats
    }

    pub fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Stop every worker and wait for them. Queued tasks are discarded.
    pub fn stop(&mut self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) && self.workers.is_empty() {
            return;
        }

        // disconnecting the shutdown channel wakes every worker
        self.shutdown.take();
        self.tasks.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Catch-up worker panicked");
            }
        }
        tracing::info!("Catch-up scheduler stopped.");
    }
}

impl Drop for CatchupScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    stitcher: TileStitcher,
    last_completed: Option<u64>,
    gop_size: u64,
    max_stale_retries: u32,
    source: Arc<dyn PacketSource>,
    shared: Arc<Shared>,
    requeue: Sender<StitchTask>,
}

impl Worker {
    fn run(mut self, tasks: Receiver<StitchTask>, shutdown: Receiver<()>) {
        loop {
            crossbeam_channel::select! {
                recv(shutdown) -> _ => break,
                recv(tasks) -> task => match task {
                    Ok(task) => self.handle(task),
                    Err(_) => break,
                },
            }
            if self.shared.stopped.load(Ordering::SeqCst) {
                break;
            }
        }
        self.shared.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn handle(&mut self, mut task: StitchTask) {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return;
        }

        if self
            .last_completed
            .is_some_and(|last| task.target_pts_base <= last)
        {
            let slot = self.stitcher.slot();
            if task.attempts >= self.max_stale_retries {
                tracing::warn!(
                    "Catch-up task for {} is stale on worker {slot}, max retries exceed, drop.",
                    task.target_pts_base
                );
                self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }

            task.attempts += 1;
            self.shared.stats.stale_retries.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.requeue.try_send(task) {
                tracing::warn!(
                    "Failed to requeue stale catch-up task for {}, drop.",
                    e.into_inner().target_pts_base
                );
                self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        if self.execute(&task) {
            self.last_completed = Some(task.target_pts_base);
            self.shared.stats.executed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stitch the task's segment. Returns `false` when interrupted by a stop.
    fn execute(&mut self, task: &StitchTask) -> bool {
        let samples = self.source.samples_per_segment(task.segment).max(1);
        let end = task.target_pts_base + samples;
        let mut pts = task.start_pts(self.gop_size, end);
        tracing::info!(
            "Catch-up worker {} stitching {pts}..{end} with {} track(s), queued for {:?}",
            self.stitcher.slot(),
            task.tracks.len(),
            task.enqueued_at.elapsed()
        );

        // every task starts a new sequence on its slot
        self.stitcher.reset();
        let stopped = || self.shared.stopped.load(Ordering::SeqCst);
        while pts < end {
            if stopped() {
                return false;
            }

            let outcome =
                self.stitcher
                    .stitch_frame(self.source.as_ref(), &task.tracks, 0, pts, &stopped);
            match outcome {
                Ok(StitchOutcome::Merged(mut packet)) => {
                    packet.eos = packet.eos || pts + 1 == end;
                    self.shared.outputs.push(self.stitcher.slot(), packet);
                    self.shared.stats.frames.fetch_add(1, Ordering::Relaxed);
                    pts += 1;
                }
                Ok(StitchOutcome::Stale { resume_at }) => {
                    if resume_at <= pts {
                        pts += 1;
                    } else {
                        pts = resume_at;
                    }
                    self.stitcher.reset();
                }
                Ok(StitchOutcome::Interrupted) => return false,
                Err(e) => {
                    tracing::error!("Catch-up stitching failed at {pts}, discard task. {e}");
                    self.stitcher.reset();
                    break;
                }
            }
        }
        true
    }
}
