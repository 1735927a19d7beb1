use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, VecDeque},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::JoinHandle,
    time::Duration,
};
use tilecast_predict::{PredictOptions, PredictionMode, PredictorLoader};

use crate::{
    adaptation::{is_selection_changed, AdaptationSetRegistry, Extractor, TrackSet},
    catchup::{CatchupScheduler, CatchupSnapshot, StitchTask},
    config::{SelectorKind, StreamConfig},
    error::{TilecastError, TilecastResult},
    geometry::{ErpRegionMapper, RegionMapper, StreamGeometry, ViewportParams},
    packet::{MergedPacket, PacketSource},
    pose::{HeadPose, PoseTracker},
    selector::{build_selector, Selection, SelectionContext, TrackSelector},
    stitch::{StitchOutcome, TileStitcher},
};

/// Timed selections kept for catch-up decisions.
const TIMED_HISTORY_LEN: usize = 16;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    #[default]
    Unknown,
    Running,
    Stopped,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub frame_rate: u32,
    pub segment_duration_ms: u64,
    /// Frames between two key frames
    pub gop_size: u64,
}

impl StreamInfo {
    pub fn samples_per_segment(&self) -> u64 {
        (self.segment_duration_ms * self.frame_rate as u64 / 1000).max(1)
    }

    fn validate(&self) -> TilecastResult<()> {
        if self.frame_rate == 0 || self.segment_duration_ms == 0 {
            return Err(TilecastError::InvalidStreamInfo(format!(
                "frame rate {} and segment duration {}ms must be positive",
                self.frame_rate, self.segment_duration_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ActiveSelection {
    tracks: TrackSet,
    extractor: Option<Arc<Extractor>>,
    generation: u64,
    /// Selection stamped at the first pts of each segment
    timed: BTreeMap<u64, TrackSet>,
}

#[derive(Debug, Default)]
struct SelectionShared {
    active: Mutex<ActiveSelection>,
    changed: Condvar,
    generation: AtomicU64,
}

impl SelectionShared {
    fn lock(&self) -> MutexGuard<'_, ActiveSelection> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One tiled media stream: its adaptation sets, the current selection and the stitching threads.
pub struct MediaStream {
    config: StreamConfig,
    info: StreamInfo,
    registry: Arc<AdaptationSetRegistry>,
    tracker: Arc<PoseTracker>,
    selector: Mutex<Box<dyn TrackSelector>>,
    pending: Mutex<Option<Selection>>,
    selection: Arc<SelectionShared>,
    segment_number: AtomicU64,

    status: Mutex<StreamStatus>,
    stopped: Arc<AtomicBool>,
    primary_source: Option<Arc<dyn PacketSource>>,
    catchup_source: Option<Arc<dyn PacketSource>>,
    primary_output: Arc<Mutex<VecDeque<MergedPacket>>>,
    primary_thread: Mutex<Option<JoinHandle<()>>>,
    catchup: Mutex<Option<CatchupScheduler>>,
    last_catchup_pts: Mutex<Option<u64>>,
}

impl MediaStream {
    pub fn builder() -> MediaStreamBuilder {
        MediaStreamBuilder::new()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn registry(&self) -> &AdaptationSetRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &PoseTracker {
        &self.tracker
    }

    pub fn status(&self) -> StreamStatus {
        *lock(&self.status)
    }

    pub fn samples_per_segment(&self) -> u64 {
        self.info.samples_per_segment()
    }

    /// Segment the downloader is about to fetch, starting at `1`.
    pub fn set_segment_number(&self, segment: u64) {
        self.segment_number.store(segment, Ordering::Release);
    }

    pub fn segment_number(&self) -> u64 {
        self.segment_number.load(Ordering::Acquire)
    }

    pub fn update_viewport(&self, pose: HeadPose) {
        self.tracker.record_pose(pose);
    }

    pub fn set_initial_viewport(&self, viewport: ViewportParams) -> TilecastResult<()> {
        viewport.validate()?;

        let mut selector = lock(&self.selector);
        let geometry = match self.registry.stream_geometry(viewport.projection) {
            Ok(geometry) => geometry,
            // camera tracks are not laid out on a tile grid
            Err(_) if selector.kind() == SelectorKind::View => StreamGeometry {
                projection: viewport.projection,
                ..Default::default()
            },
            Err(e) => return Err(e),
        };
        tracing::info!(
            "Initial viewport {}x{} ({}°x{}°) on a {}x{} tile grid",
            viewport.viewport_width,
            viewport.viewport_height,
            viewport.horizontal_fov,
            viewport.vertical_fov,
            geometry.tile_rows,
            geometry.tile_cols
        );
        selector.set_initial_viewport(&geometry, &viewport)
    }

    /// Load a predictor and feed it every pose from now on.
    ///
    /// On failure the stream keeps selecting from the latest pose.
    pub fn enable_pose_prediction(
        &self,
        plugin_name: &str,
        lib_path: Option<&Path>,
    ) -> TilecastResult<()> {
        let options = match &self.config.prediction {
            Some(prediction) => prediction.options.clone(),
            None => PredictOptions {
                mode: match self.config.selector.kind {
                    SelectorKind::Tile => PredictionMode::MultiViewpoints,
                    _ => PredictionMode::SingleViewpoint,
                },
                ..Default::default()
            },
        };

        let result = PredictorLoader::new()
            .load(plugin_name, lib_path)
            .map_err(TilecastError::from)
            .and_then(|predictor| self.tracker.install_predictor(predictor, &options));
        if let Err(e) = &result {
            tracing::warn!("Pose prediction disabled, failed to load {plugin_name}: {e}");
        }
        result
    }

    /// Run one selection cycle. Returns `true` when a new selection waits for
    /// [`MediaStream::update_enabled_tracks`].
    ///
    /// With `timed` set, the selection for the current segment is also remembered for catch-up.
    pub fn select_tracks(&self, timed: bool) -> TilecastResult<bool> {
        if self.status() == StreamStatus::Stopped {
            return Err(TilecastError::StreamStopped);
        }

        let segment = self.segment_number();
        let samples = self.samples_per_segment();
        let ctx = SelectionContext {
            registry: &self.registry,
            segment_number: segment,
            predict_pts: segment.saturating_sub(1) * samples,
        };
        let selected = lock(&self.selector).select(&ctx);

        let mut pending = lock(&self.pending);
        let mut active = self.selection.lock();
        let mut already_enabled = false;
        let changed = match selected {
            Some(selection)
                if !active.tracks.is_empty()
                    && !is_selection_changed(&active.tracks, &selection.tracks) =>
            {
                if pending.take().is_some() {
                    tracing::info!("Selection is back to the enabled tracks, drop pending one");
                }
                already_enabled = true;
                false
            }
            Some(selection)
                if pending.as_ref().is_none_or(|pending| {
                    is_selection_changed(&pending.tracks, &selection.tracks)
                }) =>
            {
                tracing::info!(
                    "Selection changed to {} track(s) at pose ({:.1}, {:.1})",
                    selection.tracks.len(),
                    selection.pose.yaw,
                    selection.pose.pitch
                );
                *pending = Some(selection);
                true
            }
            _ => false,
        };

        if timed {
            let tracks = match pending.as_ref() {
                Some(pending) => pending.tracks.clone(),
                None => active.tracks.clone(),
            };
            if !tracks.is_empty() {
                stamp(&mut active, segment, samples, tracks);
            }
        }
        drop(active);
        drop(pending);

        if already_enabled {
            lock(&self.selector).mark_enabled();
        }
        Ok(changed)
    }

    /// Disable every adaptation set, then enable exactly the pending selection.
    pub fn update_enabled_tracks(&self) -> TilecastResult<bool> {
        let Some(selection) = lock(&self.pending).take() else {
            return Ok(false);
        };

        {
            let mut active = self.selection.lock();
            self.registry.apply_enabled(&selection.tracks);
            active.tracks = selection.tracks;
            active.extractor = selection.extractor;
            active.generation += 1;
            self.selection
                .generation
                .store(active.generation, Ordering::Release);
            tracing::debug!(
                "Enabled {} track(s), generation {}",
                active.tracks.len(),
                active.generation
            );
        }
        self.selection.changed.notify_all();
        lock(&self.selector).mark_enabled();
        Ok(true)
    }

    pub fn current_selection(&self) -> TrackSet {
        self.selection.lock().tracks.clone()
    }

    pub fn current_extractor(&self) -> Option<Arc<Extractor>> {
        self.selection.lock().extractor.clone()
    }

    pub fn timed_selection(&self, pts: u64) -> Option<TrackSet> {
        let samples = self.samples_per_segment();
        self.selection
            .lock()
            .timed
            .get(&(pts / samples * samples))
            .cloned()
    }

    /// Compare the current selection with what was fetched for the segment playing at
    /// `current_pts`, and queue catch-up tasks for the tracks that were not fetched.
    ///
    /// Returns the number of queued tasks. Tasks rejected by a full queue are dropped.
    pub fn detect_catchup(&self, current_pts: u64) -> TilecastResult<usize> {
        let catchup = &self.config.catchup;
        {
            let last = lock(&self.last_catchup_pts);
            if last.is_some_and(|last| current_pts < last + catchup.min_trigger_interval) {
                return Ok(0);
            }
        }

        let samples = self.samples_per_segment();
        let segment_start = current_pts / samples * samples;
        let segment = segment_start / samples + 1;
        let tasks = {
            let active = self.selection.lock();
            let Some(stamped) = active.timed.get(&segment_start) else {
                return Ok(0);
            };
            if active.tracks.difference(stamped).is_empty() {
                return Ok(0);
            }

            let next = active.timed.get(&(segment_start + samples));
            let mut tasks = Vec::new();
            if current_pts - segment_start <= samples.saturating_sub(catchup.segment_tail_threshold)
            {
                tasks.push(StitchTask::new(
                    segment,
                    segment_start,
                    active.tracks.difference(stamped),
                ));
                if let Some(next) = next {
                    tasks.push(StitchTask::new(
                        segment + 1,
                        segment_start + samples,
                        active.tracks.difference(next),
                    ));
                }
            } else if let Some(next) = next {
                tasks.push(StitchTask::new(
                    segment + 1,
                    segment_start + samples,
                    active.tracks.difference(next),
                ));
            } else {
                tracing::debug!("Selection changed at {current_pts}, next segment catches up");
            }
            tasks
        };

        let tasks: Vec<_> = tasks.into_iter().filter(|t| !t.tracks.is_empty()).collect();
        if tasks.is_empty() {
            return Ok(0);
        }

        self.add_catchup_trigger_pts(current_pts)?;
        *lock(&self.last_catchup_pts) = Some(current_pts);
        let mut queued = 0;
        for task in tasks {
            let segment = task.segment;
            match self.add_catchup_task(task.trigger_pts(current_pts)) {
                Ok(()) => queued += 1,
                Err(TilecastError::CatchupQueueFull) => {
                    tracing::warn!("Catch-up of segment {segment} dropped, queue is full");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(queued)
    }

    pub fn add_catchup_task(&self, task: StitchTask) -> TilecastResult<()> {
        match lock(&self.catchup).as_ref() {
            Some(catchup) => catchup.enqueue(task),
            None => Err(TilecastError::CatchupDisabled),
        }
    }

    pub fn add_catchup_trigger_pts(&self, pts: u64) -> TilecastResult<()> {
        match lock(&self.catchup).as_ref() {
            Some(catchup) => {
                catchup.add_trigger_pts(pts);
                Ok(())
            }
            None => Err(TilecastError::CatchupDisabled),
        }
    }

    /// Catch-up counters, `None` when catch-up is not running.
    pub fn catchup_stats(&self) -> Option<CatchupSnapshot> {
        lock(&self.catchup).as_ref().map(|c| c.stats().snapshot())
    }

    pub fn catchup_workers(&self) -> usize {
        lock(&self.catchup)
            .as_ref()
            .map_or(0, |c| c.active_workers())
    }

    /// Take every merged packet: the primary output first, then catch-up outputs round-robin.
    pub fn get_out_merged_packets(&self) -> VecDeque<MergedPacket> {
        let mut packets: VecDeque<_> = lock(&self.primary_output).drain(..).collect();
        if let Some(catchup) = lock(&self.catchup).as_ref() {
            packets.extend(catchup.outputs().drain_round_robin());
        }
        packets
    }

    pub fn start(&self) -> TilecastResult<()> {
        let mut status = lock(&self.status);
        match *status {
            StreamStatus::Running => return Err(TilecastError::StreamRunning),
            StreamStatus::Stopped => return Err(TilecastError::StreamStopped),
            StreamStatus::Unknown => {}
        }

        let stitching = self.config.selector.kind != SelectorKind::Extractor;
        let wait_budget = Duration::from_millis(self.info.segment_duration_ms / 2);

        if let (true, Some(source)) = (stitching, &self.primary_source) {
            let stitcher = TileStitcher::new(self.config.stitch.clone()).wait_budget(wait_budget);
            let primary = PrimaryStitcher {
                source: source.clone(),
                selection: self.selection.clone(),
                stopped: self.stopped.clone(),
                output: self.primary_output.clone(),
            };
            let handle = std::thread::Builder::new()
                .name("primary-stitch".to_string())
                .spawn(move || primary.run(stitcher))?;
            *lock(&self.primary_thread) = Some(handle);
        }

        if let (true, Some(source)) = (stitching, &self.catchup_source) {
            let scheduler = CatchupScheduler::builder(self.config.catchup.clone())
                .stitch(self.config.stitch.clone())
                .gop_size(self.info.gop_size)
                .wait_budget(wait_budget)
                .start(source.clone());
            match scheduler {
                Ok(scheduler) => *lock(&self.catchup) = Some(scheduler),
                Err(e) => {
                    drop(status);
                    self.close();
                    return Err(e);
                }
            }
        }

        *status = StreamStatus::Running;
        tracing::info!("Stream started with {:?} selection", self.config.selector.kind);
        Ok(())
    }

    /// Stop every thread and wait for them. Safe to call more than once.
    pub fn close(&self) {
        {
            let mut status = lock(&self.status);
            if *status == StreamStatus::Stopped {
                return;
            }
            *status = StreamStatus::Stopped;
        }

        self.stopped.store(true, Ordering::SeqCst);
        {
            // taking the lock orders the flag before any waiter re-checks it
            let _active = self.selection.lock();
            self.selection.changed.notify_all();
        }

        if let Some(handle) = lock(&self.primary_thread).take() {
            if handle.join().is_err() {
                tracing::error!("Primary stitching thread panicked");
            }
        }
        if let Some(mut catchup) = lock(&self.catchup).take() {
            catchup.stop();
        }
        self.registry.apply_enabled(&TrackSet::new());
        tracing::info!("Stream closed.");
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn stamp(active: &mut ActiveSelection, segment: u64, samples: u64, tracks: TrackSet) {
    let key = segment.saturating_sub(1) * samples;
    active.timed.insert(key, tracks);
    while active.timed.len() > TIMED_HISTORY_LEN {
        active.timed.pop_first();
    }
}

struct PrimaryStitcher {
    source: Arc<dyn PacketSource>,
    selection: Arc<SelectionShared>,
    stopped: Arc<AtomicBool>,
    output: Arc<Mutex<VecDeque<MergedPacket>>>,
}

impl PrimaryStitcher {
    /// Block until a selection is enabled or the stream stops.
    fn wait_selection(&self) -> Option<(TrackSet, u64)> {
        let mut active = self.selection.lock();
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return None;
            }
            if active.generation > 0 && !active.tracks.is_empty() {
                return Some((active.tracks.clone(), active.generation));
            }
            active = self
                .selection
                .changed
                .wait_timeout(active, Duration::from_millis(100))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn run(self, mut stitcher: TileStitcher) {
        let mut pts = 0;
        while let Some((tracks, generation)) = self.wait_selection() {
            let interrupted = || {
                self.stopped.load(Ordering::SeqCst)
                    || self.selection.generation.load(Ordering::Acquire) != generation
            };

            let source = self.source.as_ref();
            match stitcher.stitch_frame(source, &tracks, generation, pts, &interrupted) {
                Ok(StitchOutcome::Merged(packet)) => {
                    let eos = packet.eos;
                    lock(&self.output).push_back(packet);
                    if eos {
                        tracing::info!("End of stream reached at {pts}");
                        break;
                    }
                    pts += 1;
                }
                Ok(StitchOutcome::Stale { resume_at }) => {
                    pts = resume_at.max(pts + 1);
                }
                Ok(StitchOutcome::Interrupted) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    tracing::debug!("Selection changed while stitching {pts}, retry");
                }
                Err(e) => {
                    tracing::error!("Failed to stitch frame {pts}, discard. {e}");
                    stitcher.reset();
                    pts += 1;
                }
            }
        }
    }
}

pub struct MediaStreamBuilder {
    config: StreamConfig,
    info: StreamInfo,
    registry: AdaptationSetRegistry,
    mapper: Option<Box<dyn RegionMapper>>,
    primary_source: Option<Arc<dyn PacketSource>>,
    catchup_source: Option<Arc<dyn PacketSource>>,
}

impl MediaStreamBuilder {
    pub fn new() -> Self {
        Self {
            config: StreamConfig::default(),
            info: StreamInfo {
                frame_rate: 30,
                segment_duration_ms: 1000,
                gop_size: 30,
            },
            registry: AdaptationSetRegistry::new(),
            mapper: None,
            primary_source: None,
            catchup_source: None,
        }
    }

    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn info(mut self, info: StreamInfo) -> Self {
        self.info = info;
        self
    }

    pub fn registry(mut self, registry: AdaptationSetRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Region mapper for the stream geometry. Defaults to [`ErpRegionMapper`].
    pub fn mapper(mut self, mapper: Box<dyn RegionMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    pub fn packet_source(mut self, source: Arc<dyn PacketSource>) -> Self {
        self.primary_source = Some(source);
        self
    }

    /// Source read by catch-up workers. Catch-up stays disabled without one.
    pub fn catchup_source(mut self, source: Arc<dyn PacketSource>) -> Self {
        self.catchup_source = Some(source);
        self
    }

    pub fn build(self) -> TilecastResult<MediaStream> {
        self.info.validate()?;
        if self.registry.is_empty() {
            return Err(TilecastError::InvalidStreamInfo(
                "stream has no adaptation set".to_string(),
            ));
        }

        let tracker = Arc::new(PoseTracker::new(self.config.pose_history_capacity));
        let mapper = self
            .mapper
            .unwrap_or_else(|| Box::new(ErpRegionMapper::new()));
        let selector = build_selector(
            &self.config.selector,
            tracker.clone(),
            self.config.pose_epsilon,
            mapper,
        );

        let stream = MediaStream {
            info: self.info,
            registry: Arc::new(self.registry),
            tracker,
            selector: Mutex::new(selector),
            pending: Mutex::new(None),
            selection: Arc::new(SelectionShared::default()),
            segment_number: AtomicU64::new(1),
            status: Mutex::new(StreamStatus::Unknown),
            stopped: Arc::new(AtomicBool::new(false)),
            primary_source: self.primary_source,
            catchup_source: self.catchup_source,
            primary_output: Arc::new(Mutex::new(VecDeque::new())),
            primary_thread: Mutex::new(None),
            catchup: Mutex::new(None),
            last_catchup_pts: Mutex::new(None),
            config: self.config,
        };

        if let Some(prediction) = stream.config.prediction.clone() {
            // prediction failures only disable prediction
            let _ = stream
                .enable_pose_prediction(&prediction.plugin_name, prediction.lib_path.as_deref());
        }
        Ok(stream)
    }
}

impl Default for MediaStreamBuilder {
    fn default() -> Self {
        Self::new()
    }
}
