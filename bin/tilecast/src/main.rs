use bytes::Bytes;
use clap::Parser;
use std::{
    collections::HashSet,
    num::NonZeroU32,
    ops::Range,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tilecast::{
    adaptation::{TrackId, TrackSet},
    packet::{MediaPacket, PacketQueue},
    pose::HeadPose,
    MediaStream,
};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod config;
mod trace;

use config::ReplayConfig;
use trace::load_trace;

#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
struct ReplayArgs {
    /// Replay settings in toml. Defaults to a 4x8 ERP grid at 30 fps.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Catch-up worker count
    #[clap(long)]
    workers: Option<NonZeroU32>,

    /// Pose prediction plugin name
    #[clap(long)]
    predictor: Option<String>,

    /// Shared library implementing the pose prediction plugin
    #[clap(long, requires = "predictor")]
    predictor_lib: Option<PathBuf>,

    /// Replay speed multiplier
    #[clap(long, default_value = "1.0")]
    speed: f64,

    /// Debug output
    #[clap(long, alias = "debug")]
    verbose: bool,

    /// Pose trace, one `pts,yaw,pitch` line per frame
    trace: PathBuf,
}

#[derive(Debug, Default)]
struct Summary {
    poses: usize,
    selections: usize,
    catchup_tasks: usize,
    primary_frames: usize,
    catchup_frames: usize,
    end_of_stream: bool,
}

/// Plays a pose trace against a stream, fetching packets the way a segment downloader would.
struct Replay<'a> {
    stream: &'a MediaStream,
    primary: Arc<PacketQueue>,
    catchup: Arc<PacketQueue>,
    gop_size: u64,
    last_pts: u64,
    /// (track, segment) pairs already in the primary queue
    fetched: HashSet<(TrackId, u64)>,
    summary: Summary,
}

impl<'a> Replay<'a> {
    fn segment_range(&self, segment: u64) -> Range<u64> {
        let samples = self.stream.samples_per_segment();
        let start = (segment - 1) * samples;
        start..(start + samples).min(self.last_pts + 1)
    }

    fn fetch(&self, queue: &PacketQueue, tracks: &TrackSet, pts: Range<u64>) {
        let samples = self.stream.samples_per_segment();
        for pts in pts {
            for set in tracks.iter() {
                let mut packet = MediaPacket::new(
                    set.id,
                    pts,
                    Bytes::from(format!("{}:{pts}", set.id)),
                );
                packet.segment_id = pts / samples + 1;
                packet.key_frame = pts % self.gop_size == 0;
                if pts % samples == 0 {
                    packet.params = Some(Bytes::from(format!("params:{}", set.id)));
                }
                packet.eos = pts == self.last_pts;
                packet.srd = set.srd;
                packet.quality_ranking = set.quality_ranking;
                queue.push(packet);
            }
        }
    }

    /// Queue the selected tracks of `segment` that the primary queue does not hold yet.
    fn fetch_primary(&mut self, segment: u64, from_pts: u64) {
        let missing: TrackSet = self
            .stream
            .current_selection()
            .iter()
            .filter(|set| self.fetched.insert((set.id, segment)))
            .cloned()
            .collect();
        if missing.is_empty() {
            return;
        }

        let range = self.segment_range(segment);
        tracing::debug!("Fetching {} track(s) of segment {segment}", missing.len());
        self.fetch(&self.primary, &missing, from_pts.max(range.start)..range.end);
    }

    fn select(&mut self, timed: bool) -> anyhow::Result<bool> {
        let changed = self.stream.select_tracks(timed)?;
        if changed {
            self.stream.update_enabled_tracks()?;
            self.summary.selections += 1;
        }
        Ok(changed)
    }

    fn drain(&mut self) {
        for packet in self.stream.get_out_merged_packets() {
            if packet.catchup {
                self.summary.catchup_frames += 1;
            } else {
                self.summary.primary_frames += 1;
                self.summary.end_of_stream |= packet.eos;
            }
            tracing::debug!(
                "Merged frame {} on slot {}: {}x{}, {} region(s)",
                packet.pts,
                packet.output_slot,
                packet.width,
                packet.height,
                packet.regions.len()
            );
        }
    }

    async fn run(&mut self, poses: Vec<HeadPose>, frame_interval: Duration) -> anyhow::Result<()> {
        let samples = self.stream.samples_per_segment();
        let everything: TrackSet = self.stream.registry().iter().cloned().collect();
        let mut ticker = tokio::time::interval(frame_interval);
        let mut segment = 0;

        for pose in poses {
            ticker.tick().await;
            let pts = pose.pts;
            let current = pts / samples + 1;
            self.stream.update_viewport(pose);
            self.summary.poses += 1;

            if current != segment {
                segment = current;
                self.stream.set_segment_number(segment);
                self.select(true)?;
                // catch-up reads from a full copy of the segment
                self.fetch(&self.catchup, &everything, self.segment_range(segment));
                self.fetch_primary(segment, pts);
            } else if self.select(false)? {
                self.fetch_primary(segment, pts);
            }

            match self.stream.detect_catchup(pts) {
                Ok(queued) => self.summary.catchup_tasks += queued,
                Err(e) => tracing::warn!("Catch-up detection failed at {pts}: {e}"),
            }
            self.drain();
        }

        // let the stitchers finish the last segment
        for _ in 0..100 {
            self.drain();
            if self.summary.end_of_stream {
                break;
            }
            ticker.tick().await;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ReplayArgs::parse();
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => ReplayConfig::load(path)?,
        None => ReplayConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.stream.catchup.workers = workers;
    }
    anyhow::ensure!(args.speed > 0.0, "replay speed must be positive");

    let poses = load_trace(&args.trace)?;
    let Some(last_pts) = poses.last().map(|p| p.pts) else {
        anyhow::bail!("pose trace {} is empty", args.trace.display());
    };
    tracing::info!("Loaded {} pose(s) from {}", poses.len(), args.trace.display());

    let samples = config.info.samples_per_segment();
    let primary = Arc::new(PacketQueue::new(samples));
    let catchup = Arc::new(PacketQueue::new(samples));
    let stream = MediaStream::builder()
        .config(config.stream.clone())
        .info(config.info)
        .registry(config.grid.registry()?)
        .packet_source(primary.clone())
        .catchup_source(catchup.clone())
        .build()?;

    if let Some(name) = &args.predictor {
        if stream
            .enable_pose_prediction(name, args.predictor_lib.as_deref())
            .is_err()
        {
            tracing::info!("Replaying without pose prediction");
        }
    }
    stream.set_initial_viewport(config.viewport)?;
    stream.start()?;

    let frame_interval =
        Duration::from_secs_f64(1.0 / config.info.frame_rate as f64 / args.speed);
    let mut replay = Replay {
        stream: &stream,
        primary,
        catchup,
        gop_size: config.info.gop_size.max(1),
        last_pts,
        fetched: HashSet::new(),
        summary: Summary::default(),
    };

    tokio::select! {
        result = replay.run(poses, frame_interval) => result?,
        _ = tokio::signal::ctrl_c() => tracing::warn!("Interrupted, closing stream"),
    }

    let summary = replay.summary;
    let stats = stream.catchup_stats().unwrap_or_default();
    stream.close();

    tracing::info!(
        "Replayed {} pose(s) with {} selection(s): {} primary frame(s), end of stream {}",
        summary.poses,
        summary.selections,
        summary.primary_frames,
        summary.end_of_stream
    );
    tracing::info!(
        "Catch-up: {} queued, {} executed, {} dropped, {} stale retries, {} frame(s) ({} drained)",
        summary.catchup_tasks,
        stats.executed,
        stats.dropped,
        stats.stale_retries,
        stats.frames,
        summary.catchup_frames
    );
    Ok(())
}
