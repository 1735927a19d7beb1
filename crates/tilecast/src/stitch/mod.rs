//! Merging of per-tile packets into one decodable packet per frame.

mod layout;

pub use layout::{arrange, MergeLayout, TileArrangement, MAX_GRID_SIDE};

use bytes::BytesMut;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::{
    adaptation::{TrackId, TrackSet},
    config::StitchConfig,
    error::{TilecastError, TilecastResult},
    packet::{MediaPacket, MergedPacket, PacketPoll, PacketSource},
};

#[derive(Debug, Clone, PartialEq)]
pub enum StitchOutcome {
    Merged(MergedPacket),
    /// The frame can no longer be produced. Continue at `resume_at`.
    Stale { resume_at: u64 },
    /// The caller asked to stop waiting. Collected packets are discarded.
    Interrupted,
}

/// Stitches frames for one output slot.
///
/// A stitcher is owned by exactly one thread. Merge geometry is rebuilt whenever the selection
/// generation changes.
#[derive(Debug)]
pub struct TileStitcher {
    config: StitchConfig,
    wait_budget: Option<Duration>,
    output_slot: usize,
    catchup: bool,

    layout: Option<MergeLayout>,
    generation: Option<u64>,
    segment: u64,
}

impl TileStitcher {
    pub fn new(config: StitchConfig) -> Self {
        Self {
            config,
            wait_budget: None,
            output_slot: 0,
            catchup: false,
            layout: None,
            generation: None,
            segment: 0,
        }
    }

    pub fn output_slot(mut self, slot: usize) -> Self {
        self.output_slot = slot;
        self.catchup = slot > 0;
        self
    }

    /// Longest time spent waiting for a single frame.
    pub fn wait_budget(mut self, budget: Duration) -> Self {
        self.wait_budget = Some(budget);
        self
    }

    pub fn slot(&self) -> usize {
        self.output_slot
    }

    /// Parameter sets are needed for the first merge and after every selection change.
    pub fn needs_params(&self, generation: u64) -> bool {
        self.layout.is_none() || self.generation != Some(generation)
    }

    /// Forget the merge geometry so that the next frame starts a new sequence.
    pub fn reset(&mut self) {
        self.layout = None;
        self.generation = None;
    }

    /// First segment boundary at or after `pts`.
    pub fn segment_boundary(&self, source: &dyn PacketSource, pts: u64) -> u64 {
        let samples = source.samples_per_segment(self.segment).max(1);
        pts.div_ceil(samples) * samples
    }

    /// Collect the packet at `pts` of every track in `tracks` and merge them.
    ///
    /// `interrupted` is polled while waiting for late packets.
    pub fn stitch_frame(
        &mut self,
        source: &dyn PacketSource,
        tracks: &TrackSet,
        generation: u64,
        pts: u64,
        interrupted: &dyn Fn() -> bool,
    ) -> TilecastResult<StitchOutcome> {
        if tracks.is_empty() {
            return Err(TilecastError::EmptySelection);
        }
        let needs_params = self.needs_params(generation);

        for set in tracks.iter() {
            match source.oldest_packet_pts(set.id) {
                Some(oldest) if oldest > pts => {
                    let resume_at = self.segment_boundary(source, oldest);
                    tracing::warn!(
                        "Frame {pts} is outdated, track {} starts at {oldest}, resume {resume_at}",
                        set.id
                    );
                    return Ok(StitchOutcome::Stale { resume_at });
                }
                Some(oldest) if oldest < pts => source.remove_outdated_packets(set.id, pts),
                _ => {}
            }
        }

        let started = Instant::now();
        let mut packets: HashMap<TrackId, MediaPacket> = HashMap::with_capacity(tracks.len());
        for set in tracks.iter() {
            let mut retries = 0;
            let packet = loop {
                if interrupted() {
                    return Ok(StitchOutcome::Interrupted);
                }

                match source.next_packet_with_pts(set.id, pts, needs_params) {
                    PacketPoll::Ready(packet) => break packet,
                    PacketPoll::Stale => {
                        let oldest = source.oldest_packet_pts(set.id).unwrap_or(pts);
                        let resume_at = self.segment_boundary(source, oldest.max(pts + 1));
                        tracing::warn!("Track {} already passed frame {pts}", set.id);
                        return Ok(StitchOutcome::Stale { resume_at });
                    }
                    PacketPoll::NotYetAvailable => {}
                }

                let exhausted = retries >= self.config.max_wait_retries
                    || self.wait_budget.is_some_and(|b| started.elapsed() >= b);
                if exhausted {
                    let resume_at = self.segment_boundary(source, pts + 1);
                    tracing::warn!(
                        "Track {} missed frame {pts} after {retries} retries, resume {resume_at}",
                        set.id
                    );
                    return Ok(StitchOutcome::Stale { resume_at });
                }
                source.wait_for_packets(set.id, self.config.poll_interval());
                retries += 1;
            };
            packets.insert(set.id, packet);
        }

        let merged = self.merge(tracks, generation, pts, needs_params, &packets)?;
        Ok(StitchOutcome::Merged(merged))
    }

    fn merge(
        &mut self,
        tracks: &TrackSet,
        generation: u64,
        pts: u64,
        needs_params: bool,
        packets: &HashMap<TrackId, MediaPacket>,
    ) -> TilecastResult<MergedPacket> {
        if self.needs_params(generation) {
            let layout = MergeLayout::new(tracks).ok_or_else(|| {
                TilecastError::StitchError(format!("no layout for {} tracks", tracks.len()))
            })?;
            tracing::debug!(
                "Merge layout {}x{} with {} region(s), {} repeated",
                layout.width,
                layout.height,
                layout.regions.len(),
                layout.repeated
            );
            self.layout = Some(layout);
        }
        let Some(layout) = &self.layout else {
            return Err(TilecastError::StitchError("merge layout missing".to_string()));
        };

        let mut payload = BytesMut::new();
        let mut has_params = false;
        if needs_params {
            for set in tracks.iter() {
                if let Some(params) = packets.get(&set.id).and_then(|p| p.params.as_ref()) {
                    payload.extend_from_slice(params);
                    has_params = true;
                }
            }
        }
        for region in &layout.regions {
            let packet = packets.get(&region.track_id).ok_or_else(|| {
                TilecastError::StitchError(format!(
                    "packet of track {} missing at {pts}",
                    region.track_id
                ))
            })?;
            payload.extend_from_slice(&packet.payload);
        }

        let segment_id = packets.values().map(|p| p.segment_id).max().unwrap_or_default();
        self.segment = segment_id;
        self.generation = Some(generation);

        Ok(MergedPacket {
            pts,
            segment_id,
            eos: packets.values().any(|p| p.eos),
            output_slot: self.output_slot,
            catchup: self.catchup,
            key_frame: packets.values().all(|p| p.key_frame),
            has_params,
            width: layout.width,
            height: layout.height,
            quality_rank_count: layout.quality_rank_count,
            regions: layout.regions.clone(),
            payload: payload.freeze(),
        })
    }
}
