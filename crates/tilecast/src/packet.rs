use bytes::Bytes;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::adaptation::{Srd, TrackId};

/// One compressed sample of one tile track.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPacket {
    pub track_id: TrackId,
    pub pts: u64,
    pub segment_id: u64,
    pub payload: Bytes,
    /// Parameter sets needed to start decoding this track
    pub params: Option<Bytes>,
    pub key_frame: bool,
    pub eos: bool,
    pub srd: Srd,
    pub quality_ranking: u32,
}

impl MediaPacket {
    pub fn new(track_id: TrackId, pts: u64, payload: Bytes) -> Self {
        Self {
            track_id,
            pts,
            segment_id: 0,
            payload,
            params: None,
            key_frame: false,
            eos: false,
            srd: Srd::default(),
            quality_ranking: 0,
        }
    }
}

/// Placement of one tile in a merged picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedRegion {
    pub track_id: TrackId,
    pub quality_ranking: u32,
    /// Position in the projected picture of its quality layer
    pub source: Srd,
    /// Position in the merged picture
    pub destination: Srd,
}

/// One decodable output unit.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedPacket {
    pub pts: u64,
    pub segment_id: u64,
    pub eos: bool,
    /// `0` is the primary output, catch-up outputs follow
    pub output_slot: usize,
    pub catchup: bool,
    pub key_frame: bool,
    pub has_params: bool,

    pub width: u32,
    pub height: u32,
    pub quality_rank_count: usize,
    pub regions: Vec<PackedRegion>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketPoll {
    Ready(MediaPacket),
    /// Not produced yet, may show up later
    NotYetAvailable,
    /// Everything left in the track is newer than the requested pts
    Stale,
}

/// Where the stitcher reads tile packets from.
pub trait PacketSource: Send + Sync {
    /// Take the packet of `track` at exactly `pts`.
    ///
    /// With `needs_params` set, the packet carries the parameter sets of its track.
    fn next_packet_with_pts(&self, track: TrackId, pts: u64, needs_params: bool) -> PacketPoll;

    fn oldest_packet_pts(&self, track: TrackId) -> Option<u64>;

    /// Drop every queued packet of `track` older than `before_pts`.
    fn remove_outdated_packets(&self, track: TrackId, before_pts: u64);

    fn samples_per_segment(&self, segment: u64) -> u64;

    /// Block until `track` may have new packets, at most for `timeout`.
    fn wait_for_packets(&self, _track: TrackId, timeout: Duration) {
        std::thread::sleep(timeout);
    }
}

#[derive(Debug, Default)]
struct TrackQueue {
    packets: VecDeque<MediaPacket>,
    params: Option<Bytes>,
}

/// In-memory [`PacketSource`] fed by a segment reader.
#[derive(Debug)]
pub struct PacketQueue {
    samples_per_segment: u64,
    tracks: Mutex<HashMap<TrackId, TrackQueue>>,
    arrived: Condvar,
}

impl PacketQueue {
    pub fn new(samples_per_segment: u64) -> Self {
        Self {
            samples_per_segment: samples_per_segment.max(1),
            tracks: Mutex::new(HashMap::new()),
            arrived: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TrackId, TrackQueue>> {
        self.tracks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a packet, keeping each track sorted by pts.
    pub fn push(&self, packet: MediaPacket) {
        let mut tracks = self.lock();
        let queue = tracks.entry(packet.track_id).or_default();
        if let Some(params) = &packet.params {
            queue.params = Some(params.clone());
        }

        let position = queue.packets.partition_point(|p| p.pts <= packet.pts);
        queue.packets.insert(position, packet);
        drop(tracks);
        self.arrived.notify_all();
    }

    pub fn len(&self, track: TrackId) -> usize {
        self.lock().get(&track).map_or(0, |q| q.packets.len())
    }

    pub fn is_empty(&self) -> bool {
        self.lock().values().all(|q| q.packets.is_empty())
    }
}

impl PacketSource for PacketQueue {
    fn next_packet_with_pts(&self, track: TrackId, pts: u64, needs_params: bool) -> PacketPoll {
        let mut tracks = self.lock();
        let Some(queue) = tracks.get_mut(&track) else {
            return PacketPoll::NotYetAvailable;
        };

        match queue.packets.front() {
            None => return PacketPoll::NotYetAvailable,
            Some(front) if front.pts > pts => return PacketPoll::Stale,
            _ => {}
        }

        let Some(index) = queue.packets.iter().position(|p| p.pts == pts) else {
            return PacketPoll::NotYetAvailable;
        };
        let Some(mut packet) = queue.packets.remove(index) else {
            return PacketPoll::NotYetAvailable;
        };
        if needs_params && packet.params.is_none() {
            packet.params = queue.params.clone();
        }
        PacketPoll::Ready(packet)
    }

    fn oldest_packet_pts(&self, track: TrackId) -> Option<u64> {
        self.lock()
            .get(&track)
            .and_then(|q| q.packets.front())
            .map(|p| p.pts)
    }

    fn remove_outdated_packets(&self, track: TrackId, before_pts: u64) {
        if let Some(queue) = self.lock().get_mut(&track) {
            let before = queue.packets.len();
            while queue.packets.front().is_some_and(|p| p.pts < before_pts) {
                queue.packets.pop_front();
            }
            if queue.packets.len() < before {
                log::trace!(
                    "Removed {} packet(s) of track {track} before {before_pts}",
                    before - queue.packets.len()
                );
            }
        }
    }

    fn samples_per_segment(&self, _segment: u64) -> u64 {
        self.samples_per_segment
    }

    fn wait_for_packets(&self, track: TrackId, timeout: Duration) {
        let tracks = self.lock();
        if tracks.get(&track).is_some_and(|q| !q.packets.is_empty()) {
            return;
        }
        let _ = self
            .arrived
            .wait_timeout(tracks, timeout)
            .unwrap_or_else(PoisonError::into_inner);
    }
}
