use serde::{Deserialize, Serialize};
use std::{
    collections::{btree_map, BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    error::{TilecastError, TilecastResult},
    geometry::{ContentCoverage, ProjectionFormat, Region, StreamGeometry},
};

pub type TrackId = u32;

/// Quality ranking of the viewport layer. Lower rankings are better.
pub const HIGHEST_QUALITY_RANKING: u32 = 1;

/// Spatial relationship of a tile inside the packed picture of its quality layer.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Srd {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Srd {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Debug)]
pub struct AdaptationSet {
    pub id: TrackId,
    pub srd: Srd,
    pub quality_ranking: u32,
    pub face_id: Option<u32>,
    /// Horizontal and vertical camera index for multi-camera streams
    pub view_id: Option<(u32, u32)>,
    pub coverage: Option<ContentCoverage>,

    enabled: AtomicBool,
}

impl AdaptationSet {
    pub fn new(id: TrackId, srd: Srd, quality_ranking: u32) -> Self {
        Self {
            id,
            srd,
            quality_ranking,
            face_id: None,
            view_id: None,
            coverage: None,
            enabled: AtomicBool::new(false),
        }
    }

    pub fn with_face(mut self, face_id: u32) -> Self {
        self.face_id = Some(face_id);
        self
    }

    pub fn with_view(mut self, h: u32, v: u32) -> Self {
        self.view_id = Some((h, v));
        self
    }

    pub fn with_coverage(mut self, coverage: ContentCoverage) -> Self {
        self.coverage = Some(coverage);
        self
    }

    pub fn is_highest_quality(&self) -> bool {
        self.quality_ranking == HIGHEST_QUALITY_RANKING
    }

    /// Whether this tile sits at the position described by a mapped region.
    pub fn matches_region(&self, region: &Region) -> bool {
        self.srd.x == region.x
            && self.srd.y == region.y
            && self.quality_ranking == region.quality_ranking
            && (region.face_id.is_none() || self.face_id == region.face_id)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

/// Tracks selected together, keyed by track id.
///
/// Entries point into the registry. Two sets are equal when they hold the same ids referring to
/// the same adaptation sets.
#[derive(Debug, Default, Clone)]
pub struct TrackSet(BTreeMap<TrackId, Arc<AdaptationSet>>);

impl TrackSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, set: Arc<AdaptationSet>) -> bool {
        match self.0.entry(set.id) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(set);
                true
            }
            btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn extend(&mut self, other: &TrackSet) {
        for set in other.0.values() {
            self.insert(set.clone());
        }
    }

    pub fn contains(&self, id: TrackId) -> bool {
        self.0.contains_key(&id)
    }

    pub fn get(&self, id: TrackId) -> Option<&Arc<AdaptationSet>> {
        self.0.get(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> BTreeSet<TrackId> {
        self.0.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AdaptationSet>> {
        self.0.values()
    }

    /// Entries of `self` whose track id is absent from `other`.
    pub fn difference(&self, other: &TrackSet) -> TrackSet {
        TrackSet(
            self.0
                .iter()
                .filter(|(id, _)| !other.0.contains_key(id))
                .map(|(id, set)| (*id, set.clone()))
                .collect(),
        )
    }

    pub fn highest_quality_count(&self) -> usize {
        self.0.values().filter(|s| s.is_highest_quality()).count()
    }
}

impl PartialEq for TrackSet {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|((a_id, a), (b_id, b))| a_id == b_id && Arc::ptr_eq(a, b))
    }
}

impl Eq for TrackSet {}

impl FromIterator<Arc<AdaptationSet>> for TrackSet {
    fn from_iter<T: IntoIterator<Item = Arc<AdaptationSet>>>(iter: T) -> Self {
        let mut set = TrackSet::new();
        for item in iter {
            set.insert(item);
        }
        set
    }
}

/// Whether moving from `previous` to `current` changes what has to be fetched.
///
/// An empty side is a selection miss and never counts as a change.
pub fn is_selection_changed(previous: &TrackSet, current: &TrackSet) -> bool {
    if previous.is_empty() || current.is_empty() {
        return false;
    }
    previous != current
}

/// A track whose samples already merge a fixed set of tile tracks.
#[derive(Debug)]
pub struct Extractor {
    pub track: Arc<AdaptationSet>,
    pub depends_on: TrackSet,
    pub coverage: ContentCoverage,
}

impl Extractor {
    pub fn id(&self) -> TrackId {
        self.track.id
    }

    /// The extractor track together with every track it depends on.
    pub fn track_set(&self) -> TrackSet {
        let mut tracks = self.depends_on.clone();
        tracks.insert(self.track.clone());
        tracks
    }
}

#[derive(Debug, Default)]
pub struct AdaptationSetRegistry {
    sets: BTreeMap<TrackId, Arc<AdaptationSet>>,
    extractors: Vec<Arc<Extractor>>,
}

impl AdaptationSetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, set: AdaptationSet) -> TilecastResult<Arc<AdaptationSet>> {
        if self.sets.contains_key(&set.id) {
            return Err(TilecastError::InvalidStreamInfo(format!(
                "duplicated track id {}",
                set.id
            )));
        }
        let set = Arc::new(set);
        self.sets.insert(set.id, set.clone());
        Ok(set)
    }

    pub fn add_extractor(
        &mut self,
        track: AdaptationSet,
        depends_on: &[TrackId],
        coverage: ContentCoverage,
    ) -> TilecastResult<Arc<Extractor>> {
        let depends_on = depends_on
            .iter()
            .map(|id| self.get(*id).ok_or(TilecastError::UnknownTrack(*id)))
            .collect::<TilecastResult<TrackSet>>()?;
        let track = self.add(track)?;

        let extractor = Arc::new(Extractor {
            track,
            depends_on,
            coverage,
        });
        self.extractors.push(extractor.clone());
        Ok(extractor)
    }

    pub fn get(&self, id: TrackId) -> Option<Arc<AdaptationSet>> {
        self.sets.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AdaptationSet>> {
        self.sets.values()
    }

    pub fn extractors(&self) -> &[Arc<Extractor>] {
        &self.extractors
    }

    fn is_extractor_track(&self, id: TrackId) -> bool {
        self.extractors.iter().any(|e| e.id() == id)
    }

    /// Highest quality tiles, extractor tracks excluded.
    pub fn highest_quality(&self) -> impl Iterator<Item = &Arc<AdaptationSet>> {
        self.sets
            .values()
            .filter(|s| s.is_highest_quality() && !self.is_extractor_track(s.id))
    }

    /// Tiles of every lower quality layer.
    pub fn lower_quality(&self) -> impl Iterator<Item = &Arc<AdaptationSet>> {
        self.sets.values().filter(|s| {
            s.quality_ranking > HIGHEST_QUALITY_RANKING && !self.is_extractor_track(s.id)
        })
    }

    pub fn find_region(&self, region: &Region) -> Option<Arc<AdaptationSet>> {
        if let Some(id) = region.stream_id {
            if let Some(set) = self.sets.get(&id) {
                return Some(set.clone());
            }
        }
        self.sets
            .values()
            .find(|s| s.matches_region(region) && !self.is_extractor_track(s.id))
            .cloned()
    }

    pub fn find_view(&self, h: u32, v: u32) -> Option<Arc<AdaptationSet>> {
        self.sets
            .values()
            .find(|s| s.view_id == Some((h, v)))
            .cloned()
    }

    /// Number of distinct horizontal camera positions.
    pub fn camera_count(&self) -> usize {
        self.sets
            .values()
            .filter_map(|s| s.view_id.map(|(h, _)| h))
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Tile grid and picture size of the highest quality layer.
    pub fn stream_geometry(&self, projection: ProjectionFormat) -> TilecastResult<StreamGeometry> {
        let mut rows = 0;
        let mut cols = 0;
        let mut width = 0;
        let mut height = 0;
        for set in self.highest_quality() {
            if set.srd.x == 0 {
                rows += 1;
                height += set.srd.height;
            }
            if set.srd.y == 0 {
                cols += 1;
                width += set.srd.width;
            }
        }

        if rows == 0 || cols == 0 {
            return Err(TilecastError::InvalidStreamInfo(
                "no highest quality tile at the picture origin".to_string(),
            ));
        }
        Ok(StreamGeometry {
            projection,
            width,
            height,
            tile_rows: rows,
            tile_cols: cols,
        })
    }

    /// Picture size of every quality layer, keyed by quality ranking.
    pub fn quality_resolutions(&self) -> BTreeMap<u32, (u32, u32)> {
        let mut resolutions = BTreeMap::new();
        for set in self.sets.values() {
            if self.is_extractor_track(set.id) {
                continue;
            }
            let entry = resolutions.entry(set.quality_ranking).or_insert((0, 0));
            if set.srd.y == 0 {
                entry.0 += set.srd.width;
            }
            if set.srd.x == 0 {
                entry.1 += set.srd.height;
            }
        }
        resolutions
    }

    /// Disable every adaptation set, then enable exactly `tracks`.
    pub(crate) fn apply_enabled(&self, tracks: &TrackSet) {
        for set in self.sets.values() {
            set.set_enabled(tracks.contains(set.id));
        }
    }

    pub fn enabled(&self) -> TrackSet {
        self.sets
            .values()
            .filter(|s| s.is_enabled())
            .cloned()
            .collect()
    }
}
