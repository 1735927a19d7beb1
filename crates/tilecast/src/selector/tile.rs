use super::{map_viewport, Selection, SelectionContext, SelectionState, SelectorCore, TrackSelector};
use crate::{
    adaptation::{AdaptationSetRegistry, TrackSet},
    config::{LayoutSupplement, SelectorKind},
    error::TilecastResult,
    geometry::{RegionMapper, StreamGeometry, ViewportParams},
    pose::HeadPose,
};

/// Selects independently coded tile tracks.
pub struct TileSelector {
    core: SelectorCore,
    mapper: Box<dyn RegionMapper>,
    supplement: LayoutSupplement,
    max_tracks: usize,
    full_sphere: bool,
}

impl TileSelector {
    pub fn new(core: SelectorCore, mapper: Box<dyn RegionMapper>) -> Self {
        Self {
            core,
            mapper,
            supplement: LayoutSupplement::default(),
            max_tracks: 0,
            full_sphere: true,
        }
    }

    pub fn layout_supplement(mut self, supplement: LayoutSupplement) -> Self {
        self.supplement = supplement;
        self
    }

    /// Cap on highest quality tiles when merging predicted candidates. `0` disables the cap.
    pub fn max_tracks(mut self, max_tracks: usize) -> Self {
        self.max_tracks = max_tracks;
        self
    }

    fn viewport_tiles(
        &mut self,
        pose: &HeadPose,
        registry: &AdaptationSetRegistry,
    ) -> Option<TrackSet> {
        let (regions, _) = match map_viewport(self.mapper.as_mut(), pose) {
            Ok(mapped) => mapped,
            Err(e) => {
                tracing::warn!("Failed to map viewport ({}, {}): {e}", pose.yaw, pose.pitch);
                return None;
            }
        };

        let tiles: TrackSet = regions
            .iter()
            .filter_map(|r| registry.find_region(r))
            .filter(|s| s.is_highest_quality())
            .collect();
        (!tiles.is_empty()).then_some(tiles)
    }

    fn within_cap(&self, tiles: &TrackSet) -> bool {
        self.max_tracks == 0 || tiles.len() < self.max_tracks
    }
}

pub(crate) fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    (2..).take_while(|d| d * d <= n).all(|d| n % d != 0)
}

/// Whether `count` highest quality tiles need one more to form a rectangular layout.
pub(crate) fn needs_additional_tile(supplement: LayoutSupplement, count: usize) -> bool {
    match supplement {
        LayoutSupplement::Disabled => false,
        LayoutSupplement::PrimeAboveFour => count > 4 && is_prime(count),
    }
}

/// Add the unselected highest quality tile nearest to the centroid of `tiles`.
pub(crate) fn supplement_tile(tiles: &mut TrackSet, registry: &AdaptationSetRegistry) -> bool {
    let centre = |x: u32, w: u32| x as f64 + w as f64 / 2.0;
    let count = tiles.len() as f64;
    let (cx, cy) = tiles.iter().fold((0.0, 0.0), |(x, y), s| {
        (
            x + centre(s.srd.x, s.srd.width) / count,
            y + centre(s.srd.y, s.srd.height) / count,
        )
    });

    let nearest = registry
        .highest_quality()
        .filter(|s| !tiles.contains(s.id))
        .min_by(|a, b| {
            let da = (centre(a.srd.x, a.srd.width) - cx).hypot(centre(a.srd.y, a.srd.height) - cy);
            let db = (centre(b.srd.x, b.srd.width) - cx).hypot(centre(b.srd.y, b.srd.height) - cy);
            da.total_cmp(&db)
        })
        .cloned();

    match nearest {
        Some(set) => tiles.insert(set),
        None => false,
    }
}

impl TrackSelector for TileSelector {
    fn kind(&self) -> SelectorKind {
        SelectorKind::Tile
    }

    fn set_initial_viewport(
        &mut self,
        geometry: &StreamGeometry,
        viewport: &ViewportParams,
    ) -> TilecastResult<()> {
        self.full_sphere = geometry.projection.requires_full_sphere();
        self.mapper.configure(geometry, viewport)
    }

    fn select(&mut self, ctx: &SelectionContext) -> Option<Selection> {
        let pose = self.core.begin_cycle()?;
        let candidates = self.core.candidate_poses(pose, ctx.predict_pts);

        let mut tiles = TrackSet::new();
        for candidate in &candidates {
            let Some(covered) = self.viewport_tiles(candidate, ctx.registry) else {
                continue;
            };
            if tiles.is_empty() {
                tiles = covered;
                continue;
            }
            for set in covered.iter() {
                if !self.within_cap(&tiles) {
                    break;
                }
                tiles.insert(set.clone());
            }
        }
        if tiles.is_empty() {
            return self.core.finish(None);
        }

        if needs_additional_tile(self.supplement, tiles.len())
            && supplement_tile(&mut tiles, ctx.registry)
        {
            tracing::debug!("Supplemented tile layout to {} tiles", tiles.len());
        }

        let viewport_tiles = tiles.len();
        if self.full_sphere {
            for set in ctx.registry.lower_quality() {
                tiles.insert(set.clone());
            }
        }

        tracing::info!(
            "Selected {viewport_tiles} viewport and {} background tile(s) for ({:.1}, {:.1})",
            tiles.len() - viewport_tiles,
            pose.yaw,
            pose.pitch
        );
        self.core.finish(Some(Selection {
            tracks: tiles,
            extractor: None,
            pose,
        }))
    }

    fn state(&self) -> SelectionState {
        self.core.state()
    }

    fn mark_enabled(&mut self) {
        self.core.mark_enabled();
    }
}
