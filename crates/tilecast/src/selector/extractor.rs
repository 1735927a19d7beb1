use std::sync::Arc;

use super::{map_viewport, Selection, SelectionContext, SelectionState, SelectorCore, TrackSelector};
use crate::{
    adaptation::{AdaptationSetRegistry, Extractor, TrackSet},
    config::SelectorKind,
    error::TilecastResult,
    geometry::{ContentCoverage, RegionMapper, StreamGeometry, ViewportParams},
    pose::HeadPose,
};

/// Picks the pre-merged extractor track covering the viewport.
pub struct ExtractorSelector {
    core: SelectorCore,
    mapper: Box<dyn RegionMapper>,
}

impl ExtractorSelector {
    pub fn new(core: SelectorCore, mapper: Box<dyn RegionMapper>) -> Self {
        Self { core, mapper }
    }

    fn select_for(
        &mut self,
        pose: &HeadPose,
        registry: &AdaptationSetRegistry,
    ) -> Option<Arc<Extractor>> {
        let extractors = registry.extractors();
        if extractors.is_empty() {
            tracing::debug!("No extractor track in stream");
            return None;
        }

        let (regions, coverage) = match map_viewport(self.mapper.as_mut(), pose) {
            Ok(mapped) => mapped,
            Err(e) => {
                tracing::warn!("Failed to map viewport ({}, {}): {e}", pose.yaw, pose.pitch);
                return None;
            }
        };
        let covered: TrackSet = regions
            .iter()
            .filter_map(|r| registry.find_region(r))
            .collect();
        let target = coverage.unwrap_or(ContentCoverage {
            centre_azimuth: pose.yaw,
            centre_elevation: pose.pitch,
            ..Default::default()
        });

        match_extractor(extractors, &covered, &target)
    }
}

/// Exact dependency match first, then the smallest extractor including every covered track, then
/// the extractor whose coverage centre is nearest the viewport centre.
pub(crate) fn match_extractor(
    extractors: &[Arc<Extractor>],
    covered: &TrackSet,
    target: &ContentCoverage,
) -> Option<Arc<Extractor>> {
    if !covered.is_empty() {
        let ids = covered.ids();
        if let Some(exact) = extractors.iter().find(|e| e.depends_on.ids() == ids) {
            return Some(exact.clone());
        }

        let including = extractors
            .iter()
            .filter(|e| e.depends_on.ids().is_superset(&ids))
            .min_by_key(|e| e.depends_on.len());
        if let Some(including) = including {
            return Some(including.clone());
        }
    }

    extractors
        .iter()
        .min_by(|a, b| {
            a.coverage
                .centre_distance(target)
                .total_cmp(&b.coverage.centre_distance(target))
        })
        .cloned()
}

impl TrackSelector for ExtractorSelector {
    fn kind(&self) -> SelectorKind {
        SelectorKind::Extractor
    }

    fn set_initial_viewport(
        &mut self,
        geometry: &StreamGeometry,
        viewport: &ViewportParams,
    ) -> TilecastResult<()> {
        self.mapper.configure(geometry, viewport)
    }

    fn select(&mut self, ctx: &SelectionContext) -> Option<Selection> {
        let pose = self.core.begin_cycle()?;
        // single viewpoint: only the first predicted angle is used
        let target = self
            .core
            .candidate_poses(pose, ctx.predict_pts)
            .into_iter()
            .next()
            .unwrap_or(pose);

        let selection = self.select_for(&target, ctx.registry).map(|extractor| {
            tracing::info!(
                "Extractor {} selected for ({:.1}, {:.1})",
                extractor.id(),
                target.yaw,
                target.pitch
            );
            Selection {
                tracks: extractor.track_set(),
                extractor: Some(extractor),
                pose: target,
            }
        });
        self.core.finish(selection)
    }

    fn state(&self) -> SelectionState {
        self.core.state()
    }

    fn mark_enabled(&mut self) {
        self.core.mark_enabled();
    }
}
