use std::ops::Range;

use super::{Selection, SelectionContext, SelectionState, SelectorCore, TrackSelector};
use crate::{
    adaptation::{AdaptationSetRegistry, TrackSet},
    config::{SelectorConfig, SelectorKind},
    error::TilecastResult,
    geometry::{StreamGeometry, ViewportParams},
    pose::HeadPose,
};

/// Camera groups for unattended playback.
///
/// Group `i` starts at camera `i * view_window`. Segments sweep forward through the groups, then
/// back, then forward again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewGroupCycler {
    view_window: usize,
    group_count: usize,
}

impl ViewGroupCycler {
    pub fn new(view_window: usize, group_count: usize) -> Self {
        Self {
            view_window: view_window.max(1),
            group_count: group_count.max(1),
        }
    }

    pub fn group_index(&self, segment_number: u64) -> usize {
        if segment_number == 0 {
            return 0;
        }
        let period = 2 * self.group_count as u64;
        let raw = ((segment_number - 1) % period) as usize;
        if raw < self.group_count {
            raw
        } else {
            2 * self.group_count - (raw + 1)
        }
    }

    pub fn group_start(&self, segment_number: u64) -> usize {
        self.group_index(segment_number) * self.view_window
    }
}

/// Window of `size` cameras around `current`, clamped to `[0, camera_count)`.
///
/// Half the window goes to the left of the viewer when possible.
pub(crate) fn view_window(current: usize, size: usize, camera_count: usize) -> Range<usize> {
    let current = current.min(camera_count.saturating_sub(1));
    let start = current - current.min(size / 2);
    let end = (start + size).min(camera_count);
    if end - start < size {
        end.saturating_sub(size)..end
    } else {
        start..end
    }
}

/// Selects camera tracks of a free viewpoint stream.
pub struct ViewSelector {
    core: SelectorCore,
    window: usize,
    camera_count: usize,
    auto_mode: bool,
    cycler: ViewGroupCycler,
    last_group: Option<usize>,
}

impl ViewSelector {
    pub fn new(core: SelectorCore, config: &SelectorConfig) -> Self {
        Self {
            core,
            window: config.view_window.max(1),
            camera_count: config.camera_count,
            auto_mode: config.view_auto_mode,
            cycler: ViewGroupCycler::new(config.view_window, config.view_group_count),
            last_group: None,
        }
    }

    fn camera_count(&self, registry: &AdaptationSetRegistry) -> usize {
        if self.camera_count > 0 {
            self.camera_count
        } else {
            registry.camera_count()
        }
    }

    fn collect(
        registry: &AdaptationSetRegistry,
        cameras: Range<usize>,
        vertical: Option<u32>,
    ) -> TrackSet {
        registry
            .iter()
            .filter(|s| match s.view_id {
                Some((h, v)) => {
                    cameras.contains(&(h as usize)) && vertical.map_or(true, |want| want == v)
                }
                None => false,
            })
            .cloned()
            .collect()
    }

    fn select_auto(&mut self, ctx: &SelectionContext) -> Option<Selection> {
        let group = self.cycler.group_index(ctx.segment_number);
        if self.last_group == Some(group) {
            return None;
        }

        let start = self.cycler.group_start(ctx.segment_number);
        let end = (start + self.window).min(self.camera_count(ctx.registry));
        let tracks = Self::collect(ctx.registry, start..end, None);
        if tracks.is_empty() {
            tracing::warn!("Camera group {group} has no track");
            return self.core.finish(None);
        }

        self.last_group = Some(group);
        tracing::info!(
            "Segment {} uses camera group {group} ({start}..{end})",
            ctx.segment_number
        );
        let pose = self.core.tracker().latest_pose().unwrap_or_default();
        self.core.finish(Some(Selection {
            tracks,
            extractor: None,
            pose,
        }))
    }

    fn select_manual(&mut self, ctx: &SelectionContext) -> Option<Selection> {
        let pose = self.core.begin_cycle_with(|latest: &HeadPose, last: &HeadPose| {
            latest.view_differs_from(last)
        })?;
        let Some((h, v)) = pose.view_grid else {
            tracing::debug!("Pose at {} has no camera index", pose.pts);
            return self.core.finish(None);
        };

        let cameras = view_window(h as usize, self.window, self.camera_count(ctx.registry));
        let tracks = Self::collect(ctx.registry, cameras.clone(), Some(v));
        if tracks.is_empty() {
            return self.core.finish(None);
        }

        tracing::info!("Selected cameras {cameras:?} around camera ({h}, {v})");
        self.core.finish(Some(Selection {
            tracks,
            extractor: None,
            pose,
        }))
    }
}

impl TrackSelector for ViewSelector {
    fn kind(&self) -> SelectorKind {
        SelectorKind::View
    }

    fn set_initial_viewport(
        &mut self,
        _geometry: &StreamGeometry,
        _viewport: &ViewportParams,
    ) -> TilecastResult<()> {
        self.last_group = None;
        Ok(())
    }

    fn select(&mut self, ctx: &SelectionContext) -> Option<Selection> {
        if self.auto_mode {
            self.select_auto(ctx)
        } else {
            self.select_manual(ctx)
        }
    }

    fn state(&self) -> SelectionState {
        self.core.state()
    }

    fn mark_enabled(&mut self) {
        self.core.mark_enabled();
    }
}
