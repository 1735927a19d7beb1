//! Viewport to track selection.
//!
//! Every selector shares a [`SelectorCore`] that owns the pose bookkeeping: a cycle only starts
//! when the newest pose moved since the last consumed one, otherwise the previous selection
//! stands.

mod extractor;
mod tile;
mod view;

pub use extractor::ExtractorSelector;
pub use tile::TileSelector;
pub use view::{ViewGroupCycler, ViewSelector};

use std::sync::Arc;

use crate::{
    adaptation::{AdaptationSetRegistry, Extractor, TrackSet},
    config::{SelectorConfig, SelectorKind},
    error::TilecastResult,
    geometry::{ContentCoverage, Region, RegionMapper, StreamGeometry, ViewportParams},
    pose::{HeadPose, PoseTracker},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SelectionState {
    #[default]
    Idle,
    Mapping,
    Selected,
    Enabled,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub tracks: TrackSet,
    pub extractor: Option<Arc<Extractor>>,
    /// Pose the selection was computed for
    pub pose: HeadPose,
}

pub struct SelectionContext<'a> {
    pub registry: &'a AdaptationSetRegistry,
    pub segment_number: u64,
    /// First pts handed to the predictor
    pub predict_pts: u64,
}

pub trait TrackSelector: Send {
    fn kind(&self) -> SelectorKind;

    fn set_initial_viewport(
        &mut self,
        geometry: &StreamGeometry,
        viewport: &ViewportParams,
    ) -> TilecastResult<()>;

    /// Run one selection cycle.
    ///
    /// `None` means the previous selection stays in effect: the pose did not move, there is no
    /// pose yet, mapping failed or nothing matched.
    fn select(&mut self, ctx: &SelectionContext) -> Option<Selection>;

    fn state(&self) -> SelectionState;

    /// Called once the selection returned by [`TrackSelector::select`] is enabled.
    fn mark_enabled(&mut self);
}

pub struct SelectorCore {
    tracker: Arc<PoseTracker>,
    /// Pose of the last cycle that produced a selection
    last_pose: Option<HeadPose>,
    cycle_pose: Option<HeadPose>,
    epsilon: f32,
    state: SelectionState,
}

impl SelectorCore {
    pub fn new(tracker: Arc<PoseTracker>, epsilon: f32) -> Self {
        Self {
            tracker,
            last_pose: None,
            cycle_pose: None,
            epsilon,
            state: SelectionState::Idle,
        }
    }

    pub fn tracker(&self) -> &PoseTracker {
        &self.tracker
    }

    pub fn state(&self) -> SelectionState {
        self.state
    }

    /// Start a cycle with the newest pose if it moved by more than epsilon since the last
    /// selection.
    pub fn begin_cycle(&mut self) -> Option<HeadPose> {
        let epsilon = self.epsilon;
        self.begin_cycle_with(|latest, last| latest.differs_from(last, epsilon))
    }

    pub fn begin_cycle_with(
        &mut self,
        changed: impl Fn(&HeadPose, &HeadPose) -> bool,
    ) -> Option<HeadPose> {
        let Some(latest) = self.tracker.latest_pose() else {
            self.state = SelectionState::Idle;
            return None;
        };
        if let Some(last) = &self.last_pose {
            if !changed(&latest, last) {
                self.state = SelectionState::Idle;
                return None;
            }
        }

        self.cycle_pose = Some(latest);
        self.state = SelectionState::Mapping;
        Some(latest)
    }

    /// Poses to map, highest priority first. Falls back to `pose` without a usable prediction.
    pub fn candidate_poses(&self, pose: HeadPose, predict_pts: u64) -> Vec<HeadPose> {
        let Some(prediction) = self.tracker.predict(predict_pts) else {
            return vec![pose];
        };

        prediction
            .by_priority()
            .into_iter()
            .map(|angle| HeadPose {
                zoom: pose.zoom,
                halting_probability: Some(prediction.halting_probability),
                ..HeadPose::from(angle)
            })
            .collect()
    }

    /// End the cycle. The pose is only consumed when it produced a selection.
    pub fn finish(&mut self, selection: Option<Selection>) -> Option<Selection> {
        let pose = self.cycle_pose.take();
        self.state = match selection {
            Some(_) => {
                if pose.is_some() {
                    self.last_pose = pose;
                }
                SelectionState::Selected
            }
            None => SelectionState::Idle,
        };
        selection
    }

    pub fn mark_enabled(&mut self) {
        if self.state == SelectionState::Selected {
            self.state = SelectionState::Enabled;
        }
    }
}

/// Map one pose through `mapper`.
pub(crate) fn map_viewport(
    mapper: &mut dyn RegionMapper,
    pose: &HeadPose,
) -> TilecastResult<(Vec<Region>, Option<ContentCoverage>)> {
    mapper.set_viewport(pose.yaw, pose.pitch, pose.zoom)?;
    mapper.process()?;
    Ok((mapper.covered_regions(), mapper.content_coverage()))
}

/// Create the selector configured for a stream.
pub fn build_selector(
    config: &SelectorConfig,
    tracker: Arc<PoseTracker>,
    epsilon: f32,
    mapper: Box<dyn RegionMapper>,
) -> Box<dyn TrackSelector> {
    let core = SelectorCore::new(tracker, epsilon);
    match config.kind {
        SelectorKind::Extractor => Box::new(ExtractorSelector::new(core, mapper)),
        SelectorKind::Tile => Box::new(
            TileSelector::new(core, mapper)
                .layout_supplement(config.layout_supplement)
                .max_tracks(config.max_tracks),
        ),
        SelectorKind::View => Box::new(ViewSelector::new(core, config)),
    }
}
