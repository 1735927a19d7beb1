//! Viewport predictor plugin contract.
//!
//! A predictor receives every head pose the player records and, when asked, extrapolates the
//! viewport for one or more future presentation timestamps. Predictors are either compiled in
//! (see [`LinearPredictor`]) or loaded from a shared library exposing the C ABI in [`ffi`].

mod dynamic;
mod error;
pub mod ffi;
mod linear;
mod loader;

pub use dynamic::DynamicPredictor;
pub use error::*;
pub use linear::LinearPredictor;
pub use loader::PredictorLoader;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relative importance of a predicted angle. Lower value wins when candidates are merged.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ViewportPriority {
    #[default]
    High = 0,
    Low = 1,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq)]
pub struct ViewportAngle {
    /// Degrees in `[-180, 180]`
    pub yaw: f32,
    /// Degrees in `[-90, 90]`
    pub pitch: f32,
    pub roll: f32,
    pub pts: u64,
    pub priority: ViewportPriority,
}

impl ViewportAngle {
    pub fn new(yaw: f32, pitch: f32, pts: u64) -> Self {
        Self {
            yaw,
            pitch,
            roll: 0.0,
            pts,
            priority: ViewportPriority::High,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PredictionMode {
    /// One predicted angle, consumed by the extractor pipeline
    #[default]
    SingleViewpoint,
    /// Several future angles at configured offsets, consumed by the tile pipeline
    MultiViewpoints,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PredictOptions {
    pub mode: PredictionMode,
    pub feedback_angle_adjust: bool,
    /// Frame offsets from `first_pts` used in multi-viewpoint mode
    pub offsets: Vec<u64>,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            mode: PredictionMode::SingleViewpoint,
            feedback_angle_adjust: false,
            offsets: vec![0, 8, 15, 23],
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Prediction {
    pub angles: BTreeMap<u64, ViewportAngle>,
    pub halting_probability: f32,
}

impl Prediction {
    pub fn is_empty(&self) -> bool {
        self.angles.is_empty()
    }

    /// Predicted angles ordered by priority, then by pts.
    pub fn by_priority(&self) -> Vec<ViewportAngle> {
        let mut angles: Vec<_> = self.angles.values().copied().collect();
        angles.sort_by_key(|a| (a.priority, a.pts));
        angles
    }
}

pub trait ViewportPredictor: Send {
    fn name(&self) -> &str;

    fn initialize(&mut self, options: &PredictOptions) -> PredictResult<()>;

    /// Feed one recorded pose. Called once per pose, in recording order.
    fn set_viewport(&mut self, angle: ViewportAngle) -> PredictResult<()>;

    /// Predict viewport angles starting at `first_pts`.
    ///
    /// An empty prediction is valid and means the caller should keep using the last confirmed pose.
    fn predict(&mut self, first_pts: u64) -> PredictResult<Prediction>;

    fn destroy(&mut self) -> PredictResult<()> {
        Ok(())
    }
}

/// Wrap an angle into `[-180, 180)`.
pub fn wrap_degrees(value: f32) -> f32 {
    let wrapped = (value + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped.is_nan() {
        0.0
    } else {
        wrapped
    }
}
