use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tilecast_predict::{
    wrap_degrees, PredictOptions, Prediction, ViewportAngle, ViewportPredictor,
};

use crate::error::TilecastResult;

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq)]
pub struct HeadPose {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: Option<f32>,
    pub zoom: Option<f32>,
    /// Horizontal and vertical camera index for multi-camera streams
    pub view_grid: Option<(u32, u32)>,
    pub pts: u64,
    pub halting_probability: Option<f32>,
}

impl HeadPose {
    pub fn new(yaw: f32, pitch: f32, pts: u64) -> Self {
        Self {
            yaw,
            pitch,
            pts,
            ..Default::default()
        }
    }

    pub fn with_view_grid(mut self, h: u32, v: u32) -> Self {
        self.view_grid = Some((h, v));
        self
    }

    /// Whether yaw or pitch moved by more than `epsilon` degrees.
    pub fn differs_from(&self, other: &HeadPose, epsilon: f32) -> bool {
        wrap_degrees(self.yaw - other.yaw).abs() > epsilon
            || (self.pitch - other.pitch).abs() > epsilon
    }

    pub fn view_differs_from(&self, other: &HeadPose) -> bool {
        self.view_grid != other.view_grid
    }

    pub fn angle(&self) -> ViewportAngle {
        ViewportAngle {
            yaw: self.yaw,
            pitch: self.pitch,
            roll: self.roll.unwrap_or_default(),
            pts: self.pts,
            ..Default::default()
        }
    }
}

impl From<ViewportAngle> for HeadPose {
    fn from(angle: ViewportAngle) -> Self {
        Self {
            yaw: angle.yaw,
            pitch: angle.pitch,
            roll: Some(angle.roll),
            pts: angle.pts,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseRecord {
    pub pose: HeadPose,
    pub received_at: DateTime<Utc>,
}

/// Bounded, most-recent-first history of head poses.
pub struct PoseTracker {
    capacity: usize,
    history: Mutex<VecDeque<PoseRecord>>,
    predictor: Mutex<Option<Box<dyn ViewportPredictor>>>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PoseTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            history: Mutex::new(VecDeque::with_capacity(capacity + 1)),
            predictor: Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record_pose(&self, pose: HeadPose) {
        {
            let mut history = lock(&self.history);
            history.push_front(PoseRecord {
                pose,
                received_at: Utc::now(),
            });
            history.truncate(self.capacity);
        }

        if let Some(predictor) = lock(&self.predictor).as_mut() {
            if let Err(e) = predictor.set_viewport(pose.angle()) {
                tracing::warn!("Predictor {} rejected pose: {e}", predictor.name());
            }
        }
    }

    pub fn latest_pose(&self) -> Option<HeadPose> {
        lock(&self.history).front().map(|r| r.pose)
    }

    pub fn history_snapshot(&self) -> Vec<PoseRecord> {
        lock(&self.history).iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.history).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.history).is_empty()
    }

    /// Install a predictor, replaying the current history into it oldest first.
    pub fn install_predictor(
        &self,
        mut predictor: Box<dyn ViewportPredictor>,
        options: &PredictOptions,
    ) -> TilecastResult<()> {
        predictor.initialize(options)?;
        for record in self.history_snapshot().iter().rev() {
            predictor.set_viewport(record.pose.angle())?;
        }

        tracing::info!("Viewport prediction enabled with {}", predictor.name());
        let previous = lock(&self.predictor).replace(predictor);
        if let Some(mut previous) = previous {
            if let Err(e) = previous.destroy() {
                tracing::warn!("Failed to destroy predictor {}: {e}", previous.name());
            }
        }
        Ok(())
    }

    pub fn remove_predictor(&self) {
        if let Some(mut predictor) = lock(&self.predictor).take() {
            if let Err(e) = predictor.destroy() {
                tracing::warn!("Failed to destroy predictor {}: {e}", predictor.name());
            }
        }
    }

    pub fn has_predictor(&self) -> bool {
        lock(&self.predictor).is_some()
    }

    /// Ask the installed predictor for future angles.
    ///
    /// Returns `None` without a predictor, on failure, or for an empty prediction, so callers fall
    /// back to [`PoseTracker::latest_pose`].
    pub fn predict(&self, first_pts: u64) -> Option<Prediction> {
        let mut predictor = lock(&self.predictor);
        let predictor = predictor.as_mut()?;
        match predictor.predict(first_pts) {
            Ok(prediction) if !prediction.is_empty() => Some(prediction),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Prediction failed, using the latest pose instead: {e}");
                None
            }
        }
    }
}

impl Drop for PoseTracker {
    fn drop(&mut self) {
        self.remove_predictor();
    }
}
