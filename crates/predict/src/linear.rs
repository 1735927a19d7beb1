use crate::{
    wrap_degrees, PredictOptions, PredictResult, Prediction, PredictionMode, ViewportAngle,
    ViewportPredictor, ViewportPriority,
};

const DEFAULT_SMOOTHING: f32 = 0.5;

/// Extrapolates the last recorded pose with an exponentially smoothed angular velocity.
///
/// Velocities are kept in degrees per pts unit.
pub struct LinearPredictor {
    options: PredictOptions,
    smoothing: f32,

    last: Option<ViewportAngle>,
    yaw_velocity: f32,
    pitch_velocity: f32,
}

impl LinearPredictor {
    pub const NAME: &'static str = "linear";

    pub fn new() -> Self {
        Self {
            options: PredictOptions::default(),
            smoothing: DEFAULT_SMOOTHING,
            last: None,
            yaw_velocity: 0.0,
            pitch_velocity: 0.0,
        }
    }

    /// Weight of the newest velocity sample, clamped into `(0, 1]`.
    pub fn smoothing(mut self, smoothing: f32) -> Self {
        self.smoothing = smoothing.clamp(f32::EPSILON, 1.0);
        self
    }

    fn extrapolate(&self, last: &ViewportAngle, pts: u64) -> ViewportAngle {
        let elapsed = pts.saturating_sub(last.pts) as f32;
        ViewportAngle {
            yaw: wrap_degrees(last.yaw + self.yaw_velocity * elapsed),
            pitch: (last.pitch + self.pitch_velocity * elapsed).clamp(-90.0, 90.0),
            roll: last.roll,
            pts,
            priority: ViewportPriority::High,
        }
    }
}

impl Default for LinearPredictor {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewportPredictor for LinearPredictor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn initialize(&mut self, options: &PredictOptions) -> PredictResult<()> {
        self.options = options.clone();
        self.last = None;
        self.yaw_velocity = 0.0;
        self.pitch_velocity = 0.0;
        Ok(())
    }

    fn set_viewport(&mut self, angle: ViewportAngle) -> PredictResult<()> {
        if let Some(last) = self.last {
            if angle.pts > last.pts {
                let elapsed = (angle.pts - last.pts) as f32;
                let yaw = wrap_degrees(angle.yaw - last.yaw) / elapsed;
                let pitch = (angle.pitch - last.pitch) / elapsed;

                self.yaw_velocity =
                    self.smoothing * yaw + (1.0 - self.smoothing) * self.yaw_velocity;
                self.pitch_velocity =
                    self.smoothing * pitch + (1.0 - self.smoothing) * self.pitch_velocity;
            } else if angle.pts < last.pts {
                // out of order, keep the newer sample
                return Ok(());
            }
        }
        self.last = Some(angle);
        Ok(())
    }

    fn predict(&mut self, first_pts: u64) -> PredictResult<Prediction> {
        let Some(last) = self.last else {
            return Ok(Prediction::default());
        };

        let speed = self.yaw_velocity.hypot(self.pitch_velocity);
        let mut prediction = Prediction {
            halting_probability: 1.0 / (1.0 + speed),
            ..Default::default()
        };

        match self.options.mode {
            PredictionMode::SingleViewpoint => {
                let angle = self.extrapolate(&last, first_pts);
                prediction.angles.insert(angle.pts, angle);
            }
            PredictionMode::MultiViewpoints => {
                for (index, offset) in self.options.offsets.iter().enumerate() {
                    let mut angle = self.extrapolate(&last, first_pts + offset);
                    if index > 0 {
                        angle.priority = ViewportPriority::Low;
                    }
                    prediction.angles.insert(angle.pts, angle);
                }
            }
        }

        Ok(prediction)
    }
}
