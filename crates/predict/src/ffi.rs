//! C ABI exposed by predictor shared libraries.
//!
//! A plugin exports the four symbols below. Every call except `Init` returns `0` on success.

use crate::{PredictOptions, PredictionMode, ViewportAngle, ViewportPriority};
use std::ffi::c_void;

pub const SYMBOL_INIT: &[u8] = b"ViewportPredict_Init\0";
pub const SYMBOL_SET_VIEWPORT: &[u8] = b"ViewportPredict_SetViewport\0";
pub const SYMBOL_PREDICT_POSE: &[u8] = b"ViewportPredict_PredictPose\0";
pub const SYMBOL_DESTROY: &[u8] = b"ViewportPredict_unInit\0";

pub const STATUS_OK: i32 = 0;

/// Capacity of the output buffer handed to `PredictPose`.
pub const MAX_PREDICTED_ANGLES: usize = 16;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RawViewportAngle {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    pub pts: u64,
    pub priority: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RawPredictOption {
    /// 0 for single viewpoint, 1 for multiple viewpoints
    pub mode: i32,
    pub using_feedback_angle_adjust: bool,
}

pub type InitFn = unsafe extern "C" fn(option: *const RawPredictOption) -> *mut c_void;
pub type SetViewportFn =
    unsafe extern "C" fn(handle: *mut c_void, angle: *const RawViewportAngle) -> i32;
pub type PredictPoseFn = unsafe extern "C" fn(
    handle: *mut c_void,
    first_pts: u64,
    out_angles: *mut RawViewportAngle,
    capacity: usize,
    out_len: *mut usize,
    halting_probability: *mut f32,
) -> i32;
pub type DestroyFn = unsafe extern "C" fn(handle: *mut c_void) -> i32;

impl From<ViewportAngle> for RawViewportAngle {
    fn from(angle: ViewportAngle) -> Self {
        Self {
            yaw: angle.yaw,
            pitch: angle.pitch,
            roll: angle.roll,
            pts: angle.pts,
            priority: angle.priority as i32,
        }
    }
}

impl From<RawViewportAngle> for ViewportAngle {
    fn from(raw: RawViewportAngle) -> Self {
        Self {
            yaw: raw.yaw,
            pitch: raw.pitch,
            roll: raw.roll,
            pts: raw.pts,
            priority: if raw.priority == 0 {
                ViewportPriority::High
            } else {
                ViewportPriority::Low
            },
        }
    }
}

impl From<&PredictOptions> for RawPredictOption {
    fn from(options: &PredictOptions) -> Self {
        Self {
            mode: match options.mode {
                PredictionMode::SingleViewpoint => 0,
                PredictionMode::MultiViewpoints => 1,
            },
            using_feedback_angle_adjust: options.feedback_angle_adjust,
        }
    }
}
