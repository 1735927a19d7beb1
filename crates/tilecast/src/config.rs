use serde::{Deserialize, Serialize};
use std::{num::NonZeroU32, path::Path, time::Duration};
use tilecast_predict::PredictOptions;

use crate::error::TilecastResult;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Number of head poses kept by the tracker
    pub pose_history_capacity: usize,
    /// Minimal yaw/pitch delta, in degrees, that starts a new selection cycle
    pub pose_epsilon: f32,

    pub selector: SelectorConfig,
    pub stitch: StitchConfig,
    pub catchup: CatchupConfig,
    pub prediction: Option<PredictionConfig>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            pose_history_capacity: 10,
            pose_epsilon: 1e-3,
            selector: Default::default(),
            stitch: Default::default(),
            catchup: Default::default(),
            prediction: None,
        }
    }
}

impl StreamConfig {
    pub fn from_json(data: &str) -> TilecastResult<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> TilecastResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    Extractor,
    #[default]
    Tile,
    View,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LayoutSupplement {
    Disabled,
    /// Add one highest-quality tile when the covered tile count is a prime above four
    #[default]
    PrimeAboveFour,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SelectorConfig {
    pub kind: SelectorKind,
    /// Cap on highest-quality tiles after merging predicted candidates, `0` for unlimited
    pub max_tracks: usize,
    pub layout_supplement: LayoutSupplement,

    /// Number of cameras selected around the viewer
    pub view_window: usize,
    /// Number of horizontal cameras, derived from the registry when `0`
    pub camera_count: usize,
    pub view_auto_mode: bool,
    pub view_group_count: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            kind: SelectorKind::default(),
            max_tracks: 0,
            layout_supplement: LayoutSupplement::default(),
            view_window: 6,
            camera_count: 0,
            view_auto_mode: false,
            view_group_count: 2,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StitchConfig {
    pub poll_interval_ms: u64,
    pub max_wait_retries: u32,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1,
            max_wait_retries: 1000,
        }
    }
}

impl StitchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CatchupConfig {
    pub workers: NonZeroU32,
    pub queue_capacity: usize,
    /// Times a stale task is put back before it is dropped
    pub max_stale_retries: u32,
    /// Frames that must pass between two catch-up triggers
    pub min_trigger_interval: u64,
    /// Frames before a segment end under which a change is caught up in the following segment
    pub segment_tail_threshold: u64,
}

impl Default for CatchupConfig {
    fn default() -> Self {
        Self {
            workers: NonZeroU32::new(2).unwrap_or(NonZeroU32::MIN),
            queue_capacity: 16,
            max_stale_retries: 3,
            min_trigger_interval: 5,
            segment_tail_threshold: 10,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PredictionConfig {
    pub plugin_name: String,
    pub lib_path: Option<std::path::PathBuf>,
    pub options: PredictOptions,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            plugin_name: "linear".to_string(),
            lib_path: None,
            options: PredictOptions::default(),
        }
    }
}
