use serde::{Deserialize, Serialize};
use std::path::Path;
use tilecast::{
    adaptation::{AdaptationSet, AdaptationSetRegistry, Srd},
    config::StreamConfig,
    geometry::{ProjectionFormat, ViewportParams},
    StreamInfo,
};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ReplayConfig {
    pub stream: StreamConfig,
    pub info: StreamInfo,
    pub viewport: ViewportParams,
    pub grid: GridConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            info: StreamInfo {
                frame_rate: 30,
                segment_duration_ms: 1000,
                gop_size: 30,
            },
            viewport: ViewportParams {
                projection: ProjectionFormat::Erp,
                horizontal_fov: 90.0,
                vertical_fov: 90.0,
                viewport_width: 1920,
                viewport_height: 1080,
            },
            grid: GridConfig::default(),
        }
    }
}

impl ReplayConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config = toml::from_str(&data)?;
        Ok(config)
    }
}

/// Synthetic ERP picture split into a grid of highest quality tiles.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GridConfig {
    pub width: u32,
    pub height: u32,
    pub rows: u32,
    pub cols: u32,
    /// Add a 1x2 low quality layer covering the whole sphere
    pub low_quality: bool,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            width: 3840,
            height: 1920,
            rows: 4,
            cols: 8,
            low_quality: true,
        }
    }
}

/// First track id of the low quality layer.
pub const LOW_QUALITY_BASE: u32 = 1000;

impl GridConfig {
    pub fn registry(&self) -> anyhow::Result<AdaptationSetRegistry> {
        anyhow::ensure!(self.rows > 0 && self.cols > 0, "tile grid must not be empty");

        let mut registry = AdaptationSetRegistry::new();
        let (width, height) = (self.width / self.cols, self.height / self.rows);
        for row in 0..self.rows {
            for col in 0..self.cols {
                registry.add(AdaptationSet::new(
                    row * self.cols + col + 1,
                    Srd::new(col * width, row * height, width, height),
                    1,
                ))?;
            }
        }

        if self.low_quality {
            let (width, height) = (self.width / 4, self.height / 2);
            for col in 0..2 {
                registry.add(AdaptationSet::new(
                    LOW_QUALITY_BASE + col,
                    Srd::new(col * width, 0, width, height),
                    2,
                ))?;
            }
        }
        Ok(registry)
    }
}
