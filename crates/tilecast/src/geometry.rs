//! Viewport geometry seen by the selectors.
//!
//! Mapping a viewport onto projected regions is delegated to a [`RegionMapper`]. The crate ships
//! [`ErpRegionMapper`] for equirectangular tile grids. Other projections plug in their own mapper.

use serde::{Deserialize, Serialize};
use tilecast_predict::wrap_degrees;

use crate::{
    adaptation::HIGHEST_QUALITY_RANKING,
    error::{TilecastError, TilecastResult},
};

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionFormat {
    #[default]
    Erp,
    Cubemap,
    Planar,
}

impl ProjectionFormat {
    /// Whether a decoded picture must cover the whole sphere.
    pub fn requires_full_sphere(&self) -> bool {
        matches!(self, ProjectionFormat::Erp | ProjectionFormat::Cubemap)
    }
}

/// A rectangular tile of the projected picture.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub face_id: Option<u32>,
    pub stream_id: Option<u32>,
    pub quality_ranking: u32,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq)]
pub struct ContentCoverage {
    pub centre_azimuth: f32,
    pub centre_elevation: f32,
    pub azimuth_range: f32,
    pub elevation_range: f32,
}

impl ContentCoverage {
    /// Euclidean distance between two centres with azimuth wrapped across the ±180° seam.
    pub fn centre_distance(&self, other: &ContentCoverage) -> f32 {
        let azimuth = wrap_degrees(self.centre_azimuth - other.centre_azimuth);
        let elevation = self.centre_elevation - other.centre_elevation;
        azimuth.hypot(elevation)
    }
}

/// Viewer side parameters, set once before the first selection.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq)]
pub struct ViewportParams {
    pub projection: ProjectionFormat,
    pub horizontal_fov: f32,
    pub vertical_fov: f32,
    pub viewport_width: u32,
    pub viewport_height: u32,
}

impl ViewportParams {
    pub fn validate(&self) -> TilecastResult<()> {
        if self.viewport_width == 0 || self.viewport_height == 0 {
            return Err(TilecastError::InvalidViewport(format!(
                "viewport size {}x{} is empty",
                self.viewport_width, self.viewport_height
            )));
        }
        if self.projection != ProjectionFormat::Planar
            && (self.horizontal_fov <= 0.0 || self.vertical_fov <= 0.0)
        {
            return Err(TilecastError::InvalidViewport(format!(
                "field of view {}x{} must be positive",
                self.horizontal_fov, self.vertical_fov
            )));
        }
        Ok(())
    }
}

/// Stream side geometry of the highest quality layer.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamGeometry {
    pub projection: ProjectionFormat,
    pub width: u32,
    pub height: u32,
    pub tile_rows: u32,
    pub tile_cols: u32,
}

pub trait RegionMapper: Send {
    fn configure(
        &mut self,
        geometry: &StreamGeometry,
        viewport: &ViewportParams,
    ) -> TilecastResult<()>;

    fn set_viewport(&mut self, yaw: f32, pitch: f32, zoom: Option<f32>) -> TilecastResult<()>;

    /// Recompute covered regions for the last viewport.
    fn process(&mut self) -> TilecastResult<()>;

    fn covered_regions(&self) -> Vec<Region>;

    fn content_coverage(&self) -> Option<ContentCoverage>;
}

impl<M: RegionMapper + ?Sized> RegionMapper for Box<M> {
    fn configure(
        &mut self,
        geometry: &StreamGeometry,
        viewport: &ViewportParams,
    ) -> TilecastResult<()> {
        (**self).configure(geometry, viewport)
    }

    fn set_viewport(&mut self, yaw: f32, pitch: f32, zoom: Option<f32>) -> TilecastResult<()> {
        (**self).set_viewport(yaw, pitch, zoom)
    }

    fn process(&mut self) -> TilecastResult<()> {
        (**self).process()
    }

    fn covered_regions(&self) -> Vec<Region> {
        (**self).covered_regions()
    }

    fn content_coverage(&self) -> Option<ContentCoverage> {
        (**self).content_coverage()
    }
}

#[derive(Debug, Default)]
pub struct ErpRegionMapper {
    geometry: Option<StreamGeometry>,
    viewport: ViewportParams,

    yaw: f32,
    pitch: f32,
    zoom: f32,

    regions: Vec<Region>,
    coverage: Option<ContentCoverage>,
}

impl ErpRegionMapper {
    pub fn new() -> Self {
        Self::default()
    }

    fn field_of_view(&self) -> (f32, f32) {
        let zoom = if self.zoom > 0.0 { self.zoom } else { 1.0 };
        (
            (self.viewport.horizontal_fov / zoom).min(360.0),
            (self.viewport.vertical_fov / zoom).min(180.0),
        )
    }
}

impl RegionMapper for ErpRegionMapper {
    fn configure(
        &mut self,
        geometry: &StreamGeometry,
        viewport: &ViewportParams,
    ) -> TilecastResult<()> {
        if geometry.projection != ProjectionFormat::Erp {
            return Err(TilecastError::MapperError(format!(
                "{:?} projection is not equirectangular",
                geometry.projection
            )));
        }
        if geometry.tile_rows == 0 || geometry.tile_cols == 0 {
            return Err(TilecastError::MapperError("empty tile grid".to_string()));
        }
        viewport.validate()?;

        self.geometry = Some(*geometry);
        self.viewport = *viewport;
        self.regions.clear();
        self.coverage = None;
        Ok(())
    }

    fn set_viewport(&mut self, yaw: f32, pitch: f32, zoom: Option<f32>) -> TilecastResult<()> {
        if !yaw.is_finite() || !pitch.is_finite() {
            return Err(TilecastError::MapperError(format!(
                "invalid viewport angle ({yaw}, {pitch})"
            )));
        }
        self.yaw = wrap_degrees(yaw);
        self.pitch = pitch.clamp(-90.0, 90.0);
        self.zoom = zoom.unwrap_or(1.0);
        Ok(())
    }

    fn process(&mut self) -> TilecastResult<()> {
        let geometry = self.geometry.ok_or(TilecastError::MapperNotConfigured)?;
        let (hfov, vfov) = self.field_of_view();

        let tile_width = geometry.width / geometry.tile_cols;
        let tile_height = geometry.height / geometry.tile_rows;
        let col_span = 360.0 / geometry.tile_cols as f32;
        let row_span = 180.0 / geometry.tile_rows as f32;

        let top = (self.pitch + vfov / 2.0).min(90.0);
        let bottom = (self.pitch - vfov / 2.0).max(-90.0);

        self.regions.clear();
        for row in 0..geometry.tile_rows {
            let row_top = 90.0 - row as f32 * row_span;
            let row_bottom = row_top - row_span;
            if row_bottom >= top || row_top <= bottom {
                continue;
            }

            for col in 0..geometry.tile_cols {
                let centre = -180.0 + (col as f32 + 0.5) * col_span;
                let distance = wrap_degrees(centre - self.yaw).abs();
                if hfov < 360.0 && distance >= (hfov + col_span) / 2.0 {
                    continue;
                }

                self.regions.push(Region {
                    x: col * tile_width,
                    y: row * tile_height,
                    width: tile_width,
                    height: tile_height,
                    face_id: None,
                    stream_id: None,
                    quality_ranking: HIGHEST_QUALITY_RANKING,
                });
            }
        }

        self.coverage = Some(ContentCoverage {
            centre_azimuth: self.yaw,
            centre_elevation: self.pitch,
            azimuth_range: hfov,
            elevation_range: vfov,
        });
        Ok(())
    }

    fn covered_regions(&self) -> Vec<Region> {
        self.regions.clone()
    }

    fn content_coverage(&self) -> Option<ContentCoverage> {
        self.coverage
    }
}
