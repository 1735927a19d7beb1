use bytes::Bytes;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tilecast::{
    adaptation::{AdaptationSet, AdaptationSetRegistry, Srd, TrackId},
    geometry::{
        ContentCoverage, ErpRegionMapper, ProjectionFormat, Region, RegionMapper, StreamGeometry,
        ViewportParams,
    },
    packet::{MediaPacket, PacketQueue},
    TilecastResult,
};

pub const WIDTH: u32 = 3840;
pub const HEIGHT: u32 = 1920;

/// Low quality tile ids start here.
pub const LOW_QUALITY_BASE: TrackId = 100;

/// [`ErpRegionMapper`] counting how often it maps a viewport.
pub struct CountingMapper {
    inner: ErpRegionMapper,
    processed: Arc<AtomicUsize>,
}

impl CountingMapper {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let processed = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner: ErpRegionMapper::new(),
                processed: processed.clone(),
            },
            processed,
        )
    }
}

impl RegionMapper for CountingMapper {
    fn configure(
        &mut self,
        geometry: &StreamGeometry,
        viewport: &ViewportParams,
    ) -> TilecastResult<()> {
        self.inner.configure(geometry, viewport)
    }

    fn set_viewport(&mut self, yaw: f32, pitch: f32, zoom: Option<f32>) -> TilecastResult<()> {
        self.inner.set_viewport(yaw, pitch, zoom)
    }

    fn process(&mut self) -> TilecastResult<()> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        self.inner.process()
    }

    fn covered_regions(&self) -> Vec<Region> {
        self.inner.covered_regions()
    }

    fn content_coverage(&self) -> Option<ContentCoverage> {
        self.inner.content_coverage()
    }
}

/// ERP tile grid, ids `1..` row by row. Optionally a 1x2 low quality layer.
pub fn erp_registry(rows: u32, cols: u32, low_quality: bool) -> AdaptationSetRegistry {
    let mut registry = AdaptationSetRegistry::new();
    let (width, height) = (WIDTH / cols, HEIGHT / rows);
    for row in 0..rows {
        for col in 0..cols {
            registry
                .add(AdaptationSet::new(
                    row * cols + col + 1,
                    Srd::new(col * width, row * height, width, height),
                    1,
                ))
                .unwrap();
        }
    }

    if low_quality {
        for col in 0..2 {
            registry
                .add(AdaptationSet::new(
                    LOW_QUALITY_BASE + col,
                    Srd::new(col * 960, 0, 960, 960),
                    2,
                ))
                .unwrap();
        }
    }
    registry
}

pub fn geometry(rows: u32, cols: u32) -> StreamGeometry {
    StreamGeometry {
        projection: ProjectionFormat::Erp,
        width: WIDTH,
        height: HEIGHT,
        tile_rows: rows,
        tile_cols: cols,
    }
}

pub fn viewport(horizontal_fov: f32, vertical_fov: f32) -> ViewportParams {
    ViewportParams {
        projection: ProjectionFormat::Erp,
        horizontal_fov,
        vertical_fov,
        viewport_width: 1920,
        viewport_height: 1080,
    }
}

/// Queue one packet per track and pts. The first packet of every track carries parameter sets.
pub fn feed(queue: &PacketQueue, tracks: &[TrackId], pts: std::ops::Range<u64>, samples: u64) {
    for pts in pts {
        for track in tracks {
            let mut packet = MediaPacket::new(*track, pts, Bytes::from(format!("{track}@{pts}")));
            packet.segment_id = pts / samples + 1;
            packet.key_frame = pts % samples == 0;
            if pts == 0 {
                packet.params = Some(Bytes::from(format!("params-{track}")));
            }
            queue.push(packet);
        }
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tilecast=debug")
        .with_test_writer()
        .try_init();
}
