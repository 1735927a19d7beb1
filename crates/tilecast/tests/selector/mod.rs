use std::{
    collections::BTreeSet,
    ops::RangeInclusive,
    sync::{atomic::Ordering, Arc},
};
use tilecast::{
    adaptation::{AdaptationSet, AdaptationSetRegistry, Srd},
    config::{LayoutSupplement, SelectorConfig, SelectorKind},
    geometry::{ContentCoverage, ErpRegionMapper},
    pose::{HeadPose, PoseTracker},
    predict::{PredictOptions, PredictionMode, PredictorLoader},
    selector::{
        build_selector, ExtractorSelector, SelectionContext, SelectionState, SelectorCore,
        TileSelector, TrackSelector,
    },
};

use crate::{
    common::{erp_registry, geometry, viewport, CountingMapper, LOW_QUALITY_BASE},
    AssertWrapper,
};

fn context(registry: &AdaptationSetRegistry) -> SelectionContext<'_> {
    SelectionContext {
        registry,
        segment_number: 1,
        predict_pts: 0,
    }
}

fn ids(range: RangeInclusive<u32>) -> BTreeSet<u32> {
    range.collect()
}

fn tile_selector(tracker: &Arc<PoseTracker>, rows: u32, cols: u32) -> TileSelector {
    let mut selector = TileSelector::new(
        SelectorCore::new(tracker.clone(), 1e-3),
        Box::new(ErpRegionMapper::new()),
    );
    selector
        .set_initial_viewport(&geometry(rows, cols), &viewport(90.0, 90.0))
        .assert_success();
    selector
}

#[test]
fn test_front_view_selects_both_tiles() {
    let registry = erp_registry(1, 2, false);
    let tracker = Arc::new(PoseTracker::new(10));
    let mut selector = tile_selector(&tracker, 1, 2);

    tracker.record_pose(HeadPose::new(0.0, 0.0, 0));
    let selection = selector.select(&context(&registry)).assert_success();
    assert_eq!(selection.tracks.ids(), BTreeSet::from([1, 2]));
    assert!(selection.extractor.is_none());
    assert_eq!(selector.state(), SelectionState::Selected);

    selector.mark_enabled();
    assert_eq!(selector.state(), SelectionState::Enabled);
}

#[test]
fn test_low_quality_layer_fills_the_sphere() {
    let registry = erp_registry(1, 2, true);
    let tracker = Arc::new(PoseTracker::new(10));
    let mut selector = tile_selector(&tracker, 1, 2);

    tracker.record_pose(HeadPose::new(0.0, 0.0, 0));
    let selection = selector.select(&context(&registry)).assert_success();
    assert_eq!(selection.tracks.highest_quality_count(), 2);
    assert!(selection.tracks.contains(LOW_QUALITY_BASE));
    assert!(selection.tracks.contains(LOW_QUALITY_BASE + 1));
}

#[test]
fn test_extractor_nearest_band() {
    // four 90° columns: [-180, -90), [-90, 0), [0, 90), [90, 180)
    let mut registry = erp_registry(1, 4, false);
    let band = |centre_azimuth| ContentCoverage {
        centre_azimuth,
        centre_elevation: 0.0,
        azimuth_range: 90.0,
        elevation_range: 180.0,
    };
    let front = registry
        .add_extractor(AdaptationSet::new(200, Srd::default(), 1), &[3], band(45.0))
        .assert_success();
    let right = registry
        .add_extractor(AdaptationSet::new(201, Srd::default(), 1), &[4], band(135.0))
        .assert_success();
    registry
        .add_extractor(AdaptationSet::new(202, Srd::default(), 1), &[1], band(-135.0))
        .assert_success();

    let tracker = Arc::new(PoseTracker::new(10));
    let mut selector = ExtractorSelector::new(
        SelectorCore::new(tracker.clone(), 1e-3),
        Box::new(ErpRegionMapper::new()),
    );
    selector
        .set_initial_viewport(&geometry(1, 4), &viewport(90.0, 90.0))
        .assert_success();

    tracker.record_pose(HeadPose::new(95.0, 0.0, 0));
    let selection = selector.select(&context(&registry)).assert_success();
    let extractor = selection.extractor.assert_success();
    assert_eq!(extractor.id(), right.id());
    assert_ne!(extractor.id(), front.id());
    assert_eq!(selection.tracks.ids(), BTreeSet::from([4, 201]));
}

#[test]
fn test_unchanged_pose_does_not_map_again() {
    let registry = erp_registry(4, 8, true);
    let tracker = Arc::new(PoseTracker::new(10));
    let (mapper, processed) = CountingMapper::new();
    let core = SelectorCore::new(tracker.clone(), 1e-3);
    let mut selector = TileSelector::new(core, Box::new(mapper));
    selector
        .set_initial_viewport(&geometry(4, 8), &viewport(90.0, 90.0))
        .assert_success();

    tracker.record_pose(HeadPose::new(30.0, 10.0, 0));
    let first = selector.select(&context(&registry)).assert_success();
    assert_eq!(processed.load(Ordering::SeqCst), 1);

    // below epsilon
    tracker.record_pose(HeadPose::new(30.0005, 10.0, 1));
    selector.select(&context(&registry)).assert_error();
    assert_eq!(processed.load(Ordering::SeqCst), 1);
    assert_eq!(selector.state(), SelectionState::Idle);

    tracker.record_pose(HeadPose::new(30.0, 10.0, 2));
    selector.select(&context(&registry)).assert_error();
    assert_eq!(processed.load(Ordering::SeqCst), 1);

    tracker.record_pose(HeadPose::new(120.0, 10.0, 3));
    let moved = selector.select(&context(&registry)).assert_success();
    assert_eq!(processed.load(Ordering::SeqCst), 2);
    assert_ne!(first.tracks, moved.tracks);
}

#[test]
fn test_failed_mapping_keeps_the_pose_pending() {
    let registry = erp_registry(1, 4, false);
    let tracker = Arc::new(PoseTracker::new(10));
    let (mapper, processed) = CountingMapper::new();
    let core = SelectorCore::new(tracker.clone(), 1e-3);
    let mut selector = TileSelector::new(core, Box::new(mapper));

    // mapper has no geometry yet
    tracker.record_pose(HeadPose::new(0.0, 0.0, 0));
    selector.select(&context(&registry)).assert_error();
    assert_eq!(processed.load(Ordering::SeqCst), 1);
    assert_eq!(selector.state(), SelectionState::Idle);

    selector
        .set_initial_viewport(&geometry(1, 4), &viewport(90.0, 90.0))
        .assert_success();
    let selection = selector.select(&context(&registry)).assert_success();
    assert_eq!(processed.load(Ordering::SeqCst), 2);
    assert_eq!(selection.tracks.ids(), ids(2..=3));
    assert_eq!(selector.state(), SelectionState::Selected);

    // the pose is consumed once it produced a selection
    selector.select(&context(&registry)).assert_error();
    assert_eq!(processed.load(Ordering::SeqCst), 2);
}

#[test]
fn test_empty_history_is_a_no_op() {
    let registry = erp_registry(2, 4, true);
    let tracker = Arc::new(PoseTracker::new(10));

    for kind in [SelectorKind::Extractor, SelectorKind::Tile, SelectorKind::View] {
        let config = SelectorConfig {
            kind,
            ..Default::default()
        };
        let mut selector = build_selector(
            &config,
            tracker.clone(),
            1e-3,
            Box::new(ErpRegionMapper::new()),
        );
        selector
            .set_initial_viewport(&geometry(2, 4), &viewport(90.0, 90.0))
            .assert_success();

        selector.select(&context(&registry)).assert_error();
        assert_eq!(selector.state(), SelectionState::Idle);
    }
}

fn is_prime(n: usize) -> bool {
    n >= 2 && (2..n).all(|d| n % d != 0)
}

#[test]
fn test_prime_tile_counts_are_supplemented() {
    let registry = erp_registry(4, 8, false);
    // 160° wide and 10° high: one row of five tiles at the row centre
    let wide = viewport(160.0, 10.0);

    for supplement in [LayoutSupplement::PrimeAboveFour, LayoutSupplement::Disabled] {
        let tracker = Arc::new(PoseTracker::new(10));
        let mut selector = TileSelector::new(
            SelectorCore::new(tracker.clone(), 1e-3),
            Box::new(ErpRegionMapper::new()),
        )
        .layout_supplement(supplement);
        selector
            .set_initial_viewport(&geometry(4, 8), &wide)
            .assert_success();

        tracker.record_pose(HeadPose::new(22.5, 22.5, 0));
        let selection = selector.select(&context(&registry)).assert_success();
        match supplement {
            LayoutSupplement::PrimeAboveFour => assert_eq!(selection.tracks.len(), 6),
            LayoutSupplement::Disabled => assert_eq!(selection.tracks.len(), 5),
        }
    }

    let tracker = Arc::new(PoseTracker::new(10));
    let mut selector = TileSelector::new(
        SelectorCore::new(tracker.clone(), 1e-3),
        Box::new(ErpRegionMapper::new()),
    );
    selector
        .set_initial_viewport(&geometry(4, 8), &wide)
        .assert_success();
    for step in 0..96u64 {
        let yaw = -180.0 + step as f32 * 3.75;
        let pitch = (step % 9) as f32 * 10.0 - 40.0;
        tracker.record_pose(HeadPose::new(yaw, pitch, step));
        if let Some(selection) = selector.select(&context(&registry)) {
            let count = selection.tracks.highest_quality_count();
            assert!(count <= 4 || !is_prime(count), "{count} tiles at ({yaw}, {pitch})");
        }
    }
}

#[test]
fn test_small_layouts_are_never_supplemented() {
    let registry = erp_registry(4, 8, false);
    let tracker = Arc::new(PoseTracker::new(10));
    let mut selector = tile_selector(&tracker, 4, 8);

    // 2 x 2 tiles around the front
    tracker.record_pose(HeadPose::new(0.0, 0.0, 0));
    assert_eq!(selector.select(&context(&registry)).assert_success().tracks.len(), 4);

    let mut narrow = TileSelector::new(
        SelectorCore::new(tracker.clone(), 1e-3),
        Box::new(ErpRegionMapper::new()),
    );
    narrow
        .set_initial_viewport(&geometry(4, 8), &viewport(40.0, 90.0))
        .assert_success();

    // one column, three rows
    tracker.record_pose(HeadPose::new(22.5, 22.5, 1));
    assert_eq!(narrow.select(&context(&registry)).assert_success().tracks.len(), 3);

    // one column, two rows
    tracker.record_pose(HeadPose::new(22.5, 0.0, 2));
    assert_eq!(narrow.select(&context(&registry)).assert_success().tracks.len(), 2);
}

#[test]
fn test_multi_viewpoint_prediction_merges_candidates() -> anyhow::Result<()> {
    let registry = erp_registry(1, 8, false);
    let tracker = Arc::new(PoseTracker::new(10));
    tracker.install_predictor(
        PredictorLoader::new().load("linear", None)?,
        &PredictOptions {
            mode: PredictionMode::MultiViewpoints,
            offsets: vec![0, 30],
            ..Default::default()
        },
    )?;

    let mut selector = tile_selector(&tracker, 1, 8);
    tracker.record_pose(HeadPose::new(0.0, 0.0, 0));
    tracker.record_pose(HeadPose::new(2.0, 0.0, 1));

    // fast head turn: the later candidate lands further right
    let selection = selector
        .select(&SelectionContext {
            registry: &registry,
            segment_number: 2,
            predict_pts: 30,
        })
        .assert_success();
    assert!(selection.tracks.len() > 2);

    let mut capped = TileSelector::new(
        SelectorCore::new(tracker.clone(), 1e-3),
        Box::new(ErpRegionMapper::new()),
    )
    .max_tracks(3);
    capped.set_initial_viewport(&geometry(1, 8), &viewport(90.0, 90.0))?;
    let selection = capped
        .select(&SelectionContext {
            registry: &registry,
            segment_number: 2,
            predict_pts: 30,
        })
        .assert_success();
    assert_eq!(selection.tracks.len(), 3);
    Ok(())
}

#[test]
fn test_view_window_follows_camera() {
    let mut registry = AdaptationSetRegistry::new();
    for h in 0..10 {
        registry
            .add(AdaptationSet::new(h + 1, Srd::new(0, 0, 1920, 1080), 1).with_view(h, 0))
            .assert_success();
    }
    let tracker = Arc::new(PoseTracker::new(10));
    let mut selector = build_selector(
        &SelectorConfig {
            kind: SelectorKind::View,
            ..Default::default()
        },
        tracker.clone(),
        1e-3,
        Box::new(ErpRegionMapper::new()),
    );

    tracker.record_pose(HeadPose::new(0.0, 0.0, 0).with_view_grid(9, 0));
    let selection = selector.select(&context(&registry)).assert_success();
    assert_eq!(selection.tracks.ids(), ids(5..=10));

    // same camera, different angle
    tracker.record_pose(HeadPose::new(40.0, 0.0, 1).with_view_grid(9, 0));
    selector.select(&context(&registry)).assert_error();

    tracker.record_pose(HeadPose::new(40.0, 0.0, 2).with_view_grid(1, 0));
    let selection = selector.select(&context(&registry)).assert_success();
    assert_eq!(selection.tracks.ids(), ids(1..=6));
}

#[test]
fn test_view_auto_mode_sweeps_groups() {
    let mut registry = AdaptationSetRegistry::new();
    for h in 0..6 {
        registry
            .add(AdaptationSet::new(h + 1, Srd::new(0, 0, 1920, 1080), 1).with_view(h, 0))
            .assert_success();
    }
    let tracker = Arc::new(PoseTracker::new(10));
    let mut selector = build_selector(
        &SelectorConfig {
            kind: SelectorKind::View,
            view_auto_mode: true,
            view_window: 3,
            view_group_count: 2,
            ..Default::default()
        },
        tracker,
        1e-3,
        Box::new(ErpRegionMapper::new()),
    );

    let select = |selector: &mut Box<dyn TrackSelector>, segment_number| {
        selector.select(&SelectionContext {
            registry: &registry,
            segment_number,
            predict_pts: 0,
        })
    };
    assert_eq!(select(&mut selector, 1).assert_success().tracks.ids(), ids(1..=3));
    assert_eq!(select(&mut selector, 2).assert_success().tracks.ids(), ids(4..=6));
    // sweeping back stays on the same group for one more segment
    select(&mut selector, 3).assert_error();
    assert_eq!(select(&mut selector, 4).assert_success().tracks.ids(), ids(1..=3));
}
