//! Analysis session lifecycle tests

use pretty_assertions::assert_eq;
use resdet::{ErrorKind, ParameterOverrides, Resdet};

const CHECKERBOARD: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
const STRIPES: [f32; 4] = [0.0, 1.0, 0.0, 1.0];
const FLAT: [f32; 4] = [0.0; 4];

#[test]
fn test_session_matches_one_shot() {
    let resdet = Resdet::in_memory();
    let once = resdet
        .detect(&CHECKERBOARD, 1, 2, 2, None, &ParameterOverrides::new())
        .unwrap();

    let mut analysis = resdet.analysis(2, 2, None, &ParameterOverrides::new()).unwrap();
    analysis.analyze_image(&CHECKERBOARD).unwrap();
    assert_eq!(analysis.results().unwrap(), once);
    analysis.destroy().unwrap();

    assert_eq!(resdet.engine().outstanding_allocations(), 0);
}

#[test]
fn test_session_matches_one_shot_with_parameters() {
    let resdet = Resdet::in_memory();
    let overrides = ParameterOverrides::new()
        .with_range(1)
        .with_threshold(0.0)
        .with_compression_filter(4);
    let once = resdet.detect(&STRIPES, 1, 4, 1, None, &overrides).unwrap();

    let mut analysis = resdet.analysis(4, 1, None, &overrides).unwrap();
    analysis.analyze_image(&STRIPES).unwrap();
    assert_eq!(analysis.results().unwrap(), once);
}

#[test]
fn test_evidence_accumulates_across_feeds() {
    let resdet = Resdet::in_memory();
    let overrides = ParameterOverrides::new().with_range(1).with_threshold(0.6);
    let mut analysis = resdet.analysis(4, 1, None, &overrides).unwrap();

    analysis.analyze_image(&STRIPES).unwrap();
    assert_eq!(analysis.results().unwrap().widths.len(), 3);

    analysis.analyze_image(&FLAT).unwrap();
    assert_eq!(analysis.results().unwrap().widths.len(), 1);
    assert_eq!(analysis.images_analyzed(), 2);
}

#[test]
fn test_results_before_any_image() {
    let resdet = Resdet::in_memory();
    let mut analysis = resdet.analysis(2, 2, None, &ParameterOverrides::new()).unwrap();
    let err = analysis.results().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoImagesAnalyzed);
}

#[test]
fn test_destroy_twice() {
    let resdet = Resdet::in_memory();
    let mut analysis = resdet.analysis(2, 2, None, &ParameterOverrides::new()).unwrap();
    analysis.destroy().unwrap();
    analysis.destroy().unwrap();
    drop(analysis);

    let engine = resdet.engine();
    assert_eq!(engine.destroyed_analyses(), 1);
    assert_eq!(engine.invalid_destroys(), 0);
    assert_eq!(engine.heap().stats().invalid_releases, 0);
}

#[test]
fn test_drop_without_destroy_reclaims() {
    let resdet = Resdet::in_memory();
    {
        let mut analysis = resdet.analysis(2, 2, None, &ParameterOverrides::new()).unwrap();
        analysis.analyze_image(&CHECKERBOARD).unwrap();
    }
    assert_eq!(resdet.engine().live_analyses(), 0);
    assert_eq!(resdet.engine().outstanding_allocations(), 0);
}

#[test]
fn test_create_failures() {
    let resdet = Resdet::in_memory();

    let err = resdet
        .analysis(0, 0, None, &ParameterOverrides::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidImage);

    let err = resdet
        .analysis(2, 2, None, &ParameterOverrides::new().with_range(0))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameter);

    let err = resdet
        .analysis(u32::MAX, u32::MAX, None, &ParameterOverrides::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineFailure);
    assert_eq!(err.to_string(), "Image size exceeds limit");

    assert_eq!(resdet.engine().live_analyses(), 0);
    assert_eq!(resdet.engine().outstanding_allocations(), 0);
}

#[test]
fn test_out_of_memory_during_session_leaks_nothing() {
    let resdet = Resdet::in_memory();
    let overrides = ParameterOverrides::new().with_range(1).with_threshold(0.0);
    let engine = resdet.engine();
    let heap = engine.heap();

    let mut succeeded = false;
    for budget in 0..32 {
        heap.fail_allocations_after(Some(budget));
        let result = resdet.analysis(4, 1, None, &overrides).and_then(|mut analysis| {
            analysis.analyze_image(&STRIPES)?;
            let results = analysis.results()?;
            analysis.destroy()?;
            Ok(results)
        });
        heap.fail_allocations_after(None);

        assert_eq!(engine.outstanding_allocations(), 0, "budget {budget}");
        assert_eq!(engine.live_analyses(), 0);
        assert_eq!(heap.stats().invalid_releases, 0);

        match result {
            Ok(results) => {
                assert_eq!(results.widths.len(), 3);
                succeeded = true;
                break;
            }
            Err(err) => assert_eq!(err.kind(), ErrorKind::OutOfMemory, "budget {budget}"),
        }
    }
    assert!(succeeded);
}

#[test]
fn test_buffer_feed_matches_copied_feed() {
    let resdet = Resdet::in_memory();
    let defaults = ParameterOverrides::new();
    let buffer = resdet.image_buffer(2, 2).unwrap();

    let mut copied = resdet.analysis(2, 2, None, &defaults).unwrap();
    let mut buffered = resdet.analysis(2, 2, None, &defaults).unwrap();
    for frame in [CHECKERBOARD, FLAT, CHECKERBOARD] {
        copied.analyze_image(&frame).unwrap();

        buffer.write(&frame).unwrap();
        let before = resdet.engine().heap().stats().allocations;
        buffered.analyze_buffer(&buffer).unwrap();
        assert_eq!(resdet.engine().heap().stats().allocations, before);
    }

    assert_eq!(buffered.images_analyzed(), 3);
    assert_eq!(buffered.results().unwrap(), copied.results().unwrap());
    copied.destroy().unwrap();
    buffered.destroy().unwrap();

    buffer.release();
    assert_eq!(resdet.engine().outstanding_allocations(), 0);
}

#[test]
fn test_undersized_buffer_is_invalid_image() {
    let resdet = Resdet::in_memory();
    let buffer = resdet.image_buffer(2, 1).unwrap();
    let mut analysis = resdet.analysis(2, 2, None, &ParameterOverrides::new()).unwrap();

    let err = analysis.analyze_buffer(&buffer).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidImage);
    assert_eq!(analysis.images_analyzed(), 0);

    analysis.destroy().unwrap();
    let err = analysis.analyze_buffer(&buffer).unwrap_err();
    assert_eq!(err.to_string(), "analysis has been destroyed");
}
