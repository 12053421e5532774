mod common;

use common::{png_bytes, Harness, RecordingTarget, Results, TargetEvent, WAIT};
use image_loader_core::{
    LifecycleScope, LoadError, LoadOrigin, LoadRequest, PooledBuffer, PressureLevel, ResourceId,
    TransformOutput, Transformation, TransportError,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const URL: &str = "https://images.example.com/cat.png";

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

fn origin(result: &image_loader_core::LoadResult<image_loader_core::LoadedImage>) -> LoadOrigin {
    result.as_ref().expect("load should succeed").origin
}

#[test]
fn second_request_is_served_from_memory() {
    let harness = Harness::new();
    harness.transport.serve(URL, Ok(png_bytes(64, 48, [1, 2, 3, 255])));
    let results = Results::default();

    harness
        .engine
        .load(LoadRequest::builder(URL).callback(results.sink()).build());
    harness.wait_for(&results, 1);

    harness
        .engine
        .load(LoadRequest::builder(URL).callback(results.sink()).build());
    harness.wait_for(&results, 2);

    let results = results.take();
    assert_eq!(origin(&results[0]), LoadOrigin::Source);
    assert_eq!(origin(&results[1]), LoadOrigin::Memory);
    assert_eq!(harness.transport.calls(), 1);

    let first = results[0].as_ref().unwrap();
    let second = results[1].as_ref().unwrap();
    assert!(Arc::ptr_eq(&first.buffer, &second.buffer));
}

#[test]
fn memory_hit_is_delivered_on_the_dispatcher() {
    let harness = Harness::new();
    harness.transport.serve(URL, Ok(png_bytes(8, 8, [0, 0, 0, 255])));
    let results = Results::default();
    harness
        .engine
        .load(LoadRequest::builder(URL).callback(results.sink()).build());
    harness.wait_for(&results, 1);

    let target = Arc::new(RecordingTarget::default());
    harness.engine.load(
        LoadRequest::builder(URL)
            .target(target.clone())
            .placeholder(3)
            .build(),
    );

    // Placeholder is synchronous; the image waits for the delivery context
    assert_eq!(target.events(), vec![TargetEvent::Placeholder(3)]);
    assert_eq!(harness.dispatcher.run_pending(), 1);
    assert_eq!(
        target.events(),
        vec![TargetEvent::Placeholder(3), TargetEvent::Image(8, 8)]
    );
}

#[test]
fn disk_cache_serves_after_memory_is_cleared() {
    let harness = Harness::new();
    harness.transport.serve(URL, Ok(png_bytes(32, 32, [200, 100, 50, 255])));
    let results = Results::default();

    let handle = harness
        .engine
        .load(LoadRequest::builder(URL).callback(results.sink()).build());
    harness.wait_for(&results, 1);
    assert!(harness.engine.disk_cache().contains(handle.key()));

    harness.engine.memory_cache().clear();
    harness
        .engine
        .load(LoadRequest::builder(URL).callback(results.sink()).build());
    harness.wait_for(&results, 2);

    let results = results.take();
    assert_eq!(origin(&results[1]), LoadOrigin::Disk);
    assert_eq!(harness.transport.calls(), 1);
    assert_eq!(
        &results[1].as_ref().unwrap().buffer.pixels()[..4],
        &[200, 100, 50, 255]
    );
    assert!(harness.engine.memory_cache().contains(handle.key()));
}

#[test]
fn skip_flags_bypass_both_caches() {
    let harness = Harness::new();
    harness.transport.serve(URL, Ok(png_bytes(16, 16, [9, 9, 9, 255])));
    let results = Results::default();

    let request = || {
        LoadRequest::builder(URL)
            .skip_memory_cache()
            .skip_disk_cache()
            .callback(results.sink())
            .build()
    };
    let handle = harness.engine.load(request());
    harness.wait_for(&results, 1);
    harness.engine.load(request());
    harness.wait_for(&results, 2);

    assert_eq!(harness.transport.calls(), 2);
    assert!(!harness.engine.memory_cache().contains(handle.key()));
    assert!(!harness.engine.disk_cache().contains(handle.key()));
    assert!(results.take().iter().all(|r| origin(r) == LoadOrigin::Source));
}

#[test]
fn network_images_are_subsampled_not_resized() {
    let harness = Harness::new();
    harness.transport.serve(URL, Ok(png_bytes(400, 300, [5, 5, 5, 255])));
    let results = Results::default();

    harness.engine.load(
        LoadRequest::builder(URL)
            .size(100, 100)
            .callback(results.sink())
            .build(),
    );
    harness.wait_for(&results, 1);

    let image = results.take().remove(0).unwrap();
    assert_eq!((image.buffer.width(), image.buffer.height()), (200, 150));
}

#[test]
fn resources_are_resized_exactly() {
    let harness = Harness::new();
    harness
        .bundle
        .insert(ResourceId(3), png_bytes(90, 60, [7, 7, 7, 255]));
    let results = Results::default();

    harness.engine.load(
        LoadRequest::builder(ResourceId(3))
            .size(30, 20)
            .callback(results.sink())
            .build(),
    );
    harness.wait_for(&results, 1);

    let image = results.take().remove(0).unwrap();
    assert_eq!((image.buffer.width(), image.buffer.height()), (30, 20));
}

#[test]
fn missing_file_shows_error_indicator() {
    let harness = Harness::new();
    let target = Arc::new(RecordingTarget::default());
    let results = Results::default();

    harness.engine.load(
        LoadRequest::builder(harness.dir.path().join("missing.png"))
            .target(target.clone())
            .placeholder(1)
            .error(7)
            .callback(results.sink())
            .build(),
    );
    harness.wait_for(&results, 1);

    assert!(matches!(
        results.take().remove(0),
        Err(LoadError::FileNotFound(_))
    ));
    assert_eq!(
        target.events(),
        vec![TargetEvent::Placeholder(1), TargetEvent::Error(7)]
    );
}

#[test]
fn http_failure_is_reported() {
    let harness = Harness::new();
    harness
        .transport
        .serve(URL, Err(TransportError::Status { code: 500 }));
    let results = Results::default();

    harness
        .engine
        .load(LoadRequest::builder(URL).callback(results.sink()).build());
    harness.wait_for(&results, 1);

    assert!(matches!(
        results.take().remove(0),
        Err(LoadError::Transport {
            source: TransportError::Status { code: 500 },
            ..
        })
    ));
}

#[test]
fn replaced_transform_input_returns_to_pool() {
    let harness = Harness::new();
    harness.transport.serve(URL, Ok(png_bytes(20, 10, [1, 1, 1, 255])));
    let results = Results::default();

    let halve = Transformation::new("halve", |buffer: &mut PooledBuffer, _pool| {
        Ok(TransformOutput::Replaced(PooledBuffer::new(
            buffer.width() / 2,
            buffer.height() / 2,
            buffer.format(),
        )))
    });
    harness.engine.load(
        LoadRequest::builder(URL)
            .transform(halve)
            .callback(results.sink())
            .build(),
    );
    harness.wait_for(&results, 1);

    let image = results.take().remove(0).unwrap();
    assert_eq!((image.buffer.width(), image.buffer.height()), (10, 5));
    assert_eq!(harness.engine.buffer_pool().len(), 1);
}

#[test]
fn cancelled_request_delivers_nothing() {
    let harness = Harness::new();
    harness.transport.serve(URL, Ok(png_bytes(8, 8, [0, 0, 0, 255])));
    harness.transport.close();
    let target = Arc::new(RecordingTarget::default());
    let results = Results::default();

    let handle = harness.engine.load(
        LoadRequest::builder(URL)
            .target(target.clone())
            .placeholder(2)
            .callback(results.sink())
            .build(),
    );
    wait_until(|| harness.transport.calls() == 1);

    assert_eq!(harness.engine.cancel_request(handle.key()), 1);
    assert!(handle.is_cancelled());
    harness.transport.open();
    harness.settle(1);

    assert_eq!(results.len(), 0);
    assert_eq!(target.events(), vec![TargetEvent::Placeholder(2)]);
    assert_eq!(harness.engine.stats().active_requests, 0);
    assert_eq!(harness.engine.cancel_request(handle.key()), 0);
}

#[test]
fn ending_scope_cancels_its_requests() {
    let harness = Harness::new();
    harness.transport.serve(URL, Ok(png_bytes(8, 8, [0, 0, 0, 255])));
    harness.transport.close();
    let scope = Arc::new(LifecycleScope::new());
    let results = Results::default();

    let handle = harness.engine.load(
        LoadRequest::builder(URL)
            .scope(scope.clone())
            .callback(results.sink())
            .build(),
    );
    wait_until(|| harness.transport.calls() == 1);

    scope.end();
    assert!(handle.is_cancelled());
    harness.transport.open();
    harness.settle(1);

    assert_eq!(results.len(), 0);
    assert_eq!(harness.engine.stats().active_requests, 0);
}

#[test]
fn request_in_ended_scope_never_runs() {
    let harness = Harness::new();
    let scope = Arc::new(LifecycleScope::new());
    scope.end();
    let results = Results::default();

    let handle = harness.engine.load(
        LoadRequest::builder(URL)
            .scope(scope)
            .callback(results.sink())
            .build(),
    );
    assert!(handle.is_cancelled());
    harness.settle(1);

    assert_eq!(results.len(), 0);
    assert_eq!(harness.transport.calls(), 0);
}

#[test]
fn long_lived_scope_keeps_no_observers_after_delivery() {
    let harness = Harness::new();
    harness.transport.serve(URL, Ok(png_bytes(8, 8, [0, 0, 0, 255])));
    let scope = Arc::new(LifecycleScope::new());
    let results = Results::default();

    for expected in 1..=3 {
        harness.engine.load(
            LoadRequest::builder(URL)
                .scope(scope.clone())
                .callback(results.sink())
                .build(),
        );
        harness.wait_for(&results, expected);
        assert_eq!(scope.observer_count(), 0);
    }

    let results = results.take();
    assert_eq!(origin(&results[0]), LoadOrigin::Source);
    assert_eq!(origin(&results[2]), LoadOrigin::Memory);
    assert!(!scope.is_ended());
}

#[test]
fn failed_and_cancelled_requests_unsubscribe_from_scope() {
    let harness = Harness::new();
    harness.transport.close();
    let scope = Arc::new(LifecycleScope::new());
    let results = Results::default();

    harness.engine.load(
        LoadRequest::builder("https://images.example.com/missing.png")
            .scope(scope.clone())
            .callback(results.sink())
            .build(),
    );
    let cancelled = harness.engine.load(
        LoadRequest::builder(URL)
            .scope(scope.clone())
            .callback(results.sink())
            .build(),
    );
    assert_eq!(scope.observer_count(), 2);

    cancelled.cancel();
    harness.transport.open();
    harness.wait_for(&results, 1);
    harness.settle(2);

    assert!(results.take()[0].is_err());
    assert_eq!(scope.observer_count(), 0);
}

#[test]
fn paused_requests_wait_for_resume() {
    let harness = Harness::new();
    harness.transport.serve(URL, Ok(png_bytes(8, 8, [0, 0, 0, 255])));
    let results = Results::default();

    harness.engine.pause_requests();
    harness
        .engine
        .load(LoadRequest::builder(URL).callback(results.sink()).build());

    let stats = harness.engine.stats();
    assert!(stats.paused);
    assert_eq!(stats.parked_requests, 1);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(harness.transport.calls(), 0);

    harness.engine.resume_requests();
    harness.wait_for(&results, 1);
    assert_eq!(harness.engine.stats().parked_requests, 0);
    assert!(results.take().remove(0).is_ok());
}

#[test]
fn cancelled_parked_request_is_dropped_on_resume() {
    let harness = Harness::new();
    harness.transport.serve(URL, Ok(png_bytes(8, 8, [0, 0, 0, 255])));
    let results = Results::default();

    harness.engine.pause_requests();
    let handle = harness
        .engine
        .load(LoadRequest::builder(URL).callback(results.sink()).build());
    handle.cancel();
    assert_eq!(harness.engine.stats().parked_requests, 0);

    harness.engine.resume_requests();
    thread::sleep(Duration::from_millis(20));
    harness.dispatcher.run_pending();

    assert_eq!(results.len(), 0);
    assert_eq!(harness.transport.calls(), 0);
    assert_eq!(harness.engine.stats().active_requests, 0);
}

#[test]
fn identical_requests_each_run() {
    let harness = Harness::with_workers(2);
    harness.transport.serve(URL, Ok(png_bytes(8, 8, [0, 0, 0, 255])));
    harness.transport.close();
    let results = Results::default();

    harness
        .engine
        .load(LoadRequest::builder(URL).callback(results.sink()).build());
    harness
        .engine
        .load(LoadRequest::builder(URL).callback(results.sink()).build());
    wait_until(|| harness.transport.calls() == 2);
    assert_eq!(harness.engine.stats().active_requests, 2);

    harness.transport.open();
    harness.wait_for(&results, 2);
    assert!(results.take().iter().all(|r| r.is_ok()));
}

#[test]
fn critical_pressure_empties_memory_cache_and_pool() {
    let harness = Harness::new();
    harness.transport.serve(URL, Ok(png_bytes(16, 16, [0, 0, 0, 255])));
    let results = Results::default();
    harness
        .engine
        .load(LoadRequest::builder(URL).callback(results.sink()).build());
    harness.wait_for(&results, 1);
    harness
        .engine
        .buffer_pool()
        .release(PooledBuffer::new(4, 4, Default::default()));
    assert!(!harness.engine.memory_cache().is_empty());
    assert!(!harness.engine.buffer_pool().is_empty());

    harness.engine.on_trim_level(80);

    assert!(harness.engine.memory_cache().is_empty());
    assert!(harness.engine.buffer_pool().is_empty());
    let pressure = harness.engine.stats().pressure;
    assert_eq!(pressure.current_level, PressureLevel::Critical);
    assert_eq!(pressure.critical_signals, 1);
}

#[test]
fn critical_pressure_mid_flight_clears_caches() {
    let harness = Harness::new();
    let warm_url = "https://images.example.com/warm.png";
    harness.transport.serve(warm_url, Ok(png_bytes(16, 16, [0, 0, 0, 255])));
    harness.transport.serve(URL, Ok(png_bytes(24, 24, [9, 9, 9, 255])));
    let results = Results::default();

    harness
        .engine
        .load(LoadRequest::builder(warm_url).callback(results.sink()).build());
    harness.wait_for(&results, 1);
    harness
        .engine
        .buffer_pool()
        .release(PooledBuffer::new(4, 4, Default::default()));

    harness.transport.close();
    harness
        .engine
        .load(LoadRequest::builder(URL).callback(results.sink()).build());
    wait_until(|| harness.transport.calls() == 2);
    assert_eq!(harness.engine.stats().active_requests, 1);

    harness.engine.on_pressure(PressureLevel::Critical);
    assert!(harness.engine.memory_cache().is_empty());
    assert!(harness.engine.buffer_pool().is_empty());

    harness.transport.open();
    harness.wait_for(&results, 2);

    let results = results.take();
    let image = results[1].as_ref().expect("in-flight request should complete");
    assert_eq!(image.origin, LoadOrigin::Source);
    assert_eq!((image.buffer.width(), image.buffer.height()), (24, 24));
    assert_eq!(harness.engine.stats().active_requests, 0);
}

#[test]
fn reused_target_only_shows_latest_request() {
    let harness = Harness::with_workers(2);
    let old_url = "https://images.example.com/old.png";
    let new_url = "https://images.example.com/new.png";
    harness.transport.serve(old_url, Ok(png_bytes(10, 10, [0, 0, 0, 255])));
    harness.transport.serve(new_url, Ok(png_bytes(20, 20, [0, 0, 0, 255])));
    harness.transport.close();
    let target = Arc::new(RecordingTarget::default());
    let results = Results::default();

    for url in [old_url, new_url] {
        harness.engine.load(
            LoadRequest::builder(url)
                .target(target.clone())
                .callback(results.sink())
                .build(),
        );
    }
    wait_until(|| harness.transport.calls() == 2);
    harness.transport.open();
    harness.wait_for(&results, 2);

    // Both callbacks fire but only the newer image reaches the target
    assert!(results.take().iter().all(|r| r.is_ok()));
    assert_eq!(target.events(), vec![TargetEvent::Image(20, 20)]);
}

#[test]
fn low_memory_skips_memory_cache() {
    let harness = Harness::new();
    harness.transport.serve(URL, Ok(png_bytes(8, 8, [0, 0, 0, 255])));
    harness.probe.set_available(0);
    let results = Results::default();

    let handle = harness
        .engine
        .load(LoadRequest::builder(URL).callback(results.sink()).build());
    harness.wait_for(&results, 1);
    assert!(!harness.engine.memory_cache().contains(handle.key()));

    harness
        .engine
        .load(LoadRequest::builder(URL).callback(results.sink()).build());
    harness.wait_for(&results, 2);

    let results = results.take();
    assert_eq!(origin(&results[1]), LoadOrigin::Disk);
    assert_eq!(harness.transport.calls(), 1);
}

#[test]
fn requests_after_shutdown_are_dropped() {
    let harness = Harness::new();
    harness.engine.shutdown();
    let results = Results::default();

    harness
        .engine
        .load(LoadRequest::builder(URL).callback(results.sink()).build());
    thread::sleep(Duration::from_millis(20));
    harness.dispatcher.run_pending();

    assert_eq!(results.len(), 0);
    assert_eq!(harness.engine.stats().active_requests, 0);
}
