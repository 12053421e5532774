#![allow(dead_code)]

use image::{ImageFormat, Rgba, RgbaImage};
use image_loader_cache::{CacheConfig, FixedMemoryProbe, PooledBuffer};
use image_loader_core::{
    EngineConfig, IndicatorId, LoadResult, LoadedImage, MemoryBundle, RenderTarget,
    RequestEngine, TransportError, Transport,
};
use image_loader_scheduler::ManualDispatcher;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn png_bytes(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    let image = RgbaImage::from_pixel(width, height, Rgba(color));
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("png encode");
    bytes
}

/// Transport serving canned responses, optionally held behind a gate
#[derive(Default)]
pub struct FakeTransport {
    responses: Mutex<HashMap<String, Result<Vec<u8>, TransportError>>>,
    calls: AtomicUsize,
    gate: Mutex<bool>,
    opened: Condvar,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(true),
            ..Self::default()
        }
    }

    pub fn serve(&self, url: &str, response: Result<Vec<u8>, TransportError>) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Block fetches until [`open`](Self::open)
    pub fn close(&self) {
        *self.gate.lock().unwrap() = false;
    }

    pub fn open(&self) {
        *self.gate.lock().unwrap() = true;
        self.opened.notify_all();
    }
}

impl Transport for FakeTransport {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut open = self.gate.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
        drop(open);

        self.responses
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or(Err(TransportError::Status { code: 404 }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEvent {
    Placeholder(IndicatorId),
    Image(u32, u32),
    Error(IndicatorId),
}

#[derive(Default)]
pub struct RecordingTarget {
    events: Mutex<Vec<TargetEvent>>,
}

impl RecordingTarget {
    pub fn events(&self) -> Vec<TargetEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl RenderTarget for RecordingTarget {
    fn set_image(&self, image: Arc<PooledBuffer>) {
        self.events
            .lock()
            .unwrap()
            .push(TargetEvent::Image(image.width(), image.height()));
    }

    fn set_placeholder(&self, id: IndicatorId) {
        self.events.lock().unwrap().push(TargetEvent::Placeholder(id));
    }

    fn set_error(&self, id: IndicatorId) {
        self.events.lock().unwrap().push(TargetEvent::Error(id));
    }
}

/// Shared sink for request callbacks
#[derive(Clone, Default)]
pub struct Results(Arc<Mutex<Vec<LoadResult<LoadedImage>>>>);

impl Results {
    pub fn sink(&self) -> impl FnOnce(LoadResult<LoadedImage>) + Send + 'static {
        let inner = Arc::clone(&self.0);
        move |result| inner.lock().unwrap().push(result)
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn take(&self) -> Vec<LoadResult<LoadedImage>> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

pub struct Harness {
    pub engine: RequestEngine,
    pub dispatcher: Arc<ManualDispatcher>,
    pub transport: Arc<FakeTransport>,
    pub bundle: Arc<MemoryBundle>,
    pub probe: Arc<FixedMemoryProbe>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_workers(2)
    }

    pub fn with_workers(workers: usize) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let dispatcher = Arc::new(ManualDispatcher::new());
        let transport = Arc::new(FakeTransport::new());
        let bundle = Arc::new(MemoryBundle::new());
        let probe = Arc::new(FixedMemoryProbe::new(1 << 30, 1 << 30));

        let config = EngineConfig::default().with_workers(workers).with_cache(
            CacheConfig::default()
                .with_disk_dir(dir.path().join("cache"))
                .with_memory_kb(16 * 1024)
                .with_pool_capacity(8),
        );
        let engine = RequestEngine::builder(config)
            .transport(transport.clone())
            .resource_bundle(bundle.clone())
            .dispatcher(dispatcher.clone())
            .memory_probe(probe.clone())
            .build()
            .expect("engine");

        Self {
            engine,
            dispatcher,
            transport,
            bundle,
            probe,
            dir,
        }
    }

    /// Pump deliveries until `results` holds at least `count` entries
    pub fn wait_for(&self, results: &Results, count: usize) {
        let deadline = Instant::now() + WAIT;
        while results.len() < count {
            self.dispatcher.run_pending();
            assert!(Instant::now() < deadline, "timed out waiting for {count} results");
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Wait until `finished` worker jobs have run or been skipped, then pump
    pub fn settle(&self, finished: u64) {
        let deadline = Instant::now() + WAIT;
        loop {
            let workers = self.engine.stats().workers;
            if workers.completed + workers.skipped >= finished {
                break;
            }
            assert!(Instant::now() < deadline, "timed out waiting for workers");
            thread::sleep(Duration::from_millis(2));
        }
        self.dispatcher.run_pending();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.transport.open();
        self.engine.shutdown();
    }
}
