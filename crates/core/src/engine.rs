//! Request orchestration
//!
//! [`RequestEngine`] runs each request through the cache tiers and the
//! source loaders:
//!
//! 1. The placeholder, if any, is applied to the target right away.
//! 2. The memory cache is checked on the caller's thread, unless the request
//!    skips it or memory is low.
//! 3. On a miss the request is registered under its cache key and handed to
//!    a worker, which checks the disk cache, then loads, decodes and
//!    transforms, then populates both caches.
//! 4. The outcome is posted to the delivery context, which applies it to the
//!    target and invokes the callback.
//!
//! Identical concurrent requests are not merged. Each one runs, and the last
//! cache write for a key wins.
//!
//! A render target is bound to the most recent request made for it. Results
//! from older requests still reach their callbacks but are not applied to
//! the target.
//!
//! Cancelled requests deliver nothing, neither to the target nor to the
//! callback.

use crate::config::EngineConfig;
use crate::decode::{DefaultDecoder, Decoder};
use crate::error::{EngineError, LoadError, LoadResult};
use crate::loader::{NetworkLoader, ResourceLoader, SourceLoaders};
use crate::request::{LoadOrigin, LoadRequest, LoadedImage};
use crate::resource::ResourceBundle;
use crate::target::{RenderTarget, ScopeRegistration};
use crate::transport::{Transport, UreqTransport};
use image_loader_cache::{
    BufferPool, CacheKey, DiskCache, DiskCacheStats, MemoryCache, MemoryCacheStats,
    MemoryPressureMonitor, MemoryProbe, PoolStats, PooledBuffer, PressureLevel, PressureStats,
    SystemMemoryProbe,
};
use image_loader_scheduler::{
    CancellationRegistry, CancellationToken, DeliveryThread, Dispatcher, TaskId, WorkerPool,
    WorkerPoolConfig, WorkerPoolStats,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Identifier assigned to each call to [`RequestEngine::load`]
pub type RequestId = u64;

/// Handle to a submitted request
#[derive(Debug, Clone)]
pub struct RequestHandle {
    id: RequestId,
    key: CacheKey,
    token: CancellationToken,
    task: Option<TaskId>,
    engine: Weak<EngineInner>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel this request only; other requests for the same key continue
    ///
    /// Cancelling a finished request does nothing.
    pub fn cancel(&self) {
        self.token.cancel();
        if let (Some(task), Some(engine)) = (self.task, self.engine.upgrade()) {
            engine.active.cancel_task(&self.key, task);
        }
    }
}

/// Point-in-time view of every engine component
#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub memory: MemoryCacheStats,
    pub pool: PoolStats,
    pub disk: DiskCacheStats,
    pub pressure: PressureStats,
    pub workers: WorkerPoolStats,
    /// Requests registered as in flight (including parked ones)
    pub active_requests: usize,
    /// Requests waiting for [`RequestEngine::resume_requests`]
    pub parked_requests: usize,
    pub paused: bool,
}

/// Ties between one request and the host: its target binding and its
/// scope subscription
///
/// Dropping it releases the binding and unsubscribes from the scope, so a
/// request discarded on any path leaves nothing behind.
struct RequestHooks {
    id: RequestId,
    engine: Weak<EngineInner>,
    target: Option<Arc<dyn RenderTarget>>,
    scope: Option<ScopeRegistration>,
}

impl RequestHooks {
    /// Take the target if this request is still the latest one bound to it
    fn claim_target(&mut self) -> Option<Arc<dyn RenderTarget>> {
        let target = self.target.take()?;
        let engine = self.engine.upgrade()?;
        engine.release_binding(&target, self.id).then_some(target)
    }
}

impl Drop for RequestHooks {
    fn drop(&mut self) {
        if let (Some(target), Some(engine)) = (self.target.take(), self.engine.upgrade()) {
            engine.release_binding(&target, self.id);
        }
    }
}

/// A request that missed the memory cache and needs a worker
struct Dispatched {
    key: CacheKey,
    task: TaskId,
    token: CancellationToken,
    request: LoadRequest,
    hooks: RequestHooks,
}

struct EngineInner {
    memory: Arc<MemoryCache>,
    pool: Arc<BufferPool>,
    disk: Arc<DiskCache>,
    pressure: Arc<MemoryPressureMonitor>,
    loaders: SourceLoaders,
    dispatcher: Arc<dyn Dispatcher>,
    active: CancellationRegistry<CacheKey>,
    /// Target address -> most recent request bound to it
    bindings: Mutex<HashMap<usize, RequestId>>,
    paused: AtomicBool,
    parked: Mutex<VecDeque<Dispatched>>,
}

fn target_addr(target: &Arc<dyn RenderTarget>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

impl EngineInner {
    fn bind(&self, target: &Arc<dyn RenderTarget>, id: RequestId) {
        self.bindings.lock().unwrap().insert(target_addr(target), id);
    }

    /// Drop the binding if `id` still owns the target; returns whether it did
    fn release_binding(&self, target: &Arc<dyn RenderTarget>, id: RequestId) -> bool {
        let addr = target_addr(target);
        let mut bindings = self.bindings.lock().unwrap();
        if bindings.get(&addr) == Some(&id) {
            bindings.remove(&addr);
            true
        } else {
            false
        }
    }

    fn populate_memory(&self, request: &LoadRequest, key: &CacheKey, buffer: &Arc<PooledBuffer>) {
        if request.skip_memory_cache || self.pressure.is_low_memory() {
            return;
        }
        self.memory.put(key.clone(), Arc::clone(buffer));
    }

    /// Worker-side pipeline: disk, source, transform, cache population
    fn run(&self, job: &Dispatched, token: &CancellationToken) -> LoadResult<LoadedImage> {
        let request = &job.request;
        let key = &job.key;

        if !request.skip_disk_cache {
            if let Some(buffer) = self.disk.get(key) {
                tracing::debug!(%key, "disk cache hit");
                let buffer = Arc::new(buffer);
                self.populate_memory(request, key, &buffer);
                return Ok(LoadedImage {
                    key: key.clone(),
                    buffer,
                    origin: LoadOrigin::Disk,
                });
            }
        }

        let decoded = self.loaders.load(request, &self.pool, token)?;
        if token.is_cancelled() {
            self.pool.release(decoded);
            return Err(LoadError::Cancelled);
        }

        let output = match request.transformation() {
            Some(transformation) => transformation.apply(decoded, &self.pool)?,
            None => decoded,
        };

        if !request.skip_disk_cache {
            self.disk.put(key, &output);
        }
        let buffer = Arc::new(output);
        self.populate_memory(request, key, &buffer);

        Ok(LoadedImage {
            key: key.clone(),
            buffer,
            origin: LoadOrigin::Source,
        })
    }

    fn execute(self: &Arc<Self>, job: Dispatched, token: &CancellationToken) {
        let result = self.run(&job, token);
        self.active.unregister(&job.key, job.task);

        if token.is_cancelled() || matches!(result, Err(LoadError::Cancelled)) {
            tracing::debug!(key = %job.key, "request cancelled");
            return;
        }

        let Dispatched {
            key,
            token,
            request,
            hooks,
            ..
        } = job;
        self.deliver(key, request, result, token, hooks);
    }

    /// Post the outcome to the delivery context
    ///
    /// `hooks` are dropped once the callback returns.
    fn deliver(
        &self,
        key: CacheKey,
        request: LoadRequest,
        result: LoadResult<LoadedImage>,
        token: CancellationToken,
        mut hooks: RequestHooks,
    ) {
        let LoadRequest {
            error_indicator,
            callback,
            ..
        } = request;

        self.dispatcher.dispatch(Box::new(move || {
            if token.is_cancelled() {
                tracing::debug!(%key, "request cancelled before delivery");
                return;
            }

            let had_target = hooks.target.is_some();
            match hooks.claim_target() {
                Some(target) => match &result {
                    Ok(image) => target.set_image(Arc::clone(&image.buffer)),
                    Err(_) => {
                        if let Some(indicator) = error_indicator {
                            target.set_error(indicator);
                        }
                    }
                },
                None if had_target => {
                    tracing::debug!(%key, request = hooks.id, "target reused by a newer request, skipping");
                }
                None => {}
            }

            match &result {
                Ok(image) => tracing::debug!(%key, origin = ?image.origin, "delivered"),
                Err(err) => tracing::warn!(%key, error = %err, "image request failed"),
            }

            if let Some(callback) = callback {
                callback(result);
            }
            drop(hooks);
        }));
    }

    /// Cancel the registered task when the request's scope ends
    ///
    /// The subscription lasts as long as the returned registration.
    fn observe_scope(
        self: &Arc<Self>,
        request: &LoadRequest,
        key: &CacheKey,
        task: Option<TaskId>,
        token: &CancellationToken,
    ) -> Option<ScopeRegistration> {
        let scope = request.scope.as_ref()?;
        let engine = Arc::downgrade(self);
        let key = key.clone();
        let token = token.clone();
        Some(scope.on_end(Box::new(move || {
            token.cancel();
            if let (Some(task), Some(engine)) = (task, engine.upgrade()) {
                engine.active.cancel_task(&key, task);
            }
        })))
    }
}

/// Builder for [`RequestEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    transport: Option<Arc<dyn Transport>>,
    network: bool,
    bundle: Option<Arc<dyn ResourceBundle>>,
    decoder: Option<Arc<dyn Decoder>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    probe: Option<Arc<dyn MemoryProbe>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            transport: None,
            network: true,
            bundle: None,
            decoder: None,
            dispatcher: None,
            probe: None,
        }
    }

    /// Replace the default HTTP transport
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self.network = true;
        self
    }

    /// Build without a network loader; network requests fail with
    /// [`LoadError::NoLoader`]
    pub fn without_network(mut self) -> Self {
        self.transport = None;
        self.network = false;
        self
    }

    /// Enable the resource loader
    pub fn resource_bundle(mut self, bundle: Arc<dyn ResourceBundle>) -> Self {
        self.bundle = Some(bundle);
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Deliver results on `dispatcher` instead of a dedicated thread
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Create the caches, worker threads and delivery context
    ///
    /// # Errors
    /// Fails on a zero worker count, an unusable disk cache directory, or if
    /// threads cannot be spawned.
    pub fn build(self) -> Result<RequestEngine, EngineError> {
        let config = self.config;
        if config.worker_count == 0 {
            return Err(EngineError::Config("worker_count must be at least 1".to_string()));
        }

        let probe = self.probe.unwrap_or_else(|| Arc::new(SystemMemoryProbe));
        let memory_kb = config.cache.resolve_memory_kb(probe.as_ref());

        let pool = Arc::new(BufferPool::new(config.cache.pool_capacity));
        let memory = Arc::new(MemoryCache::with_eviction_listener(memory_kb, pool.recycler()));
        let disk = Arc::new(
            DiskCache::new(&config.cache.disk_cache_dir, config.cache.disk_cache_size)?
                .with_evict_batch(config.cache.disk_evict_batch),
        );
        let pressure = Arc::new(
            MemoryPressureMonitor::new(Arc::clone(&memory), Arc::clone(&pool), probe)
                .with_low_memory_ratio(config.cache.low_memory_ratio),
        );

        let decoder = self.decoder.unwrap_or_else(|| Arc::new(DefaultDecoder));
        let mut loaders = SourceLoaders::new(Arc::clone(&decoder));
        if self.network {
            let transport = self.transport.unwrap_or_else(|| {
                Arc::new(UreqTransport::new(
                    config.connect_timeout,
                    config.read_timeout,
                    &config.user_agent,
                ))
            });
            loaders = loaders.with_network(NetworkLoader::new(transport, Arc::clone(&decoder)));
        }
        if let Some(bundle) = self.bundle {
            loaders = loaders.with_resource(ResourceLoader::new(bundle, Arc::clone(&decoder)));
        }

        let (dispatcher, delivery): (Arc<dyn Dispatcher>, _) = match self.dispatcher {
            Some(dispatcher) => (dispatcher, None),
            None => {
                let thread = Arc::new(DeliveryThread::spawn()?);
                (Arc::clone(&thread) as Arc<dyn Dispatcher>, Some(thread))
            }
        };

        let workers = WorkerPool::new(
            WorkerPoolConfig::new(config.worker_count).with_thread_name("image-loader-worker"),
        )?;

        tracing::info!(
            workers = config.worker_count,
            memory_kb,
            disk_bytes = config.cache.disk_cache_size,
            disk_dir = %config.cache.disk_cache_dir.display(),
            "request engine started"
        );

        Ok(RequestEngine {
            inner: Arc::new(EngineInner {
                memory,
                pool,
                disk,
                pressure,
                loaders,
                dispatcher,
                active: CancellationRegistry::new(),
                bindings: Mutex::new(HashMap::new()),
                paused: AtomicBool::new(false),
                parked: Mutex::new(VecDeque::new()),
            }),
            workers,
            delivery,
            next_id: AtomicU64::new(1),
            config,
        })
    }
}

/// Loads images through the memory cache, disk cache and source loaders
///
/// Constructed once by the host and shared by reference; there is no global
/// instance.
pub struct RequestEngine {
    inner: Arc<EngineInner>,
    workers: WorkerPool,
    delivery: Option<Arc<DeliveryThread>>,
    next_id: AtomicU64,
    config: EngineConfig,
}

impl RequestEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Build an engine with default collaborators
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        EngineBuilder::new(config).build()
    }

    /// Submit a request
    ///
    /// Memory cache hits are resolved here; everything else runs on a
    /// worker. The outcome is always delivered on the delivery context.
    pub fn load(&self, request: LoadRequest) -> RequestHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = request.cache_key();
        let inner = &self.inner;

        if let Some(target) = &request.target {
            inner.bind(target, id);
            if let Some(placeholder) = request.placeholder {
                target.set_placeholder(placeholder);
            }
        }
        let mut hooks = RequestHooks {
            id,
            engine: Arc::downgrade(inner),
            target: request.target.clone(),
            scope: None,
        };

        let use_memory = !request.skip_memory_cache && !inner.pressure.is_low_memory();
        if use_memory {
            if let Some(buffer) = inner.memory.get(&key) {
                tracing::debug!(%key, "memory cache hit");
                let token = CancellationToken::new();
                hooks.scope = inner.observe_scope(&request, &key, None, &token);
                let image = LoadedImage {
                    key: key.clone(),
                    buffer,
                    origin: LoadOrigin::Memory,
                };
                inner.deliver(key.clone(), request, Ok(image), token.clone(), hooks);
                return RequestHandle {
                    id,
                    key,
                    token,
                    task: None,
                    engine: Arc::downgrade(inner),
                };
            }
        }

        let (task, token) = inner.active.register(key.clone());
        hooks.scope = inner.observe_scope(&request, &key, Some(task), &token);
        let handle = RequestHandle {
            id,
            key: key.clone(),
            token: token.clone(),
            task: Some(task),
            engine: Arc::downgrade(inner),
        };

        let job = Dispatched {
            key,
            task,
            token,
            request,
            hooks,
        };
        {
            let mut parked = inner.parked.lock().unwrap();
            if inner.paused.load(Ordering::Acquire) {
                tracing::debug!(key = %job.key, "requests paused, parking");
                parked.push_back(job);
                return handle;
            }
        }
        self.submit(job);
        handle
    }

    /// Hand a job to the workers; a rejected or skipped job is dropped,
    /// which releases its target binding
    fn submit(&self, job: Dispatched) {
        let key = job.key.clone();
        let task = job.task;
        let token = job.token.clone();
        let inner = Arc::clone(&self.inner);

        tracing::debug!(%key, "dispatching to worker");
        let accepted = self
            .workers
            .submit(token, Box::new(move |token: &CancellationToken| inner.execute(job, token)));
        if !accepted {
            tracing::debug!(%key, "engine shut down, request dropped");
            self.inner.active.unregister(&key, task);
        }
    }

    /// Stop dispatching new work; requests that miss the memory cache are
    /// parked until [`resume_requests`](Self::resume_requests)
    pub fn pause_requests(&self) {
        let _parked = self.inner.parked.lock().unwrap();
        self.inner.paused.store(true, Ordering::Release);
    }

    /// Resume dispatching and submit every parked request
    pub fn resume_requests(&self) {
        let parked: Vec<Dispatched> = {
            let mut parked = self.inner.parked.lock().unwrap();
            self.inner.paused.store(false, Ordering::Release);
            parked.drain(..).collect()
        };
        for job in parked {
            if job.token.is_cancelled() {
                continue;
            }
            self.submit(job);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Cancel every in-flight request for `key`
    ///
    /// Returns how many were cancelled; an unknown or finished key is a
    /// no-op.
    pub fn cancel_request(&self, key: &CacheKey) -> usize {
        let cancelled = self.inner.active.cancel(key);
        if cancelled > 0 {
            tracing::debug!(%key, cancelled, "cancelled requests");
            // Drop outside the lock; dropping a job releases its binding
            let dropped: VecDeque<Dispatched> = {
                let mut parked = self.inner.parked.lock().unwrap();
                let (dropped, kept) = std::mem::take(&mut *parked)
                    .into_iter()
                    .partition(|job| job.token.is_cancelled());
                *parked = kept;
                dropped
            };
            drop(dropped);
        }
        cancelled
    }

    /// Handle a host memory pressure signal
    pub fn on_pressure(&self, level: PressureLevel) {
        self.inner.pressure.on_pressure(level);
    }

    /// Handle a numeric host trim level
    pub fn on_trim_level(&self, level: u32) {
        self.inner.pressure.on_trim_level(level);
    }

    /// Handle a full low-memory signal
    pub fn on_low_memory(&self) {
        self.inner.pressure.on_low_memory();
    }

    pub fn memory_cache(&self) -> &Arc<MemoryCache> {
        &self.inner.memory
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.inner.pool
    }

    pub fn disk_cache(&self) -> &Arc<DiskCache> {
        &self.inner.disk
    }

    pub fn pressure_monitor(&self) -> &Arc<MemoryPressureMonitor> {
        &self.inner.pressure
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        let parked_requests = self
            .inner
            .parked
            .lock()
            .unwrap()
            .iter()
            .filter(|job| !job.token.is_cancelled())
            .count();
        EngineStats {
            memory: self.inner.memory.stats(),
            pool: self.inner.pool.stats(),
            disk: self.inner.disk.stats(),
            pressure: self.inner.pressure.stats(),
            workers: self.workers.stats(),
            active_requests: self.inner.active.len(),
            parked_requests,
            paused: self.is_paused(),
        }
    }

    /// Cancel everything in flight and stop the worker and delivery threads
    ///
    /// Deliveries already posted still run. Requests made afterwards are
    /// dropped.
    pub fn shutdown(&self) {
        let cancelled = self.inner.active.cancel_all();
        let parked = std::mem::take(&mut *self.inner.parked.lock().unwrap());
        drop(parked);
        self.workers.shutdown();
        if let Some(delivery) = &self.delivery {
            delivery.shutdown();
        }
        tracing::info!(cancelled, "request engine shut down");
    }
}
