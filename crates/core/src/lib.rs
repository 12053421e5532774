//! Image Loader Core Library
//!
//! Request engine that resolves image requests through a memory cache, a
//! disk cache and pluggable source loaders (network, bundled resource, local
//! file), decoding into pooled pixel buffers on worker threads and delivering
//! results on a single delivery context.
//!
//! ```no_run
//! use image_loader_core::{EngineConfig, LoadRequest, RequestEngine};
//!
//! let engine = RequestEngine::new(EngineConfig::default()).unwrap();
//! engine.load(
//!     LoadRequest::builder("https://example.com/cat.png")
//!         .size(200, 200)
//!         .callback(|result| {
//!             if let Ok(image) = result {
//!                 println!("{}x{}", image.buffer.width(), image.buffer.height());
//!             }
//!         })
//!         .build(),
//! );
//! ```

pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod loader;
pub mod request;
pub mod resource;
pub mod target;
pub mod transport;

pub use config::{EngineConfig, DEFAULT_TIMEOUT};
pub use decode::{
    calculate_sample_size, decode_pooled, sampled_dimensions, DecodeOptions, Decoder,
    DefaultDecoder,
};
pub use engine::{EngineBuilder, EngineStats, RequestEngine, RequestHandle, RequestId};
pub use error::{EngineError, LoadError, LoadResult, TransportError};
pub use loader::{FileLoader, NetworkLoader, ResourceLoader, SourceLoaders};
pub use request::{
    LoadOrigin, LoadRequest, LoadRequestBuilder, LoadedImage, ResourceId, ResultCallback, Source,
    SourceKind, TransformOutput, Transformation,
};
pub use resource::{DirectoryBundle, MemoryBundle, ResourceBundle};
pub use target::{
    CancellationScope, IndicatorId, LifecycleScope, RenderTarget, ScopeObserver, ScopeRegistration,
};
pub use transport::{Transport, UreqTransport, DEFAULT_MAX_BODY_BYTES};

pub use image_loader_cache::{
    BufferPool, CacheConfig, CacheKey, DiskCache, MemoryCache, MemoryPressureMonitor,
    PixelFormat, PooledBuffer, PressureLevel,
};
