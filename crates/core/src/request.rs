//! Load requests and their sources
//!
//! A [`LoadRequest`] is built once with [`LoadRequestBuilder`] and consumed by
//! [`RequestEngine::load`](crate::RequestEngine::load).

use crate::error::{LoadError, LoadResult};
use crate::target::{CancellationScope, IndicatorId, RenderTarget};
use image_loader_cache::{BufferPool, CacheKey, PixelFormat, PooledBuffer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Identifier of an image bundled with the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u32);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of source, used for loader selection and error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Network,
    Resource,
    File,
}

impl SourceKind {
    pub fn name(self) -> &'static str {
        match self {
            SourceKind::Network => "network",
            SourceKind::Resource => "resource",
            SourceKind::File => "file",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the encoded bytes of an image come from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    /// `http://` or `https://` URL
    Network(String),
    /// Bundled resource
    Resource(ResourceId),
    /// Local file
    File(PathBuf),
}

impl Source {
    /// Classify a source string
    ///
    /// HTTP(S) URLs are network sources, strings made only of digits are
    /// resource ids, and everything else (including `file://` URLs) is a
    /// file path.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Source::Network(trimmed.to_string());
        }
        if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(id) = trimmed.parse::<u32>() {
                return Source::Resource(ResourceId(id));
            }
        }
        let path = trimmed.strip_prefix("file://").unwrap_or(trimmed);
        Source::File(PathBuf::from(path))
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Source::Network(_) => SourceKind::Network,
            Source::Resource(_) => SourceKind::Resource,
            Source::File(_) => SourceKind::File,
        }
    }

    /// Canonical rendering used as the first component of the cache key
    pub fn identity(&self) -> String {
        match self {
            Source::Network(url) => url.clone(),
            Source::Resource(id) => format!("res://{}", id),
            Source::File(path) => format!("file://{}", path.display()),
        }
    }
}

impl From<&str> for Source {
    fn from(value: &str) -> Self {
        Source::parse(value)
    }
}

impl From<ResourceId> for Source {
    fn from(id: ResourceId) -> Self {
        Source::Resource(id)
    }
}

impl From<&Path> for Source {
    fn from(path: &Path) -> Self {
        Source::File(path.to_path_buf())
    }
}

impl From<PathBuf> for Source {
    fn from(path: PathBuf) -> Self {
        Source::File(path)
    }
}

/// Result of a transformation function
pub enum TransformOutput {
    /// The input buffer was modified in place and is the result
    InPlace,
    /// A different buffer is the result; the input may be reused
    Replaced(PooledBuffer),
}

type TransformFn =
    dyn Fn(&mut PooledBuffer, &BufferPool) -> Result<TransformOutput, String> + Send + Sync;

/// Pixel transformation applied after decode
///
/// The key is appended to the cache key, so two transformations with the
/// same key must produce the same pixels.
#[derive(Clone)]
pub struct Transformation {
    key: String,
    func: Arc<TransformFn>,
}

impl Transformation {
    pub fn new<F>(key: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut PooledBuffer, &BufferPool) -> Result<TransformOutput, String>
            + Send
            + Sync
            + 'static,
    {
        Self {
            key: key.into(),
            func: Arc::new(func),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Run the transformation
    ///
    /// When it produces a different buffer the input goes back to `pool`
    /// if it is still reusable. A failing transformation also hands the
    /// input back before reporting the error.
    pub fn apply(&self, mut buffer: PooledBuffer, pool: &BufferPool) -> LoadResult<PooledBuffer> {
        match (self.func)(&mut buffer, pool) {
            Ok(TransformOutput::InPlace) => Ok(buffer),
            Ok(TransformOutput::Replaced(output)) => {
                if buffer.is_reusable() {
                    pool.release(buffer);
                }
                Ok(output)
            }
            Err(message) => {
                if buffer.is_reusable() {
                    pool.release(buffer);
                }
                Err(LoadError::Transform(message))
            }
        }
    }
}

impl fmt::Debug for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformation").field("key", &self.key).finish()
    }
}

/// Where a delivered image came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOrigin {
    Memory,
    Disk,
    Source,
}

/// Successful load result
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub key: CacheKey,
    pub buffer: Arc<PooledBuffer>,
    pub origin: LoadOrigin,
}

/// Callback receiving the outcome of a request on the delivery context
pub type ResultCallback = Box<dyn FnOnce(LoadResult<LoadedImage>) + Send + 'static>;

/// An image load request
pub struct LoadRequest {
    pub(crate) source: Source,
    pub(crate) size: Option<(u32, u32)>,
    pub(crate) format: PixelFormat,
    pub(crate) transformation: Option<Transformation>,
    pub(crate) skip_memory_cache: bool,
    pub(crate) skip_disk_cache: bool,
    pub(crate) callback: Option<ResultCallback>,
    pub(crate) scope: Option<Arc<dyn CancellationScope>>,
    pub(crate) target: Option<Arc<dyn RenderTarget>>,
    pub(crate) placeholder: Option<IndicatorId>,
    pub(crate) error_indicator: Option<IndicatorId>,
}

impl LoadRequest {
    /// Start building a request for `source`
    pub fn builder(source: impl Into<Source>) -> LoadRequestBuilder {
        LoadRequestBuilder::new(source.into())
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Override dimensions, if any
    pub fn size(&self) -> Option<(u32, u32)> {
        self.size
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn transformation(&self) -> Option<&Transformation> {
        self.transformation.as_ref()
    }

    pub fn skips_memory_cache(&self) -> bool {
        self.skip_memory_cache
    }

    pub fn skips_disk_cache(&self) -> bool {
        self.skip_disk_cache
    }

    /// Cache key for this request
    ///
    /// Non-default pixel formats are folded into the source identity so an
    /// Rgb565 decode never satisfies an Rgba8888 request.
    pub fn cache_key(&self) -> CacheKey {
        let mut identity = self.source.identity();
        if self.format != PixelFormat::default() {
            identity.push('#');
            identity.push_str(self.format.name());
        }
        CacheKey::compose(
            &identity,
            self.size,
            self.transformation.as_ref().map(Transformation::key),
        )
    }
}

impl fmt::Debug for LoadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadRequest")
            .field("source", &self.source)
            .field("size", &self.size)
            .field("format", &self.format)
            .field("transformation", &self.transformation)
            .field("skip_memory_cache", &self.skip_memory_cache)
            .field("skip_disk_cache", &self.skip_disk_cache)
            .field("has_target", &self.target.is_some())
            .finish()
    }
}

/// Builder for [`LoadRequest`]
pub struct LoadRequestBuilder {
    request: LoadRequest,
}

impl LoadRequestBuilder {
    pub fn new(source: Source) -> Self {
        Self {
            request: LoadRequest {
                source,
                size: None,
                format: PixelFormat::default(),
                transformation: None,
                skip_memory_cache: false,
                skip_disk_cache: false,
                callback: None,
                scope: None,
                target: None,
                placeholder: None,
                error_indicator: None,
            },
        }
    }

    /// Decode to at least `width` x `height`; zero in either dimension
    /// clears the override
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.request.size = if width == 0 || height == 0 {
            None
        } else {
            Some((width, height))
        };
        self
    }

    pub fn format(mut self, format: PixelFormat) -> Self {
        self.request.format = format;
        self
    }

    pub fn transform(mut self, transformation: Transformation) -> Self {
        self.request.transformation = Some(transformation);
        self
    }

    pub fn skip_memory_cache(mut self) -> Self {
        self.request.skip_memory_cache = true;
        self
    }

    pub fn skip_disk_cache(mut self) -> Self {
        self.request.skip_disk_cache = true;
        self
    }

    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(LoadResult<LoadedImage>) + Send + 'static,
    {
        self.request.callback = Some(Box::new(callback));
        self
    }

    /// Cancel the request when `scope` ends
    pub fn scope(mut self, scope: Arc<dyn CancellationScope>) -> Self {
        self.request.scope = Some(scope);
        self
    }

    pub fn target(mut self, target: Arc<dyn RenderTarget>) -> Self {
        self.request.target = Some(target);
        self
    }

    /// Indicator shown on the target while the request is in flight
    pub fn placeholder(mut self, id: IndicatorId) -> Self {
        self.request.placeholder = Some(id);
        self
    }

    /// Indicator shown on the target if the request fails
    pub fn error(mut self, id: IndicatorId) -> Self {
        self.request.error_indicator = Some(id);
        self
    }

    pub fn build(self) -> LoadRequest {
        self.request
    }
}
