//! Source loaders
//!
//! One loader per [`SourceKind`]. Each fetches the encoded bytes, checks for
//! cancellation, and decodes through [`decode_pooled`] so decoded pixels
//! land in pooled storage when possible. [`SourceLoaders`] picks the loader
//! by matching on the source.

use crate::decode::{decode_pooled, DecodeOptions, Decoder};
use crate::error::{LoadError, LoadResult};
use crate::request::{LoadRequest, Source, SourceKind};
use crate::resource::ResourceBundle;
use crate::transport::Transport;
use image_loader_cache::{BufferPool, PooledBuffer};
use image_loader_scheduler::CancellationToken;
use std::fs;
use std::io;
use std::sync::Arc;

fn check_cancelled(token: &CancellationToken) -> LoadResult<()> {
    if token.is_cancelled() {
        Err(LoadError::Cancelled)
    } else {
        Ok(())
    }
}

/// Loads `http(s)://` sources through a [`Transport`]
pub struct NetworkLoader {
    transport: Arc<dyn Transport>,
    decoder: Arc<dyn Decoder>,
}

impl NetworkLoader {
    pub fn new(transport: Arc<dyn Transport>, decoder: Arc<dyn Decoder>) -> Self {
        Self { transport, decoder }
    }

    pub fn can_handle(&self, source: &Source) -> bool {
        matches!(source, Source::Network(_))
    }

    pub fn load(
        &self,
        request: &LoadRequest,
        pool: &BufferPool,
        token: &CancellationToken,
    ) -> LoadResult<PooledBuffer> {
        let Source::Network(url) = request.source() else {
            return Err(LoadError::NoLoader(request.source().kind()));
        };

        tracing::debug!(%url, "fetching image");
        let bytes = self.transport.fetch(url).map_err(|source| LoadError::Transport {
            url: url.clone(),
            source,
        })?;
        check_cancelled(token)?;

        decode_pooled(
            self.decoder.as_ref(),
            &bytes,
            DecodeOptions::new(request.size(), request.format()),
            pool,
        )
    }
}

/// Loads bundled resources; the only loader that resamples to the exact
/// requested size
pub struct ResourceLoader {
    bundle: Arc<dyn ResourceBundle>,
    decoder: Arc<dyn Decoder>,
}

impl ResourceLoader {
    pub fn new(bundle: Arc<dyn ResourceBundle>, decoder: Arc<dyn Decoder>) -> Self {
        Self { bundle, decoder }
    }

    pub fn can_handle(&self, source: &Source) -> bool {
        matches!(source, Source::Resource(_))
    }

    pub fn load(
        &self,
        request: &LoadRequest,
        pool: &BufferPool,
        token: &CancellationToken,
    ) -> LoadResult<PooledBuffer> {
        let Source::Resource(id) = request.source() else {
            return Err(LoadError::NoLoader(request.source().kind()));
        };

        let bytes = self.bundle.open(*id)?;
        check_cancelled(token)?;

        decode_pooled(
            self.decoder.as_ref(),
            &bytes,
            DecodeOptions::new(request.size(), request.format()).exact(),
            pool,
        )
    }
}

/// Loads local files; the fallback for anything not network or resource
pub struct FileLoader {
    decoder: Arc<dyn Decoder>,
}

impl FileLoader {
    pub fn new(decoder: Arc<dyn Decoder>) -> Self {
        Self { decoder }
    }

    pub fn can_handle(&self, source: &Source) -> bool {
        matches!(source, Source::File(_))
    }

    pub fn load(
        &self,
        request: &LoadRequest,
        pool: &BufferPool,
        token: &CancellationToken,
    ) -> LoadResult<PooledBuffer> {
        let Source::File(path) = request.source() else {
            return Err(LoadError::NoLoader(request.source().kind()));
        };

        let bytes = fs::read(path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => LoadError::FileNotFound(path.clone()),
            _ => LoadError::Io {
                path: path.clone(),
                source,
            },
        })?;
        check_cancelled(token)?;

        decode_pooled(
            self.decoder.as_ref(),
            &bytes,
            DecodeOptions::new(request.size(), request.format()),
            pool,
        )
    }
}

/// The set of loaders an engine dispatches to
///
/// The file loader is always present; network and resource loaders are
/// optional and a request for a missing one fails with
/// [`LoadError::NoLoader`].
pub struct SourceLoaders {
    network: Option<NetworkLoader>,
    resource: Option<ResourceLoader>,
    file: FileLoader,
}

impl SourceLoaders {
    pub fn new(decoder: Arc<dyn Decoder>) -> Self {
        Self {
            network: None,
            resource: None,
            file: FileLoader::new(decoder),
        }
    }

    pub fn with_network(mut self, loader: NetworkLoader) -> Self {
        self.network = Some(loader);
        self
    }

    pub fn with_resource(mut self, loader: ResourceLoader) -> Self {
        self.resource = Some(loader);
        self
    }

    /// Whether a loader is configured for `kind`
    pub fn supports(&self, kind: SourceKind) -> bool {
        match kind {
            SourceKind::Network => self.network.is_some(),
            SourceKind::Resource => self.resource.is_some(),
            SourceKind::File => true,
        }
    }

    /// Fetch and decode the request's source
    pub fn load(
        &self,
        request: &LoadRequest,
        pool: &BufferPool,
        token: &CancellationToken,
    ) -> LoadResult<PooledBuffer> {
        check_cancelled(token)?;
        match request.source() {
            Source::Network(_) => match &self.network {
                Some(loader) => loader.load(request, pool, token),
                None => Err(LoadError::NoLoader(SourceKind::Network)),
            },
            Source::Resource(_) => match &self.resource {
                Some(loader) => loader.load(request, pool, token),
                None => Err(LoadError::NoLoader(SourceKind::Resource)),
            },
            Source::File(_) => self.file.load(request, pool, token),
        }
    }
}
