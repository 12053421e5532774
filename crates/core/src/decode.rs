//! Pool-assisted image decoding
//!
//! Decoding happens in three steps. A bounds pass reads the native size,
//! the subsample factor is chosen from the requested size, and the pixels
//! are decoded into a pooled buffer of the post-subsample size when one is
//! available. The resource path additionally resamples to the exact
//! requested size.

use crate::error::{LoadError, LoadResult};
use image::imageops::{self, FilterType};
use image::{ColorType, DynamicImage, ImageDecoder, ImageReader, RgbaImage};
use image_loader_cache::{BufferPool, PixelFormat, PooledBuffer};
use std::io::Cursor;

/// Largest power-of-two subsample factor that keeps both decoded
/// dimensions at or above the target
///
/// The factor doubles while both halved dimensions, divided by the current
/// factor, stay at or above the target. 4000x3000 with a 500x500 target
/// gives 4 (decoded 1000x750).
pub fn calculate_sample_size(width: u32, height: u32, target_width: u32, target_height: u32) -> u32 {
    let target_width = target_width.max(1);
    let target_height = target_height.max(1);
    let mut sample_size = 1u32;

    if height > target_height || width > target_width {
        let half_height = height / 2;
        let half_width = width / 2;
        while half_height / sample_size >= target_height && half_width / sample_size >= target_width {
            sample_size *= 2;
        }
    }

    sample_size
}

/// Dimensions after subsampling by `sample_size`, never below 1x1
pub fn sampled_dimensions(width: u32, height: u32, sample_size: u32) -> (u32, u32) {
    let sample_size = sample_size.max(1);
    ((width / sample_size).max(1), (height / sample_size).max(1))
}

/// Image codec used by the source loaders
pub trait Decoder: Send + Sync {
    /// Native dimensions, read without decoding pixels where possible
    fn bounds(&self, bytes: &[u8]) -> LoadResult<(u32, u32)>;

    /// Decode to a newly allocated RGBA image, subsampled by `sample_size`
    ///
    /// The result should measure [`sampled_dimensions`] of the native size.
    fn decode(&self, bytes: &[u8], sample_size: u32) -> LoadResult<RgbaImage>;

    /// Decode straight into `buffer`, which measures [`sampled_dimensions`]
    /// of the bounds reported for `bytes`
    ///
    /// An error leaves the buffer contents unspecified; the caller returns it
    /// to the pool and decodes again with [`decode`](Self::decode). The
    /// default goes through `decode` and copies, so it only saves the
    /// allocation when overridden.
    fn decode_into(&self, bytes: &[u8], sample_size: u32, buffer: &mut PooledBuffer) -> LoadResult<()> {
        let image = self.decode(bytes, sample_size)?;
        if buffer.matches(image.width(), image.height(), buffer.format()) && buffer.write_rgba(image.as_raw()) {
            Ok(())
        } else {
            Err(LoadError::Decode(format!(
                "decoded {}x{} does not fit a {}x{} buffer",
                image.width(),
                image.height(),
                buffer.width(),
                buffer.height()
            )))
        }
    }
}

fn decode_error(err: impl std::fmt::Display) -> LoadError {
    LoadError::Decode(err.to_string())
}

/// Decoder backed by the `image` crate
///
/// Handles every format enabled in the workspace (PNG, JPEG, GIF, WebP,
/// BMP), detected from the content. RGBA8 sources decoded at full size into
/// an Rgba8888 buffer are read directly into the buffer's storage.
/// Everything else is decoded at native size and reduced or converted into
/// the buffer, since the codecs cannot subsample while decoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecoder;

impl DefaultDecoder {
    fn reader(bytes: &[u8]) -> LoadResult<ImageReader<Cursor<&[u8]>>> {
        ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(decode_error)
    }
}

impl Decoder for DefaultDecoder {
    fn bounds(&self, bytes: &[u8]) -> LoadResult<(u32, u32)> {
        Self::reader(bytes)?.into_dimensions().map_err(decode_error)
    }

    fn decode(&self, bytes: &[u8], sample_size: u32) -> LoadResult<RgbaImage> {
        let decoded = Self::reader(bytes)?
            .decode()
            .map_err(decode_error)?
            .into_rgba8();

        if sample_size <= 1 {
            return Ok(decoded);
        }
        let (width, height) = sampled_dimensions(decoded.width(), decoded.height(), sample_size);
        let mut reduced = vec![0u8; width as usize * height as usize * 4];
        box_reduce_into(&decoded, sample_size, &mut reduced);
        RgbaImage::from_raw(width, height, reduced)
            .ok_or_else(|| LoadError::Decode("reduced image has the wrong length".to_string()))
    }

    fn decode_into(&self, bytes: &[u8], sample_size: u32, buffer: &mut PooledBuffer) -> LoadResult<()> {
        let decoder = Self::reader(bytes)?.into_decoder().map_err(decode_error)?;
        let (width, height) = decoder.dimensions();
        if (buffer.width(), buffer.height()) != sampled_dimensions(width, height, sample_size) {
            return Err(LoadError::Decode(format!(
                "{width}x{height} at 1/{sample_size} does not fit a {}x{} buffer",
                buffer.width(),
                buffer.height()
            )));
        }

        let direct = sample_size <= 1
            && decoder.color_type() == ColorType::Rgba8
            && buffer.format() == PixelFormat::Rgba8888;
        if direct {
            let pixels = buffer
                .pixels_mut()
                .ok_or_else(|| LoadError::Decode("pooled buffer is not writable".to_string()))?;
            if pixels.len() as u64 != decoder.total_bytes() {
                return Err(LoadError::Decode("pooled buffer has the wrong length".to_string()));
            }
            return decoder.read_image(pixels).map_err(decode_error);
        }

        let full = DynamicImage::from_decoder(decoder)
            .map_err(decode_error)?
            .into_rgba8();
        if sample_size <= 1 {
            return if buffer.write_rgba(full.as_raw()) {
                Ok(())
            } else {
                Err(LoadError::Decode("pooled buffer rejected decoded pixels".to_string()))
            };
        }

        if buffer.format() == PixelFormat::Rgba8888 {
            if let Some(pixels) = buffer.pixels_mut() {
                box_reduce_into(&full, sample_size, pixels);
                return Ok(());
            }
        }
        let mut reduced = vec![0u8; buffer.width() as usize * buffer.height() as usize * 4];
        box_reduce_into(&full, sample_size, &mut reduced);
        if buffer.write_rgba(&reduced) {
            Ok(())
        } else {
            Err(LoadError::Decode("pooled buffer rejected decoded pixels".to_string()))
        }
    }
}

/// Average `sample_size` x `sample_size` blocks of `source` into `out`
///
/// `out` holds RGBA8 pixels measuring [`sampled_dimensions`] of the source.
/// Blocks are clipped at the right and bottom edges.
fn box_reduce_into(source: &RgbaImage, sample_size: u32, out: &mut [u8]) {
    let (src_width, src_height) = source.dimensions();
    let (width, height) = sampled_dimensions(src_width, src_height, sample_size);
    let raw = source.as_raw();
    let stride = src_width as usize * 4;

    for y in 0..height {
        let y0 = y * sample_size;
        let y1 = (y0 + sample_size).min(src_height);
        for x in 0..width {
            let x0 = x * sample_size;
            let x1 = (x0 + sample_size).min(src_width);
            let mut sum = [0u32; 4];
            for sy in y0..y1 {
                let row = sy as usize * stride;
                for sx in x0..x1 {
                    let at = row + sx as usize * 4;
                    for (acc, value) in sum.iter_mut().zip(&raw[at..at + 4]) {
                        *acc += u32::from(*value);
                    }
                }
            }
            let count = (y1 - y0) * (x1 - x0);
            let at = (y as usize * width as usize + x as usize) * 4;
            for (dst, acc) in out[at..at + 4].iter_mut().zip(sum) {
                *dst = (acc / count.max(1)) as u8;
            }
        }
    }
}

/// How a source loader wants its bytes decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Requested minimum size
    pub target: Option<(u32, u32)>,
    pub format: PixelFormat,
    /// Resample to exactly `target` after subsampling
    pub exact: bool,
}

impl DecodeOptions {
    pub fn new(target: Option<(u32, u32)>, format: PixelFormat) -> Self {
        Self {
            target,
            format,
            exact: false,
        }
    }

    pub fn exact(mut self) -> Self {
        self.exact = true;
        self
    }
}

/// Decode `bytes` into a buffer, reusing pooled storage when possible
///
/// A pooled buffer matching the post-subsample size is acquired first and
/// decoded into in place. If that fails the buffer goes back to the pool and
/// the bytes are decoded again into a fresh allocation, so a reused buffer
/// never causes a decode failure.
pub fn decode_pooled(
    decoder: &dyn Decoder,
    bytes: &[u8],
    options: DecodeOptions,
    pool: &BufferPool,
) -> LoadResult<PooledBuffer> {
    let (width, height) = decoder.bounds(bytes)?;
    let sample_size = options
        .target
        .map(|(tw, th)| calculate_sample_size(width, height, tw, th))
        .unwrap_or(1);
    let (decoded_width, decoded_height) = sampled_dimensions(width, height, sample_size);

    let mut buffer = match pool.acquire(decoded_width, decoded_height, options.format) {
        Some(mut reused) => match decoder.decode_into(bytes, sample_size, &mut reused) {
            Ok(()) => {
                tracing::trace!(width, height, sample_size, "decoded into pooled buffer");
                reused
            }
            Err(err) => {
                tracing::warn!(error = %err, "decode into pooled buffer failed, retrying with a fresh one");
                pool.release(reused);
                decode_fresh(decoder, bytes, sample_size, options.format)?
            }
        },
        None => decode_fresh(decoder, bytes, sample_size, options.format)?,
    };

    if options.exact {
        if let Some((target_width, target_height)) = options.target {
            if !buffer.matches(target_width, target_height, options.format) {
                buffer = resample(buffer, target_width, target_height, pool)?;
            }
        }
    }

    Ok(buffer)
}

fn decode_fresh(
    decoder: &dyn Decoder,
    bytes: &[u8],
    sample_size: u32,
    format: PixelFormat,
) -> LoadResult<PooledBuffer> {
    let image = decoder.decode(bytes, sample_size)?;
    if image.as_raw().is_empty() {
        return Err(LoadError::Decode("decoder returned no data".to_string()));
    }
    tracing::trace!(width = image.width(), height = image.height(), sample_size, "decoded image");
    Ok(PooledBuffer::from_rgba_image(image, format))
}

/// Move decoded pixels into `reused` if they fit, else into a new buffer
fn fill_buffer(
    image: RgbaImage,
    reused: Option<PooledBuffer>,
    format: PixelFormat,
    pool: &BufferPool,
) -> PooledBuffer {
    if let Some(mut buffer) = reused {
        if buffer.matches(image.width(), image.height(), format) && buffer.write_rgba(image.as_raw()) {
            tracing::trace!(width = image.width(), height = image.height(), "decoded into pooled buffer");
            return buffer;
        }
        tracing::warn!(
            width = image.width(),
            height = image.height(),
            "pooled buffer rejected decoded pixels, allocating a fresh one"
        );
        pool.release(buffer);
    }
    PooledBuffer::from_rgba_image(image, format)
}

/// Scale `buffer` to exactly `width` x `height`, returning it to the pool
fn resample(buffer: PooledBuffer, width: u32, height: u32, pool: &BufferPool) -> LoadResult<PooledBuffer> {
    let format = buffer.format();
    let source = buffer
        .to_rgba_image()
        .ok_or_else(|| LoadError::Decode("intermediate buffer has no pixels".to_string()))?;
    let scaled = imageops::resize(&source, width, height, FilterType::Triangle);

    let reused = pool.acquire(width, height, format);
    let output = fill_buffer(scaled, reused, format, pool);
    if buffer.is_reusable() {
        pool.release(buffer);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
        });
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    /// Reports one size in the bounds pass and decodes another
    #[derive(Default)]
    struct LyingDecoder {
        decodes: AtomicUsize,
    }

    impl Decoder for LyingDecoder {
        fn bounds(&self, _bytes: &[u8]) -> LoadResult<(u32, u32)> {
            Ok((8, 8))
        }

        fn decode(&self, _bytes: &[u8], _sample_size: u32) -> LoadResult<RgbaImage> {
            self.decodes.fetch_add(1, Ordering::SeqCst);
            Ok(RgbaImage::from_pixel(6, 6, Rgba([1, 2, 3, 255])))
        }
    }

    #[test]
    fn test_sample_size_halving_rule() {
        assert_eq!(calculate_sample_size(4000, 3000, 500, 500), 4);
        assert_eq!(calculate_sample_size(400, 300, 100, 100), 2);
        assert_eq!(calculate_sample_size(1024, 1024, 256, 256), 4);
        assert_eq!(calculate_sample_size(1025, 1025, 256, 256), 4);
        assert_eq!(calculate_sample_size(100, 100, 100, 100), 1);
        assert_eq!(calculate_sample_size(50, 50, 100, 100), 1);
        assert_eq!(calculate_sample_size(100, 100, 0, 0), 64);
    }

    #[test]
    fn test_sampled_dimensions() {
        assert_eq!(sampled_dimensions(4000, 3000, 4), (1000, 750));
        assert_eq!(sampled_dimensions(3, 1, 4), (1, 1));
    }

    #[test]
    fn test_decode_native_size() {
        let pool = BufferPool::new(4);
        let bytes = png_bytes(40, 30);

        let buffer = decode_pooled(
            &DefaultDecoder,
            &bytes,
            DecodeOptions::new(None, PixelFormat::Rgba8888),
            &pool,
        )
        .unwrap();

        assert_eq!((buffer.width(), buffer.height()), (40, 30));
        assert_eq!(&buffer.pixels()[..4], &[0, 0, 128, 255]);
    }

    #[test]
    fn test_decode_subsampled() {
        let pool = BufferPool::new(4);
        let bytes = png_bytes(400, 300);

        let buffer = decode_pooled(
            &DefaultDecoder,
            &bytes,
            DecodeOptions::new(Some((100, 100)), PixelFormat::Rgba8888),
            &pool,
        )
        .unwrap();

        assert_eq!((buffer.width(), buffer.height()), (200, 150));
    }

    #[test]
    fn test_decode_reuses_pooled_buffer() {
        let pool = BufferPool::new(4);
        pool.release(PooledBuffer::new(200, 150, PixelFormat::Rgba8888));
        let storage = pool.acquire(200, 150, PixelFormat::Rgba8888).unwrap();
        let storage_ptr = storage.pixels().as_ptr();
        pool.release(storage);
        let bytes = png_bytes(400, 300);

        let buffer = decode_pooled(
            &DefaultDecoder,
            &bytes,
            DecodeOptions::new(Some((100, 100)), PixelFormat::Rgba8888),
            &pool,
        )
        .unwrap();

        assert_eq!((buffer.width(), buffer.height()), (200, 150));
        assert_eq!(buffer.pixels().as_ptr(), storage_ptr);
        assert!(pool.is_empty());
        // Top-left 2x2 block: x in 0..2, y in 0..2
        assert_eq!(&buffer.pixels()[..4], &[0, 0, 128, 255]);
        assert_eq!(&buffer.pixels()[4..8], &[2, 0, 128, 255]);
    }

    #[test]
    fn test_full_size_decode_reads_into_pooled_storage() {
        let pool = BufferPool::new(4);
        let pooled = PooledBuffer::new(40, 30, PixelFormat::Rgba8888);
        let storage_ptr = pooled.pixels().as_ptr();
        pool.release(pooled);

        let buffer = decode_pooled(
            &DefaultDecoder,
            &png_bytes(40, 30),
            DecodeOptions::new(None, PixelFormat::Rgba8888),
            &pool,
        )
        .unwrap();

        assert_eq!(buffer.pixels().as_ptr(), storage_ptr);
        assert_eq!(&buffer.pixels()[..4], &[0, 0, 128, 255]);
        let last = buffer.pixels().len() - 4;
        assert_eq!(&buffer.pixels()[last..], &[39, 29, 128, 255]);
    }

    #[test]
    fn test_incompatible_pooled_buffer_falls_back() {
        let pool = BufferPool::new(4);
        pool.release(PooledBuffer::new(8, 8, PixelFormat::Rgba8888));
        let decoder = LyingDecoder::default();

        let buffer = decode_pooled(
            &decoder,
            b"ignored",
            DecodeOptions::new(None, PixelFormat::Rgba8888),
            &pool,
        )
        .unwrap();

        assert_eq!((buffer.width(), buffer.height()), (6, 6));
        // Once into the pooled buffer, once more into a fresh one
        assert_eq!(decoder.decodes.load(Ordering::SeqCst), 2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_box_reduce_averages_blocks() {
        let source = RgbaImage::from_fn(4, 2, |x, _| {
            if x % 2 == 0 {
                Rgba([0, 100, 200, 255])
            } else {
                Rgba([10, 110, 210, 255])
            }
        });
        let mut out = vec![0u8; 2 * 4];
        box_reduce_into(&source, 2, &mut out);
        assert_eq!(out, vec![5, 105, 205, 255, 5, 105, 205, 255]);
    }

    #[test]
    fn test_exact_resample_returns_intermediate() {
        let pool = BufferPool::new(4);
        let bytes = png_bytes(400, 300);

        let buffer = decode_pooled(
            &DefaultDecoder,
            &bytes,
            DecodeOptions::new(Some((100, 100)), PixelFormat::Rgba8888).exact(),
            &pool,
        )
        .unwrap();

        assert_eq!((buffer.width(), buffer.height()), (100, 100));
        let stats = pool.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.byte_size, 200 * 150 * 4);
    }

    #[test]
    fn test_decode_rgb565() {
        let pool = BufferPool::new(4);
        let bytes = png_bytes(10, 10);

        let buffer = decode_pooled(
            &DefaultDecoder,
            &bytes,
            DecodeOptions::new(None, PixelFormat::Rgb565),
            &pool,
        )
        .unwrap();

        assert_eq!(buffer.format(), PixelFormat::Rgb565);
        assert_eq!(buffer.byte_count(), 10 * 10 * 2);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let pool = BufferPool::new(4);
        let result = decode_pooled(
            &DefaultDecoder,
            b"definitely not an image",
            DecodeOptions::new(None, PixelFormat::Rgba8888),
            &pool,
        );
        assert!(matches!(result, Err(LoadError::Decode(_))));
    }
}
