//! Reusable pixel buffers
//!
//! A [`PooledBuffer`] is a block of pixel storage tagged with its dimensions,
//! pixel format, and lifecycle flags. Buffers move between three owners: an
//! active decode/render operation, the [`BufferPool`](crate::BufferPool), or
//! the [`MemoryCache`](crate::MemoryCache). Rust ownership enforces that a
//! buffer has exactly one of those owners at a time.

use image::RgbaImage;

/// Pixel layout of a buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8 bits per channel, RGBA order
    #[default]
    Rgba8888,
    /// 16-bit packed RGB (5-6-5), little endian, no alpha
    Rgb565,
}

impl PixelFormat {
    /// Number of bytes used to store a single pixel
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8888 => 4,
            PixelFormat::Rgb565 => 2,
        }
    }

    /// Byte length of a `width` x `height` buffer in this format
    pub fn byte_len(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }

    /// Short lowercase name, used in logs and cache keys
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Rgba8888 => "rgba8888",
            PixelFormat::Rgb565 => "rgb565",
        }
    }
}

/// Mutable pixel storage tracked for reuse rather than disposal
///
/// Pixel data is stored row-major with no padding between rows.
#[derive(Debug)]
pub struct PooledBuffer {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    mutable: bool,
    recycled: bool,
}

impl PooledBuffer {
    /// Allocate a new zero-filled, mutable buffer
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            pixels: vec![0u8; format.byte_len(width, height)],
            width,
            height,
            format,
            mutable: true,
            recycled: false,
        }
    }

    /// Wrap existing pixel data
    ///
    /// Returns `None` if `pixels` does not have exactly the byte length implied
    /// by the dimensions and format.
    pub fn from_pixels(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Option<Self> {
        if pixels.len() != format.byte_len(width, height) {
            return None;
        }
        Some(Self {
            pixels,
            width,
            height,
            format,
            mutable: true,
            recycled: false,
        })
    }

    /// Convert a decoded RGBA image into a buffer of the requested format
    pub fn from_rgba_image(image: RgbaImage, format: PixelFormat) -> Self {
        let (width, height) = image.dimensions();
        match format {
            PixelFormat::Rgba8888 => Self {
                pixels: image.into_raw(),
                width,
                height,
                format,
                mutable: true,
                recycled: false,
            },
            PixelFormat::Rgb565 => {
                let mut buffer = Self::new(width, height, format);
                buffer.write_rgba(image.as_raw());
                buffer
            }
        }
    }

    /// Overwrite the buffer contents from tightly packed RGBA8 pixels
    ///
    /// `rgba` must hold exactly `width * height * 4` bytes. Returns `false`
    /// (leaving the buffer untouched) if the length does not match or the
    /// buffer is immutable or recycled.
    pub fn write_rgba(&mut self, rgba: &[u8]) -> bool {
        if !self.is_reusable() {
            return false;
        }
        if rgba.len() != self.width as usize * self.height as usize * 4 {
            return false;
        }
        match self.format {
            PixelFormat::Rgba8888 => self.pixels.copy_from_slice(rgba),
            PixelFormat::Rgb565 => {
                for (dst, src) in self.pixels.chunks_exact_mut(2).zip(rgba.chunks_exact(4)) {
                    let packed = pack_rgb565(src[0], src[1], src[2]);
                    dst.copy_from_slice(&packed.to_le_bytes());
                }
            }
        }
        true
    }

    /// Expand the buffer into an RGBA image
    ///
    /// Rgb565 pixels are expanded to 8 bits per channel with opaque alpha.
    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        let rgba = match self.format {
            PixelFormat::Rgba8888 => self.pixels.clone(),
            PixelFormat::Rgb565 => {
                let mut out = Vec::with_capacity(self.width as usize * self.height as usize * 4);
                for px in self.pixels.chunks_exact(2) {
                    let (r, g, b) = unpack_rgb565(u16::from_le_bytes([px[0], px[1]]));
                    out.extend_from_slice(&[r, g, b, 255]);
                }
                out
            }
        };
        RgbaImage::from_raw(self.width, self.height, rgba)
    }

    /// Fill the pixel storage with the neutral value (all zero bytes)
    pub fn clear(&mut self) {
        self.pixels.fill(0);
    }

    /// Mark the buffer recycled and release its storage
    ///
    /// A recycled buffer is never pooled, cached or read again.
    pub fn recycle(&mut self) {
        self.recycled = true;
        self.pixels = Vec::new();
    }

    /// Mark the buffer immutable; immutable buffers are never pooled
    pub fn set_immutable(&mut self) {
        self.mutable = false;
    }

    /// Whether the buffer may be handed to the pool for reuse
    pub fn is_reusable(&self) -> bool {
        self.mutable && !self.recycled
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn is_recycled(&self) -> bool {
        self.recycled
    }

    /// Whether this buffer matches `width` x `height` in `format` exactly
    pub fn matches(&self, width: u32, height: u32, format: PixelFormat) -> bool {
        self.width == width && self.height == height && self.format == format
    }

    /// Size of the pixel storage in bytes
    pub fn byte_count(&self) -> usize {
        self.pixels.len()
    }

    /// Size in kilobytes, rounded toward zero
    pub fn size_kb(&self) -> usize {
        self.byte_count() / 1024
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Mutable access to the pixel storage
    ///
    /// Returns `None` for immutable or recycled buffers.
    pub fn pixels_mut(&mut self) -> Option<&mut [u8]> {
        if self.is_reusable() {
            Some(&mut self.pixels)
        } else {
            None
        }
    }
}

fn pack_rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

fn unpack_rgb565(value: u16) -> (u8, u8, u8) {
    let r = ((value >> 11) & 0x1f) as u8;
    let g = ((value >> 5) & 0x3f) as u8;
    let b = (value & 0x1f) as u8;
    ((r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2))
}
