//! Decoded, display-ready media

use crate::fetcher::FetchError;
use image::{ImageFormat, RgbaImage};
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

const BYTES_PER_PIXEL: u64 = 4;

/// A decoded RGBA8 bitmap or video frame.
///
/// The pixel buffer is shared, so cloning an asset is cheap and every waiter
/// on a fetch receives the same allocation. Assets are never mutated after
/// construction; an update is a new asset replacing the old one.
#[derive(Clone)]
pub struct CachedAsset {
    width: u32,
    height: u32,
    pixels: Arc<[u8]>,
}

impl CachedAsset {
    /// Wrap an RGBA8 pixel buffer.
    ///
    /// Fails with [`FetchError::DecodeFailure`] when the buffer length does not
    /// match `width * height * 4`.
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, FetchError> {
        let expected = u64::from(width) * u64::from(height) * BYTES_PER_PIXEL;
        if pixels.len() as u64 != expected {
            return Err(FetchError::DecodeFailure(format!(
                "pixel buffer is {} bytes, expected {} for {}x{}",
                pixels.len(),
                expected,
                width,
                height
            )));
        }

        Ok(Self {
            width,
            height,
            pixels: pixels.into(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Approximate memory held by this asset, in bytes
    pub fn footprint(&self) -> u64 {
        self.pixels.len() as u64
    }

    /// True when both handles share the same pixel allocation
    pub fn ptr_eq(&self, other: &CachedAsset) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }

    /// Re-encode as PNG for transfer to clients
    pub fn encode_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let image = RgbaImage::from_raw(self.width, self.height, self.pixels.to_vec())
            .ok_or_else(|| {
                image::ImageError::Parameter(image::error::ParameterError::from_kind(
                    image::error::ParameterErrorKind::DimensionMismatch,
                ))
            })?;

        let mut buf = Vec::new();
        image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        Ok(buf)
    }
}

impl fmt::Debug for CachedAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedAsset")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("footprint", &self.footprint())
            .finish()
    }
}
