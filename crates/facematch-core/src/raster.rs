//! Decoded RGBA rasters: decoding, cropping and bilinear resampling.

use crate::types::CropRegion;
use image::RgbaImage;
use std::path::PathBuf;
use thiserror::Error;

/// Bytes per pixel (R, G, B, A).
pub const CHANNELS: usize = 4;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed image: {0}")]
    Malformed(#[from] image::ImageError),
    #[error("image dimensions are zero")]
    ZeroDimensions,
    #[error("invalid RGBA length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// A decoded image: row-major RGBA samples.
///
/// The buffer is never mutated after construction; cropping and resizing
/// produce new images.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl std::fmt::Debug for PixelImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl PixelImage {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, DecodeError> {
        if width == 0 || height == 0 {
            return Err(DecodeError::ZeroDimensions);
        }
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(DecodeError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// An image where every pixel is `rgba`.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self, DecodeError> {
        let count = width as usize * height as usize;
        let data = rgba.iter().copied().cycle().take(count * CHANNELS).collect();
        Self::new(width, height, data)
    }

    /// Build an image by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(
        width: u32,
        height: u32,
        mut f: impl FnMut(u32, u32) -> [u8; 4],
    ) -> Result<Self, DecodeError> {
        let mut data = Vec::with_capacity(width as usize * height as usize * CHANNELS);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&f(x, y));
            }
        }
        Self::new(width, height, data)
    }

    pub fn from_rgba_image(img: RgbaImage) -> Result<Self, DecodeError> {
        let (width, height) = img.dimensions();
        Self::new(width, height, img.into_raw())
    }

    pub fn to_rgba_image(&self) -> RgbaImage {
        RgbaImage::from_fn(self.width, self.height, |x, y| image::Rgba(self.pixel(x, y)))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Iterate pixels in row-major order as `[r, g, b, a]` slices.
    pub fn pixels(&self) -> std::slice::ChunksExact<'_, u8> {
        self.data.chunks_exact(CHANNELS)
    }

    /// Pixel at `(x, y)`. Panics when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let off = (y as usize * self.width as usize + x as usize) * CHANNELS;
        [
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ]
    }

    /// Copy out `region`, or `None` if it does not lie fully inside the image.
    pub fn crop(&self, region: CropRegion) -> Option<PixelImage> {
        if region.width == 0 || region.height == 0 {
            return None;
        }
        let x_end = region.x.checked_add(region.width)?;
        let y_end = region.y.checked_add(region.height)?;
        if x_end > self.width || y_end > self.height {
            return None;
        }

        let stride = self.width as usize * CHANNELS;
        let row_len = region.width as usize * CHANNELS;
        let mut data = Vec::with_capacity(row_len * region.height as usize);
        for y in region.y..y_end {
            let start = y as usize * stride + region.x as usize * CHANNELS;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }

        Some(PixelImage {
            width: region.width,
            height: region.height,
            data,
        })
    }

    /// Resample to `new_width` × `new_height` with bilinear interpolation.
    ///
    /// Pixel centres are aligned (`src = (dst + 0.5) * scale - 0.5`), so a
    /// same-size resize is an exact copy. Deterministic for identical input.
    pub fn resize_bilinear(&self, new_width: u32, new_height: u32) -> PixelImage {
        let new_width = new_width.max(1);
        let new_height = new_height.max(1);
        if new_width == self.width && new_height == self.height {
            return self.clone();
        }

        let (w, h) = (self.width as usize, self.height as usize);
        let (nw, nh) = (new_width as usize, new_height as usize);
        let scale_x = w as f32 / nw as f32;
        let scale_y = h as f32 / nh as f32;

        let mut out = vec![0u8; nw * nh * CHANNELS];
        for y in 0..nh {
            let src_y = ((y as f32 + 0.5) * scale_y - 0.5).max(0.0);
            let y0 = (src_y.floor() as usize).min(h - 1);
            let y1 = (y0 + 1).min(h - 1);
            let fy = (src_y - y0 as f32).clamp(0.0, 1.0);

            for x in 0..nw {
                let src_x = ((x as f32 + 0.5) * scale_x - 0.5).max(0.0);
                let x0 = (src_x.floor() as usize).min(w - 1);
                let x1 = (x0 + 1).min(w - 1);
                let fx = (src_x - x0 as f32).clamp(0.0, 1.0);

                let tl = (y0 * w + x0) * CHANNELS;
                let tr = (y0 * w + x1) * CHANNELS;
                let bl = (y1 * w + x0) * CHANNELS;
                let br = (y1 * w + x1) * CHANNELS;
                let dst = (y * nw + x) * CHANNELS;

                for c in 0..CHANNELS {
                    let val = self.data[tl + c] as f32 * (1.0 - fx) * (1.0 - fy)
                        + self.data[tr + c] as f32 * fx * (1.0 - fy)
                        + self.data[bl + c] as f32 * (1.0 - fx) * fy
                        + self.data[br + c] as f32 * fx * fy;
                    out[dst + c] = val.round().clamp(0.0, 255.0) as u8;
                }
            }
        }

        PixelImage {
            width: new_width,
            height: new_height,
            data: out,
        }
    }
}

/// Where a photo comes from before decoding.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Encoded image file on disk.
    Path(PathBuf),
    /// Encoded image bytes (PNG, JPEG, ...).
    Bytes(Vec<u8>),
    /// Already decoded.
    Decoded(PixelImage),
}

impl From<PixelImage> for ImageSource {
    fn from(img: PixelImage) -> Self {
        ImageSource::Decoded(img)
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::Path(path)
    }
}

/// Decode a source into RGBA pixels.
///
/// File reads suspend; format decoding runs inline.
pub async fn decode_image(source: ImageSource) -> Result<PixelImage, DecodeError> {
    let bytes = match source {
        ImageSource::Decoded(img) => return Ok(img),
        ImageSource::Bytes(bytes) => bytes,
        ImageSource::Path(path) => {
            tokio::fs::read(&path)
                .await
                .map_err(|source| DecodeError::Unreadable {
                    path: path.display().to_string(),
                    source,
                })?
        }
    };

    let decoded = image::load_from_memory(&bytes)?;
    let img = PixelImage::from_rgba_image(decoded.into_rgba8())?;
    tracing::debug!(width = img.width(), height = img.height(), "decoded image");
    Ok(img)
}
