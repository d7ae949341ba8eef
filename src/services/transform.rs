use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};

use crate::models::job::{OutputFormat, ProcessingOptions};

/// Smallest payload that can carry an image header.
pub const MIN_IMAGE_BYTES: usize = 8;

/// Header facts of a validated input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

/// Re-encoded output.
#[derive(Debug, Clone)]
pub struct OptimizedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Validation and output optimization backed by the `image` crate.
///
/// All methods are CPU-bound; async callers run them on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageOptimizer;

impl ImageOptimizer {
    /// Check that `bytes` carry a decodable image header.
    pub fn validate(&self, bytes: &[u8]) -> Result<ImageInfo, TransformError> {
        if bytes.is_empty() {
            return Err(TransformError::Empty);
        }
        if bytes.len() < MIN_IMAGE_BYTES {
            return Err(TransformError::TooSmall(bytes.len()));
        }

        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| TransformError::Invalid(e.to_string()))?;
        let format = reader.format().ok_or(TransformError::UnknownFormat)?;
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| TransformError::Invalid(e.to_string()))?;

        if width == 0 || height == 0 {
            return Err(TransformError::Invalid("image has no pixels".to_string()));
        }

        Ok(ImageInfo {
            format,
            width,
            height,
        })
    }

    /// Dimensions without a full decode, if the header is readable.
    pub fn dimensions(&self, bytes: &[u8]) -> Option<(u32, u32)> {
        ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .ok()?
            .into_dimensions()
            .ok()
    }

    /// Decode, downscale to the requested caps, and re-encode.
    pub fn optimize(
        &self,
        bytes: &[u8],
        options: &ProcessingOptions,
    ) -> Result<OptimizedImage, TransformError> {
        let image = image::load_from_memory(bytes).map_err(TransformError::Decode)?;
        let image = fit_within(image, options.dimension_caps());
        let (width, height) = (image.width(), image.height());

        let mut out = Vec::new();
        let encoded = match options.format {
            OutputFormat::Png => {
                let encoder =
                    PngEncoder::new_with_quality(&mut out, CompressionType::Best, PngFilter::Adaptive);
                image.write_with_encoder(encoder)
            }
            OutputFormat::Jpeg => {
                // JPEG has no alpha channel
                let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
                let encoder = JpegEncoder::new_with_quality(&mut out, options.quality);
                rgb.write_with_encoder(encoder)
            }
            OutputFormat::Webp => {
                let rgba = DynamicImage::ImageRgba8(image.to_rgba8());
                rgba.write_with_encoder(WebPEncoder::new_lossless(&mut out))
            }
        };
        encoded.map_err(TransformError::Encode)?;

        Ok(OptimizedImage {
            bytes: out,
            width,
            height,
        })
    }
}

/// Downscale only; aspect ratio is preserved.
fn fit_within(image: DynamicImage, caps: (Option<u32>, Option<u32>)) -> DynamicImage {
    let max_width = caps.0.unwrap_or(u32::MAX);
    let max_height = caps.1.unwrap_or(u32::MAX);
    if image.width() <= max_width && image.height() <= max_height {
        return image;
    }
    image.resize(max_width, max_height, FilterType::Lanczos3)
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("File is empty or corrupted")]
    Empty,

    #[error("File too small to be a valid image ({0} bytes)")]
    TooSmall(usize),

    #[error("Unrecognized image format")]
    UnknownFormat,

    #[error("Invalid image file: {0}")]
    Invalid(String),

    #[error("Failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Failed to encode image: {0}")]
    Encode(#[source] image::ImageError),
}
