use std::io::Cursor;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageReader, Rgb, RgbImage};

use crate::config::quality_percent;
use crate::error::{error_chain_text, PipelineError};

pub const NORMALIZED_MIME_TYPE: &str = "image/jpeg";

const DECODE_DIAGNOSTIC_MAX_CHARS: usize = 160;

/// Raw image bytes as handed over by the acquisition layer, plus their natural size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    bytes: Vec<u8>,
    width: u32,
    height: u32,
}

impl SourceImage {
    /// Probes the header only; full decode happens in [`normalize`].
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, PipelineError> {
        let (width, height) = ImageReader::new(Cursor::new(bytes.as_slice()))
            .with_guessed_format()
            .map_err(|err| decode_error(&err))?
            .into_dimensions()
            .map_err(|err| decode_error(&err))?;
        Ok(Self {
            bytes,
            width,
            height,
        })
    }

    /// Skips the header probe; lets tests feed bytes that only fail on full decode.
    #[cfg(test)]
    pub(crate) fn unchecked(bytes: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            bytes,
            width,
            height,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedImage {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub quality: f32,
}

impl NormalizedImage {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Width clamped to `max_width`, height scaled by the same ratio. Never upscales.
pub fn target_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width || max_width == 0 {
        return (width, height);
    }
    let scaled = (f64::from(height) * f64::from(max_width) / f64::from(width)).round() as u32;
    (max_width, scaled.max(1))
}

pub fn normalize(
    source: &SourceImage,
    max_width: u32,
    quality: f32,
) -> Result<NormalizedImage, PipelineError> {
    let decoded = image::load_from_memory(source.bytes()).map_err(|err| decode_error(&err))?;
    let (width, height) = target_dimensions(decoded.width(), decoded.height(), max_width);
    let flattened = flatten_onto_white(&decoded);
    let resized = if (width, height) == flattened.dimensions() {
        flattened
    } else {
        imageops::resize(&flattened, width, height, FilterType::Triangle)
    };

    let mut data = Vec::new();
    JpegEncoder::new_with_quality(&mut data, quality_percent(quality))
        .encode_image(&resized)
        .map_err(|err| {
            PipelineError::Decode(format!(
                "jpeg encode failed: {}",
                error_chain_text(&err, DECODE_DIAGNOSTIC_MAX_CHARS)
            ))
        })?;

    Ok(NormalizedImage {
        data,
        mime_type: NORMALIZED_MIME_TYPE.to_string(),
        width,
        height,
        quality,
    })
}

/// Runs [`normalize`] on the blocking pool; the caller suspends until decode settles.
pub async fn normalize_async(
    source: Arc<SourceImage>,
    max_width: u32,
    quality: f32,
) -> Result<NormalizedImage, PipelineError> {
    tokio::task::spawn_blocking(move || normalize(&source, max_width, quality))
        .await
        .map_err(|err| PipelineError::Decode(format!("decoder task failed: {err}")))?
}

fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(
            x,
            y,
            Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]),
        );
    }
    flattened
}

fn decode_error(err: &(dyn std::error::Error + 'static)) -> PipelineError {
    PipelineError::Decode(error_chain_text(err, DECODE_DIAGNOSTIC_MAX_CHARS))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use image::{Rgba, RgbaImage};

    use super::{normalize, normalize_async, target_dimensions, SourceImage};
    use crate::error::PipelineError;
    use crate::test_support::{encode_png, gradient_png};

    #[test]
    fn source_image_probes_natural_size() -> anyhow::Result<()> {
        let source = SourceImage::from_bytes(gradient_png(640, 480))?;
        assert_eq!((source.width(), source.height()), (640, 480));
        Ok(())
    }

    #[test]
    fn narrow_images_keep_their_pixel_size() -> anyhow::Result<()> {
        let source = SourceImage::from_bytes(gradient_png(300, 200))?;
        let normalized = normalize(&source, 512, 0.8)?;
        assert_eq!((normalized.width, normalized.height), (300, 200));
        assert_eq!(normalized.mime_type, "image/jpeg");
        let decoded = image::load_from_memory(&normalized.data)?;
        assert_eq!((decoded.width(), decoded.height()), (300, 200));
        Ok(())
    }

    #[test]
    fn wide_door_is_clamped_to_max_width() -> anyhow::Result<()> {
        let source = SourceImage::from_bytes(gradient_png(2000, 1500))?;
        let normalized = normalize(&source, 1024, 0.8)?;
        assert_eq!((normalized.width, normalized.height), (1024, 768));
        let decoded = image::load_from_memory(&normalized.data)?;
        assert_eq!((decoded.width(), decoded.height()), (1024, 768));
        Ok(())
    }

    #[test]
    fn aspect_ratio_survives_odd_sizes() {
        for (width, height, max) in [(1999, 1001, 512), (3000, 7, 320), (4032, 3024, 512)] {
            let (w, h) = target_dimensions(width, height, max);
            assert_eq!(w, max);
            let before = f64::from(height) / f64::from(width);
            let after = f64::from(h) / f64::from(w);
            assert!(
                (before - after).abs() <= 1.0 / f64::from(w),
                "{width}x{height} -> {w}x{h}"
            );
        }
        assert_eq!(target_dimensions(5000, 1, 320), (320, 1));
        assert_eq!(target_dimensions(512, 900, 512), (512, 900));
    }

    #[test]
    fn transparent_pixels_are_flattened_to_white() -> anyhow::Result<()> {
        let clear = RgbaImage::from_pixel(64, 64, Rgba([0, 0, 0, 0]));
        let source = SourceImage::from_bytes(encode_png(image::DynamicImage::ImageRgba8(clear)))?;
        let normalized = normalize(&source, 320, 0.9)?;
        let decoded = image::load_from_memory(&normalized.data)?.to_rgb8();
        let pixel = decoded.get_pixel(32, 32);
        assert!(pixel.0.iter().all(|channel| *channel >= 245), "{pixel:?}");
        Ok(())
    }

    #[test]
    fn lower_quality_yields_smaller_payloads() -> anyhow::Result<()> {
        let source = SourceImage::from_bytes(gradient_png(400, 300))?;
        let low = normalize(&source, 512, 0.2)?;
        let high = normalize(&source, 512, 1.0)?;
        assert!(low.data.len() < high.data.len());
        assert!(!low.is_empty());
        Ok(())
    }

    #[test]
    fn garbage_bytes_are_a_decode_error() {
        let result = SourceImage::from_bytes(b"definitely not an image".to_vec());
        assert!(matches!(result, Err(PipelineError::Decode(_))));
    }

    #[tokio::test]
    async fn async_normalize_runs_off_the_caller() -> anyhow::Result<()> {
        let source = Arc::new(SourceImage::from_bytes(gradient_png(900, 600))?);
        let normalized = normalize_async(source, 320, 0.8).await?;
        assert_eq!((normalized.width, normalized.height), (320, 213));
        Ok(())
    }
}
