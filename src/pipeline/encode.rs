use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::job::{Dimensions, ErrorCode, Job, JobStage, StageError};
use crate::pipeline::PipelineStage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Png,
    /// Lossless only.
    WebP,
}

impl OutputFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::WebP => "image/webp",
        }
    }
}

/// Target size for an image no wider than `max_width`, keeping the aspect
/// ratio. Never upscales.
pub fn scaled_dimensions(width: u32, height: u32, max_width: u32) -> Dimensions {
    if width <= max_width || width == 0 {
        return Dimensions::new(width, height);
    }
    let w = u64::from(width);
    let scaled = (u64::from(height) * u64::from(max_width) + w / 2) / w;
    Dimensions::new(max_width, scaled.max(1) as u32)
}

/// Resizes to the width ceiling and encodes into the output format.
pub struct EncodeStage {
    max_width: u32,
    format: OutputFormat,
    quality: u8,
}

impl EncodeStage {
    pub fn new(max_width: u32, format: OutputFormat, quality: u8) -> Self {
        Self {
            max_width,
            format,
            quality: quality.clamp(1, 100),
        }
    }
}

pub fn encode_image(
    image: DynamicImage,
    max_width: u32,
    format: OutputFormat,
    quality: u8,
) -> Result<(Vec<u8>, Dimensions), StageError> {
    let target = scaled_dimensions(image.width(), image.height(), max_width);
    let image = if target.width != image.width() {
        image.resize_exact(target.width, target.height, FilterType::Lanczos3)
    } else {
        image
    };

    let mut out = Cursor::new(Vec::new());
    let written = match format {
        OutputFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8())
            .write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality)),
        OutputFormat::Png => {
            DynamicImage::ImageRgba8(image.to_rgba8()).write_with_encoder(PngEncoder::new(&mut out))
        }
        OutputFormat::WebP => DynamicImage::ImageRgba8(image.to_rgba8())
            .write_with_encoder(WebPEncoder::new_lossless(&mut out)),
    };
    written.map_err(|e| StageError::new(ErrorCode::EncodeFailed, e.to_string()))?;

    Ok((out.into_inner(), target))
}

pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[async_trait]
impl PipelineStage for EncodeStage {
    fn stage(&self) -> JobStage {
        JobStage::Encoding
    }

    async fn process(&self, _ctx: &CancellationToken, job: &mut Job) -> Result<(), StageError> {
        let image = job
            .pixels
            .take()
            .ok_or_else(|| StageError::new(ErrorCode::EncodeFailed, "no pixels to encode"))?;
        let (max_width, format, quality) = (self.max_width, self.format, self.quality);

        let (encoded, processed, hash) = tokio::task::spawn_blocking(move || {
            let (encoded, processed) = encode_image(image, max_width, format, quality)?;
            let hash = content_hash(&encoded);
            Ok::<_, StageError>((encoded, processed, hash))
        })
        .await
        .map_err(|e| StageError::new(ErrorCode::EncodeFailed, format!("encoder panicked: {}", e)))??;

        debug!(
            job_id = %job.id,
            width = processed.width,
            height = processed.height,
            bytes = encoded.len(),
            "Encoded image"
        );
        job.processed = Some(processed);
        job.content_hash = Some(hash);
        job.output_content_type = Some(format.content_type());
        job.encoded = Some(Bytes::from(encoded));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgb};

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 64])
        }))
    }

    #[test]
    fn test_scaled_dimensions() {
        assert_eq!(scaled_dimensions(4032, 3024, 1920), Dimensions::new(1920, 1440));
        assert_eq!(scaled_dimensions(800, 600, 1920), Dimensions::new(800, 600));
        assert_eq!(scaled_dimensions(1920, 1080, 1920), Dimensions::new(1920, 1080));
        // Extreme panoramas keep at least one row.
        assert_eq!(scaled_dimensions(100_000, 10, 100), Dimensions::new(100, 1));
    }

    #[test]
    fn test_jpeg_output_is_resized() {
        let (bytes, dims) = encode_image(gradient(400, 300), 192, OutputFormat::Jpeg, 80).unwrap();
        assert_eq!(dims, Dimensions::new(192, 144));
        assert_eq!(&bytes[..3], &[0xFF, 0xD8, 0xFF]);

        let decoded = image::load_from_memory_with_format(&bytes, ImageFormat::Jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (192, 144));
    }

    #[test]
    fn test_png_output_never_upscales() {
        let (bytes, dims) = encode_image(gradient(50, 20), 192, OutputFormat::Png, 80).unwrap();
        assert_eq!(dims, Dimensions::new(50, 20));
        let decoded = image::load_from_memory_with_format(&bytes, ImageFormat::Png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (50, 20));
    }

    #[test]
    fn test_webp_output_signature() {
        let (bytes, _) = encode_image(gradient(16, 16), 192, OutputFormat::WebP, 80).unwrap();
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WEBP");
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
