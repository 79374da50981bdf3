use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, ImageReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::job::{Dimensions, ErrorCode, Job, JobStage, StageError};
use crate::pipeline::PipelineStage;

/// Decodes validated bytes into a pixel buffer.
///
/// The header is parsed first and the declared pixel count checked against
/// the ceiling before any pixel buffer is allocated. The decoded buffer
/// carries no metadata; EXIF orientation is applied to the pixels and
/// everything else (including GPS tags) is dropped with the source bytes.
pub struct DecodeStage {
    max_pixels: u64,
    full_decodes: Arc<AtomicU64>,
}

impl DecodeStage {
    pub fn new(max_pixels: u64) -> Self {
        Self {
            max_pixels,
            full_decodes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of times the full-decode path has been entered.
    pub fn full_decode_count(&self) -> u64 {
        self.full_decodes.load(Ordering::SeqCst)
    }

    /// Shared handle on the full-decode counter.
    pub fn full_decode_counter(&self) -> Arc<AtomicU64> {
        self.full_decodes.clone()
    }
}

fn image_format(content_type: &str) -> Option<ImageFormat> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
        "image/png" => Some(ImageFormat::Png),
        "image/webp" => Some(ImageFormat::WebP),
        _ => None,
    }
}

/// Reads only the image header.
pub fn probe_dimensions(raw: &[u8], content_type: &str) -> Result<Dimensions, StageError> {
    let format = image_format(content_type).ok_or_else(|| {
        StageError::new(
            ErrorCode::HeaderUnparseable,
            format!("no decoder for {}", content_type),
        )
    })?;
    let (width, height) = ImageReader::with_format(Cursor::new(raw), format)
        .into_dimensions()
        .map_err(|e| StageError::new(ErrorCode::HeaderUnparseable, e.to_string()))?;
    Ok(Dimensions::new(width, height))
}

/// EXIF orientation tag (1-8), if present and readable.
fn exif_orientation(raw: &[u8]) -> Option<u32> {
    let exif = exif::Reader::new()
        .read_from_container(&mut Cursor::new(raw))
        .ok()?;
    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?
        .value
        .get_uint(0)
}

pub fn apply_orientation(image: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Header check, then full decode with orientation applied.
pub fn decode_bytes(
    raw: &[u8],
    content_type: &str,
    max_pixels: u64,
    full_decodes: &AtomicU64,
) -> Result<(DynamicImage, Dimensions), StageError> {
    let declared = probe_dimensions(raw, content_type)?;
    if declared.pixel_count() > max_pixels {
        return Err(StageError::new(
            ErrorCode::PixelCeilingExceeded,
            format!(
                "{}x{} declares {} pixels, ceiling is {}",
                declared.width,
                declared.height,
                declared.pixel_count(),
                max_pixels
            ),
        ));
    }

    full_decodes.fetch_add(1, Ordering::SeqCst);
    metrics::counter!("upload_full_decodes_total").increment(1);

    // The header was parsed above, so the format is known to be supported.
    let format = image_format(content_type).unwrap_or(ImageFormat::Png);
    let image = ImageReader::with_format(Cursor::new(raw), format)
        .decode()
        .map_err(|e| StageError::new(ErrorCode::DecodeFailed, e.to_string()))?;

    let image = match exif_orientation(raw) {
        Some(orientation) => apply_orientation(image, orientation),
        None => image,
    };
    let dims = Dimensions::new(image.width(), image.height());
    Ok((image, dims))
}

#[async_trait]
impl PipelineStage for DecodeStage {
    fn stage(&self) -> JobStage {
        JobStage::Decoding
    }

    async fn process(&self, _ctx: &CancellationToken, job: &mut Job) -> Result<(), StageError> {
        let raw = job.raw.clone();
        let content_type = job.claims.content_type.clone();
        let max_pixels = self.max_pixels;
        let counter = self.full_decodes.clone();

        let (image, dims) = tokio::task::spawn_blocking(move || {
            decode_bytes(&raw, &content_type, max_pixels, &counter)
        })
        .await
        .map_err(|e| StageError::new(ErrorCode::DecodeFailed, format!("decoder panicked: {}", e)))??;

        debug!(job_id = %job.id, width = dims.width, height = dims.height, "Decoded image");
        job.original = Some(dims);
        job.pixels = Some(image);
        Ok(())
    }
}
