use std::sync::Arc;

use async_trait::async_trait;
use image::DynamicImage;
use tokio_util::sync::CancellationToken;

use crate::models::job::{ErrorCode, Job, JobStage, StageError};
use crate::pipeline::PipelineStage;

/// A pixel-level transform applied between decode and encode.
pub trait PixelTransform: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, image: DynamicImage) -> Result<DynamicImage, String>;
}

/// Runs the configured transforms in order. With none configured the stage
/// passes pixels through untouched.
#[derive(Default, Clone)]
pub struct ProcessStage {
    transforms: Vec<Arc<dyn PixelTransform>>,
}

impl ProcessStage {
    pub fn with_transform(mut self, transform: Arc<dyn PixelTransform>) -> Self {
        self.transforms.push(transform);
        self
    }
}

fn run_transforms(
    transforms: &[Arc<dyn PixelTransform>],
    mut image: DynamicImage,
) -> Result<DynamicImage, StageError> {
    for transform in transforms {
        image = transform.apply(image).map_err(|e| {
            StageError::new(
                ErrorCode::ProcessFailed,
                format!("{}: {}", transform.name(), e),
            )
        })?;
    }
    Ok(image)
}

#[async_trait]
impl PipelineStage for ProcessStage {
    fn stage(&self) -> JobStage {
        JobStage::Processing
    }

    async fn process(&self, _ctx: &CancellationToken, job: &mut Job) -> Result<(), StageError> {
        let image = job
            .pixels
            .take()
            .ok_or_else(|| StageError::new(ErrorCode::ProcessFailed, "no decoded pixels"))?;

        if self.transforms.is_empty() {
            job.pixels = Some(image);
            return Ok(());
        }

        let transforms = self.transforms.clone();
        let image = tokio::task::spawn_blocking(move || run_transforms(&transforms, image))
            .await
            .map_err(|e| {
                StageError::new(ErrorCode::ProcessFailed, format!("transform panicked: {}", e))
            })??;

        job.pixels = Some(image);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::claims::TrustClaims;
    use bytes::Bytes;
    use image::{ImageBuffer, Rgb};

    struct Grayscale;

    impl PixelTransform for Grayscale {
        fn name(&self) -> &'static str {
            "grayscale"
        }

        fn apply(&self, image: DynamicImage) -> Result<DynamicImage, String> {
            Ok(image.grayscale())
        }
    }

    struct Broken;

    impl PixelTransform for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn apply(&self, _image: DynamicImage) -> Result<DynamicImage, String> {
            Err("unsupported colour space".to_string())
        }
    }

    fn job_with_pixels() -> Job {
        let claims = TrustClaims {
            subject: "user-1".to_string(),
            issuer: "upload-gateway".to_string(),
            job_id: "job-1".to_string(),
            storage_key: "uploads/job-1.jpg".to_string(),
            content_type: "image/png".to_string(),
            max_size: 4096,
            issued_at: 0,
            expires_at: i64::MAX,
        };
        let mut job = Job::new(claims, Bytes::new());
        job.pixels = Some(DynamicImage::ImageRgb8(ImageBuffer::from_pixel(
            3,
            2,
            Rgb([200, 10, 10]),
        )));
        job
    }

    #[tokio::test]
    async fn test_identity_by_default() {
        let mut job = job_with_pixels();
        ProcessStage::default()
            .process(&CancellationToken::new(), &mut job)
            .await
            .unwrap();
        let pixels = job.pixels.unwrap().to_rgb8();
        assert_eq!(pixels.get_pixel(2, 1), &Rgb([200, 10, 10]));
    }

    #[tokio::test]
    async fn test_transform_applied() {
        let mut job = job_with_pixels();
        ProcessStage::default()
            .with_transform(Arc::new(Grayscale))
            .process(&CancellationToken::new(), &mut job)
            .await
            .unwrap();
        assert!(matches!(job.pixels, Some(DynamicImage::ImageLuma8(_))));
    }

    #[tokio::test]
    async fn test_transform_error_classified() {
        let mut job = job_with_pixels();
        let err = ProcessStage::default()
            .with_transform(Arc::new(Broken))
            .process(&CancellationToken::new(), &mut job)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ProcessFailed);
        assert!(err.message.starts_with("broken:"));
    }
}
