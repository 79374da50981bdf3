//! Shared helpers: trust-claim minting, in-memory images and an in-process
//! pipeline wired to the memory broker and object store.

#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use image_relay::models::claims::TrustClaims;
use image_relay::models::job::JobStage;
use image_relay::models::progress::ProgressRecord;
use image_relay::models::result::ResultRecord;
use image_relay::pipeline::decode::DecodeStage;
use image_relay::pipeline::encode::EncodeStage;
use image_relay::pipeline::process::ProcessStage;
use image_relay::pipeline::upload::UploadStage;
use image_relay::pipeline::validate::ValidateStage;
use image_relay::pipeline::{Orchestrator, PipelineConfig, StageSlot};
use image_relay::services::broker::{BrokerConfig, BrokerError, ProgressStore};
use image_relay::services::intake::Intake;
use image_relay::services::memory::MemoryBroker;
use image_relay::services::progress::ProgressReporter;
use image_relay::services::retry::RetryPolicy;
use image_relay::services::sink::ResultSink;
use image_relay::services::storage::MemoryObjectStore;
use image_relay::services::token::TokenVerifier;

pub const ISSUER: &str = "upload-gateway";
const PRIVATE_KEY: &str = include_str!("../fixtures/ed25519_private.pem");
const PUBLIC_KEY: &str = include_str!("../fixtures/ed25519_public.pem");

pub fn claims(job_id: &str, content_type: &str) -> TrustClaims {
    let now = Utc::now().timestamp();
    TrustClaims {
        subject: "user-42".to_string(),
        issuer: ISSUER.to_string(),
        job_id: job_id.to_string(),
        storage_key: format!("processed/{}.jpg", job_id),
        content_type: content_type.to_string(),
        max_size: 5 * 1024 * 1024,
        issued_at: now,
        expires_at: now + 600,
    }
}

pub fn sign(claims: &TrustClaims) -> String {
    let key = EncodingKey::from_ed_pem(PRIVATE_KEY.as_bytes()).unwrap();
    encode(&Header::new(Algorithm::EdDSA), claims, &key).unwrap()
}

pub fn verifier() -> TokenVerifier {
    TokenVerifier::from_pem(PUBLIC_KEY.as_bytes(), ISSUER).unwrap()
}

fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 90])
    }))
}

pub fn png_bytes(width: u32, height: u32) -> Bytes {
    let mut out = Cursor::new(Vec::new());
    gradient(width, height)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    Bytes::from(out.into_inner())
}

pub fn jpeg_bytes(width: u32, height: u32) -> Bytes {
    let mut out = Cursor::new(Vec::new());
    gradient(width, height)
        .write_to(&mut out, ImageFormat::Jpeg)
        .unwrap();
    Bytes::from(out.into_inner())
}

/// A JPEG carrying an EXIF APP1 segment with the given orientation tag.
pub fn jpeg_with_orientation(width: u32, height: u32, orientation: u16) -> Bytes {
    let plain = jpeg_bytes(width, height);
    let [hi, lo] = orientation.to_be_bytes();
    let app1: Vec<u8> = [
        &[0xFF, 0xE1, 0x00, 0x22][..],
        b"Exif\0\0",
        // Big-endian TIFF header, first IFD at offset 8.
        b"MM\x00\x2A\x00\x00\x00\x08",
        // One entry: Orientation (0x0112), SHORT, count 1.
        &[0x00, 0x01, 0x01, 0x12, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01],
        &[hi, lo, 0x00, 0x00],
        &[0x00, 0x00, 0x00, 0x00],
    ]
    .concat();

    let mut out = Vec::with_capacity(plain.len() + app1.len());
    out.extend_from_slice(&plain[..2]);
    out.extend_from_slice(&app1);
    out.extend_from_slice(&plain[2..]);
    Bytes::from(out)
}

/// A JPEG whose EXIF segment carries an orientation and a GPS latitude reference.
pub fn jpeg_with_location(width: u32, height: u32) -> Bytes {
    let plain = jpeg_bytes(width, height);
    let app1: Vec<u8> = [
        &[0xFF, 0xE1, 0x00, 0x40][..],
        b"Exif\0\0",
        b"MM\x00\x2A\x00\x00\x00\x08",
        // IFD0: Orientation = 1, GPSInfo pointer to offset 38.
        &[0x00, 0x02],
        &[0x01, 0x12, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00],
        &[0x88, 0x25, 0x00, 0x04, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x26],
        &[0x00, 0x00, 0x00, 0x00],
        // GPS IFD: GPSLatitudeRef = "N".
        &[0x00, 0x01],
        &[0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x02, b'N', 0x00, 0x00, 0x00],
        &[0x00, 0x00, 0x00, 0x00],
    ]
    .concat();

    let mut out = Vec::with_capacity(plain.len() + app1.len());
    out.extend_from_slice(&plain[..2]);
    out.extend_from_slice(&app1);
    out.extend_from_slice(&plain[2..]);
    Bytes::from(out)
}

/// Progress store that keeps every write, in order.
pub struct RecordingProgress {
    inner: MemoryBroker,
    history: Mutex<Vec<(String, JobStage)>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self {
            inner: MemoryBroker::default(),
            history: Mutex::new(Vec::new()),
        }
    }

    pub async fn stages_for(&self, job_id: &str) -> Vec<JobStage> {
        self.history
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, stage)| *stage)
            .collect()
    }
}

#[async_trait]
impl ProgressStore for RecordingProgress {
    async fn put(&self, job_id: &str, record: &ProgressRecord) -> Result<(), BrokerError> {
        self.history
            .lock()
            .await
            .push((job_id.to_string(), record.stage));
        self.inner.put(job_id, record).await
    }

    async fn get(&self, job_id: &str) -> Result<Option<ProgressRecord>, BrokerError> {
        self.inner.get(job_id).await
    }

    async fn remove(&self, job_id: &str) -> Result<(), BrokerError> {
        self.inner.remove(job_id).await
    }
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        queue_capacity: 16,
        max_width: 192,
        upload_retry: RetryPolicy::bounded(3, Duration::from_millis(1)),
        ..PipelineConfig::default()
    }
}

/// The full worker side, in process.
pub struct Harness {
    pub broker: Arc<MemoryBroker>,
    pub progress: Arc<RecordingProgress>,
    pub store: Arc<MemoryObjectStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub intake: Intake,
    pub full_decodes: Arc<AtomicU64>,
}

impl Harness {
    pub fn new(config: PipelineConfig) -> Self {
        let broker = Arc::new(MemoryBroker::new(BrokerConfig::default()));
        let progress = Arc::new(RecordingProgress::new());
        let store = Arc::new(MemoryObjectStore::default());

        let decode = DecodeStage::new(config.max_pixels);
        let full_decodes = decode.full_decode_counter();
        let stages = vec![
            StageSlot::new(ValidateStage, config.validate_workers),
            StageSlot::new(decode, config.decode_workers),
            StageSlot::new(ProcessStage::default(), config.process_workers),
            StageSlot::new(
                EncodeStage::new(config.max_width, config.output_format, config.output_quality),
                config.encode_workers,
            ),
            StageSlot::new(
                UploadStage::new(store.clone(), config.upload_retry.clone()),
                config.upload_workers,
            ),
        ];

        let reporter = ProgressReporter::new(progress.clone());
        let orchestrator = Arc::new(Orchestrator::new(
            stages,
            config.queue_capacity,
            config.sink_workers,
            reporter.clone(),
            ResultSink::new(broker.clone()),
        ));
        let intake = Intake::new(verifier(), broker.clone(), reporter, orchestrator.clone());

        Self {
            broker,
            progress,
            store,
            orchestrator,
            intake,
            full_decodes,
        }
    }

    /// Closes intake and runs the pipeline until every queued job is published.
    pub async fn drain(&self) -> Vec<(String, ResultRecord)> {
        self.orchestrator.close().await;
        tokio::time::timeout(
            Duration::from_secs(30),
            self.orchestrator.run(CancellationToken::new()),
        )
        .await
        .expect("pipeline did not drain");
        self.broker.records().await
    }
}
