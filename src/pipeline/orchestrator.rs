use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::job::{Job, JobStage, StageError};
use crate::models::result::ResultRecord;
use crate::pipeline::PipelineStage;
use crate::services::progress::ProgressReporter;
use crate::services::sink::ResultSink;

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Job>>>;

/// A stage together with the size of its worker pool.
pub struct StageSlot {
    stage: Arc<dyn PipelineStage>,
    workers: usize,
}

impl StageSlot {
    pub fn new(stage: impl PipelineStage + 'static, workers: usize) -> Self {
        Self::shared(Arc::new(stage), workers)
    }

    pub fn shared(stage: Arc<dyn PipelineStage>, workers: usize) -> Self {
        Self {
            stage,
            workers: workers.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The first queue is full.
    Busy,
    ShuttingDown,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Busy => write!(f, "pipeline queue is full"),
            RejectReason::ShuttingDown => write!(f, "pipeline is shutting down"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    Rejected(RejectReason),
}

/// Runs a worker pool per stage, linked by bounded queues.
///
/// Closing intake (or cancelling the run token) cascades: each pool drains its
/// input, drops its outbound senders, and the next pool sees its queue close.
/// Failed jobs skip every remaining stage and go straight to the sink pool.
pub struct Orchestrator {
    intake: Mutex<Option<mpsc::Sender<Job>>>,
    first: Mutex<Option<mpsc::Receiver<Job>>>,
    stages: Mutex<Vec<StageSlot>>,
    capacity: usize,
    sink_workers: usize,
    reporter: ProgressReporter,
    sink: ResultSink,
}

impl Orchestrator {
    pub fn new(
        stages: Vec<StageSlot>,
        queue_capacity: usize,
        sink_workers: usize,
        reporter: ProgressReporter,
        sink: ResultSink,
    ) -> Self {
        let capacity = queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            intake: Mutex::new(Some(tx)),
            first: Mutex::new(Some(rx)),
            stages: Mutex::new(stages),
            capacity,
            sink_workers: sink_workers.max(1),
            reporter,
            sink,
        }
    }

    /// Hands `job` to the first stage without waiting.
    pub async fn submit(&self, job: Job) -> Submission {
        let intake = self.intake.lock().await;
        let Some(tx) = intake.as_ref() else {
            return Submission::Rejected(RejectReason::ShuttingDown);
        };
        match tx.try_send(job) {
            Ok(()) => Submission::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => Submission::Rejected(RejectReason::Busy),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Submission::Rejected(RejectReason::ShuttingDown)
            }
        }
    }

    /// Stops accepting jobs. Already-queued jobs keep flowing.
    pub async fn close(&self) {
        if self.intake.lock().await.take().is_some() {
            info!("Pipeline intake closed");
        }
    }

    /// Runs every pool until intake is closed and drained, or `ctx` is cancelled.
    pub async fn run(&self, ctx: CancellationToken) {
        let Some(first) = self.first.lock().await.take() else {
            warn!("Pipeline is already running");
            return;
        };
        let stages = std::mem::take(&mut *self.stages.lock().await);

        let (sink_tx, sink_rx) = mpsc::channel::<Job>(self.capacity);
        let mut workers = JoinSet::new();
        let mut input: SharedReceiver = Arc::new(Mutex::new(first));
        let last = stages.len().saturating_sub(1);

        for (index, slot) in stages.into_iter().enumerate() {
            let (next_tx, next_rx) = if index == last {
                (sink_tx.clone(), None)
            } else {
                let (tx, rx) = mpsc::channel::<Job>(self.capacity);
                (tx, Some(rx))
            };

            for _ in 0..slot.workers {
                workers.spawn(stage_worker(
                    slot.stage.clone(),
                    input.clone(),
                    next_tx.clone(),
                    sink_tx.clone(),
                    self.reporter.clone(),
                    ctx.clone(),
                ));
            }
            info!(stage = %slot.stage.stage(), workers = slot.workers, "Stage pool started");

            if let Some(rx) = next_rx {
                input = Arc::new(Mutex::new(rx));
            }
        }
        // Only stage workers may hold senders, so the sink queue closes once they all exit.
        drop(sink_tx);

        let sink_rx: SharedReceiver = Arc::new(Mutex::new(sink_rx));
        for _ in 0..self.sink_workers {
            workers.spawn(sink_worker(
                sink_rx.clone(),
                self.sink.clone(),
                self.reporter.clone(),
                ctx.clone(),
            ));
        }

        let mut closed = false;
        loop {
            tokio::select! {
                _ = ctx.cancelled(), if !closed => {
                    self.close().await;
                    closed = true;
                }
                joined = workers.join_next() => match joined {
                    Some(Err(e)) => error!(error = %e, "Pipeline worker panicked"),
                    Some(Ok(())) => {}
                    None => break,
                },
            }
        }
        if ctx.is_cancelled() {
            self.close().await;
        }
        info!("Pipeline stopped");
    }
}

async fn next_job(input: &SharedReceiver, ctx: &CancellationToken) -> Option<Job> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => None,
        job = async { input.lock().await.recv().await } => job,
    }
}

async fn forward(tx: &mpsc::Sender<Job>, job: Job, ctx: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => false,
        sent = tx.send(job) => sent.is_ok(),
    }
}

async fn stage_worker(
    stage: Arc<dyn PipelineStage>,
    input: SharedReceiver,
    next: mpsc::Sender<Job>,
    sink: mpsc::Sender<Job>,
    reporter: ProgressReporter,
    ctx: CancellationToken,
) {
    let current = stage.stage();
    let stage_name: &'static str = current.into();

    while let Some(mut job) = next_job(&input, &ctx).await {
        reporter.report(&job.id, current).await;

        let started = Instant::now();
        let outcome = stage.process(&ctx, &mut job).await;
        metrics::histogram!("upload_stage_duration_seconds", "stage" => stage_name)
            .record(started.elapsed().as_secs_f64());

        let delivered = match outcome {
            Ok(()) => {
                debug!(job_id = %job.id, stage = stage_name, "Stage complete");
                forward(&next, job, &ctx).await
            }
            Err(err) => {
                let code: &'static str = err.code.into();
                metrics::counter!(
                    "upload_stage_failures_total",
                    "stage" => stage_name,
                    "code" => code
                )
                .increment(1);
                warn!(job_id = %job.id, stage = stage_name, error = %err, "Stage failed");
                job.fail(err);
                forward(&sink, job, &ctx).await
            }
        };

        if !delivered {
            warn!(stage = stage_name, "Downstream unavailable, dropping in-flight job");
            break;
        }
    }
    debug!(stage = stage_name, "Stage worker exiting");
}

async fn sink_worker(
    input: SharedReceiver,
    sink: ResultSink,
    reporter: ProgressReporter,
    ctx: CancellationToken,
) {
    while let Some(job) = next_job(&input, &ctx).await {
        let record = ResultRecord::from_job(&job);
        let admitted_at = job.admitted_at;
        drop(job);

        if let Err(e) = sink.publish(&record, &ctx).await {
            error!(job_id = %record.job_id(), error = %e, "Terminal result not published");
            continue;
        }

        let elapsed = (chrono::Utc::now() - admitted_at).to_std().unwrap_or_default();
        metrics::histogram!("upload_job_duration_seconds", "status" => record.status())
            .record(elapsed.as_secs_f64());

        match &record {
            ResultRecord::Success(_) => reporter.report(record.job_id(), JobStage::Done).await,
            ResultRecord::Failed(f) => {
                let err = StageError::new(f.error_code, f.error_message.clone());
                reporter.report_failure(record.job_id(), &err).await
            }
        }
    }
    debug!("Sink worker exiting");
}
