use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::services::broker::{BrokerError, ResultStream};
use crate::services::consumer::{Handled, ResultConsumer};

/// `tokio::time::interval` rejects a zero period.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    pub interval: Duration,
    /// Pending entries idle at least this long are taken over.
    pub min_idle: Duration,
    pub batch: usize,
}

/// Periodically takes over entries left pending by crashed consumers and
/// hands them to a live consumer under that consumer's name.
pub struct OrphanReclaimer {
    stream: Arc<dyn ResultStream>,
    consumer: Arc<ResultConsumer>,
    config: ReclaimerConfig,
}

impl OrphanReclaimer {
    pub fn new(
        stream: Arc<dyn ResultStream>,
        consumer: Arc<ResultConsumer>,
        config: ReclaimerConfig,
    ) -> Self {
        Self {
            stream,
            consumer,
            config,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            consumer = %self.consumer.name(),
            interval_secs = self.config.interval.as_secs(),
            min_idle_secs = self.config.min_idle.as_secs(),
            "Orphan reclaimer started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sweep_once().await {
                error!(error = %e, "Reclaim sweep failed");
            }
        }
        info!("Orphan reclaimer stopped");
    }

    /// Claims idle entries and processes them. Returns how many were reclaimed.
    pub async fn sweep_once(&self) -> Result<usize, BrokerError> {
        let pending = self.stream.pending_count().await?;
        debug!(pending, "Reclaim sweep");
        if pending == 0 {
            return Ok(0);
        }

        let claimed = self
            .stream
            .claim_idle(self.consumer.name(), self.config.min_idle, self.config.batch)
            .await?;
        let reclaimed = claimed.len();

        for delivery in claimed {
            let entry_id = delivery.id.clone();
            let handled = self.consumer.handle(delivery).await;
            info!(entry_id = %entry_id, outcome = ?handled, "Reclaimed orphaned result");
            if handled != Handled::ApplyFailed {
                metrics::counter!("upload_results_reclaimed_total").increment(1);
            }
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{ErrorCode, StageError};
    use crate::models::result::ResultRecord;
    use crate::services::broker::{BrokerConfig, ResultLog};
    use crate::services::consumer::{ApplyError, ConsumerConfig, ResultApplier};
    use crate::services::memory::MemoryBroker;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingApplier(AtomicUsize);

    #[async_trait]
    impl ResultApplier for CountingApplier {
        async fn apply(&self, _entry_id: &str, _record: &ResultRecord) -> Result<(), ApplyError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sweep_recovers_idle_entry() {
        let broker = Arc::new(MemoryBroker::new(BrokerConfig::default()));
        broker.ensure_group().await.unwrap();
        let id = broker
            .append(&ResultRecord::failure(
                "a",
                &StageError::new(ErrorCode::Empty, "no bytes"),
            ))
            .await
            .unwrap();
        // A consumer that crashes after reading.
        broker.read("crashed", 10, Duration::ZERO).await.unwrap();

        let applier = Arc::new(CountingApplier::default());
        let rescuer = Arc::new(ResultConsumer::new(
            broker.clone(),
            applier.clone(),
            ConsumerConfig {
                name: "rescuer".to_string(),
                batch: 10,
                block: Duration::from_millis(10),
            },
        ));
        let reclaimer = OrphanReclaimer::new(
            broker.clone(),
            rescuer,
            ReclaimerConfig {
                interval: Duration::from_millis(10),
                min_idle: Duration::from_millis(20),
                batch: 10,
            },
        );

        assert_eq!(reclaimer.sweep_once().await.unwrap(), 0);
        assert_eq!(broker.pending_owner(&id).await.unwrap().0, "crashed");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(reclaimer.sweep_once().await.unwrap(), 1);
        assert_eq!(applier.0.load(Ordering::SeqCst), 1);
        assert_eq!(broker.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_interval_runs_until_cancelled() {
        let broker = Arc::new(MemoryBroker::new(BrokerConfig::default()));
        broker.ensure_group().await.unwrap();
        let consumer = Arc::new(ResultConsumer::new(
            broker.clone(),
            Arc::new(CountingApplier::default()),
            ConsumerConfig {
                name: "c1".to_string(),
                batch: 10,
                block: Duration::from_millis(10),
            },
        ));
        let reclaimer = OrphanReclaimer::new(
            broker,
            consumer,
            ReclaimerConfig {
                interval: Duration::ZERO,
                min_idle: Duration::from_millis(20),
                batch: 10,
            },
        );
        let cancel = CancellationToken::new();

        let running = {
            let cancel = cancel.clone();
            tokio::spawn(async move { reclaimer.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        running.await.unwrap();
    }
}
