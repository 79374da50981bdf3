use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadReply,
};
use tracing::{debug, info};

use crate::models::progress::ProgressRecord;
use crate::models::result::ResultRecord;
use crate::services::broker::{
    idempotency_key, progress_key, BrokerConfig, BrokerError, ClaimOutcome, Delivery,
    IdempotencyGuard, ProgressStore, ResultLog, ResultStream,
};

const MARKER_VALUE: &str = "1";

/// Redis-backed idempotency guard, progress store and result stream.
///
/// Holds one auto-reconnecting multiplexed connection; clones of it are cheap
/// and safe to use from every worker concurrently. Redis serves a connection's
/// commands in order, so a `read` with a block timeout stalls everything else
/// queued behind it; give blocking readers a broker of their own.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    config: BrokerConfig,
}

impl RedisBroker {
    pub async fn connect(config: BrokerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, config })
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

fn into_delivery(entry: StreamId) -> Result<Delivery, BrokerError> {
    let mut fields = HashMap::with_capacity(entry.map.len());
    for (name, value) in entry.map {
        let value: String = redis::from_redis_value(&value).map_err(|e| {
            BrokerError::MalformedReply(format!("entry {} field {}: {}", entry.id, name, e))
        })?;
        fields.insert(name, value);
    }
    Ok(Delivery {
        id: entry.id,
        fields,
    })
}

#[async_trait]
impl IdempotencyGuard for RedisBroker {
    async fn claim(&self, job_id: &str) -> Result<ClaimOutcome, BrokerError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(idempotency_key(job_id))
            .arg(MARKER_VALUE)
            .arg("NX")
            .arg("EX")
            .arg(self.config.idempotency_ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        Ok(match reply {
            Some(_) => ClaimOutcome::Claimed,
            None => ClaimOutcome::AlreadyClaimed,
        })
    }

    async fn release(&self, job_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(idempotency_key(job_id))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for RedisBroker {
    async fn put(&self, job_id: &str, record: &ProgressRecord) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let key = progress_key(job_id);

        let mut hset = redis::cmd("HSET");
        hset.arg(&key);
        for (field, value) in record.to_fields() {
            hset.arg(field).arg(value);
        }

        let mut pipe = redis::pipe();
        pipe.atomic().add_command(hset).ignore();
        if record.error.is_none() {
            pipe.cmd("HDEL").arg(&key).arg("error").ignore();
        }
        pipe.cmd("EXPIRE")
            .arg(&key)
            .arg(self.config.progress_ttl.as_secs().max(1))
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<ProgressRecord>, BrokerError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(progress_key(job_id))
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        ProgressRecord::from_fields(&fields)
            .map(Some)
            .map_err(|e| BrokerError::MalformedReply(e.to_string()))
    }

    async fn remove(&self, job_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(progress_key(job_id))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ResultLog for RedisBroker {
    async fn append(&self, record: &ResultRecord) -> Result<String, BrokerError> {
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.config.result_stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.stream_max_len)
            .arg("*");
        for (field, value) in record.to_fields() {
            cmd.arg(field).arg(value);
        }
        let entry_id: String = cmd.query_async(&mut conn).await?;

        debug!(
            job_id = %record.job_id(),
            entry_id = %entry_id,
            status = record.status(),
            "Appended result record"
        );
        Ok(entry_id)
    }
}

#[async_trait]
impl ResultStream for RedisBroker {
    async fn ensure_group(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();

        // Start at 0 so records appended before the group existed are still delivered.
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.result_stream)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => info!(group = %self.config.consumer_group, "Created consumer group"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(group = %self.config.consumer_group, "Consumer group already exists");
            }
            Err(e) => return Err(BrokerError::Redis(e)),
        }
        Ok(())
    }

    async fn read(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let mut conn = self.conn.clone();

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count.max(1))
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.config.result_stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        reply
            .map(|r| r.keys)
            .unwrap_or_default()
            .into_iter()
            .flat_map(|key| key.ids)
            .map(into_delivery)
            .collect()
    }

    async fn ack(&self, entry_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        redis::cmd("XACK")
            .arg(&self.config.result_stream)
            .arg(&self.config.consumer_group)
            .arg(entry_id)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim_idle(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let mut conn = self.conn.clone();
        let min_idle_ms = min_idle.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.result_stream)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        // XCLAIM re-checks the idle time, so an entry acked or claimed by
        // another consumer in between is skipped.
        let mut claim = redis::cmd("XCLAIM");
        claim
            .arg(&self.config.result_stream)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle_ms);
        for entry in &pending.ids {
            claim.arg(&entry.id);
        }
        let claimed: StreamClaimReply = claim.query_async(&mut conn).await?;

        claimed.ids.into_iter().map(into_delivery).collect()
    }

    async fn pending_count(&self) -> Result<u64, BrokerError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = redis::cmd("XPENDING")
            .arg(&self.config.result_stream)
            .arg(&self.config.consumer_group)
            .query_async(&mut conn)
            .await?;
        Ok(reply.count() as u64)
    }
}
