//! In-process implementation of the broker capabilities.
//!
//! Mirrors the Redis semantics the pipeline and consumer rely on: markers and
//! progress expire, the stream is capped, entries are delivered to exactly one
//! consumer in the group and stay pending until acknowledged, and idle pending
//! entries can be claimed by another consumer under the same id.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::models::progress::ProgressRecord;
use crate::models::result::ResultRecord;
use crate::services::broker::{
    BrokerConfig, BrokerError, ClaimOutcome, Delivery, IdempotencyGuard, ProgressStore,
    ResultLog, ResultStream,
};

struct Entry {
    seq: u64,
    fields: HashMap<String, String>,
}

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Default)]
struct State {
    markers: HashMap<String, Instant>,
    progress: HashMap<String, (ProgressRecord, Instant)>,
    entries: VecDeque<Entry>,
    next_seq: u64,
    group_created: bool,
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

fn entry_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn parse_entry_id(id: &str) -> Option<u64> {
    id.split_once('-').and_then(|(ms, _)| ms.parse().ok())
}

pub struct MemoryBroker {
    config: BrokerConfig,
    state: Mutex<State>,
    appended: Notify,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl MemoryBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                next_seq: 1,
                ..State::default()
            }),
            appended: Notify::new(),
        }
    }

    /// All records currently retained in the stream, oldest first.
    pub async fn records(&self) -> Vec<(String, ResultRecord)> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .filter_map(|e| {
                ResultRecord::from_fields(&e.fields)
                    .ok()
                    .map(|r| (entry_id(e.seq), r))
            })
            .collect()
    }

    /// Appends raw fields, bypassing record encoding.
    pub async fn append_fields(&self, fields: HashMap<String, String>) -> String {
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push_back(Entry { seq, fields });
        while state.entries.len() as u64 > self.config.stream_max_len.max(1) {
            state.entries.pop_front();
        }
        drop(state);
        self.appended.notify_waiters();
        entry_id(seq)
    }

    /// Consumer currently owning a pending entry, with its delivery count.
    pub async fn pending_owner(&self, entry_id: &str) -> Option<(String, u32)> {
        let seq = parse_entry_id(entry_id)?;
        let state = self.state.lock().await;
        state
            .pending
            .get(&seq)
            .map(|p| (p.consumer.clone(), p.deliveries))
    }

    fn take_new(state: &mut State, consumer: &str, count: usize) -> Vec<Delivery> {
        let last = state.last_delivered;
        let fresh: Vec<(u64, HashMap<String, String>)> = state
            .entries
            .iter()
            .filter(|e| e.seq > last)
            .take(count.max(1))
            .map(|e| (e.seq, e.fields.clone()))
            .collect();

        let now = Instant::now();
        let mut out = Vec::with_capacity(fresh.len());
        for (seq, fields) in fresh {
            state.last_delivered = seq;
            state.pending.insert(
                seq,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            out.push(Delivery {
                id: entry_id(seq),
                fields,
            });
        }
        out
    }
}

#[async_trait]
impl IdempotencyGuard for MemoryBroker {
    async fn claim(&self, job_id: &str) -> Result<ClaimOutcome, BrokerError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.markers.get(job_id) {
            Some(expires) if *expires > now => Ok(ClaimOutcome::AlreadyClaimed),
            _ => {
                state
                    .markers
                    .insert(job_id.to_string(), now + self.config.idempotency_ttl);
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn release(&self, job_id: &str) -> Result<(), BrokerError> {
        self.state.lock().await.markers.remove(job_id);
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for MemoryBroker {
    async fn put(&self, job_id: &str, record: &ProgressRecord) -> Result<(), BrokerError> {
        let expires = Instant::now() + self.config.progress_ttl;
        self.state
            .lock()
            .await
            .progress
            .insert(job_id.to_string(), (record.clone(), expires));
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<ProgressRecord>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state
            .progress
            .get(job_id)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(record, _)| record.clone()))
    }

    async fn remove(&self, job_id: &str) -> Result<(), BrokerError> {
        self.state.lock().await.progress.remove(job_id);
        Ok(())
    }
}

#[async_trait]
impl ResultLog for MemoryBroker {
    async fn append(&self, record: &ResultRecord) -> Result<String, BrokerError> {
        let fields = record
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Ok(self.append_fields(fields).await)
    }
}

#[async_trait]
impl ResultStream for MemoryBroker {
    async fn ensure_group(&self) -> Result<(), BrokerError> {
        self.state.lock().await.group_created = true;
        Ok(())
    }

    async fn read(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let deadline = Instant::now() + block;
        loop {
            // Registered before inspecting state so an append in between is not missed.
            let appended = self.appended.notified();
            {
                let mut state = self.state.lock().await;
                if !state.group_created {
                    return Err(BrokerError::MalformedReply(
                        "NOGROUP consumer group does not exist".to_string(),
                    ));
                }
                let batch = Self::take_new(&mut state, consumer, count);
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, entry_id: &str) -> Result<(), BrokerError> {
        if let Some(seq) = parse_entry_id(entry_id) {
            self.state.lock().await.pending.remove(&seq);
        }
        Ok(())
    }

    async fn claim_idle(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let idle: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(seq, _)| *seq)
            .take(count.max(1))
            .collect();

        let mut out = Vec::with_capacity(idle.len());
        for seq in idle {
            let fields = state
                .entries
                .iter()
                .find(|e| e.seq == seq)
                .map(|e| e.fields.clone());
            match fields {
                Some(fields) => {
                    if let Some(p) = state.pending.get_mut(&seq) {
                        p.consumer = consumer.to_string();
                        p.delivered_at = now;
                        p.deliveries += 1;
                    }
                    out.push(Delivery {
                        id: entry_id(seq),
                        fields,
                    });
                }
                // Trimmed out of the stream while pending.
                None => {
                    state.pending.remove(&seq);
                }
            }
        }
        Ok(out)
    }

    async fn pending_count(&self) -> Result<u64, BrokerError> {
        Ok(self.state.lock().await.pending.len() as u64)
    }
}
