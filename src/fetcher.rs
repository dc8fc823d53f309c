use anyhow::Result;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::FetchConfig;
use crate::feed::ChannelSource;
use crate::models::ChannelRecord;
use crate::store;

/// Where fetched records are flushed in batches.
pub trait RecordSink {
    async fn persist(&self, records: &[ChannelRecord]) -> Result<()>;
}

impl RecordSink for SqlitePool {
    async fn persist(&self, records: &[ChannelRecord]) -> Result<()> {
        store::add_streams(self, records).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Completed,
    Cancelled,
    /// Stopped after too many consecutive failures.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    Fetched {
        stream_id: i64,
        current: u64,
        total: u64,
        nickname: String,
        name: String,
    },
    Failed {
        stream_id: i64,
        consecutive: u32,
    },
    Flushed {
        count: usize,
    },
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub state: FetchState,
    pub last_id: i64,
    pub attempted: u64,
    /// Successfully fetched records, newest first.
    pub records: Vec<ChannelRecord>,
    pub persisted: usize,
}

/// Walks stream ids from a cursor, fetching each and writing them through to a sink.
pub struct Fetcher<'a, S, P> {
    source: &'a S,
    sink: &'a P,
    failure_limit: u32,
    batch_size: usize,
    events: Option<mpsc::UnboundedSender<FetchEvent>>,
    last_id: i64,
}

impl<'a, S: ChannelSource, P: RecordSink> Fetcher<'a, S, P> {
    pub fn new(source: &'a S, sink: &'a P, config: &FetchConfig, start_id: i64) -> Self {
        Self {
            source,
            sink,
            failure_limit: config.failure_limit,
            batch_size: config.batch_size.max(1),
            events: None,
            last_id: start_id,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<FetchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Cursor the next run starts from: the last successfully fetched id.
    pub fn last_id(&self) -> i64 {
        self.last_id
    }

    fn emit(&self, event: FetchEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    async fn flush(&self, pending: &mut Vec<ChannelRecord>) -> usize {
        let count = pending.len();
        let stored = match self.sink.persist(pending).await {
            Ok(()) => {
                self.emit(FetchEvent::Flushed { count });
                count
            }
            Err(e) => {
                error!(count, error = %e, "failed to persist fetched streams");
                0
            }
        };
        pending.clear();
        stored
    }

    /// Fetch `|count|` ids starting at the cursor, upward for a positive count and
    /// downward for a negative one.
    pub async fn run(&mut self, count: i64) -> FetchOutcome {
        let forward = count > 0;
        let total = count.unsigned_abs();
        let start = self.last_id;
        let mut last_id = start;

        let mut failed: u32 = 0;
        let mut attempted: u64 = 0;
        let mut persisted = 0;
        let mut records = Vec::new();
        let mut pending = Vec::with_capacity(self.batch_size);
        let mut end_state = FetchState::Completed;

        info!(start, count, "fetch started");

        for current in 0..total {
            if self.source.is_canceled() {
                end_state = FetchState::Cancelled;
                break;
            }

            let next = i64::try_from(current)
                .ok()
                .and_then(|offset| if forward { start.checked_add(offset) } else { start.checked_sub(offset) });
            let Some(stream_id) = next else {
                warn!(start, current, "stream id out of range, stopping");
                break;
            };
            attempted += 1;

            let Some(record) = self.source.get_channel(stream_id).await else {
                if self.source.is_canceled() {
                    end_state = FetchState::Cancelled;
                    break;
                }
                failed += 1;
                self.emit(FetchEvent::Failed {
                    stream_id,
                    consecutive: failed,
                });
                if failed > self.failure_limit {
                    warn!(stream_id, failed, "too many consecutive failures, stopping");
                    end_state = FetchState::Aborted;
                    break;
                }
                continue;
            };

            failed = 0;
            last_id = record.stream_id;
            self.emit(FetchEvent::Fetched {
                stream_id: record.stream_id,
                current: current + 1,
                total,
                nickname: record.nickname.clone(),
                name: record.name.clone(),
            });
            pending.push(record.clone());
            records.push(record);

            if pending.len() >= self.batch_size {
                persisted += self.flush(&mut pending).await;
            }
        }

        if !pending.is_empty() {
            persisted += self.flush(&mut pending).await;
        }

        records.reverse();
        self.last_id = last_id;

        info!(
            state = ?end_state,
            last_id,
            attempted,
            fetched = records.len(),
            persisted,
            "fetch finished"
        );

        FetchOutcome {
            state: end_state,
            last_id,
            attempted,
            records,
            persisted,
        }
    }
}
