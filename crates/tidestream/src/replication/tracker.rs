//! Transaction tracker: windowed per-transaction buffering
//!
//! Wraps the resolver's emission path when `transaction.window` is
//! enabled. Rows buffer per transaction until the commit arrives, the
//! buffer reaches its size cap, or the window times out; commit flushes
//! in order and confirms the commit's end position. A size or time
//! flush emits the buffered prefix and marks the transaction partially
//! drained; an abort then compensates the drained rows with delete
//! tombstones, while undrained rows are simply dropped.
//!
//! Within one execution no row is emitted twice: a row moves from the
//! pending buffer to the drained list exactly when it is handed to the
//! dispatcher.

use crate::context::ReplicationContext;
use crate::dispatch::StreamEvent;
use crate::error::Result;
use crate::event::{ChangeEvent, MessageEvent, Op};
use crate::pgtypes::{Lsn, XLogData};
use crate::replication::resolver::EventSink;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// Buffering window limits.
#[derive(Debug, Clone)]
pub struct TransactionWindow {
    /// Rows per transaction before a forced flush
    pub max_size: usize,
    /// Open-window duration before a forced flush
    pub timeout: Duration,
}

impl Default for TransactionWindow {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            timeout: Duration::from_secs(60),
        }
    }
}

struct TxnBuffer {
    pending: Vec<ChangeEvent>,
    /// Rows already handed to the dispatcher by a size/time flush
    drained: Vec<ChangeEvent>,
    started_at: Instant,
}

impl TxnBuffer {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            drained: Vec::new(),
            started_at: Instant::now(),
        }
    }

    fn partially_drained(&self) -> bool {
        !self.drained.is_empty()
    }
}

/// The tracker. Distinct transactions buffer independently; order is
/// preserved within each transaction.
pub struct TransactionTracker {
    context: Arc<ReplicationContext>,
    window: TransactionWindow,
    buffers: Mutex<HashMap<u32, TxnBuffer>>,
}

impl TransactionTracker {
    pub fn new(context: Arc<ReplicationContext>, window: TransactionWindow) -> Self {
        Self {
            context,
            window,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the timeout sweeper. It flushes transactions whose window
    /// has been open longer than the configured timeout.
    pub fn start_sweeper(self: &Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let tracker = self.clone();
        let period = (self.window.timeout / 4).max(Duration::from_millis(250));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = tracker.flush_timed_out().await {
                            warn!("transaction window sweep failed: {err}");
                        }
                    }
                    _ = cancel.changed() => break,
                }
            }
        });
    }

    /// Flush the buffered prefix of every timed-out transaction.
    pub async fn flush_timed_out(&self) -> Result<()> {
        let mut buffers = self.buffers.lock().await;
        let expired: Vec<u32> = buffers
            .iter()
            .filter(|(_, buffer)| {
                !buffer.pending.is_empty() && buffer.started_at.elapsed() >= self.window.timeout
            })
            .map(|(xid, _)| *xid)
            .collect();

        for xid in expired {
            if let Some(buffer) = buffers.get_mut(&xid) {
                warn!(
                    "transaction {xid} exceeded the {:?} window, flushing {} row(s)",
                    self.window.timeout,
                    buffer.pending.len()
                );
                Self::drain_pending(&self.context, buffer).await?;
            }
        }
        Ok(())
    }

    /// Rows currently buffered for a transaction (tests and metrics).
    pub async fn buffered_rows(&self, xid: u32) -> usize {
        self.buffers
            .lock()
            .await
            .get(&xid)
            .map(|b| b.pending.len())
            .unwrap_or(0)
    }

    async fn drain_pending(context: &ReplicationContext, buffer: &mut TxnBuffer) -> Result<()> {
        for event in buffer.pending.drain(..) {
            context
                .dispatcher()
                .enqueue_and_wait(StreamEvent::Change(event.clone()))
                .await?;
            buffer.drained.push(event);
        }
        Ok(())
    }

    fn tombstone_of(event: &ChangeEvent) -> ChangeEvent {
        ChangeEvent {
            relation_schema: event.relation_schema.clone(),
            relation_table: event.relation_table.clone(),
            op: Op::Delete,
            before: event.after.clone().or_else(|| event.before.clone()),
            after: None,
            source: event.source.clone(),
            transaction: event.transaction.clone(),
        }
    }
}

#[async_trait]
impl EventSink for TransactionTracker {
    async fn publish_change(&self, event: ChangeEvent, _xld: &XLogData) -> Result<()> {
        let xid = event
            .transaction
            .as_ref()
            .map(|t| t.id)
            .or(event.source.tx_id)
            .unwrap_or(0);

        let mut buffers = self.buffers.lock().await;
        let buffer = buffers.entry(xid).or_insert_with(TxnBuffer::new);
        buffer.pending.push(event);

        if buffer.pending.len() >= self.window.max_size {
            debug!(
                "transaction {xid} reached {} buffered row(s), flushing prefix",
                self.window.max_size
            );
            Self::drain_pending(&self.context, buffer).await?;
        }
        Ok(())
    }

    async fn publish_message(&self, event: MessageEvent, xld: &XLogData) -> Result<()> {
        self.context
            .dispatcher()
            .enqueue_and_wait(StreamEvent::Message(event))
            .await?;
        // only confirm when nothing is buffered behind this position
        let buffers = self.buffers.lock().await;
        if buffers.values().all(|b| b.pending.is_empty() && b.drained.is_empty()) {
            drop(buffers);
            self.context.acknowledge_processed(xld, None).await?;
        }
        Ok(())
    }

    async fn transaction_committed(
        &self,
        xid: u32,
        _commit_lsn: Lsn,
        end_lsn: Lsn,
        xld: &XLogData,
    ) -> Result<()> {
        let buffer = self.buffers.lock().await.remove(&xid);
        if let Some(mut buffer) = buffer {
            Self::drain_pending(&self.context, &mut buffer).await?;
        }
        self.context.acknowledge_processed(xld, Some(end_lsn)).await
    }

    async fn transaction_aborted(&self, xid: u32) -> Result<()> {
        let buffer = self.buffers.lock().await.remove(&xid);
        let Some(buffer) = buffer else {
            return Ok(());
        };

        if buffer.partially_drained() {
            warn!(
                "transaction {xid} aborted after a partial flush, emitting {} tombstone(s)",
                buffer.drained.len()
            );
            for event in &buffer.drained {
                self.context
                    .dispatcher()
                    .enqueue_and_wait(StreamEvent::Change(Self::tombstone_of(event)))
                    .await?;
            }
        } else {
            debug!(
                "transaction {xid} aborted, dropping {} undrained row(s)",
                buffer.pending.len()
            );
        }
        Ok(())
    }
}
