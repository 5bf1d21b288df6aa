//! Consistent snapshots under the low/high watermark protocol
//!
//! The snapshotter exports a repeatable-read snapshot, then walks the
//! included hypertables in `(schema, name)` order. Around each
//! hypertable it brackets the batched reads with low and high watermark
//! rows written through the side channel; the resolver sees those
//! markers on the replication stream and records every key streamed
//! inside the window. Buffered snapshot rows whose key was streamed are
//! superseded (the streamed value wins), the rest are emitted as
//! `op = r` events.
//!
//! Progress is persisted per hypertable, so a restart resumes with the
//! first incomplete hypertable under a freshly exported snapshot.

use crate::catalog::{Column, Hypertable, SystemCatalog};
use crate::config::{EventsConfig, InitialSnapshotMode};
use crate::context::ReplicationContext;
use crate::dispatch::StreamEvent;
use crate::error::{Result, StreamerError};
use crate::event::{ChangeEvent, Op, SourceInfo};
use crate::pgtypes::Lsn;
use crate::sidechannel::SnapshotSession;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Name the snapshot context is persisted under in the state store.
pub const SNAPSHOT_CONTEXT_STATE_NAME: &str = "snapshotContext";

/// How long to wait for the high watermark to round-trip through the
/// replication stream before emitting without dedup.
const WINDOW_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Stable dedup key for a row: the key column values in declaration
/// order, JSON-encoded.
pub fn row_key(key_columns: &[String], row: &Map<String, Value>) -> String {
    let values: Vec<&Value> = key_columns
        .iter()
        .map(|c| row.get(c).unwrap_or(&Value::Null))
        .collect();
    serde_json::to_string(&values).unwrap_or_default()
}

struct WindowState {
    closed: bool,
    seen_keys: HashSet<String>,
    notify: Arc<Notify>,
}

/// Watermark windows shared between the resolver (which opens, records
/// and closes them as markers arrive on the stream) and the snapshotter
/// (which waits for the close and collects the streamed keys).
#[derive(Default)]
pub struct SnapshotWindows {
    windows: Mutex<HashMap<String, WindowState>>,
}

impl SnapshotWindows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolver: a low watermark for `hypertable` arrived.
    pub fn open(&self, hypertable: &str) {
        let mut windows = self.windows.lock();
        windows.insert(
            hypertable.to_string(),
            WindowState {
                closed: false,
                seen_keys: HashSet::new(),
                notify: Arc::new(Notify::new()),
            },
        );
        debug!("snapshot window opened for {hypertable}");
    }

    /// Resolver: a streamed row for `hypertable` passed through while
    /// its window is open. Returns true when recorded.
    pub fn record_streamed_key(&self, hypertable: &str, key: String) -> bool {
        let mut windows = self.windows.lock();
        match windows.get_mut(hypertable) {
            Some(window) if !window.closed => {
                window.seen_keys.insert(key);
                true
            }
            _ => false,
        }
    }

    /// Resolver: the high watermark arrived; waiters wake up.
    pub fn close(&self, hypertable: &str) {
        let mut windows = self.windows.lock();
        if let Some(window) = windows.get_mut(hypertable) {
            window.closed = true;
            window.notify.notify_waiters();
            debug!("snapshot window closed for {hypertable}");
        }
    }

    /// True when a window is currently open for the hypertable.
    pub fn is_open(&self, hypertable: &str) -> bool {
        self.windows
            .lock()
            .get(hypertable)
            .map(|w| !w.closed)
            .unwrap_or(false)
    }

    /// Snapshotter: wait until the window closes, then take the keys
    /// streamed inside it. A timeout yields whatever was recorded.
    pub async fn wait_and_take(&self, hypertable: &str, timeout: Duration) -> HashSet<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notify = {
                let windows = self.windows.lock();
                match windows.get(hypertable) {
                    Some(window) if window.closed => break,
                    Some(window) => window.notify.clone(),
                    None => break, // marker never made it onto the stream
                }
            };
            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                warn!("snapshot window for {hypertable} did not close within {timeout:?}");
                break;
            }
        }

        self.windows
            .lock()
            .remove(hypertable)
            .map(|w| w.seen_keys)
            .unwrap_or_default()
    }
}

/// Per-hypertable snapshot progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HypertableSnapshotState {
    pub low_watermark: bool,
    pub high_watermark: Option<Value>,
    pub completed: bool,
}

/// Serialisable snapshot progress, persisted after each hypertable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotContext {
    pub snapshot_name: String,
    pub start_lsn: Lsn,
    pub hypertables: BTreeMap<String, HypertableSnapshotState>,
}

impl SnapshotContext {
    pub fn new(snapshot_name: impl Into<String>, start_lsn: Lsn) -> Self {
        Self {
            snapshot_name: snapshot_name.into(),
            start_lsn,
            hypertables: BTreeMap::new(),
        }
    }

    pub fn is_completed(&self, hypertable: &str) -> bool {
        self.hypertables
            .get(hypertable)
            .map(|s| s.completed)
            .unwrap_or(false)
    }

    pub fn entry(&mut self, hypertable: &str) -> &mut HypertableSnapshotState {
        self.hypertables.entry(hypertable.to_string()).or_default()
    }
}

/// The snapshot coordinator.
pub struct Snapshotter {
    context: Arc<ReplicationContext>,
    catalog: Arc<SystemCatalog>,
    windows: Arc<SnapshotWindows>,
    events: EventsConfig,
}

impl Snapshotter {
    pub fn new(
        context: Arc<ReplicationContext>,
        catalog: Arc<SystemCatalog>,
        windows: Arc<SnapshotWindows>,
        events: EventsConfig,
    ) -> Self {
        Self {
            context,
            catalog,
            windows,
            events,
        }
    }

    /// Whether the configured mode wants a snapshot this start.
    pub fn should_snapshot(mode: InitialSnapshotMode, slot_is_fresh: bool) -> bool {
        match mode {
            InitialSnapshotMode::Never => false,
            InitialSnapshotMode::Initial => slot_is_fresh,
            InitialSnapshotMode::Always | InitialSnapshotMode::InitialOnly => true,
        }
    }

    /// Run the snapshot. `streaming` tells the snapshotter whether the
    /// replication stream is live, i.e. whether the watermark windows
    /// will round-trip.
    pub async fn run(&self, streaming: bool) -> Result<()> {
        if !self.events.read {
            info!("snapshot skipped: read events disabled");
            return Ok(());
        }

        let hypertables = self.catalog.included_hypertables();
        if hypertables.is_empty() {
            info!("snapshot skipped: no included hypertables");
            return Ok(());
        }

        // Resume bookkeeping survives restarts; the exported snapshot
        // itself does not, so each run exports a fresh one.
        let state_manager = self.context.state_manager().clone();
        let mut progress: SnapshotContext = state_manager
            .state_decoder(SNAPSHOT_CONTEXT_STATE_NAME)
            .await?
            .unwrap_or_default();

        let session = SnapshotSession::export(self.context.side_channel().connection_string())
            .await?;
        progress.snapshot_name = session.snapshot_name().to_string();
        progress.start_lsn = session.start_lsn();
        state_manager
            .state_encoder(SNAPSHOT_CONTEXT_STATE_NAME, &progress)
            .await?;

        let mut session = session;
        for hypertable in &hypertables {
            let name = hypertable.canonical_name();
            if progress.is_completed(&name) {
                debug!("snapshot of {name} already completed, resuming past it");
                continue;
            }
            self.snapshot_hypertable(&mut session, hypertable, &mut progress, streaming)
                .await?;
            state_manager
                .state_encoder(SNAPSHOT_CONTEXT_STATE_NAME, &progress)
                .await?;
        }

        session.commit().await?;
        info!("snapshot finished: {} hypertable(s)", hypertables.len());
        Ok(())
    }

    async fn snapshot_hypertable(
        &self,
        session: &mut SnapshotSession,
        hypertable: &Hypertable,
        progress: &mut SnapshotContext,
        streaming: bool,
    ) -> Result<()> {
        let name = hypertable.canonical_name();
        let key_columns = hypertable.key_columns();
        if key_columns.is_empty() {
            warn!("skipping snapshot of {name}: no primary key");
            progress.entry(&name).completed = true;
            return Ok(());
        }

        let side_channel = self.context.side_channel();
        let batch_size = self.context.snapshot_batch_size();

        // low watermark brackets the read window
        side_channel.insert_low_watermark(hypertable).await?;
        progress.entry(&name).low_watermark = true;

        let high_key = session
            .read_high_watermark(&hypertable.table_ref(), &key_columns)
            .await?;

        // buffer the consistent reads, keyed for the dedup pass
        let mut buffered: Vec<(String, Map<String, Value>)> = Vec::new();
        let mut cursor = session
            .open_cursor(&hypertable.table_ref(), &hypertable.columns, &key_columns)
            .await?;
        while let Some(batch) = cursor.next_batch(batch_size).await? {
            for (_lsn, raw_row) in batch {
                let row = self.decode_row(&hypertable.columns, &raw_row).await?;
                let key = row_key(&key_columns, &row);
                buffered.push((key, row));
            }
        }

        side_channel
            .insert_high_watermark(hypertable, &high_key.clone().unwrap_or(Value::Null))
            .await?;
        progress.entry(&name).high_watermark = high_key;

        // streamed rows inside the window win over the buffered reads
        let superseded = if streaming {
            self.windows.wait_and_take(&name, WINDOW_CLOSE_TIMEOUT).await
        } else {
            HashSet::new()
        };

        let surface = hypertable.surface_ref();
        let mut emitted = 0usize;
        for (key, row) in buffered {
            if superseded.contains(&key) {
                continue;
            }
            let event = ChangeEvent {
                relation_schema: hypertable.schema.clone(),
                relation_table: hypertable.name.clone(),
                op: Op::Read,
                before: None,
                after: Some(row),
                source: SourceInfo {
                    system: self.context.system().system_id.clone(),
                    database: self.context.database_name().to_string(),
                    schema: surface.schema.clone(),
                    table: surface.name.clone(),
                    ts_ms: chrono::Utc::now().timestamp_millis(),
                    lsn: session.start_lsn(),
                    tx_id: None,
                    slot: self.context.slot_name().to_string(),
                    snapshot: true,
                },
                transaction: None,
            };
            self.context
                .dispatcher()
                .enqueue_and_wait(StreamEvent::Change(event))
                .await?;
            emitted += 1;
        }

        progress.entry(&name).completed = true;
        info!("snapshot of {name}: {emitted} row(s) emitted");
        Ok(())
    }

    /// Snapshot one chunk's rows as `op = r` events. Used when a chunk
    /// joins an already-streaming hypertable; the hypertable-level
    /// watermark protocol does not apply here. Returns the WAL position
    /// the reads were consistent with.
    pub async fn snapshot_chunk(&self, chunk_id: i32) -> Result<Lsn> {
        let Some(chunk) = self.catalog.chunk(chunk_id) else {
            return Ok(Lsn::ZERO);
        };
        let Some(hypertable) = self.catalog.hypertable(chunk.hypertable_id) else {
            return Ok(Lsn::ZERO);
        };
        if !self.events.read || !self.catalog.is_included(&hypertable) {
            return Ok(Lsn::ZERO);
        }

        let key_columns = hypertable.key_columns();
        let batch_size = self.context.snapshot_batch_size();
        let mut session =
            SnapshotSession::export(self.context.side_channel().connection_string()).await?;
        let start_lsn = session.start_lsn();
        let surface = hypertable.surface_ref();

        let mut emitted = 0usize;
        let mut cursor = session
            .open_cursor(&chunk.table_ref(), &hypertable.columns, &key_columns)
            .await?;
        while let Some(batch) = cursor.next_batch(batch_size).await? {
            for (lsn, raw_row) in batch {
                let row = self.decode_row(&hypertable.columns, &raw_row).await?;
                let event = ChangeEvent {
                    relation_schema: chunk.schema.clone(),
                    relation_table: chunk.name.clone(),
                    op: Op::Read,
                    before: None,
                    after: Some(row),
                    source: SourceInfo {
                        system: self.context.system().system_id.clone(),
                        database: self.context.database_name().to_string(),
                        schema: surface.schema.clone(),
                        table: surface.name.clone(),
                        ts_ms: chrono::Utc::now().timestamp_millis(),
                        lsn,
                        tx_id: None,
                        slot: self.context.slot_name().to_string(),
                        snapshot: true,
                    },
                    transaction: None,
                };
                self.context
                    .dispatcher()
                    .enqueue_and_wait(StreamEvent::Change(event))
                    .await?;
                emitted += 1;
            }
        }
        session.commit().await?;

        debug!(
            "chunk snapshot of {}.{}: {emitted} row(s)",
            chunk.schema, chunk.name
        );
        Ok(start_lsn)
    }

    async fn decode_row(
        &self,
        columns: &[Column],
        raw_row: &[Option<String>],
    ) -> Result<Map<String, Value>> {
        let resolver = self.context.type_resolver();
        let mut row = Map::new();
        for (column, raw) in columns.iter().zip(raw_row) {
            let value = match raw {
                None => Value::Null,
                Some(text) => match resolver.decode(column.oid, text).await {
                    Ok(value) => value,
                    Err(StreamerError::Decode { .. }) => {
                        // degraded: surface the raw bytes instead
                        Value::String(hex::encode(text.as_bytes()))
                    }
                    Err(err) => return Err(err),
                },
            };
            row.insert(column.name.clone(), value);
        }
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_key_is_stable_and_ordered() {
        let mut row = Map::new();
        row.insert("b".to_string(), json!(2));
        row.insert("a".to_string(), json!(1));

        let key_ab = row_key(&["a".to_string(), "b".to_string()], &row);
        let key_ba = row_key(&["b".to_string(), "a".to_string()], &row);
        assert_eq!(key_ab, "[1,2]");
        assert_eq!(key_ba, "[2,1]");

        // missing key column becomes null rather than shifting values
        let key = row_key(&["a".to_string(), "missing".to_string()], &row);
        assert_eq!(key, "[1,null]");
    }

    #[tokio::test]
    async fn test_window_records_only_while_open() {
        let windows = SnapshotWindows::new();
        assert!(!windows.record_streamed_key("public.metrics", "[1]".into()));

        windows.open("public.metrics");
        assert!(windows.is_open("public.metrics"));
        assert!(windows.record_streamed_key("public.metrics", "[1]".into()));
        assert!(windows.record_streamed_key("public.metrics", "[2]".into()));

        windows.close("public.metrics");
        assert!(!windows.is_open("public.metrics"));
        assert!(!windows.record_streamed_key("public.metrics", "[3]".into()));

        let seen = windows
            .wait_and_take("public.metrics", Duration::from_millis(10))
            .await;
        assert_eq!(seen.len(), 2);
        assert!(seen.contains("[1]"));
    }

    #[tokio::test]
    async fn test_window_wait_wakes_on_close() {
        let windows = Arc::new(SnapshotWindows::new());
        windows.open("public.metrics");

        let waiter = {
            let windows = windows.clone();
            tokio::spawn(async move {
                windows
                    .wait_and_take("public.metrics", Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        windows.record_streamed_key("public.metrics", "[9]".into());
        windows.close("public.metrics");

        let seen = waiter.await.unwrap();
        assert_eq!(seen, HashSet::from(["[9]".to_string()]));
    }

    #[tokio::test]
    async fn test_window_wait_times_out() {
        let windows = SnapshotWindows::new();
        windows.open("public.metrics");
        windows.record_streamed_key("public.metrics", "[1]".into());

        let start = tokio::time::Instant::now();
        let seen = windows
            .wait_and_take("public.metrics", Duration::from_millis(50))
            .await;
        assert!(start.elapsed() >= Duration::from_millis(45));
        // keys recorded so far still apply
        assert!(seen.contains("[1]"));
    }

    #[tokio::test]
    async fn test_window_wait_on_missing_window_returns_empty() {
        let windows = SnapshotWindows::new();
        let seen = windows
            .wait_and_take("public.unknown", Duration::from_secs(5))
            .await;
        assert!(seen.is_empty());
    }

    #[test]
    fn test_should_snapshot_modes() {
        use InitialSnapshotMode::*;
        assert!(!Snapshotter::should_snapshot(Never, true));
        assert!(!Snapshotter::should_snapshot(Never, false));
        assert!(Snapshotter::should_snapshot(Initial, true));
        assert!(!Snapshotter::should_snapshot(Initial, false));
        assert!(Snapshotter::should_snapshot(Always, false));
        assert!(Snapshotter::should_snapshot(InitialOnly, false));
    }

    #[test]
    fn test_snapshot_context_roundtrip() {
        let mut context = SnapshotContext::new("00000003-00000002-1", Lsn(0x100));
        context.entry("public.metrics").low_watermark = true;
        context.entry("public.metrics").completed = true;
        context.entry("public.other").high_watermark = Some(json!({"id": "42"}));

        let encoded = serde_json::to_vec(&context).unwrap();
        let decoded: SnapshotContext = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, context);
        assert!(decoded.is_completed("public.metrics"));
        assert!(!decoded.is_completed("public.other"));
        assert!(!decoded.is_completed("public.unseen"));
    }
}
