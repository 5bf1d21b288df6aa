//! Logical replication resolver
//!
//! Turns decoded pgoutput messages into high-level events: row changes
//! on hypertable chunks become [`ChangeEvent`]s, TimescaleDB catalog
//! traffic becomes mirror mutations, watermark rows drive the snapshot
//! dedup windows, and everything else is skipped with a diagnostic.
//!
//! The resolver runs on the replication channel task. Emission goes
//! through an [`EventSink`], which is either the direct dispatcher path
//! or the transaction tracker when windowed buffering is enabled.

use crate::catalog::{Chunk, ResolvedRelation, SystemCatalog, TableRef};
use crate::config::EventsConfig;
use crate::context::ReplicationContext;
use crate::dispatch::StreamEvent;
use crate::error::{ErrorCategory, ErrorLog, Result, StreamerError};
use crate::event::{ChangeEvent, MessageEvent, Op, SourceInfo, TransactionInfo};
use crate::pgtypes::{pg_micros_to_unix_millis, Lsn, XLogData};
use crate::replication::channel::XLogHandler;
use crate::replication::decoder::PgOutputDecoder;
use crate::replication::protocol::*;
use crate::snapshot::{row_key, SnapshotWindows};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Downstream of the resolver: direct emission or windowed buffering.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish_change(&self, event: ChangeEvent, xld: &XLogData) -> Result<()>;

    async fn publish_message(&self, event: MessageEvent, xld: &XLogData) -> Result<()>;

    /// A transaction committed; `end_lsn` is the position to confirm.
    async fn transaction_committed(
        &self,
        xid: u32,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        xld: &XLogData,
    ) -> Result<()>;

    /// A streamed transaction aborted.
    async fn transaction_aborted(&self, xid: u32) -> Result<()>;
}

/// Direct path: every change goes straight onto the dispatcher and is
/// acknowledged as it completes.
pub struct DirectEmitSink {
    context: Arc<ReplicationContext>,
}

impl DirectEmitSink {
    pub fn new(context: Arc<ReplicationContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl EventSink for DirectEmitSink {
    async fn publish_change(&self, event: ChangeEvent, xld: &XLogData) -> Result<()> {
        self.context
            .dispatcher()
            .enqueue_and_wait(StreamEvent::Change(event))
            .await?;
        self.context.acknowledge_processed(xld, None).await
    }

    async fn publish_message(&self, event: MessageEvent, xld: &XLogData) -> Result<()> {
        self.context
            .dispatcher()
            .enqueue_and_wait(StreamEvent::Message(event))
            .await?;
        self.context.acknowledge_processed(xld, None).await
    }

    async fn transaction_committed(
        &self,
        _xid: u32,
        _commit_lsn: Lsn,
        end_lsn: Lsn,
        xld: &XLogData,
    ) -> Result<()> {
        self.context.acknowledge_processed(xld, Some(end_lsn)).await
    }

    async fn transaction_aborted(&self, _xid: u32) -> Result<()> {
        Ok(())
    }
}

/// Transaction phases tracked by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    InTxn(u32),
    InStream(u32),
    Committing,
}

struct OpenTransaction {
    /// Commit timestamp from BEGIN (pgoutput sends it up front), Unix
    /// millis. Streamed transactions learn it only at stream commit.
    commit_ts_ms: Option<i64>,
    /// Next intra-transaction sequence number
    sequence: u64,
}

struct ResolverState {
    relations: HashMap<u32, RelationBody>,
    phase: Phase,
    open_transactions: HashMap<u32, OpenTransaction>,
}

/// The resolver.
pub struct LogicalReplicationResolver {
    context: Arc<ReplicationContext>,
    catalog: Arc<SystemCatalog>,
    windows: Arc<SnapshotWindows>,
    sink: Arc<dyn EventSink>,
    events: EventsConfig,
    state: Mutex<ResolverState>,
    diagnostics: ErrorLog,
}

#[async_trait]
impl XLogHandler for LogicalReplicationResolver {
    async fn handle(&self, xld: XLogData) -> Result<()> {
        self.handle_xlog(xld).await
    }
}

impl LogicalReplicationResolver {
    pub fn new(
        context: Arc<ReplicationContext>,
        catalog: Arc<SystemCatalog>,
        windows: Arc<SnapshotWindows>,
        sink: Arc<dyn EventSink>,
        events: EventsConfig,
    ) -> Self {
        Self {
            context,
            catalog,
            windows,
            sink,
            events,
            state: Mutex::new(ResolverState {
                relations: HashMap::new(),
                phase: Phase::Idle,
                open_transactions: HashMap::new(),
            }),
            diagnostics: ErrorLog::default(),
        }
    }

    pub async fn handle_xlog(&self, xld: XLogData) -> Result<()> {
        let mut state = self.state.lock().await;

        let mut payload = xld.data.clone();
        let in_stream = matches!(state.phase, Phase::InStream(_));
        let message = PgOutputDecoder::decode(&mut payload, in_stream)
            .map_err(|e| StreamerError::from(e).at_relation(xld.wal_start, 0))?;

        match message {
            PgOutputMessage::Begin(begin) => {
                self.context.set_last_begin(begin.final_lsn, begin.xid);
                state.phase = Phase::InTxn(begin.xid);
                state.open_transactions.insert(
                    begin.xid,
                    OpenTransaction {
                        commit_ts_ms: Some(pg_micros_to_unix_millis(begin.timestamp)),
                        sequence: 0,
                    },
                );
            }
            PgOutputMessage::Commit(commit) => {
                let xid = match state.phase {
                    Phase::InTxn(xid) => xid,
                    _ => self.context.last_transaction_id(),
                };
                state.phase = Phase::Committing;
                self.context.set_last_commit(commit.commit_lsn);
                state.open_transactions.remove(&xid);
                self.sink
                    .transaction_committed(xid, commit.commit_lsn, commit.end_lsn, &xld)
                    .await?;
                state.phase = Phase::Idle;
            }
            PgOutputMessage::Origin(origin) => {
                debug!("replication origin {} at {}", origin.name, origin.commit_lsn);
            }
            PgOutputMessage::Relation(relation) => {
                self.refresh_relation_schema(&relation).await?;
                state.relations.insert(relation.id, relation);
                self.acknowledge_if_idle(&state, &xld).await?;
            }
            PgOutputMessage::Type(ty) => {
                debug!("type metadata: {}.{} (oid {})", ty.namespace, ty.name, ty.oid);
            }
            PgOutputMessage::Insert(insert) => {
                let xid = self.effective_xid(&state, insert.xid)?;
                let relation = state.relations.get(&insert.relation_id).cloned();
                match relation {
                    Some(relation) => {
                        self.handle_row(
                            &mut state,
                            &relation,
                            Op::Create,
                            None,
                            Some(&insert.new_tuple),
                            xid,
                            &xld,
                        )
                        .await?;
                    }
                    None => self.skip_relation(&mut state, insert.relation_id, &xld.wal_start),
                }
            }
            PgOutputMessage::Update(update) => {
                let xid = self.effective_xid(&state, update.xid)?;
                let relation = state.relations.get(&update.relation_id).cloned();
                match relation {
                    Some(relation) => {
                        self.handle_row(
                            &mut state,
                            &relation,
                            Op::Update,
                            update.old_tuple.as_ref(),
                            Some(&update.new_tuple),
                            xid,
                            &xld,
                        )
                        .await?;
                    }
                    None => self.skip_relation(&mut state, update.relation_id, &xld.wal_start),
                }
            }
            PgOutputMessage::Delete(delete) => {
                let xid = self.effective_xid(&state, delete.xid)?;
                let relation = state.relations.get(&delete.relation_id).cloned();
                match relation {
                    Some(relation) => {
                        self.handle_row(
                            &mut state,
                            &relation,
                            Op::Delete,
                            delete.old_tuple.as_ref(),
                            None,
                            xid,
                            &xld,
                        )
                        .await?;
                    }
                    None => self.skip_relation(&mut state, delete.relation_id, &xld.wal_start),
                }
            }
            PgOutputMessage::Truncate(truncate) => {
                let xid = self.effective_xid(&state, truncate.xid)?;
                self.handle_truncate(&mut state, &truncate, xid, &xld).await?;
            }
            PgOutputMessage::Message(message) => {
                if self.events.message {
                    let content = match std::str::from_utf8(&message.content) {
                        Ok(text) => text.to_string(),
                        Err(_) => hex::encode(&message.content),
                    };
                    let event = MessageEvent {
                        prefix: message.prefix,
                        content,
                        lsn: message.lsn,
                        transactional: message.transactional,
                        ts_ms: xld.server_time_ms,
                    };
                    self.sink.publish_message(event, &xld).await?;
                } else {
                    self.acknowledge_if_idle(&state, &xld).await?;
                }
            }
            PgOutputMessage::StreamStart(start) => {
                state.phase = Phase::InStream(start.xid);
                state
                    .open_transactions
                    .entry(start.xid)
                    .or_insert(OpenTransaction {
                        commit_ts_ms: None,
                        sequence: 0,
                    });
            }
            PgOutputMessage::StreamStop => {
                state.phase = Phase::Idle;
            }
            PgOutputMessage::StreamCommit(commit) => {
                self.context.set_last_commit(commit.commit_lsn);
                state.open_transactions.remove(&commit.xid);
                self.sink
                    .transaction_committed(commit.xid, commit.commit_lsn, commit.end_lsn, &xld)
                    .await?;
            }
            PgOutputMessage::StreamAbort(abort) => {
                if abort.xid == abort.sub_xid {
                    state.open_transactions.remove(&abort.xid);
                    self.sink.transaction_aborted(abort.xid).await?;
                } else {
                    debug!(
                        "subtransaction {} of {} aborted",
                        abort.sub_xid, abort.xid
                    );
                }
            }
        }

        Ok(())
    }

    /// The transaction a row message belongs to: its stream xid, or the
    /// current non-streamed transaction.
    fn effective_xid(&self, state: &ResolverState, message_xid: Option<u32>) -> Result<u32> {
        if let Some(xid) = message_xid {
            return Ok(xid);
        }
        match state.phase {
            Phase::InTxn(xid) => Ok(xid),
            phase => Err(StreamerError::replication(format!(
                "row message outside a transaction (phase {phase:?})"
            ))),
        }
    }

    async fn handle_row(
        &self,
        state: &mut ResolverState,
        relation: &RelationBody,
        op: Op,
        old_tuple: Option<&Tuple>,
        new_tuple: Option<&Tuple>,
        xid: u32,
        xld: &XLogData,
    ) -> Result<()> {
        match self.catalog.resolve_relation(&relation.namespace, &relation.name) {
            ResolvedRelation::Watermark => {
                if op == Op::Create {
                    if let Some(tuple) = new_tuple {
                        let values = self.decode_tuple(relation, tuple).await?;
                        self.handle_watermark(&values);
                    }
                }
                Ok(())
            }
            ResolvedRelation::CatalogHypertable => {
                let values = match new_tuple.or(old_tuple) {
                    Some(tuple) => self.decode_tuple(relation, tuple).await?,
                    None => return Ok(()),
                };
                self.handle_catalog_hypertable(op, &values).await
            }
            ResolvedRelation::CatalogChunk => {
                let values = match new_tuple.or(old_tuple) {
                    Some(tuple) => self.decode_tuple(relation, tuple).await?,
                    None => return Ok(()),
                };
                self.handle_catalog_chunk(op, &values).await
            }
            ResolvedRelation::Chunk { hypertable_id, .. }
            | ResolvedRelation::Hypertable { hypertable_id } => {
                self.emit_row_change(state, relation, hypertable_id, op, old_tuple, new_tuple, xid, xld)
                    .await
            }
            ResolvedRelation::Unknown => {
                self.skip_relation(state, relation.id, &xld.wal_start);
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_row_change(
        &self,
        state: &mut ResolverState,
        relation: &RelationBody,
        hypertable_id: i32,
        op: Op,
        old_tuple: Option<&Tuple>,
        new_tuple: Option<&Tuple>,
        xid: u32,
        xld: &XLogData,
    ) -> Result<()> {
        let enabled = match op {
            Op::Create => self.events.insert,
            Op::Update => self.events.update,
            Op::Delete => self.events.delete,
            _ => true,
        };
        if !enabled {
            return Ok(());
        }

        let Some(hypertable) = self.catalog.hypertable(hypertable_id) else {
            self.skip_relation(state, relation.id, &xld.wal_start);
            return Ok(());
        };
        if !self.catalog.is_included(&hypertable) {
            return Ok(());
        }

        let before = match old_tuple {
            Some(tuple) => Some(self.decode_tuple(relation, tuple).await?),
            None => None,
        };
        let after = match new_tuple {
            Some(tuple) => Some(self.decode_tuple(relation, tuple).await?),
            None => None,
        };

        // streamed value wins inside an open snapshot window
        let surface = hypertable.surface_ref();
        let canonical = hypertable.canonical_name();
        if self.windows.is_open(&canonical) {
            if let Some(row) = after.as_ref().or(before.as_ref()) {
                let key = row_key(&hypertable.key_columns(), row);
                self.windows.record_streamed_key(&canonical, key);
            }
        }

        let transaction = state.open_transactions.get_mut(&xid);
        let (sequence, commit_ts_ms) = match transaction {
            Some(txn) => {
                let sequence = txn.sequence;
                txn.sequence += 1;
                (sequence, txn.commit_ts_ms)
            }
            None => (0, None),
        };

        let event = ChangeEvent {
            relation_schema: relation.namespace.clone(),
            relation_table: relation.name.clone(),
            op,
            before,
            after,
            source: SourceInfo {
                system: self.context.system().system_id.clone(),
                database: self.context.database_name().to_string(),
                schema: surface.schema,
                table: surface.name,
                ts_ms: commit_ts_ms.unwrap_or(xld.server_time_ms),
                lsn: xld.wal_start,
                tx_id: Some(xid),
                slot: self.context.slot_name().to_string(),
                snapshot: false,
            },
            transaction: Some(TransactionInfo { id: xid, sequence }),
        };

        self.sink.publish_change(event, xld).await
    }

    async fn handle_truncate(
        &self,
        state: &mut ResolverState,
        truncate: &TruncateBody,
        xid: u32,
        xld: &XLogData,
    ) -> Result<()> {
        if !self.events.truncate {
            return Ok(());
        }

        // map physical relations back to distinct hypertables
        let mut hypertable_ids = Vec::new();
        for relation_id in &truncate.relation_ids {
            let Some(relation) = state.relations.get(relation_id) else {
                self.skip_relation(state, *relation_id, &xld.wal_start);
                continue;
            };
            match self.catalog.resolve_relation(&relation.namespace, &relation.name) {
                ResolvedRelation::Chunk { hypertable_id, .. }
                | ResolvedRelation::Hypertable { hypertable_id } => {
                    if !hypertable_ids.contains(&hypertable_id) {
                        hypertable_ids.push(hypertable_id);
                    }
                }
                _ => {}
            }
        }

        for hypertable_id in hypertable_ids {
            let Some(hypertable) = self.catalog.hypertable(hypertable_id) else {
                continue;
            };
            if !self.catalog.is_included(&hypertable) {
                continue;
            }
            let surface = hypertable.surface_ref();
            let (sequence, commit_ts_ms) = match state.open_transactions.get_mut(&xid) {
                Some(txn) => {
                    let sequence = txn.sequence;
                    txn.sequence += 1;
                    (sequence, txn.commit_ts_ms)
                }
                None => (0, None),
            };
            let event = ChangeEvent {
                relation_schema: hypertable.schema.clone(),
                relation_table: hypertable.name.clone(),
                op: Op::Truncate,
                before: None,
                after: None,
                source: SourceInfo {
                    system: self.context.system().system_id.clone(),
                    database: self.context.database_name().to_string(),
                    schema: surface.schema,
                    table: surface.name,
                    ts_ms: commit_ts_ms.unwrap_or(xld.server_time_ms),
                    lsn: xld.wal_start,
                    tx_id: Some(xid),
                    slot: self.context.slot_name().to_string(),
                    snapshot: false,
                },
                transaction: Some(TransactionInfo { id: xid, sequence }),
            };
            self.sink.publish_change(event, xld).await?;
        }
        Ok(())
    }

    fn handle_watermark(&self, values: &Map<String, Value>) {
        let kind = values.get("kind").and_then(Value::as_str).unwrap_or("");
        let hypertable = values
            .get("hypertable")
            .and_then(Value::as_str)
            .unwrap_or("");
        match kind {
            "low" => self.windows.open(hypertable),
            "high" => self.windows.close(hypertable),
            other => warn!("unknown watermark kind {other:?} for {hypertable}"),
        }
    }

    /// `_timescaledb_catalog.hypertable` traffic: hypertable DDL.
    async fn handle_catalog_hypertable(&self, op: Op, values: &Map<String, Value>) -> Result<()> {
        let Some(id) = value_i32(values, "id") else {
            return Ok(());
        };

        match op {
            Op::Create => {
                let Some(schema) = values.get("schema_name").and_then(Value::as_str) else {
                    return Ok(());
                };
                let Some(name) = values.get("table_name").and_then(Value::as_str) else {
                    return Ok(());
                };
                let table = TableRef::new(schema, name);
                let side_channel = self.context.side_channel();

                let hypertable = crate::catalog::Hypertable {
                    id,
                    schema: schema.to_string(),
                    name: name.to_string(),
                    partitioning_columns: Vec::new(),
                    compression_state: value_i16(values, "compression_state").unwrap_or(0),
                    compressed_hypertable_id: value_i32(values, "compressed_hypertable_id"),
                    continuous_aggregate: side_channel.read_continuous_aggregate(id).await?,
                    replica_identity: side_channel.read_replica_identity(&table).await?,
                    columns: side_channel.read_hypertable_schema(&table).await?,
                };

                if self.catalog.register_hypertable(hypertable) {
                    self.context
                        .dispatcher()
                        .enqueue(StreamEvent::HypertableIncluded { hypertable_id: id })
                        .await?;
                }
            }
            Op::Update => {
                if let Some(compression_state) = value_i16(values, "compression_state") {
                    if let Ok(previous) =
                        self.catalog.set_compression_state(id, compression_state)
                    {
                        let compressed = compression_state == 1 && previous != 1;
                        let decompressed = previous == 1 && compression_state != 1;
                        let report = (compressed && self.events.compression)
                            || (decompressed && self.events.decompression);
                        if report {
                            self.context
                                .dispatcher()
                                .enqueue(StreamEvent::CompressionChanged {
                                    hypertable_id: id,
                                    compressed,
                                })
                                .await?;
                        }
                    }
                }
            }
            Op::Delete => {
                self.context
                    .dispatcher()
                    .enqueue(StreamEvent::HypertableDropped { hypertable_id: id })
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// `_timescaledb_catalog.chunk` traffic: chunk lifecycle.
    async fn handle_catalog_chunk(&self, op: Op, values: &Map<String, Value>) -> Result<()> {
        let Some(id) = value_i32(values, "id") else {
            return Ok(());
        };

        match op {
            Op::Create => {
                let Some(hypertable_id) = value_i32(values, "hypertable_id") else {
                    return Ok(());
                };
                let Some(schema) = values.get("schema_name").and_then(Value::as_str) else {
                    return Ok(());
                };
                let Some(name) = values.get("table_name").and_then(Value::as_str) else {
                    return Ok(());
                };
                let chunk = Chunk {
                    id,
                    hypertable_id,
                    schema: schema.to_string(),
                    name: name.to_string(),
                    dropped: values
                        .get("dropped")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    compressed_chunk_id: value_i32(values, "compressed_chunk_id"),
                };
                match self.catalog.register_chunk(chunk) {
                    Ok(()) => {
                        self.context
                            .dispatcher()
                            .enqueue(StreamEvent::ChunkCreated {
                                hypertable_id,
                                chunk_id: id,
                            })
                            .await?;
                    }
                    Err(err) => {
                        // runtime DDL of a hypertable we never mirrored
                        debug!("ignoring chunk {id}: {err}");
                    }
                }
            }
            Op::Update => {
                let dropped = values
                    .get("dropped")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if dropped {
                    if let Some(hypertable_id) = self.catalog.mark_chunk_dropped(id) {
                        self.context
                            .dispatcher()
                            .enqueue(StreamEvent::ChunkDropped {
                                hypertable_id,
                                chunk_id: id,
                            })
                            .await?;
                    }
                }
            }
            Op::Delete => {
                if let Some(hypertable_id) = self.catalog.mark_chunk_dropped(id) {
                    self.context
                        .dispatcher()
                        .enqueue(StreamEvent::ChunkDropped {
                            hypertable_id,
                            chunk_id: id,
                        })
                        .await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// A RELATION message may reveal schema drift (column add/drop).
    /// Refresh the mirrored schema from the catalog when it does.
    async fn refresh_relation_schema(&self, relation: &RelationBody) -> Result<()> {
        let hypertable_id =
            match self.catalog.resolve_relation(&relation.namespace, &relation.name) {
                ResolvedRelation::Chunk { hypertable_id, .. } => hypertable_id,
                ResolvedRelation::Hypertable { hypertable_id } => hypertable_id,
                _ => return Ok(()),
            };
        let Some(hypertable) = self.catalog.hypertable(hypertable_id) else {
            return Ok(());
        };

        let mirrored: Vec<(&str, u32)> = hypertable
            .columns
            .iter()
            .map(|c| (c.name.as_str(), c.oid))
            .collect();
        let streamed: Vec<(&str, u32)> = relation
            .columns
            .iter()
            .map(|c| (c.name.as_str(), c.type_oid))
            .collect();
        if mirrored == streamed {
            return Ok(());
        }

        debug!(
            "schema drift on {}.{}, refreshing {}",
            relation.namespace,
            relation.name,
            hypertable.canonical_name()
        );
        let columns = self
            .context
            .side_channel()
            .read_hypertable_schema(&hypertable.table_ref())
            .await
            .map_err(|e| {
                StreamerError::catalog(format!(
                    "schema refresh of {} failed: {e}",
                    hypertable.canonical_name()
                ))
            })?;
        self.catalog.update_hypertable_schema(hypertable_id, columns)?;

        // interned schemas for the old shape are stale now
        let surface = hypertable.surface_ref();
        let names = self.context.schema_manager().names().clone();
        let topic = names.event_topic_name(&surface.schema, &surface.name);
        self.context
            .schema_manager()
            .registry()
            .unregister_prefix(&topic);
        Ok(())
    }

    async fn decode_tuple(
        &self,
        relation: &RelationBody,
        tuple: &Tuple,
    ) -> Result<Map<String, Value>> {
        let resolver = self.context.type_resolver();
        let mut row = Map::new();
        for (column, data) in relation.columns.iter().zip(tuple.0.iter()) {
            let value = match data {
                TupleData::Null => Value::Null,
                // unchanged TOAST values are not on the wire; omit them
                TupleData::Toast => continue,
                TupleData::Text(raw) => {
                    let text = String::from_utf8_lossy(raw);
                    match resolver.decode(column.type_oid, &text).await {
                        Ok(value) => value,
                        Err(StreamerError::Decode { context, message }) => {
                            warn!("decode of {}.{} failed ({message}), degrading {context} to bytes", relation.namespace, relation.name);
                            Value::String(hex::encode(raw))
                        }
                        Err(err) => return Err(err),
                    }
                }
            };
            row.insert(column.name.clone(), value);
        }
        Ok(row)
    }

    fn skip_relation(&self, _state: &mut ResolverState, relation_id: u32, lsn: &Lsn) {
        let identity = format!("relation:{relation_id}");
        if self
            .diagnostics
            .should_log(ErrorCategory::Catalog, &identity)
        {
            warn!("skipped unknown relation {relation_id} at {lsn}");
        } else {
            debug!("skipped unknown relation {relation_id} at {lsn}");
        }
    }

    /// Confirm a non-emitting frame, but only while no transaction is
    /// in flight, so buffered rows are never acknowledged early.
    async fn acknowledge_if_idle(&self, state: &ResolverState, xld: &XLogData) -> Result<()> {
        if state.open_transactions.is_empty() && state.phase == Phase::Idle {
            self.context.acknowledge_processed(xld, None).await?;
        }
        Ok(())
    }
}

fn value_i32(values: &Map<String, Value>, key: &str) -> Option<i32> {
    values
        .get(key)
        .and_then(Value::as_i64)
        .and_then(|v| i32::try_from(v).ok())
}

fn value_i16(values: &Map<String, Value>, key: &str) -> Option<i16> {
    values
        .get(key)
        .and_then(Value::as_i64)
        .and_then(|v| i16::try_from(v).ok())
}
