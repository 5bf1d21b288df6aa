//! Replication context: the composition root
//!
//! Owns the side channel, the managers, the dispatcher and the four LSN
//! positions. Components receive only the narrow views they need; the
//! LSN quad sits behind one short-lived lock that is never held across
//! an await.

use crate::config::InitialSnapshotMode;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::pgtypes::{Lsn, XLogData};
use crate::schema::{NameGenerator, SchemaRegistry};
use crate::sidechannel::{SideChannelApi, SystemInformation};
use crate::state::{Offset, StateManager};
use crate::typeres::TypeResolver;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// The four tracked WAL positions plus the last seen transaction id.
#[derive(Debug, Clone, Copy, Default)]
pub struct LsnPositions {
    pub last_begin: Lsn,
    pub last_commit: Lsn,
    pub last_received: Lsn,
    pub last_processed: Lsn,
    pub last_transaction_id: u32,
}

/// Capability view over publication operations. Publication membership
/// is only ever mutated through this view, from the dispatcher task.
pub struct PublicationManager {
    side_channel: Arc<dyn SideChannelApi>,
    name: String,
    create: bool,
    autodrop: bool,
}

impl PublicationManager {
    pub fn new(side_channel: Arc<dyn SideChannelApi>, name: String, create: bool, autodrop: bool) -> Self {
        Self {
            side_channel,
            name,
            create,
            autodrop,
        }
    }

    pub fn publication_name(&self) -> &str {
        &self.name
    }

    pub fn publication_create(&self) -> bool {
        self.create
    }

    pub fn publication_autodrop(&self) -> bool {
        self.autodrop
    }

    pub async fn create_publication(&self) -> Result<bool> {
        self.side_channel.create_publication(&self.name).await
    }

    pub async fn exists_publication(&self) -> Result<bool> {
        self.side_channel.exists_publication(&self.name).await
    }

    pub async fn drop_publication(&self) -> Result<()> {
        self.side_channel.drop_publication(&self.name).await
    }

    pub async fn attach_tables(&self, tables: &[crate::catalog::TableRef]) -> Result<()> {
        self.side_channel
            .attach_tables_to_publication(&self.name, tables)
            .await
    }

    pub async fn detach_tables(&self, tables: &[crate::catalog::TableRef]) -> Result<()> {
        self.side_channel
            .detach_tables_from_publication(&self.name, tables)
            .await
    }

    pub async fn read_published_tables(&self) -> Result<Vec<crate::catalog::TableRef>> {
        self.side_channel.read_published_tables(&self.name).await
    }
}

/// Capability view over schema interning and naming.
pub struct SchemaManager {
    registry: Arc<SchemaRegistry>,
    names: Arc<NameGenerator>,
}

impl SchemaManager {
    pub fn new(registry: Arc<SchemaRegistry>, names: Arc<NameGenerator>) -> Self {
        Self { registry, names }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn names(&self) -> &Arc<NameGenerator> {
        &self.names
    }
}

/// Everything the streamer's components share.
pub struct ReplicationContext {
    side_channel: Arc<dyn SideChannelApi>,
    dispatcher: Arc<Dispatcher>,
    state_manager: Arc<StateManager>,
    publication_manager: Arc<PublicationManager>,
    schema_manager: Arc<SchemaManager>,
    type_resolver: Arc<TypeResolver>,

    system: SystemInformation,
    wal_level: String,
    postgres_version: i32,
    timescaledb_version: String,

    slot_name: String,
    slot_create: bool,
    slot_autodrop: bool,
    snapshot_mode: InitialSnapshotMode,
    snapshot_batch_size: usize,

    positions: Mutex<LsnPositions>,
    stopped: AtomicBool,
}

pub struct ReplicationContextBuilder {
    side_channel: Arc<dyn SideChannelApi>,
    dispatcher: Arc<Dispatcher>,
    state_manager: Arc<StateManager>,
    publication_manager: Arc<PublicationManager>,
    schema_manager: Arc<SchemaManager>,
    type_resolver: Arc<TypeResolver>,
    system: SystemInformation,
    wal_level: String,
    postgres_version: i32,
    timescaledb_version: String,
    slot_name: String,
    slot_create: bool,
    slot_autodrop: bool,
    snapshot_mode: InitialSnapshotMode,
    snapshot_batch_size: usize,
}

impl ReplicationContextBuilder {
    pub fn slot(mut self, name: impl Into<String>, create: bool, autodrop: bool) -> Self {
        self.slot_name = name.into();
        self.slot_create = create;
        self.slot_autodrop = autodrop;
        self
    }

    pub fn snapshot(mut self, mode: InitialSnapshotMode, batch_size: usize) -> Self {
        self.snapshot_mode = mode;
        self.snapshot_batch_size = batch_size;
        self
    }

    pub fn build(self) -> Arc<ReplicationContext> {
        Arc::new(ReplicationContext {
            side_channel: self.side_channel,
            dispatcher: self.dispatcher,
            state_manager: self.state_manager,
            publication_manager: self.publication_manager,
            schema_manager: self.schema_manager,
            type_resolver: self.type_resolver,
            system: self.system,
            wal_level: self.wal_level,
            postgres_version: self.postgres_version,
            timescaledb_version: self.timescaledb_version,
            slot_name: self.slot_name,
            slot_create: self.slot_create,
            slot_autodrop: self.slot_autodrop,
            snapshot_mode: self.snapshot_mode,
            snapshot_batch_size: self.snapshot_batch_size,
            positions: Mutex::new(LsnPositions::default()),
            stopped: AtomicBool::new(false),
        })
    }
}

impl ReplicationContext {
    #[allow(clippy::too_many_arguments)]
    pub fn builder(
        side_channel: Arc<dyn SideChannelApi>,
        dispatcher: Arc<Dispatcher>,
        state_manager: Arc<StateManager>,
        publication_manager: Arc<PublicationManager>,
        schema_manager: Arc<SchemaManager>,
        type_resolver: Arc<TypeResolver>,
        system: SystemInformation,
        wal_level: String,
        postgres_version: i32,
        timescaledb_version: String,
    ) -> ReplicationContextBuilder {
        ReplicationContextBuilder {
            side_channel,
            dispatcher,
            state_manager,
            publication_manager,
            schema_manager,
            type_resolver,
            system,
            wal_level,
            postgres_version,
            timescaledb_version,
            slot_name: String::new(),
            slot_create: true,
            slot_autodrop: true,
            snapshot_mode: InitialSnapshotMode::Never,
            snapshot_batch_size: 1000,
        }
    }

    pub fn side_channel(&self) -> &Arc<dyn SideChannelApi> {
        &self.side_channel
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.state_manager
    }

    pub fn publication_manager(&self) -> &Arc<PublicationManager> {
        &self.publication_manager
    }

    pub fn schema_manager(&self) -> &Arc<SchemaManager> {
        &self.schema_manager
    }

    pub fn type_resolver(&self) -> &Arc<TypeResolver> {
        &self.type_resolver
    }

    pub fn system(&self) -> &SystemInformation {
        &self.system
    }

    pub fn database_name(&self) -> &str {
        &self.system.database
    }

    pub fn wal_level(&self) -> &str {
        &self.wal_level
    }

    pub fn is_logical_replication_enabled(&self) -> bool {
        self.wal_level == "logical"
    }

    pub fn postgres_version(&self) -> i32 {
        self.postgres_version
    }

    pub fn timescaledb_version(&self) -> &str {
        &self.timescaledb_version
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    pub fn slot_create(&self) -> bool {
        self.slot_create
    }

    pub fn slot_autodrop(&self) -> bool {
        self.slot_autodrop
    }

    pub fn snapshot_mode(&self) -> InitialSnapshotMode {
        self.snapshot_mode
    }

    pub fn snapshot_batch_size(&self) -> usize {
        self.snapshot_batch_size
    }

    // ---- LSN bookkeeping ----

    pub fn positions(&self) -> LsnPositions {
        *self.positions.lock()
    }

    pub fn set_last_begin(&self, lsn: Lsn, transaction_id: u32) {
        let mut positions = self.positions.lock();
        positions.last_begin = lsn;
        positions.last_transaction_id = transaction_id;
    }

    pub fn set_last_commit(&self, lsn: Lsn) {
        self.positions.lock().last_commit = lsn;
    }

    pub fn last_transaction_id(&self) -> u32 {
        self.positions.lock().last_transaction_id
    }

    /// Restore positions from a persisted offset on startup.
    pub fn restore_position(&self, lsn: Lsn) {
        let mut positions = self.positions.lock();
        positions.last_received = lsn;
        positions.last_processed = lsn;
    }

    /// Record receipt: `last_received = wal_start + len(data)`.
    pub fn acknowledge_received(&self, xld: &XLogData) {
        self.positions.lock().last_received = xld.end_position();
    }

    /// Advance `last_processed` monotonically and persist the offset.
    /// With `processed` set (commit boundaries), that position wins over
    /// the frame arithmetic.
    pub async fn acknowledge_processed(
        &self,
        xld: &XLogData,
        processed: Option<Lsn>,
    ) -> Result<()> {
        let new_processed = processed.unwrap_or_else(|| xld.end_position());

        let persisted = {
            let mut positions = self.positions.lock();
            if new_processed > positions.last_processed {
                positions.last_processed = new_processed;
            }
            positions.last_processed
        };

        if processed.is_some() {
            debug!("acknowledged transaction end at {persisted}");
        }

        let offset = Offset::new(persisted, millis_to_datetime(xld.server_time_ms));
        self.state_manager.set(&self.slot_name, offset).await
    }

    /// Offset persisted for this context's slot, if any.
    pub async fn stored_offset(&self) -> Result<Option<Offset>> {
        self.state_manager.offset(&self.slot_name).await
    }

    pub async fn start(&self) -> Result<()> {
        self.dispatcher.start();
        self.state_manager.start().await
    }

    /// Idempotent: drains the dispatcher and flushes state once.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.dispatcher.stop().await;
        self.state_manager.stop().await
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn xld(start: u64, len: usize, server_time_ms: i64) -> XLogData {
        XLogData {
            wal_start: Lsn(start),
            wal_end: Lsn(start + len as u64),
            server_time_ms,
            data: Bytes::from(vec![0u8; len]),
        }
    }

    // Constructing a full ReplicationContext needs a live side channel;
    // these tests pin down the position arithmetic the context wraps.

    #[test]
    fn test_positions_default_zero() {
        let positions = LsnPositions::default();
        assert_eq!(positions.last_processed, Lsn::ZERO);
        assert!(positions.last_processed <= positions.last_received);
    }

    #[test]
    fn test_received_is_start_plus_len() {
        let frame = xld(0x100, 0x10, 1_700_000_000_000);
        let mut positions = LsnPositions::default();
        positions.last_received = frame.end_position();
        assert_eq!(positions.last_received, Lsn(0x110));
    }

    #[test]
    fn test_processed_advances_monotonically() {
        let positions = Mutex::new(LsnPositions::default());
        let advance = |new: Lsn| {
            let mut p = positions.lock();
            if new > p.last_processed {
                p.last_processed = new;
            }
            p.last_processed
        };

        assert_eq!(advance(Lsn(0x110)), Lsn(0x110));
        assert_eq!(advance(Lsn(0x90)), Lsn(0x110)); // never regresses
        assert_eq!(advance(Lsn(0x200)), Lsn(0x200));
    }

    #[test]
    fn test_millis_to_datetime() {
        let dt = millis_to_datetime(946_684_800_000);
        assert_eq!(dt.timestamp(), 946_684_800);
    }
}
