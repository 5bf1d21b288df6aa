//! Streamer lifecycle
//!
//! Wires the side channel, catalog mirror, dispatcher, resolver,
//! snapshotter, channel and sinks together, and owns graceful startup
//! and shutdown.

use crate::catalog::{HypertableFilter, SystemCatalog, TableRef};
use crate::config::{Config, InitialSnapshotMode};
use crate::context::{PublicationManager, ReplicationContext, SchemaManager};
use crate::dispatch::{CatalogHandler, Dispatcher};
use crate::emit::EventEmitter;
use crate::error::{Result, StreamerError};
use crate::plugin::ExtensionPoints;
use crate::replication::channel::{ReplicationChannel, ReplicationChannelConfig, XLogHandler};
use crate::replication::resolver::{DirectEmitSink, EventSink, LogicalReplicationResolver};
use crate::replication::tracker::{TransactionTracker, TransactionWindow};
use crate::schema::{NameGenerator, SchemaRegistry};
use crate::sidechannel::{Grant, SideChannel};
use crate::sink::SinkManager;
use crate::snapshot::{SnapshotWindows, Snapshotter};
use crate::state::StateManager;
use crate::typeres::TypeResolver;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Minimum supported server versions.
pub const PG_MIN_VERSION: i32 = 130_000;
pub const TSDB_MIN_VERSION: &str = "2.0";

/// Grace period for background tasks to wind down on stop.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// What `start` left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Streaming is running; call `wait` and eventually `stop`
    Streaming,
    /// `initialOnly` mode: the snapshot ran to completion and there is
    /// nothing left to do
    SnapshotOnlyDone,
}

struct Running {
    context: Arc<ReplicationContext>,
    side_channel: Arc<SideChannel>,
    sinks: Arc<SinkManager>,
    cancel: watch::Sender<bool>,
    /// Set exactly once, when the channel task finishes
    channel_result: Arc<Mutex<Option<Result<()>>>>,
    channel_done: watch::Receiver<bool>,
    slot_name: String,
    slot_autodrop: bool,
    publication_autodrop: bool,
}

/// The streamer.
pub struct Streamer {
    config: Config,
    extensions: ExtensionPoints,
    running: Mutex<Option<Running>>,
}

impl Streamer {
    pub fn new(config: Config, extensions: ExtensionPoints) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            extensions,
            running: Mutex::new(None),
        })
    }

    /// Boot the pipeline.
    pub async fn start(&self) -> Result<StartOutcome> {
        let config = &self.config;
        let connection = config.postgresql.connection.clone();

        // side channel and environment probes
        let side_channel = Arc::new(SideChannel::connect(&connection).await?);

        let wal_level = side_channel.read_wal_level().await?;
        if wal_level != "logical" {
            return Err(StreamerError::config(format!(
                "wal_level must be 'logical', found {wal_level:?}"
            )));
        }
        let postgres_version = side_channel.read_postgres_version().await?;
        if postgres_version < PG_MIN_VERSION {
            return Err(StreamerError::config(format!(
                "PostgreSQL {postgres_version} is older than the supported minimum {PG_MIN_VERSION}"
            )));
        }
        let timescaledb_version = side_channel.read_timescaledb_version().await?;
        let tsdb_major: u32 = timescaledb_version
            .split('.')
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if tsdb_major < 2 {
            return Err(StreamerError::config(format!(
                "TimescaleDB {timescaledb_version} is older than the supported minimum {TSDB_MIN_VERSION}"
            )));
        }
        let system = side_channel.read_system_information().await?;
        info!(
            "connected to {} (system {}, timeline {}), TimescaleDB {}",
            system.database, system.system_id, system.timeline, timescaledb_version
        );

        // names and managers
        let slot_name = config.effective_slot_name();
        let publication_name = config.effective_publication_name(&slot_name);

        let state_storage = self.extensions.create_state_storage(&config.statestorage)?;
        let state_manager = Arc::new(StateManager::new(state_storage));

        let naming_strategy = self
            .extensions
            .create_naming_strategy(&config.topic.namingstrategy.kind)?;
        let names = Arc::new(NameGenerator::new(&config.topic.prefix, naming_strategy));
        let schema_manager = Arc::new(SchemaManager::new(Arc::new(SchemaRegistry::new()), names));

        let type_resolver = Arc::new(TypeResolver::new(side_channel.clone()));
        let dispatcher = Arc::new(Dispatcher::new());
        let publication_manager = Arc::new(PublicationManager::new(
            side_channel.clone(),
            publication_name.clone(),
            config.postgresql.publication.create,
            config.postgresql.publication.autodrop,
        ));

        let context = ReplicationContext::builder(
            side_channel.clone(),
            dispatcher.clone(),
            state_manager,
            publication_manager.clone(),
            schema_manager.clone(),
            type_resolver.clone(),
            system,
            wal_level,
            postgres_version,
            timescaledb_version,
        )
        .slot(
            &slot_name,
            config.postgresql.replicationslot.create,
            config.postgresql.replicationslot.autodrop,
        )
        .snapshot(
            config.postgresql.snapshot.initial,
            config.postgresql.snapshot.batchsize,
        )
        .build();

        context.start().await?;

        if let Some(offset) = context.stored_offset().await? {
            info!("resuming from stored offset {}", offset.lsn);
            context.restore_position(offset.lsn);
        }

        // mirror the catalog
        let filter = HypertableFilter::new(
            &config.timescaledb.hypertables.includes,
            &config.timescaledb.hypertables.excludes,
        )?;
        let catalog = Arc::new(SystemCatalog::new(filter));

        for hypertable in side_channel.read_hypertables().await? {
            catalog.register_hypertable(hypertable);
        }
        for chunk in side_channel.read_chunks().await? {
            if chunk.dropped {
                continue;
            }
            if let Err(err) = catalog.register_chunk(chunk) {
                warn!("skipping chunk during discovery: {err}");
            }
        }
        let included = catalog.included_hypertables();
        info!(
            "mirrored {} hypertable(s), {} included, {} chunk(s)",
            catalog.hypertable_count(),
            included.len(),
            catalog.chunk_count()
        );

        // the connecting role must be able to read what it streams
        let channel_config = ReplicationChannelConfig::from_connection_string(
            &connection,
            config.postgresql.password.as_deref(),
            &slot_name,
            &publication_name,
            false,
        )?;
        for hypertable in &included {
            let table = hypertable.table_ref();
            if !side_channel
                .has_table_privilege(&channel_config.user, &table, Grant::Select)
                .await?
            {
                return Err(StreamerError::auth(format!(
                    "role {} lacks SELECT on {table}",
                    channel_config.user
                )));
            }
        }

        // publication
        if config.postgresql.publication.create {
            publication_manager.create_publication().await?;
        } else if !publication_manager.exists_publication().await? {
            return Err(StreamerError::config(format!(
                "publication {publication_name:?} does not exist and creation is disabled"
            )));
        }
        let mut publication_tables: Vec<TableRef> =
            included.iter().map(|ht| ht.table_ref()).collect();
        for hypertable in &included {
            for chunk in catalog.chunks_of(hypertable.id) {
                publication_tables.push(chunk.table_ref());
            }
        }
        let snapshot_mode = context.snapshot_mode();
        if snapshot_mode != InitialSnapshotMode::Never {
            side_channel.ensure_watermark_table().await?;
            publication_tables.push(TableRef::new(
                crate::catalog::WATERMARK_SCHEMA,
                crate::catalog::WATERMARK_TABLE,
            ));
        }
        publication_manager.attach_tables(&publication_tables).await?;

        // sinks and emission
        let sink = self
            .extensions
            .sinks()
            .create(&config.sink.kind, &config.sink.options)?;
        let sinks = Arc::new(SinkManager::new(vec![sink]));
        sinks.start().await?;

        let emitter = Arc::new(EventEmitter::new(
            schema_manager.clone(),
            catalog.clone(),
            type_resolver.clone(),
            sinks.clone(),
        ));
        dispatcher.register_record_handler(emitter).await;

        // replication slot
        let slot_exists = side_channel.exists_replication_slot(&slot_name).await?;
        if !slot_exists && !config.postgresql.replicationslot.create {
            return Err(StreamerError::config(format!(
                "replication slot {slot_name:?} does not exist and creation is disabled"
            )));
        }
        let slot_is_fresh = !slot_exists;

        let channel_config = ReplicationChannelConfig {
            create_slot: slot_is_fresh,
            ..channel_config
        };

        // resolver, optional transaction window, snapshot plumbing
        let windows = Arc::new(SnapshotWindows::new());
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let window_config = &config.postgresql.transaction.window;
        let emit_sink: Arc<dyn EventSink> = if window_config.enabled {
            let tracker = Arc::new(TransactionTracker::new(
                context.clone(),
                TransactionWindow {
                    max_size: window_config.maxsize,
                    timeout: Duration::from_secs(window_config.timeout),
                },
            ));
            tracker.start_sweeper(cancel_rx.clone());
            tracker
        } else {
            Arc::new(DirectEmitSink::new(context.clone()))
        };

        let resolver: Arc<dyn XLogHandler> = Arc::new(LogicalReplicationResolver::new(
            context.clone(),
            catalog.clone(),
            windows.clone(),
            emit_sink,
            config.timescaledb.events.clone(),
        ));

        let snapshotter = Arc::new(Snapshotter::new(
            context.clone(),
            catalog.clone(),
            windows,
            config.timescaledb.events.clone(),
        ));

        // catalog lifecycle handler: publication upkeep and snapshot
        // scheduling, serialised on the dispatcher task
        dispatcher
            .register_catalog_handler(Arc::new(CatalogLifecycleHandler {
                context: context.clone(),
                catalog: catalog.clone(),
                snapshotter: snapshotter.clone(),
                snapshot_gate: Arc::new(tokio::sync::Mutex::new(())),
                snapshot_on_include: snapshot_mode != InitialSnapshotMode::Never,
            }))
            .await;

        if snapshot_mode == InitialSnapshotMode::InitialOnly {
            info!("initialOnly: snapshotting without streaming");
            snapshotter.run(false).await?;
            sinks.stop().await?;
            context.stop().await?;
            return Ok(StartOutcome::SnapshotOnlyDone);
        }

        let channel = ReplicationChannel::new(channel_config, context.clone(), resolver);
        if slot_is_fresh {
            channel.ensure_slot().await?;
        }

        // stream, with the snapshot (if any) running alongside
        let channel_result: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));
        let (done_tx, channel_done) = watch::channel(false);
        {
            let cancel_rx = cancel_rx.clone();
            let result_slot = channel_result.clone();
            tokio::spawn(async move {
                let result = channel.run(cancel_rx).await;
                *result_slot.lock() = Some(result);
                let _ = done_tx.send(true);
            });
        }

        if Snapshotter::should_snapshot(snapshot_mode, slot_is_fresh) {
            let snapshotter = snapshotter.clone();
            tokio::spawn(async move {
                if let Err(err) = snapshotter.run(true).await {
                    warn!("initial snapshot failed: {err}");
                }
            });
        }

        *self.running.lock() = Some(Running {
            context,
            side_channel,
            sinks,
            cancel: cancel_tx,
            channel_result,
            channel_done,
            slot_name,
            slot_autodrop: config.postgresql.replicationslot.autodrop,
            publication_autodrop: config.postgresql.publication.autodrop,
        });

        Ok(StartOutcome::Streaming)
    }

    /// Wait for the replication channel to end. Returns the fatal error
    /// when it died, `Ok` when it was cancelled by `stop`.
    pub async fn wait(&self) -> Result<()> {
        let (result_slot, mut done) = {
            let guard = self.running.lock();
            match guard.as_ref() {
                Some(running) => (running.channel_result.clone(), running.channel_done.clone()),
                None => return Ok(()),
            }
        };
        if !*done.borrow() {
            let _ = done.changed().await;
        }
        let result = result_slot.lock().take().unwrap_or(Ok(()));
        result
    }

    /// Graceful stop: cancel, drain, flush, release server objects.
    /// Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };

        info!("stopping streamer");
        let _ = running.cancel.send(true);

        let mut done = running.channel_done.clone();
        if !*done.borrow()
            && tokio::time::timeout(STOP_GRACE, done.changed())
                .await
                .is_err()
        {
            warn!("replication channel did not stop within {STOP_GRACE:?}");
        }

        running.sinks.stop().await?;
        running.context.stop().await?;

        if running.slot_autodrop {
            if let Err(err) = running
                .side_channel
                .drop_replication_slot(&running.slot_name)
                .await
            {
                warn!("failed to drop replication slot: {err}");
            }
        }
        if running.publication_autodrop {
            if let Err(err) = running
                .context
                .publication_manager()
                .drop_publication()
                .await
            {
                warn!("failed to drop publication: {err}");
            }
        }

        info!("streamer stopped");
        Ok(())
    }
}

/// Reacts to catalog transitions surfaced by the resolver. Runs on the
/// dispatcher task, so publication membership is never mutated
/// concurrently.
struct CatalogLifecycleHandler {
    context: Arc<ReplicationContext>,
    catalog: Arc<SystemCatalog>,
    snapshotter: Arc<Snapshotter>,
    /// Serialises scheduled snapshots
    snapshot_gate: Arc<tokio::sync::Mutex<()>>,
    snapshot_on_include: bool,
}

#[async_trait]
impl CatalogHandler for CatalogLifecycleHandler {
    async fn on_hypertable_included(&self, hypertable_id: i32) -> Result<()> {
        let Some(hypertable) = self.catalog.hypertable(hypertable_id) else {
            return Ok(());
        };
        info!("hypertable {} joined the stream", hypertable.canonical_name());
        self.context
            .publication_manager()
            .attach_tables(&[hypertable.table_ref()])
            .await?;

        if self.snapshot_on_include {
            let snapshotter = self.snapshotter.clone();
            let gate = self.snapshot_gate.clone();
            tokio::spawn(async move {
                let _serialised = gate.lock().await;
                if let Err(err) = snapshotter.run(true).await {
                    warn!("scheduled snapshot failed: {err}");
                }
            });
        }
        Ok(())
    }

    async fn on_hypertable_dropped(&self, hypertable_id: i32) -> Result<()> {
        let Some(hypertable) = self.catalog.hypertable(hypertable_id) else {
            return Ok(());
        };
        info!("hypertable {} dropped", hypertable.canonical_name());

        let mut tables = vec![hypertable.table_ref()];
        for chunk in self.catalog.chunks_of(hypertable_id) {
            tables.push(chunk.table_ref());
        }

        if let Some(dropped) = self.catalog.drop_hypertable(hypertable_id) {
            let surface = dropped.surface_ref();
            let names = self.context.schema_manager().names().clone();
            let topic = names.event_topic_name(&surface.schema, &surface.name);
            self.context
                .schema_manager()
                .registry()
                .unregister_prefix(&topic);
        }

        if let Err(err) = self
            .context
            .publication_manager()
            .detach_tables(&tables)
            .await
        {
            // runtime DDL of an already-gone table is non-fatal
            warn!("publication cleanup after drop failed: {err}");
        }
        Ok(())
    }

    async fn on_chunk_created(&self, hypertable_id: i32, chunk_id: i32) -> Result<()> {
        let Some(chunk) = self.catalog.chunk(chunk_id) else {
            return Ok(());
        };
        let Some(hypertable) = self.catalog.hypertable(hypertable_id) else {
            return Ok(());
        };
        if !self.catalog.is_included(&hypertable) {
            return Ok(());
        }
        self.context
            .publication_manager()
            .attach_tables(&[chunk.table_ref()])
            .await?;

        // a chunk appearing on an already-streaming hypertable may carry
        // pre-existing rows (e.g. after a move); snapshot it off-thread
        if self.snapshot_on_include {
            let snapshotter = self.snapshotter.clone();
            let gate = self.snapshot_gate.clone();
            tokio::spawn(async move {
                let _serialised = gate.lock().await;
                if let Err(err) = snapshotter.snapshot_chunk(chunk_id).await {
                    warn!("chunk snapshot failed: {err}");
                }
            });
        }
        Ok(())
    }

    async fn on_chunk_dropped(&self, hypertable_id: i32, chunk_id: i32) -> Result<()> {
        let _ = hypertable_id;
        // the chunk lingered in the mirror to drain queued events; by
        // the time this handler runs, those are all dispatched
        let Some(chunk) = self.catalog.remove_chunk(chunk_id) else {
            return Ok(());
        };
        if let Err(err) = self
            .context
            .publication_manager()
            .detach_tables(&[chunk.table_ref()])
            .await
        {
            warn!("publication cleanup after chunk drop failed: {err}");
        }
        Ok(())
    }

    async fn on_compression_changed(&self, hypertable_id: i32, compressed: bool) -> Result<()> {
        if let Some(hypertable) = self.catalog.hypertable(hypertable_id) {
            info!(
                "hypertable {} {}",
                hypertable.canonical_name(),
                if compressed { "compressed" } else { "decompressed" }
            );
        }
        Ok(())
    }
}
