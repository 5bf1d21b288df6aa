//! Side channel: synchronous catalog queries over a dedicated connection
//!
//! Everything the streamer asks the database outside the replication
//! protocol goes through here: identity and version probes, TimescaleDB
//! catalog scans, privilege checks, publication maintenance, watermark
//! writes, and the batched snapshot reads.
//!
//! The side channel connection is never shared with the replication
//! connection. Snapshot reads get their own connection per session so
//! the repeatable-read transaction cannot interfere with catalog
//! queries.

use crate::catalog::{Chunk, Column, Hypertable, TableRef, WATERMARK_SCHEMA, WATERMARK_TABLE};
use crate::error::{Result, StreamerError};
use crate::pgtypes::{Lsn, ReplicaIdentity};
use crate::schema::SchemaType;
use crate::typeres::{builtin_type, PgType, PgTypeKind, TypeCatalog};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::json;
use std::str::FromStr;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

/// Page size for catalog enumeration.
const CATALOG_PAGE_SIZE: i64 = 256;

/// Privilege grants checked against included tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Select,
    Insert,
    Update,
    Delete,
}

impl Grant {
    fn as_str(self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Database identity read at startup.
#[derive(Debug, Clone)]
pub struct SystemInformation {
    pub database: String,
    pub system_id: String,
    pub timeline: i32,
}

/// Quote an identifier for interpolation into DDL.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_table(table: &TableRef) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.name))
}

/// The side channel surface the rest of the streamer consumes. Kept as
/// a trait so components can be exercised against a stub catalog.
#[async_trait]
pub trait SideChannelApi: Send + Sync {
    fn connection_string(&self) -> &str;

    async fn read_system_information(&self) -> Result<SystemInformation>;
    async fn read_wal_level(&self) -> Result<String>;
    async fn read_postgres_version(&self) -> Result<i32>;
    async fn read_timescaledb_version(&self) -> Result<String>;

    async fn read_hypertables(&self) -> Result<Vec<Hypertable>>;
    async fn read_chunks(&self) -> Result<Vec<Chunk>>;
    async fn read_hypertable_schema(&self, table: &TableRef) -> Result<Vec<Column>>;
    async fn read_replica_identity(&self, table: &TableRef) -> Result<ReplicaIdentity>;
    async fn read_continuous_aggregate(
        &self,
        materialized_hypertable_id: i32,
    ) -> Result<Option<TableRef>>;

    async fn has_table_privilege(
        &self,
        role: &str,
        table: &TableRef,
        grant: Grant,
    ) -> Result<bool>;

    async fn exists_publication(&self, publication: &str) -> Result<bool>;
    async fn create_publication(&self, publication: &str) -> Result<bool>;
    async fn drop_publication(&self, publication: &str) -> Result<()>;
    async fn exists_table_in_publication(
        &self,
        publication: &str,
        table: &TableRef,
    ) -> Result<bool>;
    async fn attach_tables_to_publication(
        &self,
        publication: &str,
        tables: &[TableRef],
    ) -> Result<()>;
    async fn detach_tables_from_publication(
        &self,
        publication: &str,
        tables: &[TableRef],
    ) -> Result<()>;
    async fn read_published_tables(&self, publication: &str) -> Result<Vec<TableRef>>;

    async fn exists_replication_slot(&self, slot: &str) -> Result<bool>;
    async fn drop_replication_slot(&self, slot: &str) -> Result<()>;
    async fn current_wal_lsn(&self) -> Result<Lsn>;

    async fn ensure_watermark_table(&self) -> Result<()>;
    async fn insert_low_watermark(&self, hypertable: &Hypertable) -> Result<()>;
    async fn insert_high_watermark(
        &self,
        hypertable: &Hypertable,
        max_key: &serde_json::Value,
    ) -> Result<()>;
}

/// The side channel.
pub struct SideChannel {
    client: Client,
    connection_string: String,
}

impl SideChannel {
    /// Connect and spawn the connection driver.
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
            .await
            .map_err(|e| StreamerError::connect(format!("side channel connect: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("side channel connection error: {e}");
            }
        });

        Ok(Self {
            client,
            connection_string: connection_string.to_string(),
        })
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    // ---- identity and version probes ----

    pub async fn read_system_information(&self) -> Result<SystemInformation> {
        let row = self
            .client
            .query_one(
                "SELECT current_database(), \
                        (SELECT system_identifier FROM pg_control_system())::text, \
                        (SELECT timeline_id FROM pg_control_checkpoint())::int",
                &[],
            )
            .await?;
        Ok(SystemInformation {
            database: row.get(0),
            system_id: row.get(1),
            timeline: row.get(2),
        })
    }

    pub async fn read_wal_level(&self) -> Result<String> {
        let row = self
            .client
            .query_one("SELECT current_setting('wal_level')", &[])
            .await?;
        Ok(row.get(0))
    }

    pub async fn read_postgres_version(&self) -> Result<i32> {
        let row = self
            .client
            .query_one("SELECT current_setting('server_version_num')::int", &[])
            .await?;
        Ok(row.get(0))
    }

    /// Extension version, or [`StreamerError::ExtensionMissing`].
    pub async fn read_timescaledb_version(&self) -> Result<String> {
        let row = self
            .client
            .query_opt(
                "SELECT extversion FROM pg_extension WHERE extname = 'timescaledb'",
                &[],
            )
            .await?;
        match row {
            Some(row) => Ok(row.get(0)),
            None => Err(StreamerError::ExtensionMissing),
        }
    }

    // ---- catalog enumeration ----

    /// Load every hypertable, including partitioning columns, continuous
    /// aggregate mapping, replica identity and column schema.
    pub async fn read_hypertables(&self) -> Result<Vec<Hypertable>> {
        let mut hypertables = Vec::new();
        let mut last_id = -1i32;

        loop {
            let rows = self
                .client
                .query(
                    "SELECT id, schema_name, table_name, compression_state, \
                            compressed_hypertable_id \
                     FROM _timescaledb_catalog.hypertable \
                     WHERE id > $1 ORDER BY id LIMIT $2",
                    &[&last_id, &CATALOG_PAGE_SIZE],
                )
                .await
                .map_err(|e| StreamerError::catalog(format!("hypertable scan: {e}")))?;
            if rows.is_empty() {
                break;
            }

            for row in &rows {
                let id: i32 = row.get(0);
                last_id = id;
                let schema: String = row.get(1);
                let name: String = row.get(2);
                let compression_state: i16 = row.get(3);
                let compressed_hypertable_id: Option<i32> = row.get(4);

                let partitioning_columns = self.read_partitioning_columns(id).await?;
                let continuous_aggregate = self.read_continuous_aggregate(id).await?;
                let table = TableRef::new(schema.clone(), name.clone());
                let replica_identity = self.read_replica_identity(&table).await?;
                let columns = self.read_hypertable_schema(&table).await?;

                hypertables.push(Hypertable {
                    id,
                    schema,
                    name,
                    partitioning_columns,
                    compression_state,
                    compressed_hypertable_id,
                    continuous_aggregate,
                    replica_identity,
                    columns,
                });
            }
        }

        debug!("discovered {} hypertable(s)", hypertables.len());
        Ok(hypertables)
    }

    async fn read_partitioning_columns(&self, hypertable_id: i32) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT column_name FROM _timescaledb_catalog.dimension \
                 WHERE hypertable_id = $1 ORDER BY id",
                &[&hypertable_id],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// View behind a materialized hypertable, when it backs a continuous
    /// aggregate.
    pub async fn read_continuous_aggregate(
        &self,
        materialized_hypertable_id: i32,
    ) -> Result<Option<TableRef>> {
        let row = self
            .client
            .query_opt(
                "SELECT user_view_schema, user_view_name \
                 FROM _timescaledb_catalog.continuous_agg \
                 WHERE mat_hypertable_id = $1",
                &[&materialized_hypertable_id],
            )
            .await?;
        Ok(row.map(|r| TableRef::new(r.get::<_, String>(0), r.get::<_, String>(1))))
    }

    /// Load every chunk.
    pub async fn read_chunks(&self) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::new();
        let mut last_id = -1i32;

        loop {
            let rows = self
                .client
                .query(
                    "SELECT id, hypertable_id, schema_name, table_name, dropped, \
                            compressed_chunk_id \
                     FROM _timescaledb_catalog.chunk \
                     WHERE id > $1 ORDER BY id LIMIT $2",
                    &[&last_id, &CATALOG_PAGE_SIZE],
                )
                .await
                .map_err(|e| StreamerError::catalog(format!("chunk scan: {e}")))?;
            if rows.is_empty() {
                break;
            }

            for row in &rows {
                let id: i32 = row.get(0);
                last_id = id;
                chunks.push(Chunk {
                    id,
                    hypertable_id: row.get(1),
                    schema: row.get(2),
                    name: row.get(3),
                    dropped: row.get(4),
                    compressed_chunk_id: row.get(5),
                });
            }
        }

        debug!("discovered {} chunk(s)", chunks.len());
        Ok(chunks)
    }

    /// Column metadata for a relation, ordered by attribute number.
    pub async fn read_hypertable_schema(&self, table: &TableRef) -> Result<Vec<Column>> {
        let rows = self
            .client
            .query(
                "SELECT a.attname, a.atttypid, t.typname, NOT a.attnotnull, \
                        COALESCE(i.indisprimary, false), \
                        pg_get_expr(d.adbin, d.adrelid) \
                 FROM pg_catalog.pg_attribute a \
                 JOIN pg_catalog.pg_class c ON a.attrelid = c.oid \
                 JOIN pg_catalog.pg_namespace n ON c.relnamespace = n.oid \
                 JOIN pg_catalog.pg_type t ON a.atttypid = t.oid \
                 LEFT JOIN pg_catalog.pg_index i \
                   ON i.indrelid = c.oid AND i.indisprimary \
                  AND a.attnum = ANY(i.indkey) \
                 LEFT JOIN pg_catalog.pg_attrdef d \
                   ON d.adrelid = c.oid AND d.adnum = a.attnum \
                 WHERE n.nspname = $1 AND c.relname = $2 \
                   AND a.attnum > 0 AND NOT a.attisdropped \
                 ORDER BY a.attnum",
                &[&table.schema, &table.name],
            )
            .await
            .map_err(|e| StreamerError::catalog(format!("schema of {table}: {e}")))?;

        Ok(rows
            .iter()
            .map(|row| Column {
                name: row.get(0),
                oid: row.get(1),
                type_name: row.get(2),
                nullable: row.get(3),
                is_primary_key: row.get(4),
                default_expr: row.get(5),
            })
            .collect())
    }

    pub async fn read_replica_identity(&self, table: &TableRef) -> Result<ReplicaIdentity> {
        let row = self
            .client
            .query_one(
                "SELECT c.relreplident::text FROM pg_catalog.pg_class c \
                 JOIN pg_catalog.pg_namespace n ON c.relnamespace = n.oid \
                 WHERE n.nspname = $1 AND c.relname = $2",
                &[&table.schema, &table.name],
            )
            .await
            .map_err(|e| StreamerError::catalog(format!("replica identity of {table}: {e}")))?;
        let tag: String = row.get(0);
        ReplicaIdentity::from_tag(tag.bytes().next().unwrap_or(b'd')).ok_or_else(|| {
            StreamerError::catalog(format!("unknown replica identity {tag:?} for {table}"))
        })
    }

    // ---- privileges ----

    pub async fn has_table_privilege(
        &self,
        role: &str,
        table: &TableRef,
        grant: Grant,
    ) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT has_table_privilege($1, $2, $3)",
                &[&role, &table.canonical(), &grant.as_str()],
            )
            .await?;
        Ok(row.get(0))
    }

    // ---- publication management ----

    pub async fn exists_publication(&self, publication: &str) -> Result<bool> {
        let row = self
            .client
            .query_opt(
                "SELECT 1 FROM pg_publication WHERE pubname = $1",
                &[&publication],
            )
            .await?;
        Ok(row.is_some())
    }

    /// Create the publication when missing. Returns true when created.
    pub async fn create_publication(&self, publication: &str) -> Result<bool> {
        if self.exists_publication(publication).await? {
            return Ok(false);
        }
        self.client
            .execute(
                &format!(
                    "CREATE PUBLICATION {} WITH (publish = 'insert, update, delete, truncate')",
                    quote_ident(publication)
                ),
                &[],
            )
            .await?;
        info!("created publication {publication}");
        Ok(true)
    }

    pub async fn drop_publication(&self, publication: &str) -> Result<()> {
        self.client
            .execute(
                &format!("DROP PUBLICATION IF EXISTS {}", quote_ident(publication)),
                &[],
            )
            .await?;
        info!("dropped publication {publication}");
        Ok(())
    }

    pub async fn exists_table_in_publication(
        &self,
        publication: &str,
        table: &TableRef,
    ) -> Result<bool> {
        let row = self
            .client
            .query_opt(
                "SELECT 1 FROM pg_publication_tables \
                 WHERE pubname = $1 AND schemaname = $2 AND tablename = $3",
                &[&publication, &table.schema, &table.name],
            )
            .await?;
        Ok(row.is_some())
    }

    pub async fn attach_tables_to_publication(
        &self,
        publication: &str,
        tables: &[TableRef],
    ) -> Result<()> {
        if tables.is_empty() {
            return Ok(());
        }
        let mut missing = Vec::new();
        for table in tables {
            if !self.exists_table_in_publication(publication, table).await? {
                missing.push(quote_table(table));
            }
        }
        if missing.is_empty() {
            return Ok(());
        }
        self.client
            .execute(
                &format!(
                    "ALTER PUBLICATION {} ADD TABLE {}",
                    quote_ident(publication),
                    missing.join(", ")
                ),
                &[],
            )
            .await?;
        debug!("attached {} table(s) to {publication}", missing.len());
        Ok(())
    }

    pub async fn detach_tables_from_publication(
        &self,
        publication: &str,
        tables: &[TableRef],
    ) -> Result<()> {
        if tables.is_empty() {
            return Ok(());
        }
        let mut present = Vec::new();
        for table in tables {
            if self.exists_table_in_publication(publication, table).await? {
                present.push(quote_table(table));
            }
        }
        if present.is_empty() {
            return Ok(());
        }
        self.client
            .execute(
                &format!(
                    "ALTER PUBLICATION {} DROP TABLE {}",
                    quote_ident(publication),
                    present.join(", ")
                ),
                &[],
            )
            .await?;
        Ok(())
    }

    pub async fn read_published_tables(&self, publication: &str) -> Result<Vec<TableRef>> {
        let rows = self
            .client
            .query(
                "SELECT schemaname, tablename FROM pg_publication_tables WHERE pubname = $1",
                &[&publication],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| TableRef::new(r.get::<_, String>(0), r.get::<_, String>(1)))
            .collect())
    }

    pub async fn exists_replication_slot(&self, slot: &str) -> Result<bool> {
        let row = self
            .client
            .query_opt(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&slot],
            )
            .await?;
        Ok(row.is_some())
    }

    pub async fn drop_replication_slot(&self, slot: &str) -> Result<()> {
        if self.exists_replication_slot(slot).await? {
            self.client
                .execute("SELECT pg_drop_replication_slot($1)", &[&slot])
                .await?;
            info!("dropped replication slot {slot}");
        }
        Ok(())
    }

    pub async fn current_wal_lsn(&self) -> Result<Lsn> {
        let row = self
            .client
            .query_one("SELECT pg_current_wal_lsn()::text", &[])
            .await?;
        let text: String = row.get(0);
        Lsn::from_str(&text)
    }

    // ---- snapshot watermarks ----

    /// Create the watermark table the snapshot protocol writes its
    /// markers to. The table must be part of the publication so the
    /// markers surface on the replication stream.
    pub async fn ensure_watermark_table(&self) -> Result<()> {
        self.client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {schema}; \
                 CREATE TABLE IF NOT EXISTS {schema}.{table} ( \
                     id bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY, \
                     kind text NOT NULL, \
                     hypertable text NOT NULL, \
                     payload jsonb, \
                     created_at timestamptz NOT NULL DEFAULT now())",
                schema = quote_ident(WATERMARK_SCHEMA),
                table = quote_ident(WATERMARK_TABLE),
            ))
            .await?;
        Ok(())
    }

    /// Insert a watermark marker. Autocommit, so the marker reaches the
    /// replication stream immediately rather than at snapshot commit.
    pub async fn insert_watermark(
        &self,
        kind: &str,
        hypertable: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        self.client
            .execute(
                &format!(
                    "INSERT INTO {}.{} (kind, hypertable, payload) VALUES ($1, $2, $3::jsonb)",
                    quote_ident(WATERMARK_SCHEMA),
                    quote_ident(WATERMARK_TABLE)
                ),
                &[&kind, &hypertable, &payload.to_string()],
            )
            .await?;
        Ok(())
    }

    pub async fn insert_low_watermark(&self, hypertable: &Hypertable) -> Result<()> {
        self.insert_watermark("low", &hypertable.canonical_name(), &json!({}))
            .await
    }

    pub async fn insert_high_watermark(
        &self,
        hypertable: &Hypertable,
        max_key: &serde_json::Value,
    ) -> Result<()> {
        self.insert_watermark(
            "high",
            &hypertable.canonical_name(),
            &json!({ "max_key": max_key }),
        )
        .await
    }
}

#[async_trait]
impl SideChannelApi for SideChannel {
    fn connection_string(&self) -> &str {
        SideChannel::connection_string(self)
    }

    async fn read_system_information(&self) -> Result<SystemInformation> {
        SideChannel::read_system_information(self).await
    }

    async fn read_wal_level(&self) -> Result<String> {
        SideChannel::read_wal_level(self).await
    }

    async fn read_postgres_version(&self) -> Result<i32> {
        SideChannel::read_postgres_version(self).await
    }

    async fn read_timescaledb_version(&self) -> Result<String> {
        SideChannel::read_timescaledb_version(self).await
    }

    async fn read_hypertables(&self) -> Result<Vec<Hypertable>> {
        SideChannel::read_hypertables(self).await
    }

    async fn read_chunks(&self) -> Result<Vec<Chunk>> {
        SideChannel::read_chunks(self).await
    }

    async fn read_hypertable_schema(&self, table: &TableRef) -> Result<Vec<Column>> {
        SideChannel::read_hypertable_schema(self, table).await
    }

    async fn read_replica_identity(&self, table: &TableRef) -> Result<ReplicaIdentity> {
        SideChannel::read_replica_identity(self, table).await
    }

    async fn read_continuous_aggregate(
        &self,
        materialized_hypertable_id: i32,
    ) -> Result<Option<TableRef>> {
        SideChannel::read_continuous_aggregate(self, materialized_hypertable_id).await
    }

    async fn has_table_privilege(
        &self,
        role: &str,
        table: &TableRef,
        grant: Grant,
    ) -> Result<bool> {
        SideChannel::has_table_privilege(self, role, table, grant).await
    }

    async fn exists_publication(&self, publication: &str) -> Result<bool> {
        SideChannel::exists_publication(self, publication).await
    }

    async fn create_publication(&self, publication: &str) -> Result<bool> {
        SideChannel::create_publication(self, publication).await
    }

    async fn drop_publication(&self, publication: &str) -> Result<()> {
        SideChannel::drop_publication(self, publication).await
    }

    async fn exists_table_in_publication(
        &self,
        publication: &str,
        table: &TableRef,
    ) -> Result<bool> {
        SideChannel::exists_table_in_publication(self, publication, table).await
    }

    async fn attach_tables_to_publication(
        &self,
        publication: &str,
        tables: &[TableRef],
    ) -> Result<()> {
        SideChannel::attach_tables_to_publication(self, publication, tables).await
    }

    async fn detach_tables_from_publication(
        &self,
        publication: &str,
        tables: &[TableRef],
    ) -> Result<()> {
        SideChannel::detach_tables_from_publication(self, publication, tables).await
    }

    async fn read_published_tables(&self, publication: &str) -> Result<Vec<TableRef>> {
        SideChannel::read_published_tables(self, publication).await
    }

    async fn exists_replication_slot(&self, slot: &str) -> Result<bool> {
        SideChannel::exists_replication_slot(self, slot).await
    }

    async fn drop_replication_slot(&self, slot: &str) -> Result<()> {
        SideChannel::drop_replication_slot(self, slot).await
    }

    async fn current_wal_lsn(&self) -> Result<Lsn> {
        SideChannel::current_wal_lsn(self).await
    }

    async fn ensure_watermark_table(&self) -> Result<()> {
        SideChannel::ensure_watermark_table(self).await
    }

    async fn insert_low_watermark(&self, hypertable: &Hypertable) -> Result<()> {
        SideChannel::insert_low_watermark(self, hypertable).await
    }

    async fn insert_high_watermark(
        &self,
        hypertable: &Hypertable,
        max_key: &serde_json::Value,
    ) -> Result<()> {
        SideChannel::insert_high_watermark(self, hypertable, max_key).await
    }
}

#[async_trait]
impl TypeCatalog for SideChannel {
    async fn lookup_type(&self, oid: u32) -> Result<PgType> {
        if let Some(ty) = builtin_type(oid) {
            return Ok(ty);
        }

        let row = self
            .client
            .query_opt(
                "SELECT typname, typtype::text, typelem, typcategory::text \
                 FROM pg_catalog.pg_type WHERE oid = $1",
                &[&oid],
            )
            .await?
            .ok_or_else(|| StreamerError::resolve(format!("unknown type oid {oid}")))?;

        let name: String = row.get(0);
        let typtype: String = row.get(1);
        let element: u32 = row.get(2);
        let category: String = row.get(3);

        let kind = match typtype.as_str() {
            "e" => PgTypeKind::Enum,
            "c" => PgTypeKind::Composite,
            "r" | "m" => PgTypeKind::Range,
            "d" => PgTypeKind::Domain,
            _ if category == "A" || (element != 0 && name.starts_with('_')) => PgTypeKind::Array,
            _ => PgTypeKind::Base,
        };

        Ok(PgType {
            oid,
            name,
            kind,
            element_oid: if kind == PgTypeKind::Array && element != 0 {
                Some(element)
            } else {
                None
            },
            schema_type: match kind {
                PgTypeKind::Array => SchemaType::Array,
                PgTypeKind::Composite => SchemaType::Struct,
                _ => SchemaType::String,
            },
        })
    }
}

/// A consistent snapshot session on its own connection.
///
/// Wraps a repeatable-read transaction, either exporting a new snapshot
/// (`export`) or attaching to a previously exported one (`attach`).
/// Cursors opened in the session are lazy, finite and non-restartable.
pub struct SnapshotSession {
    client: Client,
    snapshot_name: String,
    start_lsn: Lsn,
    cursor_open: bool,
}

impl SnapshotSession {
    /// Open a new repeatable-read transaction and export its snapshot.
    pub async fn export(connection_string: &str) -> Result<Self> {
        let client = Self::dedicated_connection(connection_string).await?;
        client
            .batch_execute("BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .await?;
        let snapshot_name: String = client
            .query_one("SELECT pg_export_snapshot()", &[])
            .await?
            .get(0);
        let lsn_text: String = client
            .query_one("SELECT pg_current_wal_lsn()::text", &[])
            .await?
            .get(0);
        let start_lsn = Lsn::from_str(&lsn_text)?;
        info!("exported snapshot {snapshot_name} at {start_lsn}");

        Ok(Self {
            client,
            snapshot_name,
            start_lsn,
            cursor_open: false,
        })
    }

    /// Attach to an already exported snapshot.
    pub async fn attach(connection_string: &str, snapshot_name: &str, start_lsn: Lsn) -> Result<Self> {
        let client = Self::dedicated_connection(connection_string).await?;
        client
            .batch_execute("BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .await?;
        client
            .execute(
                &format!("SET TRANSACTION SNAPSHOT '{}'", snapshot_name.replace('\'', "''")),
                &[],
            )
            .await?;

        Ok(Self {
            client,
            snapshot_name: snapshot_name.to_string(),
            start_lsn,
            cursor_open: false,
        })
    }

    async fn dedicated_connection(connection_string: &str) -> Result<Client> {
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
            .await
            .map_err(|e| StreamerError::connect(format!("snapshot connect: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("snapshot connection error: {e}");
            }
        });
        Ok(client)
    }

    pub fn snapshot_name(&self) -> &str {
        &self.snapshot_name
    }

    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    /// Highest primary-key tuple of the table visible in this snapshot,
    /// or `None` for an empty table.
    pub async fn read_high_watermark(
        &self,
        table: &TableRef,
        key_columns: &[String],
    ) -> Result<Option<serde_json::Value>> {
        if key_columns.is_empty() {
            return Err(StreamerError::catalog(format!(
                "{table} has no primary key to snapshot by"
            )));
        }
        let selected: Vec<String> = key_columns
            .iter()
            .map(|c| format!("{}::text", quote_ident(c)))
            .collect();
        let order: Vec<String> = key_columns
            .iter()
            .map(|c| format!("{} DESC", quote_ident(c)))
            .collect();
        let row = self
            .client
            .query_opt(
                &format!(
                    "SELECT {} FROM {} ORDER BY {} LIMIT 1",
                    selected.join(", "),
                    quote_table(table),
                    order.join(", ")
                ),
                &[],
            )
            .await?;

        Ok(row.map(|row| {
            let mut key = serde_json::Map::new();
            for (i, column) in key_columns.iter().enumerate() {
                let value: Option<String> = row.get(i);
                key.insert(column.clone(), value.map(Into::into).unwrap_or(serde_json::Value::Null));
            }
            serde_json::Value::Object(key)
        }))
    }

    /// Open a cursor over the table's rows in ascending key order. Every
    /// column is read in text form for the type resolver to decode.
    pub async fn open_cursor(
        &mut self,
        table: &TableRef,
        columns: &[Column],
        order_by: &[String],
    ) -> Result<SnapshotCursor<'_>> {
        if self.cursor_open {
            return Err(StreamerError::catalog(
                "snapshot cursor already open in this session",
            ));
        }

        let selected: Vec<String> = columns
            .iter()
            .map(|c| format!("{}::text", quote_ident(&c.name)))
            .collect();
        let order = if order_by.is_empty() {
            String::new()
        } else {
            let keys: Vec<String> = order_by.iter().map(|c| quote_ident(c)).collect();
            format!(" ORDER BY {}", keys.join(", "))
        };

        self.client
            .batch_execute(&format!(
                "DECLARE tidestream_snapshot NO SCROLL CURSOR FOR \
                 SELECT {} FROM {}{}",
                selected.join(", "),
                quote_table(table),
                order
            ))
            .await?;
        self.cursor_open = true;

        Ok(SnapshotCursor {
            session: self,
            exhausted: false,
        })
    }

    async fn fetch_rows(&self, batch_size: usize) -> Result<Vec<Vec<Option<String>>>> {
        // rows stream off the wire as the server produces them
        let rows: Vec<tokio_postgres::Row> = self
            .client
            .query_raw(
                format!("FETCH FORWARD {batch_size} FROM tidestream_snapshot").as_str(),
                Vec::<String>::new(),
            )
            .await?
            .try_collect()
            .await?;
        Ok(rows
            .iter()
            .map(|row| (0..row.len()).map(|i| row.get::<_, Option<String>>(i)).collect())
            .collect())
    }

    async fn close_cursor(&mut self) -> Result<()> {
        if self.cursor_open {
            self.client
                .batch_execute("CLOSE tidestream_snapshot")
                .await?;
            self.cursor_open = false;
        }
        Ok(())
    }

    /// End the transaction.
    pub async fn commit(mut self) -> Result<()> {
        self.close_cursor().await?;
        self.client.batch_execute("COMMIT").await?;
        Ok(())
    }
}

/// Lazy, finite, non-restartable sequence of snapshot row batches.
pub struct SnapshotCursor<'a> {
    session: &'a mut SnapshotSession,
    exhausted: bool,
}

impl SnapshotCursor<'_> {
    /// Fetch the next batch. `Ok(None)` once the cursor is exhausted;
    /// the cursor closes itself at that point.
    pub async fn next_batch(
        &mut self,
        batch_size: usize,
    ) -> Result<Option<Vec<(Lsn, Vec<Option<String>>)>>> {
        if self.exhausted {
            return Ok(None);
        }

        let rows = self.session.fetch_rows(batch_size.max(1)).await?;
        if rows.is_empty() {
            self.exhausted = true;
            self.session.close_cursor().await?;
            return Ok(None);
        }

        let lsn = self.session.start_lsn;
        Ok(Some(rows.into_iter().map(|row| (lsn, row)).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("metrics"), "\"metrics\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(
            quote_table(&TableRef::new("public", "metrics")),
            "\"public\".\"metrics\""
        );
    }

    #[test]
    fn test_grant_spelling() {
        assert_eq!(Grant::Select.as_str(), "SELECT");
        assert_eq!(Grant::Delete.as_str(), "DELETE");
    }
}
