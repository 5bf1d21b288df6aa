//! In-memory mirror of the TimescaleDB catalog
//!
//! Tracks hypertables, their chunks and schemas, reacting to DDL and
//! chunk lifecycle events decoded from the replication stream. The
//! resolver consults the mirror to map physical chunk relations back to
//! their logical hypertables.

use crate::error::{Result, StreamerError};
use crate::pgtypes::ReplicaIdentity;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;

/// Schema holding the TimescaleDB catalog relations.
pub const TIMESCALEDB_CATALOG_SCHEMA: &str = "_timescaledb_catalog";
/// Schema holding physical chunk relations.
pub const TIMESCALEDB_INTERNAL_SCHEMA: &str = "_timescaledb_internal";
/// Schema and table of the snapshot watermark markers.
pub const WATERMARK_SCHEMA: &str = "tidestream";
pub const WATERMARK_TABLE: &str = "watermarks";

/// A `(schema, name)` pair naming a relation, used for publication
/// membership and lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    pub fn canonical(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// An ordered hypertable column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub oid: u32,
    pub type_name: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub default_expr: Option<String>,
}

/// A hypertable and its schema.
#[derive(Debug, Clone)]
pub struct Hypertable {
    pub id: i32,
    pub schema: String,
    pub name: String,
    pub partitioning_columns: Vec<String>,
    /// 0 = off, 1 = enabled, 2 = this is a compressed hypertable
    pub compression_state: i16,
    pub compressed_hypertable_id: Option<i32>,
    /// For a continuous aggregate's materialized hypertable: the
    /// user-facing view it backs
    pub continuous_aggregate: Option<TableRef>,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<Column>,
}

impl Hypertable {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.schema.clone(), self.name.clone())
    }

    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Name the events should surface under: the aggregate view for a
    /// continuous aggregate, the table itself otherwise.
    pub fn surface_ref(&self) -> TableRef {
        self.continuous_aggregate
            .clone()
            .unwrap_or_else(|| self.table_ref())
    }

    pub fn is_compressed_hypertable(&self) -> bool {
        self.compression_state == 2
    }

    pub fn is_compression_enabled(&self) -> bool {
        self.compression_state == 1
    }

    pub fn is_continuous_aggregate(&self) -> bool {
        self.continuous_aggregate.is_some()
    }

    pub fn key_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.clone())
            .collect()
    }
}

/// A physical chunk of a hypertable.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: i32,
    pub hypertable_id: i32,
    pub schema: String,
    pub name: String,
    /// Dropped chunks linger briefly to drain in-flight events
    pub dropped: bool,
    pub compressed_chunk_id: Option<i32>,
}

impl Chunk {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.schema.clone(), self.name.clone())
    }
}

/// Hypertable include/exclude filtering.
///
/// Patterns are globs over `schema.table`; a pattern without a dot
/// matches the table name alone. Explicit includes take precedence over
/// excludes; with no includes configured everything not excluded is in.
pub struct HypertableFilter {
    includes: Vec<(Regex, Regex)>,
    excludes: Vec<(Regex, Regex)>,
}

impl HypertableFilter {
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self> {
        Ok(Self {
            includes: Self::compile(includes)?,
            excludes: Self::compile(excludes)?,
        })
    }

    fn compile(patterns: &[String]) -> Result<Vec<(Regex, Regex)>> {
        patterns
            .iter()
            .map(|pattern| {
                let (schema_glob, table_glob) = match pattern.split_once('.') {
                    Some((schema, table)) => (schema, table),
                    None => ("*", pattern.as_str()),
                };
                Ok((glob_to_regex(schema_glob)?, glob_to_regex(table_glob)?))
            })
            .collect()
    }

    pub fn is_included(&self, schema: &str, table: &str) -> bool {
        let matches = |patterns: &[(Regex, Regex)]| {
            patterns
                .iter()
                .any(|(s, t)| s.is_match(schema) && t.is_match(table))
        };

        if matches(&self.includes) {
            return true;
        }
        if matches(&self.excludes) {
            return false;
        }
        self.includes.is_empty()
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern);
    let regex_pattern = escaped.replace(r"\*", ".*").replace(r"\?", ".");
    Regex::new(&format!("^{regex_pattern}$"))
        .map_err(|e| StreamerError::config(format!("bad hypertable pattern {pattern:?}: {e}")))
}

/// How a relation resolves against the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedRelation {
    /// A chunk of a mirrored hypertable
    Chunk { chunk_id: i32, hypertable_id: i32 },
    /// A hypertable's own relation (rare; chunks carry the row traffic)
    Hypertable { hypertable_id: i32 },
    /// `_timescaledb_catalog.hypertable`
    CatalogHypertable,
    /// `_timescaledb_catalog.chunk`
    CatalogChunk,
    /// The snapshot watermark table
    Watermark,
    /// Not ours
    Unknown,
}

#[derive(Default)]
struct MirrorState {
    hypertables: HashMap<i32, Hypertable>,
    chunks: HashMap<i32, Chunk>,
    hypertable_names: HashMap<(String, String), i32>,
    chunk_names: HashMap<(String, String), i32>,
}

/// The mirror itself. Interior-locked so the resolver, snapshotter and
/// catalog handlers can share one instance.
pub struct SystemCatalog {
    state: RwLock<MirrorState>,
    filter: HypertableFilter,
}

impl SystemCatalog {
    pub fn new(filter: HypertableFilter) -> Self {
        Self {
            state: RwLock::new(MirrorState::default()),
            filter,
        }
    }

    pub fn filter(&self) -> &HypertableFilter {
        &self.filter
    }

    /// Whether a hypertable passes the include filter. Compressed
    /// hypertables are internal and never included directly.
    pub fn is_included(&self, hypertable: &Hypertable) -> bool {
        if hypertable.is_compressed_hypertable() {
            return false;
        }
        let surface = hypertable.surface_ref();
        self.filter.is_included(&surface.schema, &surface.name)
    }

    /// Register a hypertable. Returns true when it is newly included,
    /// which is the trigger for publication attachment and snapshot
    /// scheduling.
    pub fn register_hypertable(&self, hypertable: Hypertable) -> bool {
        let included = self.is_included(&hypertable);
        let mut state = self.state.write();
        state.hypertable_names.insert(
            (hypertable.schema.clone(), hypertable.name.clone()),
            hypertable.id,
        );
        let was_known = state
            .hypertables
            .insert(hypertable.id, hypertable)
            .is_some();
        included && !was_known
    }

    /// Drop a hypertable and all of its chunks.
    pub fn drop_hypertable(&self, hypertable_id: i32) -> Option<Hypertable> {
        let mut state = self.state.write();
        let hypertable = state.hypertables.remove(&hypertable_id)?;
        state
            .hypertable_names
            .remove(&(hypertable.schema.clone(), hypertable.name.clone()));

        let orphaned: Vec<i32> = state
            .chunks
            .values()
            .filter(|c| c.hypertable_id == hypertable_id)
            .map(|c| c.id)
            .collect();
        for chunk_id in orphaned {
            if let Some(chunk) = state.chunks.remove(&chunk_id) {
                state.chunk_names.remove(&(chunk.schema, chunk.name));
            }
        }
        Some(hypertable)
    }

    /// Replace a hypertable's column set after a schema change.
    pub fn update_hypertable_schema(&self, hypertable_id: i32, columns: Vec<Column>) -> Result<()> {
        let mut state = self.state.write();
        let hypertable = state
            .hypertables
            .get_mut(&hypertable_id)
            .ok_or_else(|| StreamerError::catalog(format!("no hypertable {hypertable_id}")))?;
        hypertable.columns = columns;
        Ok(())
    }

    /// Flip the compression state. Returns the previous state.
    pub fn set_compression_state(&self, hypertable_id: i32, compression_state: i16) -> Result<i16> {
        let mut state = self.state.write();
        let hypertable = state
            .hypertables
            .get_mut(&hypertable_id)
            .ok_or_else(|| StreamerError::catalog(format!("no hypertable {hypertable_id}")))?;
        let previous = hypertable.compression_state;
        hypertable.compression_state = compression_state;
        Ok(previous)
    }

    /// Register a chunk. Every chunk must reference a live hypertable.
    pub fn register_chunk(&self, chunk: Chunk) -> Result<()> {
        let mut state = self.state.write();
        if !state.hypertables.contains_key(&chunk.hypertable_id) {
            return Err(StreamerError::catalog(format!(
                "chunk {} references unknown hypertable {}",
                chunk.id, chunk.hypertable_id
            )));
        }
        state
            .chunk_names
            .insert((chunk.schema.clone(), chunk.name.clone()), chunk.id);
        state.chunks.insert(chunk.id, chunk);
        Ok(())
    }

    /// Mark a chunk dropped. In-flight events on the relation still
    /// resolve until [`SystemCatalog::remove_chunk`].
    pub fn mark_chunk_dropped(&self, chunk_id: i32) -> Option<i32> {
        let mut state = self.state.write();
        let chunk = state.chunks.get_mut(&chunk_id)?;
        chunk.dropped = true;
        Some(chunk.hypertable_id)
    }

    pub fn remove_chunk(&self, chunk_id: i32) -> Option<Chunk> {
        let mut state = self.state.write();
        let chunk = state.chunks.remove(&chunk_id)?;
        state
            .chunk_names
            .remove(&(chunk.schema.clone(), chunk.name.clone()));
        Some(chunk)
    }

    pub fn hypertable(&self, hypertable_id: i32) -> Option<Hypertable> {
        self.state.read().hypertables.get(&hypertable_id).cloned()
    }

    pub fn hypertable_by_name(&self, schema: &str, name: &str) -> Option<Hypertable> {
        let state = self.state.read();
        let id = state
            .hypertable_names
            .get(&(schema.to_string(), name.to_string()))?;
        state.hypertables.get(id).cloned()
    }

    pub fn chunk(&self, chunk_id: i32) -> Option<Chunk> {
        self.state.read().chunks.get(&chunk_id).cloned()
    }

    pub fn chunks_of(&self, hypertable_id: i32) -> Vec<Chunk> {
        let state = self.state.read();
        let mut chunks: Vec<Chunk> = state
            .chunks
            .values()
            .filter(|c| c.hypertable_id == hypertable_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.id);
        chunks
    }

    pub fn chunk_by_name(&self, schema: &str, name: &str) -> Option<Chunk> {
        let state = self.state.read();
        let id = state
            .chunk_names
            .get(&(schema.to_string(), name.to_string()))?;
        state.chunks.get(id).cloned()
    }

    /// Map a relation seen on the stream to its role.
    pub fn resolve_relation(&self, schema: &str, name: &str) -> ResolvedRelation {
        if schema == TIMESCALEDB_CATALOG_SCHEMA {
            return match name {
                "hypertable" => ResolvedRelation::CatalogHypertable,
                "chunk" => ResolvedRelation::CatalogChunk,
                _ => ResolvedRelation::Unknown,
            };
        }
        if schema == WATERMARK_SCHEMA && name == WATERMARK_TABLE {
            return ResolvedRelation::Watermark;
        }

        if let Some(chunk) = self.chunk_by_name(schema, name) {
            return ResolvedRelation::Chunk {
                chunk_id: chunk.id,
                hypertable_id: chunk.hypertable_id,
            };
        }
        if let Some(hypertable) = self.hypertable_by_name(schema, name) {
            return ResolvedRelation::Hypertable {
                hypertable_id: hypertable.id,
            };
        }
        ResolvedRelation::Unknown
    }

    /// Included hypertables in deterministic `(schema, name)` order, as
    /// the snapshotter requires.
    pub fn included_hypertables(&self) -> Vec<Hypertable> {
        let state = self.state.read();
        let mut hypertables: Vec<Hypertable> = state
            .hypertables
            .values()
            .filter(|ht| {
                if ht.is_compressed_hypertable() {
                    return false;
                }
                let surface = ht.surface_ref();
                self.filter.is_included(&surface.schema, &surface.name)
            })
            .cloned()
            .collect();
        hypertables.sort_by(|a, b| {
            (a.schema.as_str(), a.name.as_str()).cmp(&(b.schema.as_str(), b.name.as_str()))
        });
        hypertables
    }

    pub fn hypertable_count(&self) -> usize {
        self.state.read().hypertables.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.state.read().chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hypertable(id: i32, schema: &str, name: &str) -> Hypertable {
        Hypertable {
            id,
            schema: schema.to_string(),
            name: name.to_string(),
            partitioning_columns: vec!["ts".to_string()],
            compression_state: 0,
            compressed_hypertable_id: None,
            continuous_aggregate: None,
            replica_identity: ReplicaIdentity::Default,
            columns: vec![
                Column {
                    name: "ts".to_string(),
                    oid: crate::typeres::TIMESTAMPTZ_OID,
                    type_name: "timestamptz".to_string(),
                    nullable: false,
                    is_primary_key: true,
                    default_expr: None,
                },
                Column {
                    name: "val".to_string(),
                    oid: crate::typeres::FLOAT8_OID,
                    type_name: "float8".to_string(),
                    nullable: true,
                    is_primary_key: false,
                    default_expr: None,
                },
            ],
        }
    }

    fn chunk(id: i32, hypertable_id: i32) -> Chunk {
        Chunk {
            id,
            hypertable_id,
            schema: TIMESCALEDB_INTERNAL_SCHEMA.to_string(),
            name: format!("_hyper_{hypertable_id}_{id}_chunk"),
            dropped: false,
            compressed_chunk_id: None,
        }
    }

    fn include_all() -> HypertableFilter {
        HypertableFilter::new(&[], &[]).unwrap()
    }

    #[test]
    fn test_filter_includes_beat_excludes() {
        let filter = HypertableFilter::new(
            &["public.metrics".to_string()],
            &["public.*".to_string()],
        )
        .unwrap();
        assert!(filter.is_included("public", "metrics"));
        assert!(!filter.is_included("public", "other"));
    }

    #[test]
    fn test_filter_schema_and_table_globs() {
        let filter =
            HypertableFilter::new(&["*.conditions".to_string()], &[]).unwrap();
        assert!(filter.is_included("public", "conditions"));
        assert!(filter.is_included("weather", "conditions"));
        assert!(!filter.is_included("public", "metrics"));

        // bare table pattern matches any schema
        let filter = HypertableFilter::new(&["metrics".to_string()], &[]).unwrap();
        assert!(filter.is_included("public", "metrics"));
        assert!(filter.is_included("other", "metrics"));
    }

    #[test]
    fn test_filter_default_is_include_all() {
        let filter = include_all();
        assert!(filter.is_included("public", "anything"));

        let filter = HypertableFilter::new(&[], &["public.dev_*".to_string()]).unwrap();
        assert!(filter.is_included("public", "metrics"));
        assert!(!filter.is_included("public", "dev_scratch"));
    }

    #[test]
    fn test_filter_with_includes_is_closed() {
        let filter = HypertableFilter::new(&["public.a".to_string()], &[]).unwrap();
        assert!(filter.is_included("public", "a"));
        assert!(!filter.is_included("public", "b"));
    }

    #[test]
    fn test_register_resolve_chunk() {
        let catalog = SystemCatalog::new(include_all());
        assert!(catalog.register_hypertable(hypertable(1, "public", "metrics")));
        catalog.register_chunk(chunk(11, 1)).unwrap();

        let resolved =
            catalog.resolve_relation(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_11_chunk");
        assert_eq!(
            resolved,
            ResolvedRelation::Chunk {
                chunk_id: 11,
                hypertable_id: 1
            }
        );
        assert_eq!(
            catalog.resolve_relation("public", "metrics"),
            ResolvedRelation::Hypertable { hypertable_id: 1 }
        );
        assert_eq!(
            catalog.resolve_relation("public", "unrelated"),
            ResolvedRelation::Unknown
        );
    }

    #[test]
    fn test_chunk_requires_live_hypertable() {
        let catalog = SystemCatalog::new(include_all());
        assert!(catalog.register_chunk(chunk(5, 99)).is_err());
    }

    #[test]
    fn test_drop_hypertable_removes_chunks() {
        let catalog = SystemCatalog::new(include_all());
        catalog.register_hypertable(hypertable(1, "public", "metrics"));
        catalog.register_chunk(chunk(11, 1)).unwrap();
        catalog.register_chunk(chunk(12, 1)).unwrap();

        catalog.drop_hypertable(1).unwrap();
        assert_eq!(catalog.hypertable_count(), 0);
        assert_eq!(catalog.chunk_count(), 0);
        assert_eq!(
            catalog.resolve_relation(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_11_chunk"),
            ResolvedRelation::Unknown
        );
    }

    #[test]
    fn test_chunk_drop_lingers_until_removed() {
        let catalog = SystemCatalog::new(include_all());
        catalog.register_hypertable(hypertable(1, "public", "metrics"));
        catalog.register_chunk(chunk(11, 1)).unwrap();

        assert_eq!(catalog.mark_chunk_dropped(11), Some(1));
        // still resolvable while draining
        assert!(matches!(
            catalog.resolve_relation(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_11_chunk"),
            ResolvedRelation::Chunk { .. }
        ));
        assert!(catalog.chunk(11).unwrap().dropped);

        catalog.remove_chunk(11).unwrap();
        assert_eq!(
            catalog.resolve_relation(TIMESCALEDB_INTERNAL_SCHEMA, "_hyper_1_11_chunk"),
            ResolvedRelation::Unknown
        );
    }

    #[test]
    fn test_registration_reports_newly_included_once() {
        let catalog = SystemCatalog::new(include_all());
        assert!(catalog.register_hypertable(hypertable(1, "public", "metrics")));
        // re-registration (e.g. schema refresh) is not a new inclusion
        assert!(!catalog.register_hypertable(hypertable(1, "public", "metrics")));
    }

    #[test]
    fn test_compressed_hypertable_never_included() {
        let catalog = SystemCatalog::new(include_all());
        let mut compressed = hypertable(2, TIMESCALEDB_INTERNAL_SCHEMA, "_compressed_hypertable_2");
        compressed.compression_state = 2;
        assert!(!catalog.register_hypertable(compressed));
    }

    #[test]
    fn test_continuous_aggregate_filtered_by_view_name() {
        let filter = HypertableFilter::new(&["public.daily_*".to_string()], &[]).unwrap();
        let catalog = SystemCatalog::new(filter);

        let mut materialized =
            hypertable(3, TIMESCALEDB_INTERNAL_SCHEMA, "_materialized_hypertable_3");
        materialized.continuous_aggregate = Some(TableRef::new("public", "daily_avg"));
        assert!(catalog.register_hypertable(materialized));

        let mut other = hypertable(4, TIMESCALEDB_INTERNAL_SCHEMA, "_materialized_hypertable_4");
        other.continuous_aggregate = Some(TableRef::new("public", "hourly_avg"));
        assert!(!catalog.register_hypertable(other));
    }

    #[test]
    fn test_included_hypertables_deterministic_order() {
        let catalog = SystemCatalog::new(include_all());
        catalog.register_hypertable(hypertable(1, "public", "zeta"));
        catalog.register_hypertable(hypertable(2, "app", "metrics"));
        catalog.register_hypertable(hypertable(3, "public", "alpha"));

        let names: Vec<String> = catalog
            .included_hypertables()
            .iter()
            .map(|ht| ht.canonical_name())
            .collect();
        assert_eq!(names, vec!["app.metrics", "public.alpha", "public.zeta"]);
    }

    #[test]
    fn test_catalog_relations_resolve() {
        let catalog = SystemCatalog::new(include_all());
        assert_eq!(
            catalog.resolve_relation(TIMESCALEDB_CATALOG_SCHEMA, "hypertable"),
            ResolvedRelation::CatalogHypertable
        );
        assert_eq!(
            catalog.resolve_relation(TIMESCALEDB_CATALOG_SCHEMA, "chunk"),
            ResolvedRelation::CatalogChunk
        );
        assert_eq!(
            catalog.resolve_relation(WATERMARK_SCHEMA, WATERMARK_TABLE),
            ResolvedRelation::Watermark
        );
    }

    #[test]
    fn test_update_schema_and_compression() {
        let catalog = SystemCatalog::new(include_all());
        catalog.register_hypertable(hypertable(1, "public", "metrics"));

        let mut columns = hypertable(1, "public", "metrics").columns;
        columns.push(Column {
            name: "tag".to_string(),
            oid: crate::typeres::TEXT_OID,
            type_name: "text".to_string(),
            nullable: true,
            is_primary_key: false,
            default_expr: None,
        });
        catalog.update_hypertable_schema(1, columns).unwrap();
        assert_eq!(catalog.hypertable(1).unwrap().columns.len(), 3);

        let previous = catalog.set_compression_state(1, 1).unwrap();
        assert_eq!(previous, 0);
        assert!(catalog.hypertable(1).unwrap().is_compression_enabled());

        assert!(catalog.update_hypertable_schema(99, Vec::new()).is_err());
    }
}
