//! Configuration for the streamer
//!
//! A hierarchical YAML document with serde defaults for every key, so a
//! minimal file only needs the connection string. Every recognised key
//! can be overridden from the environment: the canonical dotted key is
//! upper-cased, `_` becomes `__`, then `.` becomes `_`
//! (`postgresql.snapshot.batchsize` -> `POSTGRESQL_SNAPSHOT_BATCHSIZE`).

use crate::error::{Result, StreamerError};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub postgresql: PostgresqlConfig,
    pub topic: TopicConfig,
    pub sink: SinkConfig,
    pub statestorage: StateStorageConfig,
    pub timescaledb: TimescaleDbConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PostgresqlConfig {
    /// Connection string (URL or key=value form). Required.
    pub connection: String,
    /// Password, if not carried in the connection string
    pub password: Option<String>,
    pub publication: PublicationConfig,
    pub replicationslot: ReplicationSlotConfig,
    pub snapshot: SnapshotConfig,
    pub transaction: TransactionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PublicationConfig {
    pub name: String,
    pub create: bool,
    pub autodrop: bool,
}

impl Default for PublicationConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            create: true,
            autodrop: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplicationSlotConfig {
    /// Slot name; a random one is generated when empty
    pub name: String,
    pub create: bool,
    pub autodrop: bool,
}

impl Default for ReplicationSlotConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            create: true,
            autodrop: true,
        }
    }
}

/// Initial snapshot behaviour on startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InitialSnapshotMode {
    /// Never snapshot, stream only
    #[default]
    Never,
    /// Snapshot once, when the replication slot is freshly created
    Initial,
    /// Snapshot on every start
    Always,
    /// Snapshot, then exit without streaming
    InitialOnly,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub initial: InitialSnapshotMode,
    pub batchsize: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            initial: InitialSnapshotMode::Never,
            batchsize: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub window: TransactionWindowConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransactionWindowConfig {
    pub enabled: bool,
    /// Window timeout in seconds before a buffered transaction is flushed
    pub timeout: u64,
    /// Maximum buffered rows per transaction before a forced flush
    pub maxsize: usize,
}

impl Default for TransactionWindowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: 60,
            maxsize: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TopicConfig {
    pub prefix: String,
    pub namingstrategy: NamingStrategyConfig,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            prefix: "timescaledb".to_string(),
            namingstrategy: NamingStrategyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NamingStrategyConfig {
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for NamingStrategyConfig {
    fn default() -> Self {
        Self {
            kind: "debezium".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SinkConfig {
    #[serde(rename = "type")]
    pub kind: String,
    /// Sink-specific configuration subtree, passed to the sink factory
    pub options: serde_yaml::Value,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: "stdout".to_string(),
            options: serde_yaml::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StateStorageConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub file: FileStateStorageConfig,
}

impl Default for StateStorageConfig {
    fn default() -> Self {
        Self {
            kind: "none".to_string(),
            file: FileStateStorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FileStateStorageConfig {
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TimescaleDbConfig {
    pub hypertables: HypertablesConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HypertablesConfig {
    /// Glob patterns of hypertables to include (`schema.table`).
    /// Explicit includes take precedence over excludes.
    pub includes: Vec<String>,
    /// Glob patterns of hypertables to exclude
    pub excludes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    pub read: bool,
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
    pub truncate: bool,
    pub message: bool,
    pub compression: bool,
    pub decompression: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            read: true,
            insert: true,
            update: true,
            delete: true,
            truncate: true,
            message: true,
            compression: false,
            decompression: false,
        }
    }
}

impl Config {
    /// Parse a configuration document, overlaying it on the defaults and
    /// applying environment overrides for every recognised key.
    pub fn from_yaml(document: &str) -> Result<Config> {
        let defaults = serde_yaml::to_value(Config::default())
            .map_err(|e| StreamerError::config(e.to_string()))?;

        let overlay: serde_yaml::Value = if document.trim().is_empty() {
            serde_yaml::Value::Null
        } else {
            serde_yaml::from_str(document).map_err(|e| StreamerError::config(e.to_string()))?
        };

        let mut merged = merge(defaults, overlay);
        apply_env_overrides(&mut merged, "");

        serde_yaml::from_value(merged).map_err(|e| StreamerError::config(e.to_string()))
    }

    /// Validate the parts without workable defaults.
    pub fn validate(&self) -> Result<()> {
        if self.postgresql.connection.is_empty() {
            return Err(StreamerError::config(
                "postgresql.connection is required",
            ));
        }
        if self.statestorage.kind == "file" && self.statestorage.file.path.is_empty() {
            return Err(StreamerError::config(
                "statestorage.file.path is required for the file state storage",
            ));
        }
        Ok(())
    }

    /// Effective replication slot name, generating a random one when the
    /// configuration leaves it empty.
    pub fn effective_slot_name(&self) -> String {
        if self.postgresql.replicationslot.name.is_empty() {
            random_slot_name()
        } else {
            self.postgresql.replicationslot.name.clone()
        }
    }

    /// Effective publication name, derived from the slot name when empty.
    pub fn effective_publication_name(&self, slot_name: &str) -> String {
        if self.postgresql.publication.name.is_empty() {
            format!("{slot_name}_pub")
        } else {
            self.postgresql.publication.name.clone()
        }
    }
}

/// Generate a valid, unique-enough replication slot name.
pub fn random_slot_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..12)
        .map(|_| {
            let c = rng.gen_range(0..36u8);
            if c < 10 {
                (b'0' + c) as char
            } else {
                (b'a' + c - 10) as char
            }
        })
        .collect();
    format!("tidestream_{suffix}")
}

/// Overlay `other` on `base`, recursing through mappings.
fn merge(base: serde_yaml::Value, other: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value;
    match (base, other) {
        (Value::Mapping(mut base), Value::Mapping(other)) => {
            for (key, value) in other {
                let merged = match base.remove(&key) {
                    Some(existing) => merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Mapping(base)
        }
        (base, Value::Null) => base,
        (_, other) => other,
    }
}

/// Walk the (defaults-complete) tree and replace any leaf whose
/// environment variable is set.
fn apply_env_overrides(value: &mut serde_yaml::Value, path: &str) {
    match value {
        serde_yaml::Value::Mapping(map) => {
            for (key, child) in map.iter_mut() {
                if let Some(key) = key.as_str() {
                    let child_path = if path.is_empty() {
                        key.to_string()
                    } else {
                        format!("{path}.{key}")
                    };
                    apply_env_overrides(child, &child_path);
                }
            }
        }
        leaf => {
            if let Ok(raw) = std::env::var(env_var_name(path)) {
                *leaf = parse_scalar(&raw);
            }
        }
    }
}

/// Environment variable name for a canonical dotted key.
fn env_var_name(canonical: &str) -> String {
    canonical.to_uppercase().replace('_', "__").replace('.', "_")
}

fn parse_scalar(raw: &str) -> serde_yaml::Value {
    if let Ok(b) = raw.parse::<bool>() {
        return serde_yaml::Value::Bool(b);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return serde_yaml::Value::Number(n.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        return serde_yaml::Value::Number(serde_yaml::Number::from(f));
    }
    serde_yaml::Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml("").unwrap();
        assert_eq!(config.postgresql.snapshot.batchsize, 1000);
        assert_eq!(config.postgresql.snapshot.initial, InitialSnapshotMode::Never);
        assert!(config.postgresql.publication.create);
        assert_eq!(config.sink.kind, "stdout");
        assert_eq!(config.statestorage.kind, "none");
        assert_eq!(config.topic.prefix, "timescaledb");
        assert!(config.timescaledb.events.insert);
        assert!(!config.timescaledb.events.compression);
    }

    #[test]
    fn test_partial_document_overlays_defaults() {
        let config = Config::from_yaml(
            r#"
postgresql:
  connection: "postgres://repl@localhost:5432/tsdb"
  snapshot:
    initial: always
    batchsize: 250
timescaledb:
  hypertables:
    includes: ["public.*"]
    excludes: ["public.dev_*"]
"#,
        )
        .unwrap();

        assert_eq!(config.postgresql.snapshot.initial, InitialSnapshotMode::Always);
        assert_eq!(config.postgresql.snapshot.batchsize, 250);
        // untouched defaults survive the overlay
        assert!(config.postgresql.replicationslot.create);
        assert_eq!(config.timescaledb.hypertables.includes, vec!["public.*"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_initial_only_mode_spelling() {
        let config = Config::from_yaml(
            "postgresql:\n  snapshot:\n    initial: initialOnly\n",
        )
        .unwrap();
        assert_eq!(
            config.postgresql.snapshot.initial,
            InitialSnapshotMode::InitialOnly
        );
    }

    #[test]
    fn test_validate_requires_connection() {
        let config = Config::from_yaml("").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_file_path() {
        let config = Config::from_yaml("statestorage:\n  type: file\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_var_name_scheme() {
        assert_eq!(
            env_var_name("postgresql.snapshot.batchsize"),
            "POSTGRESQL_SNAPSHOT_BATCHSIZE"
        );
        // underscores double before dots become separators
        assert_eq!(
            env_var_name("timescaledb.events.read"),
            "TIMESCALEDB_EVENTS_READ"
        );
        assert_eq!(
            env_var_name("statestorage.file.path"),
            "STATESTORAGE_FILE_PATH"
        );
    }

    #[test]
    fn test_env_override() {
        // a key no other test asserts on, since tests share the process
        // environment
        std::env::set_var("TIMESCALEDB_EVENTS_DECOMPRESSION", "true");
        let config = Config::from_yaml("").unwrap();
        std::env::remove_var("TIMESCALEDB_EVENTS_DECOMPRESSION");
        assert!(config.timescaledb.events.decompression);
    }

    #[test]
    fn test_effective_names() {
        let config = Config::from_yaml("").unwrap();
        let slot = config.effective_slot_name();
        assert!(slot.starts_with("tidestream_"));
        assert_eq!(config.effective_publication_name(&slot), format!("{slot}_pub"));

        let config =
            Config::from_yaml("postgresql:\n  replicationslot:\n    name: fixed\n").unwrap();
        assert_eq!(config.effective_slot_name(), "fixed");
    }

    #[test]
    fn test_random_slot_names_differ() {
        assert_ne!(random_slot_name(), random_slot_name());
    }
}
