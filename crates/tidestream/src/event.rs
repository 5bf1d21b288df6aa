//! Change event representation
//!
//! The resolved, schema-agnostic form of a row change as it travels from
//! the resolver through the dispatcher to the emitter. Envelope assembly
//! (schema + payload) happens later, in the emitter.

use crate::pgtypes::Lsn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Operation carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    /// Snapshot read
    Read,
    /// Insert
    Create,
    /// Update
    Update,
    /// Delete
    Delete,
    /// Truncate
    Truncate,
    /// Decoded logical message
    Message,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Create => "c",
            Self::Update => "u",
            Self::Delete => "d",
            Self::Truncate => "t",
            Self::Message => "m",
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance block attached to every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Database system identifier
    pub system: String,
    /// Database name
    pub database: String,
    /// Schema of the logical (hypertable) relation
    pub schema: String,
    /// Name of the logical relation
    pub table: String,
    /// Commit-time server clock, Unix millis
    pub ts_ms: i64,
    /// WAL position of the change
    pub lsn: Lsn,
    /// Transaction id, when streamed (snapshots have none)
    pub tx_id: Option<u32>,
    /// Replication slot the change was read from
    pub slot: String,
    /// True for snapshot reads
    pub snapshot: bool,
}

/// Transaction block for transaction-aware consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    /// Transaction id
    pub id: u32,
    /// Position of this event within the transaction (0-indexed)
    pub sequence: u64,
}

/// A resolved row change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Schema of the physical relation the change arrived on
    pub relation_schema: String,
    /// Name of the physical relation
    pub relation_table: String,
    pub op: Op,
    /// Previous row state (updates with full identity, deletes)
    pub before: Option<Map<String, Value>>,
    /// Current row state (inserts, updates, snapshot reads)
    pub after: Option<Map<String, Value>>,
    pub source: SourceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionInfo>,
}

impl ChangeEvent {
    /// Key column values, used to build the key envelope and for the
    /// snapshot watermark window.
    pub fn key_values(&self, key_columns: &[String]) -> Map<String, Value> {
        let row = self.after.as_ref().or(self.before.as_ref());
        let mut key = Map::new();
        if let Some(row) = row {
            for column in key_columns {
                if let Some(value) = row.get(column) {
                    key.insert(column.clone(), value.clone());
                }
            }
        }
        key
    }

    pub fn is_dml(&self) -> bool {
        matches!(self.op, Op::Create | Op::Update | Op::Delete)
    }
}

/// A decoded pg_logical_emit_message payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub prefix: String,
    /// Message content, hex-encoded when not valid UTF-8
    pub content: String,
    pub lsn: Lsn,
    pub transactional: bool,
    pub ts_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> SourceInfo {
        SourceInfo {
            system: "7198000000000000000".into(),
            database: "tsdb".into(),
            schema: "public".into(),
            table: "metrics".into(),
            ts_ms: 1_700_000_000_000,
            lsn: Lsn(0x1000),
            tx_id: Some(731),
            slot: "tidestream_a".into(),
            snapshot: false,
        }
    }

    #[test]
    fn test_op_tags() {
        assert_eq!(Op::Read.as_str(), "r");
        assert_eq!(Op::Create.as_str(), "c");
        assert_eq!(Op::Update.as_str(), "u");
        assert_eq!(Op::Delete.as_str(), "d");
        assert_eq!(Op::Truncate.as_str(), "t");
        assert_eq!(Op::Message.as_str(), "m");
    }

    #[test]
    fn test_key_values_prefers_after() {
        let mut after = Map::new();
        after.insert("id".to_string(), json!(7));
        after.insert("val".to_string(), json!(1.5));

        let event = ChangeEvent {
            relation_schema: "_timescaledb_internal".into(),
            relation_table: "_hyper_1_1_chunk".into(),
            op: Op::Create,
            before: None,
            after: Some(after),
            source: source(),
            transaction: None,
        };

        let key = event.key_values(&["id".to_string()]);
        assert_eq!(key.get("id"), Some(&json!(7)));
        assert_eq!(key.len(), 1);
        assert!(event.is_dml());
    }

    #[test]
    fn test_key_values_falls_back_to_before() {
        let mut before = Map::new();
        before.insert("id".to_string(), json!(3));

        let event = ChangeEvent {
            relation_schema: "public".into(),
            relation_table: "metrics".into(),
            op: Op::Delete,
            before: Some(before),
            after: None,
            source: source(),
            transaction: None,
        };

        assert_eq!(event.key_values(&["id".to_string()]).get("id"), Some(&json!(3)));
    }

    #[test]
    fn test_transaction_block_omitted_when_none() {
        let event = ChangeEvent {
            relation_schema: "public".into(),
            relation_table: "metrics".into(),
            op: Op::Truncate,
            before: None,
            after: None,
            source: source(),
            transaction: None,
        };

        let encoded = serde_json::to_string(&event).unwrap();
        assert!(!encoded.contains("transaction"));

        let event = ChangeEvent {
            transaction: Some(TransactionInfo { id: 42, sequence: 3 }),
            ..event
        };
        let encoded = serde_json::to_string(&event).unwrap();
        assert!(encoded.contains("\"sequence\":3"));
    }
}
