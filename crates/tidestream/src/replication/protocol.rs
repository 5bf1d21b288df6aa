//! pgoutput protocol messages
//!
//! Message bodies for logical replication protocol version 2, including
//! the streamed-transaction variants and decoded logical messages.

use crate::pgtypes::Lsn;
use bytes::Bytes;

/// A decoded pgoutput message.
#[derive(Debug, Clone)]
pub enum PgOutputMessage {
    Begin(BeginBody),
    Commit(CommitBody),
    Origin(OriginBody),
    Relation(RelationBody),
    Type(TypeBody),
    Insert(InsertBody),
    Update(UpdateBody),
    Delete(DeleteBody),
    Truncate(TruncateBody),
    /// pg_logical_emit_message payload
    Message(MessageBody),
    StreamStart(StreamStartBody),
    StreamStop,
    StreamCommit(StreamCommitBody),
    StreamAbort(StreamAbortBody),
}

/// BEGIN
#[derive(Debug, Clone)]
pub struct BeginBody {
    pub final_lsn: Lsn,
    /// Commit timestamp, micros since the PostgreSQL epoch
    pub timestamp: i64,
    pub xid: u32,
}

/// COMMIT
#[derive(Debug, Clone)]
pub struct CommitBody {
    pub flags: u8,
    pub commit_lsn: Lsn,
    pub end_lsn: Lsn,
    pub timestamp: i64,
}

/// ORIGIN
#[derive(Debug, Clone)]
pub struct OriginBody {
    pub commit_lsn: Lsn,
    pub name: String,
}

/// RELATION: table metadata for subsequent row messages
#[derive(Debug, Clone)]
pub struct RelationBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
    /// Xid prefix, present inside a stream block
    pub xid: Option<u32>,
}

/// Column descriptor within a RELATION message
#[derive(Debug, Clone)]
pub struct RelationColumn {
    /// Bit 1 marks key columns
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

impl RelationColumn {
    pub fn is_key(&self) -> bool {
        self.flags & 1 != 0
    }
}

/// TYPE: a non-builtin type referenced by a relation
#[derive(Debug, Clone)]
pub struct TypeBody {
    pub oid: u32,
    pub namespace: String,
    pub name: String,
    pub xid: Option<u32>,
}

/// INSERT
#[derive(Debug, Clone)]
pub struct InsertBody {
    pub relation_id: u32,
    pub new_tuple: Tuple,
    pub xid: Option<u32>,
}

/// UPDATE
#[derive(Debug, Clone)]
pub struct UpdateBody {
    pub relation_id: u32,
    /// Old tuple: key columns ('K') or full row ('O'), identity permitting
    pub old_tuple: Option<Tuple>,
    pub new_tuple: Tuple,
    pub xid: Option<u32>,
}

/// DELETE
#[derive(Debug, Clone)]
pub struct DeleteBody {
    pub relation_id: u32,
    pub old_tuple: Option<Tuple>,
    pub xid: Option<u32>,
}

/// TRUNCATE
#[derive(Debug, Clone)]
pub struct TruncateBody {
    pub options: u8,
    pub relation_ids: Vec<u32>,
    pub xid: Option<u32>,
}

/// MESSAGE: decoded pg_logical_emit_message
#[derive(Debug, Clone)]
pub struct MessageBody {
    pub transactional: bool,
    pub lsn: Lsn,
    pub prefix: String,
    pub content: Bytes,
    pub xid: Option<u32>,
}

/// STREAM START (protocol v2)
#[derive(Debug, Clone)]
pub struct StreamStartBody {
    pub xid: u32,
    pub first_segment: bool,
}

/// STREAM COMMIT (protocol v2)
#[derive(Debug, Clone)]
pub struct StreamCommitBody {
    pub xid: u32,
    pub flags: u8,
    pub commit_lsn: Lsn,
    pub end_lsn: Lsn,
    pub timestamp: i64,
}

/// STREAM ABORT (protocol v2)
#[derive(Debug, Clone)]
pub struct StreamAbortBody {
    pub xid: u32,
    pub sub_xid: u32,
}

/// A row tuple.
#[derive(Debug, Clone)]
pub struct Tuple(pub Vec<TupleData>);

/// One column value within a tuple.
#[derive(Debug, Clone)]
pub enum TupleData {
    Null,
    /// Unchanged TOAST value, not carried on the wire
    Toast,
    /// Text-format value
    Text(Bytes),
}

/// A frame received in CopyBoth mode.
#[derive(Debug, Clone)]
pub enum WalFrame {
    XLogData(crate::pgtypes::XLogData),
    PrimaryKeepalive {
        wal_end: Lsn,
        /// Server clock, Unix epoch millis
        server_time_ms: i64,
        reply_requested: bool,
    },
}
