//! pgoutput decoder
//!
//! Decodes the binary pgoutput payloads carried inside XLogData frames,
//! plus the CopyBoth frame envelope itself. Inside a stream block
//! (protocol v2) the row and metadata messages carry an extra leading
//! xid, so the caller passes its current stream state.

use super::protocol::*;
use crate::pgtypes::{pg_micros_to_unix_millis, Lsn, XLogData};
use bytes::{Buf, Bytes};
use thiserror::Error;

/// Decoder errors. These are protocol-level: a failed decode aborts the
/// connection rather than a single event.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("not enough data")]
    NotEnoughData,
    #[error("invalid message type: {0:#04x}")]
    InvalidType(u8),
    #[error("utf8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<WireError> for crate::error::StreamerError {
    fn from(err: WireError) -> Self {
        crate::error::StreamerError::replication(err.to_string())
    }
}

/// pgoutput decoder.
pub struct PgOutputDecoder;

impl PgOutputDecoder {
    /// Decode one CopyData payload into a WAL frame.
    pub fn decode_frame(data: &mut Bytes) -> Result<WalFrame, WireError> {
        if !data.has_remaining() {
            return Err(WireError::NotEnoughData);
        }
        match data.get_u8() {
            b'w' => {
                need(data, 8 + 8 + 8)?;
                let wal_start = Lsn(data.get_u64());
                let wal_end = Lsn(data.get_u64());
                let server_time_ms = pg_micros_to_unix_millis(data.get_i64());
                Ok(WalFrame::XLogData(XLogData {
                    wal_start,
                    wal_end,
                    server_time_ms,
                    data: data.clone(),
                }))
            }
            b'k' => {
                need(data, 8 + 8 + 1)?;
                let wal_end = Lsn(data.get_u64());
                let server_time_ms = pg_micros_to_unix_millis(data.get_i64());
                let reply_requested = data.get_u8() == 1;
                Ok(WalFrame::PrimaryKeepalive {
                    wal_end,
                    server_time_ms,
                    reply_requested,
                })
            }
            t => Err(WireError::InvalidType(t)),
        }
    }

    /// Decode one pgoutput message. `in_stream` is true between
    /// STREAM START and STREAM STOP, where row messages carry a leading
    /// xid.
    pub fn decode(data: &mut Bytes, in_stream: bool) -> Result<PgOutputMessage, WireError> {
        if !data.has_remaining() {
            return Err(WireError::NotEnoughData);
        }

        let msg_type = data.get_u8();
        match msg_type {
            b'B' => Self::decode_begin(data).map(PgOutputMessage::Begin),
            b'C' => Self::decode_commit(data).map(PgOutputMessage::Commit),
            b'O' => Self::decode_origin(data).map(PgOutputMessage::Origin),
            b'R' => Self::decode_relation(data, in_stream).map(PgOutputMessage::Relation),
            b'Y' => Self::decode_type(data, in_stream).map(PgOutputMessage::Type),
            b'I' => Self::decode_insert(data, in_stream).map(PgOutputMessage::Insert),
            b'U' => Self::decode_update(data, in_stream).map(PgOutputMessage::Update),
            b'D' => Self::decode_delete(data, in_stream).map(PgOutputMessage::Delete),
            b'T' => Self::decode_truncate(data, in_stream).map(PgOutputMessage::Truncate),
            b'M' => Self::decode_message(data, in_stream).map(PgOutputMessage::Message),
            b'S' => Self::decode_stream_start(data).map(PgOutputMessage::StreamStart),
            b'E' => Ok(PgOutputMessage::StreamStop),
            b'c' => Self::decode_stream_commit(data).map(PgOutputMessage::StreamCommit),
            b'A' => Self::decode_stream_abort(data).map(PgOutputMessage::StreamAbort),
            t => Err(WireError::InvalidType(t)),
        }
    }

    fn decode_begin(buf: &mut Bytes) -> Result<BeginBody, WireError> {
        need(buf, 8 + 8 + 4)?;
        Ok(BeginBody {
            final_lsn: Lsn(buf.get_u64()),
            timestamp: buf.get_i64(),
            xid: buf.get_u32(),
        })
    }

    fn decode_commit(buf: &mut Bytes) -> Result<CommitBody, WireError> {
        need(buf, 1 + 8 + 8 + 8)?;
        Ok(CommitBody {
            flags: buf.get_u8(),
            commit_lsn: Lsn(buf.get_u64()),
            end_lsn: Lsn(buf.get_u64()),
            timestamp: buf.get_i64(),
        })
    }

    fn decode_origin(buf: &mut Bytes) -> Result<OriginBody, WireError> {
        need(buf, 8)?;
        Ok(OriginBody {
            commit_lsn: Lsn(buf.get_u64()),
            name: read_cstring(buf)?,
        })
    }

    fn decode_relation(buf: &mut Bytes, in_stream: bool) -> Result<RelationBody, WireError> {
        let xid = stream_xid(buf, in_stream)?;
        need(buf, 4)?;
        let id = buf.get_u32();
        let namespace = read_cstring(buf)?;
        let name = read_cstring(buf)?;
        need(buf, 1 + 2)?;
        let replica_identity = buf.get_u8();
        let column_count = buf.get_u16();

        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            need(buf, 1)?;
            let flags = buf.get_u8();
            let column_name = read_cstring(buf)?;
            need(buf, 4 + 4)?;
            columns.push(RelationColumn {
                flags,
                name: column_name,
                type_oid: buf.get_u32(),
                type_modifier: buf.get_i32(),
            });
        }

        Ok(RelationBody {
            id,
            namespace,
            name,
            replica_identity,
            columns,
            xid,
        })
    }

    fn decode_type(buf: &mut Bytes, in_stream: bool) -> Result<TypeBody, WireError> {
        let xid = stream_xid(buf, in_stream)?;
        need(buf, 4)?;
        Ok(TypeBody {
            oid: buf.get_u32(),
            namespace: read_cstring(buf)?,
            name: read_cstring(buf)?,
            xid,
        })
    }

    fn decode_insert(buf: &mut Bytes, in_stream: bool) -> Result<InsertBody, WireError> {
        let xid = stream_xid(buf, in_stream)?;
        need(buf, 4 + 1)?;
        let relation_id = buf.get_u32();
        let tag = buf.get_u8();
        if tag != b'N' {
            return Err(WireError::Protocol(format!(
                "expected new tuple in insert, found {:?}",
                tag as char
            )));
        }
        Ok(InsertBody {
            relation_id,
            new_tuple: decode_tuple(buf)?,
            xid,
        })
    }

    fn decode_update(buf: &mut Bytes, in_stream: bool) -> Result<UpdateBody, WireError> {
        let xid = stream_xid(buf, in_stream)?;
        need(buf, 4 + 1)?;
        let relation_id = buf.get_u32();

        let (old_tuple, new_tuple) = match buf.get_u8() {
            tag @ (b'K' | b'O') => {
                let old = decode_tuple(buf)?;
                need(buf, 1)?;
                let next = buf.get_u8();
                if next != b'N' {
                    return Err(WireError::Protocol(format!(
                        "expected new tuple after {:?}, found {:?}",
                        tag as char, next as char
                    )));
                }
                (Some(old), decode_tuple(buf)?)
            }
            b'N' => (None, decode_tuple(buf)?),
            t => return Err(WireError::InvalidType(t)),
        };

        Ok(UpdateBody {
            relation_id,
            old_tuple,
            new_tuple,
            xid,
        })
    }

    fn decode_delete(buf: &mut Bytes, in_stream: bool) -> Result<DeleteBody, WireError> {
        let xid = stream_xid(buf, in_stream)?;
        need(buf, 4 + 1)?;
        let relation_id = buf.get_u32();
        let old_tuple = match buf.get_u8() {
            b'K' | b'O' => Some(decode_tuple(buf)?),
            t => return Err(WireError::InvalidType(t)),
        };
        Ok(DeleteBody {
            relation_id,
            old_tuple,
            xid,
        })
    }

    fn decode_truncate(buf: &mut Bytes, in_stream: bool) -> Result<TruncateBody, WireError> {
        let xid = stream_xid(buf, in_stream)?;
        need(buf, 4 + 1)?;
        let relation_count = buf.get_u32();
        let options = buf.get_u8();
        need(buf, relation_count as usize * 4)?;
        let mut relation_ids = Vec::with_capacity(relation_count as usize);
        for _ in 0..relation_count {
            relation_ids.push(buf.get_u32());
        }
        Ok(TruncateBody {
            options,
            relation_ids,
            xid,
        })
    }

    fn decode_message(buf: &mut Bytes, in_stream: bool) -> Result<MessageBody, WireError> {
        let xid = stream_xid(buf, in_stream)?;
        need(buf, 1 + 8)?;
        let transactional = buf.get_u8() == 1;
        let lsn = Lsn(buf.get_u64());
        let prefix = read_cstring(buf)?;
        need(buf, 4)?;
        let length = buf.get_u32() as usize;
        need(buf, length)?;
        let content = buf.copy_to_bytes(length);
        Ok(MessageBody {
            transactional,
            lsn,
            prefix,
            content,
            xid,
        })
    }

    fn decode_stream_start(buf: &mut Bytes) -> Result<StreamStartBody, WireError> {
        need(buf, 4 + 1)?;
        Ok(StreamStartBody {
            xid: buf.get_u32(),
            first_segment: buf.get_u8() == 1,
        })
    }

    fn decode_stream_commit(buf: &mut Bytes) -> Result<StreamCommitBody, WireError> {
        need(buf, 4 + 1 + 8 + 8 + 8)?;
        Ok(StreamCommitBody {
            xid: buf.get_u32(),
            flags: buf.get_u8(),
            commit_lsn: Lsn(buf.get_u64()),
            end_lsn: Lsn(buf.get_u64()),
            timestamp: buf.get_i64(),
        })
    }

    fn decode_stream_abort(buf: &mut Bytes) -> Result<StreamAbortBody, WireError> {
        need(buf, 4 + 4)?;
        Ok(StreamAbortBody {
            xid: buf.get_u32(),
            sub_xid: buf.get_u32(),
        })
    }
}

fn stream_xid(buf: &mut Bytes, in_stream: bool) -> Result<Option<u32>, WireError> {
    if in_stream {
        need(buf, 4)?;
        Ok(Some(buf.get_u32()))
    } else {
        Ok(None)
    }
}

fn need(buf: &Bytes, len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        Err(WireError::NotEnoughData)
    } else {
        Ok(())
    }
}

fn read_cstring(buf: &mut Bytes) -> Result<String, WireError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(WireError::NotEnoughData)?;
    let raw = buf.copy_to_bytes(end);
    buf.advance(1); // terminator
    Ok(std::str::from_utf8(&raw)?.to_string())
}

fn decode_tuple(buf: &mut Bytes) -> Result<Tuple, WireError> {
    need(buf, 2)?;
    let column_count = buf.get_u16();
    let mut columns = Vec::with_capacity(column_count as usize);

    for _ in 0..column_count {
        need(buf, 1)?;
        let data = match buf.get_u8() {
            b'n' => TupleData::Null,
            b'u' => TupleData::Toast,
            b't' => {
                need(buf, 4)?;
                let len = buf.get_u32() as usize;
                need(buf, len)?;
                TupleData::Text(buf.copy_to_bytes(len))
            }
            t => return Err(WireError::InvalidType(t)),
        };
        columns.push(data);
    }

    Ok(Tuple(columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn put_cstring(buf: &mut BytesMut, s: &str) {
        buf.put_slice(s.as_bytes());
        buf.put_u8(0);
    }

    fn put_text_tuple(buf: &mut BytesMut, values: &[Option<&str>]) {
        buf.put_u16(values.len() as u16);
        for value in values {
            match value {
                Some(text) => {
                    buf.put_u8(b't');
                    buf.put_u32(text.len() as u32);
                    buf.put_slice(text.as_bytes());
                }
                None => buf.put_u8(b'n'),
            }
        }
    }

    #[test]
    fn test_decode_begin() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(0x0000_0001_0000_0000);
        buf.put_i64(1_234_567);
        buf.put_u32(731);

        let msg = PgOutputDecoder::decode(&mut buf.freeze(), false).unwrap();
        match msg {
            PgOutputMessage::Begin(body) => {
                assert_eq!(body.final_lsn, Lsn(0x0000_0001_0000_0000));
                assert_eq!(body.xid, 731);
            }
            other => panic!("expected begin, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_commit() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(0x100);
        buf.put_u64(0x140);
        buf.put_i64(99);

        let msg = PgOutputDecoder::decode(&mut buf.freeze(), false).unwrap();
        match msg {
            PgOutputMessage::Commit(body) => {
                assert_eq!(body.commit_lsn, Lsn(0x100));
                assert_eq!(body.end_lsn, Lsn(0x140));
            }
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_relation() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(16385);
        put_cstring(&mut buf, "_timescaledb_internal");
        put_cstring(&mut buf, "_hyper_1_1_chunk");
        buf.put_u8(b'd');
        buf.put_u16(2);
        // key column
        buf.put_u8(1);
        put_cstring(&mut buf, "ts");
        buf.put_u32(crate::typeres::TIMESTAMPTZ_OID);
        buf.put_i32(-1);
        // non-key column
        buf.put_u8(0);
        put_cstring(&mut buf, "val");
        buf.put_u32(crate::typeres::FLOAT8_OID);
        buf.put_i32(-1);

        let msg = PgOutputDecoder::decode(&mut buf.freeze(), false).unwrap();
        match msg {
            PgOutputMessage::Relation(rel) => {
                assert_eq!(rel.id, 16385);
                assert_eq!(rel.namespace, "_timescaledb_internal");
                assert_eq!(rel.name, "_hyper_1_1_chunk");
                assert_eq!(rel.columns.len(), 2);
                assert!(rel.columns[0].is_key());
                assert!(!rel.columns[1].is_key());
                assert_eq!(rel.xid, None);
            }
            other => panic!("expected relation, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_insert_with_tuple() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(16385);
        buf.put_u8(b'N');
        put_text_tuple(&mut buf, &[Some("2023-02-25 00:00:00+00"), Some("1")]);

        let msg = PgOutputDecoder::decode(&mut buf.freeze(), false).unwrap();
        match msg {
            PgOutputMessage::Insert(ins) => {
                assert_eq!(ins.relation_id, 16385);
                assert_eq!(ins.new_tuple.0.len(), 2);
                match &ins.new_tuple.0[1] {
                    TupleData::Text(raw) => assert_eq!(raw.as_ref(), b"1"),
                    other => panic!("expected text, got {other:?}"),
                }
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_update_with_key_tuple() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(16385);
        buf.put_u8(b'K');
        put_text_tuple(&mut buf, &[Some("1"), None]);
        buf.put_u8(b'N');
        put_text_tuple(&mut buf, &[Some("1"), Some("2")]);

        let msg = PgOutputDecoder::decode(&mut buf.freeze(), false).unwrap();
        match msg {
            PgOutputMessage::Update(upd) => {
                assert!(upd.old_tuple.is_some());
                assert!(matches!(upd.new_tuple.0[1], TupleData::Text(_)));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_delete() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(16385);
        buf.put_u8(b'O');
        put_text_tuple(&mut buf, &[Some("1"), Some("2")]);

        let msg = PgOutputDecoder::decode(&mut buf.freeze(), false).unwrap();
        assert!(matches!(msg, PgOutputMessage::Delete(d) if d.old_tuple.is_some()));
    }

    #[test]
    fn test_decode_truncate() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'T');
        buf.put_u32(2);
        buf.put_u8(1); // CASCADE
        buf.put_u32(16385);
        buf.put_u32(16390);

        let msg = PgOutputDecoder::decode(&mut buf.freeze(), false).unwrap();
        match msg {
            PgOutputMessage::Truncate(t) => {
                assert_eq!(t.relation_ids, vec![16385, 16390]);
                assert_eq!(t.options, 1);
            }
            other => panic!("expected truncate, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_logical_message() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'M');
        buf.put_u8(1); // transactional
        buf.put_u64(0x2000);
        put_cstring(&mut buf, "wm");
        buf.put_u32(5);
        buf.put_slice(b"hello");

        let msg = PgOutputDecoder::decode(&mut buf.freeze(), false).unwrap();
        match msg {
            PgOutputMessage::Message(m) => {
                assert!(m.transactional);
                assert_eq!(m.lsn, Lsn(0x2000));
                assert_eq!(m.prefix, "wm");
                assert_eq!(m.content.as_ref(), b"hello");
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_stream_messages() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'S');
        buf.put_u32(900);
        buf.put_u8(1);
        let msg = PgOutputDecoder::decode(&mut buf.freeze(), false).unwrap();
        assert!(matches!(
            msg,
            PgOutputMessage::StreamStart(s) if s.xid == 900 && s.first_segment
        ));

        // inside the stream, an insert carries its xid
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(900);
        buf.put_u32(16385);
        buf.put_u8(b'N');
        put_text_tuple(&mut buf, &[Some("1")]);
        let msg = PgOutputDecoder::decode(&mut buf.freeze(), true).unwrap();
        assert!(matches!(msg, PgOutputMessage::Insert(i) if i.xid == Some(900)));

        let mut buf = BytesMut::new();
        buf.put_u8(b'E');
        let msg = PgOutputDecoder::decode(&mut buf.freeze(), false).unwrap();
        assert!(matches!(msg, PgOutputMessage::StreamStop));

        let mut buf = BytesMut::new();
        buf.put_u8(b'c');
        buf.put_u32(900);
        buf.put_u8(0);
        buf.put_u64(0x500);
        buf.put_u64(0x540);
        buf.put_i64(7);
        let msg = PgOutputDecoder::decode(&mut buf.freeze(), false).unwrap();
        assert!(matches!(
            msg,
            PgOutputMessage::StreamCommit(c) if c.xid == 900 && c.commit_lsn == Lsn(0x500)
        ));

        let mut buf = BytesMut::new();
        buf.put_u8(b'A');
        buf.put_u32(900);
        buf.put_u32(901);
        let msg = PgOutputDecoder::decode(&mut buf.freeze(), false).unwrap();
        assert!(matches!(
            msg,
            PgOutputMessage::StreamAbort(a) if a.xid == 900 && a.sub_xid == 901
        ));
    }

    #[test]
    fn test_decode_frame_xlogdata() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(0x100);
        buf.put_u64(0x200);
        buf.put_i64(0);
        buf.put_slice(b"payload");

        let frame = PgOutputDecoder::decode_frame(&mut buf.freeze()).unwrap();
        match frame {
            WalFrame::XLogData(xld) => {
                assert_eq!(xld.wal_start, Lsn(0x100));
                assert_eq!(xld.wal_end, Lsn(0x200));
                assert_eq!(xld.data.as_ref(), b"payload");
                assert_eq!(xld.end_position(), Lsn(0x107));
            }
            other => panic!("expected xlogdata, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_frame_keepalive() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(0x300);
        buf.put_i64(0);
        buf.put_u8(1);

        let frame = PgOutputDecoder::decode_frame(&mut buf.freeze()).unwrap();
        assert!(matches!(
            frame,
            WalFrame::PrimaryKeepalive {
                wal_end: Lsn(0x300),
                reply_requested: true,
                ..
            }
        ));
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u32(1); // far too short for a begin body
        assert!(PgOutputDecoder::decode(&mut buf.freeze(), false).is_err());

        assert!(PgOutputDecoder::decode(&mut Bytes::new(), false).is_err());
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'Z');
        assert!(matches!(
            PgOutputDecoder::decode(&mut buf.freeze(), false),
            Err(WireError::InvalidType(b'Z'))
        ));
    }
}
