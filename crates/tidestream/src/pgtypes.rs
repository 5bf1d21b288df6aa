//! PostgreSQL wire-level types
//!
//! LSN arithmetic and the XLogData frame shared by the replication
//! channel, the resolver and the offset store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A log sequence number: a monotone 64-bit position in the WAL.
///
/// Displayed in the PostgreSQL `XXXXXXXX/XXXXXXXX` hex form.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The `0/0` position, used on a first run with no stored offset.
    pub const ZERO: Lsn = Lsn(0);

    /// Position after consuming `len` payload bytes from this position.
    pub fn advance(self, len: usize) -> Lsn {
        Lsn(self.0 + len as u64)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// High 32 bits (WAL file part).
    pub fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Low 32 bits (offset part).
    pub fn low(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.high(), self.low())
    }
}

impl FromStr for Lsn {
    type Err = crate::error::StreamerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| crate::error::StreamerError::decode("lsn", format!("bad lsn {s:?}")))?;
        let high = u64::from_str_radix(high, 16)
            .map_err(|e| crate::error::StreamerError::decode("lsn", e.to_string()))?;
        let low = u64::from_str_radix(low, 16)
            .map_err(|e| crate::error::StreamerError::decode("lsn", e.to_string()))?;
        Ok(Lsn((high << 32) | low))
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

/// One XLogData frame from the replication stream.
#[derive(Debug, Clone)]
pub struct XLogData {
    /// WAL position of the start of this payload
    pub wal_start: Lsn,
    /// Server's current WAL end
    pub wal_end: Lsn,
    /// Server clock at send time (Unix epoch millis)
    pub server_time_ms: i64,
    /// pgoutput payload
    pub data: bytes::Bytes,
}

impl XLogData {
    /// Position after this frame: `wal_start + len(data)`.
    pub fn end_position(&self) -> Lsn {
        self.wal_start.advance(self.data.len())
    }
}

/// Replica identity setting of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaIdentity {
    /// Old tuple carries primary key columns only
    Default,
    /// No old tuple on update/delete
    Nothing,
    /// Old tuple carries all columns
    Full,
    /// Old tuple carries the columns of a chosen unique index
    Index,
}

impl ReplicaIdentity {
    /// Parse the single-character form used by `pg_class.relreplident`
    /// and the pgoutput RELATION message.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'd' => Some(Self::Default),
            b'n' => Some(Self::Nothing),
            b'f' => Some(Self::Full),
            b'i' => Some(Self::Index),
            _ => None,
        }
    }

    pub fn as_tag(self) -> char {
        match self {
            Self::Default => 'd',
            Self::Nothing => 'n',
            Self::Full => 'f',
            Self::Index => 'i',
        }
    }
}

impl fmt::Display for ReplicaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_tag())
    }
}

/// Microseconds between the Unix and PostgreSQL (2000-01-01) epochs.
pub const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Convert a PostgreSQL timestamp (micros since 2000-01-01) to Unix millis.
pub fn pg_micros_to_unix_millis(pg_micros: i64) -> i64 {
    (pg_micros + PG_EPOCH_OFFSET_MICROS) / 1000
}

/// Current wall clock as micros since the PostgreSQL epoch, for standby
/// status updates.
pub fn now_pg_micros() -> i64 {
    let unix_micros = chrono::Utc::now().timestamp_micros();
    unix_micros - PG_EPOCH_OFFSET_MICROS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_display_roundtrip() {
        let lsn = Lsn(0x0000_0001_1234_5678);
        assert_eq!(lsn.to_string(), "1/12345678");
        assert_eq!("1/12345678".parse::<Lsn>().unwrap(), lsn);
        assert_eq!("0/0".parse::<Lsn>().unwrap(), Lsn::ZERO);
    }

    #[test]
    fn test_lsn_parse_rejects_garbage() {
        assert!("nope".parse::<Lsn>().is_err());
        assert!("1-2".parse::<Lsn>().is_err());
        assert!("zz/12".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_lsn_advance() {
        let lsn = Lsn(100);
        assert_eq!(lsn.advance(28), Lsn(128));
        assert_eq!(lsn.advance(0), lsn);
    }

    #[test]
    fn test_xlogdata_end_position() {
        let xld = XLogData {
            wal_start: Lsn(0x10),
            wal_end: Lsn(0x40),
            server_time_ms: 0,
            data: bytes::Bytes::from_static(&[0u8; 16]),
        };
        assert_eq!(xld.end_position(), Lsn(0x20));
    }

    #[test]
    fn test_replica_identity_tags() {
        assert_eq!(ReplicaIdentity::from_tag(b'd'), Some(ReplicaIdentity::Default));
        assert_eq!(ReplicaIdentity::from_tag(b'f'), Some(ReplicaIdentity::Full));
        assert_eq!(ReplicaIdentity::from_tag(b'x'), None);
        assert_eq!(ReplicaIdentity::Index.as_tag(), 'i');
    }

    #[test]
    fn test_pg_epoch_conversion() {
        // 2000-01-01 00:00:00 UTC in PG micros is zero
        assert_eq!(pg_micros_to_unix_millis(0), 946_684_800_000);
    }
}
