//! PostgreSQL type resolution and wire value decoding
//!
//! Maps type OIDs to logical schema types and decodes the text-format
//! values carried by pgoutput tuples and snapshot rows. Values are
//! normalised on the way out:
//!
//! - `bytea` -> lower-case hex
//! - `date` -> days since 1970-01-01
//! - `time` -> microseconds since midnight
//! - `timestamp` -> microseconds since epoch
//! - `timestamptz` -> UTC RFC 3339 with `Z` suffix
//! - `interval` -> microseconds
//! - `bool` -> true/false
//! - `json`/`jsonb` -> parsed structure
//!
//! Unknown OIDs are looked up through the side channel once and cached;
//! concurrent first touches share a single in-flight load.

use crate::error::{Result, StreamerError};
use crate::schema::{SchemaBuilder, SchemaType};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

// Debezium temporal semantic type names.
pub const DATE_SCHEMA_NAME: &str = "io.debezium.time.Date";
pub const MICRO_TIME_SCHEMA_NAME: &str = "io.debezium.time.MicroTime";
pub const MICRO_TIMESTAMP_SCHEMA_NAME: &str = "io.debezium.time.MicroTimestamp";
pub const ZONED_TIMESTAMP_SCHEMA_NAME: &str = "io.debezium.time.ZonedTimestamp";
pub const MICRO_DURATION_SCHEMA_NAME: &str = "io.debezium.time.MicroDuration";

/// What kind of type an OID names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgTypeKind {
    Base,
    Array,
    Composite,
    Enum,
    Range,
    Domain,
}

/// Decoded representation of a PostgreSQL type.
#[derive(Debug, Clone)]
pub struct PgType {
    pub oid: u32,
    pub name: String,
    pub kind: PgTypeKind,
    pub element_oid: Option<u32>,
    pub schema_type: SchemaType,
}

impl PgType {
    fn base(oid: u32, name: &str, schema_type: SchemaType) -> Self {
        Self {
            oid,
            name: name.to_string(),
            kind: PgTypeKind::Base,
            element_oid: None,
            schema_type,
        }
    }

    fn array(oid: u32, name: &str, element_oid: u32) -> Self {
        Self {
            oid,
            name: name.to_string(),
            kind: PgTypeKind::Array,
            element_oid: Some(element_oid),
            schema_type: SchemaType::Array,
        }
    }

    fn range(oid: u32, name: &str) -> Self {
        Self {
            oid,
            name: name.to_string(),
            kind: PgTypeKind::Range,
            element_oid: None,
            schema_type: SchemaType::String,
        }
    }
}

// OIDs from pg_type.dat.
pub const BOOL_OID: u32 = 16;
pub const BYTEA_OID: u32 = 17;
pub const CHAR_OID: u32 = 18;
pub const NAME_OID: u32 = 19;
pub const INT8_OID: u32 = 20;
pub const INT2_OID: u32 = 21;
pub const INT4_OID: u32 = 23;
pub const TEXT_OID: u32 = 25;
pub const OID_OID: u32 = 26;
pub const XID_OID: u32 = 28;
pub const JSON_OID: u32 = 114;
pub const XML_OID: u32 = 142;
pub const FLOAT4_OID: u32 = 700;
pub const FLOAT8_OID: u32 = 701;
pub const MACADDR_OID: u32 = 829;
pub const INET_OID: u32 = 869;
pub const CIDR_OID: u32 = 650;
pub const BPCHAR_OID: u32 = 1042;
pub const VARCHAR_OID: u32 = 1043;
pub const DATE_OID: u32 = 1082;
pub const TIME_OID: u32 = 1083;
pub const TIMESTAMP_OID: u32 = 1114;
pub const TIMESTAMPTZ_OID: u32 = 1184;
pub const INTERVAL_OID: u32 = 1186;
pub const BIT_OID: u32 = 1560;
pub const VARBIT_OID: u32 = 1562;
pub const NUMERIC_OID: u32 = 1700;
pub const UUID_OID: u32 = 2950;
pub const JSONB_OID: u32 = 3802;
pub const INT4RANGE_OID: u32 = 3904;
pub const NUMRANGE_OID: u32 = 3906;
pub const TSRANGE_OID: u32 = 3908;
pub const TSTZRANGE_OID: u32 = 3910;
pub const DATERANGE_OID: u32 = 3912;
pub const INT8RANGE_OID: u32 = 3926;

/// Look up a builtin type without touching the catalog.
pub fn builtin_type(oid: u32) -> Option<PgType> {
    let ty = match oid {
        BOOL_OID => PgType::base(oid, "bool", SchemaType::Boolean),
        BYTEA_OID => PgType::base(oid, "bytea", SchemaType::Bytes),
        CHAR_OID => PgType::base(oid, "char", SchemaType::String),
        NAME_OID => PgType::base(oid, "name", SchemaType::String),
        INT8_OID => PgType::base(oid, "int8", SchemaType::Int64),
        INT2_OID => PgType::base(oid, "int2", SchemaType::Int16),
        INT4_OID => PgType::base(oid, "int4", SchemaType::Int32),
        TEXT_OID => PgType::base(oid, "text", SchemaType::String),
        OID_OID => PgType::base(oid, "oid", SchemaType::Int64),
        XID_OID => PgType::base(oid, "xid", SchemaType::Int64),
        JSON_OID => PgType::base(oid, "json", SchemaType::String),
        XML_OID => PgType::base(oid, "xml", SchemaType::String),
        FLOAT4_OID => PgType::base(oid, "float4", SchemaType::Float32),
        FLOAT8_OID => PgType::base(oid, "float8", SchemaType::Float64),
        MACADDR_OID => PgType::base(oid, "macaddr", SchemaType::String),
        INET_OID => PgType::base(oid, "inet", SchemaType::String),
        CIDR_OID => PgType::base(oid, "cidr", SchemaType::String),
        BPCHAR_OID => PgType::base(oid, "bpchar", SchemaType::String),
        VARCHAR_OID => PgType::base(oid, "varchar", SchemaType::String),
        DATE_OID => PgType::base(oid, "date", SchemaType::Int32),
        TIME_OID => PgType::base(oid, "time", SchemaType::Int64),
        TIMESTAMP_OID => PgType::base(oid, "timestamp", SchemaType::Int64),
        TIMESTAMPTZ_OID => PgType::base(oid, "timestamptz", SchemaType::String),
        INTERVAL_OID => PgType::base(oid, "interval", SchemaType::Int64),
        BIT_OID => PgType::base(oid, "bit", SchemaType::String),
        VARBIT_OID => PgType::base(oid, "varbit", SchemaType::String),
        // numeric decodes to an integer when it fits and to its text
        // form otherwise, so the declared type must cover both
        NUMERIC_OID => PgType::base(oid, "numeric", SchemaType::String),
        UUID_OID => PgType::base(oid, "uuid", SchemaType::String),
        JSONB_OID => PgType::base(oid, "jsonb", SchemaType::String),
        INT4RANGE_OID => PgType::range(oid, "int4range"),
        NUMRANGE_OID => PgType::range(oid, "numrange"),
        TSRANGE_OID => PgType::range(oid, "tsrange"),
        TSTZRANGE_OID => PgType::range(oid, "tstzrange"),
        DATERANGE_OID => PgType::range(oid, "daterange"),
        INT8RANGE_OID => PgType::range(oid, "int8range"),

        // Builtin array types.
        1000 => PgType::array(oid, "_bool", BOOL_OID),
        1001 => PgType::array(oid, "_bytea", BYTEA_OID),
        1005 => PgType::array(oid, "_int2", INT2_OID),
        1007 => PgType::array(oid, "_int4", INT4_OID),
        1009 => PgType::array(oid, "_text", TEXT_OID),
        1014 => PgType::array(oid, "_bpchar", BPCHAR_OID),
        1015 => PgType::array(oid, "_varchar", VARCHAR_OID),
        1016 => PgType::array(oid, "_int8", INT8_OID),
        1021 => PgType::array(oid, "_float4", FLOAT4_OID),
        1022 => PgType::array(oid, "_float8", FLOAT8_OID),
        1040 => PgType::array(oid, "_macaddr", MACADDR_OID),
        1041 => PgType::array(oid, "_inet", INET_OID),
        651 => PgType::array(oid, "_cidr", CIDR_OID),
        199 => PgType::array(oid, "_json", JSON_OID),
        3807 => PgType::array(oid, "_jsonb", JSONB_OID),
        1115 => PgType::array(oid, "_timestamp", TIMESTAMP_OID),
        1182 => PgType::array(oid, "_date", DATE_OID),
        1183 => PgType::array(oid, "_time", TIME_OID),
        1185 => PgType::array(oid, "_timestamptz", TIMESTAMPTZ_OID),
        1187 => PgType::array(oid, "_interval", INTERVAL_OID),
        1231 => PgType::array(oid, "_numeric", NUMERIC_OID),
        1561 => PgType::array(oid, "_bit", BIT_OID),
        1563 => PgType::array(oid, "_varbit", VARBIT_OID),
        2951 => PgType::array(oid, "_uuid", UUID_OID),
        3905 => PgType::array(oid, "_int4range", INT4RANGE_OID),
        3927 => PgType::array(oid, "_int8range", INT8RANGE_OID),
        3911 => PgType::array(oid, "_tstzrange", TSTZRANGE_OID),

        _ => return None,
    };
    Some(ty)
}

/// Catalog access used for lazy lookups of non-builtin OIDs.
#[async_trait]
pub trait TypeCatalog: Send + Sync {
    async fn lookup_type(&self, oid: u32) -> Result<PgType>;
}

/// Resolves OIDs to types and decodes wire values.
pub struct TypeResolver {
    catalog: Arc<dyn TypeCatalog>,
    cache: Mutex<HashMap<u32, Arc<OnceCell<PgType>>>>,
}

impl TypeResolver {
    pub fn new(catalog: Arc<dyn TypeCatalog>) -> Self {
        Self {
            catalog,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve an OID. Builtins short-circuit; anything else hits the
    /// catalog at most once, with concurrent callers awaiting the same
    /// in-flight load.
    pub async fn resolve(&self, oid: u32) -> Result<PgType> {
        if let Some(ty) = builtin_type(oid) {
            return Ok(ty);
        }

        let cell = {
            let mut cache = self.cache.lock();
            cache.entry(oid).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        let ty = cell
            .get_or_try_init(|| self.catalog.lookup_type(oid))
            .await?;
        Ok(ty.clone())
    }

    /// Decode one text-format wire value to its normalised JSON form.
    pub async fn decode(&self, oid: u32, text: &str) -> Result<Value> {
        let ty = self.resolve(oid).await?;
        match ty.kind {
            PgTypeKind::Array => {
                let element_oid = ty.element_oid.ok_or_else(|| {
                    StreamerError::resolve(format!("array type {} without element", ty.name))
                })?;
                let element = self.resolve(element_oid).await?;
                let items = parse_array_literal(text)
                    .map_err(|e| StreamerError::decode(ty.name.clone(), e))?;
                decode_array_items(&element, &items)
            }
            _ => decode_scalar(&ty, text),
        }
    }

    /// Column schema for a resolved type, carrying Debezium semantic
    /// names where applicable.
    pub async fn schema_builder(&self, oid: u32) -> Result<SchemaBuilder> {
        let ty = self.resolve(oid).await?;
        match ty.kind {
            PgTypeKind::Array => {
                let element_oid = ty.element_oid.ok_or_else(|| {
                    StreamerError::resolve(format!("array type {} without element", ty.name))
                })?;
                let element = self.resolve(element_oid).await?;
                Ok(SchemaBuilder::array(scalar_schema_builder(&element)))
            }
            _ => Ok(scalar_schema_builder(&ty)),
        }
    }
}

fn scalar_schema_builder(ty: &PgType) -> SchemaBuilder {
    match ty.oid {
        JSON_OID | JSONB_OID => SchemaBuilder::json(),
        UUID_OID => SchemaBuilder::uuid(),
        XML_OID => SchemaBuilder::xml(),
        BIT_OID | VARBIT_OID => SchemaBuilder::bits(0),
        DATE_OID => SchemaBuilder::int32().schema_name(DATE_SCHEMA_NAME).version(1),
        TIME_OID => SchemaBuilder::int64()
            .schema_name(MICRO_TIME_SCHEMA_NAME)
            .version(1),
        TIMESTAMP_OID => SchemaBuilder::int64()
            .schema_name(MICRO_TIMESTAMP_SCHEMA_NAME)
            .version(1),
        TIMESTAMPTZ_OID => SchemaBuilder::string()
            .schema_name(ZONED_TIMESTAMP_SCHEMA_NAME)
            .version(1),
        INTERVAL_OID => SchemaBuilder::int64()
            .schema_name(MICRO_DURATION_SCHEMA_NAME)
            .version(1),
        _ => match ty.kind {
            PgTypeKind::Enum => SchemaBuilder::enumeration(&[]),
            _ => SchemaBuilder::new(ty.schema_type),
        },
    }
}

/// Decode a scalar value. Decode failures are per-row `Decode` errors;
/// the caller degrades the payload rather than dropping the event.
pub fn decode_scalar(ty: &PgType, text: &str) -> Result<Value> {
    let value = match ty.oid {
        BOOL_OID => match text {
            "t" | "true" => json!(true),
            "f" | "false" => json!(false),
            other => return Err(decode_err(ty, format!("bad bool literal {other:?}"))),
        },
        INT2_OID | INT4_OID | INT8_OID | OID_OID | XID_OID => {
            let n: i64 = text
                .parse()
                .map_err(|e| decode_err(ty, format!("{e}")))?;
            json!(n)
        }
        FLOAT4_OID | FLOAT8_OID => match text.parse::<f64>() {
            Ok(f) if f.is_finite() => json!(f),
            // NaN / Infinity are not representable as JSON numbers
            _ => json!(text),
        },
        NUMERIC_OID => {
            // lossless: integer when it fits, otherwise the exact text
            // form; never routed through f64
            if let Ok(n) = text.parse::<i64>() {
                json!(n)
            } else {
                json!(text)
            }
        }
        BYTEA_OID => json!(decode_bytea(text)),
        JSON_OID | JSONB_OID => serde_json::from_str(text)
            .map_err(|e| decode_err(ty, format!("bad json: {e}")))?,
        DATE_OID => json!(decode_date(text).map_err(|e| decode_err(ty, e))?),
        TIME_OID => json!(decode_time(text).map_err(|e| decode_err(ty, e))?),
        TIMESTAMP_OID => json!(decode_timestamp(text).map_err(|e| decode_err(ty, e))?),
        TIMESTAMPTZ_OID => json!(decode_timestamptz(text).map_err(|e| decode_err(ty, e))?),
        INTERVAL_OID => json!(decode_interval(text).map_err(|e| decode_err(ty, e))?),
        UUID_OID => json!(text.to_lowercase()),
        // Everything else passes through as text. Discrete ranges are
        // already server-canonicalised to the `[lo,hi)` form.
        _ => json!(text),
    };
    Ok(value)
}

fn decode_err(ty: &PgType, message: impl Into<String>) -> StreamerError {
    StreamerError::decode(ty.name.clone(), message)
}

/// `\xDEADBEEF` (or raw escape-format text) -> lower-case hex.
fn decode_bytea(text: &str) -> String {
    match text.strip_prefix("\\x") {
        Some(hex_part) => hex_part.to_lowercase(),
        None => hex::encode(text.as_bytes()),
    }
}

/// `YYYY-MM-DD` -> days since 1970-01-01.
fn decode_date(text: &str) -> std::result::Result<i64, String> {
    let date = chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|e| format!("bad date {text:?}: {e}"))?;
    let epoch = chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
    Ok((date - epoch).num_days())
}

/// `HH:MM:SS[.ffffff]` -> microseconds since midnight.
fn decode_time(text: &str) -> std::result::Result<i64, String> {
    let time = chrono::NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
        .map_err(|e| format!("bad time {text:?}: {e}"))?;
    let midnight = chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap();
    Ok((time - midnight).num_microseconds().unwrap_or(0))
}

/// `YYYY-MM-DD HH:MM:SS[.ffffff]` -> microseconds since epoch.
fn decode_timestamp(text: &str) -> std::result::Result<i64, String> {
    let ts = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|e| format!("bad timestamp {text:?}: {e}"))?;
    Ok(ts.and_utc().timestamp_micros())
}

/// Server timestamptz output (`... +00` offset form) -> RFC 3339 UTC `Z`.
fn decode_timestamptz(text: &str) -> std::result::Result<String, String> {
    let parsed = chrono::DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
        .or_else(|_| chrono::DateTime::parse_from_rfc3339(text))
        .map_err(|e| format!("bad timestamptz {text:?}: {e}"))?;
    Ok(parsed
        .with_timezone(&chrono::Utc)
        .to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))
}

/// Interval text (`1 year 2 mons 3 days 04:05:06.789`) -> microseconds,
/// with a 30-day month and 12-month year.
fn decode_interval(text: &str) -> std::result::Result<i64, String> {
    const MICROS_PER_SECOND: i64 = 1_000_000;
    const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;

    let mut micros: i64 = 0;
    let mut tokens = text.split_whitespace().peekable();

    while let Some(token) = tokens.next() {
        if token.contains(':') {
            // Time part: [-]HH:MM:SS[.ffffff]
            let (sign, clock) = match token.strip_prefix('-') {
                Some(rest) => (-1i64, rest),
                None => (1, token),
            };
            let mut parts = clock.split(':');
            let hours: i64 = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| format!("bad interval {text:?}"))?;
            let minutes: i64 = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| format!("bad interval {text:?}"))?;
            let seconds: f64 = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| format!("bad interval {text:?}"))?;
            let time_micros = hours * 3600 * MICROS_PER_SECOND
                + minutes * 60 * MICROS_PER_SECOND
                + (seconds * MICROS_PER_SECOND as f64).round() as i64;
            micros += sign * time_micros;
        } else if let Ok(quantity) = token.parse::<i64>() {
            let unit = tokens
                .next()
                .ok_or_else(|| format!("bad interval {text:?}: dangling quantity"))?;
            let unit_micros = match unit.trim_end_matches('s') {
                "year" => 12 * 30 * MICROS_PER_DAY,
                "mon" => 30 * MICROS_PER_DAY,
                "day" => MICROS_PER_DAY,
                other => return Err(format!("bad interval unit {other:?} in {text:?}")),
            };
            micros += quantity * unit_micros;
        } else if token == "ago" {
            micros = -micros;
        } else {
            return Err(format!("bad interval token {token:?} in {text:?}"));
        }
    }

    Ok(micros)
}

/// One parsed element of an array literal.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayItem {
    Null,
    Literal(String),
    Sub(Vec<ArrayItem>),
}

/// Parse a PostgreSQL array literal (`{1,NULL,"a b",{2,3}}`). Dimension
/// prefixes (`[1:2]={...}`) are skipped.
pub fn parse_array_literal(text: &str) -> std::result::Result<Vec<ArrayItem>, String> {
    let body = match text.find('{') {
        Some(start) => &text[start..],
        None => return Err(format!("array literal without braces: {text:?}")),
    };

    let mut chars = body.chars().peekable();
    let items = parse_array_level(&mut chars)?;
    Ok(items)
}

fn parse_array_level(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> std::result::Result<Vec<ArrayItem>, String> {
    match chars.next() {
        Some('{') => {}
        other => return Err(format!("expected '{{', found {other:?}")),
    }

    let mut items = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut has_content = false;

    loop {
        let Some(&c) = chars.peek() else {
            return Err("unterminated array literal".to_string());
        };

        match c {
            '"' => {
                chars.next();
                quoted = true;
                has_content = true;
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => return Err("unterminated escape".to_string()),
                        },
                        Some('"') => break,
                        Some(inner) => current.push(inner),
                        None => return Err("unterminated quoted element".to_string()),
                    }
                }
            }
            '{' => {
                items.push(ArrayItem::Sub(parse_array_level(chars)?));
                has_content = false;
                current.clear();
                quoted = false;
                match chars.peek() {
                    Some(',') => {
                        chars.next();
                    }
                    Some('}') => {
                        chars.next();
                        return Ok(items);
                    }
                    other => return Err(format!("expected ',' or '}}', found {other:?}")),
                }
            }
            ',' | '}' => {
                chars.next();
                if has_content || !current.is_empty() {
                    if !quoted && current == "NULL" {
                        items.push(ArrayItem::Null);
                    } else {
                        items.push(ArrayItem::Literal(std::mem::take(&mut current)));
                    }
                }
                current.clear();
                quoted = false;
                has_content = false;
                if c == '}' {
                    return Ok(items);
                }
            }
            _ => {
                chars.next();
                current.push(c);
                has_content = true;
            }
        }
    }
}

fn decode_array_items(element: &PgType, items: &[ArrayItem]) -> Result<Value> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            ArrayItem::Null => out.push(Value::Null),
            ArrayItem::Literal(text) => out.push(decode_scalar(element, text)?),
            ArrayItem::Sub(inner) => out.push(decode_array_items(element, inner)?),
        }
    }
    Ok(Value::Array(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoCatalog;

    #[async_trait]
    impl TypeCatalog for NoCatalog {
        async fn lookup_type(&self, oid: u32) -> Result<PgType> {
            Err(StreamerError::resolve(format!("unknown oid {oid}")))
        }
    }

    fn resolver() -> TypeResolver {
        TypeResolver::new(Arc::new(NoCatalog))
    }

    #[tokio::test]
    async fn test_decode_scalars() {
        let r = resolver();
        assert_eq!(r.decode(BOOL_OID, "t").await.unwrap(), json!(true));
        assert_eq!(r.decode(BOOL_OID, "f").await.unwrap(), json!(false));
        assert_eq!(r.decode(INT2_OID, "-7").await.unwrap(), json!(-7));
        assert_eq!(r.decode(INT8_OID, "123456789012").await.unwrap(), json!(123456789012i64));
        assert_eq!(r.decode(FLOAT8_OID, "1.5").await.unwrap(), json!(1.5));
        assert_eq!(r.decode(FLOAT4_OID, "NaN").await.unwrap(), json!("NaN"));
        assert_eq!(r.decode(TEXT_OID, "hello").await.unwrap(), json!("hello"));
        assert_eq!(r.decode(NUMERIC_OID, "42").await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_decode_numeric_lossless() {
        let r = resolver();
        // integers that fit stay numbers
        assert_eq!(r.decode(NUMERIC_OID, "42").await.unwrap(), json!(42));
        assert_eq!(
            r.decode(NUMERIC_OID, "-9223372036854775808").await.unwrap(),
            json!(i64::MIN)
        );
        // fractions keep their exact text form, not an f64 re-encoding
        assert_eq!(r.decode(NUMERIC_OID, "3.14").await.unwrap(), json!("3.14"));
        assert_eq!(
            r.decode(NUMERIC_OID, "123456789012345678.123456789")
                .await
                .unwrap(),
            json!("123456789012345678.123456789")
        );
        // integers beyond i64 fall back to text too
        assert_eq!(
            r.decode(NUMERIC_OID, "99999999999999999999999999")
                .await
                .unwrap(),
            json!("99999999999999999999999999")
        );
        assert_eq!(r.decode(NUMERIC_OID, "NaN").await.unwrap(), json!("NaN"));

        // the declared schema type covers both emitted forms
        let schema = r.schema_builder(NUMERIC_OID).await.unwrap().build();
        assert_eq!(schema["type"], "string");
    }

    #[tokio::test]
    async fn test_decode_bytea_lower_hex() {
        let r = resolver();
        assert_eq!(
            r.decode(BYTEA_OID, "\\xDEADBEEF").await.unwrap(),
            json!("deadbeef")
        );
    }

    #[tokio::test]
    async fn test_decode_temporal_normalisations() {
        let r = resolver();
        // 2023-02-25 is 19413 days after the epoch
        assert_eq!(r.decode(DATE_OID, "2023-02-25").await.unwrap(), json!(19413));
        assert_eq!(
            r.decode(TIME_OID, "00:00:01.5").await.unwrap(),
            json!(1_500_000i64)
        );
        assert_eq!(
            r.decode(TIMESTAMP_OID, "1970-01-01 00:00:01").await.unwrap(),
            json!(1_000_000i64)
        );
        assert_eq!(
            r.decode(TIMESTAMPTZ_OID, "2023-02-25 01:00:00+01").await.unwrap(),
            json!("2023-02-25T00:00:00Z")
        );
    }

    #[tokio::test]
    async fn test_decode_interval_micros() {
        let r = resolver();
        assert_eq!(
            r.decode(INTERVAL_OID, "00:00:01").await.unwrap(),
            json!(1_000_000i64)
        );
        assert_eq!(
            r.decode(INTERVAL_OID, "1 day 01:00:00").await.unwrap(),
            json!((86_400i64 + 3600) * 1_000_000)
        );
        assert_eq!(
            r.decode(INTERVAL_OID, "2 mons").await.unwrap(),
            json!(60i64 * 86_400 * 1_000_000)
        );
    }

    #[tokio::test]
    async fn test_decode_json() {
        let r = resolver();
        assert_eq!(
            r.decode(JSONB_OID, r#"{"a": [1, 2]}"#).await.unwrap(),
            json!({"a": [1, 2]})
        );
    }

    #[tokio::test]
    async fn test_decode_uuid_lowercase() {
        let r = resolver();
        assert_eq!(
            r.decode(UUID_OID, "A0EEBC99-9C0B-4EF8-BB6D-6BB9BD380A11")
                .await
                .unwrap(),
            json!("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11")
        );
    }

    #[tokio::test]
    async fn test_decode_range_passthrough() {
        let r = resolver();
        assert_eq!(r.decode(INT4RANGE_OID, "[1,5)").await.unwrap(), json!("[1,5)"));
    }

    #[tokio::test]
    async fn test_decode_int_array() {
        let r = resolver();
        assert_eq!(
            r.decode(1007, "{1,2,NULL,4}").await.unwrap(),
            json!([1, 2, Value::Null, 4])
        );
    }

    #[tokio::test]
    async fn test_decode_text_array_with_quoting() {
        let r = resolver();
        assert_eq!(
            r.decode(1009, r#"{"a b","c,d","with \"quote\"",NULL,plain}"#)
                .await
                .unwrap(),
            json!(["a b", "c,d", "with \"quote\"", Value::Null, "plain"])
        );
        // quoted "NULL" is the string, bare NULL is null
        assert_eq!(
            r.decode(1009, r#"{"NULL",NULL}"#).await.unwrap(),
            json!(["NULL", Value::Null])
        );
    }

    #[tokio::test]
    async fn test_decode_nested_array() {
        let r = resolver();
        assert_eq!(
            r.decode(1007, "{{1,2},{3,4}}").await.unwrap(),
            json!([[1, 2], [3, 4]])
        );
    }

    #[tokio::test]
    async fn test_empty_array() {
        let r = resolver();
        assert_eq!(r.decode(1007, "{}").await.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn test_unknown_oid_is_resolve_error() {
        let r = resolver();
        let err = r.decode(999_999, "x").await.unwrap_err();
        assert!(matches!(err, StreamerError::Resolve(_)));
    }

    #[tokio::test]
    async fn test_bad_literal_is_decode_error() {
        let r = resolver();
        let err = r.decode(INT4_OID, "not-a-number").await.unwrap_err();
        assert!(matches!(err, StreamerError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_unknown_oid_loaded_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingCatalog(AtomicUsize);

        #[async_trait]
        impl TypeCatalog for CountingCatalog {
            async fn lookup_type(&self, oid: u32) -> Result<PgType> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(PgType::base(oid, "custom", SchemaType::String))
            }
        }

        let catalog = Arc::new(CountingCatalog(AtomicUsize::new(0)));
        let resolver = Arc::new(TypeResolver::new(catalog.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move { resolver.resolve(90_001).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(catalog.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_schema_builder_semantic_names() {
        let r = resolver();
        let schema = r.schema_builder(UUID_OID).await.unwrap().build();
        assert_eq!(schema["name"], crate::schema::UUID_SCHEMA_NAME);

        let schema = r.schema_builder(TIMESTAMPTZ_OID).await.unwrap().build();
        assert_eq!(schema["name"], ZONED_TIMESTAMP_SCHEMA_NAME);
        assert_eq!(schema["type"], "string");

        let schema = r.schema_builder(1007).await.unwrap().build();
        assert_eq!(schema["type"], "array");
        assert_eq!(schema["items"]["type"], "int32");
    }
}
