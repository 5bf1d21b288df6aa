//! Schema model, registry and topic naming
//!
//! Schemas are intern-able trees in the Kafka Connect JSON shape
//! (`{type, optional, field?, name?, version?, fields?|items?}`), built
//! through [`SchemaBuilder`] and cached in the [`SchemaRegistry`] so each
//! named record schema is constructed exactly once.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Logical schema types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Boolean,
    String,
    Bytes,
    Array,
    Map,
    Struct,
}

impl SchemaType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float",
            Self::Float64 => "double",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::Array => "array",
            Self::Map => "map",
            Self::Struct => "struct",
        }
    }
}

// Debezium semantic type names carried in the schema `name` field.
pub const BITS_SCHEMA_NAME: &str = "io.debezium.data.Bits";
pub const ENUM_SCHEMA_NAME: &str = "io.debezium.data.Enum";
// The upstream constant is misspelled "Lree"; we use the corrected form.
pub const LTREE_SCHEMA_NAME: &str = "io.debezium.data.Ltree";
pub const JSON_SCHEMA_NAME: &str = "io.debezium.data.Json";
pub const UUID_SCHEMA_NAME: &str = "io.debezium.data.Uuid";
pub const XML_SCHEMA_NAME: &str = "io.debezium.data.Xml";
pub const SOURCE_SCHEMA_NAME: &str = "io.debezium.connector.postgresql.Source";

/// A built schema. Immutable once interned.
pub type Schema = Value;

/// Builder for schema trees.
///
/// `build(clone(b)) == build(b)`: building never mutates the builder.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    schema_type: SchemaType,
    field_name: Option<String>,
    schema_name: Option<String>,
    version: Option<i32>,
    optional: bool,
    default_value: Option<Value>,
    parameters: Vec<(String, Value)>,
    fields: Vec<(String, SchemaBuilder)>,
    value_schema: Option<Box<SchemaBuilder>>,
    key_schema: Option<Box<SchemaBuilder>>,
}

impl SchemaBuilder {
    pub fn new(schema_type: SchemaType) -> Self {
        Self {
            schema_type,
            field_name: None,
            schema_name: None,
            version: None,
            optional: false,
            default_value: None,
            parameters: Vec::new(),
            fields: Vec::new(),
            value_schema: None,
            key_schema: None,
        }
    }

    pub fn int8() -> Self {
        Self::new(SchemaType::Int8)
    }

    pub fn int16() -> Self {
        Self::new(SchemaType::Int16)
    }

    pub fn int32() -> Self {
        Self::new(SchemaType::Int32)
    }

    pub fn int64() -> Self {
        Self::new(SchemaType::Int64)
    }

    pub fn float32() -> Self {
        Self::new(SchemaType::Float32)
    }

    pub fn float64() -> Self {
        Self::new(SchemaType::Float64)
    }

    pub fn boolean() -> Self {
        Self::new(SchemaType::Boolean)
    }

    pub fn string() -> Self {
        Self::new(SchemaType::String)
    }

    pub fn bytes() -> Self {
        Self::new(SchemaType::Bytes)
    }

    pub fn record() -> Self {
        Self::new(SchemaType::Struct)
    }

    pub fn array(element: SchemaBuilder) -> Self {
        let mut builder = Self::new(SchemaType::Array);
        builder.value_schema = Some(Box::new(element));
        builder
    }

    pub fn map(key: SchemaBuilder, value: SchemaBuilder) -> Self {
        let mut builder = Self::new(SchemaType::Map);
        builder.key_schema = Some(Box::new(key));
        builder.value_schema = Some(Box::new(value));
        builder
    }

    pub fn json() -> Self {
        Self::string().schema_name(JSON_SCHEMA_NAME).version(1)
    }

    pub fn uuid() -> Self {
        Self::string().schema_name(UUID_SCHEMA_NAME).version(1)
    }

    pub fn xml() -> Self {
        Self::string().schema_name(XML_SCHEMA_NAME).version(1)
    }

    pub fn ltree() -> Self {
        Self::string().schema_name(LTREE_SCHEMA_NAME).version(1)
    }

    pub fn bits(length: usize) -> Self {
        Self::string()
            .schema_name(BITS_SCHEMA_NAME)
            .version(1)
            .parameter("length", json!(length.to_string()))
    }

    pub fn enumeration(allowed: &[String]) -> Self {
        Self::string()
            .schema_name(ENUM_SCHEMA_NAME)
            .version(1)
            .parameter("allowed", json!(allowed.join(",")))
    }

    pub fn schema_type(&self) -> SchemaType {
        self.schema_type
    }

    pub fn field_name(mut self, name: impl Into<String>) -> Self {
        self.field_name = Some(name.into());
        self
    }

    pub fn schema_name(mut self, name: impl Into<String>) -> Self {
        self.schema_name = Some(name.into());
        self
    }

    pub fn version(mut self, version: i32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn set_optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.push((key.into(), value));
        self
    }

    /// Add a field. Keys are unique within a record: a repeated name
    /// replaces the earlier field in place.
    pub fn field(mut self, name: impl Into<String>, schema: SchemaBuilder) -> Self {
        let name = name.into();
        if let Some(existing) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            existing.1 = schema;
        } else {
            self.fields.push((name, schema));
        }
        self
    }

    /// Build the schema tree. The builder is untouched, so repeated and
    /// cloned builds yield identical values.
    pub fn build(&self) -> Schema {
        self.build_inner(None)
    }

    fn build_inner(&self, field_name: Option<&str>) -> Schema {
        let mut node = serde_json::Map::new();
        node.insert("type".into(), json!(self.schema_type.as_str()));
        node.insert("optional".into(), json!(self.optional));

        if let Some(name) = field_name.or(self.field_name.as_deref()) {
            node.insert("field".into(), json!(name));
        }
        if let Some(name) = &self.schema_name {
            node.insert("name".into(), json!(name));
        }
        if let Some(version) = self.version {
            node.insert("version".into(), json!(version));
        }
        if let Some(default) = &self.default_value {
            node.insert("default".into(), default.clone());
        }
        if !self.parameters.is_empty() {
            let params: serde_json::Map<String, Value> = self
                .parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            node.insert("parameters".into(), Value::Object(params));
        }

        match self.schema_type {
            SchemaType::Struct => {
                let fields: Vec<Value> = self
                    .fields
                    .iter()
                    .map(|(name, builder)| builder.build_inner(Some(name)))
                    .collect();
                node.insert("fields".into(), Value::Array(fields));
            }
            SchemaType::Array => {
                if let Some(value_schema) = &self.value_schema {
                    node.insert("items".into(), value_schema.build());
                }
            }
            SchemaType::Map => {
                if let Some(key_schema) = &self.key_schema {
                    node.insert("keys".into(), key_schema.build());
                }
                if let Some(value_schema) = &self.value_schema {
                    node.insert("values".into(), value_schema.build());
                }
            }
            _ => {}
        }

        Value::Object(node)
    }
}

/// Interns named record schemas. `get_or_create` invokes the creator at
/// most once per name.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: Mutex<HashMap<String, Arc<Schema>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, schema: Schema) {
        self.schemas.lock().insert(name.into(), Arc::new(schema));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Schema>> {
        self.schemas.lock().get(name).cloned()
    }

    pub fn get_or_create(
        &self,
        name: &str,
        creator: impl FnOnce() -> Schema,
    ) -> Arc<Schema> {
        let mut schemas = self.schemas.lock();
        if let Some(schema) = schemas.get(name) {
            return schema.clone();
        }
        let schema = Arc::new(creator());
        schemas.insert(name.to_string(), schema.clone());
        schema
    }

    /// Drop a hypertable's interned schemas when it leaves the mirror.
    pub fn unregister_prefix(&self, prefix: &str) {
        self.schemas.lock().retain(|name, _| !name.starts_with(prefix));
    }

    pub fn len(&self) -> usize {
        self.schemas.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.lock().is_empty()
    }
}

/// Topic naming strategy. The default mirrors Debezium's
/// `{prefix}.{schema}.{table}`.
pub trait TopicNamingStrategy: Send + Sync {
    /// Topic for a hypertable's change events.
    fn event_topic_name(&self, prefix: &str, schema: &str, table: &str) -> String;

    /// Topic for decoded logical messages (op `m`).
    fn message_topic_name(&self, prefix: &str) -> String;
}

/// Debezium-compatible naming.
#[derive(Debug, Default, Clone, Copy)]
pub struct DebeziumNamingStrategy;

impl TopicNamingStrategy for DebeziumNamingStrategy {
    fn event_topic_name(&self, prefix: &str, schema: &str, table: &str) -> String {
        format!("{prefix}.{schema}.{table}")
    }

    fn message_topic_name(&self, prefix: &str) -> String {
        format!("{prefix}.message")
    }
}

/// Computes topic and schema names for the registry and the emitter.
pub struct NameGenerator {
    prefix: String,
    strategy: Arc<dyn TopicNamingStrategy>,
}

impl NameGenerator {
    pub fn new(prefix: impl Into<String>, strategy: Arc<dyn TopicNamingStrategy>) -> Self {
        Self {
            prefix: prefix.into(),
            strategy,
        }
    }

    pub fn topic_prefix(&self) -> &str {
        &self.prefix
    }

    pub fn event_topic_name(&self, schema: &str, table: &str) -> String {
        self.strategy.event_topic_name(&self.prefix, schema, table)
    }

    pub fn message_topic_name(&self) -> String {
        self.strategy.message_topic_name(&self.prefix)
    }

    pub fn envelope_schema_name(&self, schema: &str, table: &str) -> String {
        format!("{}.Envelope", self.event_topic_name(schema, table))
    }

    pub fn key_schema_name(&self, schema: &str, table: &str) -> String {
        format!("{}.Key", self.event_topic_name(schema, table))
    }

    pub fn value_schema_name(&self, schema: &str, table: &str) -> String {
        format!("{}.Value", self.event_topic_name(schema, table))
    }

    pub fn message_envelope_schema_name(&self) -> String {
        format!("{}.Envelope", self.message_topic_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_clone_identity() {
        let builder = SchemaBuilder::record()
            .schema_name("public.metrics.Value")
            .field("id", SchemaBuilder::int64())
            .field("val", SchemaBuilder::float64().optional());

        assert_eq!(builder.clone().build(), builder.build());
    }

    #[test]
    fn test_record_fields_ordered() {
        let schema = SchemaBuilder::record()
            .field("b", SchemaBuilder::string())
            .field("a", SchemaBuilder::int32())
            .build();

        let fields = schema["fields"].as_array().unwrap();
        assert_eq!(fields[0]["field"], "b");
        assert_eq!(fields[1]["field"], "a");
    }

    #[test]
    fn test_repeated_field_replaces_in_place() {
        let schema = SchemaBuilder::record()
            .field("id", SchemaBuilder::int32())
            .field("name", SchemaBuilder::string())
            .field("id", SchemaBuilder::int64())
            .build();

        let fields = schema["fields"].as_array().unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0]["field"], "id");
        assert_eq!(fields[0]["type"], "int64");
    }

    #[test]
    fn test_array_schema() {
        let schema = SchemaBuilder::array(SchemaBuilder::int32().optional()).build();
        assert_eq!(schema["type"], "array");
        assert_eq!(schema["items"]["type"], "int32");
        assert_eq!(schema["items"]["optional"], true);
    }

    #[test]
    fn test_semantic_names() {
        let schema = SchemaBuilder::uuid().build();
        assert_eq!(schema["name"], UUID_SCHEMA_NAME);
        assert_eq!(schema["version"], 1);

        let schema = SchemaBuilder::bits(12).build();
        assert_eq!(schema["parameters"]["length"], "12");

        assert_eq!(LTREE_SCHEMA_NAME, "io.debezium.data.Ltree");
    }

    #[test]
    fn test_registry_get_or_create_once() {
        let registry = SchemaRegistry::new();
        let mut created = 0;

        for _ in 0..3 {
            registry.get_or_create("a.b.Value", || {
                created += 1;
                SchemaBuilder::record().build()
            });
        }

        assert_eq!(created, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("a.b.Value").is_some());
    }

    #[test]
    fn test_registry_unregister_prefix() {
        let registry = SchemaRegistry::new();
        registry.register("ts.public.metrics.Value", SchemaBuilder::record().build());
        registry.register("ts.public.metrics.Key", SchemaBuilder::record().build());
        registry.register("ts.public.other.Value", SchemaBuilder::record().build());

        registry.unregister_prefix("ts.public.metrics");
        assert_eq!(registry.len(), 1);
        assert!(registry.get("ts.public.other.Value").is_some());
    }

    #[test]
    fn test_name_generator() {
        let names = NameGenerator::new("ts", Arc::new(DebeziumNamingStrategy));
        assert_eq!(names.event_topic_name("public", "metrics"), "ts.public.metrics");
        assert_eq!(
            names.envelope_schema_name("public", "metrics"),
            "ts.public.metrics.Envelope"
        );
        assert_eq!(names.key_schema_name("public", "metrics"), "ts.public.metrics.Key");
        assert_eq!(names.message_topic_name(), "ts.message");
        assert_eq!(names.message_envelope_schema_name(), "ts.message.Envelope");
    }
}
