//! Envelope assembly and delivery
//!
//! The emitter is the dispatcher's record handler: it turns resolved
//! change events into Debezium-style `{schema, payload}` key and value
//! envelopes, interning the schemas per hypertable, and offers them to
//! the configured sinks.

use crate::catalog::{Hypertable, ResolvedRelation, SystemCatalog};
use crate::context::SchemaManager;
use crate::dispatch::RecordHandler;
use crate::error::Result;
use crate::event::{ChangeEvent, MessageEvent};
use crate::schema::{SchemaBuilder, SOURCE_SCHEMA_NAME};
use crate::sink::SinkManager;
use crate::typeres::TypeResolver;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

pub struct EventEmitter {
    schema_manager: Arc<SchemaManager>,
    catalog: Arc<SystemCatalog>,
    types: Arc<TypeResolver>,
    sinks: Arc<SinkManager>,
}

impl EventEmitter {
    pub fn new(
        schema_manager: Arc<SchemaManager>,
        catalog: Arc<SystemCatalog>,
        types: Arc<TypeResolver>,
        sinks: Arc<SinkManager>,
    ) -> Self {
        Self {
            schema_manager,
            catalog,
            types,
            sinks,
        }
    }

    /// The shared source-block schema.
    fn source_schema() -> SchemaBuilder {
        SchemaBuilder::record()
            .schema_name(SOURCE_SCHEMA_NAME)
            .version(1)
            .field("system", SchemaBuilder::string())
            .field("database", SchemaBuilder::string())
            .field("schema", SchemaBuilder::string())
            .field("table", SchemaBuilder::string())
            .field("ts_ms", SchemaBuilder::int64())
            .field("lsn", SchemaBuilder::string())
            .field("tx_id", SchemaBuilder::int64().optional())
            .field("slot", SchemaBuilder::string())
            .field("snapshot", SchemaBuilder::boolean())
    }

    /// Row schema of a hypertable, one field per column.
    async fn value_schema(&self, hypertable: &Hypertable) -> Result<SchemaBuilder> {
        let mut builder = SchemaBuilder::record();
        for column in &hypertable.columns {
            let field = self
                .types
                .schema_builder(column.oid)
                .await?
                .set_optional(column.nullable);
            builder = builder.field(&column.name, field);
        }
        Ok(builder)
    }

    async fn envelope_for(
        &self,
        hypertable: &Hypertable,
    ) -> Result<(Arc<Value>, Arc<Value>, Vec<String>)> {
        let names = self.schema_manager.names().clone();
        let registry = self.schema_manager.registry().clone();
        let surface = hypertable.surface_ref();

        let key_name = names.key_schema_name(&surface.schema, &surface.name);
        let value_name = names.value_schema_name(&surface.schema, &surface.name);
        let envelope_name = names.envelope_schema_name(&surface.schema, &surface.name);

        let key_columns = hypertable.key_columns();

        // the emitter runs on the single dispatcher task, so building
        // outside the interning call cannot double-build
        let (key_schema, envelope_schema) = match (registry.get(&key_name), registry.get(&envelope_name))
        {
            (Some(key), Some(envelope)) => (key, envelope),
            _ => {
                let mut key_builder = SchemaBuilder::record().schema_name(&key_name);
                for column in hypertable.columns.iter().filter(|c| c.is_primary_key) {
                    let field = self.types.schema_builder(column.oid).await?;
                    key_builder = key_builder.field(&column.name, field);
                }

                let value_builder = self
                    .value_schema(hypertable)
                    .await?
                    .schema_name(&value_name);
                registry.get_or_create(&value_name, || value_builder.clone().build());

                let envelope_builder = SchemaBuilder::record()
                    .schema_name(&envelope_name)
                    .field("before", value_builder.clone().optional())
                    .field("after", value_builder.optional())
                    .field("source", Self::source_schema())
                    .field("op", SchemaBuilder::string())
                    .field("ts_ms", SchemaBuilder::int64())
                    .field(
                        "transaction",
                        SchemaBuilder::record()
                            .optional()
                            .field("id", SchemaBuilder::int64())
                            .field("sequence", SchemaBuilder::int64()),
                    );

                let key = registry.get_or_create(&key_name, || key_builder.build());
                let envelope = registry.get_or_create(&envelope_name, || envelope_builder.build());
                (key, envelope)
            }
        };

        Ok((key_schema, envelope_schema, key_columns))
    }

    fn source_payload(event: &ChangeEvent) -> Value {
        json!({
            "system": event.source.system,
            "database": event.source.database,
            "schema": event.source.schema,
            "table": event.source.table,
            "ts_ms": event.source.ts_ms,
            "lsn": event.source.lsn.to_string(),
            "tx_id": event.source.tx_id,
            "slot": event.source.slot,
            "snapshot": event.source.snapshot,
        })
    }

    fn hypertable_of(&self, event: &ChangeEvent) -> Option<Hypertable> {
        match self
            .catalog
            .resolve_relation(&event.relation_schema, &event.relation_table)
        {
            ResolvedRelation::Chunk { hypertable_id, .. }
            | ResolvedRelation::Hypertable { hypertable_id } => {
                self.catalog.hypertable(hypertable_id)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl RecordHandler for EventEmitter {
    async fn on_change(&self, event: &ChangeEvent) -> Result<()> {
        let names = self.schema_manager.names().clone();
        let topic = names.event_topic_name(&event.source.schema, &event.source.table);

        let (key, envelope) = match self.hypertable_of(event) {
            Some(hypertable) => {
                let (key_schema, envelope_schema, key_columns) =
                    self.envelope_for(&hypertable).await?;
                let key = json!({
                    "schema": key_schema.as_ref(),
                    "payload": Value::Object(event.key_values(&key_columns)),
                });
                let envelope = json!({
                    "schema": envelope_schema.as_ref(),
                    "payload": {
                        "before": event.before,
                        "after": event.after,
                        "source": Self::source_payload(event),
                        "op": event.op.as_str(),
                        "ts_ms": chrono::Utc::now().timestamp_millis(),
                        "transaction": event.transaction,
                    },
                });
                (key, envelope)
            }
            None => {
                // the hypertable left the mirror while events were in
                // flight; deliver schemaless rather than dropping
                debug!(
                    "no mirrored hypertable for {}.{}, emitting schemaless",
                    event.relation_schema, event.relation_table
                );
                let key = json!({ "schema": Value::Null, "payload": {} });
                let envelope = json!({
                    "schema": Value::Null,
                    "payload": {
                        "before": event.before,
                        "after": event.after,
                        "source": Self::source_payload(event),
                        "op": event.op.as_str(),
                        "ts_ms": chrono::Utc::now().timestamp_millis(),
                        "transaction": event.transaction,
                    },
                });
                (key, envelope)
            }
        };

        self.sinks.emit(&topic, &key, &envelope).await
    }

    async fn on_message(&self, event: &MessageEvent) -> Result<()> {
        let names = self.schema_manager.names().clone();
        let registry = self.schema_manager.registry().clone();
        let topic = names.message_topic_name();
        let envelope_name = names.message_envelope_schema_name();

        let schema = registry.get_or_create(&envelope_name, || {
            SchemaBuilder::record()
                .schema_name(&envelope_name)
                .field("op", SchemaBuilder::string())
                .field("ts_ms", SchemaBuilder::int64())
                .field(
                    "message",
                    SchemaBuilder::record()
                        .field("prefix", SchemaBuilder::string())
                        .field("content", SchemaBuilder::string()),
                )
                .build()
        });

        let key = json!({
            "schema": Value::Null,
            "payload": { "prefix": event.prefix },
        });
        let envelope = json!({
            "schema": schema.as_ref(),
            "payload": {
                "op": "m",
                "ts_ms": event.ts_ms,
                "message": {
                    "prefix": event.prefix,
                    "content": event.content,
                },
            },
        });

        self.sinks.emit(&topic, &key, &envelope).await
    }
}
