//! Sink plug point
//!
//! A sink receives `(topic, key, envelope)` triples. Built-in: stdout.
//! Additional back-ends register a factory by name through the
//! extension points at startup.

mod stdout;

pub use stdout::StdoutSink;

use crate::error::{Result, StreamerError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// A downstream event sink. Delivery is at-least-once; retries on
/// transient failures are the sink's own concern, and a returned error
/// is treated as permanent and fatal.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn emit(&self, topic: &str, key: Value, envelope: Value) -> Result<()>;
}

/// Factory building a sink from its configuration subtree.
pub type SinkFactory = fn(&serde_yaml::Value) -> Result<Box<dyn Sink>>;

/// Name-indexed sink factories. Compiled-in plug-ins add theirs through
/// [`crate::plugin::ExtensionPoints`].
pub struct SinkRegistry {
    factories: HashMap<String, SinkFactory>,
}

impl Default for SinkRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("stdout", |options| Ok(Box::new(StdoutSink::new(options)?)));
        registry
    }
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Returns false when the name was taken.
    pub fn register(&mut self, name: impl Into<String>, factory: SinkFactory) -> bool {
        use std::collections::hash_map::Entry;
        match self.factories.entry(name.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(factory);
                true
            }
        }
    }

    pub fn create(&self, kind: &str, options: &serde_yaml::Value) -> Result<Box<dyn Sink>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| StreamerError::config(format!("unknown sink type {kind:?}")))?;
        factory(options)
    }

    pub fn known_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Holds the configured sinks and fans every event out to all of them.
pub struct SinkManager {
    sinks: Vec<Box<dyn Sink>>,
}

impl SinkManager {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub async fn start(&self) -> Result<()> {
        for sink in &self.sinks {
            sink.start().await?;
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        for sink in &self.sinks {
            sink.stop().await?;
        }
        Ok(())
    }

    /// Offer the event to every sink, synchronously and in order. The
    /// first permanent failure aborts the pipeline.
    pub async fn emit(&self, topic: &str, key: &Value, envelope: &Value) -> Result<()> {
        for sink in &self.sinks {
            sink.emit(topic, key.clone(), envelope.clone())
                .await
                .map_err(|e| {
                    StreamerError::sink(format!("sink {} failed permanently: {e}", sink.name()))
                })?;
        }
        debug!("emitted to {} sink(s) on {topic}", self.sinks.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    pub(crate) struct RecordingSink {
        pub emitted: Arc<Mutex<Vec<(String, Value, Value)>>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn emit(&self, topic: &str, key: Value, envelope: Value) -> Result<()> {
            if self.fail {
                return Err(StreamerError::sink("broker unreachable"));
            }
            self.emitted.lock().push((topic.to_string(), key, envelope));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_manager_offers_to_every_sink() {
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let manager = SinkManager::new(vec![
            Box::new(RecordingSink {
                emitted: seen_a.clone(),
                fail: false,
            }),
            Box::new(RecordingSink {
                emitted: seen_b.clone(),
                fail: false,
            }),
        ]);

        manager
            .emit(
                "ts.public.metrics",
                &serde_json::json!({"id": 1}),
                &serde_json::json!({"payload": {"op": "c"}}),
            )
            .await
            .unwrap();

        assert_eq!(seen_a.lock().len(), 1);
        assert_eq!(seen_b.lock().len(), 1);
        assert_eq!(seen_a.lock()[0].0, "ts.public.metrics");
    }

    #[tokio::test]
    async fn test_manager_sink_failure_is_fatal() {
        let manager = SinkManager::new(vec![Box::new(RecordingSink {
            emitted: Arc::new(Mutex::new(Vec::new())),
            fail: true,
        })]);

        let err = manager
            .emit("t", &Value::Null, &Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamerError::Sink(_)));
    }

    #[test]
    fn test_registry_create_and_unknown() {
        let registry = SinkRegistry::new();
        assert!(registry.create("stdout", &serde_yaml::Value::Null).is_ok());
        assert!(registry.create("kafka", &serde_yaml::Value::Null).is_err());
        assert_eq!(registry.known_kinds(), vec!["stdout"]);
    }

    #[test]
    fn test_registry_rejects_duplicate_names() {
        let mut registry = SinkRegistry::new();
        assert!(!registry.register("stdout", |_| Err(StreamerError::config("shadowed"))));
        assert!(registry.register("custom", |_| Err(StreamerError::config("todo"))));
    }
}
