//! Static plug-in registration
//!
//! Plug-ins are compiled-in modules exposing a `plugin_initialize`
//! function; the binary calls each one with the extension points before
//! the streamer is built. Registration is by name, first wins.

use crate::error::Result;
use crate::schema::TopicNamingStrategy;
use crate::sink::{SinkFactory, SinkRegistry};
use crate::state::StateStorage;
use std::collections::HashMap;
use std::sync::Arc;

/// Factory building a state storage back-end from its configuration.
pub type StateStorageFactory =
    fn(&crate::config::StateStorageConfig) -> Result<Arc<dyn StateStorage>>;

/// Factory building a naming strategy.
pub type NamingStrategyFactory = fn() -> Arc<dyn TopicNamingStrategy>;

/// Entry point a compiled-in plug-in exposes.
pub type PluginInitialize = fn(&mut ExtensionPoints) -> Result<()>;

/// Registration surface handed to plug-ins.
pub struct ExtensionPoints {
    sinks: SinkRegistry,
    state_storages: HashMap<String, StateStorageFactory>,
    naming_strategies: HashMap<String, NamingStrategyFactory>,
}

impl Default for ExtensionPoints {
    fn default() -> Self {
        let mut points = Self {
            sinks: SinkRegistry::new(),
            state_storages: HashMap::new(),
            naming_strategies: HashMap::new(),
        };
        points.register_state_storage("none", |_config| {
            Ok(Arc::new(crate::state::MemoryStateStorage::new()))
        });
        points.register_state_storage("file", |config| {
            Ok(Arc::new(crate::state::FileStateStorage::new(
                &config.file.path,
            )))
        });
        points.register_naming_strategy("debezium", || {
            Arc::new(crate::schema::DebeziumNamingStrategy)
        });
        points
    }
}

impl ExtensionPoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run each plug-in's initializer.
    pub fn load(&mut self, plugins: &[PluginInitialize]) -> Result<()> {
        for initialize in plugins {
            initialize(self)?;
        }
        Ok(())
    }

    pub fn register_sink(&mut self, name: impl Into<String>, factory: SinkFactory) -> bool {
        self.sinks.register(name, factory)
    }

    pub fn register_state_storage(
        &mut self,
        name: impl Into<String>,
        factory: StateStorageFactory,
    ) -> bool {
        use std::collections::hash_map::Entry;
        match self.state_storages.entry(name.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(factory);
                true
            }
        }
    }

    pub fn register_naming_strategy(
        &mut self,
        name: impl Into<String>,
        factory: NamingStrategyFactory,
    ) -> bool {
        use std::collections::hash_map::Entry;
        match self.naming_strategies.entry(name.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(factory);
                true
            }
        }
    }

    pub fn sinks(&self) -> &SinkRegistry {
        &self.sinks
    }

    pub fn create_state_storage(
        &self,
        config: &crate::config::StateStorageConfig,
    ) -> Result<Arc<dyn StateStorage>> {
        let factory = self.state_storages.get(&config.kind).ok_or_else(|| {
            crate::error::StreamerError::config(format!(
                "unknown state storage type {:?}",
                config.kind
            ))
        })?;
        factory(config)
    }

    pub fn create_naming_strategy(&self, name: &str) -> Result<Arc<dyn TopicNamingStrategy>> {
        let factory = self.naming_strategies.get(name).ok_or_else(|| {
            crate::error::StreamerError::config(format!("unknown naming strategy {name:?}"))
        })?;
        Ok(factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_builtin_registrations() {
        let points = ExtensionPoints::new();
        let config = Config::from_yaml("").unwrap();

        assert!(points.create_state_storage(&config.statestorage).is_ok());
        assert!(points.create_naming_strategy("debezium").is_ok());
        assert!(points.create_naming_strategy("custom").is_err());
        assert_eq!(points.sinks().known_kinds(), vec!["stdout"]);
    }

    #[test]
    fn test_plugin_load_registers_by_name() {
        fn init(points: &mut ExtensionPoints) -> Result<()> {
            assert!(points.register_naming_strategy("flat", || {
                #[derive(Debug)]
                struct Flat;
                impl TopicNamingStrategy for Flat {
                    fn event_topic_name(&self, prefix: &str, _schema: &str, table: &str) -> String {
                        format!("{prefix}-{table}")
                    }
                    fn message_topic_name(&self, prefix: &str) -> String {
                        format!("{prefix}-message")
                    }
                }
                Arc::new(Flat)
            }));
            Ok(())
        }

        let mut points = ExtensionPoints::new();
        points.load(&[init]).unwrap();

        let strategy = points.create_naming_strategy("flat").unwrap();
        assert_eq!(strategy.event_topic_name("ts", "public", "metrics"), "ts-metrics");

        // duplicate registration is rejected
        assert!(!points.register_naming_strategy("flat", || {
            Arc::new(crate::schema::DebeziumNamingStrategy)
        }));
    }

    #[test]
    fn test_file_storage_requires_path_at_validate_time() {
        let config = Config::from_yaml(
            "statestorage:\n  type: file\n  file:\n    path: /tmp/tidestream-offsets.json\n",
        )
        .unwrap();
        let points = ExtensionPoints::new();
        assert!(points.create_state_storage(&config.statestorage).is_ok());
    }
}
