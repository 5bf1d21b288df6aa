//! Stdout sink: one JSON line per event

use super::Sink;
use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct StdoutSinkOptions {
    /// Pretty-print instead of one line per event
    pretty: bool,
}

/// Writes events to standard output, mainly for smoke tests and local
/// development.
pub struct StdoutSink {
    pretty: bool,
}

impl StdoutSink {
    pub fn new(options: &serde_yaml::Value) -> Result<Self> {
        let options: StdoutSinkOptions = match options {
            serde_yaml::Value::Null => StdoutSinkOptions::default(),
            other => serde_yaml::from_value(other.clone())
                .map_err(|e| crate::error::StreamerError::config(format!("stdout sink: {e}")))?,
        };
        Ok(Self {
            pretty: options.pretty,
        })
    }
}

#[async_trait]
impl Sink for StdoutSink {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn emit(&self, topic: &str, key: Value, envelope: Value) -> Result<()> {
        let line = json!({
            "topic": topic,
            "key": key,
            "envelope": envelope,
        });
        if self.pretty {
            println!("{}", serde_json::to_string_pretty(&line)?);
        } else {
            println!("{line}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stdout_sink_accepts_events() {
        let sink = StdoutSink::new(&serde_yaml::Value::Null).unwrap();
        sink.emit("t", json!({"id": 1}), json!({"payload": {}}))
            .await
            .unwrap();
    }

    #[test]
    fn test_options_parse() {
        let options: serde_yaml::Value = serde_yaml::from_str("pretty: true").unwrap();
        let sink = StdoutSink::new(&options).unwrap();
        assert!(sink.pretty);

        let bad: serde_yaml::Value = serde_yaml::from_str("pretty: sometimes").unwrap();
        assert!(StdoutSink::new(&bad).is_err());
    }
}
