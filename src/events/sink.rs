use std::sync::Mutex;

use anyhow::{anyhow, Result};
use serde_json::Value;

/// Destination for published payloads.
///
/// Implementations are called from the pipeline thread and the expiry sweeper
/// concurrently.
pub trait EventSink: Send + Sync {
    fn publish(&self, topic: &str, payload: &Value) -> Result<()>;
}

/// One recorded publish.
#[derive(Clone, Debug, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Value,
}

/// Sink that keeps every publish in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    published: Mutex<Vec<Published>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Published> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.published().into_iter().map(|p| p.topic).collect()
    }

    /// Publishes whose topic starts with `prefix`.
    pub fn with_prefix(&self, prefix: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.topic.starts_with(prefix))
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut published) = self.published.lock() {
            published.clear();
        }
    }
}

impl EventSink for MemorySink {
    fn publish(&self, topic: &str, payload: &Value) -> Result<()> {
        let mut published = self
            .published
            .lock()
            .map_err(|_| anyhow!("memory sink lock poisoned"))?;
        published.push(Published {
            topic: topic.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

/// Sink that writes each publish to the log. Used for dry runs.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, topic: &str, payload: &Value) -> Result<()> {
        log::info!("{} {}", topic, payload);
        Ok(())
    }
}
