//! Offset and component state persistence
//!
//! Replication offsets and opaque per-component state survive restarts
//! through a [`StateStorage`] back-end. Mutations only touch the
//! in-memory view; a single writer inside [`StateManager`] flushes on an
//! interval and on stop, so the persisted `lastProcessed` can trail the
//! in-memory value but never lead it.

mod file;

pub use file::FileStateStorage;

use crate::error::{Result, StreamerError};
use crate::pgtypes::Lsn;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default interval between background flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// A persisted replication position, keyed by slot name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offset {
    pub lsn: Lsn,
    pub timestamp: DateTime<Utc>,
    /// True while the offset belongs to a snapshot in progress
    #[serde(default)]
    pub snapshot: bool,
}

impl Offset {
    pub fn new(lsn: Lsn, timestamp: DateTime<Utc>) -> Self {
        Self {
            lsn,
            timestamp,
            snapshot: false,
        }
    }
}

/// Storage back-end plug point.
///
/// `set`/`set_encoded_state` mutate the in-memory view; `save` makes the
/// view durable. Back-ends must make `save` atomic: a crashed write can
/// never leave a partial document behind.
#[async_trait]
pub trait StateStorage: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn save(&self) -> Result<()>;
    async fn load(&self) -> Result<()>;

    async fn get(&self) -> Result<HashMap<String, Offset>>;
    async fn set(&self, key: &str, offset: Offset) -> Result<()>;

    async fn set_encoded_state(&self, name: &str, state: Vec<u8>) -> Result<()>;
    async fn encoded_state(&self, name: &str) -> Result<Option<Vec<u8>>>;
}

/// In-memory back-end for the `none` storage kind; state does not
/// survive a restart.
#[derive(Default)]
pub struct MemoryStateStorage {
    offsets: Mutex<HashMap<String, Offset>>,
    state: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStateStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStorage for MemoryStateStorage {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        Ok(())
    }

    async fn load(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self) -> Result<HashMap<String, Offset>> {
        Ok(self.offsets.lock().clone())
    }

    async fn set(&self, key: &str, offset: Offset) -> Result<()> {
        self.offsets.lock().insert(key.to_string(), offset);
        Ok(())
    }

    async fn set_encoded_state(&self, name: &str, state: Vec<u8>) -> Result<()> {
        self.state.lock().insert(name.to_string(), state);
        Ok(())
    }

    async fn encoded_state(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().get(name).cloned())
    }
}

/// Serialises writes to the back-end through one flusher task.
pub struct StateManager {
    storage: Arc<dyn StateStorage>,
    flush_interval: Duration,
    dirty: Arc<Mutex<bool>>,
    flusher: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: Mutex<Option<tokio::sync::watch::Sender<bool>>>,
}

impl StateManager {
    pub fn new(storage: Arc<dyn StateStorage>) -> Self {
        Self::with_flush_interval(storage, DEFAULT_FLUSH_INTERVAL)
    }

    pub fn with_flush_interval(storage: Arc<dyn StateStorage>, flush_interval: Duration) -> Self {
        Self {
            storage,
            flush_interval,
            dirty: Arc::new(Mutex::new(false)),
            flusher: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    /// Load persisted state and start the flusher.
    pub async fn start(&self) -> Result<()> {
        self.storage.start().await?;
        self.storage.load().await?;

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        *self.shutdown.lock() = Some(shutdown_tx);

        let storage = self.storage.clone();
        let dirty = self.dirty.clone();
        let interval = self.flush_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let should_flush = {
                            let mut dirty = dirty.lock();
                            std::mem::take(&mut *dirty)
                        };
                        if should_flush {
                            if let Err(err) = storage.save().await {
                                warn!("state flush failed, will retry: {err}");
                                *dirty.lock() = true;
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("state flusher stopped");
        });
        *self.flusher.lock() = Some(handle);

        Ok(())
    }

    /// Flush outstanding writes and stop. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let shutdown = self.shutdown.lock().take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        let flusher = self.flusher.lock().take();
        if let Some(flusher) = flusher {
            let _ = flusher.await;
        }

        self.storage.save().await?;
        self.storage.stop().await
    }

    pub async fn get(&self) -> Result<HashMap<String, Offset>> {
        self.storage.get().await
    }

    pub async fn offset(&self, slot: &str) -> Result<Option<Offset>> {
        Ok(self.storage.get().await?.get(slot).cloned())
    }

    /// Queue an offset write; the flusher makes it durable.
    pub async fn set(&self, slot: &str, offset: Offset) -> Result<()> {
        self.storage.set(slot, offset).await?;
        *self.dirty.lock() = true;
        Ok(())
    }

    /// Persist a named component state via serde.
    pub async fn state_encoder<T: Serialize + Sync>(&self, name: &str, state: &T) -> Result<()> {
        let encoded = serde_json::to_vec(state)?;
        self.set_encoded_state(name, encoded).await
    }

    /// Load a named component state. `Ok(None)` when absent.
    pub async fn state_decoder<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.storage.encoded_state(name).await? {
            Some(encoded) => {
                let decoded = serde_json::from_slice(&encoded)
                    .map_err(|e| StreamerError::state_store(format!("state {name:?}: {e}")))?;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    pub async fn set_encoded_state(&self, name: &str, state: Vec<u8>) -> Result<()> {
        self.storage.set_encoded_state(name, state).await?;
        *self.dirty.lock() = true;
        Ok(())
    }

    pub async fn encoded_state(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.storage.encoded_state(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_roundtrip() {
        let storage = MemoryStateStorage::new();
        let offset = Offset::new(Lsn(0x500), Utc::now());

        storage.set("slot_a", offset.clone()).await.unwrap();
        let offsets = storage.get().await.unwrap();
        assert_eq!(offsets.get("slot_a"), Some(&offset));

        storage
            .set_encoded_state("snapshotContext", b"{}".to_vec())
            .await
            .unwrap();
        assert_eq!(
            storage.encoded_state("snapshotContext").await.unwrap(),
            Some(b"{}".to_vec())
        );
        assert_eq!(storage.encoded_state("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_manager_typed_state() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Progress {
            done: Vec<String>,
        }

        let manager = StateManager::new(Arc::new(MemoryStateStorage::new()));
        manager.start().await.unwrap();

        let progress = Progress {
            done: vec!["public.metrics".to_string()],
        };
        manager.state_encoder("progress", &progress).await.unwrap();
        assert_eq!(
            manager.state_decoder::<Progress>("progress").await.unwrap(),
            Some(progress)
        );
        assert_eq!(manager.state_decoder::<Progress>("nope").await.unwrap(), None);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_manager_set_marks_dirty_and_stop_flushes() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingStorage {
            inner: MemoryStateStorage,
            saves: AtomicUsize,
        }

        #[async_trait]
        impl StateStorage for CountingStorage {
            async fn start(&self) -> Result<()> {
                Ok(())
            }
            async fn stop(&self) -> Result<()> {
                Ok(())
            }
            async fn save(&self) -> Result<()> {
                self.saves.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            async fn load(&self) -> Result<()> {
                Ok(())
            }
            async fn get(&self) -> Result<HashMap<String, Offset>> {
                self.inner.get().await
            }
            async fn set(&self, key: &str, offset: Offset) -> Result<()> {
                self.inner.set(key, offset).await
            }
            async fn set_encoded_state(&self, name: &str, state: Vec<u8>) -> Result<()> {
                self.inner.set_encoded_state(name, state).await
            }
            async fn encoded_state(&self, name: &str) -> Result<Option<Vec<u8>>> {
                self.inner.encoded_state(name).await
            }
        }

        let storage = Arc::new(CountingStorage {
            inner: MemoryStateStorage::new(),
            saves: AtomicUsize::new(0),
        });
        let manager =
            StateManager::with_flush_interval(storage.clone(), Duration::from_secs(3600));
        manager.start().await.unwrap();

        manager
            .set("slot", Offset::new(Lsn(1), Utc::now()))
            .await
            .unwrap();
        manager.stop().await.unwrap();

        // interval never fired; stop performed the flush
        assert!(storage.saves.load(Ordering::SeqCst) >= 1);
        assert_eq!(
            manager.offset("slot").await.unwrap().map(|o| o.lsn),
            Some(Lsn(1))
        );
    }
}
