//! File-backed state storage
//!
//! One JSON document holding the offset map and the opaque named states.
//! Writes go to a temp file which is fsynced and renamed over the
//! target, so a crash mid-write never exposes a partial document.

use super::{Offset, StateStorage};
use crate::error::{Result, StreamerError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default)]
    offsets: HashMap<String, Offset>,
    /// Opaque component state, hex-encoded for a readable document
    #[serde(default)]
    state: HashMap<String, String>,
}

/// File-backed [`StateStorage`].
pub struct FileStateStorage {
    path: PathBuf,
    document: Mutex<StateDocument>,
}

impl FileStateStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            document: Mutex::new(StateDocument::default()),
        }
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }
}

#[async_trait]
impl StateStorage for FileStateStorage {
    async fn start(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let encoded = {
            let document = self.document.lock();
            serde_json::to_vec_pretty(&*document)?
        };

        let temp_path = self.temp_path();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(&encoded).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        debug!("state persisted to {}", self.path.display());
        Ok(())
    }

    async fn load(&self) -> Result<()> {
        match fs::read(&self.path).await {
            Ok(raw) => {
                let document: StateDocument = serde_json::from_slice(&raw).map_err(|e| {
                    StreamerError::state_store(format!(
                        "corrupt state file {}: {e}",
                        self.path.display()
                    ))
                })?;
                info!(
                    "loaded {} offset(s) from {}",
                    document.offsets.len(),
                    self.path.display()
                );
                *self.document.lock() = document;
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self) -> Result<HashMap<String, Offset>> {
        Ok(self.document.lock().offsets.clone())
    }

    async fn set(&self, key: &str, offset: Offset) -> Result<()> {
        self.document.lock().offsets.insert(key.to_string(), offset);
        Ok(())
    }

    async fn set_encoded_state(&self, name: &str, state: Vec<u8>) -> Result<()> {
        self.document
            .lock()
            .state
            .insert(name.to_string(), hex::encode(state));
        Ok(())
    }

    async fn encoded_state(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.document.lock().state.get(name) {
            Some(encoded) => {
                let raw = hex::decode(encoded)
                    .map_err(|e| StreamerError::state_store(format!("state {name:?}: {e}")))?;
                Ok(Some(raw))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pgtypes::Lsn;
    use chrono::Utc;

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");

        let storage = FileStateStorage::new(&path);
        storage.start().await.unwrap();
        storage
            .set("slot_a", Offset::new(Lsn(0xABCD), Utc::now()))
            .await
            .unwrap();
        storage
            .set_encoded_state("snapshotContext", br#"{"done":true}"#.to_vec())
            .await
            .unwrap();
        storage.save().await.unwrap();

        // fresh instance simulates a restart
        let restarted = FileStateStorage::new(&path);
        restarted.start().await.unwrap();
        restarted.load().await.unwrap();

        let offsets = restarted.get().await.unwrap();
        assert_eq!(offsets.get("slot_a").map(|o| o.lsn), Some(Lsn(0xABCD)));
        assert_eq!(
            restarted.encoded_state("snapshotContext").await.unwrap(),
            Some(br#"{"done":true}"#.to_vec())
        );
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStateStorage::new(dir.path().join("nothing.json"));
        storage.start().await.unwrap();
        storage.load().await.unwrap();
        assert!(storage.get().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let storage = FileStateStorage::new(&path);
        storage.start().await.unwrap();
        assert!(storage.load().await.is_err());
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");

        let storage = FileStateStorage::new(&path);
        storage.start().await.unwrap();
        storage
            .set("slot", Offset::new(Lsn(1), Utc::now()))
            .await
            .unwrap();
        storage.save().await.unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
