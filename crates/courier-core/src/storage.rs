//! Persistence of ARQ and reassembly state.
//!
//! The session mirrors three kinds of records into a [`Storage`] backend so a
//! restarted client does not lose progress:
//! - ingress fragments of partially received messages
//! - egress records of blocks handed to the transport
//! - SURB key records of in-flight transmissions
//!
//! Two backends are provided: [`MemoryStorage`] and the JSON-file backed
//! [`FileStorage`].

use crate::ids::{MessageId, SurbId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

/// Storage errors
#[derive(Debug, Error, Clone)]
pub enum StorageError {
    /// Underlying I/O failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Record could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Everything needed to (re)send one outbound block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressRecord {
    /// Owning message
    pub message_id: MessageId,
    /// Index within the message
    pub block_id: u16,
    /// Number of blocks in the message
    pub total_blocks: u16,
    /// Recipient account
    pub recipient: String,
    /// Recipient provider
    pub provider: String,
    /// Automatic retransmission enabled
    pub reliable: bool,
    /// Sealed block
    pub payload: Vec<u8>,
    /// SURB of the most recent transmission, `None` before the first
    pub surb_id: Option<SurbId>,
    /// Unix time (seconds) after which the record may be discarded
    pub expiration: Option<u64>,
}

/// SURB decryption keys of one in-flight transmission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurbKeyRecord {
    /// SURB identifier
    pub surb_id: SurbId,
    /// Message the SURB belongs to
    pub message_id: MessageId,
    /// Block the SURB belongs to
    pub block_id: u16,
    /// Raw key material returned by the transport
    pub keys: Vec<u8>,
}

/// Storage collaborator used for crash recovery
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stored fragments for a message (serialized `IngressFragment`s)
    async fn get_fragments(&self, message_id: &MessageId) -> Result<Vec<Vec<u8>>, StorageError>;

    /// Append a fragment for a message
    async fn put_fragment(&self, message_id: &MessageId, raw: Vec<u8>)
    -> Result<(), StorageError>;

    /// Discard all fragments of a message
    async fn remove_fragments(&self, message_id: &MessageId) -> Result<(), StorageError>;

    /// Insert or replace an egress record
    async fn put_egress(&self, record: &EgressRecord) -> Result<(), StorageError>;

    /// Discard all egress records of a message
    async fn remove_egress(&self, message_id: &MessageId) -> Result<(), StorageError>;

    /// All egress records
    async fn egress_records(&self) -> Result<Vec<EgressRecord>, StorageError>;

    /// Record the keys of a new SURB
    async fn add_surb_keys(&self, record: &SurbKeyRecord) -> Result<(), StorageError>;

    /// Forget the keys of a consumed or superseded SURB
    async fn remove_surb_keys(&self, surb_id: &SurbId) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    fragments: HashMap<MessageId, Vec<Vec<u8>>>,
    egress: HashMap<(MessageId, u16), EgressRecord>,
    surbs: HashMap<SurbId, SurbKeyRecord>,
}

/// In-memory storage
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStorage {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of SURB key records held
    pub async fn surb_count(&self) -> usize {
        self.state.read().await.surbs.len()
    }

    /// Number of messages with buffered fragments
    pub async fn partial_messages(&self) -> usize {
        self.state.read().await.fragments.len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_fragments(&self, message_id: &MessageId) -> Result<Vec<Vec<u8>>, StorageError> {
        Ok(self
            .state
            .read()
            .await
            .fragments
            .get(message_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_fragment(
        &self,
        message_id: &MessageId,
        raw: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.state
            .write()
            .await
            .fragments
            .entry(*message_id)
            .or_default()
            .push(raw);
        Ok(())
    }

    async fn remove_fragments(&self, message_id: &MessageId) -> Result<(), StorageError> {
        self.state.write().await.fragments.remove(message_id);
        Ok(())
    }

    async fn put_egress(&self, record: &EgressRecord) -> Result<(), StorageError> {
        self.state
            .write()
            .await
            .egress
            .insert((record.message_id, record.block_id), record.clone());
        Ok(())
    }

    async fn remove_egress(&self, message_id: &MessageId) -> Result<(), StorageError> {
        self.state
            .write()
            .await
            .egress
            .retain(|(id, _), _| id != message_id);
        Ok(())
    }

    async fn egress_records(&self) -> Result<Vec<EgressRecord>, StorageError> {
        Ok(self.state.read().await.egress.values().cloned().collect())
    }

    async fn add_surb_keys(&self, record: &SurbKeyRecord) -> Result<(), StorageError> {
        self.state
            .write()
            .await
            .surbs
            .insert(record.surb_id, record.clone());
        Ok(())
    }

    async fn remove_surb_keys(&self, surb_id: &SurbId) -> Result<(), StorageError> {
        self.state.write().await.surbs.remove(surb_id);
        Ok(())
    }
}

/// Stored fragments of one message, as written to disk
#[derive(Debug, Default, Serialize, Deserialize)]
struct FragmentFile {
    fragments: Vec<String>,
}

/// JSON-file storage
///
/// ```text
/// <root>/ingress/<message id>.json
/// <root>/egress/<message id>-<block id>.json
/// <root>/surbs/<surb id>.json
/// ```
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Open (and create) a storage directory
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        for sub in ["ingress", "egress", "surbs"] {
            fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(Self { root })
    }

    fn ingress_path(&self, message_id: &MessageId) -> PathBuf {
        self.root
            .join("ingress")
            .join(format!("{}.json", message_id.to_hex()))
    }

    fn egress_path(&self, message_id: &MessageId, block_id: u16) -> PathBuf {
        self.root
            .join("egress")
            .join(format!("{}-{}.json", message_id.to_hex(), block_id))
    }

    fn surb_path(&self, surb_id: &SurbId) -> PathBuf {
        self.root
            .join("surbs")
            .join(format!("{}.json", surb_id.to_hex()))
    }

    async fn read_fragment_file(&self, path: &Path) -> Result<FragmentFile, StorageError> {
        if !fs::try_exists(path).await? {
            return Ok(FragmentFile::default());
        }
        let json = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get_fragments(&self, message_id: &MessageId) -> Result<Vec<Vec<u8>>, StorageError> {
        let file = self
            .read_fragment_file(&self.ingress_path(message_id))
            .await?;
        file.fragments
            .iter()
            .map(|h| hex::decode(h).map_err(|e| StorageError::Serialization(e.to_string())))
            .collect()
    }

    async fn put_fragment(
        &self,
        message_id: &MessageId,
        raw: Vec<u8>,
    ) -> Result<(), StorageError> {
        let path = self.ingress_path(message_id);
        let mut file = self.read_fragment_file(&path).await?;
        file.fragments.push(hex::encode(raw));
        fs::write(&path, serde_json::to_string_pretty(&file)?).await?;
        Ok(())
    }

    async fn remove_fragments(&self, message_id: &MessageId) -> Result<(), StorageError> {
        remove_if_exists(&self.ingress_path(message_id)).await
    }

    async fn put_egress(&self, record: &EgressRecord) -> Result<(), StorageError> {
        let path = self.egress_path(&record.message_id, record.block_id);
        // Replaced by rename so a concurrent listing never reads a partial file
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, serde_json::to_string_pretty(record)?).await?;
        fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn remove_egress(&self, message_id: &MessageId) -> Result<(), StorageError> {
        let prefix = format!("{}-", message_id.to_hex());
        let mut entries = fs::read_dir(self.root.join("egress")).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                remove_if_exists(&entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn egress_records(&self) -> Result<Vec<EgressRecord>, StorageError> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(self.root.join("egress")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            // Removed by a concurrent `remove_egress` after the listing
            let json = match fs::read_to_string(&path).await {
                Ok(json) => json,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            records.push(serde_json::from_str(&json)?);
        }
        Ok(records)
    }

    async fn add_surb_keys(&self, record: &SurbKeyRecord) -> Result<(), StorageError> {
        fs::write(
            self.surb_path(&record.surb_id),
            serde_json::to_string_pretty(record)?,
        )
        .await?;
        Ok(())
    }

    async fn remove_surb_keys(&self, surb_id: &SurbId) -> Result<(), StorageError> {
        remove_if_exists(&self.surb_path(surb_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn egress(message_id: MessageId, block_id: u16) -> EgressRecord {
        EgressRecord {
            message_id,
            block_id,
            total_blocks: 2,
            recipient: "bob".to_string(),
            provider: "acme".to_string(),
            reliable: true,
            payload: vec![1, 2, 3],
            surb_id: Some(SurbId::random()),
            expiration: Some(1_700_000_000),
        }
    }

    async fn exercise(storage: &dyn Storage) {
        let id = MessageId::random();

        assert!(storage.get_fragments(&id).await.unwrap().is_empty());
        storage.put_fragment(&id, vec![1, 2]).await.unwrap();
        storage.put_fragment(&id, vec![3]).await.unwrap();
        assert_eq!(
            storage.get_fragments(&id).await.unwrap(),
            vec![vec![1, 2], vec![3]]
        );
        storage.remove_fragments(&id).await.unwrap();
        assert!(storage.get_fragments(&id).await.unwrap().is_empty());
        // Removing twice is fine
        storage.remove_fragments(&id).await.unwrap();

        storage.put_egress(&egress(id, 0)).await.unwrap();
        storage.put_egress(&egress(id, 1)).await.unwrap();
        storage.put_egress(&egress(MessageId::random(), 0)).await.unwrap();
        assert_eq!(storage.egress_records().await.unwrap().len(), 3);
        storage.remove_egress(&id).await.unwrap();
        assert_eq!(storage.egress_records().await.unwrap().len(), 1);

        let record = SurbKeyRecord {
            surb_id: SurbId::random(),
            message_id: id,
            block_id: 0,
            keys: vec![7u8; 32],
        };
        storage.add_surb_keys(&record).await.unwrap();
        storage.remove_surb_keys(&record.surb_id).await.unwrap();
        storage.remove_surb_keys(&record.surb_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = MemoryStorage::new();
        exercise(&storage).await;
        assert_eq!(storage.surb_count().await, 0);
        assert_eq!(storage.partial_messages().await, 0);
    }

    #[tokio::test]
    async fn test_file_storage() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        exercise(&storage).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_egress_listing_skips_vanished_records() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::open(dir.path()).await.unwrap();
        let id = MessageId::random();
        storage.put_egress(&egress(id, 0)).await.unwrap();

        // Listed by read_dir but gone by the time it is read
        let dangling = dir.path().join("egress").join("vanished-0.json");
        std::os::unix::fs::symlink(dir.path().join("missing"), &dangling).unwrap();

        let records = storage.egress_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message_id, id);
    }

    #[tokio::test]
    async fn test_file_storage_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id = MessageId::random();
        {
            let storage = FileStorage::open(dir.path()).await.unwrap();
            storage.put_fragment(&id, vec![0xAA; 4]).await.unwrap();
        }
        let storage = FileStorage::open(dir.path()).await.unwrap();
        assert_eq!(
            storage.get_fragments(&id).await.unwrap(),
            vec![vec![0xAA; 4]]
        );
    }
}
