//! Per-category shard persistence.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/store.json                 manifest: version, embedding dimension, created_at
//! <root>/shards/<stem>.shard.json   one file per category
//! ```
//!
//! A shard file carries its category label, the vector dimension and the
//! records, so a length mismatch is visible from the header. Every write goes
//! to a uniquely named temp file, is fsynced and then renamed over the old
//! snapshot; readers see either the old or the new shard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imgshard_common::{ImgShardError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{EmbeddingRecord, Shard};

/// Current on-disk format version
const FORMAT_VERSION: u32 = 1;

/// Manifest file name under the store root
pub const MANIFEST_FILE: &str = "store.json";

/// Directory holding the shard files
pub const SHARDS_DIR: &str = "shards";

const SHARD_SUFFIX: &str = ".shard.json";

/// Longest category label used verbatim as a file stem
const MAX_PLAIN_STEM: usize = 64;

/// Durable storage of category shards
///
/// Implementations must publish saves atomically and serialize writers of
/// the same category. Loads of different categories are independent.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Load every persisted record of `category`; empty shard if none exist
    async fn load(&self, category: &str) -> Result<Shard>;

    /// Atomically replace the persisted shard of `category`
    async fn save(&self, category: &str, shard: &Shard) -> Result<()>;

    /// Add records whose identity is not yet in the shard; returns how many were added
    async fn append_if_absent(&self, category: &str, records: Vec<EmbeddingRecord>)
        -> Result<usize>;

    /// Delete the shard of `category`; `false` if it did not exist
    async fn remove(&self, category: &str) -> Result<bool>;

    /// Categories that currently have a persisted shard
    async fn categories(&self) -> Result<Vec<String>>;

    /// Delete every shard and forget the store dimension
    async fn clear(&self) -> Result<()>;

    /// Fixed embedding length of the store, `None` until the first record is saved
    async fn dimension(&self) -> Result<Option<usize>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreManifest {
    version: u32,
    dimension: usize,
    created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct ShardFileOut<'a> {
    version: u32,
    category: &'a str,
    dimension: usize,
    saved_at: DateTime<Utc>,
    records: Vec<&'a EmbeddingRecord>,
}

#[derive(Deserialize)]
struct ShardFile {
    version: u32,
    category: String,
    dimension: usize,
    records: Vec<EmbeddingRecord>,
}

#[derive(Deserialize)]
struct ShardHeader {
    category: String,
}

/// Flat-file shard store (JSON shard files under a root directory)
pub struct FileShardStore {
    root: PathBuf,
    shards_dir: PathBuf,
    // Shared by every shard writer, exclusive for `clear`
    clear_gate: RwLock<()>,
    // One entry per category touched since open or the last `clear`
    writers: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    manifest_lock: Mutex<()>,
}

impl FileShardStore {
    /// Open the store at `root`; the directory must already exist
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !is_dir(&root).await {
            return Err(ImgShardError::store_not_found(&root));
        }

        let shards_dir = root.join(SHARDS_DIR);
        fs::create_dir_all(&shards_dir).await?;

        debug!("Shard store opened: {}", root.display());

        Ok(Self {
            root,
            shards_dir,
            clear_gate: RwLock::new(()),
            writers: RwLock::new(HashMap::new()),
            manifest_lock: Mutex::new(()),
        })
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File that holds the shard of `category`
    pub fn shard_path(&self, category: &str) -> PathBuf {
        self.shards_dir
            .join(format!("{}{}", shard_file_stem(category), SHARD_SUFFIX))
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    async fn ensure_root(&self) -> Result<()> {
        if is_dir(&self.root).await {
            Ok(())
        } else {
            Err(ImgShardError::store_not_found(&self.root))
        }
    }

    /// Writer lock of one category
    ///
    /// Take `clear_gate` first; `clear` drops the map while holding it.
    async fn writer_lock(&self, category: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.writers.read().await.get(category) {
            return lock.clone();
        }
        self.writers
            .write()
            .await
            .entry(category.to_string())
            .or_default()
            .clone()
    }

    async fn read_manifest(&self) -> Result<Option<StoreManifest>> {
        let path = self.manifest_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.ensure_root().await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let manifest: StoreManifest = serde_json::from_slice(&bytes).map_err(|e| {
            ImgShardError::corrupt_shard(MANIFEST_FILE, format!("unreadable manifest: {}", e))
        })?;
        if manifest.version > FORMAT_VERSION {
            return Err(ImgShardError::corrupt_shard(
                MANIFEST_FILE,
                format!("unsupported manifest version {}", manifest.version),
            ));
        }

        Ok(Some(manifest))
    }

    /// Pin the store dimension on first use, reject disagreeing shards afterwards
    async fn reconcile_dimension(&self, category: &str, dimension: usize) -> Result<()> {
        let _guard = self.manifest_lock.lock().await;

        match self.read_manifest().await? {
            Some(manifest) if manifest.dimension != dimension => Err(ImgShardError::corrupt_shard(
                category,
                format!(
                    "record dimension {} does not match store dimension {}",
                    dimension, manifest.dimension
                ),
            )),
            Some(_) => Ok(()),
            None => {
                let manifest = StoreManifest {
                    version: FORMAT_VERSION,
                    dimension,
                    created_at: Utc::now(),
                };
                let data = serde_json::to_vec_pretty(&manifest)?;
                write_atomic(&self.manifest_path(), &data).await?;
                info!("Store dimension set to {}", dimension);
                Ok(())
            }
        }
    }

    async fn read_shard(&self, category: &str) -> Result<Shard> {
        let path = self.shard_path(category);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.ensure_root().await?;
                debug!("No shard persisted for category '{}'", category);
                return Ok(Shard::new());
            }
            Err(e) => return Err(e.into()),
        };

        let file: ShardFile = serde_json::from_slice(&bytes).map_err(|e| {
            ImgShardError::corrupt_shard(
                category,
                format!("unreadable shard file {}: {}", path.display(), e),
            )
        })?;

        let store_dimension = self.read_manifest().await?.map(|m| m.dimension);
        decode_shard(category, file, store_dimension)
    }

    async fn write_shard(&self, category: &str, shard: &Shard) -> Result<()> {
        let dimension = match shard.dimension() {
            Some(dimension) => {
                if let Some(bad) = shard.records().find(|r| r.dimension() != dimension) {
                    return Err(ImgShardError::corrupt_shard(
                        category,
                        format!(
                            "record '{}' has dimension {}, expected {}",
                            bad.identity,
                            bad.dimension(),
                            dimension
                        ),
                    ));
                }
                self.reconcile_dimension(category, dimension).await?;
                dimension
            }
            None => self.dimension().await?.unwrap_or(0),
        };

        let file = ShardFileOut {
            version: FORMAT_VERSION,
            category,
            dimension,
            saved_at: Utc::now(),
            records: shard.records().collect(),
        };
        let data = serde_json::to_vec(&file)?;

        self.ensure_root().await?;
        fs::create_dir_all(&self.shards_dir).await?;
        write_atomic(&self.shard_path(category), &data).await?;

        debug!("Saved shard '{}' ({} records)", category, shard.len());
        Ok(())
    }
}

#[async_trait]
impl ShardStore for FileShardStore {
    async fn load(&self, category: &str) -> Result<Shard> {
        validate_category(category)?;
        self.read_shard(category).await
    }

    async fn save(&self, category: &str, shard: &Shard) -> Result<()> {
        validate_category(category)?;
        let _gate = self.clear_gate.read().await;
        let lock = self.writer_lock(category).await;
        let _guard = lock.lock().await;
        self.write_shard(category, shard).await
    }

    async fn append_if_absent(
        &self,
        category: &str,
        records: Vec<EmbeddingRecord>,
    ) -> Result<usize> {
        validate_category(category)?;
        let _gate = self.clear_gate.read().await;
        let lock = self.writer_lock(category).await;
        let _guard = lock.lock().await;

        let mut shard = self.read_shard(category).await?;
        let mut inserted = 0;
        for record in records {
            if shard.insert_if_absent(record) {
                inserted += 1;
            }
        }

        if inserted > 0 {
            self.write_shard(category, &shard).await?;
        }
        Ok(inserted)
    }

    async fn remove(&self, category: &str) -> Result<bool> {
        validate_category(category)?;
        let _gate = self.clear_gate.read().await;
        let lock = self.writer_lock(category).await;
        let _guard = lock.lock().await;

        match fs::remove_file(self.shard_path(category)).await {
            Ok(()) => {
                info!("Removed shard '{}'", category);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.ensure_root().await?;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn categories(&self) -> Result<Vec<String>> {
        self.ensure_root().await?;

        let mut categories = Vec::new();
        let mut entries = match fs::read_dir(&self.shards_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(categories),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_shard_file(&path) {
                continue;
            }

            let header = fs::read(&path)
                .await
                .map_err(ImgShardError::from)
                .and_then(|bytes| {
                    serde_json::from_slice::<ShardHeader>(&bytes).map_err(ImgShardError::from)
                });
            match header {
                Ok(header) => categories.push(header.category),
                Err(e) => warn!("Skipping unreadable shard file {}: {}", path.display(), e),
            }
        }

        categories.sort();
        Ok(categories)
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_root().await?;
        // No shard write can be between reconcile_dimension and its rename
        let _gate = self.clear_gate.write().await;
        let _guard = self.manifest_lock.lock().await;

        let mut removed = 0usize;
        if let Ok(mut entries) = fs::read_dir(&self.shards_dir).await {
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if is_shard_file(&path) {
                    fs::remove_file(&path).await?;
                    removed += 1;
                }
            }
        }

        match fs::remove_file(self.manifest_path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.writers.write().await.clear();

        info!("Cleared store {} ({} shards removed)", self.root.display(), removed);
        Ok(())
    }

    async fn dimension(&self) -> Result<Option<usize>> {
        Ok(self.read_manifest().await?.map(|m| m.dimension))
    }
}

/// Deterministic file stem for a category label
///
/// Labels made of `[A-Za-z0-9_-]` are used as-is. Anything else is sanitized
/// and suffixed with a SHA-256 prefix of the label so distinct labels never
/// share a file.
pub fn shard_file_stem(category: &str) -> String {
    let is_plain_char = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-';

    if category.len() <= MAX_PLAIN_STEM && category.chars().all(is_plain_char) {
        return category.to_string();
    }

    let sanitized: String = category
        .chars()
        .take(48)
        .map(|c| if is_plain_char(c) { c } else { '_' })
        .collect();
    let digest = hex::encode(Sha256::digest(category.as_bytes()));
    format!("{}-{}", sanitized, &digest[..16])
}

fn validate_category(category: &str) -> Result<()> {
    if category.trim().is_empty() {
        return Err(ImgShardError::invalid_input("category label cannot be empty"));
    }
    Ok(())
}

fn decode_shard(category: &str, file: ShardFile, store_dimension: Option<usize>) -> Result<Shard> {
    if file.version > FORMAT_VERSION {
        return Err(ImgShardError::corrupt_shard(
            category,
            format!("unsupported shard version {}", file.version),
        ));
    }
    if file.category != category {
        return Err(ImgShardError::corrupt_shard(
            category,
            format!("file belongs to category '{}'", file.category),
        ));
    }
    if file.records.is_empty() {
        return Ok(Shard::new());
    }

    let mut shard = Shard::new();
    for record in file.records {
        if record.dimension() != file.dimension {
            return Err(ImgShardError::corrupt_shard(
                category,
                format!(
                    "record '{}' has dimension {}, header says {}",
                    record.identity,
                    record.dimension(),
                    file.dimension
                ),
            ));
        }
        let identity = record.identity.clone();
        if !shard.insert_if_absent(record) {
            return Err(ImgShardError::corrupt_shard(
                category,
                format!("duplicate identity '{}'", identity),
            ));
        }
    }

    match store_dimension {
        Some(expected) if file.dimension != expected => Err(ImgShardError::corrupt_shard(
            category,
            format!(
                "shard dimension {} does not match store dimension {}",
                file.dimension, expected
            ),
        )),
        Some(_) => Ok(shard),
        None => Err(ImgShardError::corrupt_shard(
            category,
            format!("{} records but no {} manifest", shard.len(), MANIFEST_FILE),
        )),
    }
}

fn is_shard_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(SHARD_SUFFIX) && !name.starts_with('.'))
        .unwrap_or(false)
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

/// Write to a unique temp file next to `path`, fsync, then rename over `path`
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            ImgShardError::invalid_input(format!("bad target path {}", path.display()))
        })?;
    let temp_path =
        path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let written = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(e) = written {
        // Clean up temp file on error
        let _ = fs::remove_file(&temp_path).await;
        return Err(e.into());
    }

    Ok(())
}
