//! Storage abstraction for JSON persistence
//!
//! Implements the Home Assistant `.storage/` directory pattern with versioning.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage file not found: {key}")]
    NotFound { key: String },

    #[error("Migration required for {key}: from {from} to {to}")]
    MigrationRequired { key: String, from: u32, to: u32 },

    #[error("Unsupported version for {key}: found {found}, newest supported is {supported}")]
    UnsupportedVersion {
        key: String,
        found: u32,
        supported: u32,
    },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage file wrapper with version tracking
///
/// JSON format:
/// ```json
/// {
///   "version": 1,
///   "minor_version": 3,
///   "key": "core.device_registry",
///   "data": { ... }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    /// Major version - breaking changes
    pub version: u32,
    /// Minor version - migrations within major version
    pub minor_version: u32,
    /// Storage key (file identifier)
    pub key: String,
    pub data: T,
}

impl<T> StorageFile<T> {
    pub fn new(key: impl Into<String>, data: T, version: u32, minor_version: u32) -> Self {
        Self {
            version,
            minor_version,
            key: key.into(),
            data,
        }
    }
}

/// Storage manager for the `.storage/` directory
#[derive(Debug, Clone)]
pub struct Storage {
    storage_dir: PathBuf,
}

impl Storage {
    /// Create a storage manager rooted at `<config_dir>/.storage`
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: config_dir.as_ref().join(".storage"),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Ensure the storage directory exists
    pub async fn ensure_dir(&self) -> StorageResult<()> {
        if !self.storage_dir.exists() {
            fs::create_dir_all(&self.storage_dir).await?;
            debug!("Created storage directory: {:?}", self.storage_dir);
        }
        Ok(())
    }

    pub fn file_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(key)
    }

    pub async fn exists(&self, key: &str) -> bool {
        fs::try_exists(self.file_path(key)).await.unwrap_or(false)
    }

    /// Load data from storage
    ///
    /// Returns None if the file doesn't exist.
    pub async fn load<T>(&self, key: &str) -> StorageResult<Option<StorageFile<T>>>
    where
        T: DeserializeOwned,
    {
        let Some(content) = self.read(key).await? else {
            return Ok(None);
        };
        let storage_file: StorageFile<T> = serde_json::from_str(&content)?;

        debug!(
            "Loaded storage file: {} (v{}.{})",
            key, storage_file.version, storage_file.minor_version
        );

        Ok(Some(storage_file))
    }

    /// Load data from storage, returning an error if not found
    pub async fn load_required<T>(&self, key: &str) -> StorageResult<StorageFile<T>>
    where
        T: DeserializeOwned,
    {
        self.load(key).await?.ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })
    }

    /// Save data to storage
    ///
    /// Writes to a temp file first, then renames it over the target.
    pub async fn save<T>(&self, storage_file: &StorageFile<T>) -> StorageResult<()>
    where
        T: Serialize,
    {
        self.ensure_dir().await?;

        let path = self.file_path(&storage_file.key);
        let temp_path = self.file_path(&format!("{}.tmp", storage_file.key));

        let content = serde_json::to_string_pretty(storage_file)?;
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(
            "Saved storage file: {} (v{}.{})",
            storage_file.key, storage_file.version, storage_file.minor_version
        );

        Ok(())
    }

    /// Delete a storage file
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.file_path(key);

        if path.exists() {
            fs::remove_file(&path).await?;
            debug!("Deleted storage file: {}", key);
        }

        Ok(())
    }

    async fn read(&self, key: &str) -> StorageResult<Option<String>> {
        match fs::read_to_string(self.file_path(key)).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("Storage file not found: {}", key);
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Helper trait for types that can be stored
pub trait Storable: Serialize + DeserializeOwned {
    /// Storage key for this type
    const KEY: &'static str;
    /// Current major version
    const VERSION: u32;
    /// Current minor version
    const MINOR_VERSION: u32;

    fn to_storage_file(&self) -> StorageFile<Self>
    where
        Self: Clone,
    {
        StorageFile::new(Self::KEY, self.clone(), Self::VERSION, Self::MINOR_VERSION)
    }
}

/// Migration function type
///
/// Receives the raw `data` section together with the stored major and minor
/// version and returns data in the current schema.
pub type MigrationFn = fn(serde_json::Value, u32, u32) -> StorageResult<serde_json::Value>;

/// Load with migration support
///
/// Migration runs when the stored major version differs from the current
/// one, or the stored minor version is older.
pub async fn load_with_migration<T>(
    storage: &Storage,
    migrate: Option<MigrationFn>,
) -> StorageResult<Option<T>>
where
    T: Storable,
{
    let Some(content) = storage.read(T::KEY).await? else {
        return Ok(None);
    };

    let raw: StorageFile<serde_json::Value> = serde_json::from_str(&content)?;

    let current = raw.version == T::VERSION && raw.minor_version >= T::MINOR_VERSION;
    if current {
        return Ok(Some(serde_json::from_value(raw.data)?));
    }

    let Some(migrate_fn) = migrate else {
        return Err(StorageError::MigrationRequired {
            key: T::KEY.to_string(),
            from: raw.version,
            to: T::VERSION,
        });
    };

    info!(
        "Migrating {} from v{}.{} to v{}.{}",
        T::KEY,
        raw.version,
        raw.minor_version,
        T::VERSION,
        T::MINOR_VERSION
    );
    let migrated = migrate_fn(raw.data, raw.version, raw.minor_version)?;
    Ok(Some(serde_json::from_value(migrated)?))
}
