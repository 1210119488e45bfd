//! Object store backed by a local directory.
//!
//! Each object is a `<name>.log` file holding the appended blocks and a
//! `<name>.meta.json` sidecar holding the etag and metadata. Conditional
//! writes are serialized within this process only, so a directory must not
//! be shared by several running processes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ETag, ObjectProperties, ObjectStore, StoreError, check_etag};
use crate::types::Metadata;

const LOG_SUFFIX: &str = ".log";
const META_SUFFIX: &str = ".meta.json";

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    etag: u64,
    metadata: Metadata,
}

/// Object store rooted at a directory.
#[derive(Debug)]
pub struct LocalObjectStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl LocalObjectStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "opened local object store");
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", name, LOG_SUFFIX))
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", name, META_SUFFIX))
    }

    async fn load_sidecar(&self, name: &str) -> Result<Sidecar, StoreError> {
        let bytes = match fs::read(self.meta_path(name)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Write the sidecar through a temp file so readers never see half of it.
    async fn store_sidecar(&self, name: &str, sidecar: &Sidecar) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(sidecar).map_err(|e| StoreError::Corrupt {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let tmp = self.root.join(format!(".{}{}.tmp", name, META_SUFFIX));
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, self.meta_path(name)).await?;
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

fn fresh_etag() -> ETag {
    ETag(uuid::Uuid::new_v4().as_u64_pair().0)
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn create_if_not_exists(
        &self,
        name: &str,
        metadata: &Metadata,
    ) -> Result<Option<ETag>, StoreError> {
        validate_name(name)?;
        let _guard = self.lock.lock().await;
        if fs::try_exists(self.meta_path(name)).await? {
            return Ok(None);
        }
        fs::write(self.log_path(name), b"").await?;
        let etag = fresh_etag();
        self.store_sidecar(
            name,
            &Sidecar {
                etag: etag.0,
                metadata: metadata.clone(),
            },
        )
        .await?;
        Ok(Some(etag))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectProperties>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }
            if let Some(name) = file_name.strip_suffix(META_SUFFIX) {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();

        let mut result = Vec::with_capacity(names.len());
        for name in names {
            let sidecar = self.load_sidecar(&name).await?;
            result.push(ObjectProperties {
                name,
                metadata: sidecar.metadata,
                etag: ETag(sidecar.etag),
            });
        }
        Ok(result)
    }

    async fn properties(&self, name: &str) -> Result<ObjectProperties, StoreError> {
        validate_name(name)?;
        let _guard = self.lock.lock().await;
        let sidecar = self.load_sidecar(name).await?;
        Ok(ObjectProperties {
            name: name.to_string(),
            metadata: sidecar.metadata,
            etag: ETag(sidecar.etag),
        })
    }

    async fn read(&self, name: &str) -> Result<(Vec<u8>, ETag), StoreError> {
        validate_name(name)?;
        let _guard = self.lock.lock().await;
        let sidecar = self.load_sidecar(name).await?;
        let data = fs::read(self.log_path(name)).await?;
        Ok((data, ETag(sidecar.etag)))
    }

    async fn append(&self, name: &str, block: &[u8], if_match: ETag) -> Result<ETag, StoreError> {
        validate_name(name)?;
        let _guard = self.lock.lock().await;
        let mut sidecar = self.load_sidecar(name).await?;
        check_etag(name, if_match, ETag(sidecar.etag))?;

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(self.log_path(name))
            .await?;
        let committed_len = file.metadata().await?.len();

        let etag = fresh_etag();
        sidecar.etag = etag.0;
        let written = async {
            file.write_all(block).await?;
            file.sync_data().await?;
            self.store_sidecar(name, &sidecar).await
        }
        .await;

        // A block is only part of the log once the etag moved past it.
        if let Err(e) = written {
            if let Err(rollback) = file.set_len(committed_len).await {
                warn!(name, error = %rollback, "failed to truncate torn append");
            }
            return Err(e);
        }
        Ok(etag)
    }

    async fn set_metadata(
        &self,
        name: &str,
        metadata: &Metadata,
        if_match: ETag,
    ) -> Result<ETag, StoreError> {
        validate_name(name)?;
        let _guard = self.lock.lock().await;
        let sidecar = self.load_sidecar(name).await?;
        check_etag(name, if_match, ETag(sidecar.etag))?;

        let etag = fresh_etag();
        self.store_sidecar(
            name,
            &Sidecar {
                etag: etag.0,
                metadata: metadata.clone(),
            },
        )
        .await?;
        Ok(etag)
    }

    async fn delete(&self, name: &str, if_match: ETag) -> Result<(), StoreError> {
        validate_name(name)?;
        let _guard = self.lock.lock().await;
        let sidecar = self.load_sidecar(name).await?;
        check_etag(name, if_match, ETag(sidecar.etag))?;
        fs::remove_file(self.meta_path(name)).await?;
        match fs::remove_file(self.log_path(name)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
