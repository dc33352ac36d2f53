//! JSON file token store with rename-based commit.
//!
//! A write serializes the record into a uniquely named temporary file next to
//! the target, flushes it to disk, then renames it over the target. Rename is
//! atomic on the same filesystem, so readers (which never lock) see either the
//! old document or the new one.

use super::{CredentialRecord, TokenStore};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

pub struct FileTokenStore {
    path: PathBuf,
    /// Serializes writers inside this process (invalidate is read-modify-write)
    write_lock: Mutex<()>,
}

impl FileTokenStore {
    /// Creates a store at `path`, creating the parent directory if needed.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tokens".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()))
    }

    fn commit(&self, record: &CredentialRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record).context("Failed to serialize credentials")?;
        let tmp = self.temp_path();

        let written = write_synced(&tmp, &json);
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| {
                format!("Failed to replace token file {}", self.path.display())
            });
        }

        sync_parent_dir(&self.path);
        Ok(())
    }
}

fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to flush {}", path.display()))?;
    Ok(())
}

/// Makes the rename itself durable. Best effort.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

impl TokenStore for FileTokenStore {
    fn read(&self) -> Result<Option<CredentialRecord>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read token file {}", self.path.display()))
            }
        };

        let record = serde_json::from_slice(&bytes)
            .with_context(|| format!("Token file {} is corrupt", self.path.display()))?;
        Ok(Some(record))
    }

    fn write(&self, record: &CredentialRecord) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("Token store write lock poisoned"))?;
        self.commit(record)
    }

    fn invalidate(&self) -> Result<bool> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("Token store write lock poisoned"))?;

        let Some(mut record) = self.read()? else {
            return Ok(false);
        };
        if record.invalidated_at.is_none() {
            record.invalidated_at = Some(Utc::now());
            self.commit(&record)?;
        }
        Ok(true)
    }
}
