//! On-disk working area of a run
//!
//! The working area holds the runtime-module archive, the task and result
//! files exchanged with detached workers, and the checkpoint. It is the only
//! resource mutated across process boundaries; concurrent extraction of the
//! archive is serialized with a lock marker file created with `create_new`,
//! which is atomic on the shared filesystem, and polled by the losers.

use crate::checkpoint::CHECKPOINT_FILE_NAME;
use crate::error::{LoopError, LoopResult};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Directory name the runtime-module archive unpacks to
pub const MODULES_DIR_NAME: &str = "runtime_modules";

/// Archive of auxiliary files shipped to workers
pub const MODULES_ARCHIVE_NAME: &str = "runtime_modules.tar.gz";

/// Marker present while one process is extracting the archive
pub const EXTRACT_MARKER_NAME: &str = ".extracting";

/// Search-path variable the extracted module directory is prepended to
pub const MODULE_PATH_ENV: &str = "BATCHLOOP_MODULE_PATH";

const POLL_START: Duration = Duration::from_millis(5);
const POLL_MAX: Duration = Duration::from_millis(200);

/// What [`WorkingArea::ensure_extracted`] ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    /// The working area has no module archive
    NoArchive,
    /// The module directory was already present
    AlreadyExtracted,
    /// This process performed the extraction
    Extracted,
    /// Another process extracted while this one waited on the marker
    WaitedForPeer,
}

/// Metadata stored in the marker file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerData {
    pub process_id: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

impl MarkerData {
    fn current() -> Self {
        Self {
            process_id: std::process::id(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            acquired_at: Utc::now(),
        }
    }
}

/// RAII guard for the extraction marker; removes it when dropped
#[derive(Debug)]
struct MarkerGuard {
    path: PathBuf,
}

impl MarkerGuard {
    /// Atomically create the marker; `None` if another process holds it
    async fn try_create(path: &Path) -> LoopResult<Option<Self>> {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true) // Atomic: fails if file exists
            .open(path)
            .await
        {
            Ok(mut file) => {
                let json = serde_json::to_string(&MarkerData::current())?;
                tokio::io::AsyncWriteExt::write_all(&mut file, json.as_bytes()).await?;
                Ok(Some(Self {
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for MarkerGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove marker {}: {}", self.path.display(), e);
        }
    }
}

/// Directory on stable storage identified by its path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingArea {
    path: PathBuf,
}

impl WorkingArea {
    /// Create a fresh, uniquely named working area under `root`
    pub fn create(root: &Path) -> LoopResult<Self> {
        let name = format!(
            "batchloop_{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let path = root.join(name);
        std::fs::create_dir_all(path.join("tasks"))?;
        std::fs::create_dir_all(path.join("results"))?;
        info!("Created working area {}", path.display());
        Ok(Self { path })
    }

    /// Refer to an existing working area
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.path.join(CHECKPOINT_FILE_NAME)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.path.join(MODULES_ARCHIVE_NAME)
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.path.join(MODULES_DIR_NAME)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.path.join(EXTRACT_MARKER_NAME)
    }

    pub fn task_path(&self, task_id: u64) -> PathBuf {
        self.path.join("tasks").join(format!("task_{task_id:05}.json.gz"))
    }

    pub fn result_path(&self, task_id: u64) -> PathBuf {
        self.path.join("results").join(format!("task_{task_id:05}.json.gz"))
    }

    pub fn failure_path(&self, task_id: u64) -> PathBuf {
        self.path.join("results").join(format!("task_{task_id:05}.failed"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.path.join("logs")
    }

    /// Pack files and directories into the runtime-module archive
    ///
    /// Each path lands under `runtime_modules/<file name>`. Returns `None`
    /// when there is nothing to pack.
    pub fn pack_modules(&self, paths: &[PathBuf]) -> LoopResult<Option<PathBuf>> {
        if paths.is_empty() {
            return Ok(None);
        }

        let archive_path = self.archive_path();
        let file = std::fs::File::create(&archive_path)?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

        for path in paths {
            let name = path.file_name().ok_or_else(|| {
                LoopError::Config(format!("user module {} has no file name", path.display()))
            })?;
            let entry = Path::new(MODULES_DIR_NAME).join(name);
            if path.is_dir() {
                builder.append_dir_all(&entry, path)?;
            } else {
                builder.append_path_with_name(path, &entry)?;
            }
            debug!("Packed {} as {}", path.display(), entry.display());
        }

        builder.into_inner()?.finish()?;
        info!(
            "Packed {} user module(s) into {}",
            paths.len(),
            archive_path.display()
        );
        Ok(Some(archive_path))
    }

    /// Make sure the module archive is extracted exactly once
    ///
    /// Whoever creates the marker extracts; everyone else polls, with
    /// exponential backoff, until the marker is gone. Waiting longer than
    /// `timeout` is fatal.
    pub async fn ensure_extracted(&self, timeout: Duration) -> LoopResult<Extraction> {
        let archive = self.archive_path();
        let target = self.modules_dir();
        let marker = self.marker_path();

        if !archive.exists() {
            return Ok(Extraction::NoArchive);
        }

        let started = Instant::now();
        let mut waited = false;
        loop {
            if target.exists() {
                return Ok(if waited {
                    Extraction::WaitedForPeer
                } else {
                    Extraction::AlreadyExtracted
                });
            }

            if let Some(guard) = MarkerGuard::try_create(&marker).await? {
                // The previous holder may have finished between our check and the create
                if target.exists() {
                    drop(guard);
                    continue;
                }
                let area = self.clone();
                tokio::task::spawn_blocking(move || area.extract_archive())
                    .await
                    .map_err(|e| LoopError::Extraction {
                        archive: archive.clone(),
                        source: std::io::Error::other(e),
                    })??;
                drop(guard);
                info!("Extracted {} into {}", archive.display(), target.display());
                return Ok(Extraction::Extracted);
            }

            waited = true;
            wait_for_release(&marker, started, timeout).await?;
        }
    }

    /// Unpack into a staging directory, then rename into place
    fn extract_archive(&self) -> LoopResult<()> {
        let archive = self.archive_path();
        let to_extraction_error = |source: std::io::Error| LoopError::Extraction {
            archive: archive.clone(),
            source,
        };

        let staging = self.path.join(format!(
            ".{}.{}",
            MODULES_DIR_NAME,
            uuid::Uuid::new_v4().simple()
        ));
        let file = std::fs::File::open(&archive).map_err(to_extraction_error)?;
        tar::Archive::new(GzDecoder::new(file))
            .unpack(&staging)
            .map_err(to_extraction_error)?;

        let unpacked = staging.join(MODULES_DIR_NAME);
        if !unpacked.is_dir() {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(to_extraction_error(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("archive has no top-level {MODULES_DIR_NAME}/ directory"),
            )));
        }
        std::fs::rename(&unpacked, self.modules_dir()).map_err(to_extraction_error)?;
        std::fs::remove_dir_all(&staging).map_err(to_extraction_error)?;
        Ok(())
    }
}

async fn wait_for_release(marker: &Path, started: Instant, timeout: Duration) -> LoopResult<()> {
    let mut delay = POLL_START;
    while marker.exists() {
        let waited = started.elapsed();
        if waited >= timeout {
            return Err(LoopError::LockTimeout {
                marker: marker.to_path_buf(),
                waited,
            });
        }
        tokio::time::sleep(delay.min(timeout - waited)).await;
        delay = (delay * 2).min(POLL_MAX);
    }
    Ok(())
}

/// Value of the module search path with `dir` in front
pub fn module_path_with(dir: &Path, current: Option<OsString>) -> LoopResult<OsString> {
    let mut paths = vec![dir.to_path_buf()];
    if let Some(current) = current {
        paths.extend(std::env::split_paths(&current).filter(|p| p != dir));
    }
    std::env::join_paths(paths)
        .map_err(|e| LoopError::Config(format!("invalid module search path: {e}")))
}
