//! Versioned, gzip-compressed checkpoint files
//!
//! A checkpoint is a single JSON envelope compressed with gzip. The envelope
//! records the format version so that an incompatible file is rejected before
//! any pipeline state is rebuilt from it.

use crate::error::{LoopError, LoopResult};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

/// File name of the checkpoint inside a working area
pub const CHECKPOINT_FILE_NAME: &str = "reader_state.json.gz";

/// Checkpoint layout version written and accepted by this build
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    format_version: u32,
    created_at: DateTime<Utc>,
    producer: String,
    state: T,
}

#[derive(Debug, Deserialize)]
struct Header {
    format_version: u32,
}

pub(crate) fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub(crate) fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut result = Vec::new();
    decoder.read_to_end(&mut result)?;
    Ok(result)
}

fn write_error(path: &Path, source: impl std::error::Error + Send + Sync + 'static) -> LoopError {
    LoopError::CheckpointWrite {
        path: path.to_path_buf(),
        source: Box::new(source),
    }
}

fn read_error(path: &Path, source: impl std::error::Error + Send + Sync + 'static) -> LoopError {
    LoopError::CheckpointRead {
        path: path.to_path_buf(),
        source: Box::new(source),
    }
}

/// Write `state` to `path`, replacing any previous file atomically
pub async fn write_checkpoint<T: Serialize>(path: &Path, state: &T) -> LoopResult<()> {
    let envelope = Envelope {
        format_version: FORMAT_VERSION,
        created_at: Utc::now(),
        producer: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        state,
    };

    let json = serde_json::to_vec(&envelope).map_err(|e| write_error(path, e))?;
    let data = compress(&json).map_err(|e| write_error(path, e))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| write_error(path, e))?;
    }

    // Write atomically using temp file
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, &data)
        .await
        .map_err(|e| write_error(path, e))?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| write_error(path, e))?;

    info!(
        "Wrote checkpoint {} ({} bytes compressed)",
        path.display(),
        data.len()
    );
    Ok(())
}

/// Read a checkpoint, rejecting any format version other than ours
pub async fn read_checkpoint<T: DeserializeOwned>(path: &Path) -> LoopResult<T> {
    let data = fs::read(path).await.map_err(|e| read_error(path, e))?;
    let json = decompress(&data).map_err(|e| read_error(path, e))?;

    let header: Header = serde_json::from_slice(&json).map_err(|e| read_error(path, e))?;
    if header.format_version != FORMAT_VERSION {
        return Err(LoopError::CheckpointVersion {
            path: path.to_path_buf(),
            recorded: header.format_version,
            running: FORMAT_VERSION,
        });
    }

    let envelope: Envelope<T> = serde_json::from_slice(&json).map_err(|e| read_error(path, e))?;
    debug!(
        "Loaded checkpoint {} written {} by {}",
        path.display(),
        envelope.created_at,
        envelope.producer
    );
    Ok(envelope.state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_written_checkpoint_reads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        let state = json!({"members": [1, 2, 3]});

        write_checkpoint(&path, &state).await.unwrap();
        let loaded: Value = read_checkpoint(&path).await.unwrap();
        assert_eq!(loaded, state);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_read_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        let err = read_checkpoint::<Value>(&path).await.unwrap_err();
        assert!(matches!(err, LoopError::CheckpointRead { .. }));
        assert!(err.to_string().contains(CHECKPOINT_FILE_NAME));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        let future = json!({
            "format_version": FORMAT_VERSION + 1,
            "created_at": Utc::now(),
            "producer": "later build",
            "state": {"shape": "unknown"},
        });
        std::fs::write(&path, compress(&serde_json::to_vec(&future).unwrap()).unwrap()).unwrap();

        let err = read_checkpoint::<Value>(&path).await.unwrap_err();
        match err {
            LoopError::CheckpointVersion {
                recorded, running, ..
            } => {
                assert_eq!(recorded, FORMAT_VERSION + 1);
                assert_eq!(running, FORMAT_VERSION);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_read_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        std::fs::write(&path, b"not gzip at all").unwrap();
        let err = read_checkpoint::<Value>(&path).await.unwrap_err();
        assert!(matches!(err, LoopError::CheckpointRead { .. }));
    }
}
