pub mod ffmpeg;

#[cfg(test)]
pub(crate) mod fake;

use anyhow::Result;
use async_trait::async_trait;
use engine::render::TransformSpec;
use engine::SegmentId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Seconds.
    pub duration: f64,
    pub fps_num: i32,
    pub fps_den: i32,
    pub width: i32,
    pub height: i32,
    pub has_video: bool,
    pub has_audio: bool,
}

/// A rendered unit clip on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipRef {
    pub index: usize,
    pub segment_id: SegmentId,
    pub path: PathBuf,
    pub duration: f64,
}

/// Media operations the assembly pipeline needs. Implementations own all
/// tool syntax; callers only deal in specs and paths.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo>;

    /// Render one unit into `workspace`, which the caller owns and removes.
    async fn transform(&self, spec: &TransformSpec, workspace: &Path) -> Result<ClipRef>;

    /// Join `clips` in order into `output`, overwriting it. Callers stage
    /// `output` and decide whether to keep it.
    async fn concatenate(&self, clips: &[PathBuf], output: &Path) -> Result<()>;
}

pub async fn compute_file_checksum(file_path: &Path) -> Result<String> {
    let file = File::open(file_path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
