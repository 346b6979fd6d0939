use anyhow::{Context, Result};
use async_trait::async_trait;
use engine::render::TransformSpec;
use engine::SegmentId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{ClipRef, MediaInfo, Transcoder};

/// In-process `Transcoder` for tests. Source media lengths are registered up
/// front; every file it writes holds its own length as text, so outputs can
/// be moved around and still probed.
#[derive(Default)]
pub struct FakeTranscoder {
    sources: HashMap<PathBuf, f64>,
    fail_on: Option<SegmentId>,
    fail_concat: bool,
    delay: Duration,
    drift: f64,
    active: AtomicUsize,
    pub peak: AtomicUsize,
    pub probed: Mutex<Vec<PathBuf>>,
    pub transformed: Mutex<Vec<SegmentId>>,
}

impl FakeTranscoder {
    pub fn new() -> Self {
        FakeTranscoder::default()
    }

    pub fn with_media(mut self, path: impl Into<PathBuf>, duration: f64) -> Self {
        self.sources.insert(path.into(), duration);
        self
    }

    pub fn failing_on(mut self, segment_id: SegmentId) -> Self {
        self.fail_on = Some(segment_id);
        self
    }

    pub fn failing_concat(mut self) -> Self {
        self.fail_concat = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Rendered units come out this many seconds off their target.
    pub fn with_drift(mut self, drift: f64) -> Self {
        self.drift = drift;
        self
    }

    async fn length_of(&self, path: &Path) -> Result<f64> {
        if let Some(len) = self.sources.get(path) {
            return Ok(*len);
        }
        let written = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("no such media: {}", path.display()))?;
        written
            .trim()
            .parse()
            .with_context(|| format!("not a fake clip: {}", path.display()))
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn probe(&self, path: &Path) -> Result<MediaInfo> {
        self.probed.lock().unwrap().push(path.to_path_buf());
        Ok(MediaInfo {
            duration: self.length_of(path).await?,
            fps_num: 30,
            fps_den: 1,
            width: 1080,
            height: 1920,
            has_video: true,
            has_audio: true,
        })
    }

    async fn transform(&self, spec: &TransformSpec, workspace: &Path) -> Result<ClipRef> {
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.fail_on == Some(spec.segment_id) {
            anyhow::bail!("encoder exited with status 1");
        }

        // Intermediate output the caller's workspace cleanup must remove
        tokio::fs::write(workspace.join("video.mp4"), b"").await?;

        let duration = spec.duration + self.drift;
        let path = workspace.join(&spec.output_name);
        tokio::fs::write(&path, duration.to_string()).await?;
        self.transformed.lock().unwrap().push(spec.segment_id);

        Ok(ClipRef {
            index: spec.index,
            segment_id: spec.segment_id,
            path,
            duration,
        })
    }

    async fn concatenate(&self, clips: &[PathBuf], output: &Path) -> Result<()> {
        let mut total = 0.0;
        for clip in clips {
            total += self.length_of(clip).await?;
        }
        if self.fail_concat {
            // Partial write, as a crashed muxer would leave
            tokio::fs::write(output, b"").await?;
            anyhow::bail!("muxer exited with status 1");
        }
        tokio::fs::write(output, total.to_string()).await?;
        Ok(())
    }
}
