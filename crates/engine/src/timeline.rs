use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::script::{AssetKind, SegmentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    // Vertical short-form
    fn default() -> Self {
        Resolution {
            width: 1080,
            height: 1920,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSettings {
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_audio_channels")]
    pub audio_channels: u32,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    #[serde(default = "default_video_preset")]
    pub video_preset: String,
    #[serde(default = "default_crf")]
    pub crf: u32,
}

fn default_fps() -> u32 {
    30
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_audio_channels() -> u32 {
    2
}

fn default_audio_bitrate() -> String {
    "128k".to_string()
}

fn default_video_preset() -> String {
    "medium".to_string()
}

fn default_crf() -> u32 {
    23
}

impl Default for RenderSettings {
    fn default() -> Self {
        RenderSettings {
            fps: default_fps(),
            resolution: Resolution::default(),
            sample_rate: default_sample_rate(),
            audio_channels: default_audio_channels(),
            audio_bitrate: default_audio_bitrate(),
            video_preset: default_video_preset(),
            crf: default_crf(),
        }
    }
}

impl RenderSettings {
    /// Length of one frame in seconds; the tolerance for every duration check.
    pub fn frame_duration(&self) -> f64 {
        1.0 / self.fps.max(1) as f64
    }
}

/// What a unit shows on screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum VisualSource {
    /// The narration segment's own talking-head video, read from `offset`.
    NarrationVideo { path: PathBuf, offset: f64 },
    /// A B-Roll asset. `fallback` marks the configured default asset standing
    /// in for a missing curated visual.
    Asset {
        path: PathBuf,
        kind: AssetKind,
        fallback: bool,
    },
}

impl VisualSource {
    pub fn path(&self) -> &PathBuf {
        match self {
            VisualSource::NarrationVideo { path, .. } | VisualSource::Asset { path, .. } => path,
        }
    }

    pub fn is_narration(&self) -> bool {
        matches!(self, VisualSource::NarrationVideo { .. })
    }

    pub fn is_image(&self) -> bool {
        matches!(
            self,
            VisualSource::Asset {
                kind: AssetKind::Image,
                ..
            }
        )
    }
}

/// A window of narration audio: `[offset, offset + duration)` of `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioWindow {
    pub segment_id: SegmentId,
    pub path: PathBuf,
    pub offset: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStrategy {
    None,
    Loop,
    Trim,
}

impl FitStrategy {
    /// How a clip of `available` seconds is fitted to `target` seconds.
    pub fn for_clip(available: f64, target: f64, tolerance: f64) -> FitStrategy {
        if (available - target).abs() <= tolerance {
            FitStrategy::None
        } else if available < target {
            FitStrategy::Loop
        } else {
            FitStrategy::Trim
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineUnit {
    pub segment_id: SegmentId,
    pub visual_source: VisualSource,
    pub audio_source: AudioWindow,
    pub target_duration: f64,
    pub trim_or_loop_strategy: FitStrategy,
    /// Usable length of a clip source; `None` for stills.
    pub source_duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyPlan {
    pub units: Vec<TimelineUnit>,
    pub output_path: PathBuf,
    pub resolution: Resolution,
}

impl AssemblyPlan {
    pub fn total_duration(&self) -> f64 {
        self.units.iter().map(|u| u.target_duration).sum()
    }

    /// Start time of each unit on the output timeline.
    pub fn unit_starts(&self) -> Vec<f64> {
        let mut position = 0.0;
        self.units
            .iter()
            .map(|u| {
                let start = position;
                position += u.target_duration;
                start
            })
            .collect()
    }
}
