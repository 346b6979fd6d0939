use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const SCHEMA_VERSION: u32 = 1;

/// Stable identifier of a narration segment. Visual status records reuse the
/// id of the narration segment they accompany.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub u32);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Image,
    Clip,
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "gif"];

impl AssetKind {
    /// Guess the kind from a file extension. Anything that isn't a known
    /// still-image format is treated as a clip.
    pub fn from_path(path: &Path) -> AssetKind {
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image {
            AssetKind::Image
        } else {
            AssetKind::Clip
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrationSegment {
    pub id: SegmentId,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub end_time: Option<f64>,
    pub source_audio_ref: PathBuf,
    #[serde(default)]
    pub source_video_ref: Option<PathBuf>,
    #[serde(default)]
    pub text: Option<String>,
}

impl NarrationSegment {
    /// Both bounds present and strictly increasing.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) if start >= 0.0 && end > start => Some((start, end)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualSegment {
    pub id: SegmentId,
    pub linked_narration_id: SegmentId,
    pub asset_ref: PathBuf,
    pub asset_kind: AssetKind,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Narration(NarrationSegment),
    Visual(VisualSegment),
}

/// Where each narration audio window starts inside `source_audio_ref`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioLayout {
    /// All narration refs point into one continuous track; windows start at
    /// `start_time`.
    #[default]
    SharedTrack,
    /// Each narration has its own file; windows start at zero.
    PerSegment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptDescriptor {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub version: u64,
    pub visual_density: f64,
    #[serde(default)]
    pub audio_layout: AudioLayout,
    pub segments: Vec<Segment>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl ScriptDescriptor {
    pub fn new(visual_density: f64) -> Self {
        ScriptDescriptor {
            schema_version: SCHEMA_VERSION,
            version: 0,
            visual_density,
            audio_layout: AudioLayout::default(),
            segments: Vec::new(),
        }
    }

    /// Narration segments in authored order.
    pub fn narrations(&self) -> impl Iterator<Item = &NarrationSegment> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Narration(n) => Some(n),
            Segment::Visual(_) => None,
        })
    }

    pub fn visuals(&self) -> impl Iterator<Item = &VisualSegment> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Visual(v) => Some(v),
            Segment::Narration(_) => None,
        })
    }

    pub fn narration_ids(&self) -> Vec<SegmentId> {
        self.narrations().map(|n| n.id).collect()
    }

    pub fn narration(&self, id: SegmentId) -> Option<&NarrationSegment> {
        self.narrations().find(|n| n.id == id)
    }

    /// The curated visual for a narration segment, if one was authored.
    pub fn visual_for(&self, narration_id: SegmentId) -> Option<&VisualSegment> {
        self.visuals().find(|v| v.linked_narration_id == narration_id)
    }

    /// Offset of a narration's audio window inside its source file.
    pub fn audio_offset(&self, narration: &NarrationSegment) -> f64 {
        match self.audio_layout {
            AudioLayout::SharedTrack => narration.bounds().map(|(start, _)| start).unwrap_or(0.0),
            AudioLayout::PerSegment => 0.0,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// `count` back-to-back narration segments of `len` seconds on one track.
    pub fn script(count: u32, len: f64, density: f64) -> ScriptDescriptor {
        let mut descriptor = ScriptDescriptor::new(density);
        for i in 0..count {
            descriptor.segments.push(Segment::Narration(NarrationSegment {
                id: SegmentId(i),
                start_time: Some(i as f64 * len),
                end_time: Some((i + 1) as f64 * len),
                source_audio_ref: PathBuf::from("narration/track.wav"),
                source_video_ref: Some(PathBuf::from(format!("aroll/segment_{}.mp4", i))),
                text: None,
            }));
        }
        descriptor
    }
}
