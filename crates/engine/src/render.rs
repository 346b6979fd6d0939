use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::script::SegmentId;
use crate::timeline::{AssemblyPlan, FitStrategy, RenderSettings, TimelineUnit, VisualSource};

/// How the picture of one unit is produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum VisualDirective {
    /// Hold a still image for the whole unit, letterboxed into the frame.
    Still { path: PathBuf },
    /// Play a clip from `offset`, repeated whole `cycles` times, cut at the
    /// unit duration.
    Motion {
        path: PathBuf,
        offset: f64,
        cycles: u32,
        fit: FitStrategy,
    },
}

/// `[offset, offset + duration)` of the narration track, re-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioDirective {
    pub path: PathBuf,
    pub offset: f64,
    pub duration: f64,
}

/// Everything a transcoder needs to render one unit clip. Independent of any
/// particular tool's syntax.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSpec {
    pub index: usize,
    pub segment_id: SegmentId,
    pub visual: VisualDirective,
    pub audio: AudioDirective,
    pub duration: f64,
    pub settings: RenderSettings,
    pub output_name: String,
}

impl TransformSpec {
    /// Largest deviation from `duration` the rendered clip may have.
    pub fn tolerance(&self) -> f64 {
        self.settings.frame_duration()
    }
}

/// Whole cycles of a `source_len` clip needed to cover `target`.
pub fn loop_cycles(source_len: f64, target: f64) -> u32 {
    if source_len <= 0.0 || target <= source_len {
        return 1;
    }
    (target / source_len).ceil() as u32
}

fn visual_directive(unit: &TimelineUnit) -> VisualDirective {
    if unit.visual_source.is_image() {
        return VisualDirective::Still {
            path: unit.visual_source.path().clone(),
        };
    }
    let offset = match &unit.visual_source {
        VisualSource::NarrationVideo { offset, .. } => *offset,
        VisualSource::Asset { .. } => 0.0,
    };
    let cycles = match (unit.trim_or_loop_strategy, unit.source_duration) {
        (FitStrategy::Loop, Some(len)) => loop_cycles(len, unit.target_duration),
        _ => 1,
    };
    VisualDirective::Motion {
        path: unit.visual_source.path().clone(),
        offset,
        cycles,
        fit: unit.trim_or_loop_strategy,
    }
}

/// Turn a plan into per-unit transform directives, in timeline order.
pub fn build_transform_specs(plan: &AssemblyPlan, settings: &RenderSettings) -> Vec<TransformSpec> {
    let mut settings = settings.clone();
    settings.resolution = plan.resolution;

    plan.units
        .iter()
        .enumerate()
        .map(|(index, unit)| TransformSpec {
            index,
            segment_id: unit.segment_id,
            visual: visual_directive(unit),
            audio: AudioDirective {
                path: unit.audio_source.path.clone(),
                offset: unit.audio_source.offset,
                duration: unit.target_duration,
            },
            duration: unit.target_duration,
            settings: settings.clone(),
            output_name: format!("unit_{:03}_{}.mp4", index, unit.segment_id),
        })
        .collect()
}

/// Contents of a concat-demuxer list referencing `clips` in order.
pub fn concat_list(clips: &[&Path]) -> String {
    clips
        .iter()
        .map(|p| {
            let escaped = p.to_string_lossy().replace('\'', r"'\''");
            format!("file '{}'\n", escaped)
        })
        .collect()
}

pub fn within_tolerance(actual: f64, expected: f64, tolerance: f64) -> bool {
    (actual - expected).abs() <= tolerance + 1e-9
}
