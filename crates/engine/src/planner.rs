use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::duration::{self, MediaDurations};
use crate::error::{AssemblyError, Result};
use crate::reconcile::check_fresh;
use crate::script::{AssetKind, NarrationSegment, ScriptDescriptor, SegmentId};
use crate::status::{ContentKind, GenerationState, StatusCache, StatusKey};
use crate::timeline::{AudioWindow, FitStrategy, TimelineUnit, VisualSource};

/// Interior narration segments that keep their own video in a sandwich.
/// Placement is a product decision, so it is configurable rather than fixed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "value", rename_all = "snake_case")]
pub enum AnchorPolicy {
    /// One anchor in the middle of the script.
    #[default]
    Midpoint,
    /// Every n-th narration segment.
    Every(usize),
    /// Explicit narration indices.
    At(Vec<usize>),
}

impl AnchorPolicy {
    fn interior_anchors(&self, narration_count: usize) -> Result<BTreeSet<usize>> {
        if narration_count < 3 {
            return Ok(BTreeSet::new());
        }
        let last = narration_count - 1;
        match self {
            AnchorPolicy::Midpoint => Ok(BTreeSet::from([narration_count / 2])),
            AnchorPolicy::Every(0) => Err(AssemblyError::InvalidPattern(
                "sandwich anchor interval must be positive".to_string(),
            )),
            AnchorPolicy::Every(step) => Ok((1..last).filter(|i| i % step == 0).collect()),
            AnchorPolicy::At(indices) => {
                if let Some(bad) = indices.iter().find(|&&i| i == 0 || i >= last) {
                    return Err(AssemblyError::InvalidPattern(format!(
                        "sandwich anchor {} is not an interior position of {} segments",
                        bad, narration_count
                    )));
                }
                Ok(indices.iter().copied().collect())
            }
        }
    }
}

/// What a custom step shows while the narration audio plays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepVisual {
    #[default]
    Narration,
    Visual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomStep {
    pub segment_id: SegmentId,
    #[serde(default)]
    pub show: StepVisual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum SequencePattern {
    NoOverlap,
    Standard,
    Bookends,
    Sandwich {
        #[serde(default)]
        anchors: AnchorPolicy,
    },
    BrollHeavy,
    BrollFull,
    Custom { steps: Vec<CustomStep> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOptions {
    /// Shown in visual slots that have no curated visual.
    #[serde(default)]
    pub default_visual: Option<PathBuf>,
    /// Clips within this many seconds of their target are used as is.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

fn default_tolerance() -> f64 {
    1.0 / 30.0
}

impl Default for PlanOptions {
    fn default() -> Self {
        PlanOptions {
            default_visual: None,
            tolerance: default_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Narration's own video with its audio.
    Narration,
    /// Linked visual with narration audio; narration video if none is linked.
    VisualOrNarration,
    /// Linked visual with narration audio; default asset if none is linked.
    Visual,
}

fn slots(
    pattern: &SequencePattern,
    narrations: &[&NarrationSegment],
    ctx: &Context,
) -> Result<Vec<(SegmentId, Slot)>> {
    let count = narrations.len();
    let last = count.saturating_sub(1);
    let by_position = |pick: &dyn Fn(usize, SegmentId) -> Slot| {
        narrations
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id, pick(i, n.id)))
            .collect::<Vec<_>>()
    };

    let planned = match pattern {
        SequencePattern::NoOverlap => by_position(&|_, id| {
            if ctx.has_linked_visual(id) {
                Slot::Visual
            } else {
                Slot::Narration
            }
        }),
        SequencePattern::Standard => by_position(&|i, _| {
            if i == 0 || i == last {
                Slot::Narration
            } else {
                Slot::VisualOrNarration
            }
        }),
        SequencePattern::Bookends => by_position(&|i, _| {
            if i == 0 || i == last {
                Slot::Narration
            } else {
                Slot::Visual
            }
        }),
        SequencePattern::Sandwich { anchors } => {
            let anchors = anchors.interior_anchors(count)?;
            by_position(&|i, _| {
                if i == 0 || i == last || anchors.contains(&i) {
                    Slot::Narration
                } else {
                    Slot::Visual
                }
            })
        }
        SequencePattern::BrollHeavy => by_position(&|i, _| {
            if i == 0 {
                Slot::Narration
            } else {
                Slot::Visual
            }
        }),
        SequencePattern::BrollFull => by_position(&|_, _| Slot::Visual),
        SequencePattern::Custom { steps } => {
            if steps.is_empty() {
                return Err(AssemblyError::InvalidPattern(
                    "custom sequence has no steps".to_string(),
                ));
            }
            steps
                .iter()
                .map(|step| {
                    let slot = match step.show {
                        StepVisual::Narration => Slot::Narration,
                        StepVisual::Visual => Slot::Visual,
                    };
                    (step.segment_id, slot)
                })
                .collect()
        }
    };
    Ok(planned)
}

struct Context<'a> {
    descriptor: &'a ScriptDescriptor,
    status: &'a StatusCache,
    options: &'a PlanOptions,
    durations: &'a dyn MediaDurations,
}

impl<'a> Context<'a> {
    fn has_linked_visual(&self, narration_id: SegmentId) -> bool {
        self.status.get(StatusKey::visual(narration_id)).is_some()
            || self.descriptor.visual_for(narration_id).is_some()
    }

    /// The curated visual for a narration: a generated asset from the status
    /// cache first, then an authored asset reference.
    fn linked_visual(&self, narration_id: SegmentId) -> Option<Result<VisualSource>> {
        let authored = self.descriptor.visual_for(narration_id);
        if let Some(record) = self.status.get(StatusKey::visual(narration_id)) {
            let Some(path) = record.ready_asset() else {
                return Some(Err(AssemblyError::IncompleteAssets {
                    segment_id: narration_id,
                    kind: ContentKind::Visual,
                    reason: format!("generation is {}", record.state),
                }));
            };
            let kind = authored
                .filter(|v| v.asset_ref == *path)
                .map(|v| v.asset_kind)
                .unwrap_or_else(|| AssetKind::from_path(path));
            return Some(Ok(VisualSource::Asset {
                path: path.clone(),
                kind,
                fallback: false,
            }));
        }
        authored.map(|v| {
            Ok(VisualSource::Asset {
                path: v.asset_ref.clone(),
                kind: v.asset_kind,
                fallback: false,
            })
        })
    }

    fn default_visual(&self, narration_id: SegmentId) -> Result<VisualSource> {
        let path = self
            .options
            .default_visual
            .as_ref()
            .ok_or_else(|| AssemblyError::IncompleteAssets {
                segment_id: narration_id,
                kind: ContentKind::Visual,
                reason: "no curated visual and no default asset configured".to_string(),
            })?;
        Ok(VisualSource::Asset {
            path: path.clone(),
            kind: AssetKind::from_path(path),
            fallback: true,
        })
    }

    fn narration_video(&self, narration: &NarrationSegment) -> Result<VisualSource> {
        let generated = self
            .status
            .get(StatusKey::narration(narration.id))
            .and_then(|r| r.ready_asset());
        match generated.or(narration.source_video_ref.as_ref()) {
            Some(path) => Ok(VisualSource::NarrationVideo {
                path: path.clone(),
                offset: self.descriptor.audio_offset(narration),
            }),
            None => Err(AssemblyError::IncompleteAssets {
                segment_id: narration.id,
                kind: ContentKind::Narration,
                reason: "narration has no video of its own".to_string(),
            }),
        }
    }

    fn require_narration_ready(&self, narration: &NarrationSegment) -> Result<()> {
        match self.status.get(StatusKey::narration(narration.id)) {
            Some(record) if record.state == GenerationState::Ready => Ok(()),
            Some(record) => Err(AssemblyError::IncompleteAssets {
                segment_id: narration.id,
                kind: ContentKind::Narration,
                reason: format!("generation is {}", record.state),
            }),
            None => Err(AssemblyError::StaleState {
                reason: format!("no narration record for {}", narration.id),
            }),
        }
    }

    fn visual_for_slot(&self, narration: &NarrationSegment, slot: Slot) -> Result<VisualSource> {
        match slot {
            Slot::Narration => self.narration_video(narration),
            Slot::VisualOrNarration => match self.linked_visual(narration.id) {
                Some(visual) => visual,
                None => self.narration_video(narration),
            },
            Slot::Visual => match self.linked_visual(narration.id) {
                Some(visual) => visual,
                None => self.default_visual(narration.id),
            },
        }
    }

    fn fit(
        &self,
        segment_id: SegmentId,
        visual: &VisualSource,
        target: f64,
    ) -> Result<(FitStrategy, Option<f64>)> {
        if visual.is_image() {
            return Ok((FitStrategy::None, None));
        }
        let offset = match visual {
            VisualSource::NarrationVideo { offset, .. } => *offset,
            VisualSource::Asset { .. } => 0.0,
        };
        let kind = if visual.is_narration() {
            ContentKind::Narration
        } else {
            ContentKind::Visual
        };
        let available = self
            .durations
            .duration_of(visual.path())
            .map(|len| len - offset)
            .filter(|len| *len > 0.0)
            .ok_or_else(|| AssemblyError::IncompleteAssets {
                segment_id,
                kind,
                reason: format!("length of {} is unknown", visual.path().display()),
            })?;
        Ok((
            FitStrategy::for_clip(available, target, self.options.tolerance),
            Some(available),
        ))
    }
}

/// Resolve a sequence pattern into timeline units. Every narration audio
/// window is consumed by exactly one unit; any result that would drop or
/// repeat one is rejected.
pub fn plan(
    descriptor: &ScriptDescriptor,
    status: &StatusCache,
    pattern: &SequencePattern,
    options: &PlanOptions,
    durations: &dyn MediaDurations,
) -> Result<Vec<TimelineUnit>> {
    check_fresh(descriptor, status)?;

    let narrations: Vec<&NarrationSegment> = descriptor.narrations().collect();
    let by_id: HashMap<SegmentId, &NarrationSegment> =
        narrations.iter().map(|n| (n.id, *n)).collect();
    let ctx = Context {
        descriptor,
        status,
        options,
        durations,
    };

    let planned = slots(pattern, &narrations, &ctx)?;
    verify_audio_coverage(planned.iter().map(|(id, _)| *id), &descriptor.narration_ids())?;

    let mut units = Vec::with_capacity(planned.len());
    for (segment_id, slot) in planned {
        let narration = by_id[&segment_id];
        ctx.require_narration_ready(narration)?;

        let target_duration = duration::resolve(narration, descriptor.audio_layout, durations)?;
        let visual_source = ctx.visual_for_slot(narration, slot)?;
        let (trim_or_loop_strategy, source_duration) =
            ctx.fit(segment_id, &visual_source, target_duration)?;

        units.push(TimelineUnit {
            segment_id,
            visual_source,
            audio_source: AudioWindow {
                segment_id,
                path: narration.source_audio_ref.clone(),
                offset: descriptor.audio_offset(narration),
                duration: target_duration,
            },
            target_duration,
            trim_or_loop_strategy,
            source_duration,
        });
    }

    verify_audio_coverage(
        units.iter().map(|u| u.audio_source.segment_id),
        &descriptor.narration_ids(),
    )?;
    verify_audio_windows(units.iter().map(|u| &u.audio_source))?;
    Ok(units)
}

/// Each narration id must appear exactly once in `used`.
pub fn verify_audio_coverage(
    used: impl IntoIterator<Item = SegmentId>,
    narration_ids: &[SegmentId],
) -> Result<()> {
    let mut seen: HashMap<SegmentId, usize> =
        narration_ids.iter().map(|&id| (id, 0)).collect();
    for id in used {
        let count = seen.get_mut(&id).ok_or_else(|| {
            AssemblyError::InvalidPattern(format!("{} is not a narration segment", id))
        })?;
        *count += 1;
        if *count > 1 {
            return Err(AssemblyError::AudioReuse { segment_id: id });
        }
    }
    if let Some(&missing) = narration_ids.iter().find(|id| seen[*id] == 0) {
        return Err(AssemblyError::AudioDropped {
            segment_id: missing,
        });
    }
    Ok(())
}

/// Windows cut from the same file must not intersect, whatever segments
/// they belong to. Touching ends are fine.
pub fn verify_audio_windows<'a>(windows: impl IntoIterator<Item = &'a AudioWindow>) -> Result<()> {
    let mut by_file: BTreeMap<&Path, Vec<&AudioWindow>> = BTreeMap::new();
    for window in windows {
        by_file.entry(window.path.as_path()).or_default().push(window);
    }
    for windows in by_file.values_mut() {
        windows.sort_by(|a, b| a.offset.total_cmp(&b.offset));
        let mut covered_until = f64::NEG_INFINITY;
        for window in windows.iter() {
            if window.offset + WINDOW_EPSILON < covered_until {
                return Err(AssemblyError::AudioReuse {
                    segment_id: window.segment_id,
                });
            }
            covered_until = covered_until.max(window.offset + window.duration);
        }
    }
    Ok(())
}

const WINDOW_EPSILON: f64 = 1e-6;
