use serde::{Deserialize, Serialize};

use crate::script::{
    AudioLayout, NarrationSegment, ScriptDescriptor, Segment, SegmentId, VisualSegment,
};

// Bounds closer than this are treated as touching.
const OVERLAP_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EditError {
    #[error("visual density {0} is outside [0, 1]")]
    InvalidDensity(f64),
    #[error("narration {0} already exists")]
    DuplicateSegment(SegmentId),
    #[error("narration {0} not found")]
    NarrationNotFound(SegmentId),
    #[error("no visual linked to narration {0}")]
    VisualNotFound(SegmentId),
    #[error("narration {0} has end_time not after start_time")]
    InvalidBounds(SegmentId),
    #[error("narration {first} overlaps {second}")]
    Overlap { first: SegmentId, second: SegmentId },
}

/// An authored change to the script. Edits never touch generation status;
/// reconcile afterwards to bring the status cache in line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ScriptOperation {
    SetVisualDensity { density: f64 },
    InsertNarration { segment: NarrationSegment },
    RemoveNarration { segment_id: SegmentId },
    UpdateNarrationBounds {
        segment_id: SegmentId,
        start_time: Option<f64>,
        end_time: Option<f64>,
    },
    AttachVisual { visual: VisualSegment },
    DetachVisual { narration_id: SegmentId },
    SetAudioLayout { layout: AudioLayout },
}

impl ScriptDescriptor {
    pub fn apply_operation(&mut self, op: ScriptOperation) -> Result<(), EditError> {
        match op {
            ScriptOperation::SetVisualDensity { density } => {
                if !density.is_finite() || !(0.0..=1.0).contains(&density) {
                    return Err(EditError::InvalidDensity(density));
                }
                self.visual_density = density;
                Ok(())
            }
            ScriptOperation::InsertNarration { segment } => {
                if self.narration(segment.id).is_some() {
                    return Err(EditError::DuplicateSegment(segment.id));
                }
                check_bounds(&segment)?;

                // Keep narration order by start time; unbounded segments go last
                let insert_at = segment
                    .bounds()
                    .and_then(|(start, _)| {
                        self.segments.iter().position(|s| match s {
                            Segment::Narration(n) => {
                                n.bounds().map(|(other, _)| other > start).unwrap_or(true)
                            }
                            Segment::Visual(_) => false,
                        })
                    })
                    .unwrap_or(self.segments.len());
                self.segments.insert(insert_at, Segment::Narration(segment));
                if let Err(e) = self.validate() {
                    self.segments.remove(insert_at);
                    return Err(e);
                }
                Ok(())
            }
            ScriptOperation::RemoveNarration { segment_id } => {
                if self.narration(segment_id).is_none() {
                    return Err(EditError::NarrationNotFound(segment_id));
                }
                self.segments.retain(|s| match s {
                    Segment::Narration(n) => n.id != segment_id,
                    Segment::Visual(v) => v.linked_narration_id != segment_id,
                });
                Ok(())
            }
            ScriptOperation::UpdateNarrationBounds {
                segment_id,
                start_time,
                end_time,
            } => {
                let mut updated = self
                    .narration(segment_id)
                    .cloned()
                    .ok_or(EditError::NarrationNotFound(segment_id))?;
                updated.start_time = start_time;
                updated.end_time = end_time;
                check_bounds(&updated)?;

                let previous = self.clone();
                for segment in &mut self.segments {
                    if matches!(segment, Segment::Narration(n) if n.id == segment_id) {
                        *segment = Segment::Narration(updated.clone());
                    }
                }
                if let Err(e) = self.validate() {
                    *self = previous;
                    return Err(e);
                }
                Ok(())
            }
            ScriptOperation::AttachVisual { visual } => {
                if self.narration(visual.linked_narration_id).is_none() {
                    return Err(EditError::NarrationNotFound(visual.linked_narration_id));
                }
                // One visual per narration: attaching replaces
                let linked = visual.linked_narration_id;
                match self.segments.iter_mut().find_map(|s| match s {
                    Segment::Visual(v) if v.linked_narration_id == linked => Some(v),
                    _ => None,
                }) {
                    Some(existing) => *existing = visual,
                    None => self.segments.push(Segment::Visual(visual)),
                }
                Ok(())
            }
            ScriptOperation::DetachVisual { narration_id } => {
                let before = self.segments.len();
                self.segments.retain(|s| {
                    !matches!(s, Segment::Visual(v) if v.linked_narration_id == narration_id)
                });
                if self.segments.len() == before {
                    return Err(EditError::VisualNotFound(narration_id));
                }
                Ok(())
            }
            ScriptOperation::SetAudioLayout { layout } => {
                self.audio_layout = layout;
                Ok(())
            }
        }
    }

    /// Narration ids are unique, and bounded narrations are ordered by start
    /// time without overlapping.
    pub fn validate(&self) -> Result<(), EditError> {
        if !self.visual_density.is_finite() || !(0.0..=1.0).contains(&self.visual_density) {
            return Err(EditError::InvalidDensity(self.visual_density));
        }
        let mut seen = std::collections::HashSet::new();
        let mut previous: Option<(SegmentId, f64, f64)> = None;
        for narration in self.narrations() {
            if !seen.insert(narration.id) {
                return Err(EditError::DuplicateSegment(narration.id));
            }
            check_bounds(narration)?;
            let Some((start, end)) = narration.bounds() else {
                continue;
            };
            if let Some((prev_id, prev_start, prev_end)) = previous {
                if start < prev_start || start + OVERLAP_EPSILON < prev_end {
                    return Err(EditError::Overlap {
                        first: prev_id,
                        second: narration.id,
                    });
                }
            }
            previous = Some((narration.id, start, end));
        }
        Ok(())
    }
}

fn check_bounds(narration: &NarrationSegment) -> Result<(), EditError> {
    match (narration.start_time, narration.end_time) {
        (Some(start), Some(end)) if end <= start || start < 0.0 => {
            Err(EditError::InvalidBounds(narration.id))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::fixtures::script;
    use crate::script::AssetKind;
    use std::path::PathBuf;

    fn narration(id: u32, start: f64, end: f64) -> NarrationSegment {
        NarrationSegment {
            id: SegmentId(id),
            start_time: Some(start),
            end_time: Some(end),
            source_audio_ref: PathBuf::from("narration/track.wav"),
            source_video_ref: None,
            text: None,
        }
    }

    fn visual(id: u32, linked: u32, path: &str) -> VisualSegment {
        VisualSegment {
            id: SegmentId(id),
            linked_narration_id: SegmentId(linked),
            asset_ref: PathBuf::from(path),
            asset_kind: AssetKind::from_path(std::path::Path::new(path)),
            prompt: None,
        }
    }

    #[test]
    fn insert_keeps_start_order() {
        let mut descriptor = script(2, 2.0, 0.0);
        descriptor
            .apply_operation(ScriptOperation::UpdateNarrationBounds {
                segment_id: SegmentId(1),
                start_time: Some(6.0),
                end_time: Some(8.0),
            })
            .unwrap();
        descriptor
            .apply_operation(ScriptOperation::InsertNarration {
                segment: narration(9, 2.0, 6.0),
            })
            .unwrap();
        assert_eq!(
            descriptor.narration_ids(),
            vec![SegmentId(0), SegmentId(9), SegmentId(1)]
        );
    }

    #[test]
    fn overlapping_insert_is_rejected_and_rolled_back() {
        let mut descriptor = script(3, 2.0, 0.0);
        let err = descriptor
            .apply_operation(ScriptOperation::InsertNarration {
                segment: narration(7, 1.0, 3.0),
            })
            .unwrap_err();
        assert!(matches!(err, EditError::Overlap { .. }));
        assert_eq!(descriptor.narrations().count(), 3);
    }

    #[test]
    fn duplicate_and_bad_bounds() {
        let mut descriptor = script(2, 2.0, 0.0);
        assert_eq!(
            descriptor.apply_operation(ScriptOperation::InsertNarration {
                segment: narration(1, 10.0, 11.0),
            }),
            Err(EditError::DuplicateSegment(SegmentId(1)))
        );
        let before = descriptor.clone();
        assert_eq!(
            descriptor.apply_operation(ScriptOperation::UpdateNarrationBounds {
                segment_id: SegmentId(0),
                start_time: Some(1.0),
                end_time: Some(1.0),
            }),
            Err(EditError::InvalidBounds(SegmentId(0)))
        );
        assert_eq!(
            descriptor.apply_operation(ScriptOperation::UpdateNarrationBounds {
                segment_id: SegmentId(0),
                start_time: Some(0.0),
                end_time: Some(3.0),
            }),
            Err(EditError::Overlap {
                first: SegmentId(0),
                second: SegmentId(1)
            })
        );
        assert_eq!(descriptor, before);
    }

    #[test]
    fn removing_narration_drops_its_visual() {
        let mut descriptor = script(3, 2.0, 0.0);
        descriptor
            .apply_operation(ScriptOperation::AttachVisual {
                visual: visual(20, 1, "broll/1.png"),
            })
            .unwrap();
        descriptor
            .apply_operation(ScriptOperation::RemoveNarration {
                segment_id: SegmentId(1),
            })
            .unwrap();
        assert_eq!(descriptor.visuals().count(), 0);
        assert_eq!(descriptor.narration_ids(), vec![SegmentId(0), SegmentId(2)]);
    }

    #[test]
    fn attach_replaces_and_detach_removes() {
        let mut descriptor = script(2, 2.0, 0.0);
        descriptor
            .apply_operation(ScriptOperation::AttachVisual {
                visual: visual(20, 0, "broll/a.png"),
            })
            .unwrap();
        descriptor
            .apply_operation(ScriptOperation::AttachVisual {
                visual: visual(21, 0, "broll/b.mp4"),
            })
            .unwrap();
        let linked = descriptor.visual_for(SegmentId(0)).unwrap();
        assert_eq!(linked.id, SegmentId(21));
        assert_eq!(linked.asset_kind, AssetKind::Clip);
        assert_eq!(descriptor.visuals().count(), 1);

        descriptor
            .apply_operation(ScriptOperation::DetachVisual {
                narration_id: SegmentId(0),
            })
            .unwrap();
        assert_eq!(
            descriptor.apply_operation(ScriptOperation::DetachVisual {
                narration_id: SegmentId(0),
            }),
            Err(EditError::VisualNotFound(SegmentId(0)))
        );
        assert_eq!(
            descriptor.apply_operation(ScriptOperation::AttachVisual {
                visual: visual(22, 5, "broll/c.png"),
            }),
            Err(EditError::NarrationNotFound(SegmentId(5)))
        );
    }

    #[test]
    fn density_is_bounded() {
        let mut descriptor = script(2, 2.0, 0.0);
        assert_eq!(
            descriptor.apply_operation(ScriptOperation::SetVisualDensity { density: 1.5 }),
            Err(EditError::InvalidDensity(1.5))
        );
        descriptor
            .apply_operation(ScriptOperation::SetVisualDensity { density: 0.5 })
            .unwrap();
        assert_eq!(descriptor.visual_density, 0.5);
    }

    #[test]
    fn operations_are_tagged_in_json() {
        let op: ScriptOperation =
            serde_json::from_str(r#"{"type": "SetVisualDensity", "density": 0.25}"#).unwrap();
        assert_eq!(op, ScriptOperation::SetVisualDensity { density: 0.25 });
    }
}
