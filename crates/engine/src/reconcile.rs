use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{AssemblyError, Result};
use crate::script::{ScriptDescriptor, Segment, SegmentId};
use crate::status::{ContentKind, ContentStatus, GenerationState, StatusCache, StatusKey};

/// One difference found between the descriptor and the status cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "drift", rename_all = "snake_case")]
pub enum Drift {
    /// Expected visual without a status record; a pending one was inserted.
    MissingVisual { segment_id: SegmentId },
    /// Visual record no longer expected; dropped, its asset is not reused.
    StaleVisual {
        segment_id: SegmentId,
        state: GenerationState,
    },
    MissingNarration { segment_id: SegmentId },
    StaleNarration { segment_id: SegmentId },
    /// Authored visual pointing at a narration segment that no longer exists.
    DanglingVisual {
        visual_id: SegmentId,
        linked_narration_id: SegmentId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub descriptor: ScriptDescriptor,
    pub status: StatusCache,
    pub drifts: Vec<Drift>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.drifts.is_empty()
    }
}

/// `round(density × narration_count)`, with density clamped to `[0, 1]`.
pub fn expected_visual_count(visual_density: f64, narration_count: usize) -> usize {
    if narration_count == 0 || !visual_density.is_finite() {
        return 0;
    }
    let density = visual_density.clamp(0.0, 1.0);
    let count = (density * narration_count as f64).round() as usize;
    count.min(narration_count)
}

/// Indices of the narration segments that receive a visual: spread evenly,
/// always including the first, and the last whenever two or more are placed.
pub fn visual_positions(count: usize, narration_count: usize) -> Vec<usize> {
    let count = count.min(narration_count);
    match count {
        0 => Vec::new(),
        1 => vec![0],
        k => {
            let span = narration_count - 1;
            let steps = k - 1;
            // round(j * span / steps) in integer arithmetic
            (0..k)
                .map(|j| (2 * j * span + steps) / (2 * steps))
                .collect()
        }
    }
}

pub fn expected_visual_ids(descriptor: &ScriptDescriptor) -> BTreeSet<SegmentId> {
    let narration_ids = descriptor.narration_ids();
    let count = expected_visual_count(descriptor.visual_density, narration_ids.len());
    visual_positions(count, narration_ids.len())
        .into_iter()
        .map(|i| narration_ids[i])
        .collect()
}

/// Bring the status cache in line with the descriptor. Pure: the same inputs
/// always give the same output, and reconciling a reconciled pair is a no-op.
pub fn reconcile(descriptor: &ScriptDescriptor, status: &StatusCache) -> Reconciliation {
    let narration_ids: BTreeSet<SegmentId> = descriptor.narration_ids().into_iter().collect();
    let expected_visuals = expected_visual_ids(descriptor);
    let mut drifts = Vec::new();

    // Visuals linked to a narration that is gone are pruned from the script.
    let mut next_descriptor = descriptor.clone();
    next_descriptor.segments.retain(|segment| match segment {
        Segment::Visual(v) if !narration_ids.contains(&v.linked_narration_id) => {
            drifts.push(Drift::DanglingVisual {
                visual_id: v.id,
                linked_narration_id: v.linked_narration_id,
            });
            false
        }
        _ => true,
    });
    let pruned = next_descriptor.segments.len() != descriptor.segments.len();

    let mut records = Vec::with_capacity(narration_ids.len() + expected_visuals.len());
    for (kind, expected) in [
        (ContentKind::Narration, &narration_ids),
        (ContentKind::Visual, &expected_visuals),
    ] {
        for &segment_id in expected {
            let key = StatusKey { kind, segment_id };
            match status.get(key) {
                Some(existing) => records.push(existing.clone()),
                None => {
                    drifts.push(match kind {
                        ContentKind::Narration => Drift::MissingNarration { segment_id },
                        ContentKind::Visual => Drift::MissingVisual { segment_id },
                    });
                    records.push(ContentStatus::pending(kind, segment_id));
                }
            }
        }
    }

    for record in status.records() {
        let keep = match record.kind {
            ContentKind::Narration => narration_ids.contains(&record.segment_id),
            ContentKind::Visual => expected_visuals.contains(&record.segment_id),
        };
        if keep {
            continue;
        }
        drifts.push(match record.kind {
            ContentKind::Narration => Drift::StaleNarration {
                segment_id: record.segment_id,
            },
            ContentKind::Visual => Drift::StaleVisual {
                segment_id: record.segment_id,
                state: record.state,
            },
        });
    }

    if expected_visuals != status.visual_ids() || pruned {
        next_descriptor.version += 1;
    }

    Reconciliation {
        descriptor: next_descriptor,
        status: StatusCache::from_records(records),
        drifts,
    }
}

/// Fails with `StaleState` when the cache doesn't match what the descriptor
/// implies.
pub fn check_fresh(descriptor: &ScriptDescriptor, status: &StatusCache) -> Result<()> {
    let expected = expected_visual_ids(descriptor);
    let actual = status.visual_ids();
    if expected != actual {
        return Err(AssemblyError::StaleState {
            reason: format!(
                "expected {} visual records, found {}",
                expected.len(),
                actual.len()
            ),
        });
    }
    let narrations: BTreeSet<SegmentId> = descriptor.narration_ids().into_iter().collect();
    if narrations != status.ids(ContentKind::Narration) {
        return Err(AssemblyError::StaleState {
            reason: "narration records don't match the script".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::fixtures::script;
    use crate::script::{AssetKind, VisualSegment};
    use chrono::Utc;
    use std::path::PathBuf;

    fn ids(values: &[u32]) -> BTreeSet<SegmentId> {
        values.iter().map(|&v| SegmentId(v)).collect()
    }

    #[test]
    fn quarter_density_over_eight_uses_first_and_last() {
        let descriptor = script(8, 2.0, 0.25);
        let result = reconcile(&descriptor, &StatusCache::new());
        assert_eq!(result.status.visual_ids(), ids(&[0, 7]));
        assert_eq!(result.descriptor.version, descriptor.version + 1);
        check_fresh(&result.descriptor, &result.status).unwrap();
    }

    #[test]
    fn count_matches_rounded_density() {
        for n in 0..20u32 {
            for step in 0..=20 {
                let density = step as f64 / 20.0;
                let descriptor = script(n, 1.0, density);
                let result = reconcile(&descriptor, &StatusCache::new());
                let expected = (density * n as f64).round() as usize;
                assert_eq!(result.status.visual_ids().len(), expected, "n={n} d={density}");
                assert_eq!(result.status.ids(ContentKind::Narration).len(), n as usize);
            }
        }
    }

    #[test]
    fn placement_always_spans_first_and_last() {
        for n in 2..30usize {
            for k in 2..=n {
                let positions = visual_positions(k, n);
                assert_eq!(positions.len(), k);
                assert_eq!(positions[0], 0);
                assert_eq!(*positions.last().unwrap(), n - 1);
                assert!(positions.windows(2).all(|w| w[0] < w[1]), "n={n} k={k}");
            }
        }
    }

    #[test]
    fn second_pass_is_a_noop() {
        let descriptor = script(6, 1.5, 0.5);
        let first = reconcile(&descriptor, &StatusCache::new());
        let second = reconcile(&first.descriptor, &first.status);
        assert!(second.is_noop());
        assert_eq!(second.status, first.status);
        assert_eq!(second.descriptor.version, first.descriptor.version);
    }

    #[test]
    fn raising_density_keeps_ready_visuals() {
        let descriptor = script(8, 2.0, 0.25);
        let first = reconcile(&descriptor, &StatusCache::new());
        let mut status = first.status.clone();
        for id in [0, 7] {
            status = status
                .mark_ready(
                    StatusKey::visual(SegmentId(id)),
                    PathBuf::from(format!("broll/{id}.png")),
                    Utc::now(),
                )
                .unwrap();
        }

        let mut denser = first.descriptor.clone();
        denser.visual_density = 0.5;
        let second = reconcile(&denser, &status);

        assert_eq!(second.status.visual_ids(), ids(&[0, 2, 5, 7]));
        for id in [0, 7] {
            let record = second.status.get(StatusKey::visual(SegmentId(id))).unwrap();
            assert_eq!(record.state, GenerationState::Ready);
        }
        let missing: Vec<_> = second
            .drifts
            .iter()
            .filter_map(|d| match d {
                Drift::MissingVisual { segment_id } => Some(*segment_id),
                _ => None,
            })
            .collect();
        assert_eq!(missing, vec![SegmentId(2), SegmentId(5)]);
        assert_eq!(second.descriptor.version, first.descriptor.version + 1);
    }

    #[test]
    fn lowering_density_drops_unexpected_records() {
        let descriptor = script(8, 2.0, 0.5);
        let first = reconcile(&descriptor, &StatusCache::new());
        let status = first
            .status
            .mark_ready(StatusKey::visual(SegmentId(2)), PathBuf::from("b.png"), Utc::now())
            .unwrap();

        let mut sparser = first.descriptor.clone();
        sparser.visual_density = 0.25;
        let second = reconcile(&sparser, &status);

        assert_eq!(second.status.visual_ids(), ids(&[0, 7]));
        assert!(second.drifts.contains(&Drift::StaleVisual {
            segment_id: SegmentId(2),
            state: GenerationState::Ready,
        }));
    }

    #[test]
    fn removed_narration_prunes_records_and_links() {
        let mut descriptor = script(3, 1.0, 0.0);
        descriptor.segments.push(Segment::Visual(VisualSegment {
            id: SegmentId(100),
            linked_narration_id: SegmentId(2),
            asset_ref: PathBuf::from("broll/2.png"),
            asset_kind: AssetKind::Image,
            prompt: None,
        }));
        let first = reconcile(&descriptor, &StatusCache::new());

        let mut edited = first.descriptor.clone();
        edited
            .segments
            .retain(|s| !matches!(s, Segment::Narration(n) if n.id == SegmentId(2)));
        let second = reconcile(&edited, &first.status);

        assert!(second.drifts.contains(&Drift::StaleNarration {
            segment_id: SegmentId(2)
        }));
        assert!(second.drifts.contains(&Drift::DanglingVisual {
            visual_id: SegmentId(100),
            linked_narration_id: SegmentId(2),
        }));
        assert_eq!(second.descriptor.visuals().count(), 0);
        assert_eq!(second.descriptor.version, first.descriptor.version + 1);
    }

    #[test]
    fn stale_cache_is_detected() {
        let descriptor = script(4, 1.0, 0.5);
        let err = check_fresh(&descriptor, &StatusCache::new()).unwrap_err();
        assert!(matches!(err, AssemblyError::StaleState { .. }));
    }
}
