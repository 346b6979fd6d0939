use serde::{Deserialize, Serialize};
use std::fmt;

use crate::script::SegmentId;
use crate::status::ContentKind;

pub type Result<T> = std::result::Result<T, AssemblyError>;

/// Pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Reconcile,
    Duration,
    Plan,
    Transform,
    Concatenate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Reconcile => "reconcile",
            Stage::Duration => "duration",
            Stage::Plan => "plan",
            Stage::Transform => "transform",
            Stage::Concatenate => "concatenate",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    /// Descriptor and status cache disagree; fixed by reconciling.
    #[error("status cache is stale: {reason}")]
    StaleState { reason: String },

    /// A unit needs an asset that isn't ready yet.
    #[error("{kind} asset for {segment_id} is not ready: {reason}")]
    IncompleteAssets {
        segment_id: SegmentId,
        kind: ContentKind,
        reason: String,
    },

    #[error("no resolvable duration for narration {segment_id}")]
    DurationResolution { segment_id: SegmentId },

    #[error("narration audio of {segment_id} would be used more than once")]
    AudioReuse { segment_id: SegmentId },

    #[error("narration audio of {segment_id} is not used by any unit")]
    AudioDropped { segment_id: SegmentId },

    #[error("invalid sequence pattern: {0}")]
    InvalidPattern(String),

    #[error("transform failed for {segment_id}: {message}")]
    Transform {
        segment_id: SegmentId,
        message: String,
    },

    #[error("concatenation failed: {0}")]
    Concatenation(String),

    #[error("assembly cancelled")]
    Cancelled,
}

impl AssemblyError {
    pub fn stage(&self) -> Stage {
        match self {
            AssemblyError::StaleState { .. } => Stage::Reconcile,
            AssemblyError::DurationResolution { .. } => Stage::Duration,
            AssemblyError::IncompleteAssets { .. }
            | AssemblyError::AudioReuse { .. }
            | AssemblyError::AudioDropped { .. }
            | AssemblyError::InvalidPattern(_) => Stage::Plan,
            AssemblyError::Transform { .. } | AssemblyError::Cancelled => Stage::Transform,
            AssemblyError::Concatenation(_) => Stage::Concatenate,
        }
    }

    pub fn segment_id(&self) -> Option<SegmentId> {
        match self {
            AssemblyError::IncompleteAssets { segment_id, .. }
            | AssemblyError::DurationResolution { segment_id }
            | AssemblyError::AudioReuse { segment_id }
            | AssemblyError::AudioDropped { segment_id }
            | AssemblyError::Transform { segment_id, .. } => Some(*segment_id),
            _ => None,
        }
    }

    /// Whether retrying after reconciling or waiting on generation can help.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AssemblyError::StaleState { .. } | AssemblyError::IncompleteAssets { .. }
        )
    }

    pub fn transform(segment_id: SegmentId, message: impl Into<String>) -> Self {
        AssemblyError::Transform {
            segment_id,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_carry_stage_and_segment() {
        let err = AssemblyError::IncompleteAssets {
            segment_id: SegmentId(4),
            kind: ContentKind::Visual,
            reason: "pending".into(),
        };
        assert_eq!(err.stage(), Stage::Plan);
        assert_eq!(err.segment_id(), Some(SegmentId(4)));
        assert!(err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "visual asset for segment_4 is not ready: pending"
        );

        let err = AssemblyError::Concatenation("exit status 1".into());
        assert_eq!(err.stage(), Stage::Concatenate);
        assert_eq!(err.segment_id(), None);
        assert!(!err.is_recoverable());
    }
}
