use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{AssemblyError, Result};
use crate::script::{AudioLayout, NarrationSegment};

/// Measured lengths of media files, filled in by whoever can probe them.
pub trait MediaDurations {
    fn duration_of(&self, path: &Path) -> Option<f64>;
}

impl MediaDurations for HashMap<PathBuf, f64> {
    fn duration_of(&self, path: &Path) -> Option<f64> {
        self.get(path).copied().filter(|d| d.is_finite() && *d > 0.0)
    }
}

/// No measurements available; only authored bounds resolve.
pub struct Unmeasured;

impl MediaDurations for Unmeasured {
    fn duration_of(&self, _path: &Path) -> Option<f64> {
        None
    }
}

/// Target duration of every unit that plays this narration's audio.
/// Authored bounds win. A narration with its own file may fall back to the
/// measured length of that file; one cut from a shared track may not, since
/// the whole track would cover its neighbours.
pub fn resolve(
    narration: &NarrationSegment,
    layout: AudioLayout,
    measured: &dyn MediaDurations,
) -> Result<f64> {
    if let Some((start, end)) = narration.bounds() {
        return Ok(end - start);
    }
    if layout == AudioLayout::SharedTrack {
        return Err(AssemblyError::DurationResolution {
            segment_id: narration.id,
        });
    }
    measured
        .duration_of(&narration.source_audio_ref)
        .ok_or(AssemblyError::DurationResolution {
            segment_id: narration.id,
        })
}

/// Whether resolving this narration needs its audio probed.
pub fn needs_measurement(narration: &NarrationSegment, layout: AudioLayout) -> bool {
    layout == AudioLayout::PerSegment && narration.bounds().is_none()
}
