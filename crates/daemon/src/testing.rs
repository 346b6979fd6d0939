//! Shared fixtures for daemon tests.

use chrono::Utc;
use engine::{
    AudioLayout, ContentKind, NarrationSegment, ScriptDescriptor, Segment, SegmentId,
};
use std::path::PathBuf;

use crate::db::Database;
use crate::media::fake::FakeTranscoder;

pub const AROLL: &str = "/media/aroll/full.mp4";
pub const TRACK: &str = "/media/narration/track.wav";

pub fn broll(segment_id: u32) -> PathBuf {
    PathBuf::from(format!("/media/broll/segment_{}.mp4", segment_id))
}

/// `count` back-to-back narrations of `len` seconds over one recorded a-roll.
pub fn script(count: u32, len: f64, density: f64) -> ScriptDescriptor {
    let mut descriptor = ScriptDescriptor::new(density);
    descriptor.audio_layout = AudioLayout::SharedTrack;
    for i in 0..count {
        descriptor.segments.push(Segment::Narration(NarrationSegment {
            id: SegmentId(i),
            start_time: Some(i as f64 * len),
            end_time: Some((i + 1) as f64 * len),
            source_audio_ref: PathBuf::from(TRACK),
            source_video_ref: Some(PathBuf::from(AROLL)),
            text: None,
        }));
    }
    descriptor
}

/// Store and reconcile the script, then mark every record ready: narrations
/// with the a-roll, visuals with their b-roll clip.
pub fn ready_project(db: &Database, project_id: i64, count: u32, len: f64, density: f64) {
    db.put_script(project_id, &script(count, len, density))
        .unwrap();
    db.reconcile_project(project_id).unwrap();
    db.update_status(project_id, |status| {
        let mut next = status.clone();
        for record in status.records() {
            let path = match record.kind {
                ContentKind::Narration => PathBuf::from(AROLL),
                ContentKind::Visual => broll(record.segment_id.0),
            };
            next = next.mark_ready(record.key(), path, Utc::now())?;
        }
        Ok(next)
    })
    .unwrap();
}

/// Knows the a-roll and b-roll lengths used by `ready_project`.
pub fn transcoder(count: u32, len: f64, broll_len: f64) -> FakeTranscoder {
    (0..count).fold(
        FakeTranscoder::new().with_media(AROLL, count as f64 * len),
        |fake, i| fake.with_media(broll(i), broll_len),
    )
}
