use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use crate::error::{AssemblyError, Result};
use crate::script::SegmentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Narration,
    Visual,
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentKind::Narration => f.write_str("narration"),
            ContentKind::Visual => f.write_str("visual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Pending,
    Generating,
    Ready,
    Failed,
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GenerationState::Pending => "pending",
            GenerationState::Generating => "generating",
            GenerationState::Ready => "ready",
            GenerationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentStatus {
    pub segment_id: SegmentId,
    pub kind: ContentKind,
    pub state: GenerationState,
    #[serde(default)]
    pub asset_path: Option<PathBuf>,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ContentStatus {
    pub fn pending(kind: ContentKind, segment_id: SegmentId) -> Self {
        ContentStatus {
            segment_id,
            kind,
            state: GenerationState::Pending,
            asset_path: None,
            generated_at: None,
            error: None,
        }
    }

    pub fn key(&self) -> StatusKey {
        StatusKey {
            kind: self.kind,
            segment_id: self.segment_id,
        }
    }

    /// Ready with a known asset location.
    pub fn ready_asset(&self) -> Option<&PathBuf> {
        match self.state {
            GenerationState::Ready => self.asset_path.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StatusKey {
    pub kind: ContentKind,
    pub segment_id: SegmentId,
}

impl StatusKey {
    pub fn narration(segment_id: SegmentId) -> Self {
        StatusKey {
            kind: ContentKind::Narration,
            segment_id,
        }
    }

    pub fn visual(segment_id: SegmentId) -> Self {
        StatusKey {
            kind: ContentKind::Visual,
            segment_id,
        }
    }
}

/// Generation-status cache. Every transition returns a new cache; nothing is
/// edited in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<ContentStatus>", into = "Vec<ContentStatus>")]
pub struct StatusCache {
    records: BTreeMap<StatusKey, ContentStatus>,
}

impl From<Vec<ContentStatus>> for StatusCache {
    fn from(records: Vec<ContentStatus>) -> Self {
        StatusCache::from_records(records)
    }
}

impl From<StatusCache> for Vec<ContentStatus> {
    fn from(cache: StatusCache) -> Self {
        cache.records.into_values().collect()
    }
}

impl StatusCache {
    pub fn new() -> Self {
        StatusCache::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = ContentStatus>) -> Self {
        StatusCache {
            records: records.into_iter().map(|r| (r.key(), r)).collect(),
        }
    }

    pub fn get(&self, key: StatusKey) -> Option<&ContentStatus> {
        self.records.get(&key)
    }

    pub fn records(&self) -> impl Iterator<Item = &ContentStatus> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self, kind: ContentKind) -> BTreeSet<SegmentId> {
        self.records
            .keys()
            .filter(|k| k.kind == kind)
            .map(|k| k.segment_id)
            .collect()
    }

    pub fn visual_ids(&self) -> BTreeSet<SegmentId> {
        self.ids(ContentKind::Visual)
    }

    pub fn with_record(&self, record: ContentStatus) -> StatusCache {
        let mut next = self.clone();
        next.records.insert(record.key(), record);
        next
    }

    pub fn without(&self, key: StatusKey) -> StatusCache {
        let mut next = self.clone();
        next.records.remove(&key);
        next
    }

    fn transition(
        &self,
        key: StatusKey,
        apply: impl FnOnce(&mut ContentStatus),
    ) -> Result<StatusCache> {
        let mut next = self.clone();
        let record = next.records.get_mut(&key).ok_or_else(|| AssemblyError::StaleState {
            reason: format!("no {} record for {}", key.kind, key.segment_id),
        })?;
        apply(record);
        Ok(next)
    }

    pub fn mark_generating(&self, key: StatusKey) -> Result<StatusCache> {
        self.transition(key, |r| {
            r.state = GenerationState::Generating;
            r.error = None;
        })
    }

    pub fn mark_ready(
        &self,
        key: StatusKey,
        asset_path: PathBuf,
        at: DateTime<Utc>,
    ) -> Result<StatusCache> {
        self.transition(key, |r| {
            r.state = GenerationState::Ready;
            r.asset_path = Some(asset_path);
            r.generated_at = Some(at);
            r.error = None;
        })
    }

    pub fn mark_failed(&self, key: StatusKey, error: impl Into<String>) -> Result<StatusCache> {
        let error = error.into();
        self.transition(key, |r| {
            r.state = GenerationState::Failed;
            r.error = Some(error);
        })
    }

    /// Forget the produced asset so the collaborator generates it again.
    pub fn request_regeneration(&self, key: StatusKey) -> Result<StatusCache> {
        self.transition(key, |r| {
            *r = ContentStatus::pending(r.kind, r.segment_id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> StatusCache {
        StatusCache::from_records(vec![
            ContentStatus::pending(ContentKind::Narration, SegmentId(0)),
            ContentStatus::pending(ContentKind::Visual, SegmentId(0)),
            ContentStatus::pending(ContentKind::Visual, SegmentId(3)),
        ])
    }

    #[test]
    fn transitions_leave_the_original_untouched() {
        let before = cache();
        let at = Utc::now();
        let after = before
            .mark_ready(StatusKey::visual(SegmentId(3)), PathBuf::from("broll/3.png"), at)
            .unwrap();

        let old = before.get(StatusKey::visual(SegmentId(3))).unwrap();
        assert_eq!(old.state, GenerationState::Pending);
        let new = after.get(StatusKey::visual(SegmentId(3))).unwrap();
        assert_eq!(new.ready_asset(), Some(&PathBuf::from("broll/3.png")));
        assert_eq!(new.generated_at, Some(at));
    }

    #[test]
    fn regeneration_clears_asset() {
        let key = StatusKey::visual(SegmentId(0));
        let cache = cache()
            .mark_ready(key, PathBuf::from("broll/0.mp4"), Utc::now())
            .unwrap()
            .request_regeneration(key)
            .unwrap();
        let record = cache.get(key).unwrap();
        assert_eq!(record.state, GenerationState::Pending);
        assert!(record.asset_path.is_none());
        assert!(record.ready_asset().is_none());
    }

    #[test]
    fn unknown_record_is_stale() {
        let err = cache()
            .mark_failed(StatusKey::visual(SegmentId(9)), "boom")
            .unwrap_err();
        assert!(matches!(err, AssemblyError::StaleState { .. }));
    }

    #[test]
    fn serializes_as_a_list() {
        let cache = cache();
        let json = serde_json::to_value(&cache).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 3);
        let back: StatusCache = serde_json::from_value(json).unwrap();
        assert_eq!(back, cache);
        assert_eq!(back.visual_ids().len(), 2);
    }
}
