//! Drives one assembly end to end: reconcile, measure, plan, render every
//! unit, join them, checksum the result.

use anyhow::{Context, Result};
use engine::duration::needs_measurement;
use engine::planner::{self, PlanOptions, SequencePattern};
use engine::reconcile::{self, Drift};
use engine::render::{self, TransformSpec};
use engine::{
    AssemblyError, AssemblyPlan, AssetKind, RenderSettings, ScriptDescriptor, SegmentId, Stage,
    StatusCache, TimelineUnit,
};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::db::Database;
use crate::media::{compute_file_checksum, ClipRef, Transcoder};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyRequest {
    pub project_id: i64,
    pub pattern: SequencePattern,
    pub output_path: PathBuf,
    /// Overrides the daemon's configured default visual.
    #[serde(default)]
    pub default_visual: Option<PathBuf>,
    #[serde(default)]
    pub settings: Option<RenderSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyFailure {
    /// `None` for errors outside the pipeline proper, such as storage.
    pub stage: Option<Stage>,
    pub segment_id: Option<SegmentId>,
    pub message: String,
}

impl AssemblyFailure {
    pub fn from_error(e: &anyhow::Error) -> Self {
        match e.downcast_ref::<AssemblyError>() {
            Some(err) => AssemblyFailure {
                stage: Some(err.stage()),
                segment_id: err.segment_id(),
                message: err.to_string(),
            },
            None => AssemblyFailure {
                stage: None,
                segment_id: None,
                message: format!("{:#}", e),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyResult {
    pub status: AssemblyStatus,
    pub output_path: Option<PathBuf>,
    pub checksum: Option<String>,
    pub duration: Option<f64>,
    pub units: Vec<TimelineUnit>,
    pub drifts: Vec<Drift>,
    pub error: Option<AssemblyFailure>,
}

/// What an assembly would render, without rendering it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preview {
    pub units: Vec<TimelineUnit>,
    pub drifts: Vec<Drift>,
    pub total_duration: f64,
}

#[derive(Debug, Clone)]
pub struct AssemblerSettings {
    pub work_dir: PathBuf,
    pub max_parallel: usize,
    pub default_visual: Option<PathBuf>,
    pub render: RenderSettings,
}

impl From<&DaemonConfig> for AssemblerSettings {
    fn from(config: &DaemonConfig) -> Self {
        AssemblerSettings {
            work_dir: config.work_dir.clone(),
            max_parallel: config.max_parallel_transforms.max(1),
            default_visual: config.default_visual.clone(),
            render: config.render.clone(),
        }
    }
}

pub struct Assembler {
    db: Arc<Database>,
    transcoder: Arc<dyn Transcoder>,
    settings: AssemblerSettings,
}

impl Assembler {
    pub fn new(db: Arc<Database>, transcoder: Arc<dyn Transcoder>, settings: AssemblerSettings) -> Self {
        Assembler {
            db,
            transcoder,
            settings,
        }
    }

    fn plan_options(&self, default_visual: Option<&PathBuf>, render: &RenderSettings) -> PlanOptions {
        PlanOptions {
            default_visual: default_visual
                .or(self.settings.default_visual.as_ref())
                .cloned(),
            tolerance: render.frame_duration(),
        }
    }

    /// Run a full assembly. Never fails as a call: every outcome, including
    /// cancellation, is reported in the result.
    pub async fn assemble(&self, request: &AssemblyRequest, cancel: CancellationToken) -> AssemblyResult {
        let mut result = AssemblyResult {
            status: AssemblyStatus::Failed,
            output_path: None,
            checksum: None,
            duration: None,
            units: Vec::new(),
            drifts: Vec::new(),
            error: None,
        };

        // Dropping the pipeline future kills running encoders and removes
        // every workspace it created.
        let outcome: Result<()> = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(anyhow::Error::from(AssemblyError::Cancelled)),
            outcome = self.run(request, &mut result) => outcome,
        };

        match outcome {
            Ok(()) => {
                result.status = AssemblyStatus::Succeeded;
                info!(
                    project_id = request.project_id,
                    output = %request.output_path.display(),
                    units = result.units.len(),
                    "assembly finished"
                );
            }
            Err(e) => {
                let cancelled = matches!(e.downcast_ref::<AssemblyError>(), Some(AssemblyError::Cancelled));
                result.status = if cancelled {
                    AssemblyStatus::Cancelled
                } else {
                    AssemblyStatus::Failed
                };
                let failure = AssemblyFailure::from_error(&e);
                warn!(
                    project_id = request.project_id,
                    stage = ?failure.stage,
                    segment = ?failure.segment_id,
                    "assembly did not finish: {}",
                    failure.message
                );
                result.error = Some(failure);
            }
        }
        result
    }

    async fn run(&self, request: &AssemblyRequest, result: &mut AssemblyResult) -> Result<()> {
        let render_settings = request
            .settings
            .clone()
            .unwrap_or_else(|| self.settings.render.clone());
        let options = self.plan_options(request.default_visual.as_ref(), &render_settings);

        let reconciliation = self
            .db
            .reconcile_project(request.project_id)?
            .with_context(|| format!("project {} has no script", request.project_id))?;
        if !reconciliation.is_noop() {
            warn!(
                project_id = request.project_id,
                drifts = reconciliation.drifts.len(),
                "status cache was stale, reconciled before planning"
            );
        }
        result.drifts = reconciliation.drifts.clone();

        let durations = self
            .measure(&reconciliation.descriptor, &reconciliation.status, &options)
            .await;
        let units = planner::plan(
            &reconciliation.descriptor,
            &reconciliation.status,
            &request.pattern,
            &options,
            &durations,
        )?;
        result.units = units.clone();

        let plan = AssemblyPlan {
            units,
            output_path: request.output_path.clone(),
            resolution: render_settings.resolution,
        };
        let specs = render::build_transform_specs(&plan, &render_settings);
        info!(
            project_id = request.project_id,
            units = specs.len(),
            duration = plan.total_duration(),
            "plan ready, rendering units"
        );

        tokio::fs::create_dir_all(&self.settings.work_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.settings.work_dir.display()))?;
        let staging = tempfile::Builder::new()
            .prefix("assembly-")
            .tempdir_in(&self.settings.work_dir)?;
        // Clip paths end up in a concat list next to the output
        let staging_path = tokio::fs::canonicalize(staging.path()).await?;

        let clips = self.transform_all(specs, &staging_path).await?;
        let clip_paths: Vec<PathBuf> = clips.into_iter().map(|c| c.path).collect();

        let expected = plan.total_duration();
        let actual = self
            .concatenate(&clip_paths, &plan.output_path, expected, render_settings.frame_duration())
            .await?;
        let checksum = compute_file_checksum(&plan.output_path).await?;

        result.output_path = Some(plan.output_path);
        result.checksum = Some(checksum);
        result.duration = Some(actual);
        Ok(())
    }

    /// Plan against the current state without rendering or persisting
    /// anything.
    pub async fn preview(
        &self,
        project_id: i64,
        pattern: &SequencePattern,
        default_visual: Option<&PathBuf>,
    ) -> Result<Option<Preview>> {
        let Some((descriptor, status)) = self.db.load_project(project_id)? else {
            return Ok(None);
        };
        let reconciliation = reconcile::reconcile(&descriptor, &status);
        let options = self.plan_options(default_visual, &self.settings.render);

        let durations = self
            .measure(&reconciliation.descriptor, &reconciliation.status, &options)
            .await;
        let units = planner::plan(
            &reconciliation.descriptor,
            &reconciliation.status,
            pattern,
            &options,
            &durations,
        )?;
        let total_duration = units.iter().map(|u| u.target_duration).sum();
        Ok(Some(Preview {
            units,
            drifts: reconciliation.drifts,
            total_duration,
        }))
    }

    /// Probe every file whose length planning may need. Files that can't be
    /// probed are left out; planning reports them against the segment that
    /// actually uses them.
    async fn measure(
        &self,
        descriptor: &ScriptDescriptor,
        status: &StatusCache,
        options: &PlanOptions,
    ) -> HashMap<PathBuf, f64> {
        let paths = media_to_probe(descriptor, status, options);
        debug!(count = paths.len(), "probing media");

        stream::iter(paths)
            .map(|path| async move {
                let probed = self.transcoder.probe(&path).await;
                (path, probed)
            })
            .buffer_unordered(self.settings.max_parallel)
            .filter_map(|(path, probed)| async move {
                match probed {
                    Ok(info) if info.duration > 0.0 => Some((path, info.duration)),
                    Ok(_) => {
                        debug!(path = %path.display(), "probe reported no duration");
                        None
                    }
                    Err(e) => {
                        debug!(path = %path.display(), "probe failed: {:#}", e);
                        None
                    }
                }
            })
            .collect()
            .await
    }

    /// Render every unit with at most `max_parallel` in flight. The first
    /// failure drops everything still running.
    async fn transform_all(&self, specs: Vec<TransformSpec>, staging: &Path) -> Result<Vec<ClipRef>> {
        let mut clips: Vec<ClipRef> = stream::iter(specs)
            .map(|spec| self.transform_unit(spec, staging))
            .buffer_unordered(self.settings.max_parallel)
            .try_collect()
            .await?;
        clips.sort_by_key(|c| c.index);
        Ok(clips)
    }

    async fn transform_unit(&self, spec: TransformSpec, staging: &Path) -> Result<ClipRef> {
        let workspace = tempfile::Builder::new()
            .prefix(&format!("unit-{:03}-", spec.index))
            .tempdir_in(staging)
            .map_err(|e| AssemblyError::transform(spec.segment_id, format!("workspace: {}", e)))?;

        let clip = self
            .transcoder
            .transform(&spec, workspace.path())
            .await
            .map_err(|e| AssemblyError::transform(spec.segment_id, format!("{:#}", e)))?;
        if !render::within_tolerance(clip.duration, spec.duration, spec.tolerance()) {
            return Err(AssemblyError::transform(
                spec.segment_id,
                format!(
                    "rendered {:.3}s, expected {:.3}s",
                    clip.duration, spec.duration
                ),
            )
            .into());
        }

        // Keep the clip, drop the rest of the workspace
        let kept = staging.join(&spec.output_name);
        tokio::fs::rename(&clip.path, &kept)
            .await
            .map_err(|e| AssemblyError::transform(spec.segment_id, format!("keeping clip: {}", e)))?;
        debug!(segment = %spec.segment_id, index = spec.index, "unit rendered");

        Ok(ClipRef { path: kept, ..clip })
    }

    /// Join the clips into a staged file beside `output`, check its length,
    /// and only then move it over `output`. A failed run leaves whatever was
    /// at `output` untouched.
    async fn concatenate(
        &self,
        clips: &[PathBuf],
        output: &Path,
        expected: f64,
        tolerance: f64,
    ) -> Result<f64> {
        let parent = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| AssemblyError::Concatenation(format!("creating {}: {}", parent.display(), e)))?;
        // Same directory as the destination so the final rename stays on one
        // filesystem; removed on drop unless persisted
        let staged = tempfile::Builder::new()
            .prefix(".assembly-")
            .suffix(".mp4")
            .tempfile_in(&parent)
            .map_err(|e| AssemblyError::Concatenation(format!("staging output: {}", e)))?
            .into_temp_path();

        self.transcoder
            .concatenate(clips, &staged)
            .await
            .map_err(|e| AssemblyError::Concatenation(format!("{:#}", e)))?;

        let actual = self
            .transcoder
            .probe(&staged)
            .await
            .map_err(|e| AssemblyError::Concatenation(format!("probing output: {:#}", e)))?
            .duration;
        if !render::within_tolerance(actual, expected, tolerance) {
            return Err(AssemblyError::Concatenation(format!(
                "output is {:.3}s, expected {:.3}s",
                actual, expected
            ))
            .into());
        }

        staged.persist(output).map_err(|e| {
            AssemblyError::Concatenation(format!("moving into {}: {}", output.display(), e.error))
        })?;
        Ok(actual)
    }
}

/// Clip files whose length the planner may ask for. Stills never need one.
fn media_to_probe(
    descriptor: &ScriptDescriptor,
    status: &StatusCache,
    options: &PlanOptions,
) -> BTreeSet<PathBuf> {
    let mut paths = BTreeSet::new();
    for narration in descriptor.narrations() {
        if needs_measurement(narration, descriptor.audio_layout) {
            paths.insert(narration.source_audio_ref.clone());
        }
        if let Some(video) = &narration.source_video_ref {
            paths.insert(video.clone());
        }
    }
    paths.extend(status.records().filter_map(|r| r.ready_asset().cloned()));
    paths.extend(descriptor.visuals().map(|v| v.asset_ref.clone()));
    paths.extend(options.default_visual.clone());
    paths.retain(|p| AssetKind::from_path(p) == AssetKind::Clip);
    paths
}
