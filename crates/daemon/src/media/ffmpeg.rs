use anyhow::{Context, Result};
use async_trait::async_trait;
use engine::render::{concat_list, TransformSpec, VisualDirective};
use engine::RenderSettings;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::{ClipRef, MediaInfo, Transcoder};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutput {
    format: Option<FormatInfo>,
    streams: Vec<StreamInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FormatInfo {
    duration: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StreamInfo {
    codec_type: Option<String>,
    width: Option<i32>,
    height: Option<i32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

/// `Transcoder` backed by the ffmpeg and ffprobe binaries. Child processes
/// are killed when their future is dropped.
pub struct FfmpegTranscoder {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        FfmpegTranscoder {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    async fn run_ffmpeg(&self, args: Vec<OsString>, step: &str) -> Result<()> {
        debug!(step, ?args, "running ffmpeg");
        let output = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute ffmpeg. Make sure FFmpeg is installed.")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffmpeg {} failed: {}", step, stderr.trim());
        }
        Ok(())
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn probe(&self, media_path: &Path) -> Result<MediaInfo> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration:stream=codec_type,width,height,r_frame_rate,avg_frame_rate",
                "-of",
                "json",
            ])
            .arg(media_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute ffprobe. Make sure FFmpeg is installed.")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffprobe failed on {}: {}", media_path.display(), stderr.trim());
        }

        let probe_output: ProbeOutput = serde_json::from_slice(&output.stdout)
            .context("Failed to parse ffprobe JSON output")?;
        Ok(media_info(probe_output))
    }

    async fn transform(&self, spec: &TransformSpec, workspace: &Path) -> Result<ClipRef> {
        let audio = workspace.join("audio.m4a");
        let video = workspace.join("video.mp4");
        let output = workspace.join(&spec.output_name);

        self.run_ffmpeg(audio_args(spec, &audio), "audio extraction")
            .await?;
        self.run_ffmpeg(visual_args(spec, &video), "visual render")
            .await?;
        self.run_ffmpeg(mux_args(&video, &audio, spec.duration, &output), "mux")
            .await?;

        let info = self.probe(&output).await?;
        Ok(ClipRef {
            index: spec.index,
            segment_id: spec.segment_id,
            path: output,
            duration: info.duration,
        })
    }

    async fn concatenate(&self, clips: &[PathBuf], output: &Path) -> Result<()> {
        let parent = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let refs: Vec<&Path> = clips.iter().map(PathBuf::as_path).collect();
        let list = tempfile::Builder::new()
            .prefix(".concat-")
            .suffix(".txt")
            .tempfile_in(&parent)?;
        tokio::fs::write(list.path(), concat_list(&refs)).await?;

        self.run_ffmpeg(concat_args(list.path(), output), "concatenation")
            .await
    }
}

fn media_info(probe_output: ProbeOutput) -> MediaInfo {
    let duration = probe_output
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let video_stream = probe_output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));

    let (width, height, fps_num, fps_den) = if let Some(vs) = video_stream {
        // "30/1" or "30000/1001"
        let fps_str = vs.r_frame_rate.as_deref().or(vs.avg_frame_rate.as_deref());
        let (num, den) = fps_str
            .and_then(|s| {
                let (num, den) = s.split_once('/')?;
                Some((num.parse::<i32>().ok()?, den.parse::<i32>().ok()?))
            })
            .unwrap_or((30, 1));
        (vs.width.unwrap_or(0), vs.height.unwrap_or(0), num, den)
    } else {
        (0, 0, 30, 1)
    };

    let has_audio = probe_output
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    MediaInfo {
        duration,
        fps_num,
        fps_den,
        width,
        height,
        has_video: video_stream.is_some(),
        has_audio,
    }
}

fn secs(value: f64) -> OsString {
    format!("{:.3}", value).into()
}

fn quiet() -> Vec<OsString> {
    vec!["-y".into(), "-hide_banner".into(), "-loglevel".into(), "error".into()]
}

/// Fit the frame inside the target size, pad the rest, then conform rate and
/// pixel format so every unit can be stream-copied together.
pub fn frame_filter(settings: &RenderSettings) -> String {
    let w = settings.resolution.width;
    let h = settings.resolution.height;
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps},format=yuv420p",
        w = w,
        h = h,
        fps = settings.fps
    )
}

fn audio_args(spec: &TransformSpec, out: &Path) -> Vec<OsString> {
    let settings = &spec.settings;
    let mut args = quiet();
    args.extend([
        "-ss".into(),
        secs(spec.audio.offset),
        "-t".into(),
        secs(spec.audio.duration),
        "-i".into(),
        spec.audio.path.as_os_str().into(),
        "-vn".into(),
        // Pad with silence when the source runs short
        "-af".into(),
        "apad".into(),
        "-t".into(),
        secs(spec.duration),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        settings.audio_bitrate.as_str().into(),
        "-ar".into(),
        settings.sample_rate.to_string().into(),
        "-ac".into(),
        settings.audio_channels.to_string().into(),
        out.as_os_str().into(),
    ]);
    args
}

fn visual_args(spec: &TransformSpec, out: &Path) -> Vec<OsString> {
    let settings = &spec.settings;
    let mut args = quiet();
    match &spec.visual {
        VisualDirective::Still { path } => {
            args.extend([
                "-loop".into(),
                "1".into(),
                "-framerate".into(),
                settings.fps.to_string().into(),
                "-t".into(),
                secs(spec.duration),
                "-i".into(),
                path.as_os_str().into(),
            ]);
        }
        VisualDirective::Motion {
            path,
            offset,
            cycles,
            ..
        } => {
            if *cycles > 1 {
                args.push("-stream_loop".into());
                args.push((cycles - 1).to_string().into());
            }
            if *offset > 0.0 {
                args.extend(["-ss".into(), secs(*offset)]);
            }
            args.push("-i".into());
            args.push(path.into());
        }
    }
    args.extend([
        "-vf".into(),
        frame_filter(settings).into(),
        "-an".into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        settings.video_preset.as_str().into(),
        "-crf".into(),
        settings.crf.to_string().into(),
        "-t".into(),
        secs(spec.duration),
        out.as_os_str().into(),
    ]);
    args
}

fn mux_args(video: &Path, audio: &Path, duration: f64, out: &Path) -> Vec<OsString> {
    let mut args = quiet();
    args.extend([
        "-i".into(),
        video.as_os_str().into(),
        "-i".into(),
        audio.as_os_str().into(),
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "1:a:0".into(),
        "-c".into(),
        "copy".into(),
        "-t".into(),
        secs(duration),
        "-movflags".into(),
        "+faststart".into(),
        out.as_os_str().into(),
    ]);
    args
}

fn concat_args(list: &Path, out: &Path) -> Vec<OsString> {
    let mut args = quiet();
    args.extend::<[OsString; 11]>([
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        list.as_os_str().into(),
        "-c".into(),
        "copy".into(),
        "-movflags".into(),
        "+faststart".into(),
        out.as_os_str().into(),
    ]);
    args
}
