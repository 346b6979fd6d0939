use anyhow::{Context, Result};
use engine::RenderSettings;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Daemon settings, read from `REEL_*` environment variables.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub db_path: PathBuf,
    pub bind_addr: SocketAddr,
    /// Scratch space for per-job and per-unit workspaces.
    pub work_dir: PathBuf,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    /// Upper bound on concurrent ffmpeg/ffprobe processes for one assembly.
    pub max_parallel_transforms: usize,
    pub default_visual: Option<PathBuf>,
    pub render: RenderSettings,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            db_path: PathBuf::from(".cache/reeld.db"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7878)),
            work_dir: std::env::temp_dir().join("reeld"),
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            max_parallel_transforms: 4,
            default_visual: None,
            render: RenderSettings::default(),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = DaemonConfig::default();

        if let Some(path) = lookup("REEL_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(addr) = lookup("REEL_BIND") {
            config.bind_addr = addr
                .parse()
                .with_context(|| format!("REEL_BIND is not a socket address: {}", addr))?;
        }
        if let Some(dir) = lookup("REEL_WORK_DIR") {
            config.work_dir = PathBuf::from(dir);
        }
        if let Some(bin) = lookup("REEL_FFMPEG") {
            config.ffmpeg_bin = bin;
        }
        if let Some(bin) = lookup("REEL_FFPROBE") {
            config.ffprobe_bin = bin;
        }
        if let Some(n) = lookup("REEL_MAX_TRANSFORMS") {
            let n: usize = n
                .parse()
                .with_context(|| format!("REEL_MAX_TRANSFORMS is not a number: {}", n))?;
            config.max_parallel_transforms = n.max(1);
        }
        if let Some(path) = lookup("REEL_DEFAULT_VISUAL") {
            config.default_visual = Some(PathBuf::from(path));
        }
        if let Some(fps) = lookup("REEL_FPS") {
            config.render.fps = fps
                .parse()
                .with_context(|| format!("REEL_FPS is not a number: {}", fps))?;
        }
        if let Some(size) = lookup("REEL_RESOLUTION") {
            let (w, h) = size
                .split_once('x')
                .with_context(|| format!("REEL_RESOLUTION must look like 1080x1920: {}", size))?;
            config.render.resolution.width = w.parse().context("REEL_RESOLUTION width")?;
            config.render.resolution.height = h.parse().context("REEL_RESOLUTION height")?;
        }
        if let Some(bitrate) = lookup("REEL_AUDIO_BITRATE") {
            config.render.audio_bitrate = bitrate;
        }

        Ok(config)
    }
}
