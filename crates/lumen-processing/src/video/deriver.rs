//! Video deriver backed by the ffprobe/ffmpeg binaries.
//!
//! The original is buffered to a temporary file because container demuxers need to seek.
//! Every temporary file is a [`TempPath`], so it is removed on each exit path, including
//! cancellation of the surrounding task (child processes are spawned with `kill_on_drop`).

use async_trait::async_trait;
use bytes::Bytes;
use lumen_core::config::MediaConfig;
use lumen_core::models::MediaKind;
use lumen_core::AppError;
use std::path::Path;
use std::process::Stdio;
use tempfile::TempPath;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::deriver::{ArtifactData, DeriveInput, Derivation, Deriver, OptimizedArtifact};
use crate::sniff::{sniff_video, SNIFF_LEN};
use crate::video::probe::ProbeOutput;

/// Reject binary paths carrying shell metacharacters or traversal.
fn validate_binary_path(path: &str) -> Result<(), String> {
    let dangerous_chars = [';', '|', '&', '$', '`', '(', ')', '<', '>', '\n', '\r'];
    if path.is_empty() {
        return Err("empty path".to_string());
    }
    if path.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(format!("path contains dangerous characters: {}", path));
    }
    if path.contains("..") {
        return Err(format!("path contains directory traversal: {}", path));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub thumbnail_edge: u32,
    pub thumbnail_offset_secs: f64,
    pub optimize: bool,
}

impl From<&MediaConfig> for VideoSettings {
    fn from(config: &MediaConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            ffprobe_path: config.ffprobe_path.clone(),
            thumbnail_edge: config.video_thumbnail_edge,
            thumbnail_offset_secs: config.video_thumbnail_offset_secs,
            optimize: config.video_optimize,
        }
    }
}

pub struct VideoDeriver {
    settings: VideoSettings,
    available: OnceCell<bool>,
}

impl VideoDeriver {
    pub fn new(settings: VideoSettings) -> Self {
        Self {
            settings,
            available: OnceCell::new(),
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(VideoSettings::from(config))
    }

    /// Whether both transcoder binaries run. Probed once, then cached.
    pub async fn is_available(&self) -> bool {
        *self
            .available
            .get_or_init(|| async {
                for binary in [&self.settings.ffprobe_path, &self.settings.ffmpeg_path] {
                    if let Err(reason) = validate_binary_path(binary) {
                        tracing::warn!(binary = %binary, reason = %reason, "Rejected transcoder path");
                        return false;
                    }
                    let status = Command::new(binary)
                        .arg("-version")
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .kill_on_drop(true)
                        .status()
                        .await;
                    match status {
                        Ok(status) if status.success() => {}
                        Ok(status) => {
                            tracing::warn!(binary = %binary, code = ?status.code(), "Transcoder not usable");
                            return false;
                        }
                        Err(e) => {
                            tracing::warn!(binary = %binary, error = %e, "Transcoder not found; video derivatives disabled");
                            return false;
                        }
                    }
                }
                tracing::info!("Transcoder available");
                true
            })
            .await
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>, String> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to execute {}: {}", program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            return Err(format!("{} exited with {}: {}", program, output.status, tail));
        }
        Ok(output.stdout)
    }

    #[tracing::instrument(skip(self), fields(
        process.executable.name = "ffprobe",
        process.executable.path = %self.settings.ffprobe_path,
        ffmpeg.operation = "probe"
    ))]
    async fn probe(&self, input: &Path) -> Result<ProbeOutput, AppError> {
        let args = vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_format".to_string(),
            "-show_streams".to_string(),
            input.to_string_lossy().to_string(),
        ];
        let stdout = self
            .run(&self.settings.ffprobe_path, &args)
            .await
            .map_err(AppError::DecodeFailed)?;
        let probe = ProbeOutput::parse(&stdout)
            .map_err(|e| AppError::DecodeFailed(format!("unreadable probe output: {}", e)))?;
        if probe.video_stream().is_none() {
            return Err(AppError::DecodeFailed("no video stream found".to_string()));
        }
        Ok(probe)
    }

    #[tracing::instrument(skip(self), fields(
        process.executable.name = "ffmpeg",
        ffmpeg.operation = "thumbnail"
    ))]
    async fn thumbnail(&self, input: &Path, offset_secs: f64) -> Result<Bytes, String> {
        let output = temp_path(".jpg")?;
        let edge = self.settings.thumbnail_edge.max(1);
        let args = vec![
            "-y".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-ss".to_string(),
            format!("{:.3}", offset_secs),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-frames:v".to_string(),
            "1".to_string(),
            "-vf".to_string(),
            format!("scale={edge}:{edge}:force_original_aspect_ratio=decrease"),
            "-q:v".to_string(),
            "3".to_string(),
            output.to_string_lossy().to_string(),
        ];
        self.run(&self.settings.ffmpeg_path, &args).await?;
        let bytes = tokio::fs::read(&output)
            .await
            .map_err(|e| format!("thumbnail not written: {}", e))?;
        if bytes.is_empty() {
            return Err("thumbnail is empty".to_string());
        }
        Ok(Bytes::from(bytes))
    }

    #[tracing::instrument(skip(self), fields(
        process.executable.name = "ffmpeg",
        ffmpeg.operation = "transcode"
    ))]
    async fn optimize(&self, input: &Path) -> Result<OptimizedArtifact, String> {
        let output = temp_path(".mp4")?;
        let args = vec![
            "-y".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "medium".to_string(),
            "-crf".to_string(),
            "23".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            "128k".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            output.to_string_lossy().to_string(),
        ];
        self.run(&self.settings.ffmpeg_path, &args).await?;
        Ok(OptimizedArtifact {
            extension: "mp4".to_string(),
            content_type: "video/mp4".to_string(),
            data: ArtifactData::File(output),
        })
    }
}

fn temp_path(suffix: &str) -> Result<TempPath, String> {
    tempfile::Builder::new()
        .prefix("lumen-")
        .suffix(suffix)
        .tempfile()
        .map(|f| f.into_temp_path())
        .map_err(|e| format!("temp file: {}", e))
}

/// Fill `buf` from `reader` until it is full or the stream ends.
async fn read_header(input: &mut DeriveInput, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[async_trait]
impl Deriver for VideoDeriver {
    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    #[tracing::instrument(skip(self, input), fields(media.id = %input.media_id, size = input.size_bytes))]
    async fn derive(&self, mut input: DeriveInput) -> Result<Derivation, AppError> {
        let mut header = vec![0u8; SNIFF_LEN];
        let len = read_header(&mut input, &mut header).await?;
        header.truncate(len);
        if sniff_video(&header).is_none() {
            return Err(AppError::UnsupportedKind(
                "content is not a recognised video container".to_string(),
            ));
        }

        if !self.is_available().await {
            tracing::info!("Transcoder unavailable; video derivatives deferred");
            return Ok(Derivation {
                issues: vec!["transcoder unavailable".to_string()],
                skipped: true,
                ..Default::default()
            });
        }

        let source = temp_path(".video").map_err(AppError::Internal)?;
        let mut file = tokio::fs::File::create(&source).await?;
        file.write_all(&header).await?;
        tokio::io::copy(&mut input.reader, &mut file).await?;
        file.flush().await?;
        drop(file);

        let probe = self.probe(&source).await?;
        let mut derivation = Derivation {
            attributes: probe.attributes(),
            ..Default::default()
        };

        // Seek inside short clips instead of past their end.
        let offset = match derivation.attributes.duration_ms {
            Some(ms) if (ms as f64) / 1000.0 <= self.settings.thumbnail_offset_secs => {
                (ms as f64) / 2000.0
            }
            _ => self.settings.thumbnail_offset_secs.max(0.0),
        };
        match self.thumbnail(&source, offset).await {
            Ok(bytes) => derivation.thumbnail = Some(bytes),
            Err(e) => derivation.issues.push(format!("thumbnail: {}", e)),
        }

        if self.settings.optimize {
            match self.optimize(&source).await {
                Ok(artifact) => derivation.optimized = Some(artifact),
                Err(e) => derivation.issues.push(format!("optimized: {}", e)),
            }
        }

        if !derivation.issues.is_empty() {
            tracing::warn!(issues = ?derivation.issues, "Video derivation incomplete");
        }
        Ok(derivation)
    }
}
