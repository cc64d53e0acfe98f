use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{info, warn};

/// Stream metadata for the input video, as reported by ffprobe.
#[derive(Debug, Clone, Copy)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub total_frames: usize,
    pub duration_seconds: f64,
}

impl VideoInfo {
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: u32,
    height: u32,
    r_frame_rate: String,
    nb_frames: Option<String>,
    duration: Option<String>,
}

fn parse_rate(rate: &str) -> Option<f64> {
    let mut parts = rate.splitn(2, '/');
    let num: f64 = parts.next()?.parse().ok()?;
    let den: f64 = parts.next().unwrap_or("1").parse().ok()?;
    if den > 0.0 {
        Some(num / den)
    } else {
        None
    }
}

/// Probes the input video. An unreadable stream or zero frame rate is
/// fatal: nothing downstream can run without real dimensions and timing.
pub async fn probe(path: &Path) -> Result<VideoInfo> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate,nb_frames,duration",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .await
        .context("failed to spawn ffprobe")?;

    if !output.status.success() {
        anyhow::bail!(
            "ffprobe failed for {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let parsed: ProbeOutput =
        serde_json::from_slice(&output.stdout).context("failed to parse ffprobe output")?;
    let stream = parsed
        .streams
        .first()
        .context("input has no video stream")?;

    let fps = parse_rate(&stream.r_frame_rate)
        .filter(|fps| *fps > 0.0)
        .context("input video reports zero frame rate")?;

    let duration_seconds = stream
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let total_frames = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<usize>().ok())
        .unwrap_or_else(|| (duration_seconds * fps).round() as usize);

    if total_frames == 0 {
        anyhow::bail!("input video {} has no frames", path.display());
    }

    let info = VideoInfo {
        width: stream.width,
        height: stream.height,
        fps,
        total_frames,
        duration_seconds,
    };
    info!(
        "input video: {}x{} @ {:.2} fps, {} frames",
        info.width, info.height, info.fps, info.total_frames
    );
    Ok(info)
}

/// One decoded frame: raw rgb24 pixels plus its position in the video.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: usize,
    pub data: Vec<u8>,
}

/// Sequential frame supplier. Chunked so the driver's memory stays bounded
/// by chunk size, not video length.
#[async_trait]
pub trait FrameSource: Send {
    /// Returns up to `max` frames in ascending index order; an empty vec
    /// means end of video.
    async fn next_chunk(&mut self, max: usize) -> Result<Vec<Frame>>;
}

/// Decodes the input through an ffmpeg child emitting raw rgb24 on stdout.
pub struct FfmpegFrameSource {
    child: Child,
    stdout: ChildStdout,
    frame_bytes: usize,
    next_index: usize,
    finished: bool,
}

impl FfmpegFrameSource {
    pub fn open(path: &Path, info: &VideoInfo) -> Result<Self> {
        let mut child = Command::new("ffmpeg")
            .args(["-v", "error", "-i"])
            .arg(path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdout(Stdio::piped())
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn ffmpeg decoder for {}", path.display()))?;

        let stdout = child.stdout.take().context("decoder has no stdout")?;
        Ok(Self {
            child,
            stdout,
            frame_bytes: info.frame_bytes(),
            next_index: 0,
            finished: false,
        })
    }
}

#[async_trait]
impl FrameSource for FfmpegFrameSource {
    async fn next_chunk(&mut self, max: usize) -> Result<Vec<Frame>> {
        if self.finished {
            return Ok(Vec::new());
        }

        let mut frames = Vec::with_capacity(max);
        for _ in 0..max {
            let mut data = vec![0u8; self.frame_bytes];
            match self.stdout.read_exact(&mut data).await {
                Ok(_) => {
                    frames.push(Frame {
                        index: self.next_index,
                        data,
                    });
                    self.next_index += 1;
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.finished = true;
                    if let Err(err) = self.child.wait().await {
                        warn!(%err, "decoder did not exit cleanly");
                    }
                    break;
                }
                Err(err) => return Err(err).context("failed to read decoded frame"),
            }
        }
        Ok(frames)
    }
}
