use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{info, warn};

/// Terminal sink for the run's frames. Frames must arrive in strict
/// ascending index order; the driver's Phase 2 pass is the only writer.
#[async_trait]
pub trait FrameSink: Send {
    async fn write_frame(&mut self, index: usize, data: &[u8]) -> Result<()>;

    /// Flushes and closes the sink. A non-fatal degradation (truncated
    /// output, encoder exit status) comes back as a warning string.
    async fn finish(&mut self) -> Result<Option<String>>;
}

/// Picks the encoder codec: hardware when an NVIDIA GPU is visible,
/// software otherwise.
pub async fn select_codec() -> &'static str {
    let gpu = Command::new("nvidia-smi")
        .arg("-L")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false);

    if gpu {
        info!("GPU detected, encoding with h264_nvenc");
        "h264_nvenc"
    } else {
        info!("no GPU detected, encoding with libx264");
        "libx264"
    }
}

/// Streams rgb24 frames into an ffmpeg child's stdin, in frame order.
///
/// A failed pipe write is logged and absorbed; once the child is observed
/// dead, remaining writes become no-ops and the failure surfaces as a
/// run-level warning from `finish`. Frame and asset records persisted by
/// then stay valid either way.
pub struct FfmpegEncoderSink {
    child: Child,
    stdin: Option<ChildStdin>,
    output_path: PathBuf,
    expected_next: usize,
    write_failures: u64,
    dead: bool,
}

impl FfmpegEncoderSink {
    pub async fn create(
        output_path: &Path,
        width: u32,
        height: u32,
        fps: f64,
    ) -> Result<Self> {
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create output directory")?;
        }

        let codec = select_codec().await;
        let mut child = Command::new("ffmpeg")
            .args(["-v", "error", "-y"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .arg("-s")
            .arg(format!("{width}x{height}"))
            .arg("-r")
            .arg(format!("{fps}"))
            .args(["-i", "pipe:0"])
            .args(["-c:v", codec, "-pix_fmt", "yuv420p"])
            .arg(output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .context("failed to spawn ffmpeg encoder")?;

        let stdin = child.stdin.take().context("encoder has no stdin")?;
        info!("encoding annotated video to {}", output_path.display());

        Ok(Self {
            child,
            stdin: Some(stdin),
            output_path: output_path.to_path_buf(),
            expected_next: 0,
            write_failures: 0,
            dead: false,
        })
    }
}

#[async_trait]
impl FrameSink for FfmpegEncoderSink {
    async fn write_frame(&mut self, index: usize, data: &[u8]) -> Result<()> {
        if index != self.expected_next {
            anyhow::bail!(
                "encoder sink received frame {index}, expected {}",
                self.expected_next
            );
        }
        self.expected_next += 1;

        if self.dead {
            return Ok(());
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };

        if let Err(err) = stdin.write_all(data).await {
            self.write_failures += 1;
            warn!(frame = index, %err, "failed to write frame to encoder pipe");
            if let Ok(Some(status)) = self.child.try_wait() {
                warn!(%status, "encoder process exited early, dropping remaining frames");
                self.dead = true;
                self.stdin = None;
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<Option<String>> {
        // Closing stdin signals EOF to the encoder.
        self.stdin = None;
        let status = self
            .child
            .wait()
            .await
            .context("failed to wait for encoder process")?;

        if !status.success() {
            let warning = format!(
                "encoder exited with {status}; {} may be truncated",
                self.output_path.display()
            );
            warn!("{warning}");
            return Ok(Some(warning));
        }
        if self.write_failures > 0 {
            return Ok(Some(format!(
                "{} frame writes to the encoder failed",
                self.write_failures
            )));
        }
        info!("annotated video written to {}", self.output_path.display());
        Ok(None)
    }
}
