use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use survey_common::bbox::BBox;
use survey_common::detection::{Channel, RawDetection};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::InferenceConfig;

/// A detection backend pool. The pipeline only depends on this seam, so
/// tests can script completion order and failure modes.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Verifies the backend is ready. Called once before any frame is
    /// consumed; an error here fails the run fast.
    async fn check_health(&self) -> Result<()>;

    /// Runs every configured channel on one encoded frame and returns the
    /// union of their detections. Per-channel failures are absorbed into
    /// an empty contribution, never an error.
    async fn detect(&self, frame_jpeg: Arc<Vec<u8>>, width: u32, height: u32)
        -> Vec<RawDetection>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

/// Retries `op` with exponential backoff (base delay doubling per
/// attempt). Returns `None` once retries are exhausted.
pub(crate) async fn retry_with_backoff<F, Fut>(
    policy: RetryPolicy,
    channel: &Channel,
    mut op: F,
) -> Option<Vec<RawDetection>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<RawDetection>>>,
{
    for attempt in 0..=policy.max_retries {
        match op().await {
            Ok(detections) => return Some(detections),
            Err(err) => {
                if attempt == policy.max_retries {
                    warn!(%channel, %err, "channel failed after {} attempts", attempt + 1);
                    return None;
                }
                let delay = policy.base_delay * 2u32.pow(attempt);
                debug!(%channel, %err, ?delay, "channel call failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    class_name: String,
    confidence: f32,
    bbox: [f32; 4],
}

#[derive(Debug, Deserialize)]
struct DetectionResponse {
    detections: Vec<WireDetection>,
}

struct Endpoint {
    channel: Channel,
    url: String,
    healthy: AtomicBool,
}

/// HTTP inference client fanning each frame out to all configured channel
/// endpoints concurrently.
pub struct HttpDetector {
    client: reqwest::Client,
    endpoints: Arc<Vec<Endpoint>>,
    confidence_threshold: f32,
    retry: RetryPolicy,
}

impl HttpDetector {
    pub fn new(cfg: &InferenceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("failed to build inference HTTP client")?;

        let endpoints = cfg
            .endpoints
            .iter()
            .map(|ep| Endpoint {
                channel: Channel::from_name(&ep.channel),
                url: ep.url.trim_end_matches('/').to_string(),
                healthy: AtomicBool::new(true),
            })
            .collect();

        Ok(Self {
            client,
            endpoints: Arc::new(endpoints),
            confidence_threshold: cfg.confidence_threshold,
            retry: RetryPolicy {
                max_retries: cfg.max_retries,
                base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            },
        })
    }

    async fn call_channel(
        client: &reqwest::Client,
        url: &str,
        channel: &Channel,
        frame_jpeg: &[u8],
        width: u32,
        height: u32,
        confidence_threshold: f32,
    ) -> Result<Vec<RawDetection>> {
        let response = client
            .post(format!("{url}/detect"))
            .query(&[("width", width.to_string()), ("height", height.to_string())])
            .header("Content-Type", "application/octet-stream")
            .body(frame_jpeg.to_vec())
            .send()
            .await
            .context("failed to send inference request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("inference endpoint returned {status}: {body}");
        }

        let parsed: DetectionResponse = response
            .json()
            .await
            .context("failed to parse inference response")?;

        Ok(parsed
            .detections
            .into_iter()
            .filter(|d| d.confidence >= confidence_threshold)
            .map(|d| RawDetection {
                class_name: d.class_name,
                confidence: d.confidence,
                bbox: BBox::new(d.bbox[0], d.bbox[1], d.bbox[2], d.bbox[3]),
                channel: channel.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn check_health(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            anyhow::bail!("no inference endpoints configured");
        }

        let mut healthy_count = 0usize;
        for ep in self.endpoints.iter() {
            let ok = match self.client.get(format!("{}/health", ep.url)).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(err) => {
                    warn!(channel = %ep.channel, %err, "health check request failed");
                    false
                }
            };
            ep.healthy.store(ok, Ordering::Relaxed);
            if ok {
                healthy_count += 1;
            } else {
                warn!(channel = %ep.channel, url = %ep.url, "channel excluded from run");
            }
        }

        if healthy_count == 0 {
            anyhow::bail!("no healthy inference endpoints");
        }
        debug!("{healthy_count}/{} channels healthy", self.endpoints.len());
        Ok(())
    }

    async fn detect(
        &self,
        frame_jpeg: Arc<Vec<u8>>,
        width: u32,
        height: u32,
    ) -> Vec<RawDetection> {
        let mut set = JoinSet::new();

        for idx in 0..self.endpoints.len() {
            if !self.endpoints[idx].healthy.load(Ordering::Relaxed) {
                continue;
            }
            let endpoints = Arc::clone(&self.endpoints);
            let client = self.client.clone();
            let frame = Arc::clone(&frame_jpeg);
            let retry = self.retry;
            let threshold = self.confidence_threshold;

            set.spawn(async move {
                let ep = &endpoints[idx];
                retry_with_backoff(retry, &ep.channel, || {
                    Self::call_channel(&client, &ep.url, &ep.channel, &frame, width, height, threshold)
                })
                .await
                .unwrap_or_default()
            });
        }

        let mut union = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(detections) => union.extend(detections),
                Err(err) => warn!(%err, "inference task panicked"),
            }
        }
        union
    }
}
