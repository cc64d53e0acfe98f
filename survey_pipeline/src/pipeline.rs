use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use image::RgbImage;
use survey_common::detection::{EnrichedDetection, GeoPoint, RawDetection};
use survey_common::labels::{condition_for, LabelMap};
use survey_common::trajectory::{parse_track, Trajectory};
use survey_common::zones::{classify_side, classify_zone};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::encoder::{FfmpegEncoderSink, FrameSink};
use crate::inference::{Detector, HttpDetector};
use crate::records::{Asset, AssetSummary, FrameRecord, PipelineRun, RunIds};
use crate::render::Renderer;
use crate::store::{MemoryStore, PgStore, ResultStore};
use crate::tracker::AssetTracker;
use crate::video::{probe, FfmpegFrameSource, FrameSource, VideoInfo};

/// Consecutive frame-record write failures treated as a systemic store
/// outage rather than per-record noise.
const SYSTEMIC_STORE_FAILURES: u32 = 20;

/// Throttled progress reporting: at most one callback per whole
/// percentage point.
pub struct Progress {
    callback: Box<dyn FnMut(f32, &str) + Send>,
    last_reported: f32,
}

impl Progress {
    pub fn new(callback: impl FnMut(f32, &str) + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
            last_reported: -1.0,
        }
    }

    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    fn report(&mut self, percent: f32, message: &str) {
        // Decoders can yield more frames than the probe estimated, so the
        // raw ratio may pass 100%.
        let percent = percent.min(100.0);
        if percent - self.last_reported >= 1.0
            || (percent >= 100.0 && self.last_reported < 100.0)
        {
            self.last_reported = percent;
            (self.callback)(percent, message);
        }
    }
}

/// Everything a run needs, constructed once at run start and dropped at
/// run end. No ambient globals.
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub ids: RunIds,
    pub detector: Arc<dyn Detector>,
    pub store: Arc<dyn ResultStore>,
}

impl PipelineContext {
    /// Production wiring: HTTP detector from config, Postgres store when a
    /// database URL is configured, in-memory degraded mode otherwise.
    pub async fn initialize(config: PipelineConfig, ids: RunIds) -> Result<Self> {
        let store: Arc<dyn ResultStore> = match &config.database_url {
            Some(url) => Arc::new(PgStore::connect(url).await?),
            None => {
                warn!("no database configured, results held in memory only");
                Arc::new(MemoryStore::default())
            }
        };
        let detector: Arc<dyn Detector> = Arc::new(HttpDetector::new(&config.inference)?);
        Ok(Self {
            config,
            ids,
            detector,
            store,
        })
    }

    /// Test and embedding seam: caller supplies the collaborators.
    pub fn with_parts(
        config: PipelineConfig,
        ids: RunIds,
        detector: Arc<dyn Detector>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            config,
            ids,
            detector,
            store,
        }
    }
}

fn load_trajectory(
    ctx: &PipelineContext,
    gps_track_path: Option<&Path>,
    info: &VideoInfo,
) -> Trajectory {
    let fallback = || {
        Trajectory::fixed(
            GeoPoint {
                lat: ctx.config.default_lat,
                lon: ctx.config.default_lon,
            },
            info.total_frames,
            info.fps,
        )
    };

    let Some(path) = gps_track_path else {
        warn!("no GPS track supplied, using fixed default coordinate");
        return fallback();
    };

    let body = match std::fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) => {
            warn!(%err, "GPS track unreadable, using fixed default coordinate");
            return fallback();
        }
    };
    let samples = match parse_track(&body) {
        Ok(samples) => samples,
        Err(err) => {
            warn!(%err, "GPS track malformed, using fixed default coordinate");
            return fallback();
        }
    };
    match Trajectory::interpolate(
        &samples,
        info.total_frames,
        info.fps,
        ctx.config.video.gps_time_offset_secs,
    ) {
        Some(trajectory) => trajectory,
        None => {
            warn!("GPS track empty, using fixed default coordinate");
            fallback()
        }
    }
}

fn encode_jpeg(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 85);
    encoder
        .encode(data, width, height, image::ExtendedColorType::Rgb8)
        .context("failed to encode frame as jpeg")?;
    Ok(buf)
}

/// Runs the full pipeline against a video file on disk.
pub async fn run_pipeline(
    ctx: &PipelineContext,
    video_path: &Path,
    gps_track_path: Option<&Path>,
    progress: &mut Progress,
    cancel: watch::Receiver<bool>,
) -> Result<PipelineRun> {
    let info = probe(video_path).await?;
    let trajectory = load_trajectory(ctx, gps_track_path, &info);

    let output_path = ctx
        .config
        .video
        .output_dir
        .join(format!("{}_annotated.mp4", ctx.ids.video_id));

    let source = FfmpegFrameSource::open(video_path, &info)?;
    let sink = FfmpegEncoderSink::create(&output_path, info.width, info.height, info.fps).await?;

    run_with_io(
        ctx,
        info,
        output_path,
        trajectory,
        source,
        sink,
        progress,
        cancel,
    )
    .await
}

/// The chunked two-phase driver, generic over the frame source and sink
/// so ordering and latency behavior are testable without ffmpeg.
#[allow(clippy::too_many_arguments)]
pub async fn run_with_io(
    ctx: &PipelineContext,
    info: VideoInfo,
    output_path: PathBuf,
    trajectory: Trajectory,
    mut source: impl FrameSource,
    mut sink: impl FrameSink,
    progress: &mut Progress,
    mut cancel: watch::Receiver<bool>,
) -> Result<PipelineRun> {
    // Fail fast before consuming any frames.
    ctx.store
        .health_check()
        .await
        .context("result store unavailable")?;
    ctx.detector
        .check_health()
        .await
        .context("inference backends unavailable")?;

    let label_map = ctx.store.load_label_map().await.unwrap_or_else(|err| {
        warn!(%err, "label map unavailable, asset ids will be unresolved");
        LabelMap::default()
    });

    let mut run = PipelineRun {
        run_id: uuid::Uuid::new_v4(),
        video_id: ctx.ids.video_id.clone(),
        total_frames: info.total_frames,
        processed_frames: 0,
        fps: info.fps,
        width: info.width,
        height: info.height,
        duration_seconds: info.duration_seconds,
        output_video_path: output_path,
        detection_summary: HashMap::new(),
        asset_summary: AssetSummary::default(),
        warnings: Vec::new(),
    };

    let renderer = Renderer::new(ctx.config.font_path.as_deref());
    let mut tracker = AssetTracker::new(ctx.config.tracker.clone());
    let mut assets: Vec<Asset> = Vec::new();
    let semaphore = Arc::new(Semaphore::new(ctx.config.inference.workers.max(1)));
    let frame_interval = ctx.config.video.frame_interval.max(1);
    let frame_bytes = info.frame_bytes();

    let mut frames_consumed = 0usize;
    let mut consecutive_store_failures = 0u32;

    loop {
        if *cancel.borrow() {
            let _ = sink.finish().await;
            anyhow::bail!("run cancelled");
        }

        let chunk = source.next_chunk(ctx.config.video.chunk_size).await?;
        if chunk.is_empty() {
            break;
        }

        // Phase 1: fan inference-eligible frames out to the worker pool.
        // Results land in a map keyed by frame index; completion order is
        // irrelevant here.
        let mut inference_results: HashMap<usize, Vec<RawDetection>> = HashMap::new();
        let mut set = JoinSet::new();
        for frame in &chunk {
            if frame.index % frame_interval != 0 {
                continue;
            }
            let detector = Arc::clone(&ctx.detector);
            let semaphore = Arc::clone(&semaphore);
            let data = frame.data.clone();
            let index = frame.index;
            let (w, h) = (info.width, info.height);

            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, Vec::new());
                };
                match encode_jpeg(&data, w, h) {
                    Ok(jpeg) => (index, detector.detect(Arc::new(jpeg), w, h).await),
                    Err(err) => {
                        warn!(frame = index, %err, "frame encoding failed, skipping inference");
                        (index, Vec::new())
                    }
                }
            });
        }

        let mut cancel_open = true;
        loop {
            tokio::select! {
                biased;
                changed = cancel.changed(), if cancel_open => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            set.abort_all();
                            let _ = sink.finish().await;
                            anyhow::bail!("run cancelled");
                        }
                        Ok(()) => {}
                        // Sender dropped: no cancellation can arrive anymore.
                        Err(_) => cancel_open = false,
                    }
                }
                joined = set.join_next() => {
                    match joined {
                        Some(Ok((index, detections))) => {
                            inference_results.insert(index, detections);
                        }
                        Some(Err(err)) => warn!(%err, "inference task failed"),
                        None => break,
                    }
                }
            }
        }

        // Phase 2: strict frame-index order. The only place tracker
        // updates, persistence, and sink writes happen.
        for frame in chunk {
            // Re-checked per frame: a sink write can block on encoder
            // backpressure, and a cancelled run must not flush the rest
            // of the chunk.
            if *cancel.borrow() {
                let _ = sink.finish().await;
                anyhow::bail!("run cancelled");
            }
            let index = frame.index;
            let is_inference_frame = index % frame_interval == 0;

            if is_inference_frame {
                let raw = inference_results.remove(&index).unwrap_or_default();
                let timestamp = trajectory.timestamp_at(index);
                let vehicle = trajectory.position_at(index);
                let heading = trajectory.bearing_at(index, frame_interval);

                let enriched: Vec<EnrichedDetection> = raw
                    .into_iter()
                    .map(|det| {
                        let estimate = ctx.config.camera.locate(
                            vehicle,
                            heading,
                            info.width,
                            info.height,
                            &det.bbox,
                        );
                        let zone = classify_zone(
                            &ctx.config.zones,
                            &det.class_name,
                            &det.bbox,
                            info.width,
                            info.height,
                        );
                        let side = classify_side(&det.bbox, info.width);
                        EnrichedDetection {
                            class_name: det.class_name,
                            confidence: det.confidence,
                            bbox: det.bbox,
                            channel: det.channel,
                            location: estimate.location,
                            bearing_deg: estimate.bearing_deg,
                            distance_m: estimate.distance_m,
                            zone,
                            side,
                        }
                    })
                    .collect();

                for confirmation in tracker.update(index, timestamp, &enriched) {
                    let det = &confirmation.detection;
                    if ctx
                        .store
                        .asset_exists(confirmation.track_id, &ctx.ids.video_id)
                        .await
                        .unwrap_or(false)
                    {
                        info!(
                            track_id = confirmation.track_id,
                            "asset already persisted for this video, skipping"
                        );
                        continue;
                    }
                    let label = label_map.resolve(&det.class_name);
                    let condition = condition_for(
                        &det.class_name,
                        det.confidence,
                        ctx.config.tracker.damaged_below,
                    );
                    run.asset_summary.record(condition);
                    assets.push(Asset {
                        track_id: confirmation.track_id,
                        asset_class_id: label.map(|l| l.asset_class_id).unwrap_or(0),
                        category_id: label.map(|l| l.category_id).unwrap_or(0),
                        class_name: det.class_name.clone(),
                        confidence: det.confidence,
                        condition,
                        zone: det.zone,
                        side: det.side,
                        frame_number: confirmation.frame_number,
                        timestamp_seconds: confirmation.timestamp_seconds,
                        location: det.location,
                        video_id: ctx.ids.video_id.clone(),
                        route_id: ctx.ids.route_id.clone(),
                        survey_id: ctx.ids.survey_id.clone(),
                        created_at: chrono::Utc::now(),
                    });
                }

                run.record_detections(enriched.iter());

                let record = FrameRecord {
                    video_id: ctx.ids.video_id.clone(),
                    route_id: ctx.ids.route_id.clone(),
                    survey_id: ctx.ids.survey_id.clone(),
                    frame_number: index,
                    timestamp_seconds: timestamp,
                    detection_count: enriched.len(),
                    detections: enriched.clone(),
                    location: vehicle,
                };
                match ctx.store.insert_frame_record(&record).await {
                    Ok(()) => consecutive_store_failures = 0,
                    Err(err) => {
                        consecutive_store_failures += 1;
                        warn!(frame = index, %err, "failed to persist frame record");
                        if consecutive_store_failures >= SYSTEMIC_STORE_FAILURES {
                            error!("result store persistently failing, aborting run");
                            let _ = sink.finish().await;
                            anyhow::bail!("systemic persistence failure");
                        }
                    }
                }

                if frame.data.len() == frame_bytes {
                    let mut img = RgbImage::from_raw(info.width, info.height, frame.data)
                        .expect("frame buffer length already checked");
                    renderer.annotate(&mut img, &enriched);
                    sink.write_frame(index, img.as_raw()).await?;
                } else {
                    warn!(frame = index, "unexpected frame buffer size, writing unannotated");
                    sink.write_frame(index, &frame.data).await?;
                }
                run.processed_frames += 1;
            } else {
                sink.write_frame(index, &frame.data).await?;
            }

            frames_consumed += 1;
            let percent = frames_consumed as f32 / info.total_frames.max(1) as f32 * 100.0;
            progress.report(percent, "processing frames");
        }
    }

    // All tracks finalized: persist the asset batch in one pass.
    let inserted = ctx
        .store
        .insert_assets(&assets)
        .await
        .context("failed to persist asset batch")?;
    info!(
        "run complete: {} assets persisted ({} emitted), {} frames inferred",
        inserted,
        assets.len(),
        run.processed_frames
    );

    if let Some(warning) = sink.finish().await? {
        run.warnings.push(warning);
    }

    progress.report(100.0, "complete");
    Ok(run)
}
