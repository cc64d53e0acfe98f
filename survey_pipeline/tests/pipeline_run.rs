//! End-to-end driver tests over the FrameSource / Detector / FrameSink /
//! ResultStore seams: frame ordering under simulated inference latency,
//! asset deduplication, idempotent re-runs, and cancellation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use survey_common::bbox::BBox;
use survey_common::detection::{Channel, Condition, GeoPoint, RawDetection};
use survey_common::labels::{LabelEntry, LabelMap};
use survey_common::trajectory::Trajectory;
use survey_pipeline::config::PipelineConfig;
use survey_pipeline::encoder::FrameSink;
use survey_pipeline::inference::Detector;
use survey_pipeline::pipeline::{run_with_io, PipelineContext, Progress};
use survey_pipeline::records::{Asset, FrameRecord, RunIds};
use survey_pipeline::store::{MemoryStore, ResultStore};
use survey_pipeline::video::{Frame, FrameSource, VideoInfo};
use tokio::sync::watch;

const W: u32 = 64;
const H: u32 = 48;

fn video_info(total_frames: usize) -> VideoInfo {
    VideoInfo {
        width: W,
        height: H,
        fps: 30.0,
        total_frames,
        duration_seconds: total_frames as f64 / 30.0,
    }
}

struct SyntheticSource {
    total: usize,
    next: usize,
}

#[async_trait]
impl FrameSource for SyntheticSource {
    async fn next_chunk(&mut self, max: usize) -> Result<Vec<Frame>> {
        let end = (self.next + max).min(self.total);
        let frames = (self.next..end)
            .map(|index| Frame {
                index,
                data: vec![(index % 251) as u8; (W * H * 3) as usize],
            })
            .collect();
        self.next = end;
        Ok(frames)
    }
}

/// Always returns one fixed traffic-sign detection, after a random delay
/// so completion order inside a chunk is scrambled.
struct FixedDetector {
    max_latency_ms: u64,
    calls: AtomicUsize,
}

impl FixedDetector {
    fn new(max_latency_ms: u64) -> Self {
        Self {
            max_latency_ms,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Detector for FixedDetector {
    async fn check_health(&self) -> Result<()> {
        Ok(())
    }

    async fn detect(&self, _frame: Arc<Vec<u8>>, _w: u32, _h: u32) -> Vec<RawDetection> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.max_latency_ms > 0 {
            let jitter = rand::thread_rng().gen_range(0..self.max_latency_ms);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
        vec![RawDetection {
            class_name: "Traffic_Sign_AssetCondition_Good".to_string(),
            confidence: 0.9,
            bbox: BBox::new(10.0, 20.0, 30.0, 40.0),
            channel: Channel::Oia,
        }]
    }
}

struct SilentDetector;

#[async_trait]
impl Detector for SilentDetector {
    async fn check_health(&self) -> Result<()> {
        Ok(())
    }

    async fn detect(&self, _frame: Arc<Vec<u8>>, _w: u32, _h: u32) -> Vec<RawDetection> {
        Vec::new()
    }
}

/// Frame source that counts how many times it was asked for a chunk.
struct CountingSource {
    total: usize,
    next: usize,
    reads: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameSource for CountingSource {
    async fn next_chunk(&mut self, max: usize) -> Result<Vec<Frame>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let end = (self.next + max).min(self.total);
        let frames = (self.next..end)
            .map(|index| Frame {
                index,
                data: vec![0u8; (W * H * 3) as usize],
            })
            .collect();
        self.next = end;
        Ok(frames)
    }
}

struct UnhealthyDetector;

#[async_trait]
impl Detector for UnhealthyDetector {
    async fn check_health(&self) -> Result<()> {
        anyhow::bail!("no healthy channels")
    }

    async fn detect(&self, _frame: Arc<Vec<u8>>, _w: u32, _h: u32) -> Vec<RawDetection> {
        Vec::new()
    }
}

/// Store whose frame-record writes always fail, as a dead database would.
struct FailingStore;

#[async_trait]
impl ResultStore for FailingStore {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn load_label_map(&self) -> Result<LabelMap> {
        Ok(LabelMap::default())
    }

    async fn insert_frame_record(&self, _record: &FrameRecord) -> Result<()> {
        anyhow::bail!("connection reset")
    }

    async fn asset_exists(&self, _track_id: u64, _video_id: &str) -> Result<bool> {
        Ok(false)
    }

    async fn insert_assets(&self, _assets: &[Asset]) -> Result<usize> {
        Ok(0)
    }
}

#[derive(Clone, Default)]
struct CollectingSink {
    indices: Arc<Mutex<Vec<usize>>>,
}

#[async_trait]
impl FrameSink for CollectingSink {
    async fn write_frame(&mut self, index: usize, _data: &[u8]) -> Result<()> {
        self.indices.lock().unwrap().push(index);
        Ok(())
    }

    async fn finish(&mut self) -> Result<Option<String>> {
        Ok(None)
    }
}

fn label_map() -> LabelMap {
    let mut entries = HashMap::new();
    entries.insert(
        "Traffic_Sign".to_string(),
        LabelEntry {
            asset_class_id: 7,
            category_id: 3,
        },
    );
    LabelMap::new(entries)
}

fn context(
    config: PipelineConfig,
    detector: Arc<dyn Detector>,
    store: Arc<dyn ResultStore>,
) -> PipelineContext {
    PipelineContext::with_parts(
        config,
        RunIds {
            video_id: "vid-1".to_string(),
            route_id: "route-9".to_string(),
            survey_id: "survey-4".to_string(),
        },
        detector,
        store,
    )
}

fn fixed_trajectory(total_frames: usize) -> Trajectory {
    Trajectory::fixed(GeoPoint { lat: 24.45, lon: 54.38 }, total_frames, 30.0)
}

#[tokio::test]
async fn frames_reach_sink_in_order_regardless_of_latency() {
    for (chunk_size, frame_interval) in [(7usize, 1usize), (50, 3), (300, 3)] {
        let mut config = PipelineConfig::default();
        config.video.chunk_size = chunk_size;
        config.video.frame_interval = frame_interval;
        config.inference.workers = 6;

        let total = 120;
        let store = Arc::new(MemoryStore::new(label_map()));
        let ctx = context(config, Arc::new(FixedDetector::new(15)), store);
        let sink = CollectingSink::default();
        let indices = Arc::clone(&sink.indices);
        let (_tx, cancel) = watch::channel(false);

        run_with_io(
            &ctx,
            video_info(total),
            PathBuf::from("out.mp4"),
            fixed_trajectory(total),
            SyntheticSource { total, next: 0 },
            sink,
            &mut Progress::noop(),
            cancel,
        )
        .await
        .unwrap();

        let written = indices.lock().unwrap().clone();
        let expected: Vec<usize> = (0..total).collect();
        assert_eq!(
            written, expected,
            "ordering broke for chunk_size={chunk_size}, interval={frame_interval}"
        );
    }
}

#[tokio::test]
async fn ten_second_video_yields_one_asset_and_full_output() {
    let mut config = PipelineConfig::default();
    config.video.frame_interval = 3;

    let total = 300;
    let store = Arc::new(MemoryStore::new(label_map()));
    let detector = Arc::new(FixedDetector::new(5));
    let ctx = context(config, detector.clone(), store.clone());
    let sink = CollectingSink::default();
    let indices = Arc::clone(&sink.indices);
    let (_tx, cancel) = watch::channel(false);

    let run = run_with_io(
        &ctx,
        video_info(total),
        PathBuf::from("out.mp4"),
        fixed_trajectory(total),
        SyntheticSource { total, next: 0 },
        sink,
        &mut Progress::noop(),
        cancel,
    )
    .await
    .unwrap();

    // Frames 0,3,...,297 go through inference.
    assert_eq!(run.processed_frames, 100);
    assert_eq!(detector.calls.load(Ordering::SeqCst), 100);
    assert_eq!(indices.lock().unwrap().len(), 300);

    // One physical sign, seen 100 times, persists exactly once.
    let assets = store.assets.lock().unwrap();
    assert_eq!(assets.len(), 1);
    let asset = assets.values().next().unwrap();
    assert_eq!(asset.condition, Condition::Good);
    assert_eq!(asset.asset_class_id, 7);
    assert_eq!(run.asset_summary.good, 1);
    assert_eq!(run.asset_summary.damaged, 0);

    // Every inference frame produced an immutable frame record.
    assert_eq!(store.frames.lock().unwrap().len(), 100);
    assert_eq!(
        run.detection_summary
            .get("Traffic_Sign_AssetCondition_Good"),
        Some(&100)
    );
}

#[tokio::test]
async fn rerun_against_existing_records_inserts_nothing() {
    let store = Arc::new(MemoryStore::new(label_map()));
    let total = 60;

    for pass in 0..2 {
        let ctx = context(
            PipelineConfig::default(),
            Arc::new(FixedDetector::new(0)),
            store.clone(),
        );
        let (_tx, cancel) = watch::channel(false);
        let run = run_with_io(
            &ctx,
            video_info(total),
            PathBuf::from("out.mp4"),
            fixed_trajectory(total),
            SyntheticSource { total, next: 0 },
            CollectingSink::default(),
            &mut Progress::noop(),
            cancel,
        )
        .await
        .unwrap();

        if pass == 0 {
            assert_eq!(run.asset_summary.total(), 1);
        } else {
            // The (track_id, video_id) guard suppresses re-emission.
            assert_eq!(run.asset_summary.total(), 0);
        }
        assert_eq!(store.assets.lock().unwrap().len(), 1);
    }
}

#[tokio::test]
async fn empty_channel_results_still_complete_the_run() {
    let store = Arc::new(MemoryStore::new(label_map()));
    let ctx = context(PipelineConfig::default(), Arc::new(SilentDetector), store.clone());
    let total = 30;
    let sink = CollectingSink::default();
    let indices = Arc::clone(&sink.indices);
    let (_tx, cancel) = watch::channel(false);

    let run = run_with_io(
        &ctx,
        video_info(total),
        PathBuf::from("out.mp4"),
        fixed_trajectory(total),
        SyntheticSource { total, next: 0 },
        sink,
        &mut Progress::noop(),
        cancel,
    )
    .await
    .unwrap();

    assert_eq!(indices.lock().unwrap().len(), total);
    assert!(store.assets.lock().unwrap().is_empty());
    assert!(run.detection_summary.is_empty());
    let frames = store.frames.lock().unwrap();
    assert!(frames.iter().all(|f| f.detection_count == 0));
}

#[tokio::test]
async fn cancellation_aborts_the_run() {
    let mut config = PipelineConfig::default();
    config.video.chunk_size = 30;
    // Slow enough that cancellation lands mid-run.
    let detector = Arc::new(FixedDetector::new(40));
    let store = Arc::new(MemoryStore::new(label_map()));
    let ctx = context(config, detector, store);
    let (tx, cancel) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send(true);
    });

    let total = 600;
    let result = run_with_io(
        &ctx,
        video_info(total),
        PathBuf::from("out.mp4"),
        fixed_trajectory(total),
        SyntheticSource { total, next: 0 },
        CollectingSink::default(),
        &mut Progress::noop(),
        cancel,
    )
    .await;

    let err = result.expect_err("cancelled run must not report success");
    assert!(err.to_string().contains("cancelled"));
}

/// Sink that raises the cancel flag from inside its first write and then
/// counts every write that still arrives.
struct CancellingSink {
    tx: watch::Sender<bool>,
    writes: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameSink for CancellingSink {
    async fn write_frame(&mut self, _index: usize, _data: &[u8]) -> Result<()> {
        if self.writes.fetch_add(1, Ordering::SeqCst) == 0 {
            let _ = self.tx.send(true);
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<Option<String>> {
        Ok(None)
    }
}

#[tokio::test]
async fn cancellation_mid_flush_stops_remaining_chunk_writes() {
    let mut config = PipelineConfig::default();
    config.video.chunk_size = 240;
    let store = Arc::new(MemoryStore::new(label_map()));
    let ctx = context(config, Arc::new(SilentDetector), store);
    let (tx, cancel) = watch::channel(false);
    let writes = Arc::new(AtomicUsize::new(0));
    let sink = CancellingSink {
        tx,
        writes: Arc::clone(&writes),
    };

    let total = 240;
    let err = run_with_io(
        &ctx,
        video_info(total),
        PathBuf::from("out.mp4"),
        fixed_trajectory(total),
        SyntheticSource { total, next: 0 },
        sink,
        &mut Progress::noop(),
        cancel,
    )
    .await
    .expect_err("cancelled run must not report success");

    assert!(err.to_string().contains("cancelled"));
    // Only the write that raised the flag went out; the other 239 frames
    // of the chunk were not flushed.
    assert_eq!(writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_detector_health_check_aborts_before_reading_frames() {
    let store = Arc::new(MemoryStore::new(label_map()));
    let ctx = context(PipelineConfig::default(), Arc::new(UnhealthyDetector), store);
    let reads = Arc::new(AtomicUsize::new(0));
    let (_tx, cancel) = watch::channel(false);

    let err = run_with_io(
        &ctx,
        video_info(60),
        PathBuf::from("out.mp4"),
        fixed_trajectory(60),
        CountingSource {
            total: 60,
            next: 0,
            reads: Arc::clone(&reads),
        },
        CollectingSink::default(),
        &mut Progress::noop(),
        cancel,
    )
    .await
    .expect_err("unhealthy backends must fail the run");

    assert!(err.to_string().contains("inference backends unavailable"));
    assert_eq!(reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn persistently_failing_store_aborts_the_run() {
    let ctx = context(
        PipelineConfig::default(),
        Arc::new(SilentDetector),
        Arc::new(FailingStore),
    );
    let (_tx, cancel) = watch::channel(false);

    // 120 frames at interval 3 is 40 failed writes, past the systemic
    // threshold.
    let total = 120;
    let err = run_with_io(
        &ctx,
        video_info(total),
        PathBuf::from("out.mp4"),
        fixed_trajectory(total),
        SyntheticSource { total, next: 0 },
        CollectingSink::default(),
        &mut Progress::noop(),
        cancel,
    )
    .await
    .expect_err("a dead store must fail the run");

    assert!(err.to_string().contains("systemic persistence failure"));
}

#[tokio::test]
async fn progress_is_throttled_and_reaches_completion() {
    let store = Arc::new(MemoryStore::new(label_map()));
    let ctx = context(PipelineConfig::default(), Arc::new(SilentDetector), store);
    let reports = Arc::new(Mutex::new(Vec::new()));
    let scoped = Arc::clone(&reports);
    let mut progress = Progress::new(move |percent, _| {
        scoped.lock().unwrap().push(percent);
    });
    let (_tx, cancel) = watch::channel(false);

    let total = 500;
    run_with_io(
        &ctx,
        video_info(total),
        PathBuf::from("out.mp4"),
        fixed_trajectory(total),
        SyntheticSource { total, next: 0 },
        CollectingSink::default(),
        &mut progress,
        cancel,
    )
    .await
    .unwrap();

    let reports = reports.lock().unwrap();
    // Far fewer callbacks than frames, ending at 100%.
    assert!(reports.len() < total);
    assert_eq!(*reports.last().unwrap(), 100.0);
    // Monotonic non-decreasing.
    assert!(reports.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn progress_caps_at_100_when_decoder_outruns_the_probe_estimate() {
    let store = Arc::new(MemoryStore::new(label_map()));
    let ctx = context(PipelineConfig::default(), Arc::new(SilentDetector), store);
    let reports = Arc::new(Mutex::new(Vec::new()));
    let scoped = Arc::clone(&reports);
    let mut progress = Progress::new(move |percent, _| {
        scoped.lock().unwrap().push(percent);
    });
    let (_tx, cancel) = watch::channel(false);

    // Probe says 100 frames, the decoder yields 150.
    let actual = 150;
    run_with_io(
        &ctx,
        video_info(100),
        PathBuf::from("out.mp4"),
        fixed_trajectory(actual),
        SyntheticSource {
            total: actual,
            next: 0,
        },
        CollectingSink::default(),
        &mut progress,
        cancel,
    )
    .await
    .unwrap();

    let reports = reports.lock().unwrap();
    assert!(reports.iter().all(|p| *p <= 100.0));
    assert_eq!(reports.iter().filter(|p| **p >= 100.0).count(), 1);
}
