use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use survey_common::detection::{Condition, EnrichedDetection, GeoPoint, Side, Zone};
use uuid::Uuid;

/// Identifiers tying a run's output back to the survey it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIds {
    pub video_id: String,
    pub route_id: String,
    pub survey_id: String,
}

/// Everything observed on one inference-eligible frame. Written once,
/// never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecord {
    pub video_id: String,
    pub route_id: String,
    pub survey_id: String,
    pub frame_number: usize,
    pub timestamp_seconds: f64,
    pub detections: Vec<EnrichedDetection>,
    pub detection_count: usize,
    pub location: GeoPoint,
}

/// The durable output of deduplication: one record per confirmed track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub track_id: u64,
    pub asset_class_id: i64,
    pub category_id: i64,
    pub class_name: String,
    pub confidence: f32,
    pub condition: Condition,
    pub zone: Zone,
    pub side: Side,
    pub frame_number: usize,
    pub timestamp_seconds: f64,
    pub location: GeoPoint,
    pub video_id: String,
    pub route_id: String,
    pub survey_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetSummary {
    pub good: u64,
    pub damaged: u64,
}

impl AssetSummary {
    pub fn record(&mut self, condition: Condition) {
        match condition {
            Condition::Good => self.good += 1,
            Condition::Damaged => self.damaged += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.good + self.damaged
    }
}

/// Run summary returned to the caller; mutated by the driver as the run
/// progresses and finalized at completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub video_id: String,
    pub total_frames: usize,
    pub processed_frames: usize,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub duration_seconds: f64,
    pub output_video_path: PathBuf,
    /// Detection counts per class name.
    pub detection_summary: HashMap<String, u64>,
    pub asset_summary: AssetSummary,
    /// Non-fatal degradations (encoder exit status, store write failures).
    pub warnings: Vec<String>,
}

impl PipelineRun {
    pub fn record_detections<'a>(&mut self, detections: impl Iterator<Item = &'a EnrichedDetection>) {
        for det in detections {
            *self
                .detection_summary
                .entry(det.class_name.clone())
                .or_default() += 1;
        }
    }
}
