use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use survey_common::geo::CameraModel;
use survey_common::zones::ZoneRules;

/// One detection backend: a named channel plus its base URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub channel: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub endpoints: Vec<EndpointConfig>,
    /// Detections below this confidence are dropped inside the client.
    pub confidence_threshold: f32,
    /// Overall timeout for one inference call, seconds.
    pub timeout_secs: u64,
    /// Retry attempts per channel per frame on transient failure.
    pub max_retries: u32,
    /// Base backoff delay, doubled per attempt.
    pub retry_base_delay_ms: u64,
    /// Bounded inference worker count.
    pub workers: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            confidence_threshold: 0.4,
            timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 500,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Frames held in memory per chunk.
    pub chunk_size: usize,
    /// Stride at which frames are selected for inference.
    pub frame_interval: usize,
    pub output_dir: PathBuf,
    /// Offset added to each frame's playback time before trajectory lookup.
    pub gps_time_offset_secs: f64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            chunk_size: 240,
            frame_interval: 3,
            output_dir: PathBuf::from("output"),
            gps_time_offset_secs: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Consecutive associations before a track confirms.
    pub min_hits: u32,
    /// Consecutive missed frames before a track is deleted.
    pub max_misses: u32,
    pub iou_threshold: f32,
    /// Confidence below this reads as a damaged asset.
    pub damaged_below: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_hits: 3,
            max_misses: 30,
            iou_threshold: 0.3,
            damaged_below: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub video: VideoConfig,
    pub inference: InferenceConfig,
    pub tracker: TrackerConfig,
    pub camera: CameraModel,
    pub zones: ZoneRules,
    /// Postgres connection string. Absent -> in-memory degraded mode.
    pub database_url: Option<String>,
    /// TTF font for annotation labels. Absent -> boxes only.
    pub font_path: Option<PathBuf>,
    /// Fallback coordinate when the GPS track is missing or unusable.
    pub default_lat: f64,
    pub default_lon: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            video: VideoConfig::default(),
            inference: InferenceConfig::default(),
            tracker: TrackerConfig::default(),
            camera: CameraModel::default(),
            zones: ZoneRules::default(),
            database_url: None,
            font_path: None,
            default_lat: 24.4539,
            default_lon: 54.3773,
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from a TOML/JSON file, layering file values over
    /// the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        settings
            .try_deserialize()
            .context("failed to deserialize pipeline config")
    }
}
