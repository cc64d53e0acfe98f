use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use survey_common::labels::{LabelEntry, LabelMap};
use tracing::{info, warn};

use crate::records::{Asset, FrameRecord};

/// Boundary to the storage collaborator. The pipeline only ever inserts
/// frame/asset records, checks asset existence for idempotent re-runs,
/// and reads the label-resolution map.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn health_check(&self) -> Result<()>;

    async fn load_label_map(&self) -> Result<LabelMap>;

    async fn insert_frame_record(&self, record: &FrameRecord) -> Result<()>;

    /// Whether an asset for this (track, video) pair is already persisted.
    async fn asset_exists(&self, track_id: u64, video_id: &str) -> Result<bool>;

    /// Batch-inserts the run's assets, skipping records that already
    /// exist. Returns the number actually inserted.
    async fn insert_assets(&self, assets: &[Asset]) -> Result<usize>;
}

/// PostgreSQL-backed store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("connecting to result store");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("failed to connect to result store")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ResultStore for PgStore {
    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("result store health check failed")?;
        Ok(())
    }

    async fn load_label_map(&self) -> Result<LabelMap> {
        let rows = sqlx::query(
            "SELECT class_name, asset_class_id, category_id FROM asset_labels",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load label map")?;

        let mut entries = HashMap::new();
        for row in rows {
            let class_name: String = row.try_get("class_name")?;
            entries.insert(
                class_name,
                LabelEntry {
                    asset_class_id: row.try_get("asset_class_id")?,
                    category_id: row.try_get("category_id")?,
                },
            );
        }
        Ok(LabelMap::new(entries))
    }

    async fn insert_frame_record(&self, record: &FrameRecord) -> Result<()> {
        let detections =
            serde_json::to_value(&record.detections).context("failed to serialize detections")?;

        sqlx::query(
            r#"
            INSERT INTO frame_records (
                video_id, route_id, survey_id, frame_number,
                timestamp_seconds, detections, detection_count, lat, lon
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&record.video_id)
        .bind(&record.route_id)
        .bind(&record.survey_id)
        .bind(record.frame_number as i64)
        .bind(record.timestamp_seconds)
        .bind(detections)
        .bind(record.detection_count as i32)
        .bind(record.location.lat)
        .bind(record.location.lon)
        .execute(&self.pool)
        .await
        .context("failed to insert frame record")?;
        Ok(())
    }

    async fn asset_exists(&self, track_id: u64, video_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM assets WHERE track_id = $1 AND video_id = $2")
            .bind(track_id as i64)
            .bind(video_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to query asset existence")?;
        Ok(row.is_some())
    }

    async fn insert_assets(&self, assets: &[Asset]) -> Result<usize> {
        let mut inserted = 0usize;
        for asset in assets {
            let result = sqlx::query(
                r#"
                INSERT INTO assets (
                    track_id, video_id, route_id, survey_id,
                    asset_class_id, category_id, class_name, confidence,
                    condition, zone, side, frame_number, timestamp_seconds,
                    lat, lon, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                ON CONFLICT (track_id, video_id) DO NOTHING
                "#,
            )
            .bind(asset.track_id as i64)
            .bind(&asset.video_id)
            .bind(&asset.route_id)
            .bind(&asset.survey_id)
            .bind(asset.asset_class_id)
            .bind(asset.category_id)
            .bind(&asset.class_name)
            .bind(asset.confidence)
            .bind(asset.condition.as_str())
            .bind(asset.zone.as_str())
            .bind(asset.side.as_str())
            .bind(asset.frame_number as i64)
            .bind(asset.timestamp_seconds)
            .bind(asset.location.lat)
            .bind(asset.location.lon)
            .bind(asset.created_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) if done.rows_affected() > 0 => inserted += 1,
                Ok(_) => {
                    info!(track_id = asset.track_id, "asset already persisted, skipped");
                }
                Err(err) => {
                    warn!(track_id = asset.track_id, %err, "failed to insert asset, skipped");
                }
            }
        }
        Ok(inserted)
    }
}

/// In-memory store: the explicit degraded mode when no database URL is
/// configured, and the test double for the persistence seam.
#[derive(Default)]
pub struct MemoryStore {
    labels: LabelMap,
    pub frames: Mutex<Vec<FrameRecord>>,
    pub assets: Mutex<HashMap<(u64, String), Asset>>,
}

impl MemoryStore {
    pub fn new(labels: LabelMap) -> Self {
        Self {
            labels,
            frames: Mutex::new(Vec::new()),
            assets: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn load_label_map(&self) -> Result<LabelMap> {
        Ok(self.labels.clone())
    }

    async fn insert_frame_record(&self, record: &FrameRecord) -> Result<()> {
        self.frames.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn asset_exists(&self, track_id: u64, video_id: &str) -> Result<bool> {
        Ok(self
            .assets
            .lock()
            .unwrap()
            .contains_key(&(track_id, video_id.to_string())))
    }

    async fn insert_assets(&self, assets: &[Asset]) -> Result<usize> {
        let mut stored = self.assets.lock().unwrap();
        let mut inserted = 0usize;
        for asset in assets {
            let key = (asset.track_id, asset.video_id.clone());
            if stored.contains_key(&key) {
                continue;
            }
            stored.insert(key, asset.clone());
            inserted += 1;
        }
        Ok(inserted)
    }
}
