use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::detection::GeoPoint;

/// One raw GPS fix from the survey track file.
#[derive(Debug, Clone, Deserialize)]
pub struct GpsSample {
    pub lat: f64,
    pub lon: f64,
    #[serde(alias = "ts", alias = "time")]
    pub timestamp: Timestamp,
    #[serde(default)]
    pub alt: Option<f64>,
}

/// Track timestamps appear either as epoch seconds or RFC 3339 strings,
/// depending on the logger that produced the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Epoch(f64),
    Rfc3339(String),
}

impl Timestamp {
    pub fn as_seconds(&self) -> Option<f64> {
        match self {
            Timestamp::Epoch(s) => Some(*s),
            Timestamp::Rfc3339(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis() as f64 / 1000.0),
        }
    }
}

/// Dense per-frame position of the survey vehicle. Immutable once built,
/// indexed by frame number, covering frames `0..=total_frames`.
#[derive(Debug, Clone, Serialize)]
pub struct Trajectory {
    positions: Vec<GeoPoint>,
    fps: f64,
}

impl Trajectory {
    /// Interpolates a sparse track into one position per frame.
    ///
    /// Sample timestamps are normalized to start at zero, then each frame's
    /// playback time `frame / fps + offset` is linearly interpolated against
    /// them. Outside the recorded range the edge values are held; there is
    /// no extrapolation.
    pub fn interpolate(
        samples: &[GpsSample],
        total_frames: usize,
        fps: f64,
        offset_seconds: f64,
    ) -> Option<Self> {
        let mut timed: Vec<(f64, f64, f64)> = samples
            .iter()
            .filter_map(|s| s.timestamp.as_seconds().map(|t| (t, s.lat, s.lon)))
            .collect();
        if timed.is_empty() || fps <= 0.0 {
            return None;
        }
        timed.sort_by(|a, b| a.0.total_cmp(&b.0));

        let t0 = timed[0].0;
        let times: Vec<f64> = timed.iter().map(|(t, _, _)| t - t0).collect();

        let positions = (0..=total_frames)
            .map(|frame| {
                let t = frame as f64 / fps + offset_seconds;
                let (lat, lon) = lerp_track(&times, &timed, t);
                GeoPoint { lat, lon }
            })
            .collect();

        Some(Self { positions, fps })
    }

    /// Degraded mode for a missing or unusable GPS track: every frame is
    /// pinned to a single fixed coordinate.
    pub fn fixed(point: GeoPoint, total_frames: usize, fps: f64) -> Self {
        Self {
            positions: vec![point; total_frames + 1],
            fps,
        }
    }

    pub fn position_at(&self, frame: usize) -> GeoPoint {
        let idx = frame.min(self.positions.len() - 1);
        self.positions[idx]
    }

    pub fn timestamp_at(&self, frame: usize) -> f64 {
        frame as f64 / self.fps
    }

    /// Vehicle heading at a frame, from a symmetric window of
    /// `frame_interval` frames on either side (clamped at the ends of the
    /// sequence). Returns 0.0 when the window collapses to a single point
    /// or the two interpolated points coincide.
    pub fn bearing_at(&self, frame: usize, frame_interval: usize) -> f64 {
        let last = self.positions.len() - 1;
        let start = frame.saturating_sub(frame_interval);
        let mut end = (frame + frame_interval).min(last);
        if start == end {
            // Window collapsed (very short video); fall back to the
            // narrowest usable 2-point window.
            end = (start + 1).min(last);
        }
        if start == end {
            return 0.0;
        }
        let a = self.positions[start];
        let b = self.positions[end];
        if a == b {
            return 0.0;
        }
        initial_bearing(a, b)
    }
}

fn lerp_track(times: &[f64], timed: &[(f64, f64, f64)], t: f64) -> (f64, f64) {
    if t <= times[0] {
        return (timed[0].1, timed[0].2);
    }
    let last = times.len() - 1;
    if t >= times[last] {
        return (timed[last].1, timed[last].2);
    }
    let i = match times.binary_search_by(|probe| probe.total_cmp(&t)) {
        Ok(i) => return (timed[i].1, timed[i].2),
        Err(i) => i,
    };
    let (t0, lat0, lon0) = timed[i - 1];
    let (t1, lat1, lon1) = timed[i];
    let span = t1 - t0;
    let frac = if span > 0.0 { (t - t0) / span } else { 0.0 };
    (lat0 + (lat1 - lat0) * frac, lon0 + (lon1 - lon0) * frac)
}

/// Initial great-circle bearing from `a` to `b`, degrees in `[0, 360)`.
pub fn initial_bearing(a: GeoPoint, b: GeoPoint) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let y = dlon.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlon.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// Parses a JSON GPS track file body: an array of sample objects.
pub fn parse_track(body: &str) -> Result<Vec<GpsSample>, serde_json::Error> {
    serde_json::from_str(body)
}
