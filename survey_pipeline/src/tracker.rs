use survey_common::detection::EnrichedDetection;
use survey_common::zones::base_class;
use tracing::debug;

use crate::config::TrackerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Tentative,
    Confirmed,
    Deleted,
}

/// One hypothesized physical object, followed across inference frames.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub class_name: String,
    pub state: TrackState,
    pub last_detection: EnrichedDetection,
    pub last_seen_frame: usize,
    hit_streak: u32,
    misses: u32,
    asset_emitted: bool,
}

/// Raised the moment a track first reaches Confirmed. At most one per
/// track, ever.
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub track_id: u64,
    pub detection: EnrichedDetection,
    pub frame_number: usize,
    pub timestamp_seconds: f64,
}

/// Multi-object tracker deduplicating repeated sightings of the same
/// physical asset. Owned exclusively by the driver; updated strictly in
/// frame order.
pub struct AssetTracker {
    cfg: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u64,
}

impl AssetTracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self {
            cfg,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Consumes one frame's detections: associates them against live
    /// tracks by class and IoU, ages out the unmatched, spawns Tentative
    /// tracks for new detections, and returns any first-time
    /// confirmations.
    pub fn update(
        &mut self,
        frame_number: usize,
        timestamp_seconds: f64,
        detections: &[EnrichedDetection],
    ) -> Vec<Confirmation> {
        let mut confirmations = Vec::new();

        // Candidate pairs above the IoU floor, same base class only,
        // matched greedily best-first.
        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                if base_class(&track.class_name) != base_class(&det.class_name) {
                    continue;
                }
                let iou = track.last_detection.bbox.iou(&det.bbox);
                if iou >= self.cfg.iou_threshold {
                    pairs.push((ti, di, iou));
                }
            }
        }
        pairs.sort_by(|a, b| b.2.total_cmp(&a.2));

        let mut track_matched = vec![false; self.tracks.len()];
        let mut det_matched = vec![false; detections.len()];
        for (ti, di, _) in pairs {
            if track_matched[ti] || det_matched[di] {
                continue;
            }
            track_matched[ti] = true;
            det_matched[di] = true;

            let track = &mut self.tracks[ti];
            track.last_detection = detections[di].clone();
            track.last_seen_frame = frame_number;
            track.misses = 0;
            track.hit_streak += 1;

            if track.state == TrackState::Tentative && track.hit_streak >= self.cfg.min_hits {
                track.state = TrackState::Confirmed;
                if !track.asset_emitted {
                    track.asset_emitted = true;
                    debug!(track_id = track.id, class = %track.class_name, "track confirmed");
                    confirmations.push(Confirmation {
                        track_id: track.id,
                        detection: track.last_detection.clone(),
                        frame_number,
                        timestamp_seconds,
                    });
                }
            }
        }

        // Age out unmatched tracks. A miss breaks a tentative streak.
        for (ti, track) in self.tracks.iter_mut().enumerate() {
            if track_matched[ti] {
                continue;
            }
            track.misses += 1;
            if track.state == TrackState::Tentative {
                track.hit_streak = 0;
            }
            if track.misses > self.cfg.max_misses {
                track.state = TrackState::Deleted;
            }
        }
        self.tracks.retain(|t| t.state != TrackState::Deleted);

        // Unmatched detections seed new tentative tracks.
        for (di, det) in detections.iter().enumerate() {
            if det_matched[di] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            let mut track = Track {
                id,
                class_name: det.class_name.clone(),
                state: TrackState::Tentative,
                last_detection: det.clone(),
                last_seen_frame: frame_number,
                hit_streak: 1,
                misses: 0,
                asset_emitted: false,
            };
            if track.hit_streak >= self.cfg.min_hits {
                track.state = TrackState::Confirmed;
                track.asset_emitted = true;
                confirmations.push(Confirmation {
                    track_id: track.id,
                    detection: track.last_detection.clone(),
                    frame_number,
                    timestamp_seconds,
                });
            }
            self.tracks.push(track);
        }

        confirmations
    }

    pub fn live_tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn confirmed_count(&self) -> usize {
        self.tracks
            .iter()
            .filter(|t| t.state == TrackState::Confirmed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use survey_common::bbox::BBox;
    use survey_common::detection::{Channel, GeoPoint, Side, Zone};

    fn cfg() -> TrackerConfig {
        TrackerConfig {
            min_hits: 3,
            max_misses: 30,
            iou_threshold: 0.3,
            damaged_below: 0.3,
        }
    }

    fn det(class: &str, bbox: BBox) -> EnrichedDetection {
        EnrichedDetection {
            class_name: class.to_string(),
            confidence: 0.8,
            bbox,
            channel: Channel::Oia,
            location: GeoPoint { lat: 24.0, lon: 54.0 },
            bearing_deg: 0.0,
            distance_m: 20.0,
            zone: Zone::Shoulder,
            side: Side::Left,
        }
    }

    fn sign(dx: f32) -> EnrichedDetection {
        det(
            "Traffic_Sign_AssetCondition_Good",
            BBox::new(100.0 + dx, 200.0, 180.0 + dx, 300.0),
        )
    }

    #[test]
    fn confirms_after_min_hits_and_emits_once() {
        let mut tracker = AssetTracker::new(cfg());

        assert!(tracker.update(0, 0.0, &[sign(0.0)]).is_empty());
        assert!(tracker.update(3, 0.1, &[sign(2.0)]).is_empty());
        let confirmed = tracker.update(6, 0.2, &[sign(4.0)]);
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].frame_number, 6);

        // Further hits never re-emit.
        for frame in [9, 12, 15] {
            assert!(tracker.update(frame, 0.3, &[sign(6.0)]).is_empty());
        }
        assert_eq!(tracker.confirmed_count(), 1);
    }

    #[test]
    fn reconfirmation_after_loss_emits_nothing() {
        let mut tracker = AssetTracker::new(cfg());
        tracker.update(0, 0.0, &[sign(0.0)]);
        tracker.update(3, 0.1, &[sign(0.0)]);
        assert_eq!(tracker.update(6, 0.2, &[sign(0.0)]).len(), 1);

        // Lost for a while, but within the miss budget.
        for frame in [9, 12, 15, 18] {
            assert!(tracker.update(frame, 0.5, &[]).is_empty());
        }
        // Re-associates with the same track: no second asset.
        assert!(tracker.update(21, 0.7, &[sign(1.0)]).is_empty());
        assert_eq!(tracker.confirmed_count(), 1);
    }

    #[test]
    fn track_deleted_after_miss_budget() {
        let mut tracker = AssetTracker::new(cfg());
        tracker.update(0, 0.0, &[sign(0.0)]);
        for frame in 1..=31 {
            tracker.update(frame, frame as f64, &[]);
        }
        assert!(tracker.live_tracks().is_empty());
    }

    #[test]
    fn miss_resets_tentative_streak() {
        let mut tracker = AssetTracker::new(cfg());
        tracker.update(0, 0.0, &[sign(0.0)]);
        tracker.update(1, 0.1, &[sign(0.0)]);
        tracker.update(2, 0.2, &[]); // streak broken at 2
        tracker.update(3, 0.3, &[sign(0.0)]);
        tracker.update(4, 0.4, &[sign(0.0)]);
        // Only now does the streak reach min_hits again.
        assert_eq!(tracker.update(5, 0.5, &[sign(0.0)]).len(), 1);
    }

    #[test]
    fn different_classes_never_associate() {
        let mut tracker = AssetTracker::new(cfg());
        let overlap = BBox::new(100.0, 200.0, 180.0, 300.0);
        tracker.update(0, 0.0, &[det("Traffic_Sign", overlap)]);
        tracker.update(1, 0.1, &[det("Street_Light", overlap)]);
        assert_eq!(tracker.live_tracks().len(), 2);
    }

    #[test]
    fn condition_suffix_variants_share_a_track() {
        let mut tracker = AssetTracker::new(cfg());
        let b = BBox::new(100.0, 200.0, 180.0, 300.0);
        tracker.update(0, 0.0, &[det("Guardrail_AssetCondition_Good", b)]);
        tracker.update(1, 0.1, &[det("Guardrail_AssetCondition_Damaged", b)]);
        assert_eq!(tracker.live_tracks().len(), 1);
    }
}
