use serde::{Deserialize, Serialize};

use crate::bbox::BBox;
use crate::detection::{Side, Zone};

/// Frame-geometry thresholds for the zone heuristic. Empirically chosen
/// for the original survey rig; kept configurable rather than assumed
/// general.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ZoneRules {
    /// A box whose bottom edge sits above this fraction of frame height is
    /// an overhead candidate.
    pub overhead_cutoff: f32,
    /// Horizontal band (fraction of width) at each edge mapped to shoulder.
    pub shoulder_band: f32,
    /// Inner half-band around center mapped to pavement; between the two
    /// bands lies median.
    pub pavement_band: f32,
}

impl Default for ZoneRules {
    fn default() -> Self {
        Self {
            overhead_cutoff: 0.44,
            shoulder_band: 0.15,
            pavement_band: 0.20,
        }
    }
}

/// Candidate zones per base asset type. Hand-curated and closed: most
/// types admit exactly one zone, a few admit two or three. Order matters,
/// the first entry is the fallback when geometry resolves to none of them.
static ZONE_TABLE: &[(&str, &[Zone])] = &[
    ("Overhead_Sign", &[Zone::Overhead]),
    ("Gantry", &[Zone::Overhead]),
    ("Variable_Message_Sign", &[Zone::Overhead]),
    ("Bridge", &[Zone::Overhead]),
    ("Traffic_Signal", &[Zone::Overhead, Zone::Shoulder]),
    ("Traffic_Sign", &[Zone::Shoulder, Zone::Overhead, Zone::Median]),
    ("Street_Light", &[Zone::Shoulder, Zone::Median]),
    ("Guardrail", &[Zone::Shoulder, Zone::Median]),
    ("Median_Barrier", &[Zone::Median]),
    ("Kerb", &[Zone::Shoulder]),
    ("Bus_Stop", &[Zone::Shoulder]),
    ("Emergency_Phone", &[Zone::Shoulder]),
    ("Road_Marking", &[Zone::Pavement]),
    ("Pothole", &[Zone::Pavement]),
    ("Crack", &[Zone::Pavement]),
    ("Manhole", &[Zone::Pavement]),
    ("Speed_Bump", &[Zone::Pavement]),
    ("Drainage", &[Zone::Shoulder, Zone::Pavement]),
    ("Camera_Pole", &[Zone::Shoulder, Zone::Overhead]),
];

// Any class the table does not know: let geometry decide.
static DEFAULT_CANDIDATES: &[Zone] = &[Zone::Shoulder, Zone::Overhead, Zone::Median];

/// Strips trailing condition/clearance qualifiers from a detector class
/// name, e.g. `Traffic_Sign_AssetCondition_Good` -> `Traffic_Sign`.
pub fn base_class(class_name: &str) -> &str {
    if let Some(idx) = class_name.find("_AssetCondition_") {
        return &class_name[..idx];
    }
    for suffix in ["_Good", "_Damaged", "_LowClearance", "_HighClearance"] {
        if let Some(stripped) = class_name.strip_suffix(suffix) {
            return stripped;
        }
    }
    class_name
}

pub fn candidate_zones(class_name: &str) -> &'static [Zone] {
    let base = base_class(class_name);
    ZONE_TABLE
        .iter()
        .find(|(name, _)| *name == base)
        .map(|(_, zones)| *zones)
        .unwrap_or(DEFAULT_CANDIDATES)
}

/// Deterministic zone assignment. Single-candidate classes never consult
/// frame geometry.
pub fn classify_zone(
    rules: &ZoneRules,
    class_name: &str,
    bbox: &BBox,
    frame_width: u32,
    frame_height: u32,
) -> Zone {
    let candidates = candidate_zones(class_name);
    if candidates.len() == 1 {
        return candidates[0];
    }

    let h = frame_height as f32;
    if bbox.y2 < rules.overhead_cutoff * h && candidates.contains(&Zone::Overhead) {
        return Zone::Overhead;
    }

    let w = frame_width as f32;
    let (cx, _) = bbox.center();
    let frac = cx / w;
    let geometric = if frac < rules.shoulder_band || frac > 1.0 - rules.shoulder_band {
        Zone::Shoulder
    } else if (frac - 0.5).abs() < rules.pavement_band {
        Zone::Pavement
    } else {
        Zone::Median
    };

    if candidates.contains(&geometric) {
        geometric
    } else {
        candidates[0]
    }
}

/// Pure left/right split on the frame's vertical midline.
pub fn classify_side(bbox: &BBox, frame_width: u32) -> Side {
    let (cx, _) = bbox.center();
    if cx < frame_width as f32 / 2.0 {
        Side::Left
    } else {
        Side::Right
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 1920;
    const H: u32 = 1080;

    #[test]
    fn strips_condition_suffixes() {
        assert_eq!(base_class("Traffic_Sign_AssetCondition_Good"), "Traffic_Sign");
        assert_eq!(base_class("Guardrail_Damaged"), "Guardrail");
        assert_eq!(base_class("Gantry_LowClearance"), "Gantry");
        assert_eq!(base_class("Pothole"), "Pothole");
    }

    #[test]
    fn single_candidate_ignores_geometry() {
        let rules = ZoneRules::default();
        // A median barrier drawn way up in the sky still classifies median.
        let bbox = BBox::new(10.0, 10.0, 100.0, 50.0);
        assert_eq!(
            classify_zone(&rules, "Median_Barrier", &bbox, W, H),
            Zone::Median
        );
        assert_eq!(classify_zone(&rules, "Pothole", &bbox, W, H), Zone::Pavement);
    }

    #[test]
    fn high_box_with_overhead_candidate_is_overhead() {
        let rules = ZoneRules::default();
        // Bottom edge at 300 < 0.44 * 1080.
        let bbox = BBox::new(800.0, 100.0, 1100.0, 300.0);
        assert_eq!(
            classify_zone(&rules, "Traffic_Sign_AssetCondition_Good", &bbox, W, H),
            Zone::Overhead
        );
    }

    #[test]
    fn edge_box_buckets_to_shoulder() {
        let rules = ZoneRules::default();
        // cx = 100 -> 5% of width, below the 15% shoulder band; low in frame.
        let bbox = BBox::new(50.0, 700.0, 150.0, 900.0);
        assert_eq!(
            classify_zone(&rules, "Traffic_Sign", &bbox, W, H),
            Zone::Shoulder
        );
    }

    #[test]
    fn inner_band_falls_back_when_not_a_candidate() {
        let rules = ZoneRules::default();
        // cx at center buckets pavement, which street lights do not admit;
        // falls back to the first table entry (shoulder).
        let bbox = BBox::new(910.0, 700.0, 1010.0, 900.0);
        assert_eq!(
            classify_zone(&rules, "Street_Light", &bbox, W, H),
            Zone::Shoulder
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let rules = ZoneRules::default();
        let bbox = BBox::new(400.0, 500.0, 700.0, 800.0);
        let first = classify_zone(&rules, "Guardrail", &bbox, W, H);
        for _ in 0..10 {
            assert_eq!(classify_zone(&rules, "Guardrail", &bbox, W, H), first);
            assert_eq!(classify_side(&bbox, W), classify_side(&bbox, W));
        }
    }

    #[test]
    fn side_splits_on_midline() {
        assert_eq!(classify_side(&BBox::new(0.0, 0.0, 100.0, 100.0), W), Side::Left);
        assert_eq!(
            classify_side(&BBox::new(1800.0, 0.0, 1900.0, 100.0), W),
            Side::Right
        );
    }
}
