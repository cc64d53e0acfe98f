use serde::{Deserialize, Serialize};

use crate::bbox::BBox;
use crate::detection::GeoPoint;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Simplified pinhole/flat-earth projection of a detection onto the road.
///
/// The camera is assumed forward-facing with a fixed downward tilt. The
/// depression angle of the box's bottom edge gives range; the horizontal
/// offset of the box center gives a bearing offset from the vehicle
/// heading. Deliberately approximate: good enough for the sub-200 m ranges
/// a survey camera sees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CameraModel {
    /// Mounting height above the road surface, meters.
    pub height_m: f64,
    /// Vertical field of view, degrees.
    pub vertical_fov_deg: f64,
    /// Fixed downward tilt of the optical axis, degrees.
    pub tilt_deg: f64,
    /// Range clamp, meters.
    pub max_range_m: f64,
    /// Depression angles below this are treated as at-the-horizon and
    /// clamped to `max_range_m`.
    pub min_depression_deg: f64,
}

impl Default for CameraModel {
    fn default() -> Self {
        Self {
            height_m: 1.5,
            vertical_fov_deg: 55.0,
            tilt_deg: 8.0,
            max_range_m: 200.0,
            min_depression_deg: 0.5,
        }
    }
}

/// Absolute position estimate for one detection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoEstimate {
    pub location: GeoPoint,
    pub bearing_deg: f64,
    pub distance_m: f64,
}

impl CameraModel {
    /// Projects a pixel bounding box into an absolute lat/lon given the
    /// vehicle pose at that frame.
    pub fn locate(
        &self,
        vehicle: GeoPoint,
        heading_deg: f64,
        frame_width: u32,
        frame_height: u32,
        bbox: &BBox,
    ) -> GeoEstimate {
        let w = frame_width as f64;
        let h = frame_height as f64;

        // Bottom edge of the box below image center -> positive depression.
        let dy = bbox.y2 as f64 - h / 2.0;
        let depression_deg = self.tilt_deg + (dy / h) * self.vertical_fov_deg;

        let distance_m = if depression_deg < self.min_depression_deg {
            self.max_range_m
        } else {
            (self.height_m / depression_deg.to_radians().tan()).min(self.max_range_m)
        };

        let (cx, _) = bbox.center();
        let horizontal_fov_deg = self.vertical_fov_deg * w / h;
        let bearing_offset = ((cx as f64 - w / 2.0) / w) * horizontal_fov_deg;
        let bearing_deg = (heading_deg + bearing_offset).rem_euclid(360.0);

        GeoEstimate {
            location: destination_point(vehicle, bearing_deg, distance_m),
            bearing_deg,
            distance_m,
        }
    }
}

/// Small-distance equirectangular destination point: `distance_m` along
/// `bearing_deg` from `origin`, with longitude compensated by cos(lat).
pub fn destination_point(origin: GeoPoint, bearing_deg: f64, distance_m: f64) -> GeoPoint {
    let bearing = bearing_deg.to_radians();
    let dlat = distance_m * bearing.cos() / EARTH_RADIUS_M;
    let dlon = distance_m * bearing.sin() / (EARTH_RADIUS_M * origin.lat.to_radians().cos());
    GeoPoint {
        lat: origin.lat + dlat.to_degrees(),
        lon: origin.lon + dlon.to_degrees(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 1920;
    const H: u32 = 1080;

    fn origin() -> GeoPoint {
        GeoPoint { lat: 24.45, lon: 54.38 }
    }

    #[test]
    fn bottom_edge_at_vertical_center_clamps_to_max_range() {
        // With the box bottom exactly at image center the depression angle
        // is just the tilt; force the near-horizon branch with zero tilt.
        let model = CameraModel {
            tilt_deg: 0.0,
            ..CameraModel::default()
        };
        let bbox = BBox::new(900.0, 400.0, 1020.0, 540.0);
        let est = model.locate(origin(), 0.0, W, H, &bbox);
        assert_eq!(est.distance_m, model.max_range_m);
    }

    #[test]
    fn low_box_yields_finite_distance_below_max() {
        let model = CameraModel::default();
        // Bottom edge well below center.
        let bbox = BBox::new(900.0, 700.0, 1020.0, 1000.0);
        let est = model.locate(origin(), 0.0, W, H, &bbox);
        assert!(est.distance_m < model.max_range_m);
        assert!(est.distance_m > 0.0);
    }

    #[test]
    fn centered_box_bearing_equals_heading() {
        let model = CameraModel::default();
        let bbox = BBox::new(910.0, 600.0, 1010.0, 900.0); // cx = 960 = W/2
        let est = model.locate(origin(), 137.0, W, H, &bbox);
        assert!((est.bearing_deg - 137.0).abs() < 1e-6);
    }

    #[test]
    fn right_of_center_box_bears_right_of_heading() {
        let model = CameraModel::default();
        let bbox = BBox::new(1500.0, 600.0, 1700.0, 900.0);
        let est = model.locate(origin(), 0.0, W, H, &bbox);
        assert!(est.bearing_deg > 0.0 && est.bearing_deg < 90.0);
    }

    #[test]
    fn destination_point_north_increases_latitude_only() {
        let dst = destination_point(origin(), 0.0, 1000.0);
        assert!(dst.lat > origin().lat);
        assert!((dst.lon - origin().lon).abs() < 1e-9);
        // ~1 km is ~0.009 degrees of latitude.
        assert!((dst.lat - origin().lat - 0.008993).abs() < 1e-4);
    }

    #[test]
    fn destination_point_east_compensates_for_latitude() {
        let dst = destination_point(origin(), 90.0, 1000.0);
        assert!(dst.lon > origin().lon);
        assert!((dst.lat - origin().lat).abs() < 1e-9);
        // At 24.45N a degree of longitude is shorter than at the equator.
        let equator = destination_point(GeoPoint { lat: 0.0, lon: 54.38 }, 90.0, 1000.0);
        assert!(dst.lon - origin().lon > equator.lon - 54.38);
    }
}
