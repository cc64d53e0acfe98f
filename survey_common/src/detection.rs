use serde::{Deserialize, Serialize};

use crate::bbox::BBox;

/// A named detection backend. Each channel owns a subset of asset classes
/// and maps to one configured endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Lighting,
    Its,
    Oia,
    Pavement,
    Structures,
    Other(String),
}

// Hand-rolled so `Other` shares the plain-string wire shape of the unit
// variants instead of serde's `{"other": ...}` tagging.
impl Serialize for Channel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(Channel::from_name(&name))
    }
}

impl Channel {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "lighting" => Channel::Lighting,
            "its" => Channel::Its,
            "oia" => Channel::Oia,
            "pavement" => Channel::Pavement,
            "structures" => Channel::Structures,
            other => Channel::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Channel::Lighting => "lighting",
            Channel::Its => "its",
            Channel::Oia => "oia",
            Channel::Pavement => "pavement",
            Channel::Structures => "structures",
            Channel::Other(name) => name,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Road-relative placement of a detected asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Overhead,
    Median,
    Pavement,
    Shoulder,
}

impl Zone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Overhead => "overhead",
            Zone::Median => "median",
            Zone::Pavement => "pavement",
            Zone::Shoulder => "shoulder",
        }
    }
}

/// Left/right of the vehicle, assuming a forward-facing center-mounted camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Good,
    Damaged,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Good => "good",
            Condition::Damaged => "damaged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// One inference hit for one frame, as returned by a detection channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDetection {
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BBox,
    pub channel: Channel,
}

/// A detection after geolocation and zone/side classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedDetection {
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BBox,
    pub channel: Channel,
    pub location: GeoPoint,
    pub bearing_deg: f64,
    pub distance_m: f64,
    pub zone: Zone,
    pub side: Side,
}
