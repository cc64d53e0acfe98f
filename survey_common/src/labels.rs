use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::detection::Condition;
use crate::zones::base_class;

/// Persistent identifiers for one resolvable asset type, as supplied by
/// the storage collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelEntry {
    pub asset_class_id: i64,
    pub category_id: i64,
}

/// Maps detector class names to persistent asset/category identifiers.
/// Lookup is keyed on the base class, so condition-suffixed variants all
/// resolve to the same asset type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelMap {
    entries: HashMap<String, LabelEntry>,
}

impl LabelMap {
    pub fn new(entries: HashMap<String, LabelEntry>) -> Self {
        Self { entries }
    }

    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        let entries: HashMap<String, LabelEntry> = serde_json::from_str(body)?;
        Ok(Self { entries })
    }

    pub fn resolve(&self, class_name: &str) -> Option<&LabelEntry> {
        self.entries
            .get(class_name)
            .or_else(|| self.entries.get(base_class(class_name)))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Asset condition. An explicit condition suffix in the class name wins;
/// otherwise low confidence reads as damage.
pub fn condition_for(class_name: &str, confidence: f32, damaged_below: f32) -> Condition {
    if class_name.contains("Damaged") {
        return Condition::Damaged;
    }
    if class_name.contains("Good") {
        return Condition::Good;
    }
    if confidence < damaged_below {
        Condition::Damaged
    } else {
        Condition::Good
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_suffixed_names_via_base_class() {
        let mut entries = HashMap::new();
        entries.insert(
            "Traffic_Sign".to_string(),
            LabelEntry {
                asset_class_id: 42,
                category_id: 7,
            },
        );
        let map = LabelMap::new(entries);

        let entry = map.resolve("Traffic_Sign_AssetCondition_Good").unwrap();
        assert_eq!(entry.asset_class_id, 42);
        assert!(map.resolve("Unknown_Thing").is_none());
    }

    #[test]
    fn condition_suffix_beats_confidence() {
        assert_eq!(
            condition_for("Guardrail_AssetCondition_Damaged", 0.95, 0.3),
            Condition::Damaged
        );
        assert_eq!(
            condition_for("Guardrail_AssetCondition_Good", 0.1, 0.3),
            Condition::Good
        );
    }

    #[test]
    fn low_confidence_reads_as_damaged() {
        assert_eq!(condition_for("Pothole", 0.2, 0.3), Condition::Damaged);
        assert_eq!(condition_for("Pothole", 0.8, 0.3), Condition::Good);
    }
}
