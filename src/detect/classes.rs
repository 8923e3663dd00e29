//! PPE class taxonomy.
//!
//! Class order matches the detector's label indices.

use std::collections::BTreeSet;

use super::result::Detection;

pub const KNOWN_CLASSES: [&str; 10] = [
    "Hardhat",
    "Mask",
    "NO-Hardhat",
    "NO-Mask",
    "NO-Safety Vest",
    "Person",
    "Safety Cone",
    "Safety Vest",
    "machinery",
    "vehicle",
];

/// Classes that represent missing safety equipment.
pub const ALERT_CLASSES: [&str; 3] = ["NO-Hardhat", "NO-Mask", "NO-Safety Vest"];

/// Classes that represent equipment being worn.
pub const POSITIVE_CLASSES: [&str; 3] = ["Hardhat", "Mask", "Safety Vest"];

const NEGATIVE_PREFIX: &str = "NO-";

pub fn is_violation(class_name: &str) -> bool {
    ALERT_CLASSES.contains(&class_name)
}

pub fn is_positive(class_name: &str) -> bool {
    POSITIVE_CLASSES.contains(&class_name)
}

/// `"Hardhat"` -> `Some("NO-Hardhat")`; `None` for non-positive classes.
pub fn negative_counterpart(class_name: &str) -> Option<&'static str> {
    if !is_positive(class_name) {
        return None;
    }
    ALERT_CLASSES
        .iter()
        .copied()
        .find(|alert| alert.strip_prefix(NEGATIVE_PREFIX) == Some(class_name))
}

/// Detections whose class is an alert class.
pub fn violations(detections: &[Detection]) -> Vec<Detection> {
    detections
        .iter()
        .filter(|d| is_violation(&d.class_name))
        .cloned()
        .collect()
}

/// Selected classes plus the negative counterpart of every selected positive class.
pub fn expand_selection(selected: &BTreeSet<String>) -> BTreeSet<String> {
    let mut expanded = selected.clone();
    for class_name in selected {
        if let Some(negative) = negative_counterpart(class_name) {
            expanded.insert(negative.to_string());
        }
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    #[test]
    fn every_positive_class_has_a_negative_counterpart() {
        assert_eq!(negative_counterpart("Hardhat"), Some("NO-Hardhat"));
        assert_eq!(negative_counterpart("Mask"), Some("NO-Mask"));
        assert_eq!(negative_counterpart("Safety Vest"), Some("NO-Safety Vest"));
        assert_eq!(negative_counterpart("Person"), None);
        assert_eq!(negative_counterpart("NO-Hardhat"), None);
    }

    #[test]
    fn expand_selection_adds_negatives_only_for_positives() {
        let selected: BTreeSet<String> = ["Hardhat", "Person"].iter().map(|s| s.to_string()).collect();
        let expanded = expand_selection(&selected);
        assert!(expanded.contains("NO-Hardhat"));
        assert!(expanded.contains("Person"));
        assert!(!expanded.contains("NO-Mask"));
        assert_eq!(expanded.len(), 3);
    }

    #[test]
    fn violations_keep_alert_classes() {
        let b = BoundingBox::new(0, 0, 1, 1);
        let dets = vec![
            Detection::new("Hardhat", 0.9, b),
            Detection::new("NO-Mask", 0.6, b),
            Detection::new("vehicle", 0.7, b),
        ];
        let v = violations(&dets);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].class_name, "NO-Mask");
    }
}
