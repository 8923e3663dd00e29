//! Detection stabilization.
//!
//! Turns the noisy per-inference detection list into a temporally consistent
//! set:
//! - association by greedy IoU matching, one object per detection and vice versa
//! - debounce: an object is reported only once it has `min_hits` confirmations
//! - persistence: an unmatched object survives `max_disappeared` missed updates
//!
//! A class change is never an update. A same-place detection with a different
//! class leaves the old object unmatched and registers a new one.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::detect::{BoundingBox, Detection};

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
pub const DEFAULT_MAX_DISAPPEARED: u32 = 5;
pub const DEFAULT_MIN_HITS: u32 = 3;

/// Track ids are unique for the lifetime of the process, across all stabilizers.
static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(0);

fn next_track_id() -> u64 {
    NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StabilizerConfig {
    pub iou_threshold: f32,
    pub max_disappeared: u32,
    pub min_hits: u32,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            max_disappeared: DEFAULT_MAX_DISAPPEARED,
            min_hits: DEFAULT_MIN_HITS,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackedObject {
    pub id: u64,
    pub bbox: BoundingBox,
    pub class_name: String,
    pub confidence: f32,
    pub hits: u32,
    pub missing: u32,
}

impl TrackedObject {
    fn register(detection: &Detection) -> Self {
        Self {
            id: next_track_id(),
            bbox: detection.bbox,
            class_name: detection.class_name.clone(),
            confidence: detection.confidence,
            hits: 1,
            missing: 0,
        }
    }

    fn absorb(&mut self, detection: &Detection) {
        self.bbox = detection.bbox;
        self.confidence = detection.confidence;
        self.hits = self.hits.saturating_add(1);
        self.missing = 0;
    }

    fn project(&self) -> Detection {
        Detection {
            class_name: self.class_name.clone(),
            confidence: self.confidence,
            bbox: self.bbox,
        }
    }
}

/// Per-session tracker. Never shared across client sessions.
#[derive(Debug)]
pub struct DetectionStabilizer {
    config: StabilizerConfig,
    objects: BTreeMap<u64, TrackedObject>,
}

impl DetectionStabilizer {
    pub fn new(config: StabilizerConfig) -> Self {
        Self {
            config,
            objects: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> StabilizerConfig {
        self.config
    }

    /// Live tracked objects, confirmed or not, in registration order.
    pub fn tracked(&self) -> impl Iterator<Item = &TrackedObject> {
        self.objects.values()
    }

    pub fn reset(&mut self) {
        self.objects.clear();
    }

    /// Feed one inference result and return the stabilized detection set.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<Detection> {
        let ids: Vec<u64> = self.objects.keys().copied().collect();

        let mut candidates: Vec<(usize, usize, f32)> = Vec::new();
        for (row, id) in ids.iter().enumerate() {
            let bbox = self.objects[id].bbox;
            for (col, det) in detections.iter().enumerate() {
                let iou = bbox.iou(&det.bbox);
                if iou >= self.config.iou_threshold {
                    candidates.push((row, col, iou));
                }
            }
        }
        // Stable sort keeps row-major order among equal IoUs.
        candidates.sort_by(|a, b| b.2.total_cmp(&a.2));

        let mut used_rows = HashSet::new();
        let mut used_cols = HashSet::new();
        for (row, col, _) in candidates {
            if used_rows.contains(&row) || used_cols.contains(&col) {
                continue;
            }
            let Some(object) = self.objects.get_mut(&ids[row]) else {
                continue;
            };
            if object.class_name != detections[col].class_name {
                continue;
            }
            object.absorb(&detections[col]);
            used_rows.insert(row);
            used_cols.insert(col);
        }

        for (row, id) in ids.iter().enumerate() {
            if used_rows.contains(&row) {
                continue;
            }
            let expired = match self.objects.get_mut(id) {
                Some(object) => {
                    object.missing += 1;
                    object.missing > self.config.max_disappeared
                }
                None => false,
            };
            if expired {
                self.objects.remove(id);
            }
        }

        for (col, det) in detections.iter().enumerate() {
            if !used_cols.contains(&col) {
                let object = TrackedObject::register(det);
                self.objects.insert(object.id, object);
            }
        }

        self.active()
    }

    /// Confirmed objects (`hits >= min_hits`) projected back to detections.
    pub fn active(&self) -> Vec<Detection> {
        self.objects
            .values()
            .filter(|o| o.hits >= self.config.min_hits)
            .map(TrackedObject::project)
            .collect()
    }
}

impl Default for DetectionStabilizer {
    fn default() -> Self {
        Self::new(StabilizerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class_name: &str, x: i32) -> Detection {
        Detection::new(class_name, 0.8, BoundingBox::new(x, 0, x + 100, 100))
    }

    fn stabilizer(min_hits: u32, max_disappeared: u32) -> DetectionStabilizer {
        DetectionStabilizer::new(StabilizerConfig {
            iou_threshold: 0.3,
            max_disappeared,
            min_hits,
        })
    }

    #[test]
    fn min_hits_one_passes_detection_through_immediately() {
        let mut s = stabilizer(1, 5);
        let input = vec![Detection::new("NO-Hardhat", 0.8, BoundingBox::new(10, 20, 110, 220))];
        let out = s.update(&input);
        assert_eq!(out, input);
    }

    #[test]
    fn objects_are_debounced_until_min_hits() {
        let mut s = stabilizer(3, 5);
        assert!(s.update(&[det("Hardhat", 0)]).is_empty());
        assert!(s.update(&[det("Hardhat", 5)]).is_empty());
        let out = s.update(&[det("Hardhat", 10)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bbox, BoundingBox::new(10, 0, 110, 100));
        assert_eq!(s.tracked().count(), 1);
    }

    #[test]
    fn identity_survives_exactly_max_disappeared_misses() {
        let mut s = stabilizer(1, 5);
        s.update(&[det("Person", 0)]);
        let id = s.tracked().next().unwrap().id;

        for _ in 0..5 {
            let out = s.update(&[]);
            assert_eq!(out.len(), 1, "object must persist through the gap");
        }
        assert_eq!(s.tracked().next().unwrap().missing, 5);

        // reappears after a gap of exactly max_disappeared: same identity
        s.update(&[det("Person", 2)]);
        let object = s.tracked().next().unwrap();
        assert_eq!(object.id, id);
        assert_eq!(object.hits, 2);
        assert_eq!(object.missing, 0);
    }

    #[test]
    fn identity_is_destroyed_after_max_disappeared_plus_one() {
        let mut s = stabilizer(1, 5);
        s.update(&[det("Person", 0)]);
        let id = s.tracked().next().unwrap().id;
        for _ in 0..6 {
            s.update(&[]);
        }
        assert_eq!(s.tracked().count(), 0);

        s.update(&[det("Person", 0)]);
        assert_ne!(s.tracked().next().unwrap().id, id);
    }

    #[test]
    fn class_change_never_merges_identities() {
        let mut s = stabilizer(1, 5);
        s.update(&[det("Hardhat", 0)]);
        let hardhat_id = s.tracked().next().unwrap().id;

        let out = s.update(&[det("NO-Hardhat", 0)]);
        let objects: Vec<_> = s.tracked().cloned().collect();
        assert_eq!(objects.len(), 2);
        let old = objects.iter().find(|o| o.id == hardhat_id).unwrap();
        assert_eq!(old.class_name, "Hardhat");
        assert_eq!(old.missing, 1);
        let new = objects.iter().find(|o| o.id != hardhat_id).unwrap();
        assert_eq!(new.class_name, "NO-Hardhat");
        assert_eq!(new.hits, 1);
        // both are still reported; the old one is inside its persistence window
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn greedy_matching_prefers_highest_iou() {
        let mut s = stabilizer(1, 5);
        s.update(&[det("Person", 0), det("Person", 300)]);
        // shifted detections: each overlaps only its own object
        let out = s.update(&[det("Person", 310), det("Person", 10)]);
        assert_eq!(out.len(), 2);
        assert!(s.tracked().all(|o| o.hits == 2));
    }

    #[test]
    fn one_detection_matches_at_most_one_object() {
        let mut s = stabilizer(1, 5);
        s.update(&[det("Person", 0), det("Person", 20)]);
        s.update(&[det("Person", 10)]);
        let hits: Vec<u32> = s.tracked().map(|o| o.hits).collect();
        assert_eq!(hits.iter().filter(|h| **h == 2).count(), 1);
        assert_eq!(s.tracked().filter(|o| o.missing == 1).count(), 1);
    }

    #[test]
    fn output_never_exceeds_tracked_identities() {
        let mut s = stabilizer(2, 1);
        let frames = [
            vec![det("Person", 0), det("Hardhat", 0), det("vehicle", 500)],
            vec![det("Person", 5)],
            vec![],
            vec![det("Hardhat", 3), det("NO-Mask", 200)],
        ];
        for frame in frames {
            let out = s.update(&frame);
            assert!(out.len() <= s.tracked().count());
            assert!(s.tracked().all(|o| o.hits >= 1));
        }
    }

    #[test]
    fn track_ids_are_unique_across_stabilizers() {
        let mut a = stabilizer(1, 5);
        let mut b = stabilizer(1, 5);
        a.update(&[det("Person", 0)]);
        b.update(&[det("Person", 0)]);
        assert_ne!(a.tracked().next().unwrap().id, b.tracked().next().unwrap().id);
    }
}
