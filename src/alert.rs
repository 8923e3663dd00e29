//! Alert dispatch: violation detections in, deduplicated alert events out.
//!
//! - one alert per class per cooldown window, tracked by last emission time
//! - fixed severity table (configured high and medium sets, everything else low)
//! - bounded history, most recent first; the oldest entries are evicted past the cap

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::{BoundingBox, Detection};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);
pub const DEFAULT_HISTORY_CAP: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    pub const ALL: [Severity; 3] = [Severity::High, Severity::Medium, Severity::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: String,
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub frame_number: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub acknowledged: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertStats {
    pub total: usize,
    pub unacknowledged: usize,
    pub by_class: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
}

#[derive(Clone, Debug)]
pub struct AlertConfig {
    pub cooldown: Duration,
    pub history_cap: usize,
    pub high_severity: Vec<String>,
    pub medium_severity: Vec<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            history_cap: DEFAULT_HISTORY_CAP,
            high_severity: vec!["NO-Hardhat".to_string()],
            medium_severity: vec!["NO-Safety Vest".to_string()],
        }
    }
}

#[derive(Debug)]
pub struct AlertDispatcher {
    cooldown: chrono::Duration,
    history_cap: usize,
    high: HashSet<String>,
    medium: HashSet<String>,
    history: VecDeque<AlertEvent>,
    last_alert: HashMap<String, DateTime<Utc>>,
}

impl AlertDispatcher {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            cooldown: chrono::Duration::from_std(config.cooldown)
                .unwrap_or_else(|_| chrono::Duration::seconds(5)),
            history_cap: config.history_cap.max(1),
            high: config.high_severity.into_iter().collect(),
            medium: config.medium_severity.into_iter().collect(),
            history: VecDeque::new(),
            last_alert: HashMap::new(),
        }
    }

    pub fn severity_of(&self, class_name: &str) -> Severity {
        if self.high.contains(class_name) {
            Severity::High
        } else if self.medium.contains(class_name) {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Emit alerts for `violations` observed now.
    pub fn process_violations(
        &mut self,
        violations: &[Detection],
        frame_number: Option<u64>,
    ) -> Vec<AlertEvent> {
        self.process_violations_at(violations, frame_number, Utc::now())
    }

    /// Same as `process_violations` with an explicit clock reading.
    pub fn process_violations_at(
        &mut self,
        violations: &[Detection],
        frame_number: Option<u64>,
        now: DateTime<Utc>,
    ) -> Vec<AlertEvent> {
        let mut new_alerts = Vec::new();
        for violation in violations {
            if !self.cooldown_elapsed(&violation.class_name, now) {
                continue;
            }
            let alert = AlertEvent {
                id: uuid::Uuid::new_v4().to_string(),
                class_name: violation.class_name.clone(),
                confidence: round2(violation.confidence),
                bbox: violation.bbox,
                frame_number,
                timestamp: now,
                severity: self.severity_of(&violation.class_name),
                acknowledged: false,
            };
            self.last_alert.insert(violation.class_name.clone(), now);
            self.push_history(alert.clone());
            log::info!(
                "AlertDispatcher: {} alert for {} (conf={:.2})",
                alert.severity.as_str(),
                alert.class_name,
                alert.confidence
            );
            new_alerts.push(alert);
        }
        new_alerts
    }

    fn cooldown_elapsed(&self, class_name: &str, now: DateTime<Utc>) -> bool {
        match self.last_alert.get(class_name) {
            Some(last) => now.signed_duration_since(*last) >= self.cooldown,
            None => true,
        }
    }

    fn push_history(&mut self, alert: AlertEvent) {
        self.history.push_front(alert);
        while self.history.len() > self.history_cap {
            self.history.pop_back();
        }
    }

    /// Mark an alert as acknowledged. Returns false for unknown ids.
    pub fn acknowledge(&mut self, alert_id: &str) -> bool {
        match self.history.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<AlertEvent> {
        self.history.iter().take(limit).cloned().collect()
    }

    /// Filtered history, most recent first.
    pub fn query(
        &self,
        limit: usize,
        severity: Option<Severity>,
        unacknowledged_only: bool,
    ) -> Vec<AlertEvent> {
        self.history
            .iter()
            .filter(|a| severity.map_or(true, |s| a.severity == s))
            .filter(|a| !unacknowledged_only || !a.acknowledged)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> AlertStats {
        let mut stats = AlertStats {
            total: self.history.len(),
            ..AlertStats::default()
        };
        for severity in Severity::ALL {
            stats.by_severity.insert(severity, 0);
        }
        for alert in &self.history {
            if !alert.acknowledged {
                stats.unacknowledged += 1;
            }
            *stats.by_class.entry(alert.class_name.clone()).or_insert(0) += 1;
            *stats.by_severity.entry(alert.severity).or_insert(0) += 1;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Drop the history. Per-class cooldown timestamps are kept.
    pub fn clear(&mut self) {
        self.history.clear();
    }
}

impl Default for AlertDispatcher {
    fn default() -> Self {
        Self::new(AlertConfig::default())
    }
}

fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn violation(class_name: &str) -> Detection {
        Detection::new(class_name, 0.876, BoundingBox::new(1, 2, 30, 40))
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn one_alert_per_class_per_cooldown_window() {
        let mut d = AlertDispatcher::default();
        let first = d.process_violations_at(&[violation("NO-Hardhat")], Some(1), t(0));
        let second = d.process_violations_at(&[violation("NO-Hardhat")], Some(2), t(3));
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(d.len(), 1);
        assert_eq!(first[0].timestamp, t(0));

        let third = d.process_violations_at(&[violation("NO-Hardhat")], Some(3), t(5));
        assert_eq!(third.len(), 1);
    }

    #[test]
    fn same_class_twice_in_one_call_alerts_once() {
        let mut d = AlertDispatcher::default();
        let out = d.process_violations_at(
            &[violation("NO-Mask"), violation("NO-Mask"), violation("NO-Hardhat")],
            None,
            t(0),
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn severity_table() {
        let d = AlertDispatcher::default();
        assert_eq!(d.severity_of("NO-Hardhat"), Severity::High);
        assert_eq!(d.severity_of("NO-Safety Vest"), Severity::Medium);
        assert_eq!(d.severity_of("NO-Mask"), Severity::Low);
        assert_eq!(d.severity_of("anything"), Severity::Low);
    }

    #[test]
    fn confidence_is_rounded_and_json_uses_class_key() {
        let mut d = AlertDispatcher::default();
        let alert = d
            .process_violations_at(&[violation("NO-Hardhat")], Some(9), t(0))
            .remove(0);
        assert_eq!(alert.confidence, 0.88);
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["class"], "NO-Hardhat");
        assert_eq!(json["severity"], "high");
        assert_eq!(json["frame_number"], 9);
        assert_eq!(json["acknowledged"], false);
    }

    #[test]
    fn history_is_bounded_and_most_recent_first() {
        let mut d = AlertDispatcher::new(AlertConfig {
            cooldown: Duration::ZERO,
            history_cap: 3,
            ..AlertConfig::default()
        });
        for i in 0..5 {
            d.process_violations_at(&[violation("NO-Mask")], Some(i), t(i as i64));
        }
        assert_eq!(d.len(), 3);
        let frames: Vec<_> = d.recent(10).iter().map(|a| a.frame_number).collect();
        assert_eq!(frames, vec![Some(4), Some(3), Some(2)]);
    }

    #[test]
    fn acknowledge_and_stats() {
        let mut d = AlertDispatcher::default();
        let alerts = d.process_violations_at(
            &[violation("NO-Hardhat"), violation("NO-Safety Vest")],
            None,
            t(0),
        );
        assert!(d.acknowledge(&alerts[0].id));
        assert!(!d.acknowledge("missing"));

        let stats = d.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.unacknowledged, 1);
        assert_eq!(stats.by_class["NO-Hardhat"], 1);
        assert_eq!(stats.by_severity[&Severity::High], 1);
        assert_eq!(stats.by_severity[&Severity::Medium], 1);
        assert_eq!(stats.by_severity[&Severity::Low], 0);

        let open = d.query(10, None, true);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].class_name, "NO-Safety Vest");
        assert_eq!(d.query(10, Some(Severity::High), false).len(), 1);
    }

    #[test]
    fn clear_keeps_cooldown() {
        let mut d = AlertDispatcher::default();
        d.process_violations_at(&[violation("NO-Hardhat")], None, t(0));
        d.clear();
        assert!(d.is_empty());
        assert!(d
            .process_violations_at(&[violation("NO-Hardhat")], None, t(1))
            .is_empty());
    }
}
