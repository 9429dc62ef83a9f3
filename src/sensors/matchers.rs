//! Label-matching table that maps vendor sensor names onto snapshot fields.
//!
//! Vendors name the same physical sensor differently ("CPU Package",
//! "Tctl", "Core (Tdie)", "GPU Board Power", ...), so this is a best-effort
//! normalization, not an exact mapping. Rules are evaluated in table order;
//! for a given field the first rule that finds a sensor with a value wins. A
//! rule with no label fragments matches any sensor of its kind and serves as
//! the "first sensor of this kind" fallback.

use crate::sensors::{SensorKind, SensorReading};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotField {
    CpuTemperature,
    CpuUsage,
    CpuPower,
    CpuClock,
    GpuTemperature,
    GpuUsage,
    GpuPower,
    GpuClock,
    GpuMemoryUsed,
    GpuMemoryTotal,
    MemoryUsage,
    MemoryUsed,
    MemoryAvailable,
    DiskTemperature,
    DiskRead,
    DiskWrite,
}

impl SnapshotField {
    pub const ALL: [SnapshotField; 16] = [
        Self::CpuTemperature,
        Self::CpuUsage,
        Self::CpuPower,
        Self::CpuClock,
        Self::GpuTemperature,
        Self::GpuUsage,
        Self::GpuPower,
        Self::GpuClock,
        Self::GpuMemoryUsed,
        Self::GpuMemoryTotal,
        Self::MemoryUsage,
        Self::MemoryUsed,
        Self::MemoryAvailable,
        Self::DiskTemperature,
        Self::DiskRead,
        Self::DiskWrite,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRule {
    pub field: SnapshotField,
    pub kind: SensorKind,
    #[serde(default)]
    pub label_contains: Vec<String>,
}

impl MatchRule {
    fn new(field: SnapshotField, kind: SensorKind, labels: &[&str]) -> Self {
        Self {
            field,
            kind,
            label_contains: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn matches(&self, sensor: &SensorReading) -> bool {
        if sensor.kind != self.kind {
            return false;
        }
        if self.label_contains.is_empty() {
            return true;
        }
        let label = sensor.label.to_lowercase();
        self.label_contains
            .iter()
            .any(|fragment| label.contains(&fragment.to_lowercase()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorMatchers {
    rules: Vec<MatchRule>,
}

impl SensorMatchers {
    pub fn new(rules: Vec<MatchRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[MatchRule] {
        &self.rules
    }

    pub fn resolve(&self, field: SnapshotField, sensors: &[SensorReading]) -> Option<f64> {
        self.rules
            .iter()
            .filter(|rule| rule.field == field)
            .find_map(|rule| {
                sensors
                    .iter()
                    .filter(|s| rule.matches(s))
                    .find_map(|s| s.value.filter(|v| v.is_finite()))
            })
    }

    pub fn covers(&self, field: SnapshotField) -> bool {
        self.rules.iter().any(|r| r.field == field)
    }

    /// Fields no rule maps; they always read 0 (memory and CPU usage may
    /// still come from the OS fallback).
    pub fn uncovered(&self) -> Vec<SnapshotField> {
        SnapshotField::ALL
            .into_iter()
            .filter(|f| !self.covers(*f))
            .collect()
    }
}

impl Default for SensorMatchers {
    fn default() -> Self {
        use SensorKind::*;
        use SnapshotField::*;

        Self::new(vec![
            MatchRule::new(CpuTemperature, Temperature, &["package", "tctl", "tdie"]),
            MatchRule::new(CpuTemperature, Temperature, &[]),
            MatchRule::new(CpuUsage, Load, &["total"]),
            MatchRule::new(CpuPower, Power, &["package"]),
            MatchRule::new(CpuClock, Clock, &["core #1"]),
            MatchRule::new(CpuClock, Clock, &[]),
            MatchRule::new(GpuTemperature, Temperature, &["core"]),
            MatchRule::new(GpuTemperature, Temperature, &[]),
            MatchRule::new(GpuUsage, Load, &["core"]),
            MatchRule::new(GpuPower, Power, &["board", "tdp", "total"]),
            MatchRule::new(GpuPower, Power, &[]),
            MatchRule::new(GpuClock, Clock, &["core"]),
            MatchRule::new(GpuMemoryUsed, SmallData, &["memory used"]),
            MatchRule::new(GpuMemoryTotal, SmallData, &["memory total"]),
            MatchRule::new(MemoryUsage, Load, &["memory"]),
            MatchRule::new(MemoryUsed, Data, &["used"]),
            MatchRule::new(MemoryAvailable, Data, &["available"]),
            MatchRule::new(DiskTemperature, Temperature, &[]),
            MatchRule::new(DiskRead, Throughput, &["read"]),
            MatchRule::new(DiskWrite, Throughput, &["write"]),
        ])
    }
}
