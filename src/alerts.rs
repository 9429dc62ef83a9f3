//! Threshold rules over snapshot metrics with per-rule cooldown.
//!
//! The engine only reports; notification delivery is left to observers that
//! react to `AlertResult::is_triggered`.

use crate::sensors::HardwareSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    CpuTemp,
    GpuTemp,
    CpuUsage,
    GpuUsage,
}

impl MetricType {
    pub const ALL: [MetricType; 4] = [Self::CpuTemp, Self::GpuTemp, Self::CpuUsage, Self::GpuUsage];

    pub fn valid_range(self) -> RangeInclusive<f64> {
        match self {
            Self::CpuTemp | Self::GpuTemp => 0.0..=150.0,
            Self::CpuUsage | Self::GpuUsage => 0.0..=100.0,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::CpuTemp | Self::GpuTemp => "°C",
            Self::CpuUsage | Self::GpuUsage => "%",
        }
    }

    pub fn value(self, snap: &HardwareSnapshot) -> f64 {
        match self {
            Self::CpuTemp => snap.cpu.temperature_celsius,
            Self::GpuTemp => snap.gpu.temperature_celsius,
            Self::CpuUsage => snap.cpu.usage_percent,
            Self::GpuUsage => snap.gpu.usage_percent,
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CpuTemp => "CPU temperature",
            Self::GpuTemp => "GPU temperature",
            Self::CpuUsage => "CPU usage",
            Self::GpuUsage => "GPU usage",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareDirection {
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub metric: MetricType,
    pub threshold: f64,
    pub direction: CompareDirection,
}

impl AlertRule {
    pub fn new(metric: MetricType, threshold: f64, direction: CompareDirection) -> Self {
        Self {
            metric,
            threshold,
            direction,
        }
    }

    pub fn is_exceeded(&self, value: f64) -> bool {
        match self.direction {
            CompareDirection::Above => value > self.threshold,
            CompareDirection::Below => value < self.threshold,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RuleError {
    #[error("threshold {threshold} for {metric} is outside {min}..={max}")]
    OutOfRange {
        metric: MetricType,
        threshold: f64,
        min: f64,
        max: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertResult {
    pub rule: AlertRule,
    pub current_value: f64,
    pub is_triggered: bool,
}

impl AlertResult {
    pub fn is_exceeded(&self) -> bool {
        self.rule.is_exceeded(self.current_value)
    }

    pub fn notification_text(&self) -> String {
        let unit = self.rule.metric.unit();
        let direction = match self.rule.direction {
            CompareDirection::Above => "above",
            CompareDirection::Below => "below",
        };
        format!(
            "{} alert: current {:.1}{unit} {direction} threshold {:.1}{unit}",
            self.rule.metric, self.current_value, self.rule.threshold
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertState {
    Idle,
    Active,
    Cooldown,
}

#[derive(Debug, Clone, Copy, Default)]
struct RuleState {
    last_triggered: Option<Instant>,
    active: bool,
}

type RuleId = u64;

pub struct AlertEngine {
    rules: Vec<(RuleId, AlertRule)>,
    states: HashMap<RuleId, RuleState>,
    cooldown: Duration,
    next_id: RuleId,
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

impl AlertEngine {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            rules: Vec::new(),
            states: HashMap::new(),
            cooldown,
            next_id: 0,
        }
    }

    pub fn add_rule(&mut self, rule: AlertRule) -> Result<(), RuleError> {
        let range = rule.metric.valid_range();
        if !range.contains(&rule.threshold) {
            return Err(RuleError::OutOfRange {
                metric: rule.metric,
                threshold: rule.threshold,
                min: *range.start(),
                max: *range.end(),
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        self.rules.push((id, rule));
        self.states.insert(id, RuleState::default());
        Ok(())
    }

    /// Removes the first rule equal to `rule` along with its state.
    pub fn remove_rule(&mut self, rule: &AlertRule) -> bool {
        let Some(pos) = self.rules.iter().position(|(_, r)| r == rule) else {
            return false;
        };
        let (id, _) = self.rules.remove(pos);
        self.states.remove(&id);
        true
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.iter().map(|(_, r)| *r).collect()
    }

    pub fn evaluate(&mut self, snap: &HardwareSnapshot) -> Vec<AlertResult> {
        self.evaluate_at(snap, Instant::now())
    }

    pub fn evaluate_at(&mut self, snap: &HardwareSnapshot, now: Instant) -> Vec<AlertResult> {
        let mut results = Vec::with_capacity(self.rules.len());
        for (id, rule) in &self.rules {
            let value = rule.metric.value(snap);
            let state = self.states.entry(*id).or_default();
            let mut is_triggered = false;

            if rule.is_exceeded(value) {
                let cooling_down = state
                    .last_triggered
                    .is_some_and(|at| now.saturating_duration_since(at) < self.cooldown);
                if !cooling_down && !state.active {
                    is_triggered = true;
                    state.active = true;
                    state.last_triggered = Some(now);
                }
            } else {
                // recovery is immediate and resets the cooldown
                state.active = false;
                state.last_triggered = None;
            }

            results.push(AlertResult {
                rule: *rule,
                current_value: value,
                is_triggered,
            });
        }
        results
    }

    /// Forces the first rule equal to `rule` back to idle.
    pub fn clear_alert_state(&mut self, rule: &AlertRule) {
        if let Some(id) = self.find(rule) {
            self.states.insert(id, RuleState::default());
        }
    }

    pub fn state(&self, rule: &AlertRule) -> Option<AlertState> {
        self.state_at(rule, Instant::now())
    }

    pub fn state_at(&self, rule: &AlertRule, now: Instant) -> Option<AlertState> {
        let state = self.states.get(&self.find(rule)?).copied().unwrap_or_default();
        if !state.active {
            return Some(AlertState::Idle);
        }
        let in_window = state
            .last_triggered
            .is_some_and(|at| now.saturating_duration_since(at) < self.cooldown);
        Some(if in_window {
            AlertState::Cooldown
        } else {
            AlertState::Active
        })
    }

    fn find(&self, rule: &AlertRule) -> Option<RuleId> {
        self.rules.iter().find(|(_, r)| r == rule).map(|(id, _)| *id)
    }
}
