use crate::alerts::{AlertResult, MetricType};
use crate::collectors::disk::DiskSnapshot;
use crate::collectors::network::NetworkSnapshot;
use crate::collectors::process::ProcessInfo;
use crate::poller::{Observer, PollerStatus, Stage, StageError};
use crate::sensors::HardwareSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};

/// Points kept for the live charts.
pub const CHART_POINTS: usize = 60;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartPoint {
    pub timestamp: DateTime<Utc>,
    pub cpu_temp: f64,
    pub cpu_usage: f64,
    pub gpu_temp: f64,
    pub gpu_usage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardState {
    pub started_at_unix: i64,
    pub status: PollerStatus,
    pub tick: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub snapshot: Option<HardwareSnapshot>,
    pub alerts: Vec<AlertResult>,
    pub alert_flags: HashMap<MetricType, bool>,
    pub disks: Vec<DiskSnapshot>,
    pub network: Vec<NetworkSnapshot>,
    pub processes: Vec<ProcessInfo>,
    /// Failures of the most recent completed tick, by stage name.
    pub stage_errors: BTreeMap<String, String>,
    pub chart: VecDeque<ChartPoint>,
    #[serde(skip)]
    pending_errors: BTreeMap<String, String>,
}

impl DashboardState {
    pub fn new(started_at_unix: i64) -> Self {
        Self {
            started_at_unix,
            status: PollerStatus::Initializing,
            tick: 0,
            last_tick_at: None,
            snapshot: None,
            alerts: Vec::new(),
            alert_flags: MetricType::ALL.iter().map(|m| (*m, false)).collect(),
            disks: Vec::new(),
            network: Vec::new(),
            processes: Vec::new(),
            stage_errors: BTreeMap::new(),
            chart: VecDeque::with_capacity(CHART_POINTS),
            pending_errors: BTreeMap::new(),
        }
    }

    pub fn update_snapshot(&mut self, snapshot: &HardwareSnapshot, at: DateTime<Utc>) {
        if self.chart.len() == CHART_POINTS {
            self.chart.pop_front();
        }
        self.chart.push_back(ChartPoint {
            timestamp: at,
            cpu_temp: snapshot.cpu.temperature_celsius,
            cpu_usage: snapshot.cpu.usage_percent,
            gpu_temp: snapshot.gpu.temperature_celsius,
            gpu_usage: snapshot.gpu.usage_percent,
        });
        self.snapshot = Some(snapshot.clone());
    }

    /// A metric's flag goes up when one of its rules fires and stays up while
    /// any of its rules is still exceeded, cooldown or not.
    pub fn update_alerts(&mut self, results: &[AlertResult]) {
        for metric in MetricType::ALL {
            let mut triggered = false;
            let mut exceeded = false;
            for result in results.iter().filter(|r| r.rule.metric == metric) {
                triggered |= result.is_triggered;
                exceeded |= result.is_exceeded();
            }
            let flag = self.alert_flags.entry(metric).or_insert(false);
            *flag = triggered || (*flag && exceeded);
        }
        self.alerts = results.to_vec();
    }

    pub fn is_alerting(&self, metric: MetricType) -> bool {
        self.alert_flags.get(&metric).copied().unwrap_or(false)
    }

    fn complete_tick(&mut self, tick: u64, at: DateTime<Utc>) {
        self.tick = tick;
        self.last_tick_at = Some(at);
        self.stage_errors = std::mem::take(&mut self.pending_errors);
    }
}

/// Dashboard state shared between the poller and the HTTP handlers.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<RwLock<DashboardState>>,
}

impl SharedState {
    pub fn new(started_at_unix: i64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(DashboardState::new(started_at_unix))),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, DashboardState> {
        self.inner.read().await
    }
}

#[async_trait]
impl Observer for SharedState {
    async fn on_status(&self, status: &PollerStatus) {
        self.inner.write().await.status = status.clone();
    }

    async fn on_snapshot(&self, snapshot: &HardwareSnapshot) {
        self.inner.write().await.update_snapshot(snapshot, Utc::now());
    }

    async fn on_alerts(&self, results: &[AlertResult]) {
        self.inner.write().await.update_alerts(results);
    }

    async fn on_disks(&self, disks: &[DiskSnapshot]) {
        self.inner.write().await.disks = disks.to_vec();
    }

    async fn on_network(&self, adapters: &[NetworkSnapshot]) {
        self.inner.write().await.network = adapters.to_vec();
    }

    async fn on_processes(&self, processes: &[ProcessInfo]) {
        self.inner.write().await.processes = processes.to_vec();
    }

    async fn on_stage_error(&self, stage: Stage, error: &StageError) {
        self.inner
            .write()
            .await
            .pending_errors
            .insert(stage.as_str().to_string(), error.to_string());
    }

    async fn on_tick_complete(&self, tick: u64) {
        self.inner.write().await.complete_tick(tick, Utc::now());
    }
}
