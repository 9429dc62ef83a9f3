//! The polling loop: one sequential tick per interval, every stage isolated.
//!
//! Blocking work (sensor reads, OS counters, SQLite) runs on the blocking
//! pool; results are handed to observers from the loop task itself, so each
//! observer sees one tick's data in stage order and never two ticks at once.

use crate::alerts::{AlertEngine, AlertResult, AlertRule, RuleError};
use crate::collectors::disk::{DiskMonitor, DiskSnapshot};
use crate::collectors::network::{NetworkMonitor, NetworkSnapshot};
use crate::collectors::process::{ProcessInfo, ProcessMonitor, ProcessSortMode};
use crate::collectors::CollectError;
use crate::sensors::{HardwareSnapshot, SensorBackend, SensorReader};
use crate::storage::{StorageEngine, StorageError};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum PollerStatus {
    Initializing,
    Ready,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Snapshot,
    Alerts,
    Storage,
    Retention,
    Disks,
    Network,
    Processes,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Alerts => "alerts",
            Self::Storage => "storage",
            Self::Retention => "retention",
            Self::Disks => "disks",
            Self::Network => "network",
            Self::Processes => "processes",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Collect(#[from] CollectError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{0} stage panicked")]
    Panicked(Stage),
    #[error("{0} stage worker was lost: {1}")]
    Lost(Stage, String),
}

pub const MIN_INTERVAL_MS: u64 = 100;

/// Per-tick knobs, re-read at the start of every tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickSettings {
    pub interval: Duration,
    pub top_processes: usize,
    pub process_sort: ProcessSortMode,
}

impl Default for TickSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            top_processes: 10,
            process_sort: ProcessSortMode::ByCpu,
        }
    }
}

/// Rule changes requested while polling runs. The loop applies them between
/// ticks, so a tick always evaluates one consistent rule set.
#[derive(Debug)]
pub enum AlertCommand {
    Add(AlertRule, oneshot::Sender<Result<(), RuleError>>),
    Remove(AlertRule, oneshot::Sender<bool>),
    Clear(AlertRule),
    List(oneshot::Sender<Vec<AlertRule>>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    pub every: Duration,
}

/// Receives results in tick order. Every method has a no-op default.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn on_status(&self, _status: &PollerStatus) {}
    async fn on_snapshot(&self, _snapshot: &HardwareSnapshot) {}
    async fn on_alerts(&self, _results: &[AlertResult]) {}
    async fn on_disks(&self, _disks: &[DiskSnapshot]) {}
    async fn on_network(&self, _adapters: &[NetworkSnapshot]) {}
    async fn on_processes(&self, _processes: &[ProcessInfo]) {}
    async fn on_stage_error(&self, _stage: Stage, _error: &StageError) {}
    async fn on_tick_complete(&self, _tick: u64) {}
}

#[derive(Default)]
struct TickReport {
    snapshot: Option<HardwareSnapshot>,
    alerts: Option<Vec<AlertResult>>,
    disks: Option<Vec<DiskSnapshot>>,
    network: Option<Vec<NetworkSnapshot>>,
    processes: Option<Vec<ProcessInfo>>,
    failures: Vec<(Stage, StageError)>,
}

impl TickReport {
    fn record<T>(&mut self, stage: Stage, outcome: Option<Result<T, StageError>>) -> Option<T> {
        match outcome? {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(stage = %stage, error = %err, "poll stage failed");
                self.failures.push((stage, err));
                None
            }
        }
    }
}

pub struct PollingOrchestrator {
    reader: Option<Arc<SensorReader>>,
    alerts: AlertEngine,
    storage: Option<Arc<StorageEngine>>,
    retention: Option<RetentionPolicy>,
    last_cleanup: Option<Instant>,
    disks: Option<DiskMonitor>,
    network: Option<NetworkMonitor>,
    processes: Option<ProcessMonitor>,
    observers: Vec<Arc<dyn Observer>>,
    commands: Option<mpsc::Receiver<AlertCommand>>,
}

impl PollingOrchestrator {
    pub fn new(reader: Arc<SensorReader>, alerts: AlertEngine) -> Self {
        Self {
            reader: Some(reader),
            alerts,
            storage: None,
            retention: None,
            last_cleanup: None,
            disks: None,
            network: None,
            processes: None,
            observers: Vec::new(),
            commands: None,
        }
    }

    pub fn with_storage(mut self, storage: Arc<StorageEngine>, retention: Option<RetentionPolicy>) -> Self {
        self.storage = Some(storage);
        self.retention = retention;
        self
    }

    pub fn with_disks(mut self, monitor: DiskMonitor) -> Self {
        self.disks = Some(monitor);
        self
    }

    pub fn with_network(mut self, monitor: NetworkMonitor) -> Self {
        self.network = Some(monitor);
        self
    }

    pub fn with_processes(mut self, monitor: ProcessMonitor) -> Self {
        self.processes = Some(monitor);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_commands(mut self, commands: mpsc::Receiver<AlertCommand>) -> Self {
        self.commands = Some(commands);
        self
    }

    /// Initializes the sensor backend off the async executor, then polls until
    /// `shutdown` flips. Returns the last published status; an init failure is
    /// terminal and the loop never starts.
    pub async fn run(
        mut self,
        candidates: Vec<Box<dyn SensorBackend>>,
        settings: watch::Receiver<TickSettings>,
        mut shutdown: watch::Receiver<bool>,
    ) -> PollerStatus {
        self.publish_status(&PollerStatus::Initializing).await;

        let Some(reader) = self.reader.clone() else {
            let status = PollerStatus::Error("sensor reader missing".to_string());
            self.publish_status(&status).await;
            return status;
        };
        let init = tokio::task::spawn_blocking(move || reader.initialize(candidates));
        let outcome = tokio::select! {
            _ = shutdown.changed() => {
                info!("shutdown requested during sensor initialization");
                return PollerStatus::Initializing;
            }
            joined = init => joined,
        };

        let status = match outcome {
            Ok(Ok(backend)) => {
                info!(backend, "sensor backend initialized, polling started");
                PollerStatus::Ready
            }
            Ok(Err(err)) => {
                let message = self
                    .reader
                    .as_ref()
                    .and_then(|r| r.take_init_error())
                    .unwrap_or_else(|| err.to_string());
                error!(error = %message, "sensor initialization failed");
                PollerStatus::Error(message)
            }
            Err(err) => {
                error!(error = %err, "sensor initialization worker failed");
                PollerStatus::Error(err.to_string())
            }
        };
        self.publish_status(&status).await;
        if status != PollerStatus::Ready {
            return status;
        }

        self.poll_loop(settings, shutdown).await;
        status
    }

    async fn poll_loop(&mut self, settings: watch::Receiver<TickSettings>, mut shutdown: watch::Receiver<bool>) {
        let mut tick: u64 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let current = *settings.borrow();
            tick += 1;
            self.run_tick(tick, current).await;

            let sleep = time::sleep(current.interval);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!(ticks = tick, "polling stopped");
                        return;
                    }
                    _ = &mut sleep => break,
                    command = next_command(&mut self.commands) => match command {
                        Some(command) => self.apply_command(command),
                        None => self.commands = None,
                    },
                }
            }
        }
        info!(ticks = tick, "polling stopped");
    }

    fn apply_command(&mut self, command: AlertCommand) {
        match command {
            AlertCommand::Add(rule, reply) => {
                let result = self.alerts.add_rule(rule);
                match &result {
                    Ok(()) => info!(metric = %rule.metric, threshold = rule.threshold, "alert rule added"),
                    Err(err) => warn!(error = %err, "alert rule rejected"),
                }
                let _ = reply.send(result);
            }
            AlertCommand::Remove(rule, reply) => {
                let removed = self.alerts.remove_rule(&rule);
                if removed {
                    info!(metric = %rule.metric, threshold = rule.threshold, "alert rule removed");
                }
                let _ = reply.send(removed);
            }
            AlertCommand::Clear(rule) => {
                self.alerts.clear_alert_state(&rule);
                debug!(metric = %rule.metric, "alert state cleared");
            }
            AlertCommand::List(reply) => {
                let _ = reply.send(self.alerts.rules());
            }
        }
    }

    async fn run_tick(&mut self, tick: u64, settings: TickSettings) {
        let started = Instant::now();
        let now = started.into_std();
        let mut report = TickReport::default();

        let outcome = run_stage(Stage::Snapshot, &mut self.reader, |reader| {
            Ok::<_, StageError>(reader.get_snapshot())
        })
        .await;
        report.snapshot = report.record(Stage::Snapshot, outcome);

        if let Some(snapshot) = report.snapshot.clone() {
            let alerts = &mut self.alerts;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| alerts.evaluate_at(&snapshot, now)))
                .map_err(|_| StageError::Panicked(Stage::Alerts));
            report.alerts = report.record(Stage::Alerts, Some(outcome));

            let outcome = run_stage(Stage::Storage, &mut self.storage, move |store| {
                store.save_snapshot(&snapshot)
            })
            .await;
            report.record(Stage::Storage, outcome);
        }

        if let Some(policy) = self.retention.filter(|_| self.retention_due(started)) {
            self.last_cleanup = Some(started);
            let outcome = run_stage(Stage::Retention, &mut self.storage, move |store| {
                store.cleanup_old_data(policy.retention_days)
            })
            .await;
            if let Some(deleted) = report.record(Stage::Retention, outcome) {
                if deleted > 0 {
                    info!(deleted, retention_days = policy.retention_days, "old snapshots removed");
                }
            }
        }

        let outcome = run_stage(Stage::Disks, &mut self.disks, |m| m.poll()).await;
        report.disks = report.record(Stage::Disks, outcome);

        let outcome = run_stage(Stage::Network, &mut self.network, move |m| m.poll(now)).await;
        report.network = report.record(Stage::Network, outcome);

        let outcome = run_stage(Stage::Processes, &mut self.processes, move |m| {
            m.top(settings.top_processes, settings.process_sort, now)
        })
        .await;
        report.processes = report.record(Stage::Processes, outcome);

        self.publish(tick, report).await;
        debug!(tick, elapsed_ms = started.elapsed().as_millis() as u64, "tick complete");
    }

    fn retention_due(&self, now: Instant) -> bool {
        let Some(policy) = self.retention else {
            return false;
        };
        self.storage.is_some()
            && self
                .last_cleanup
                .map_or(true, |last| now.saturating_duration_since(last) >= policy.every)
    }

    async fn publish_status(&self, status: &PollerStatus) {
        for observer in &self.observers {
            observer.on_status(status).await;
        }
    }

    async fn publish(&self, tick: u64, report: TickReport) {
        for observer in &self.observers {
            if let Some(snapshot) = &report.snapshot {
                observer.on_snapshot(snapshot).await;
            }
            if let Some(alerts) = &report.alerts {
                observer.on_alerts(alerts).await;
            }
            if let Some(disks) = &report.disks {
                observer.on_disks(disks).await;
            }
            if let Some(network) = &report.network {
                observer.on_network(network).await;
            }
            if let Some(processes) = &report.processes {
                observer.on_processes(processes).await;
            }
            for (stage, err) in &report.failures {
                observer.on_stage_error(*stage, err).await;
            }
            observer.on_tick_complete(tick).await;
        }
    }
}

async fn next_command(commands: &mut Option<mpsc::Receiver<AlertCommand>>) -> Option<AlertCommand> {
    match commands {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Runs `f` on the blocking pool against the component in `slot`, then puts
/// the component back. `None` when the stage is not configured. A panic inside
/// `f` is reported as a stage failure and the component stays in place.
async fn run_stage<M, T, E, F>(stage: Stage, slot: &mut Option<M>, f: F) -> Option<Result<T, StageError>>
where
    M: Send + 'static,
    T: Send + 'static,
    E: Into<StageError> + Send + 'static,
    F: FnOnce(&mut M) -> Result<T, E> + Send + 'static,
{
    let mut component = slot.take()?;
    let joined = tokio::task::spawn_blocking(move || {
        let out = panic::catch_unwind(AssertUnwindSafe(|| f(&mut component)));
        (component, out)
    })
    .await;

    Some(match joined {
        Ok((component, out)) => {
            *slot = Some(component);
            match out {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(StageError::Panicked(stage)),
            }
        }
        Err(err) => {
            error!(stage = %stage, error = %err, "stage worker lost, stage disabled");
            Err(StageError::Lost(stage, err.to_string()))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertRule, CompareDirection, MetricType};
    use crate::collectors::network::testing::{adapter, ScriptedNetwork};
    use crate::collectors::process::testing::SteppingProcesses;
    use crate::rates::CounterWidth;
    use crate::sensors::matchers::SensorMatchers;
    use crate::sensors::testing::{cpu, gpu, memory, FakeBackend};
    use std::collections::VecDeque;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Status(PollerStatus),
        Snapshot(f64),
        Alerts(Vec<bool>),
        Disks(usize),
        Network(usize),
        Processes(Vec<u32>),
        StageError(Stage),
        Tick(u64),
    }

    struct Recorder(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl Observer for Recorder {
        async fn on_status(&self, status: &PollerStatus) {
            let _ = self.0.send(Event::Status(status.clone()));
        }
        async fn on_snapshot(&self, snapshot: &HardwareSnapshot) {
            let _ = self.0.send(Event::Snapshot(snapshot.cpu.temperature_celsius));
        }
        async fn on_alerts(&self, results: &[AlertResult]) {
            let _ = self.0.send(Event::Alerts(results.iter().map(|r| r.is_triggered).collect()));
        }
        async fn on_disks(&self, disks: &[DiskSnapshot]) {
            let _ = self.0.send(Event::Disks(disks.len()));
        }
        async fn on_network(&self, adapters: &[NetworkSnapshot]) {
            let _ = self.0.send(Event::Network(adapters.len()));
        }
        async fn on_processes(&self, processes: &[ProcessInfo]) {
            let _ = self.0.send(Event::Processes(processes.iter().map(|p| p.pid).collect()));
        }
        async fn on_stage_error(&self, stage: Stage, _error: &StageError) {
            let _ = self.0.send(Event::StageError(stage));
        }
        async fn on_tick_complete(&self, tick: u64) {
            let _ = self.0.send(Event::Tick(tick));
        }
    }

    fn backend() -> FakeBackend {
        FakeBackend::new(vec![cpu("Test CPU", 90.0, 35.0), gpu("Test GPU", 60.0, 20.0), memory(50.0, 8.0, 8.0)])
    }

    fn processes() -> ProcessMonitor {
        let source = SteppingProcesses {
            cores: 2,
            procs: vec![(1, "a", 100.0, 1 << 20), (2, "b", 400.0, 1 << 30)],
            denied: Vec::new(),
            polls: 0,
        };
        ProcessMonitor::new(Box::new(source), 60)
    }

    fn network(polls: usize) -> NetworkMonitor {
        let script = (0..polls)
            .map(|i| Some(vec![adapter("eth0", i as u64 * 1024, 0)]))
            .collect();
        NetworkMonitor::new(Box::new(ScriptedNetwork { script }), CounterWidth::Bits32, 60)
    }

    fn orchestrator(tx: mpsc::UnboundedSender<Event>) -> (PollingOrchestrator, Arc<SensorReader>) {
        let reader = Arc::new(SensorReader::new(SensorMatchers::default(), None));
        let mut engine = AlertEngine::default();
        engine
            .add_rule(AlertRule::new(MetricType::CpuTemp, 80.0, CompareDirection::Above))
            .unwrap();
        let orch = PollingOrchestrator::new(reader.clone(), engine)
            .with_disks(DiskMonitor::new(reader.clone()))
            .with_processes(processes())
            .with_observer(Arc::new(Recorder(tx)));
        (orch, reader)
    }

    fn settings(interval_ms: u64, top: usize) -> TickSettings {
        TickSettings {
            interval: Duration::from_millis(interval_ms),
            top_processes: top,
            process_sort: ProcessSortMode::ByCpu,
        }
    }

    async fn until_tick(rx: &mut mpsc::UnboundedReceiver<Event>, tick: u64) -> Vec<Event> {
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = event == Event::Tick(tick);
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn tick_publishes_stages_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (orch, _reader) = orchestrator(tx);
        let store = Arc::new(StorageEngine::open_in_memory().unwrap());
        let orch = orch.with_storage(store.clone(), None).with_network(network(10));

        let (_settings_tx, settings_rx) = watch::channel(settings(3_600_000, 10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(orch.run(vec![Box::new(backend())], settings_rx, shutdown_rx));

        let events = until_tick(&mut rx, 1).await;
        assert_eq!(
            events,
            vec![
                Event::Status(PollerStatus::Initializing),
                Event::Status(PollerStatus::Ready),
                Event::Snapshot(90.0),
                Event::Alerts(vec![true]),
                Event::Disks(0),
                Event::Network(1),
                Event::Processes(vec![1, 2]),
                Event::Tick(1),
            ]
        );

        shutdown_tx.send(true).unwrap();
        let status = time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(status, PollerStatus::Ready);

        let now = chrono::Utc::now();
        let rows = store.query(now - chrono::Duration::minutes(1), now).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cpu_temp, 90.0);
    }

    #[tokio::test]
    async fn init_failure_is_terminal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (orch, reader) = orchestrator(tx);
        let mut broken = backend();
        broken.fail_open = true;
        let reads = broken.reads.clone();

        let (_settings_tx, settings_rx) = watch::channel(settings(10, 10));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let status = orch.run(vec![Box::new(broken)], settings_rx, shutdown_rx).await;

        assert!(matches!(&status, PollerStatus::Error(msg) if msg.contains("driver missing")));
        assert_eq!(rx.recv().await, Some(Event::Status(PollerStatus::Initializing)));
        assert_eq!(rx.recv().await, Some(Event::Status(status)));
        assert_eq!(rx.recv().await, None);
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        // the sticky error was consumed by the orchestrator
        assert!(reader.take_init_error().is_none());
    }

    #[tokio::test]
    async fn failing_stage_does_not_stop_the_rest() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (orch, _reader) = orchestrator(tx);
        let dead_network = NetworkMonitor::new(
            Box::new(ScriptedNetwork { script: VecDeque::new() }),
            CounterWidth::Bits32,
            60,
        );
        let orch = orch.with_network(dead_network);

        let (_settings_tx, settings_rx) = watch::channel(settings(5, 10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(orch.run(vec![Box::new(backend())], settings_rx, shutdown_rx));

        let first = until_tick(&mut rx, 1).await;
        assert!(first.contains(&Event::StageError(Stage::Network)));
        assert!(first.contains(&Event::Processes(vec![1, 2])));
        assert!(!first.iter().any(|e| matches!(e, Event::Network(_))));

        let second = until_tick(&mut rx, 2).await;
        assert!(second.contains(&Event::Alerts(vec![false])));
        assert!(second.contains(&Event::StageError(Stage::Network)));
        // 400 ms of CPU per tick for pid 2 now ranks it first
        assert!(matches!(second.iter().find(|e| matches!(e, Event::Processes(_))), Some(Event::Processes(p)) if p[0] == 2));

        shutdown_tx.send(true).unwrap();
        time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn settings_are_read_every_tick() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (orch, _reader) = orchestrator(tx);

        let (settings_tx, settings_rx) = watch::channel(settings(5, 10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(orch.run(vec![Box::new(backend())], settings_rx, shutdown_rx));

        until_tick(&mut rx, 1).await;
        settings_tx.send(settings(5, 1)).unwrap();
        let mut last = until_tick(&mut rx, 2).await;
        for tick in 3..=4 {
            last = until_tick(&mut rx, tick).await;
        }
        let procs = last.iter().find_map(|e| match e {
            Event::Processes(p) => Some(p.clone()),
            _ => None,
        });
        assert_eq!(procs.map(|p| p.len()), Some(1));

        shutdown_tx.send(true).unwrap();
        time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn panicking_stage_is_contained() {
        struct Exploding;
        impl crate::collectors::process::ProcessSource for Exploding {
            fn core_count(&self) -> usize {
                1
            }
            fn read(
                &mut self,
            ) -> Result<Vec<Result<crate::collectors::process::ProcessSample, CollectError>>, CollectError> {
                panic!("source exploded");
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = Arc::new(SensorReader::new(SensorMatchers::default(), None));
        let orch = PollingOrchestrator::new(reader, AlertEngine::default())
            .with_processes(ProcessMonitor::new(Box::new(Exploding), 60))
            .with_observer(Arc::new(Recorder(tx)));

        let (_settings_tx, settings_rx) = watch::channel(settings(5, 10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(orch.run(vec![Box::new(backend())], settings_rx, shutdown_rx));

        for tick in 1..=2 {
            let events = until_tick(&mut rx, tick).await;
            assert!(events.contains(&Event::StageError(Stage::Processes)));
            assert!(events.contains(&Event::Snapshot(90.0)));
        }

        shutdown_tx.send(true).unwrap();
        time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[test]
    fn run_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let (tx, _rx) = mpsc::unbounded_channel();
        let (orch, _reader) = orchestrator(tx);
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        let orch = orch.with_network(network(1)).with_commands(cmd_rx);
        let (_settings_tx, settings_rx) = watch::channel(settings(5, 10));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let run = orch.run(vec![Box::new(backend())], settings_rx, shutdown_rx);
        assert_send(&run);
    }

    async fn next_alerts(rx: &mut mpsc::UnboundedReceiver<Event>, len: usize) -> Vec<bool> {
        alerts_matching(rx, |flags| flags.len() == len).await
    }

    async fn alerts_matching(rx: &mut mpsc::UnboundedReceiver<Event>, want: impl Fn(&[bool]) -> bool) -> Vec<bool> {
        let wait = async {
            loop {
                match rx.recv().await {
                    Some(Event::Alerts(flags)) if want(&flags) => return flags,
                    Some(_) => continue,
                    None => panic!("poller stopped"),
                }
            }
        };
        time::timeout(Duration::from_secs(5), wait).await.unwrap()
    }

    #[tokio::test]
    async fn rule_commands_apply_between_ticks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (orch, _reader) = orchestrator(tx);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let orch = orch.with_commands(cmd_rx);

        let (_settings_tx, settings_rx) = watch::channel(settings(5, 10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(orch.run(vec![Box::new(backend())], settings_rx, shutdown_rx));
        assert_eq!(next_alerts(&mut rx, 1).await, vec![true]);

        let cpu_rule = AlertRule::new(MetricType::CpuTemp, 80.0, CompareDirection::Above);
        let gpu_rule = AlertRule::new(MetricType::GpuTemp, 50.0, CompareDirection::Above);

        let (reply, added) = oneshot::channel();
        cmd_tx.send(AlertCommand::Add(gpu_rule, reply)).await.unwrap();
        assert_eq!(added.await.unwrap(), Ok(()));
        assert_eq!(next_alerts(&mut rx, 2).await, vec![false, true]);

        let (reply, rejected) = oneshot::channel();
        let hot = AlertRule::new(MetricType::CpuTemp, 500.0, CompareDirection::Above);
        cmd_tx.send(AlertCommand::Add(hot, reply)).await.unwrap();
        assert!(matches!(rejected.await.unwrap(), Err(RuleError::OutOfRange { .. })));

        let (reply, removed) = oneshot::channel();
        cmd_tx.send(AlertCommand::Remove(cpu_rule, reply)).await.unwrap();
        assert!(removed.await.unwrap());
        let (reply, removed) = oneshot::channel();
        cmd_tx.send(AlertCommand::Remove(cpu_rule, reply)).await.unwrap();
        assert!(!removed.await.unwrap());

        // the gpu rule is still exceeded, so only a cleared state notifies again
        assert_eq!(next_alerts(&mut rx, 1).await, vec![false]);
        cmd_tx.send(AlertCommand::Clear(gpu_rule)).await.unwrap();
        let (reply, listed) = oneshot::channel();
        cmd_tx.send(AlertCommand::List(reply)).await.unwrap();
        assert_eq!(listed.await.unwrap(), vec![gpu_rule]);
        alerts_matching(&mut rx, |flags| flags == [true]).await;

        shutdown_tx.send(true).unwrap();
        time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retention_is_due_once_per_interval() {
        let reader = Arc::new(SensorReader::new(SensorMatchers::default(), None));
        let store = Arc::new(StorageEngine::open_in_memory().unwrap());
        let policy = RetentionPolicy {
            retention_days: 30,
            every: Duration::from_secs(3600),
        };
        let mut orch = PollingOrchestrator::new(reader, AlertEngine::default()).with_storage(store, Some(policy));

        let start = Instant::now();
        assert!(orch.retention_due(start));
        orch.last_cleanup = Some(start);

        time::advance(Duration::from_secs(1800)).await;
        assert!(!orch.retention_due(Instant::now()));
        time::advance(Duration::from_secs(1800)).await;
        assert!(orch.retention_due(Instant::now()));
    }

    #[tokio::test]
    async fn retention_runs_at_start() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (orch, _reader) = orchestrator(tx);
        let store = Arc::new(StorageEngine::open_in_memory().unwrap());
        let old = chrono::Utc::now() - chrono::Duration::days(45);
        store.save_snapshot_at(&HardwareSnapshot::default(), old).unwrap();

        let policy = RetentionPolicy {
            retention_days: 30,
            every: Duration::from_secs(3600),
        };
        let orch = orch.with_storage(store.clone(), Some(policy));

        let (_settings_tx, settings_rx) = watch::channel(settings(3_600_000, 10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(orch.run(vec![Box::new(backend())], settings_rx, shutdown_rx));
        until_tick(&mut rx, 1).await;

        shutdown_tx.send(true).unwrap();
        time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        let all = store
            .query(old - chrono::Duration::days(1), chrono::Utc::now())
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].cpu_temp, 90.0);
    }
}
