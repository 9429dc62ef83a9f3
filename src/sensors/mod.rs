pub mod lhm;
pub mod matchers;
pub mod native;

use matchers::{SensorMatchers, SnapshotField};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use sysinfo::{CpuExt, System, SystemExt};
use thiserror::Error;
use tracing::{debug, info, warn};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareKind {
    Cpu,
    Gpu,
    Memory,
    Storage,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Temperature,
    Load,
    Power,
    Clock,
    Data,
    SmallData,
    Throughput,
    Other,
}

impl SensorKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "temperature" => Self::Temperature,
            "load" => Self::Load,
            "power" => Self::Power,
            "clock" => Self::Clock,
            "data" => Self::Data,
            "smalldata" => Self::SmallData,
            "throughput" => Self::Throughput,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub kind: SensorKind,
    pub label: String,
    pub value: Option<f64>,
}

impl SensorReading {
    pub fn new(kind: SensorKind, label: impl Into<String>, value: f64) -> Self {
        Self {
            kind,
            label: label.into(),
            value: Some(value),
        }
    }
}

/// All sensors of one device as reported by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct HardwareReading {
    pub kind: HardwareKind,
    pub name: String,
    pub sensors: Vec<SensorReading>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("sensor backend {backend} unavailable: {reason}")]
    Unavailable { backend: &'static str, reason: String },
    #[error("failed to read {hardware}: {reason}")]
    Read { hardware: String, reason: String },
    #[error("no sensor backend configured")]
    NoBackend,
}

/// A source of named, labeled hardware sensors.
pub trait SensorBackend: Send {
    fn name(&self) -> &'static str;

    /// Opens the backend; may be slow and must not run on the async executor.
    fn open(&mut self) -> Result<(), BackendError>;

    /// Refreshes and reads every device of the requested kinds. Each device is
    /// its own entry so one failing device does not hide the others.
    fn read(&mut self, kinds: &[HardwareKind]) -> Vec<Result<HardwareReading, BackendError>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryTotals {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// OS-wide aggregate counters used when the backend reports nothing.
pub trait OsCounters: Send {
    fn cpu_usage_percent(&mut self) -> Option<f64>;
    fn memory(&mut self) -> Option<MemoryTotals>;
}

pub struct SysinfoCounters {
    system: System,
}

impl SysinfoCounters {
    pub fn new() -> Self {
        let mut system = System::new();
        // the first CPU refresh only establishes a baseline
        system.refresh_cpu();
        Self { system }
    }
}

impl Default for SysinfoCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl OsCounters for SysinfoCounters {
    fn cpu_usage_percent(&mut self) -> Option<f64> {
        self.system.refresh_cpu();
        if self.system.cpus().is_empty() {
            return None;
        }
        Some(self.system.global_cpu_info().cpu_usage() as f64)
    }

    fn memory(&mut self) -> Option<MemoryTotals> {
        self.system.refresh_memory();
        let total_bytes = self.system.total_memory();
        if total_bytes == 0 {
            return None;
        }
        Some(MemoryTotals {
            total_bytes,
            available_bytes: self.system.available_memory(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuReading {
    pub name: String,
    pub temperature_celsius: f64,
    pub usage_percent: f64,
    pub power_watts: f64,
    pub clock_mhz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuReading {
    pub name: String,
    pub temperature_celsius: f64,
    pub usage_percent: f64,
    pub power_watts: f64,
    pub clock_mhz: f64,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MemoryReading {
    pub usage_percent: f64,
    pub used_gb: f64,
    pub available_gb: f64,
}

impl MemoryReading {
    pub fn total_gb(&self) -> f64 {
        self.used_gb + self.available_gb
    }
}

/// One point-in-time reading. A sensor that could not be read stays at 0,
/// which callers must treat as "unknown or idle".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardwareSnapshot {
    pub cpu: CpuReading,
    pub gpu: GpuReading,
    pub memory: MemoryReading,
}

impl Default for HardwareSnapshot {
    fn default() -> Self {
        Self {
            cpu: CpuReading {
                name: "CPU".to_string(),
                temperature_celsius: 0.0,
                usage_percent: 0.0,
                power_watts: 0.0,
                clock_mhz: 0.0,
            },
            gpu: GpuReading {
                name: "GPU".to_string(),
                temperature_celsius: 0.0,
                usage_percent: 0.0,
                power_watts: 0.0,
                clock_mhz: 0.0,
                memory_used_mb: 0.0,
                memory_total_mb: 0.0,
            },
            memory: MemoryReading::default(),
        }
    }
}

impl HardwareSnapshot {
    pub fn total_power_watts(&self) -> f64 {
        self.cpu.power_watts + self.gpu.power_watts
    }
}

enum BackendSlot {
    Pending,
    Ready(Box<dyn SensorBackend>),
    Failed,
}

/// Owns the sensor backend and normalizes its readings into snapshots.
///
/// The backend handle lives behind a single mutex that covers both the swap-in
/// after `initialize` and every later read. A panic inside a backend call
/// poisons that mutex; the guard is recovered so later ticks keep reading.
pub struct SensorReader {
    backend: Mutex<BackendSlot>,
    fallback: Mutex<Option<Box<dyn OsCounters>>>,
    matchers: SensorMatchers,
    init_error: Mutex<Option<String>>,
}

impl SensorReader {
    pub fn new(matchers: SensorMatchers, fallback: Option<Box<dyn OsCounters>>) -> Self {
        Self {
            backend: Mutex::new(BackendSlot::Pending),
            fallback: Mutex::new(fallback),
            matchers,
            init_error: Mutex::new(None),
        }
    }

    pub fn matchers(&self) -> &SensorMatchers {
        &self.matchers
    }

    /// Opens the first candidate that succeeds. On total failure the reason is
    /// kept as a sticky error for `take_init_error`.
    pub fn initialize(
        &self,
        candidates: Vec<Box<dyn SensorBackend>>,
    ) -> Result<&'static str, BackendError> {
        let mut last_err = BackendError::NoBackend;
        for mut candidate in candidates {
            match candidate.open() {
                Ok(()) => {
                    let name = candidate.name();
                    *lock(&self.backend) = BackendSlot::Ready(candidate);
                    info!(backend = name, "sensor backend ready");
                    return Ok(name);
                }
                Err(err) => {
                    warn!(backend = candidate.name(), error = %err, "sensor backend failed to open");
                    last_err = err;
                }
            }
        }

        *lock(&self.backend) = BackendSlot::Failed;
        *lock(&self.init_error) = Some(last_err.to_string());
        Err(last_err)
    }

    pub fn is_ready(&self) -> bool {
        matches!(*lock(&self.backend), BackendSlot::Ready(_))
    }

    /// Returns the initialization error once; later calls yield `None`.
    pub fn take_init_error(&self) -> Option<String> {
        lock(&self.init_error).take()
    }

    /// Reads raw devices of the given kinds. Empty when the backend is not ready.
    pub fn read_hardware(&self, kinds: &[HardwareKind]) -> Vec<Result<HardwareReading, BackendError>> {
        match &mut *lock(&self.backend) {
            BackendSlot::Ready(backend) => backend.read(kinds),
            BackendSlot::Pending | BackendSlot::Failed => Vec::new(),
        }
    }

    /// Never fails: unreadable devices leave their fields at the default.
    pub fn get_snapshot(&self) -> HardwareSnapshot {
        let mut snap = HardwareSnapshot::default();

        let devices = self.read_hardware(&[HardwareKind::Cpu, HardwareKind::Gpu, HardwareKind::Memory]);
        for device in devices {
            match device {
                Ok(hw) => self.apply(&hw, &mut snap),
                Err(err) => debug!(error = %err, "hardware read failed, keeping defaults"),
            }
        }

        self.apply_fallback(&mut snap);
        snap
    }

    fn apply(&self, hw: &HardwareReading, snap: &mut HardwareSnapshot) {
        let m = &self.matchers;
        let sensors = hw.sensors.as_slice();
        match hw.kind {
            HardwareKind::Cpu => {
                snap.cpu.name = hw.name.clone();
                set(&mut snap.cpu.temperature_celsius, m.resolve(SnapshotField::CpuTemperature, sensors));
                set(&mut snap.cpu.usage_percent, m.resolve(SnapshotField::CpuUsage, sensors).map(clamp_percent));
                set(&mut snap.cpu.power_watts, m.resolve(SnapshotField::CpuPower, sensors));
                set(&mut snap.cpu.clock_mhz, m.resolve(SnapshotField::CpuClock, sensors));
            }
            HardwareKind::Gpu => {
                snap.gpu.name = hw.name.clone();
                set(&mut snap.gpu.temperature_celsius, m.resolve(SnapshotField::GpuTemperature, sensors));
                set(&mut snap.gpu.usage_percent, m.resolve(SnapshotField::GpuUsage, sensors).map(clamp_percent));
                set(&mut snap.gpu.power_watts, m.resolve(SnapshotField::GpuPower, sensors));
                set(&mut snap.gpu.clock_mhz, m.resolve(SnapshotField::GpuClock, sensors));
                set(&mut snap.gpu.memory_used_mb, m.resolve(SnapshotField::GpuMemoryUsed, sensors));
                set(&mut snap.gpu.memory_total_mb, m.resolve(SnapshotField::GpuMemoryTotal, sensors));
            }
            HardwareKind::Memory => {
                set(&mut snap.memory.usage_percent, m.resolve(SnapshotField::MemoryUsage, sensors).map(clamp_percent));
                set(&mut snap.memory.used_gb, m.resolve(SnapshotField::MemoryUsed, sensors));
                set(&mut snap.memory.available_gb, m.resolve(SnapshotField::MemoryAvailable, sensors));
            }
            HardwareKind::Storage | HardwareKind::Other => {}
        }
    }

    fn apply_fallback(&self, snap: &mut HardwareSnapshot) {
        if snap.cpu.usage_percent != 0.0 && snap.memory.usage_percent != 0.0 {
            return;
        }
        let mut guard = lock(&self.fallback);
        let Some(counters) = guard.as_mut() else {
            return;
        };

        if snap.cpu.usage_percent == 0.0 {
            if let Some(v) = counters.cpu_usage_percent() {
                snap.cpu.usage_percent = clamp_percent(v);
            }
        }

        if snap.memory.usage_percent == 0.0 {
            if let Some(totals) = counters.memory() {
                let total = totals.total_bytes as f64;
                let available = (totals.available_bytes as f64).min(total);
                snap.memory.available_gb = available / BYTES_PER_GB;
                snap.memory.used_gb = (total - available) / BYTES_PER_GB;
                snap.memory.usage_percent = clamp_percent((total - available) / total * 100.0);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set(target: &mut f64, value: Option<f64>) {
    if let Some(v) = value {
        *target = v;
    }
}

fn clamp_percent(v: f64) -> f64 {
    v.clamp(0.0, 100.0)
}

pub(crate) fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    if let Ok(v) = trimmed.replace(',', ".").parse::<f64>() {
        return Some(v);
    }

    let filtered: String = trimmed
        .chars()
        .filter(|c| {
            c.is_ascii_digit()
                || *c == '.'
                || *c == ','
                || *c == 'e'
                || *c == 'E'
                || *c == '-'
                || *c == '+'
        })
        .collect();
    if filtered.is_empty() {
        return None;
    }

    filtered.replace(',', ".").parse::<f64>().ok()
}
