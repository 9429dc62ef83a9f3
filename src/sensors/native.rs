//! Sensor backend built from what the OS exposes without extra drivers:
//! sysinfo components and counters, `nvidia-smi`, and `/proc/diskstats`.

use crate::rates::CounterMap;
use crate::sensors::{
    parse_f64_loose, BackendError, HardwareKind, HardwareReading, SensorBackend, SensorKind,
    SensorReading,
};
#[cfg(target_os = "linux")]
use std::fs;
use std::process::Command;
use std::time::Instant;
use sysinfo::{ComponentExt, CpuExt, System, SystemExt};
use tracing::debug;

const BACKEND: &str = "native";
const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const SECTOR_BYTES: u64 = 512;

const GPU_MARKERS: [&str; 5] = ["gpu", "nvidia", "amdgpu", "radeon", "nouveau"];
const CPU_MARKERS: [&str; 7] = ["cpu", "package", "tctl", "tdie", "coretemp", "k10temp", "zenpower"];

pub struct NativeBackend {
    system: System,
    has_nvidia_smi: bool,
    disk_counters: CounterMap<String, (u64, u64)>,
}

impl NativeBackend {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            has_nvidia_smi: false,
            disk_counters: CounterMap::new(),
        }
    }

    fn read_cpu(&mut self) -> Result<HardwareReading, BackendError> {
        self.system.refresh_cpu();
        let cpus = self.system.cpus();
        let Some(first) = cpus.first() else {
            return Err(BackendError::Read {
                hardware: "cpu".to_string(),
                reason: "no processors reported".to_string(),
            });
        };

        let mut sensors = vec![
            SensorReading::new(
                SensorKind::Load,
                "CPU Total",
                self.system.global_cpu_info().cpu_usage() as f64,
            ),
            SensorReading::new(SensorKind::Clock, "Core #1", first.frequency() as f64),
        ];
        for component in self.system.components() {
            let label = component.label();
            if is_cpu_label(label) {
                sensors.push(SensorReading::new(
                    SensorKind::Temperature,
                    label,
                    component.temperature() as f64,
                ));
            }
        }

        Ok(HardwareReading {
            kind: HardwareKind::Cpu,
            name: first.brand().trim().to_string(),
            sensors,
        })
    }

    fn read_memory(&mut self) -> Result<HardwareReading, BackendError> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Err(BackendError::Read {
                hardware: "memory".to_string(),
                reason: "total memory reported as zero".to_string(),
            });
        }
        let available = self.system.available_memory().min(total);
        let used = total - available;

        Ok(HardwareReading {
            kind: HardwareKind::Memory,
            name: "System Memory".to_string(),
            sensors: vec![
                SensorReading::new(SensorKind::Load, "Memory", used as f64 / total as f64 * 100.0),
                SensorReading::new(SensorKind::Data, "Memory Used", used as f64 / BYTES_PER_GB),
                SensorReading::new(
                    SensorKind::Data,
                    "Memory Available",
                    available as f64 / BYTES_PER_GB,
                ),
            ],
        })
    }

    fn read_gpus(&mut self) -> Vec<Result<HardwareReading, BackendError>> {
        if self.has_nvidia_smi {
            return collect_nvidia_smi();
        }

        let sensors: Vec<SensorReading> = self
            .system
            .components()
            .iter()
            .filter(|c| is_gpu_label(c.label()))
            .map(|c| SensorReading::new(SensorKind::Temperature, c.label(), c.temperature() as f64))
            .collect();
        if sensors.is_empty() {
            return Vec::new();
        }
        vec![Ok(HardwareReading {
            kind: HardwareKind::Gpu,
            name: "GPU".to_string(),
            sensors,
        })]
    }

    #[cfg(target_os = "linux")]
    fn read_storage(&mut self) -> Vec<Result<HardwareReading, BackendError>> {
        let content = match fs::read_to_string("/proc/diskstats") {
            Ok(c) => c,
            Err(err) => {
                return vec![Err(BackendError::Read {
                    hardware: "storage".to_string(),
                    reason: format!("failed to read /proc/diskstats: {err}"),
                })]
            }
        };

        let now = Instant::now();
        self.disk_counters.begin_tick();
        let mut nvme_temps = self.storage_temps("nvme").into_iter();
        let mut sata_temps = self.storage_temps("drivetemp").into_iter();

        let mut out = Vec::new();
        for (device, sectors_read, sectors_written) in parse_diskstats(&content) {
            if !is_whole_disk(&device) {
                continue;
            }
            let mut sensors = Vec::new();
            let temp = if device.starts_with("nvme") {
                nvme_temps.next()
            } else {
                sata_temps.next()
            };
            if let Some(t) = temp {
                sensors.push(SensorReading::new(SensorKind::Temperature, "Temperature", t));
            }

            let (read_bps, write_bps) = match self.disk_counters.replace(
                device.clone(),
                (sectors_read, sectors_written),
                now,
            ) {
                Some(((prev_read, prev_written), elapsed)) if elapsed.as_secs_f64() > 0.0 => {
                    let secs = elapsed.as_secs_f64();
                    (
                        sector_rate(prev_read, sectors_read, secs),
                        sector_rate(prev_written, sectors_written, secs),
                    )
                }
                _ => (0.0, 0.0),
            };
            sensors.push(SensorReading::new(SensorKind::Throughput, "Read Rate", read_bps));
            sensors.push(SensorReading::new(SensorKind::Throughput, "Write Rate", write_bps));

            out.push(Ok(HardwareReading {
                kind: HardwareKind::Storage,
                name: device,
                sensors,
            }));
        }
        self.disk_counters.sweep(60);
        out
    }

    #[cfg(not(target_os = "linux"))]
    fn read_storage(&mut self) -> Vec<Result<HardwareReading, BackendError>> {
        Vec::new()
    }

    #[cfg(target_os = "linux")]
    fn storage_temps(&self, chip: &str) -> Vec<f64> {
        self.system
            .components()
            .iter()
            .filter(|c| {
                let label = c.label().to_lowercase();
                label.starts_with(chip) && (chip != "nvme" || label.contains("composite"))
            })
            .map(|c| c.temperature() as f64)
            .collect()
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorBackend for NativeBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn open(&mut self) -> Result<(), BackendError> {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.system.refresh_components_list();
        if self.system.cpus().is_empty() {
            return Err(BackendError::Unavailable {
                backend: BACKEND,
                reason: "sysinfo reported no processors".to_string(),
            });
        }
        self.has_nvidia_smi = run_nvidia_smi(&["-L"]).is_some_and(|o| o.status.success());
        debug!(
            components = self.system.components().len(),
            nvidia_smi = self.has_nvidia_smi,
            "native sensor backend opened"
        );
        Ok(())
    }

    fn read(&mut self, kinds: &[HardwareKind]) -> Vec<Result<HardwareReading, BackendError>> {
        if kinds
            .iter()
            .any(|k| matches!(k, HardwareKind::Cpu | HardwareKind::Gpu | HardwareKind::Storage))
        {
            self.system.refresh_components();
        }

        let mut out = Vec::new();
        for kind in kinds {
            match kind {
                HardwareKind::Cpu => out.push(self.read_cpu()),
                HardwareKind::Memory => out.push(self.read_memory()),
                HardwareKind::Gpu => out.extend(self.read_gpus()),
                HardwareKind::Storage => out.extend(self.read_storage()),
                HardwareKind::Other => {}
            }
        }
        out
    }
}

fn is_gpu_label(label: &str) -> bool {
    let s = label.to_lowercase();
    GPU_MARKERS.iter().any(|m| s.contains(m))
}

fn is_cpu_label(label: &str) -> bool {
    let s = label.to_lowercase();
    !is_gpu_label(&s) && CPU_MARKERS.iter().any(|m| s.contains(m))
}

/// Returns `(device, sectors_read, sectors_written)` per line; malformed lines are skipped.
fn parse_diskstats(content: &str) -> Vec<(String, u64, u64)> {
    content
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 14 {
                return None;
            }
            let device = parts[2];
            if device.starts_with("loop") || device.starts_with("ram") {
                return None;
            }
            Some((
                device.to_string(),
                parts[5].parse().ok()?,
                parts[9].parse().ok()?,
            ))
        })
        .collect()
}

/// Bytes per second between two sector counter samples. The kernel's 64-bit
/// counters never wrap in practice, so a decrease means the device was reset
/// or re-attached and the interval reports zero.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn sector_rate(previous: u64, current: u64, secs: f64) -> f64 {
    if current < previous || secs <= 0.0 {
        return 0.0;
    }
    (current - previous) as f64 * SECTOR_BYTES as f64 / secs
}

#[cfg(target_os = "linux")]
fn is_whole_disk(device: &str) -> bool {
    std::path::Path::new("/sys/block").join(device).exists()
}

fn collect_nvidia_smi() -> Vec<Result<HardwareReading, BackendError>> {
    let output = run_nvidia_smi(&[
        "--query-gpu=index,name,utilization.gpu,temperature.gpu,power.draw,clocks.gr,memory.used,memory.total",
        "--format=csv,noheader,nounits",
    ]);

    let Some(output) = output else {
        return vec![Err(BackendError::Read {
            hardware: "nvidia-smi".to_string(),
            reason: "failed to spawn".to_string(),
        })];
    };
    if !output.status.success() {
        return vec![Err(BackendError::Read {
            hardware: "nvidia-smi".to_string(),
            reason: format!("exited with {}", output.status),
        })];
    }

    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

fn parse_nvidia_smi(text: &str) -> Vec<Result<HardwareReading, BackendError>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 8 {
                return Err(BackendError::Read {
                    hardware: format!("gpu {}", parts.first().copied().unwrap_or("?")),
                    reason: format!("expected 8 columns, got {}", parts.len()),
                });
            }

            let columns = [
                (SensorKind::Load, "GPU Core", parts[2]),
                (SensorKind::Temperature, "GPU Core", parts[3]),
                (SensorKind::Power, "GPU Board Power", parts[4]),
                (SensorKind::Clock, "GPU Core", parts[5]),
                (SensorKind::SmallData, "GPU Memory Used", parts[6]),
                (SensorKind::SmallData, "GPU Memory Total", parts[7]),
            ];
            let sensors = columns
                .into_iter()
                .map(|(kind, label, raw)| SensorReading {
                    kind,
                    label: label.to_string(),
                    value: parse_f64_loose(raw),
                })
                .collect();

            Ok(HardwareReading {
                kind: HardwareKind::Gpu,
                name: parts[1].to_string(),
                sensors,
            })
        })
        .collect()
}

fn run_nvidia_smi(args: &[&str]) -> Option<std::process::Output> {
    if let Ok(output) = Command::new("nvidia-smi").args(args).output() {
        return Some(output);
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(output) = Command::new(r"C:\Windows\System32\nvidia-smi.exe")
            .args(args)
            .output()
        {
            return Some(output);
        }
    }

    None
}
