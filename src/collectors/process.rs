//! Top-N process table with CPU share derived from CPU-time deltas.

use crate::collectors::CollectError;
use crate::rates::ProcessCpuCounters;
#[cfg(target_os = "linux")]
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
#[cfg(not(target_os = "linux"))]
use std::collections::HashMap;
use std::time::Instant;
use sysinfo::{PidExt, ProcessExt, System, SystemExt};
use tracing::debug;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcessSortMode {
    #[default]
    #[serde(rename = "cpu")]
    ByCpu,
    #[serde(rename = "memory")]
    ByMemory,
}

/// Descending by the selected key; ties keep their input order.
pub fn sort_and_take(mut all: Vec<ProcessInfo>, top_n: usize, sort: ProcessSortMode) -> Vec<ProcessInfo> {
    if top_n == 0 || all.is_empty() {
        return Vec::new();
    }
    match sort {
        ProcessSortMode::ByCpu => all.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent)),
        ProcessSortMode::ByMemory => all.sort_by(|a, b| b.memory_mb.total_cmp(&a.memory_mb)),
    }
    all.truncate(top_n);
    all
}

/// One process as read from the OS, before any rate is derived.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    /// Total user + kernel CPU time consumed so far.
    pub cpu_time_ms: f64,
    pub memory_bytes: u64,
}

pub trait ProcessSource: Send + Sync {
    fn core_count(&self) -> usize;

    fn read(&mut self) -> Result<Vec<Result<ProcessSample, CollectError>>, CollectError>;
}

pub struct SysinfoProcessSource {
    system: System,
    #[cfg(not(target_os = "linux"))]
    estimated: HashMap<u32, f64>,
    #[cfg(not(target_os = "linux"))]
    last_refresh: Option<Instant>,
}

impl SysinfoProcessSource {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system,
            #[cfg(not(target_os = "linux"))]
            estimated: HashMap::new(),
            #[cfg(not(target_os = "linux"))]
            last_refresh: None,
        }
    }

    #[cfg(target_os = "linux")]
    fn cpu_time_ms(&mut self, pid: u32, _usage_percent: f32) -> Result<f64, CollectError> {
        let content = std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .map_err(|err| CollectError::from_io(format!("pid {pid}"), err))?;
        parse_stat_cpu_time_ms(&content, *CLK_TCK).ok_or_else(|| CollectError::Entity {
            entity: format!("pid {pid}"),
            reason: "malformed /proc stat line".to_string(),
        })
    }

    /// Without a per-process CPU time counter the time is integrated from
    /// sysinfo's usage percentage between refreshes.
    #[cfg(not(target_os = "linux"))]
    fn cpu_time_ms(&mut self, pid: u32, usage_percent: f32) -> Result<f64, CollectError> {
        let elapsed_ms = self
            .last_refresh
            .map(|t| t.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        let total = self.estimated.entry(pid).or_insert(0.0);
        *total += usage_percent.max(0.0) as f64 / 100.0 * elapsed_ms;
        Ok(*total)
    }
}

impl Default for SysinfoProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for SysinfoProcessSource {
    fn core_count(&self) -> usize {
        self.system.cpus().len().max(1)
    }

    fn read(&mut self) -> Result<Vec<Result<ProcessSample, CollectError>>, CollectError> {
        self.system.refresh_processes();

        let listed: Vec<(u32, String, u64, f32)> = self
            .system
            .processes()
            .iter()
            .map(|(pid, p)| (pid.as_u32(), p.name().to_string(), p.memory(), p.cpu_usage()))
            .collect();
        if listed.is_empty() {
            return Err(CollectError::Enumerate {
                what: "processes",
                reason: "process table is empty".to_string(),
            });
        }

        let out = listed
            .into_iter()
            .map(|(pid, name, memory_bytes, usage)| {
                Ok(ProcessSample {
                    pid,
                    name,
                    cpu_time_ms: self.cpu_time_ms(pid, usage)?,
                    memory_bytes,
                })
            })
            .collect();

        #[cfg(not(target_os = "linux"))]
        {
            let alive = &self.system;
            self.estimated
                .retain(|pid, _| alive.process(sysinfo::Pid::from_u32(*pid)).is_some());
            self.last_refresh = Some(Instant::now());
        }
        Ok(out)
    }
}

/// Kernel clock ticks per second, the unit of utime and stime.
#[cfg(target_os = "linux")]
static CLK_TCK: Lazy<f64> = Lazy::new(|| {
    // SAFETY: sysconf has no preconditions; -1 and 0 are rejected below
    let tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if tck > 0 {
        tck as f64
    } else {
        100.0
    }
});

/// utime + stime in milliseconds from a `/proc/<pid>/stat` line.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat_cpu_time_ms(content: &str, ticks_per_sec: f64) -> Option<f64> {
    if ticks_per_sec <= 0.0 {
        return None;
    }
    // comm may contain spaces and parentheses
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: f64 = fields.get(11)?.parse().ok()?;
    let stime: f64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) * 1000.0 / ticks_per_sec)
}

pub struct ProcessMonitor {
    source: Box<dyn ProcessSource>,
    counters: ProcessCpuCounters,
    stale_after_ticks: u64,
}

impl ProcessMonitor {
    pub fn new(source: Box<dyn ProcessSource>, stale_after_ticks: u64) -> Self {
        Self {
            source,
            counters: ProcessCpuCounters::default(),
            stale_after_ticks,
        }
    }

    /// Samples every process so baselines stay current, then keeps `top_n`.
    pub fn top(
        &mut self,
        top_n: usize,
        sort: ProcessSortMode,
        now: Instant,
    ) -> Result<Vec<ProcessInfo>, CollectError> {
        let samples = self.source.read()?;
        let cores = self.source.core_count();
        self.counters.begin_tick();

        let mut all = Vec::with_capacity(samples.len());
        for sample in samples {
            match sample {
                Ok(s) => {
                    let cpu_percent = self.counters.sample(s.pid, s.cpu_time_ms, cores, now);
                    all.push(ProcessInfo {
                        pid: s.pid,
                        name: s.name,
                        cpu_percent,
                        memory_mb: s.memory_bytes as f64 / BYTES_PER_MB,
                    });
                }
                Err(err) if err.is_expected() => {}
                Err(err) => debug!(error = %err, "skipping process"),
            }
        }

        self.counters.sweep(self.stale_after_ticks);
        Ok(sort_and_take(all, top_n, sort))
    }

    pub fn tracked_pids(&self) -> usize {
        self.counters.tracked()
    }
}
