//! Per-adapter throughput derived from cumulative OS byte counters.

use crate::collectors::CollectError;
use crate::rates::{CounterWidth, NetworkCounters};
use serde::Serialize;
use std::time::Instant;
use sysinfo::{NetworkExt, NetworksExt, System, SystemExt};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkSnapshot {
    pub adapter: String,
    pub upload_kbps: f64,
    pub download_kbps: f64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
}

/// Raw counters of one adapter at read time.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterCounters {
    pub name: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

pub trait NetworkSource: Send + Sync {
    /// Outer error: the adapter list itself is unavailable. Inner errors are
    /// per adapter and do not hide the rest.
    fn read(&mut self) -> Result<Vec<Result<AdapterCounters, CollectError>>, CollectError>;
}

pub struct SysinfoNetworkSource {
    system: System,
}

impl SysinfoNetworkSource {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_networks_list();
        Self { system }
    }
}

impl Default for SysinfoNetworkSource {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkSource for SysinfoNetworkSource {
    fn read(&mut self) -> Result<Vec<Result<AdapterCounters, CollectError>>, CollectError> {
        self.system.refresh_networks_list();
        self.system.refresh_networks();

        Ok(self
            .system
            .networks()
            .iter()
            .filter(|(name, _)| !is_loopback(name) && is_up(name))
            .map(|(name, data)| {
                Ok(AdapterCounters {
                    name: name.to_string(),
                    bytes_sent: data.total_transmitted(),
                    bytes_received: data.total_received(),
                })
            })
            .collect())
    }
}

fn is_loopback(name: &str) -> bool {
    let n = name.to_ascii_lowercase();
    n == "lo" || n.starts_with("loopback") || n.starts_with("lo0")
}

#[cfg(target_os = "linux")]
fn is_up(name: &str) -> bool {
    match std::fs::read_to_string(format!("/sys/class/net/{name}/operstate")) {
        Ok(state) => state.trim() != "down",
        Err(_) => true,
    }
}

#[cfg(not(target_os = "linux"))]
fn is_up(_name: &str) -> bool {
    true
}

pub struct NetworkMonitor {
    source: Box<dyn NetworkSource>,
    counters: NetworkCounters,
    stale_after_ticks: u64,
}

impl NetworkMonitor {
    pub fn new(source: Box<dyn NetworkSource>, width: CounterWidth, stale_after_ticks: u64) -> Self {
        Self {
            source,
            counters: NetworkCounters::new(width),
            stale_after_ticks,
        }
    }

    pub fn poll(&mut self, now: Instant) -> Result<Vec<NetworkSnapshot>, CollectError> {
        let readings = self.source.read()?;
        self.counters.begin_tick();

        let mut out = Vec::with_capacity(readings.len());
        for reading in readings {
            let adapter = match reading {
                Ok(a) => a,
                Err(err) => {
                    debug!(error = %err, "skipping adapter");
                    continue;
                }
            };
            let rates = self
                .counters
                .sample(&adapter.name, adapter.bytes_sent, adapter.bytes_received, now);
            out.push(NetworkSnapshot {
                adapter: adapter.name,
                upload_kbps: rates.upload_kbps,
                download_kbps: rates.download_kbps,
                total_bytes_sent: rates.total_bytes_sent,
                total_bytes_received: rates.total_bytes_received,
            });
        }

        let evicted = self.counters.sweep(self.stale_after_ticks);
        if evicted > 0 {
            debug!(evicted, "dropped counters of vanished adapters");
        }
        Ok(out)
    }

    pub fn tracked_adapters(&self) -> usize {
        self.counters.tracked()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Replays one scripted read per poll; `None` fails the whole enumeration.
    pub struct ScriptedNetwork {
        pub script: VecDeque<Option<Vec<Result<AdapterCounters, CollectError>>>>,
    }

    impl NetworkSource for ScriptedNetwork {
        fn read(&mut self) -> Result<Vec<Result<AdapterCounters, CollectError>>, CollectError> {
            match self.script.pop_front() {
                Some(Some(readings)) => Ok(readings),
                _ => Err(CollectError::Enumerate {
                    what: "adapters",
                    reason: "script exhausted".to_string(),
                }),
            }
        }
    }

    pub fn adapter(name: &str, sent: u64, received: u64) -> Result<AdapterCounters, CollectError> {
        Ok(AdapterCounters {
            name: name.to_string(),
            bytes_sent: sent,
            bytes_received: received,
        })
    }
}
