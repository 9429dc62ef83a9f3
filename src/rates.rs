//! Delta/rate helpers over monotonic OS counters.
//!
//! Every map here is keyed by an entity (adapter name, pid, block device) and
//! remembers the previous raw sample plus when it was taken. Keys that are not
//! sampled for `stale_after_ticks` consecutive ticks are evicted by `sweep`, so
//! adapter and pid churn does not grow the maps without bound.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Width of the raw OS counter; decides how a decreasing value is unwrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CounterWidth {
    #[default]
    Bits32,
    Bits64,
}

impl CounterWidth {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            32 => Some(Self::Bits32),
            64 => Some(Self::Bits64),
            _ => None,
        }
    }

    pub const fn max_value(self) -> u64 {
        match self {
            Self::Bits32 => u32::MAX as u64,
            Self::Bits64 => u64::MAX,
        }
    }
}

/// Difference between two raw counter readings. A smaller `current` is read as
/// a single wraparound at `width`.
pub fn counter_delta(previous: u64, current: u64, width: CounterWidth) -> u64 {
    if current >= previous {
        return current - previous;
    }
    width
        .max_value()
        .saturating_sub(previous)
        .saturating_add(current)
}

/// KB/s between two 32-bit byte counters.
pub fn calculate_speed(previous: u64, current: u64, elapsed_secs: f64) -> f64 {
    speed_kbps(counter_delta(previous, current, CounterWidth::Bits32), elapsed_secs)
}

pub fn speed_kbps(delta_bytes: u64, elapsed_secs: f64) -> f64 {
    if !(elapsed_secs > 0.0) {
        return 0.0;
    }
    delta_bytes as f64 / elapsed_secs / 1024.0
}

/// Share of the whole machine used by one process, in percent of all cores.
pub fn process_cpu_percent(cpu_delta_ms: f64, elapsed_ms: f64, core_count: usize) -> f64 {
    if !(elapsed_ms > 0.0) || core_count == 0 {
        return 0.0;
    }
    (cpu_delta_ms / elapsed_ms / core_count as f64 * 100.0).max(0.0)
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    at: Instant,
    touched_tick: u64,
}

/// Previous-sample store shared by every rate computation.
#[derive(Debug, Clone)]
pub struct CounterMap<K, V> {
    entries: HashMap<K, Entry<V>>,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V> Default for CounterMap<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            tick: 0,
        }
    }
}

impl<K: Eq + Hash + Clone, V> CounterMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_tick(&mut self) {
        self.tick = self.tick.saturating_add(1);
    }

    /// Stores `value` for `key` and hands back the sample it replaced together
    /// with the time elapsed since that sample. `None` for a key seen first.
    pub fn replace(&mut self, key: K, value: V, now: Instant) -> Option<(V, Duration)> {
        let fresh = Entry {
            value,
            at: now,
            touched_tick: self.tick,
        };
        self.entries
            .insert(key, fresh)
            .map(|old| (old.value, now.saturating_duration_since(old.at)))
    }

    /// Drops keys untouched for at least `stale_after_ticks` ticks and returns them.
    pub fn sweep(&mut self, stale_after_ticks: u64) -> Vec<K> {
        if stale_after_ticks == 0 {
            return Vec::new();
        }
        let tick = self.tick;
        let stale: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| tick.saturating_sub(e.touched_tick) >= stale_after_ticks)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            self.entries.remove(key);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AdapterRates {
    pub upload_kbps: f64,
    pub download_kbps: f64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
}

/// Per-adapter byte counters. Totals are accumulated from deltas, so they keep
/// growing across counter wraparound instead of mirroring the OS value.
#[derive(Debug, Clone, Default)]
pub struct NetworkCounters {
    previous: CounterMap<String, (u64, u64)>,
    cumulative: HashMap<String, (u64, u64)>,
    width: CounterWidth,
}

impl NetworkCounters {
    pub fn new(width: CounterWidth) -> Self {
        Self {
            width,
            ..Self::default()
        }
    }

    pub fn begin_tick(&mut self) {
        self.previous.begin_tick();
    }

    pub fn sample(&mut self, adapter: &str, sent: u64, received: u64, now: Instant) -> AdapterRates {
        let Some(((prev_sent, prev_received), elapsed)) =
            self.previous.replace(adapter.to_string(), (sent, received), now)
        else {
            self.cumulative.entry(adapter.to_string()).or_insert((0, 0));
            return AdapterRates::default();
        };

        let delta_sent = counter_delta(prev_sent, sent, self.width);
        let delta_received = counter_delta(prev_received, received, self.width);
        let totals = self.cumulative.entry(adapter.to_string()).or_insert((0, 0));
        totals.0 = totals.0.saturating_add(delta_sent);
        totals.1 = totals.1.saturating_add(delta_received);

        let secs = elapsed.as_secs_f64();
        AdapterRates {
            upload_kbps: speed_kbps(delta_sent, secs),
            download_kbps: speed_kbps(delta_received, secs),
            total_bytes_sent: totals.0,
            total_bytes_received: totals.1,
        }
    }

    pub fn sweep(&mut self, stale_after_ticks: u64) -> usize {
        let gone = self.previous.sweep(stale_after_ticks);
        for adapter in &gone {
            self.cumulative.remove(adapter);
        }
        gone.len()
    }

    pub fn tracked(&self) -> usize {
        self.previous.len()
    }
}

/// Per-pid CPU time in milliseconds.
#[derive(Debug, Clone, Default)]
pub struct ProcessCpuCounters {
    previous: CounterMap<u32, f64>,
}

impl ProcessCpuCounters {
    pub fn begin_tick(&mut self) {
        self.previous.begin_tick();
    }

    pub fn sample(&mut self, pid: u32, cpu_time_ms: f64, core_count: usize, now: Instant) -> f64 {
        match self.previous.replace(pid, cpu_time_ms, now) {
            Some((prev_ms, elapsed)) => process_cpu_percent(
                cpu_time_ms - prev_ms,
                elapsed.as_secs_f64() * 1000.0,
                core_count,
            ),
            None => 0.0,
        }
    }

    pub fn sweep(&mut self, stale_after_ticks: u64) -> usize {
        self.previous.sweep(stale_after_ticks).len()
    }

    pub fn tracked(&self) -> usize {
        self.previous.len()
    }
}
