use crate::alerts::AlertResult;
use crate::collectors::disk::DiskSnapshot;
use crate::collectors::network::NetworkSnapshot;
use crate::collectors::process::ProcessInfo;
use crate::poller::{Observer, PollerStatus, Stage, StageError};
use crate::sensors::HardwareSnapshot;
use async_trait::async_trait;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub hw_cpu_temperature_celsius: Gauge,
    pub hw_cpu_usage_percent: Gauge,
    pub hw_cpu_power_watts: Gauge,
    pub hw_cpu_clock_mhz: Gauge,
    pub hw_gpu_temperature_celsius: Gauge,
    pub hw_gpu_usage_percent: Gauge,
    pub hw_gpu_power_watts: Gauge,
    pub hw_gpu_memory_used_megabytes: Gauge,
    pub hw_memory_usage_percent: Gauge,
    pub hw_memory_used_gigabytes: Gauge,
    pub hw_memory_total_gigabytes: Gauge,
    pub hw_total_power_watts: Gauge,
    pub hw_disk_temperature_celsius: GaugeVec,
    pub hw_disk_read_mbps: GaugeVec,
    pub hw_disk_write_mbps: GaugeVec,
    pub hw_net_upload_kbps: GaugeVec,
    pub hw_net_download_kbps: GaugeVec,
    pub hw_net_adapter_count: Gauge,
    pub hw_top_process_count: Gauge,
    pub hw_alerts_active: GaugeVec,
    pub hw_alerts_triggered_total: CounterVec,
    pub hw_stage_errors_total: CounterVec,
    pub hw_poller_ready: Gauge,
    pub hw_ticks_total: Counter,
    pub hw_uptime_seconds: Gauge,
    pub hw_scrape_count_total: Counter,
    pub hw_last_tick_timestamp_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let hw_cpu_temperature_celsius = Gauge::with_opts(opts!(
            "hw_cpu_temperature_celsius",
            "CPU package temperature in Celsius"
        ))?;
        let hw_cpu_usage_percent =
            Gauge::with_opts(opts!("hw_cpu_usage_percent", "Total CPU load in percent"))?;
        let hw_cpu_power_watts =
            Gauge::with_opts(opts!("hw_cpu_power_watts", "CPU package power in watts"))?;
        let hw_cpu_clock_mhz =
            Gauge::with_opts(opts!("hw_cpu_clock_mhz", "First core clock in MHz"))?;
        let hw_gpu_temperature_celsius = Gauge::with_opts(opts!(
            "hw_gpu_temperature_celsius",
            "GPU core temperature in Celsius"
        ))?;
        let hw_gpu_usage_percent =
            Gauge::with_opts(opts!("hw_gpu_usage_percent", "GPU core load in percent"))?;
        let hw_gpu_power_watts =
            Gauge::with_opts(opts!("hw_gpu_power_watts", "GPU power in watts"))?;
        let hw_gpu_memory_used_megabytes = Gauge::with_opts(opts!(
            "hw_gpu_memory_used_megabytes",
            "Dedicated GPU memory in use, MB"
        ))?;
        let hw_memory_usage_percent =
            Gauge::with_opts(opts!("hw_memory_usage_percent", "RAM load in percent"))?;
        let hw_memory_used_gigabytes =
            Gauge::with_opts(opts!("hw_memory_used_gigabytes", "Used RAM in GB"))?;
        let hw_memory_total_gigabytes =
            Gauge::with_opts(opts!("hw_memory_total_gigabytes", "Used plus available RAM in GB"))?;
        let hw_total_power_watts = Gauge::with_opts(opts!(
            "hw_total_power_watts",
            "CPU plus GPU power in watts"
        ))?;
        let hw_disk_temperature_celsius = GaugeVec::new(
            opts!("hw_disk_temperature_celsius", "Disk temperature by device"),
            &["disk"],
        )?;
        let hw_disk_read_mbps = GaugeVec::new(
            opts!("hw_disk_read_mbps", "Disk read rate in MB/s by device"),
            &["disk"],
        )?;
        let hw_disk_write_mbps = GaugeVec::new(
            opts!("hw_disk_write_mbps", "Disk write rate in MB/s by device"),
            &["disk"],
        )?;
        let hw_net_upload_kbps = GaugeVec::new(
            opts!("hw_net_upload_kbps", "Upload rate in KB/s by adapter"),
            &["adapter"],
        )?;
        let hw_net_download_kbps = GaugeVec::new(
            opts!("hw_net_download_kbps", "Download rate in KB/s by adapter"),
            &["adapter"],
        )?;
        let hw_net_adapter_count =
            Gauge::with_opts(opts!("hw_net_adapter_count", "Active network adapters"))?;
        let hw_top_process_count = Gauge::with_opts(opts!(
            "hw_top_process_count",
            "Rows in the last top-process table"
        ))?;
        let hw_alerts_active = GaugeVec::new(
            opts!(
                "hw_alerts_active",
                "1 while a rule for the metric is exceeded"
            ),
            &["metric"],
        )?;
        let hw_alerts_triggered_total = CounterVec::new(
            opts!("hw_alerts_triggered_total", "Alert notifications raised"),
            &["metric"],
        )?;
        let hw_stage_errors_total = CounterVec::new(
            opts!("hw_stage_errors_total", "Failed poll stages"),
            &["stage"],
        )?;
        let hw_poller_ready = Gauge::with_opts(opts!(
            "hw_poller_ready",
            "1 when the sensor backend is initialized and polling"
        ))?;
        let hw_ticks_total = Counter::with_opts(opts!("hw_ticks_total", "Completed poll ticks"))?;
        let hw_uptime_seconds =
            Gauge::with_opts(opts!("hw_uptime_seconds", "Seconds since start"))?;
        let hw_scrape_count_total =
            Counter::with_opts(opts!("hw_scrape_count_total", "Number of /metrics scrapes"))?;
        let hw_last_tick_timestamp_seconds = Gauge::with_opts(opts!(
            "hw_last_tick_timestamp_seconds",
            "Unix time of the last completed tick"
        ))?;

        register(&registry, &hw_cpu_temperature_celsius)?;
        register(&registry, &hw_cpu_usage_percent)?;
        register(&registry, &hw_cpu_power_watts)?;
        register(&registry, &hw_cpu_clock_mhz)?;
        register(&registry, &hw_gpu_temperature_celsius)?;
        register(&registry, &hw_gpu_usage_percent)?;
        register(&registry, &hw_gpu_power_watts)?;
        register(&registry, &hw_gpu_memory_used_megabytes)?;
        register(&registry, &hw_memory_usage_percent)?;
        register(&registry, &hw_memory_used_gigabytes)?;
        register(&registry, &hw_memory_total_gigabytes)?;
        register(&registry, &hw_total_power_watts)?;
        register(&registry, &hw_disk_temperature_celsius)?;
        register(&registry, &hw_disk_read_mbps)?;
        register(&registry, &hw_disk_write_mbps)?;
        register(&registry, &hw_net_upload_kbps)?;
        register(&registry, &hw_net_download_kbps)?;
        register(&registry, &hw_net_adapter_count)?;
        register(&registry, &hw_top_process_count)?;
        register(&registry, &hw_alerts_active)?;
        register(&registry, &hw_alerts_triggered_total)?;
        register(&registry, &hw_stage_errors_total)?;
        register(&registry, &hw_poller_ready)?;
        register(&registry, &hw_ticks_total)?;
        register(&registry, &hw_uptime_seconds)?;
        register(&registry, &hw_scrape_count_total)?;
        register(&registry, &hw_last_tick_timestamp_seconds)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            hw_cpu_temperature_celsius,
            hw_cpu_usage_percent,
            hw_cpu_power_watts,
            hw_cpu_clock_mhz,
            hw_gpu_temperature_celsius,
            hw_gpu_usage_percent,
            hw_gpu_power_watts,
            hw_gpu_memory_used_megabytes,
            hw_memory_usage_percent,
            hw_memory_used_gigabytes,
            hw_memory_total_gigabytes,
            hw_total_power_watts,
            hw_disk_temperature_celsius,
            hw_disk_read_mbps,
            hw_disk_write_mbps,
            hw_net_upload_kbps,
            hw_net_download_kbps,
            hw_net_adapter_count,
            hw_top_process_count,
            hw_alerts_active,
            hw_alerts_triggered_total,
            hw_stage_errors_total,
            hw_poller_ready,
            hw_ticks_total,
            hw_uptime_seconds,
            hw_scrape_count_total,
            hw_last_tick_timestamp_seconds,
        }))
    }

    pub fn update_from_snapshot(&self, snap: &HardwareSnapshot) {
        self.hw_cpu_temperature_celsius.set(snap.cpu.temperature_celsius);
        self.hw_cpu_usage_percent.set(snap.cpu.usage_percent);
        self.hw_cpu_power_watts.set(snap.cpu.power_watts);
        self.hw_cpu_clock_mhz.set(snap.cpu.clock_mhz);
        self.hw_gpu_temperature_celsius.set(snap.gpu.temperature_celsius);
        self.hw_gpu_usage_percent.set(snap.gpu.usage_percent);
        self.hw_gpu_power_watts.set(snap.gpu.power_watts);
        self.hw_gpu_memory_used_megabytes.set(snap.gpu.memory_used_mb);
        self.hw_memory_usage_percent.set(snap.memory.usage_percent);
        self.hw_memory_used_gigabytes.set(snap.memory.used_gb);
        self.hw_memory_total_gigabytes.set(snap.memory.total_gb());
        self.hw_total_power_watts.set(snap.total_power_watts());
    }

    pub fn update_from_alerts(&self, results: &[AlertResult]) {
        self.hw_alerts_active.reset();
        for result in results {
            let label = metric_label(result);
            let active = self.hw_alerts_active.with_label_values(&[label]);
            if result.is_exceeded() {
                active.set(1.0);
            }
            if result.is_triggered {
                self.hw_alerts_triggered_total.with_label_values(&[label]).inc();
            }
        }
    }

    /// Vec gauges are reset first so devices that went away stop reporting.
    pub fn update_from_disks(&self, disks: &[DiskSnapshot]) {
        self.hw_disk_temperature_celsius.reset();
        self.hw_disk_read_mbps.reset();
        self.hw_disk_write_mbps.reset();
        for disk in disks {
            let label = [disk.name.as_str()];
            self.hw_disk_temperature_celsius
                .with_label_values(&label)
                .set(disk.temperature_celsius);
            self.hw_disk_read_mbps.with_label_values(&label).set(disk.read_mbps);
            self.hw_disk_write_mbps.with_label_values(&label).set(disk.write_mbps);
        }
    }

    pub fn update_from_network(&self, adapters: &[NetworkSnapshot]) {
        self.hw_net_upload_kbps.reset();
        self.hw_net_download_kbps.reset();
        for adapter in adapters {
            let label = [adapter.adapter.as_str()];
            self.hw_net_upload_kbps
                .with_label_values(&label)
                .set(adapter.upload_kbps);
            self.hw_net_download_kbps
                .with_label_values(&label)
                .set(adapter.download_kbps);
        }
        self.hw_net_adapter_count.set(adapters.len() as f64);
    }

    pub fn update_uptime(&self) {
        let uptime = now_unix().saturating_sub(self.started_at_unix) as f64;
        self.hw_uptime_seconds.set(uptime);
    }

    pub fn inc_scrape_count(&self) {
        self.hw_scrape_count_total.inc();
    }

    pub fn inc_stage_error(&self, stage: Stage) {
        self.hw_stage_errors_total
            .with_label_values(&[stage.as_str()])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        self.update_uptime();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn metric_label(result: &AlertResult) -> &'static str {
    use crate::alerts::MetricType;
    match result.rule.metric {
        MetricType::CpuTemp => "cpu_temp",
        MetricType::GpuTemp => "gpu_temp",
        MetricType::CpuUsage => "cpu_usage",
        MetricType::GpuUsage => "gpu_usage",
    }
}

#[async_trait]
impl Observer for Metrics {
    async fn on_status(&self, status: &PollerStatus) {
        let ready = matches!(status, PollerStatus::Ready);
        self.hw_poller_ready.set(if ready { 1.0 } else { 0.0 });
    }

    async fn on_snapshot(&self, snapshot: &HardwareSnapshot) {
        self.update_from_snapshot(snapshot);
    }

    async fn on_alerts(&self, results: &[AlertResult]) {
        self.update_from_alerts(results);
    }

    async fn on_disks(&self, disks: &[DiskSnapshot]) {
        self.update_from_disks(disks);
    }

    async fn on_network(&self, adapters: &[NetworkSnapshot]) {
        self.update_from_network(adapters);
    }

    async fn on_processes(&self, processes: &[ProcessInfo]) {
        self.hw_top_process_count.set(processes.len() as f64);
    }

    async fn on_stage_error(&self, stage: Stage, _error: &StageError) {
        self.inc_stage_error(stage);
    }

    async fn on_tick_complete(&self, _tick: u64) {
        self.hw_ticks_total.inc();
        self.hw_last_tick_timestamp_seconds.set(now_unix() as f64);
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
