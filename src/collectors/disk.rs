use crate::collectors::CollectError;
use crate::sensors::matchers::SnapshotField;
use crate::sensors::{HardwareKind, SensorReader};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiskHealth {
    Healthy,
    Warning,
    Critical,
}

impl DiskHealth {
    pub fn from_temperature(celsius: f64) -> Self {
        if celsius > 60.0 {
            Self::Critical
        } else if celsius > 50.0 {
            Self::Warning
        } else {
            Self::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskSnapshot {
    pub name: String,
    pub temperature_celsius: f64,
    pub read_mbps: f64,
    pub write_mbps: f64,
    pub health: DiskHealth,
}

/// Storage devices seen through the shared sensor backend.
pub struct DiskMonitor {
    reader: Arc<SensorReader>,
}

impl DiskMonitor {
    pub fn new(reader: Arc<SensorReader>) -> Self {
        Self { reader }
    }

    pub fn poll(&mut self) -> Result<Vec<DiskSnapshot>, CollectError> {
        if !self.reader.is_ready() {
            return Ok(Vec::new());
        }

        let matchers = self.reader.matchers();
        let mut out = Vec::new();
        for device in self.reader.read_hardware(&[HardwareKind::Storage]) {
            let hw = match device {
                Ok(hw) => hw,
                Err(err) => {
                    debug!(error = %err, "skipping storage device");
                    continue;
                }
            };
            let temperature = matchers
                .resolve(SnapshotField::DiskTemperature, &hw.sensors)
                .unwrap_or(0.0);
            let read = matchers.resolve(SnapshotField::DiskRead, &hw.sensors).unwrap_or(0.0);
            let write = matchers.resolve(SnapshotField::DiskWrite, &hw.sensors).unwrap_or(0.0);

            out.push(DiskSnapshot {
                name: hw.name,
                temperature_celsius: temperature,
                read_mbps: read / BYTES_PER_MB,
                write_mbps: write / BYTES_PER_MB,
                health: DiskHealth::from_temperature(temperature),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::matchers::SensorMatchers;
    use crate::sensors::testing::FakeBackend;
    use crate::sensors::{HardwareReading, SensorKind, SensorReading};

    fn storage(name: &str, temp: f64, read_bps: f64, write_bps: f64) -> HardwareReading {
        HardwareReading {
            kind: HardwareKind::Storage,
            name: name.to_string(),
            sensors: vec![
                SensorReading::new(SensorKind::Temperature, "Temperature", temp),
                SensorReading::new(SensorKind::Throughput, "Read Rate", read_bps),
                SensorReading::new(SensorKind::Throughput, "Write Rate", write_bps),
            ],
        }
    }

    #[test]
    fn health_thresholds() {
        assert_eq!(DiskHealth::from_temperature(61.0), DiskHealth::Critical);
        assert_eq!(DiskHealth::from_temperature(60.0), DiskHealth::Warning);
        assert_eq!(DiskHealth::from_temperature(55.0), DiskHealth::Warning);
        assert_eq!(DiskHealth::from_temperature(50.0), DiskHealth::Healthy);
        assert_eq!(DiskHealth::from_temperature(10.0), DiskHealth::Healthy);
    }

    #[test]
    fn throughput_is_reported_in_megabytes() {
        let mut backend = FakeBackend::new(vec![
            storage("Samsung SSD 980", 52.0, 2.0 * BYTES_PER_MB, 512.0 * 1024.0),
            storage("WDC WD40", 35.0, 0.0, 0.0),
        ]);
        backend.broken.push("WDC WD40".to_string());
        let reader = Arc::new(SensorReader::new(SensorMatchers::default(), None));
        reader.initialize(vec![Box::new(backend)]).unwrap();

        let disks = DiskMonitor::new(reader).poll().unwrap();
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].read_mbps, 2.0);
        assert_eq!(disks[0].write_mbps, 0.5);
        assert_eq!(disks[0].health, DiskHealth::Warning);
    }

    #[test]
    fn nothing_before_backend_is_ready() {
        let reader = Arc::new(SensorReader::new(SensorMatchers::default(), None));
        assert!(DiskMonitor::new(reader).poll().unwrap().is_empty());
    }
}
