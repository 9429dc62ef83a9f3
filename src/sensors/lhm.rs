//! LibreHardwareMonitor backend, read through its WMI/CIM namespace.
//!
//! LHM (or its OpenHardwareMonitor ancestor) must be running with the WMI
//! publisher enabled. Every poll shells out to PowerShell, which prints one
//! pipe-separated line per hardware node (`H|...`) and per sensor (`S|...`).

use crate::sensors::{
    parse_f64_loose, BackendError, HardwareKind, HardwareReading, SensorBackend, SensorKind,
    SensorReading,
};
use std::collections::HashMap;
#[cfg(target_os = "windows")]
use std::process::Command;
#[cfg(target_os = "windows")]
use tracing::debug;

const BACKEND: &str = "lhm";

#[cfg(target_os = "windows")]
const QUERY: &str = "$n=@('root/LibreHardwareMonitor','root/OpenHardwareMonitor'); foreach($ns in $n){ try { $h=Get-CimInstance -Namespace $ns -ClassName Hardware -ErrorAction Stop; $s=Get-CimInstance -Namespace $ns -ClassName Sensor -ErrorAction Stop } catch { continue }; if($h){ $h | ForEach-Object { \"H|$($_.HardwareType)|$($_.Name)|$($_.Identifier)\" }; $s | ForEach-Object { \"S|$($_.SensorType)|$($_.Name)|$($_.Value)|$($_.Identifier)|$($_.Parent)\" }; break } }";

#[derive(Default)]
pub struct LhmBackend {
    opened: bool,
}

impl LhmBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SensorBackend for LhmBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    #[cfg(target_os = "windows")]
    fn open(&mut self) -> Result<(), BackendError> {
        let text = query_lhm()?;
        let devices = parse_lhm_output(&text);
        if devices.is_empty() {
            return Err(BackendError::Unavailable {
                backend: BACKEND,
                reason: "LibreHardwareMonitor WMI namespace returned no hardware".to_string(),
            });
        }
        debug!(devices = devices.len(), "LibreHardwareMonitor namespace found");
        self.opened = true;
        Ok(())
    }

    #[cfg(not(target_os = "windows"))]
    fn open(&mut self) -> Result<(), BackendError> {
        Err(BackendError::Unavailable {
            backend: BACKEND,
            reason: "LibreHardwareMonitor is only available on Windows".to_string(),
        })
    }

    fn read(&mut self, kinds: &[HardwareKind]) -> Vec<Result<HardwareReading, BackendError>> {
        if !self.opened {
            return Vec::new();
        }
        #[cfg(target_os = "windows")]
        {
            match query_lhm() {
                Ok(text) => parse_lhm_output(&text)
                    .into_iter()
                    .filter(|d| kinds.contains(&d.kind))
                    .map(Ok)
                    .collect(),
                Err(err) => vec![Err(err)],
            }
        }
        #[cfg(not(target_os = "windows"))]
        {
            let _ = kinds;
            Vec::new()
        }
    }
}

#[cfg(target_os = "windows")]
fn query_lhm() -> Result<String, BackendError> {
    let output = run_powershell(QUERY).ok_or_else(|| BackendError::Unavailable {
        backend: BACKEND,
        reason: "failed to spawn powershell".to_string(),
    })?;
    if !output.status.success() {
        return Err(BackendError::Read {
            hardware: "lhm".to_string(),
            reason: format!("powershell exited with {}", output.status),
        });
    }
    Ok(decode_cmd_stdout(&output.stdout))
}

fn hardware_kind(hardware_type: &str, identifier: &str) -> HardwareKind {
    let t = hardware_type.to_ascii_lowercase();
    match t.as_str() {
        "cpu" => return HardwareKind::Cpu,
        "gpunvidia" | "gpuamd" | "gpuati" | "gpuintel" => return HardwareKind::Gpu,
        "memory" | "ram" => return HardwareKind::Memory,
        "storage" | "hdd" => return HardwareKind::Storage,
        _ => {}
    }

    let ident = identifier.to_ascii_lowercase();
    if ident.starts_with("/intelcpu/") || ident.starts_with("/amdcpu/") || ident.starts_with("/cpu/") {
        HardwareKind::Cpu
    } else if ident.starts_with("/gpu-") || ident.starts_with("/gpu/") {
        HardwareKind::Gpu
    } else if ident.starts_with("/ram") || ident.starts_with("/memory") {
        HardwareKind::Memory
    } else if ident.starts_with("/nvme/") || ident.starts_with("/hdd/") || ident.starts_with("/ssd/") {
        HardwareKind::Storage
    } else {
        HardwareKind::Other
    }
}

/// Groups sensor lines under the hardware node named by their parent
/// identifier. Devices keep the order in which their `H|` lines appeared.
/// Sensors whose parent was never announced get a node of their own, typed by
/// identifier prefix.
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
pub(crate) fn parse_lhm_output(text: &str) -> Vec<HardwareReading> {
    let mut devices: Vec<HardwareReading> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();

    for line in text.lines() {
        let parts: Vec<&str> = line.split('|').map(str::trim).collect();
        match parts.first().copied() {
            Some("H") if parts.len() >= 4 => {
                let id = parts[3].to_ascii_lowercase();
                if by_id.contains_key(&id) {
                    continue;
                }
                by_id.insert(id, devices.len());
                devices.push(HardwareReading {
                    kind: hardware_kind(parts[1], parts[3]),
                    name: parts[2].to_string(),
                    sensors: Vec::new(),
                });
            }
            Some("S") if parts.len() >= 6 => {
                let parent = parts[5].to_ascii_lowercase();
                let idx = *by_id.entry(parent.clone()).or_insert_with(|| {
                    devices.push(HardwareReading {
                        kind: hardware_kind("", &parent),
                        name: parts[5].to_string(),
                        sensors: Vec::new(),
                    });
                    devices.len() - 1
                });
                devices[idx].sensors.push(SensorReading {
                    kind: SensorKind::parse(parts[1]),
                    label: parts[2].to_string(),
                    value: parse_f64_loose(parts[3]).filter(|v| v.is_finite()),
                });
            }
            _ => {}
        }
    }

    devices
}

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn decode_cmd_stdout(bytes: &[u8]) -> String {
    if let Ok(utf8) = std::str::from_utf8(bytes) {
        return utf8.to_string();
    }

    if bytes.len() >= 2 && bytes.len() % 2 == 0 {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if let Ok(s) = String::from_utf16(&units) {
            return s;
        }
    }

    String::from_utf8_lossy(bytes).to_string()
}

#[cfg(target_os = "windows")]
fn run_powershell(script: &str) -> Option<std::process::Output> {
    let wrapped_script = format!(
        "[Console]::OutputEncoding=[System.Text.UTF8Encoding]::new($false); $OutputEncoding=[System.Text.UTF8Encoding]::new($false); {script}"
    );
    if let Ok(output) = Command::new("powershell")
        .args(["-NoProfile", "-Command", &wrapped_script])
        .output()
    {
        return Some(output);
    }

    Command::new(r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe")
        .args(["-NoProfile", "-Command", &wrapped_script])
        .output()
        .ok()
}
