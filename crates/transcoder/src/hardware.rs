use std::path::Path;
use log::debug;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use crate::supervisor::run_command;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CudaDevice {
    pub index: u32,
    pub name: String,
}

/// Acceleration back-ends usable through `TranscodeParams::hw_accel`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub cpu: bool,
    pub cpu_count: usize,
    pub cuda: bool,
    pub cuda_devices: Vec<CudaDevice>,
    pub qsv: bool,
    pub vaapi: bool,
}

const DRI_DIR: &str = "/dev/dri";

/// Probe the host for CPU cores, NVIDIA GPUs and DRI render nodes
pub async fn detect_hardware() -> HardwareInfo {
    let mut system = System::new();
    system.refresh_cpu_all();
    let cpu_count = match system.cpus().len() {
        0 => 4,
        n => n,
    };

    let mut info = HardwareInfo {
        cpu: true,
        cpu_count,
        cuda: false,
        cuda_devices: Vec::new(),
        qsv: false,
        vaapi: false,
    };

    let argv = vec!["nvidia-smi".to_string(), "-L".to_string()];
    match run_command(&argv, Some(10)).await {
        Ok(output) if output.success => {
            info.cuda = true;
            info.cuda_devices = parse_nvidia_smi(&output.stdout);
        }
        Ok(output) => debug!("nvidia-smi exited with {:?}", output.exit_code),
        Err(e) => debug!("nvidia-smi unavailable: {:#}", e),
    }

    if has_render_node(Path::new(DRI_DIR)) {
        info.qsv = true;
        info.vaapi = true;
    }

    info
}

/// Parse `nvidia-smi -L` output, e.g. `GPU 0: NVIDIA GeForce RTX 3060 (UUID: GPU-...)`
pub fn parse_nvidia_smi(stdout: &str) -> Vec<CudaDevice> {
    let mut devices = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(device) = parse_gpu_line(line) {
            devices.push(device);
            continue;
        }
        // Unrecognized layout: take whatever sits after the first colon
        if let Some((_, rest)) = line.split_once(':') {
            let name = rest.split('(').next().unwrap_or("").trim();
            devices.push(CudaDevice {
                index: devices.len() as u32,
                name: name.to_string(),
            });
        }
    }
    devices
}

fn parse_gpu_line(line: &str) -> Option<CudaDevice> {
    let rest = line.strip_prefix("GPU")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let (index, rest) = rest.trim_start().split_once(':')?;
    let index = index.trim().parse().ok()?;
    let (name, _) = rest.split_once("(UUID")?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(CudaDevice {
        index,
        name: name.to_string(),
    })
}

/// True when `dri_dir` holds at least one `renderD*` node
pub fn has_render_node(dri_dir: &Path) -> bool {
    std::fs::read_dir(dri_dir)
        .map(|entries| {
            entries
                .flatten()
                .any(|e| e.file_name().to_string_lossy().starts_with("renderD"))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvidia_smi() {
        let out = "GPU 0: NVIDIA GeForce RTX 3060 (UUID: GPU-1234)\nGPU 1: Tesla T4 (UUID: GPU-5678)\n";
        let devices = parse_nvidia_smi(out);
        assert_eq!(
            devices,
            vec![
                CudaDevice { index: 0, name: "NVIDIA GeForce RTX 3060".to_string() },
                CudaDevice { index: 1, name: "Tesla T4".to_string() },
            ]
        );
    }

    #[test]
    fn test_parse_nvidia_smi_fallback() {
        let devices = parse_nvidia_smi("Device: Quadro P2000 (rev a1)\n\n");
        assert_eq!(devices, vec![CudaDevice { index: 0, name: "Quadro P2000".to_string() }]);
        assert!(parse_nvidia_smi("").is_empty());
        assert!(parse_nvidia_smi("No devices were found").is_empty());
    }

    #[test]
    fn test_has_render_node() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_render_node(dir.path()));
        std::fs::write(dir.path().join("card0"), b"").unwrap();
        assert!(!has_render_node(dir.path()));
        std::fs::write(dir.path().join("renderD128"), b"").unwrap();
        assert!(has_render_node(dir.path()));
        assert!(!has_render_node(&dir.path().join("missing")));
    }

    #[tokio::test]
    async fn test_detect_hardware_reports_cpu() {
        let info = detect_hardware().await;
        assert!(info.cpu);
        assert!(info.cpu_count >= 1);
    }
}
