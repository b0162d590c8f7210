use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::{Command, Stdio};

/// Environment facts gathered once at the start of a run. Read-only after.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Facts {
    pub gpu: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_name: Option<String>,
    /// Total memory in MiB; 0 when unknown.
    pub memory_mb: u64,
    pub docker: bool,
    pub systemd: bool,
}

impl Facts {
    /// Probe the host. Never fails; unknown facts fall back to "absent".
    pub fn gather() -> Self {
        let gpu_name = detect_gpu();
        let memory_mb = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_meminfo_mb(&s))
            .unwrap_or(0);
        let facts = Facts {
            gpu: gpu_name.is_some(),
            gpu_name: gpu_name.filter(|n| !n.is_empty()),
            memory_mb,
            docker: which::which("docker").is_ok(),
            systemd: Path::new("/run/systemd/system").is_dir(),
        };
        tracing::info!(
            gpu = facts.gpu,
            memory_mb = facts.memory_mb,
            docker = facts.docker,
            systemd = facts.systemd,
            "gathered host facts"
        );
        facts
    }
}

/// `Some(name)` when `nvidia-smi` is present and lists a GPU. The name may be
/// empty if the query output is unusable.
fn detect_gpu() -> Option<String> {
    which::which("nvidia-smi").ok()?;
    let out = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&out.stdout);
    Some(stdout.lines().next().unwrap_or_default().trim().to_string())
}

/// Extract `MemTotal` from `/proc/meminfo` content, in MiB.
pub fn parse_meminfo_mb(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line
        .trim_start_matches("MemTotal:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kb / 1024)
}
