use anyhow::{anyhow, Context};
use std::future::Future;
use std::sync::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tokio::process::Command;

use crate::models::{GpuInfo, GpuProcessSample, RawProcessInfo};

/// Narrow capability boundary for everything platform-specific: process
/// table, GPU tool, port ownership, signals. Every operation is fallible on
/// its own and degrades to empty/absent instead of propagating, so callers
/// must treat "no data" as temporarily unknown, never as "nothing exists".
pub trait SystemInspector: Send + Sync {
    fn list_candidate_processes(&self) -> impl Future<Output = Vec<RawProcessInfo>> + Send;
    /// Every pid alive on the machine, not just the tracked candidates.
    /// Parent-liveness decisions need the full table: a candidate's parent
    /// is usually a shell or init, which the candidate filter rejects.
    fn list_live_pids(&self) -> impl Future<Output = std::collections::HashSet<u32>> + Send;
    fn query_gpu_info(&self) -> impl Future<Output = Option<GpuInfo>> + Send;
    fn query_gpu_processes(&self) -> impl Future<Output = Vec<GpuProcessSample>> + Send;
    fn query_port_owner(&self, port: u16) -> impl Future<Output = Option<u32>> + Send;
    fn is_alive(&self, pid: u32) -> impl Future<Output = bool> + Send;
    fn terminate(&self, pid: u32) -> impl Future<Output = bool> + Send;
}

/// Command lines matching any of these substrings are worth tracking.
const CANDIDATE_KEYWORDS: &[&str] = &[
    "python", "uvicorn", "hypercorn", "vllm", "llama", "whisper", "torch", "onnx",
    "model-server",
];

/// Production inspector: sysinfo for the process table and signals,
/// `nvidia-smi` for GPU state, `lsof` for port ownership.
pub struct HostInspector {
    system: Mutex<System>,
    gpu_tool: String,
}

impl HostInspector {
    pub fn new(gpu_tool: impl Into<String>) -> Self {
        Self {
            system: Mutex::new(System::new_all()),
            gpu_tool: gpu_tool.into(),
        }
    }

    fn is_candidate(cmdline: &str, name: &str) -> bool {
        CANDIDATE_KEYWORDS
            .iter()
            .any(|kw| cmdline.contains(kw) || name.contains(kw))
    }

    async fn run_gpu_query(&self, args: &[&str]) -> Option<String> {
        let output = match Command::new(&self.gpu_tool).args(args).output().await {
            Ok(out) => out,
            Err(e) => {
                log::debug!("gpu tool '{}' unavailable: {}", self.gpu_tool, e);
                return None;
            }
        };
        if !output.status.success() {
            log::debug!("gpu tool exited with {}", output.status);
            return None;
        }
        String::from_utf8(output.stdout).ok()
    }
}

impl SystemInspector for HostInspector {
    async fn list_candidate_processes(&self) -> Vec<RawProcessInfo> {
        let mut sys = match self.system.lock() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut candidates = Vec::new();
        for (pid, process) in sys.processes() {
            let cmdline = process
                .cmd()
                .iter()
                .map(|s| s.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            let name = process.name().to_string_lossy().to_string();

            if !Self::is_candidate(&cmdline, &name) {
                continue;
            }

            candidates.push(RawProcessInfo {
                pid: pid.as_u32(),
                parent_pid: process.parent().map(|p| p.as_u32()),
                name,
                cmdline,
                cpu_seconds: process.accumulated_cpu_time() as f64 / 1000.0,
                memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
            });
        }
        candidates.sort_by_key(|p| p.pid);
        candidates
    }

    async fn list_live_pids(&self) -> std::collections::HashSet<u32> {
        let mut sys = match self.system.lock() {
            Ok(guard) => guard,
            Err(_) => return Default::default(),
        };
        sys.refresh_processes(ProcessesToUpdate::All, true);
        sys.processes().keys().map(|pid| pid.as_u32()).collect()
    }

    async fn query_gpu_info(&self) -> Option<GpuInfo> {
        let stdout = self
            .run_gpu_query(&[
                "--query-gpu=name,memory.used,memory.total,memory.free,utilization.gpu,temperature.gpu",
                "--format=csv,noheader,nounits",
            ])
            .await?;
        let line = stdout.lines().next()?;
        match parse_gpu_csv(line) {
            Ok(info) => Some(info),
            Err(e) => {
                log::warn!("malformed gpu query row '{}': {}", line, e);
                None
            }
        }
    }

    async fn query_gpu_processes(&self) -> Vec<GpuProcessSample> {
        let Some(stdout) = self
            .run_gpu_query(&[
                "--query-compute-apps=pid,process_name,used_memory",
                "--format=csv,noheader,nounits",
            ])
            .await
        else {
            return Vec::new();
        };

        let mut samples = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            match parse_gpu_process_csv(line) {
                Ok(sample) => samples.push(sample),
                Err(e) => log::warn!("malformed gpu process row '{}': {}", line, e),
            }
        }
        samples
    }

    async fn query_port_owner(&self, port: u16) -> Option<u32> {
        let output = Command::new("lsof")
            .args(["-nP", &format!("-iTCP:{}", port), "-sTCP:LISTEN", "-t"])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8(output.stdout).ok()?;
        stdout.lines().next()?.trim().parse::<u32>().ok()
    }

    async fn is_alive(&self, pid: u32) -> bool {
        let mut sys = match self.system.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        let target = Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        sys.process(target).is_some()
    }

    async fn terminate(&self, pid: u32) -> bool {
        let mut sys = match self.system.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        let target = Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        match sys.process(target) {
            // SIGTERM first; fall back to the platform default where
            // TERM is not supported.
            Some(process) => process
                .kill_with(Signal::Term)
                .unwrap_or_else(|| process.kill()),
            None => false,
        }
    }
}

fn split_csv(line: &str, expected: usize) -> anyhow::Result<Vec<&str>> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != expected {
        return Err(anyhow!(
            "expected {} fields, got {}",
            expected,
            fields.len()
        ));
    }
    Ok(fields)
}

fn parse_field<T: std::str::FromStr>(raw: &str, field: &str) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>()
        .with_context(|| format!("field '{}' = '{}'", field, raw))
}

/// Strict parse of one device row. Any field that fails to parse fails the
/// whole row; a partially-typed snapshot is worse than none.
pub fn parse_gpu_csv(line: &str) -> anyhow::Result<GpuInfo> {
    let fields = split_csv(line, 6)?;
    Ok(GpuInfo {
        name: fields[0].to_string(),
        memory_used_mb: parse_field(fields[1], "memory.used")?,
        memory_total_mb: parse_field(fields[2], "memory.total")?,
        memory_free_mb: parse_field(fields[3], "memory.free")?,
        utilization_percent: parse_field(fields[4], "utilization.gpu")?,
        temperature_c: parse_field(fields[5], "temperature.gpu")?,
    })
}

/// Strict parse of one per-process row. Drivers report `[N/A]` for
/// used_memory in some modes; such rows are rejected rather than guessed at.
pub fn parse_gpu_process_csv(line: &str) -> anyhow::Result<GpuProcessSample> {
    let fields = split_csv(line, 3)?;
    Ok(GpuProcessSample {
        pid: parse_field(fields[0], "pid")?,
        process_name: fields[1].to_string(),
        used_memory_mb: parse_field(fields[2], "used_memory")?,
    })
}

/// Deterministic inspector used to exercise the guardian without a GPU or a
/// live process table.
#[cfg(test)]
pub struct FakeInspector {
    pub processes: Mutex<Vec<RawProcessInfo>>,
    pub live_pids: Mutex<std::collections::HashSet<u32>>,
    pub gpu_info: Mutex<Option<GpuInfo>>,
    pub gpu_processes: Mutex<Vec<GpuProcessSample>>,
    pub port_owner: Mutex<Option<u32>>,
    pub dead_pids: Mutex<std::collections::HashSet<u32>>,
    pub terminated: Mutex<Vec<u32>>,
    pub terminate_succeeds: bool,
}

#[cfg(test)]
impl Default for FakeInspector {
    fn default() -> Self {
        Self {
            processes: Mutex::new(Vec::new()),
            live_pids: Mutex::new(Default::default()),
            gpu_info: Mutex::new(None),
            gpu_processes: Mutex::new(Vec::new()),
            port_owner: Mutex::new(None),
            dead_pids: Mutex::new(Default::default()),
            terminated: Mutex::new(Vec::new()),
            terminate_succeeds: true,
        }
    }
}

#[cfg(test)]
impl SystemInspector for FakeInspector {
    async fn list_candidate_processes(&self) -> Vec<RawProcessInfo> {
        self.processes.lock().unwrap().clone()
    }

    async fn list_live_pids(&self) -> std::collections::HashSet<u32> {
        self.live_pids.lock().unwrap().clone()
    }

    async fn query_gpu_info(&self) -> Option<GpuInfo> {
        self.gpu_info.lock().unwrap().clone()
    }

    async fn query_gpu_processes(&self) -> Vec<GpuProcessSample> {
        self.gpu_processes.lock().unwrap().clone()
    }

    async fn query_port_owner(&self, _port: u16) -> Option<u32> {
        *self.port_owner.lock().unwrap()
    }

    async fn is_alive(&self, pid: u32) -> bool {
        !self.dead_pids.lock().unwrap().contains(&pid)
    }

    async fn terminate(&self, pid: u32) -> bool {
        self.terminated.lock().unwrap().push(pid);
        self.terminate_succeeds
    }
}
