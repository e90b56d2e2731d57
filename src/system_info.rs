use chrono::{DateTime, Utc};
use serde::Serialize;

/// Host metadata returned for `get_system_info`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub hostname: String,
    pub platform: String,
    pub arch: String,
    pub cpus: usize,
    pub shell: String,
    pub home_dir: String,
    pub uptime_secs: i64,
}

/// Server-wide counters returned for `get-server-stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub connections: usize,
    pub terminals: usize,
    pub transient_processes: usize,
    pub paused_processes: usize,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

pub fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

pub fn snapshot(shell: &str, started_at: DateTime<Utc>) -> SystemInfo {
    SystemInfo {
        hostname: hostname(),
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        cpus: std::thread::available_parallelism().map_or(1, |n| n.get()),
        shell: shell.to_string(),
        home_dir: dirs::home_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        uptime_secs: (Utc::now() - started_at).num_seconds(),
    }
}
