//! Environment probe
//!
//! Independent checks for the tools the bridge shells out to, run
//! concurrently and folded into one [`EnvironmentStatus`].

use crate::config::Config;
use crate::execution::worker_command::resolve_local_binary;
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Container runtimes tried in order when none is configured.
const CONTAINER_RUNTIMES: &[&str] = &["podman", "docker"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStatus {
    pub worker_available: bool,
    pub worker_path: Option<String>,
    pub worker_version: Option<String>,
    pub container_runtime: Option<String>,
    pub tunnel_available: bool,
    pub probed_at: Option<String>,
}

/// First non-empty line of `<binary> --version`, if it runs and succeeds.
async fn command_version(binary: &str) -> Option<String> {
    let output = Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = match tokio::time::timeout(VERSION_TIMEOUT, output).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(_)) | Ok(Err(_)) => return None,
        Err(_) => {
            log::warn!("[PROBE] `{} --version` timed out", binary);
            return None;
        }
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(String::from)
}

async fn binary_path(binary: &str) -> Option<String> {
    let binary = binary.to_string();
    tokio::task::spawn_blocking(move || {
        let path = Path::new(&binary);
        if path.is_absolute() {
            return path.is_file().then(|| binary.clone());
        }
        which::which(&binary)
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
    })
    .await
    .ok()
    .flatten()
}

async fn detect_container_runtime(configured: Option<&str>) -> Option<String> {
    if let Some(runtime) = configured {
        return command_version(runtime).await.map(|_| runtime.to_string());
    }
    for runtime in CONTAINER_RUNTIMES {
        if command_version(runtime).await.is_some() {
            return Some(runtime.to_string());
        }
    }
    None
}

pub async fn probe_environment(config: &Config) -> EnvironmentStatus {
    let worker = resolve_local_binary(config);
    let (worker_path, worker_version, container_runtime, tunnel_path) = tokio::join!(
        binary_path(&worker),
        command_version(&worker),
        detect_container_runtime(config.container_runtime.as_deref()),
        binary_path(&config.tunnel_binary),
    );

    let status = EnvironmentStatus {
        worker_available: worker_path.is_some(),
        worker_path,
        worker_version,
        container_runtime,
        tunnel_available: tunnel_path.is_some(),
        probed_at: Some(chrono::Utc::now().to_rfc3339()),
    };
    log::info!(
        "[PROBE] worker: {} ({}), container runtime: {}, tunnel agent: {}",
        status.worker_path.as_deref().unwrap_or("missing"),
        status.worker_version.as_deref().unwrap_or("unknown version"),
        status.container_runtime.as_deref().unwrap_or("none"),
        if status.tunnel_available { "found" } else { "missing" }
    );
    status
}
