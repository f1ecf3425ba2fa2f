//! Worker invocation
//!
//! Turns a `start-execution` request into the concrete program, arguments,
//! environment and working directory for the worker process.

use crate::config::Config;
use bridge_types::{ExecutionMode, StartExecutionRequest};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Env var the worker reads its collection search path from.
pub const COLLECTIONS_PATH_VAR: &str = "ANSIBLE_COLLECTIONS_PATH";

/// Binary name inside the worker container image.
const CONTAINER_WORKER_BINARY: &str = "ansible-rulebook";

/// A fully resolved worker launch.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Overrides layered on top of the inherited environment.
    pub envs: HashMap<String, String>,
    pub workdir: Option<PathBuf>,
}

impl WorkerCommand {
    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Split a free-form argument string, keeping quoted substrings together.
///
/// Single quotes are literal; double quotes allow `\"` and `\\` escapes;
/// outside quotes a backslash escapes the next character.
pub fn split_args(input: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated single quote".to_string()),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(esc @ ('"' | '\\')) => current.push(esc),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err("unterminated double quote".to_string()),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err("unterminated double quote".to_string()),
                    }
                }
            }
            '\\' => {
                in_token = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }
    if in_token {
        args.push(current);
    }
    Ok(args)
}

/// Resolve the worker binary for local mode: the private environment's
/// `bin/` first, then PATH, then the bare name (spawn will report it).
pub fn resolve_local_binary(config: &Config) -> String {
    if let Some(dir) = &config.worker_env_dir {
        let candidate = dir.join("bin").join(&config.worker_binary);
        if candidate.is_file() {
            return candidate.to_string_lossy().into_owned();
        }
    }
    which::which(&config.worker_binary)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| config.worker_binary.clone())
}

/// Find a collection search path for local mode.
pub fn detect_collections_path(config: &Config) -> Option<PathBuf> {
    if let Some(path) = &config.worker_collections_path {
        return Some(path.clone());
    }
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(dir) = &config.worker_env_dir {
        candidates.push(dir.join("collections"));
    }
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(Path::new(&home).join(".ansible").join("collections"));
    }
    candidates.push(PathBuf::from("/usr/share/ansible/collections"));
    candidates.into_iter().find(|p| p.is_dir())
}

/// The flags every worker gets regardless of how it is launched.
fn worker_args(
    request: &StartExecutionRequest,
    execution_id: &str,
    callback_url: &str,
) -> Result<Vec<String>, String> {
    let mut args = vec![
        "--worker".to_string(),
        "--id".to_string(),
        execution_id.to_string(),
        "--websocket-url".to_string(),
        callback_url.to_string(),
    ];
    if let Some(interval) = request.heartbeat_interval.filter(|i| *i > 0) {
        args.push("--heartbeat".to_string());
        args.push(interval.to_string());
    }
    if let Some(extra) = request.extra_args.as_deref() {
        args.extend(split_args(extra).map_err(|e| format!("invalid extra arguments: {}", e))?);
    }
    Ok(args)
}

/// Build the launch for one execution.
pub fn build_worker_command(
    config: &Config,
    request: &StartExecutionRequest,
    execution_id: &str,
    detected_runtime: Option<&str>,
) -> Result<WorkerCommand, String> {
    let args = worker_args(request, execution_id, &config.public_ws_url)?;
    let mut envs = request.env_vars.clone();
    let workdir = request
        .working_directory
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .map(PathBuf::from);

    let command = match request.execution_mode {
        ExecutionMode::Local => {
            if !envs.contains_key(COLLECTIONS_PATH_VAR) {
                if let Some(path) = detect_collections_path(config) {
                    envs.insert(
                        COLLECTIONS_PATH_VAR.to_string(),
                        path.to_string_lossy().into_owned(),
                    );
                }
            }
            WorkerCommand {
                program: resolve_local_binary(config),
                args,
                envs,
                workdir,
            }
        }
        ExecutionMode::Custom => {
            let program = request
                .worker_path
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| "custom mode requires a worker path".to_string())?
                .to_string();
            WorkerCommand {
                program,
                args,
                envs,
                workdir,
            }
        }
        ExecutionMode::Container => {
            let runtime = request
                .container_runtime
                .clone()
                .or_else(|| config.container_runtime.clone())
                .or_else(|| detected_runtime.map(String::from))
                .ok_or_else(|| "no container runtime (podman or docker) available".to_string())?;
            let image = request
                .container_image
                .clone()
                .filter(|i| !i.trim().is_empty())
                .unwrap_or_else(|| config.container_image.clone());

            // Host networking so the worker can dial back to localhost and
            // bind its webhook ports where the listeners forward to.
            let mut container_args = vec![
                "run".to_string(),
                "--rm".to_string(),
                "--network".to_string(),
                "host".to_string(),
                "--name".to_string(),
                format!("bridge-worker-{}", execution_id),
            ];
            let mut keys: Vec<&String> = envs.keys().collect();
            keys.sort();
            for key in keys {
                container_args.push("-e".to_string());
                container_args.push(format!("{}={}", key, envs[key]));
            }
            if let Some(dir) = &workdir {
                container_args.push("-v".to_string());
                container_args.push(format!("{}:/workdir:Z", dir.display()));
                container_args.push("-w".to_string());
                container_args.push("/workdir".to_string());
            }
            container_args.push(image);
            container_args.push(CONTAINER_WORKER_BINARY.to_string());
            container_args.extend(args);

            WorkerCommand {
                program: runtime,
                args: container_args,
                envs,
                workdir,
            }
        }
    };
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(mode: ExecutionMode) -> StartExecutionRequest {
        StartExecutionRequest {
            rule_document: serde_json::json!([]),
            execution_mode: mode,
            ..Default::default()
        }
    }

    #[test]
    fn test_split_args_respects_quotes() {
        let args = split_args(r#"-v --env-vars "A B" 'c "d"' e\ f"#).unwrap();
        assert_eq!(args, vec!["-v", "--env-vars", "A B", "c \"d\"", "e f"]);
    }

    #[test]
    fn test_split_args_empty_quotes_make_an_argument() {
        assert_eq!(split_args("a '' b").unwrap(), vec!["a", "", "b"]);
        assert!(split_args("   ").unwrap().is_empty());
    }

    #[test]
    fn test_split_args_unterminated() {
        assert!(split_args("'oops").is_err());
        assert!(split_args("\"oops").is_err());
    }

    #[test]
    fn test_worker_flags() {
        let config = Config::default();
        let mut req = request(ExecutionMode::Custom);
        req.worker_path = Some("/opt/worker".into());
        req.heartbeat_interval = Some(5);
        req.extra_args = Some("--verbose 'x y'".into());

        let cmd = build_worker_command(&config, &req, "exec-1", None).unwrap();
        assert_eq!(cmd.program, "/opt/worker");
        assert_eq!(
            cmd.args,
            vec![
                "--worker",
                "--id",
                "exec-1",
                "--websocket-url",
                "ws://localhost:5555/ws",
                "--heartbeat",
                "5",
                "--verbose",
                "x y"
            ]
        );
    }

    #[test]
    fn test_custom_mode_requires_path() {
        let config = Config::default();
        let err = build_worker_command(&config, &request(ExecutionMode::Custom), "e", None);
        assert!(err.is_err());
    }

    #[test]
    fn test_container_mode_wraps_worker() {
        let config = Config::default();
        let mut req = request(ExecutionMode::Container);
        req.env_vars.insert("TOKEN".into(), "abc".into());

        let cmd = build_worker_command(&config, &req, "exec-2", Some("podman")).unwrap();
        assert_eq!(cmd.program, "podman");
        assert_eq!(&cmd.args[..4], &["run", "--rm", "--network", "host"]);
        assert!(cmd.args.contains(&"TOKEN=abc".to_string()));
        assert!(cmd.args.contains(&config.container_image));
        assert!(!cmd.envs.contains_key(COLLECTIONS_PATH_VAR));
        let worker_pos = cmd.args.iter().position(|a| a == CONTAINER_WORKER_BINARY).unwrap();
        assert_eq!(cmd.args[worker_pos + 1], "--worker");
    }

    #[test]
    fn test_container_mode_without_runtime_fails() {
        let config = Config::default();
        assert!(build_worker_command(&config, &request(ExecutionMode::Container), "e", None).is_err());
    }

    #[test]
    fn test_local_mode_injects_collections_path_only_when_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            worker_collections_path: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        let cmd = build_worker_command(&config, &request(ExecutionMode::Local), "e", None).unwrap();
        assert_eq!(
            cmd.envs.get(COLLECTIONS_PATH_VAR).map(String::as_str),
            Some(dir.path().to_str().unwrap())
        );

        // A user override wins.
        let mut req = request(ExecutionMode::Local);
        req.env_vars.insert(COLLECTIONS_PATH_VAR.into(), "/mine".into());
        let cmd = build_worker_command(&config, &req, "e", None).unwrap();
        assert_eq!(cmd.envs[COLLECTIONS_PATH_VAR], "/mine");
    }

    #[test]
    fn test_local_binary_prefers_env_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin").join("ansible-rulebook"), "").unwrap();
        let config = Config {
            worker_env_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        assert_eq!(
            resolve_local_binary(&config),
            dir.path().join("bin/ansible-rulebook").to_string_lossy()
        );
    }
}
