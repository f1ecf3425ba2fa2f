use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: String,
    pub port: u16,
    /// URL the worker dials back on; derived from `port` unless overridden.
    pub public_ws_url: String,
    pub worker_binary: String,
    /// Private environment the provisioning script installs the worker into.
    pub worker_env_dir: Option<PathBuf>,
    pub worker_collections_path: Option<PathBuf>,
    pub container_image: String,
    pub container_runtime: Option<String>,
    pub worker_kill_timeout: Duration,
    pub worker_restart_settle: Duration,
    pub execution_retention: Duration,
    pub execution_sweep_interval: Duration,
    pub webhook_bind_address: String,
    pub webhook_request_timeout: Duration,
    pub webhook_keep_alive: Duration,
    pub webhook_body_limit: usize,
    pub webhook_forward_timeout: Duration,
    pub tunnel_binary: String,
    pub tunnel_start_timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let port = 5555;
        Self {
            bind_address: "127.0.0.1".to_string(),
            port,
            public_ws_url: format!("ws://localhost:{}/ws", port),
            worker_binary: "ansible-rulebook".to_string(),
            worker_env_dir: None,
            worker_collections_path: None,
            container_image: "quay.io/ansible/ansible-rulebook:main".to_string(),
            container_runtime: None,
            worker_kill_timeout: Duration::from_millis(5000),
            worker_restart_settle: Duration::from_millis(500),
            execution_retention: Duration::from_secs(3600),
            execution_sweep_interval: Duration::from_secs(300),
            webhook_bind_address: "127.0.0.1".to_string(),
            webhook_request_timeout: Duration::from_secs(300),
            webhook_keep_alive: Duration::from_secs(5),
            webhook_body_limit: 10 * 1024 * 1024,
            webhook_forward_timeout: Duration::from_secs(60),
            tunnel_binary: "ngrok".to_string(),
            tunnel_start_timeout: Duration::from_secs(20),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let port = parse_var("BRIDGE_PORT", defaults.port);

        Self {
            bind_address: env::var("BRIDGE_BIND_ADDRESS").unwrap_or(defaults.bind_address),
            port,
            public_ws_url: env::var("BRIDGE_PUBLIC_WS_URL")
                .unwrap_or_else(|_| format!("ws://localhost:{}/ws", port)),
            worker_binary: env::var("WORKER_BINARY").unwrap_or(defaults.worker_binary),
            worker_env_dir: env::var("WORKER_ENV_DIR").ok().map(PathBuf::from),
            worker_collections_path: env::var("WORKER_COLLECTIONS_PATH").ok().map(PathBuf::from),
            container_image: env::var("CONTAINER_IMAGE").unwrap_or(defaults.container_image),
            container_runtime: env::var("CONTAINER_RUNTIME").ok(),
            worker_kill_timeout: Duration::from_millis(parse_var("WORKER_KILL_TIMEOUT_MS", 5000)),
            worker_restart_settle: Duration::from_millis(parse_var("WORKER_RESTART_SETTLE_MS", 500)),
            execution_retention: Duration::from_secs(parse_var("EXECUTION_RETENTION_SECS", 3600)),
            execution_sweep_interval: Duration::from_secs(parse_var(
                "EXECUTION_SWEEP_INTERVAL_SECS",
                300,
            )),
            webhook_bind_address: env::var("WEBHOOK_BIND_ADDRESS")
                .unwrap_or(defaults.webhook_bind_address),
            webhook_request_timeout: Duration::from_secs(parse_var(
                "WEBHOOK_REQUEST_TIMEOUT_SECS",
                300,
            )),
            webhook_keep_alive: Duration::from_secs(parse_var("WEBHOOK_KEEP_ALIVE_SECS", 5)),
            webhook_body_limit: parse_var("WEBHOOK_BODY_LIMIT_BYTES", defaults.webhook_body_limit),
            webhook_forward_timeout: Duration::from_secs(parse_var(
                "WEBHOOK_FORWARD_TIMEOUT_SECS",
                60,
            )),
            tunnel_binary: env::var("TUNNEL_BINARY").unwrap_or(defaults.tunnel_binary),
            tunnel_start_timeout: Duration::from_secs(parse_var("TUNNEL_START_TIMEOUT_SECS", 20)),
            log_level: env::var("RUST_LOG").unwrap_or(defaults.log_level),
        }
    }
}

/// Read and parse an env var, keeping `default` when unset or invalid.
fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("{} has invalid value '{}', using default", name, raw);
            default
        }),
        Err(_) => default,
    }
}
