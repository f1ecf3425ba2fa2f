//! Public tunnel providers
//!
//! A provider exposes a local port on a public URL. The production provider
//! drives the ngrok agent; tests use [`MockTunnelProvider`].

use crate::execution::process_tree::{self, KillSignal};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// A tunnel the provider accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct PublicTunnel {
    pub tunnel_id: String,
    pub public_url: String,
}

#[derive(Debug)]
pub enum TunnelError {
    /// The agent binary could not be launched.
    Spawn(std::io::Error),
    /// The provider refused the tunnel (bad token, account limits, ...).
    Rejected(String),
    /// The agent exited before reporting a tunnel.
    AgentExited(Option<i32>),
    Timeout(Duration),
    UnknownTunnel(String),
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "failed to launch tunnel agent: {}", e),
            Self::Rejected(msg) => write!(f, "tunnel rejected: {}", msg),
            Self::AgentExited(Some(code)) => {
                write!(f, "tunnel agent exited with code {} before the tunnel was up", code)
            }
            Self::AgentExited(None) => write!(f, "tunnel agent exited before the tunnel was up"),
            Self::Timeout(d) => write!(f, "no tunnel reported within {}s", d.as_secs()),
            Self::UnknownTunnel(id) => write!(f, "unknown tunnel {}", id),
        }
    }
}

impl std::error::Error for TunnelError {}

/// Something that can open and close public tunnels to local ports.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn open(&self, port: u16, auth_token: &str) -> Result<PublicTunnel, TunnelError>;

    /// Closing an unknown tunnel reports `UnknownTunnel`; callers may ignore it.
    async fn close(&self, tunnel_id: &str) -> Result<(), TunnelError>;
}

/// One structured log record from `ngrok --log-format json`.
#[derive(Debug, Deserialize)]
struct AgentLogRecord {
    #[serde(default)]
    lvl: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    err: Option<String>,
}

#[derive(Debug, PartialEq)]
enum AgentLine {
    Started(String),
    Failed(String),
    Other,
}

fn parse_agent_line(line: &str) -> AgentLine {
    let Ok(record) = serde_json::from_str::<AgentLogRecord>(line) else {
        return AgentLine::Other;
    };
    if record.msg == "started tunnel" {
        if let Some(url) = record.url.filter(|u| !u.is_empty()) {
            return AgentLine::Started(url);
        }
    }
    if matches!(record.lvl.as_str(), "eror" | "crit") {
        let reason = record
            .err
            .filter(|e| !e.is_empty() && e != "<nil>")
            .unwrap_or(record.msg);
        return AgentLine::Failed(reason);
    }
    AgentLine::Other
}

struct AgentHandle {
    port: u16,
    child: Child,
}

/// Runs one `ngrok http <port>` agent per tunnel.
pub struct NgrokAgentProvider {
    binary: String,
    start_timeout: Duration,
    agents: DashMap<String, AgentHandle>,
}

impl NgrokAgentProvider {
    pub fn new(binary: impl Into<String>, start_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            start_timeout,
            agents: DashMap::new(),
        }
    }

    async fn wait_for_url<R>(
        lines: &mut tokio::io::Lines<BufReader<R>>,
        child: &mut Child,
    ) -> Result<String, TunnelError>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match parse_agent_line(&line) {
                        AgentLine::Started(url) => return Ok(url),
                        AgentLine::Failed(reason) => return Err(TunnelError::Rejected(reason)),
                        AgentLine::Other => {}
                    },
                    // Output closed: the agent is exiting.
                    Ok(None) | Err(_) => {
                        let status = child.wait().await.ok().and_then(|s| s.code());
                        return Err(TunnelError::AgentExited(status));
                    }
                },
                status = child.wait() => {
                    return Err(TunnelError::AgentExited(status.ok().and_then(|s| s.code())));
                }
            }
        }
    }

    async fn terminate(mut child: Child) {
        let Some(pid) = child.id() else { return };
        process_tree::terminate_tree(pid, KillSignal::Graceful).await;
        if tokio::time::timeout(Duration::from_secs(3), child.wait()).await.is_err() {
            process_tree::terminate_tree(pid, KillSignal::Forced).await;
            let _ = child.wait().await;
        }
    }
}

#[async_trait]
impl TunnelProvider for NgrokAgentProvider {
    fn name(&self) -> &'static str {
        "ngrok"
    }

    async fn open(&self, port: u16, auth_token: &str) -> Result<PublicTunnel, TunnelError> {
        let mut child = Command::new(&self.binary)
            .arg("http")
            .arg(port.to_string())
            .arg("--authtoken")
            .arg(auth_token)
            .args(["--log", "stdout", "--log-format", "json"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(TunnelError::Spawn)?;

        let Some(stdout) = child.stdout.take() else {
            Self::terminate(child).await;
            return Err(TunnelError::AgentExited(None));
        };
        let mut lines = BufReader::new(stdout).lines();

        let started = tokio::time::timeout(
            self.start_timeout,
            Self::wait_for_url(&mut lines, &mut child),
        )
        .await
        .unwrap_or(Err(TunnelError::Timeout(self.start_timeout)));

        let public_url = match started {
            Ok(url) => url,
            Err(e) => {
                log::warn!("[TUNNEL] ngrok agent for port {} failed: {}", port, e);
                Self::terminate(child).await;
                return Err(e);
            }
        };

        // Keep draining the agent's log so it never blocks on a full pipe.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                if let AgentLine::Failed(reason) = parse_agent_line(&line) {
                    log::warn!("[TUNNEL] ngrok agent for port {}: {}", port, reason);
                }
            }
        });

        let tunnel_id = format!("ngrok-{}", uuid::Uuid::new_v4());
        log::info!(
            "[TUNNEL] Port {} is public at {} ({})",
            port,
            public_url,
            tunnel_id
        );
        self.agents
            .insert(tunnel_id.clone(), AgentHandle { port, child });
        Ok(PublicTunnel {
            tunnel_id,
            public_url,
        })
    }

    async fn close(&self, tunnel_id: &str) -> Result<(), TunnelError> {
        let (_, agent) = self
            .agents
            .remove(tunnel_id)
            .ok_or_else(|| TunnelError::UnknownTunnel(tunnel_id.to_string()))?;
        log::info!("[TUNNEL] Closing tunnel {} for port {}", tunnel_id, agent.port);
        Self::terminate(agent.child).await;
        Ok(())
    }
}

/// In-memory provider that hands out fake URLs.
#[cfg(test)]
#[derive(Default)]
pub struct MockTunnelProvider {
    pub fail_with: Option<String>,
    pub open_tunnels: DashMap<String, u16>,
    pub closed: parking_lot::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MockTunnelProvider {
    pub fn failing(reason: &str) -> Self {
        Self {
            fail_with: Some(reason.to_string()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
#[async_trait]
impl TunnelProvider for MockTunnelProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn open(&self, port: u16, _auth_token: &str) -> Result<PublicTunnel, TunnelError> {
        if let Some(reason) = &self.fail_with {
            return Err(TunnelError::Rejected(reason.clone()));
        }
        let tunnel_id = format!("mock-{}", port);
        self.open_tunnels.insert(tunnel_id.clone(), port);
        Ok(PublicTunnel {
            public_url: format!("https://{}.tunnel.test", port),
            tunnel_id,
        })
    }

    async fn close(&self, tunnel_id: &str) -> Result<(), TunnelError> {
        self.open_tunnels
            .remove(tunnel_id)
            .ok_or_else(|| TunnelError::UnknownTunnel(tunnel_id.to_string()))?;
        self.closed.lock().push(tunnel_id.to_string());
        Ok(())
    }
}
