//! Multi-child supervisor
//!
//! Runs several tuner instances in one process: each child is this same
//! binary re-executed (no shell) with its own argv, environment and working
//! directory. Child output is captured line by line under the child's name,
//! restart policies are enforced per child, and shutdown propagates SIGTERM
//! with a bounded wait before killing.

pub mod dvr;
pub mod library;
pub mod plex;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use dvr::DvrSyncInstance;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("manifest io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid manifest: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum RestartPolicy {
    Never,
    OnFailure { delay_secs: u64 },
    Always { delay_secs: u64 },
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::OnFailure { delay_secs: 5 }
    }
}

/// One child instance definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildSpec {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub restart: RestartPolicy,
    /// Claims the shared HDHR UDP/TCP 65001 ports.
    #[serde(default)]
    pub claims_network_mode: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorManifest {
    pub children: Vec<ChildSpec>,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Desired Plex DVR rows; the manifest is the source of truth.
    #[serde(default)]
    pub dvr_sync: Vec<DvrSyncInstance>,
}

fn default_shutdown_timeout() -> u64 {
    10
}

impl SupervisorManifest {
    pub fn load(path: &Path) -> Result<Self, SupervisorError> {
        let manifest: SupervisorManifest = serde_json::from_slice(&std::fs::read(path)?)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.children.is_empty() {
            return Err(SupervisorError::Invalid("no children defined".into()));
        }
        let mut names = std::collections::HashSet::new();
        for child in &self.children {
            if !names.insert(child.name.as_str()) {
                return Err(SupervisorError::Invalid(format!(
                    "duplicate child name: {}",
                    child.name
                )));
            }
        }
        let network_claims = self.children.iter().filter(|c| c.claims_network_mode).count();
        if network_claims > 1 {
            return Err(SupervisorError::Invalid(
                "only one child may claim hdhr network mode".into(),
            ));
        }
        Ok(())
    }
}

/// Send SIGTERM, wait up to `timeout`, then SIGKILL.
async fn terminate_child(child: &mut Child, name: &str, timeout: Duration) {
    #[cfg(target_os = "linux")]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(timeout, child.wait()).await.is_ok() {
            return;
        }
        warn!(child = name, "did not exit on SIGTERM, killing");
    }
    #[cfg(not(target_os = "linux"))]
    let _ = timeout;

    if let Err(e) = child.kill().await {
        warn!(child = name, error = %e, "kill failed");
    }
}

fn spawn_child(spec: &ChildSpec) -> std::io::Result<Child> {
    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.workdir {
        command.current_dir(dir);
    }
    command.spawn()
}

/// Forward a child's output line by line under its name.
fn capture_output(child: &mut Child, name: String) {
    if let Some(stdout) = child.stdout.take() {
        let name = name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(child = %name, "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(child = %name, "{line}");
            }
        });
    }
}

/// Manage one child to completion: spawn, restart per policy, honor
/// shutdown. Returns whether the child's final exit was clean.
async fn manage_child(
    spec: ChildSpec,
    mut shutdown: watch::Receiver<bool>,
    shutdown_timeout: Duration,
) -> bool {
    loop {
        let mut child = match spawn_child(&spec) {
            Ok(child) => child,
            Err(e) => {
                error!(child = %spec.name, error = %e, "spawn failed");
                return false;
            }
        };
        info!(child = %spec.name, pid = ?child.id(), "child started");
        capture_output(&mut child, spec.name.clone());

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        terminate_child(&mut child, &spec.name, shutdown_timeout).await;
                        return true;
                    }
                }
            }
        };

        let success = status.map(|s| s.success()).unwrap_or(false);
        info!(child = %spec.name, success, "child exited");

        let delay = match (&spec.restart, success) {
            (RestartPolicy::Always { delay_secs }, _) => Some(*delay_secs),
            (RestartPolicy::OnFailure { delay_secs }, false) => Some(*delay_secs),
            _ => None,
        };

        match delay {
            Some(secs) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return true;
                        }
                    }
                }
            }
            None => return success,
        }
    }
}

/// Run every child until shutdown. With `fail_fast`, the first child that
/// gives up takes the whole process down.
pub async fn run(
    manifest: SupervisorManifest,
    shutdown: watch::Receiver<bool>,
) -> Result<(), SupervisorError> {
    manifest.validate()?;
    let shutdown_timeout = Duration::from_secs(manifest.shutdown_timeout_secs);

    // An internal trigger lets fail-fast stop siblings
    let (internal_tx, internal_rx) = watch::channel(false);
    {
        let mut external = shutdown.clone();
        let internal_tx = internal_tx.clone();
        tokio::spawn(async move {
            loop {
                if external.changed().await.is_err() {
                    return;
                }
                if *external.borrow() {
                    let _ = internal_tx.send(true);
                    return;
                }
            }
        });
    }

    let mut tasks: JoinSet<(String, bool)> = JoinSet::new();
    for spec in manifest.children.clone() {
        let name = spec.name.clone();
        let rx = internal_rx.clone();
        tasks.spawn(async move {
            let clean = manage_child(spec, rx, shutdown_timeout).await;
            (name, clean)
        });
    }

    while let Some(result) = tasks.join_next().await {
        match result {
            Ok((name, clean)) => {
                if !clean && manifest.fail_fast {
                    error!(child = %name, "child gave up; fail-fast shutdown");
                    let _ = internal_tx.send(true);
                }
            }
            Err(e) => warn!(error = %e, "child task panicked"),
        }
    }
    Ok(())
}
