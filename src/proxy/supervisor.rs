//! Proxy daemon supervisor
//!
//! Owns one daemon process at a time. The lifecycle (launch, bootstrap wait,
//! relaunch, shutdown) runs under a `tokio::sync::Mutex`; the published
//! [`ProxyProcessState`] lives behind a `std::sync::RwLock` so status reads
//! never wait on a launch in progress.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::metrics::{PROXY_BOOTSTRAP_DURATION, PROXY_LAUNCHES, PROXY_RUNNING};

use super::control::ControlClient;
use super::locator::{self, Platform};
use super::ports::PortReservation;
use super::{ProxyProcessState, ProxyStatus};

/// Lifecycle operations the agent needs from the proxy
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Current snapshot, never blocks on the lifecycle lock
    fn status(&self) -> ProxyProcessState;

    /// Launch or relaunch as needed and wait until bootstrapped
    ///
    /// Bounded by `timeout`, including the wait for the lifecycle lock.
    async fn ensure_ready(&self, timeout: Duration) -> ProxyProcessState;

    /// Explicit start: resets the relaunch budget, then `ensure_ready`
    async fn start(&self, timeout: Duration) -> ProxyProcessState;

    /// Detect an unexpected exit (Running → Failed)
    async fn health_check(&self) -> ProxyProcessState;

    /// Stop the daemon and release its resources
    async fn shutdown(&self) -> ProxyProcessState;
}

/// A launched daemon and everything that must be released with it
struct Daemon {
    child: Child,
    data_dir: TempDir,
    control_port: u16,
}

#[derive(Default)]
struct Lifecycle {
    daemon: Option<Daemon>,
    binary: Option<PathBuf>,
    discovery_done: bool,
    relaunches_used: u32,
}

type ExistsFn = dyn Fn(&Path) -> bool + Send + Sync;

pub struct ProxySupervisor {
    config: ProxyConfig,
    candidates: Vec<PathBuf>,
    exists: Arc<ExistsFn>,
    lifecycle: Mutex<Lifecycle>,
    state: RwLock<ProxyProcessState>,
}

impl ProxySupervisor {
    /// Supervisor probing the real filesystem for the current platform
    pub fn new(config: ProxyConfig) -> Self {
        let candidates = locator::candidate_paths(
            Platform::current(),
            |key| std::env::var(key).ok(),
            config.binary_override.as_deref(),
        );
        Self::with_locator(config, candidates, locator::is_executable_file)
    }

    /// Supervisor with an explicit candidate list and `exists` predicate
    pub fn with_locator<F>(config: ProxyConfig, candidates: Vec<PathBuf>, exists: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        let initial = if config.enabled {
            ProxyProcessState::default()
        } else {
            ProxyProcessState::disabled()
        };
        Self {
            config,
            candidates,
            exists: Arc::new(exists),
            lifecycle: Mutex::new(Lifecycle::default()),
            state: RwLock::new(initial),
        }
    }

    fn publish(&self, update: impl FnOnce(&mut ProxyProcessState)) -> ProxyProcessState {
        let mut guard = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        update(&mut guard);
        guard.clone()
    }

    fn mark_failed(&self, error: &ProxyError, relaunches: u32) -> ProxyProcessState {
        PROXY_RUNNING.set(0.0);
        self.publish(|s| {
            s.status = ProxyStatus::Failed;
            s.socks_port = None;
            s.control_port = None;
            s.pid = None;
            s.last_error = Some(error.to_string());
            s.relaunch_attempts = relaunches;
        })
    }

    /// Check candidates once per supervisor lifetime
    fn discover(&self, lifecycle: &mut Lifecycle) -> Option<PathBuf> {
        if let Some(binary) = &lifecycle.binary {
            return Some(binary.clone());
        }
        if lifecycle.discovery_done {
            return None;
        }
        lifecycle.discovery_done = true;

        let exists = Arc::clone(&self.exists);
        match locator::locate(&self.candidates, |p| exists(p)) {
            Some(binary) => {
                info!(binary = %binary.display(), "proxy binary located");
                lifecycle.binary = Some(binary.clone());
                Some(binary)
            }
            None => {
                warn!(candidates = self.candidates.len(), "no proxy binary found; anonymized tools disabled");
                self.publish(|s| {
                    s.status = ProxyStatus::NotFound;
                    s.last_error = Some(format!(
                        "{} (checked {} locations; set VEIL_TOR_BIN)",
                        ProxyError::NotFound,
                        self.candidates.len()
                    ));
                });
                None
            }
        }
    }

    async fn ensure_ready_locked(&self, lifecycle: &mut Lifecycle, deadline: Instant, budget: Duration) -> ProxyProcessState {
        loop {
            let current = self.status();
            match current.status {
                ProxyStatus::Disabled | ProxyStatus::NotFound => return current,
                ProxyStatus::Running => {
                    if self.reap_if_exited(lifecycle).await {
                        continue;
                    }
                    return current;
                }
                ProxyStatus::Failed if lifecycle.relaunches_used >= self.config.max_relaunches => {
                    return current;
                }
                _ => {}
            }

            let Some(binary) = self.discover(lifecycle) else {
                return self.status();
            };

            if current.status == ProxyStatus::Failed {
                let attempt = lifecycle.relaunches_used;
                lifecycle.relaunches_used += 1;
                let backoff = self.config.relaunch_backoff.saturating_mul(2u32.saturating_pow(attempt));
                let remaining = deadline.saturating_duration_since(Instant::now());
                if backoff >= remaining {
                    debug!(attempt, "no time left for proxy relaunch");
                    return self.publish(|s| s.relaunch_attempts = lifecycle.relaunches_used);
                }
                info!(attempt = attempt + 1, backoff_ms = backoff.as_millis() as u64, "relaunching proxy");
                tokio::time::sleep(backoff).await;
                self.publish(|s| s.relaunch_attempts = lifecycle.relaunches_used);
            }

            match self.launch(lifecycle, &binary, deadline, budget).await {
                Ok(state) => return state,
                Err(e) => {
                    warn!(error = %e, "proxy launch failed");
                    let state = self.mark_failed(&e, lifecycle.relaunches_used);
                    if matches!(e, ProxyError::Timeout(_)) || Instant::now() >= deadline {
                        return state;
                    }
                }
            }
        }
    }

    async fn launch(
        &self,
        lifecycle: &mut Lifecycle,
        binary: &Path,
        deadline: Instant,
        budget: Duration,
    ) -> Result<ProxyProcessState, ProxyError> {
        self.publish(|s| {
            s.status = ProxyStatus::Starting;
            s.binary = Some(binary.to_path_buf());
            s.last_error = None;
        });

        let reservation = PortReservation::reserve(self.config.socks_port, self.config.control_port)?;
        let data_dir = tempfile::Builder::new()
            .prefix("veil_tor_")
            .tempdir()
            .map_err(|e| ProxyError::Spawn(format!("cannot create data directory: {}", e)))?;

        let (socks_port, control_port) = reservation.release();
        let mut child = Command::new(binary)
            .arg("--SocksPort")
            .arg(socks_port.to_string())
            .arg("--ControlPort")
            .arg(control_port.to_string())
            .arg("--DataDirectory")
            .arg(data_dir.path())
            .arg("--Log")
            .arg(format!("{} stdout", self.config.log_level))
            .arg("--CookieAuthentication")
            .arg("0")
            .arg("--__OwningControllerProcess")
            .arg(std::process::id().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PROXY_LAUNCHES.with_label_values(&["failed"]).inc();
                ProxyError::Spawn(format!("{}: {}", binary.display(), e))
            })?;

        let pid = child.id();
        self.publish(|s| {
            s.socks_port = Some(socks_port);
            s.control_port = Some(control_port);
            s.pid = pid;
        });
        debug!(?pid, socks_port, control_port, "proxy spawned, waiting for bootstrap");

        let started = Instant::now();
        match self.wait_bootstrapped(&mut child, control_port, deadline, budget).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                PROXY_BOOTSTRAP_DURATION.observe(elapsed.as_secs_f64());
                PROXY_LAUNCHES.with_label_values(&["ready"]).inc();
                PROXY_RUNNING.set(1.0);
                info!(socks_port, elapsed_ms = elapsed.as_millis() as u64, "proxy bootstrapped");

                lifecycle.daemon = Some(Daemon {
                    child,
                    data_dir,
                    control_port,
                });
                Ok(self.publish(|s| {
                    s.status = ProxyStatus::Running;
                    s.relaunch_attempts = lifecycle.relaunches_used;
                }))
            }
            Err(e) => {
                let label = if matches!(e, ProxyError::Timeout(_)) { "timeout" } else { "failed" };
                PROXY_LAUNCHES.with_label_values(&[label]).inc();
                if let Err(kill_err) = child.kill().await {
                    debug!(error = %kill_err, "proxy already gone");
                }
                remove_data_dir(data_dir);
                Err(e)
            }
        }
    }

    async fn wait_bootstrapped(
        &self,
        child: &mut Child,
        control_port: u16,
        deadline: Instant,
        budget: Duration,
    ) -> Result<(), ProxyError> {
        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| ProxyError::Exited(e.to_string()))?
            {
                return Err(ProxyError::Exited(status.to_string()));
            }

            match query_progress(control_port).await {
                Ok(100) => return Ok(()),
                Ok(progress) => debug!(progress, "proxy bootstrapping"),
                Err(e) => debug!(error = %e, "control port not ready"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ProxyError::Timeout(budget.as_secs()));
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// Running → Failed when the process has exited; true if it had
    async fn reap_if_exited(&self, lifecycle: &mut Lifecycle) -> bool {
        let Some(daemon) = lifecycle.daemon.as_mut() else {
            return false;
        };
        let exit = match daemon.child.try_wait() {
            Ok(Some(status)) => status.to_string(),
            Ok(None) => return false,
            Err(e) => e.to_string(),
        };
        warn!(exit = %exit, "proxy exited unexpectedly");
        if let Some(daemon) = lifecycle.daemon.take() {
            remove_data_dir(daemon.data_dir);
        }
        self.mark_failed(&ProxyError::ExitedUnexpectedly(exit), lifecycle.relaunches_used);
        true
    }

    async fn stop_daemon(&self, mut daemon: Daemon) {
        let pid = daemon.child.id();

        let signalled = match ControlClient::open(daemon.control_port).await {
            Ok(mut client) => client.signal_shutdown().await.is_ok(),
            Err(e) => {
                debug!(error = %e, "control port unavailable for shutdown");
                false
            }
        };
        #[cfg(unix)]
        {
            if let (false, Some(pid)) = (signalled, pid) {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!(error = %e, "SIGTERM failed");
                }
            }
        }
        #[cfg(not(unix))]
        let _ = signalled;

        match tokio::time::timeout(self.config.shutdown_grace, daemon.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "proxy exited"),
            Ok(Err(e)) => warn!(error = %e, "waiting for proxy failed"),
            Err(_) => {
                warn!(?pid, "proxy ignored shutdown, killing");
                if let Err(e) = daemon.child.kill().await {
                    warn!(error = %e, "failed to kill proxy");
                }
            }
        }
        remove_data_dir(daemon.data_dir);
    }
}

#[async_trait]
impl ProxyControl for ProxySupervisor {
    fn status(&self) -> ProxyProcessState {
        match self.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn ensure_ready(&self, timeout: Duration) -> ProxyProcessState {
        let current = self.status();
        if matches!(current.status, ProxyStatus::Disabled | ProxyStatus::NotFound) {
            return current;
        }

        let deadline = Instant::now() + timeout;
        let Ok(mut lifecycle) = tokio::time::timeout(timeout, self.lifecycle.lock()).await else {
            debug!("proxy lifecycle busy; returning current state");
            return self.status();
        };
        self.ensure_ready_locked(&mut lifecycle, deadline, timeout).await
    }

    async fn start(&self, timeout: Duration) -> ProxyProcessState {
        let deadline = Instant::now() + timeout;
        let Ok(mut lifecycle) = tokio::time::timeout(timeout, self.lifecycle.lock()).await else {
            return self.status();
        };
        lifecycle.relaunches_used = 0;
        self.publish(|s| {
            s.relaunch_attempts = 0;
            if s.status == ProxyStatus::Failed {
                s.status = ProxyStatus::Stopped;
            }
        });
        self.ensure_ready_locked(&mut lifecycle, deadline, timeout).await
    }

    async fn health_check(&self) -> ProxyProcessState {
        let mut lifecycle = self.lifecycle.lock().await;
        self.reap_if_exited(&mut lifecycle).await;
        self.status()
    }

    async fn shutdown(&self) -> ProxyProcessState {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(daemon) = lifecycle.daemon.take() {
            info!("stopping proxy");
            self.stop_daemon(daemon).await;
        }
        PROXY_RUNNING.set(0.0);
        self.publish(|s| {
            if !matches!(s.status, ProxyStatus::Disabled | ProxyStatus::NotFound) {
                s.status = ProxyStatus::Stopped;
            }
            s.socks_port = None;
            s.control_port = None;
            s.pid = None;
        })
    }
}

async fn query_progress(control_port: u16) -> Result<u8, ProxyError> {
    let mut client = ControlClient::open(control_port).await?;
    client.bootstrap_progress().await
}

fn remove_data_dir(dir: TempDir) {
    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        warn!(path = %path.display(), error = %e, "failed to remove proxy data directory");
    }
}
