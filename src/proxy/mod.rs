//! Embedded proxy daemon (Tor) supervision
//!
//! ```text
//!            ┌───────────┐  locate fails   ┌──────────┐
//!  enabled   │  Stopped  │────────────────▶│ NotFound │ (sticky)
//!  ─────────▶│           │                 └──────────┘
//!            └─────┬─────┘
//!                  │ ensure_ready / start
//!                  ▼
//!            ┌───────────┐ PROGRESS=100 ┌─────────┐ shutdown ┌─────────┐
//!            │ Starting  │─────────────▶│ Running │─────────▶│ Stopped │
//!            └─────┬─────┘              └────┬────┘          └─────────┘
//!                  │ exit / timeout          │ unexpected exit
//!                  ▼                         ▼
//!            ┌──────────────────────────────────────────┐
//!            │ Failed: relaunch ≤ max_relaunches times, │
//!            │ sleeping backoff·2ⁿ before attempt n     │
//!            └──────────────────────────────────────────┘
//! ```
//!
//! `Disabled` replaces the whole diagram when the proxy is turned off in
//! configuration.

pub mod control;
pub mod locator;
pub mod ports;
pub mod supervisor;

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

pub use control::{parse_bootstrap_progress, ControlClient};
pub use locator::{candidate_paths, is_executable_file, locate, Platform};
pub use ports::PortReservation;
pub use supervisor::{ProxyControl, ProxySupervisor};

/// Lifecycle phase of the proxy daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    /// Turned off in configuration
    Disabled,
    /// No executable found; not retried
    NotFound,
    Starting,
    Running,
    Failed,
    Stopped,
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyStatus::Disabled => "disabled",
            ProxyStatus::NotFound => "not found",
            ProxyStatus::Starting => "starting",
            ProxyStatus::Running => "running",
            ProxyStatus::Failed => "failed",
            ProxyStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Published snapshot of the supervisor's state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyProcessState {
    pub status: ProxyStatus,
    pub socks_port: Option<u16>,
    pub control_port: Option<u16>,
    pub pid: Option<u32>,
    pub binary: Option<PathBuf>,
    pub last_error: Option<String>,
    pub relaunch_attempts: u32,
}

impl ProxyProcessState {
    pub fn disabled() -> Self {
        Self {
            status: ProxyStatus::Disabled,
            ..Self::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ProxyStatus::Running
    }

    /// One-line summary for status output
    pub fn describe(&self) -> String {
        let mut out = format!("proxy {}", self.status);
        if let Some(port) = self.socks_port {
            out.push_str(&format!(", socks 127.0.0.1:{}", port));
        }
        if let Some(port) = self.control_port {
            out.push_str(&format!(", control {}", port));
        }
        if let Some(binary) = &self.binary {
            out.push_str(&format!(", binary {}", binary.display()));
        }
        if self.relaunch_attempts > 0 {
            out.push_str(&format!(", relaunches {}", self.relaunch_attempts));
        }
        if let Some(err) = &self.last_error {
            out.push_str(&format!(" ({})", err));
        }
        out
    }
}

impl Default for ProxyProcessState {
    fn default() -> Self {
        Self {
            status: ProxyStatus::Stopped,
            socks_port: None,
            control_port: None,
            pid: None,
            binary: None,
            last_error: None,
            relaunch_attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_running_is_running() {
        let mut state = ProxyProcessState::default();
        assert!(!state.is_running());
        state.status = ProxyStatus::Running;
        assert!(state.is_running());
        assert!(!ProxyProcessState::disabled().is_running());
    }

    #[test]
    fn test_describe() {
        let state = ProxyProcessState {
            status: ProxyStatus::Running,
            socks_port: Some(9150),
            control_port: Some(9151),
            ..ProxyProcessState::default()
        };
        assert_eq!(state.describe(), "proxy running, socks 127.0.0.1:9150, control 9151");

        let state = ProxyProcessState {
            status: ProxyStatus::NotFound,
            last_error: Some("no tor executable".into()),
            ..ProxyProcessState::default()
        };
        assert_eq!(state.describe(), "proxy not found (no tor executable)");
    }
}
