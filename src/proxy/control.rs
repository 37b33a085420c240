//! Minimal control-port client for the proxy daemon
//!
//! Speaks just enough of the line protocol for lifecycle management:
//!
//! ```text
//! → AUTHENTICATE ""
//! ← 250 OK
//! → GETINFO status/bootstrap-phase
//! ← 250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY="Done"
//! ← 250 OK
//! → SIGNAL SHUTDOWN
//! ← 250 OK
//! ```

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::ProxyError;

/// Bound on connecting and on each command/reply exchange
const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlClient {
    pub async fn connect(port: u16) -> Result<Self, ProxyError> {
        let stream = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
            .await
            .map_err(|_| ProxyError::Control(format!("connect to control port {} timed out", port)))?
            .map_err(|e| ProxyError::Control(format!("connect to control port {}: {}", port, e)))?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer,
        })
    }

    /// Connect and authenticate (cookie auth is disabled at launch)
    pub async fn open(port: u16) -> Result<Self, ProxyError> {
        let mut client = Self::connect(port).await?;
        client.authenticate().await?;
        Ok(client)
    }

    pub async fn authenticate(&mut self) -> Result<(), ProxyError> {
        self.command("AUTHENTICATE \"\"").await.map(|_| ())
    }

    /// Bootstrap progress in percent
    pub async fn bootstrap_progress(&mut self) -> Result<u8, ProxyError> {
        let lines = self.command("GETINFO status/bootstrap-phase").await?;
        lines
            .iter()
            .find_map(|line| parse_bootstrap_progress(line))
            .ok_or_else(|| ProxyError::Control(format!("no bootstrap progress in reply: {:?}", lines)))
    }

    pub async fn signal_shutdown(&mut self) -> Result<(), ProxyError> {
        self.command("SIGNAL SHUTDOWN").await.map(|_| ())
    }

    /// Send one command and collect the reply lines
    async fn command(&mut self, line: &str) -> Result<Vec<String>, ProxyError> {
        tokio::time::timeout(IO_TIMEOUT, self.exchange(line))
            .await
            .map_err(|_| ProxyError::Control(format!("no reply to {:?}", verb(line))))?
    }

    async fn exchange(&mut self, line: &str) -> Result<Vec<String>, ProxyError> {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .map_err(|e| ProxyError::Control(e.to_string()))?;

        let mut lines = Vec::new();
        let mut in_data = false;
        loop {
            let mut buf = String::new();
            let n = self
                .reader
                .read_line(&mut buf)
                .await
                .map_err(|e| ProxyError::Control(e.to_string()))?;
            if n == 0 {
                return Err(ProxyError::Control("control connection closed".into()));
            }
            let reply = buf.trim_end_matches(['\r', '\n']).to_string();

            if in_data {
                if reply == "." {
                    in_data = false;
                } else {
                    lines.push(reply);
                }
                continue;
            }

            let (code, sep) = match (reply.get(..3), reply.as_bytes().get(3)) {
                (Some(code), Some(&sep)) => (code.to_string(), sep),
                (Some(code), None) => (code.to_string(), b' '),
                _ => return Err(ProxyError::Control(format!("malformed reply {:?}", reply))),
            };
            if !code.starts_with('2') {
                return Err(ProxyError::Control(format!("{} rejected: {}", verb(line), reply)));
            }
            lines.push(reply.get(4..).unwrap_or("").to_string());
            match sep {
                b' ' => return Ok(lines),
                b'+' => in_data = true,
                _ => {}
            }
        }
    }
}

fn verb(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or(line)
}

/// Extract `PROGRESS=<n>` from a bootstrap-phase status line
pub fn parse_bootstrap_progress(line: &str) -> Option<u8> {
    line.split_whitespace()
        .find_map(|token| token.strip_prefix("PROGRESS="))
        .and_then(|value| value.parse::<u8>().ok())
        .filter(|p| *p <= 100)
}
