//! Low-level UCI process I/O.
//!
//! Spawns an engine binary with piped stdio and exposes line-based
//! communication. Stderr is drained in the background so a chatty engine
//! cannot deadlock on a full pipe.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, error, info};

use crate::error::{Error, Result};

#[cfg(target_os = "windows")]
pub const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Async communicator for a running UCI engine process.
pub struct UciCommunicator {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout_lines: Lines<BufReader<ChildStdout>>,
}

impl UciCommunicator {
    /// Spawn a new UCI engine process and set up async I/O.
    pub async fn spawn(path: &Path) -> Result<Self> {
        let mut command = Command::new(path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            command.current_dir(parent);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("TERM", "dumb");

        #[cfg(target_os = "windows")]
        command.creation_flags(CREATE_NO_WINDOW);

        let mut child = command.spawn()?;
        info!("starting engine process: {:?}", path);
        let stdin = child.stdin.take().ok_or(Error::NoStdin)?;
        let stdout = child.stdout.take().ok_or(Error::NoStdout)?;
        let stdout_lines = BufReader::new(stdout).lines();

        // Drain stderr to avoid deadlocks when the buffer fills up.
        let stderr = child.stderr.take();
        tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    error!("[engine-stderr] {}", line);
                }
            }
        });

        Ok(Self {
            child,
            stdin,
            stdout_lines,
        })
    }

    /// Write a line to the engine's stdin and flush it.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        debug!("[engine-stdin] {}", line.trim_end());
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }
}
