//! One process attached to a pseudo-terminal
//!
//! Wraps the portable-pty master and child. The slave side is dropped right
//! after spawning so the reader sees end-of-file once the process exits.

use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize,
};

use cf_protocol::TerminalSize;

/// Shells a session may run when `/etc/shells` does not list them
const KNOWN_SHELLS: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/zsh",
    "/bin/fish",
    "/bin/dash",
    "/bin/ksh",
    "/usr/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "/usr/bin/fish",
    "/usr/bin/dash",
    "/usr/local/bin/bash",
    "/usr/local/bin/zsh",
    "/usr/local/bin/fish",
    "/opt/homebrew/bin/bash",
    "/opt/homebrew/bin/zsh",
];

/// Pick and validate the shell: the configured one, then `$SHELL`, then
/// `/bin/sh`. The shell must be a known shell and exist on disk.
pub fn resolve_shell(configured: Option<&str>) -> Result<String> {
    let shell = configured
        .map(str::to_string)
        .or_else(|| std::env::var("SHELL").ok())
        .unwrap_or_else(|| "/bin/sh".to_string());

    let listed = KNOWN_SHELLS.contains(&shell.as_str()) || listed_in_etc_shells(&shell);
    if !listed {
        anyhow::bail!("Shell '{}' is not an allowed login shell", shell);
    }
    if !Path::new(&shell).exists() {
        anyhow::bail!("Shell '{}' does not exist", shell);
    }
    Ok(shell)
}

fn listed_in_etc_shells(shell: &str) -> bool {
    std::fs::read_to_string("/etc/shells")
        .map(|shells| {
            shells
                .lines()
                .map(str::trim)
                .any(|line| !line.starts_with('#') && line == shell)
        })
        .unwrap_or(false)
}

/// What to run
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub shell: String,
    /// Run `shell -c command` instead of an interactive shell
    pub command: Option<String>,
    pub login: String,
    pub size: TerminalSize,
    pub env: Vec<(String, String)>,
}

/// A running process on a PTY
pub struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl PtyProcess {
    /// Spawn the process; returns it with its output reader and input writer
    pub fn spawn(
        request: &SpawnRequest,
    ) -> Result<(Self, Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        let PtyPair { master, slave } = native_pty_system()
            .openpty(pty_size(request.size))
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&request.shell);
        if let Some(command) = &request.command {
            cmd.arg("-c");
            cmd.arg(command);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("USER", &request.login);
        cmd.env("LOGNAME", &request.login);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn {}", request.shell))?;
        drop(slave);

        tracing::debug!(shell = %request.shell, pid = ?child.process_id(), "Spawned PTY process");

        let reader = master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = master.take_writer().context("Failed to take PTY writer")?;

        Ok((Self { master, child }, reader, writer))
    }

    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        self.master
            .resize(pty_size(size))
            .context("Failed to resize PTY")
    }

    /// Exit code if the process has finished
    pub fn try_wait(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code() as i32),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll PTY process");
                None
            }
        }
    }

    pub fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            tracing::debug!(error = %e, "Kill of PTY process failed");
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
