#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::io::Write;
use std::path::Path;
use std::process::Command;

use thiserror::Error;

use msync_core::types::{MetricPath, RemoteNode};

/// Always passed to ssh, regardless of user overrides: password prompts
/// would hang an unattended run, and host-key warnings corrupt captured
/// catalogue output.
pub const MANDATORY_SSH_OPTIONS: &[&str] = &[
    "-o",
    "PasswordAuthentication=no",
    "-o",
    "LogLevel=quiet",
];

/// Tolerance for resuming files left in staging by an earlier unfinished
/// run: leftovers older than ~28 hours are considered stale and resent.
pub const MODIFY_WINDOW_SECS: u64 = 100_800;

pub fn default_ssh_options() -> Vec<String> {
    [
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "Compression=no",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn default_rsync_options() -> Vec<String> {
    vec![
        "--archive".to_string(),
        "--sparse".to_string(),
        "--update".to_string(),
        format!("--modify-window={MODIFY_WINDOW_SECS}"),
    ]
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("subcommand failed: {command}: {output}")]
    CommandFailed { command: String, output: String },
    #[error("subcommand produced no output: {command}")]
    NoOutput { command: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a single batch transfer needs.
#[derive(Debug, Clone, Copy)]
pub struct FetchSpec<'a> {
    pub remote: &'a RemoteNode,
    /// Storage root on the remote side; file paths are relative to it.
    pub storage_root: &'a Path,
    pub files: &'a [MetricPath],
    pub staging_dir: &'a Path,
    pub ssh_options: &'a [String],
    pub rsync_options: &'a [String],
}

/// Transport collaborator: remote command execution plus whole-file
/// transfer.
///
/// Deliberately synchronous; the pipeline drives these on the blocking
/// pool with its own concurrency cap, so implementations stay simple
/// process wrappers.
pub trait Transport: Send + Sync + 'static {
    /// Runs `command` on the peer and returns its non-empty stdout lines.
    fn list_remote(
        &self,
        remote: &RemoteNode,
        command: &[String],
        ssh_options: &[String],
    ) -> Result<Vec<String>, TransportError>;

    /// Copies every file in the spec into the staging directory.
    fn fetch_files(&self, spec: FetchSpec<'_>) -> Result<(), TransportError>;
}

/// Production transport: ssh for remote commands, rsync-over-ssh for
/// file transfer.
#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh_bin: String,
    rsync_bin: String,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self {
            ssh_bin: "ssh".to_string(),
            rsync_bin: "rsync".to_string(),
        }
    }
}

impl SshTransport {
    pub fn new(ssh_bin: impl Into<String>, rsync_bin: impl Into<String>) -> Self {
        Self {
            ssh_bin: ssh_bin.into(),
            rsync_bin: rsync_bin.into(),
        }
    }

    fn ssh_command(&self, remote: &RemoteNode, command: &[String], ssh_options: &[String]) -> Vec<String> {
        let mut cmd = vec![self.ssh_bin.clone()];
        cmd.extend(MANDATORY_SSH_OPTIONS.iter().map(|s| s.to_string()));
        cmd.extend(ssh_options.iter().cloned());
        cmd.push(format!("{}@{}", remote.user, remote.host));
        cmd.push("--".to_string());
        cmd.extend(command.iter().cloned());
        cmd
    }

    fn rsync_command(&self, spec: &FetchSpec<'_>, files_from: &Path) -> Vec<String> {
        let mut rsh = vec![self.ssh_bin.clone()];
        rsh.extend(MANDATORY_SSH_OPTIONS.iter().map(|s| s.to_string()));
        rsh.extend(spec.ssh_options.iter().cloned());

        let mut cmd = vec![
            self.rsync_bin.clone(),
            "--rsh".to_string(),
            rsh.join(" "),
            format!("--files-from={}", files_from.display()),
        ];
        cmd.extend(spec.rsync_options.iter().cloned());
        cmd.push(format!(
            "{}@{}:{}/",
            spec.remote.user,
            spec.remote.host,
            spec.storage_root.display()
        ));
        cmd.push(spec.staging_dir.display().to_string());
        cmd
    }
}

impl Transport for SshTransport {
    fn list_remote(
        &self,
        remote: &RemoteNode,
        command: &[String],
        ssh_options: &[String],
    ) -> Result<Vec<String>, TransportError> {
        let cmd = self.ssh_command(remote, command, ssh_options);
        let lines = run_command(&cmd)?;
        if lines.is_empty() {
            return Err(TransportError::NoOutput {
                command: cmd.join(" "),
            });
        }
        Ok(lines)
    }

    fn fetch_files(&self, spec: FetchSpec<'_>) -> Result<(), TransportError> {
        std::fs::create_dir_all(spec.staging_dir)?;

        let mut list = tempfile::NamedTempFile::new()?;
        for file in spec.files {
            writeln!(list, "{file}")?;
        }
        list.flush()?;

        let cmd = self.rsync_command(&spec, list.path());
        run_command(&cmd)?;
        Ok(())
    }
}

/// Starts a process and returns its non-empty stdout lines; a non-zero
/// exit surfaces stderr (or stdout) in the error.
pub fn run_command(cmd: &[String]) -> Result<Vec<String>, TransportError> {
    let (program, args) = cmd.split_first().ok_or_else(|| TransportError::NoOutput {
        command: String::new(),
    })?;

    tracing::debug!(target: "msync", event = "run_command", command = %cmd.join(" "));
    let output = Command::new(program).args(args).output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if !stderr.trim().is_empty() {
            stderr.trim().to_string()
        } else if !stdout.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            "<no output>".to_string()
        };
        return Err(TransportError::CommandFailed {
            command: cmd.join(" "),
            output: detail,
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.to_string())
        .collect())
}
