// kiln-aio/src/process.rs
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use kiln_common::error::{KilnError, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, error};

/// A fully specified subprocess: nothing is inherited from the parent environment.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn display(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    /// Stdout and stderr interleaved in arrival order.
    pub combined: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs a command with a cleared environment and captures its output.
///
/// The child is killed if the returned future is dropped.
pub async fn run_command_async(spec: &CommandSpec) -> Result<CommandOutput> {
    debug!(
        "Running command: {} (cwd: {}, env: {:?})",
        spec.display(),
        spec.cwd.display(),
        spec.env.keys().collect::<Vec<_>>()
    );

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .env_clear()
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        error!("Failed to spawn {}: {}", spec.program.display(), e);
        KilnError::CommandExecError(format!("{}: {e}", spec.program.display()))
    })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| KilnError::CommandExecError("stdout was not captured".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| KilnError::CommandExecError("stderr was not captured".to_string()))?;

    let mut combined = Vec::new();
    let mut stdout_only = Vec::new();
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    let (mut out_done, mut err_done) = (false, false);

    while !(out_done && err_done) {
        tokio::select! {
            read = stdout.read(&mut out_buf), if !out_done => {
                let n = read?;
                if n == 0 {
                    out_done = true;
                } else {
                    combined.extend_from_slice(&out_buf[..n]);
                    stdout_only.extend_from_slice(&out_buf[..n]);
                }
            }
            read = stderr.read(&mut err_buf), if !err_done => {
                let n = read?;
                if n == 0 {
                    err_done = true;
                } else {
                    combined.extend_from_slice(&err_buf[..n]);
                }
            }
        }
    }

    let status = child.wait().await?;
    let exit_code = exit_code(status);
    if exit_code != 0 {
        debug!("Command {} exited with {}", spec.display(), exit_code);
    }
    Ok(CommandOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout_only).into_owned(),
        combined: String::from_utf8_lossy(&combined).into_owned(),
    })
}

/// Exit code of a finished process; death by signal N is reported as 128 + N.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
