//! The process-execution seam. Every external tool the orchestrator drives
//! (`virsh`, `qemu-img`, `ssh`, ...) goes through a [`CommandRunner`].

use std::path::Path;
use std::process::Stdio;

use crate::error::MachinaError;

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait CommandRunner {
    /// Run to completion and return stdout. Non-zero exit or a spawn
    /// failure is an `ExternalCommand` error.
    async fn run(&self, program: &str, args: &[String]) -> Result<String, MachinaError>;

    /// Start a process that outlives this call, with stdout/stderr
    /// appended to `log` when given.
    fn spawn_detached(
        &self,
        program: &str,
        args: &[String],
        log: Option<&Path>,
    ) -> Result<(), MachinaError>;

    /// Run with the terminal attached (interactive ssh).
    async fn interactive(&self, program: &str, args: &[String]) -> Result<(), MachinaError>;
}

/// Runs real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

fn render(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    }
}

impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, MachinaError> {
        tracing::debug!(command = %render(program, args), "running");
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| MachinaError::ExternalCommand {
                command: program.into(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                output.status.to_string()
            } else {
                stderr
            };
            return Err(MachinaError::ExternalCommand {
                command: program.into(),
                message,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn spawn_detached(
        &self,
        program: &str,
        args: &[String],
        log: Option<&Path>,
    ) -> Result<(), MachinaError> {
        tracing::debug!(command = %render(program, args), "spawning detached");
        let mut cmd = std::process::Command::new(program);
        cmd.args(args).stdin(Stdio::null());

        match log {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| MachinaError::io(format!("opening {}", path.display()), e))?;
                let err_file = file
                    .try_clone()
                    .map_err(|e| MachinaError::io(format!("opening {}", path.display()), e))?;
                cmd.stdout(file).stderr(err_file);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        cmd.spawn().map_err(|e| MachinaError::ExternalCommand {
            command: program.into(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn interactive(&self, program: &str, args: &[String]) -> Result<(), MachinaError> {
        let status = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| MachinaError::ExternalCommand {
                command: program.into(),
                message: e.to_string(),
            })?;
        if !status.success() {
            return Err(MachinaError::ExternalCommand {
                command: program.into(),
                message: status.to_string(),
            });
        }
        Ok(())
    }
}

// ── RecordingRunner ───────────────────────────────────────

#[cfg(test)]
pub use recording::{Invocation, RecordingRunner};


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn process_runner_captures_stdout() {
        let out = ProcessRunner
            .run("echo", &["hello".to_string()])
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn process_runner_reports_nonzero_exit() {
        let err = ProcessRunner.run("false", &[]).await.unwrap_err();
        assert!(matches!(err, MachinaError::ExternalCommand { ref command, .. } if command == "false"));
    }

    #[tokio::test]
    async fn process_runner_reports_missing_binary() {
        let err = ProcessRunner
            .run("machina-no-such-tool", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, MachinaError::ExternalCommand { .. }));
    }

    #[tokio::test]
    async fn recording_runner_fails_on_request() {
        let runner = RecordingRunner::new();
        runner.fail("virsh").respond("qemu-img", "ok");
        assert!(runner.run("virsh", &["start".into()]).await.is_err());
        assert_eq!(runner.run("qemu-img", &[]).await.unwrap(), "ok");
        assert_eq!(runner.lines(), vec!["virsh start", "qemu-img"]);
    }
}
