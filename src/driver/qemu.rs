use crate::error::MachinaError;
use crate::paths::MachinePaths;
use crate::remote;
use crate::runner::CommandRunner;
use crate::spec::MachineSpec;

use super::convert_memory;

pub const RUNNING: &str = "running";
pub const SHUT_OFF: &str = "shut off";

/// Runs `qemu-system-x86_64` directly, tracking the process by PID file.
#[derive(Debug, Clone)]
pub struct QemuDriver {
    accel: &'static str,
}

impl QemuDriver {
    /// `hvf` on macOS, `kvm` elsewhere.
    pub fn for_host() -> Self {
        let accel = if cfg!(target_os = "macos") { "hvf" } else { "kvm" };
        Self { accel }
    }

    pub fn launch_args(
        &self,
        spec: &MachineSpec,
        paths: &MachinePaths,
    ) -> Result<Vec<String>, MachinaError> {
        let memory = convert_memory(&spec.resources.memory)?;
        let nic = &spec.network.nic_name;

        let mut args: Vec<String> = vec![
            "-machine".into(),
            format!("accel={},type=q35", self.accel),
            "-cpu".into(),
            "host".into(),
            "-smp".into(),
            spec.resources.cpus.max(1).to_string(),
            "-m".into(),
            memory,
            "-nographic".into(),
            "-netdev".into(),
            format!("bridge,id={nic},br=virbr0"),
            "-device".into(),
            format!(
                "virtio-net-pci,netdev={nic},id=virtnet0,mac={}",
                spec.network.mac_address
            ),
            "-pidfile".into(),
            paths.pid().display().to_string(),
            "-drive".into(),
            format!("if=virtio,format=qcow2,file={}", paths.disk().display()),
            "-drive".into(),
            format!("if=virtio,format=raw,file={}", paths.seed().display()),
        ];

        if spec.mount.is_set() {
            args.push("-fsdev".into());
            args.push(format!(
                "local,security_model=passthrough,id=fsdev0,path={}",
                spec.mount.host_path
            ));
            args.push("-device".into());
            args.push(format!(
                "virtio-9p-pci,id=fs0,fsdev=fsdev0,mount_tag={}",
                spec.mount.name
            ));
        }
        Ok(args)
    }

    /// Creating and starting are the same thing for a bare qemu process.
    pub fn start<R: CommandRunner>(
        &self,
        runner: &R,
        spec: &MachineSpec,
        paths: &MachinePaths,
    ) -> Result<(), MachinaError> {
        let args = self.launch_args(spec, paths)?;
        runner.spawn_detached("qemu-system-x86_64", &args, None)?;
        tracing::info!(machine = %spec.name, "qemu launched");
        Ok(())
    }

    /// Guest-initiated shutdown over ssh.
    pub async fn stop<R: CommandRunner>(
        &self,
        runner: &R,
        spec: &MachineSpec,
        paths: &MachinePaths,
    ) -> Result<(), MachinaError> {
        let args = remote::ssh_args(spec, &paths.key(), Some("sudo shutdown now"));
        runner.run("ssh", &args).await?;
        Ok(())
    }

    fn read_pid(paths: &MachinePaths) -> Result<String, MachinaError> {
        let pid_path = paths.pid();
        let contents = std::fs::read_to_string(&pid_path).map_err(|e| {
            MachinaError::io(format!("reading pid file {}", pid_path.display()), e)
        })?;
        let pid = contents.trim();
        if pid.is_empty() || !pid.chars().all(|c| c.is_ascii_digit()) {
            return Err(MachinaError::Validation {
                message: format!("malformed pid file {}", pid_path.display()),
            });
        }
        Ok(pid.to_string())
    }

    /// `kill -9` the recorded PID and drop the PID file. A PID file that
    /// cannot be removed is an error, since status would keep reading it.
    pub async fn force_stop<R: CommandRunner>(
        &self,
        runner: &R,
        paths: &MachinePaths,
    ) -> Result<(), MachinaError> {
        let pid = Self::read_pid(paths)?;
        runner.run("kill", &["-9".to_string(), pid]).await?;
        let pid_path = paths.pid();
        std::fs::remove_file(&pid_path).map_err(|e| {
            tracing::warn!(path = %pid_path.display(), error = %e, "stale pid file left behind");
            MachinaError::io(format!("removing pid file {}", pid_path.display()), e)
        })
    }

    /// Derived from PID-file presence only; a stale file after a crash
    /// still reads as running.
    pub fn status(paths: &MachinePaths) -> String {
        if paths.pid().exists() {
            RUNNING.into()
        } else {
            SHUT_OFF.into()
        }
    }

    /// Kill the process if a PID file is present. Returns the failures.
    pub async fn delete<R: CommandRunner>(&self, runner: &R, paths: &MachinePaths) -> Vec<String> {
        if !paths.pid().exists() {
            return Vec::new();
        }
        match self.force_stop(runner, paths).await {
            Ok(()) => Vec::new(),
            Err(e) => vec![format!("kill: {e}")],
        }
    }
}
