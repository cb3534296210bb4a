use crate::error::MachinaError;
use crate::paths::MachinePaths;
use crate::runner::CommandRunner;
use crate::spec::MachineSpec;

use super::convert_memory;

/// `--os-variant` used when a template does not name one.
const FALLBACK_VARIANT: &str = "generic";

/// Drives `virt-install` and `virsh` against one libvirt connection.
#[derive(Debug, Clone)]
pub struct LibvirtDriver {
    connection: String,
}

impl LibvirtDriver {
    pub fn new(connection: &str) -> Self {
        Self {
            connection: connection.to_string(),
        }
    }

    fn virsh_args(&self, action: &str, target: &str) -> Vec<String> {
        vec![
            "--connect".into(),
            self.connection.clone(),
            action.into(),
            target.into(),
        ]
    }

    pub fn install_args(
        &self,
        spec: &MachineSpec,
        paths: &MachinePaths,
    ) -> Result<Vec<String>, MachinaError> {
        let ram = convert_memory(&spec.resources.memory)?;
        let variant = if spec.variant.is_empty() {
            FALLBACK_VARIANT
        } else {
            &spec.variant
        };

        let mut args: Vec<String> = vec![
            "--connect".into(),
            self.connection.clone(),
            "--virt-type".into(),
            "kvm".into(),
            "--name".into(),
            spec.name.clone(),
            "--ram".into(),
            ram,
            format!("--vcpus={}", spec.resources.cpus.max(1)),
            "--os-variant".into(),
            variant.into(),
            "--disk".into(),
            format!("path={},device=disk", paths.disk().display()),
            "--disk".into(),
            format!("path={},device=disk", paths.seed().display()),
            "--import".into(),
            "--network".into(),
            format!("bridge=virbr0,model=virtio,mac={}", spec.network.mac_address),
            "--noautoconsole".into(),
        ];

        if spec.mount.is_set() {
            args.push("--filesystem".into());
            args.push(format!(
                "type=mount,mode=passthrough,source={},target={}",
                spec.mount.host_path, spec.mount.guest_path
            ));
        }
        Ok(args)
    }

    /// Launch `virt-install` detached, logging to `output.log`.
    pub fn create<R: CommandRunner>(
        &self,
        runner: &R,
        spec: &MachineSpec,
        paths: &MachinePaths,
    ) -> Result<(), MachinaError> {
        let args = self.install_args(spec, paths)?;
        runner.spawn_detached("virt-install", &args, Some(&paths.log()))?;
        tracing::info!(machine = %spec.name, "virt-install launched");
        Ok(())
    }

    pub async fn start<R: CommandRunner>(
        &self,
        runner: &R,
        spec: &MachineSpec,
    ) -> Result<(), MachinaError> {
        runner.run("virsh", &self.virsh_args("start", &spec.name)).await?;
        Ok(())
    }

    pub async fn stop<R: CommandRunner>(
        &self,
        runner: &R,
        spec: &MachineSpec,
    ) -> Result<(), MachinaError> {
        runner.run("virsh", &self.virsh_args("shutdown", &spec.name)).await?;
        Ok(())
    }

    pub async fn force_stop<R: CommandRunner>(
        &self,
        runner: &R,
        spec: &MachineSpec,
    ) -> Result<(), MachinaError> {
        runner.run("virsh", &self.virsh_args("destroy", &spec.name)).await?;
        Ok(())
    }

    pub async fn status<R: CommandRunner>(
        &self,
        runner: &R,
        spec: &MachineSpec,
    ) -> Result<String, MachinaError> {
        let out = runner.run("virsh", &self.virsh_args("domstate", &spec.name)).await?;
        Ok(out.trim().to_string())
    }

    /// destroy, undefine, pool-destroy, pool-undefine. Returns the failures.
    pub async fn delete<R: CommandRunner>(&self, runner: &R, spec: &MachineSpec) -> Vec<String> {
        let mut failures = Vec::new();
        for action in ["destroy", "undefine", "pool-destroy", "pool-undefine"] {
            if let Err(e) = runner.run("virsh", &self.virsh_args(action, &spec.name)).await {
                tracing::debug!(machine = %spec.name, action, error = %e, "virsh step failed");
                failures.push(format!("virsh {action}: {e}"));
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RecordingRunner;
    use crate::spec::{Mount, Network, Resources};

    fn spec() -> MachineSpec {
        MachineSpec {
            name: "web".into(),
            resources: Resources {
                cpus: 2,
                memory: "2G".into(),
                disk: "20G".into(),
            },
            network: Network {
                mac_address: "52:54:00:0a:0b:0c".into(),
                ..Default::default()
            },
            variant: "ubuntu22.04".into(),
            ..Default::default()
        }
    }

    #[test]
    fn install_args_full() {
        let driver = LibvirtDriver::new("qemu:///system");
        let paths = MachinePaths::new("/m/web");
        let args = driver.install_args(&spec(), &paths).unwrap();
        assert_eq!(
            args.join(" "),
            "--connect qemu:///system --virt-type kvm --name web --ram 2048 --vcpus=2 \
             --os-variant ubuntu22.04 --disk path=/m/web/disk.img,device=disk \
             --disk path=/m/web/seed.img,device=disk --import \
             --network bridge=virbr0,model=virtio,mac=52:54:00:0a:0b:0c --noautoconsole"
        );
    }

    #[test]
    fn install_args_with_mount_and_fallback_variant() {
        let driver = LibvirtDriver::new("qemu:///system");
        let mut spec = spec();
        spec.variant.clear();
        spec.mount = Mount {
            name: "share".into(),
            host_path: "/home/me/site".into(),
            guest_path: "/var/www".into(),
        };
        let args = driver.install_args(&spec, &MachinePaths::new("/m/web")).unwrap();
        assert!(args.windows(2).any(|w| w == ["--os-variant", "generic"]));
        assert_eq!(
            &args[args.len() - 2..],
            [
                "--filesystem",
                "type=mount,mode=passthrough,source=/home/me/site,target=/var/www"
            ]
        );
    }

    #[test]
    fn invalid_memory_fails_create() {
        let driver = LibvirtDriver::new("qemu:///system");
        let runner = RecordingRunner::new();
        let mut spec = spec();
        spec.resources.memory = "3X".into();
        let err = driver
            .create(&runner, &spec, &MachinePaths::new("/m/web"))
            .unwrap_err();
        assert!(matches!(err, MachinaError::InvalidResource { .. }));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn create_is_detached() {
        let driver = LibvirtDriver::new("qemu:///system");
        let runner = RecordingRunner::new();
        driver
            .create(&runner, &spec(), &MachinePaths::new("/m/web"))
            .unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "virt-install");
        assert!(calls[0].detached);
    }

    #[tokio::test]
    async fn lifecycle_commands() {
        let driver = LibvirtDriver::new("qemu:///session");
        let runner = RecordingRunner::new();
        runner.respond("virsh", "running\n");
        driver.start(&runner, &spec()).await.unwrap();
        driver.stop(&runner, &spec()).await.unwrap();
        driver.force_stop(&runner, &spec()).await.unwrap();
        assert_eq!(driver.status(&runner, &spec()).await.unwrap(), "running");
        assert_eq!(
            runner.lines(),
            vec![
                "virsh --connect qemu:///session start web",
                "virsh --connect qemu:///session shutdown web",
                "virsh --connect qemu:///session destroy web",
                "virsh --connect qemu:///session domstate web",
            ]
        );
    }

    #[tokio::test]
    async fn delete_attempts_every_step() {
        let driver = LibvirtDriver::new("qemu:///system");
        let runner = RecordingRunner::new();
        runner.fail("virsh");
        let failures = driver.delete(&runner, &spec()).await;
        assert_eq!(failures.len(), 4);
        assert_eq!(runner.calls().len(), 4);
        assert!(failures[0].starts_with("virsh destroy"));
    }
}
