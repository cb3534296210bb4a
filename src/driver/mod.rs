//! Hypervisor backends. Each turns a [`MachineSpec`] into the command
//! invocations of one toolchain.

pub mod libvirt;
pub mod qemu;

use std::fmt;
use std::str::FromStr;

use crate::config::Config;
use crate::error::MachinaError;
use crate::paths::MachinePaths;
use crate::runner::CommandRunner;
use crate::spec::MachineSpec;

pub use libvirt::LibvirtDriver;
pub use qemu::QemuDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorKind {
    Libvirt,
    Qemu,
}

impl HypervisorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HypervisorKind::Libvirt => "libvirt",
            HypervisorKind::Qemu => "qemu",
        }
    }
}

impl fmt::Display for HypervisorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HypervisorKind {
    type Err = MachinaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "libvirt" => Ok(HypervisorKind::Libvirt),
            "qemu" => Ok(HypervisorKind::Qemu),
            other => Err(MachinaError::Validation {
                message: format!("hypervisor must be 'libvirt' or 'qemu' (got '{other}')"),
            }),
        }
    }
}

/// Memory in MB for the hypervisor: `G` multiplies by 1024, `M` or a bare
/// number passes through, anything else is rejected.
pub fn convert_memory(memory: &str) -> Result<String, MachinaError> {
    let invalid = || MachinaError::InvalidResource {
        field: "memory".into(),
        value: memory.into(),
    };
    let (digits, factor) = if let Some(n) = memory.strip_suffix('G') {
        (n, 1024)
    } else if let Some(n) = memory.strip_suffix('M') {
        (n, 1)
    } else {
        (memory, 1)
    };
    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    let mb = amount.checked_mul(factor).ok_or_else(invalid)?;
    Ok(mb.to_string())
}

/// The backend bound to this process, chosen once from config.
#[derive(Debug, Clone)]
pub enum Driver {
    Libvirt(LibvirtDriver),
    Qemu(QemuDriver),
}

impl Driver {
    pub fn from_config(config: &Config) -> Result<Self, MachinaError> {
        Ok(match config.hypervisor_kind()? {
            HypervisorKind::Libvirt => Driver::Libvirt(LibvirtDriver::new(&config.connection)),
            HypervisorKind::Qemu => Driver::Qemu(QemuDriver::for_host()),
        })
    }

    pub fn kind(&self) -> HypervisorKind {
        match self {
            Driver::Libvirt(_) => HypervisorKind::Libvirt,
            Driver::Qemu(_) => HypervisorKind::Qemu,
        }
    }

    pub async fn create<R: CommandRunner>(
        &self,
        runner: &R,
        spec: &MachineSpec,
        paths: &MachinePaths,
    ) -> Result<(), MachinaError> {
        match self {
            Driver::Libvirt(d) => d.create(runner, spec, paths),
            Driver::Qemu(d) => d.start(runner, spec, paths),
        }
    }

    pub async fn start<R: CommandRunner>(
        &self,
        runner: &R,
        spec: &MachineSpec,
        paths: &MachinePaths,
    ) -> Result<(), MachinaError> {
        match self {
            Driver::Libvirt(d) => d.start(runner, spec).await,
            Driver::Qemu(d) => d.start(runner, spec, paths),
        }
    }

    pub async fn stop<R: CommandRunner>(
        &self,
        runner: &R,
        spec: &MachineSpec,
        paths: &MachinePaths,
    ) -> Result<(), MachinaError> {
        match self {
            Driver::Libvirt(d) => d.stop(runner, spec).await,
            Driver::Qemu(d) => d.stop(runner, spec, paths).await,
        }
    }

    pub async fn force_stop<R: CommandRunner>(
        &self,
        runner: &R,
        spec: &MachineSpec,
        paths: &MachinePaths,
    ) -> Result<(), MachinaError> {
        match self {
            Driver::Libvirt(d) => d.force_stop(runner, spec).await,
            Driver::Qemu(d) => d.force_stop(runner, paths).await,
        }
    }

    pub async fn status<R: CommandRunner>(
        &self,
        runner: &R,
        spec: &MachineSpec,
        paths: &MachinePaths,
    ) -> Result<String, MachinaError> {
        match self {
            Driver::Libvirt(d) => d.status(runner, spec).await,
            Driver::Qemu(_) => Ok(QemuDriver::status(paths)),
        }
    }

    /// Remove the machine from the hypervisor. Every sub-step is attempted;
    /// failures come back together as `Teardown`.
    pub async fn delete<R: CommandRunner>(
        &self,
        runner: &R,
        spec: &MachineSpec,
        paths: &MachinePaths,
    ) -> Result<(), MachinaError> {
        let failures = match self {
            Driver::Libvirt(d) => d.delete(runner, spec).await,
            Driver::Qemu(d) => d.delete(runner, paths).await,
        };
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MachinaError::Teardown {
                name: spec.name.clone(),
                failures,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_conversion() {
        assert_eq!(convert_memory("2G").unwrap(), "2048");
        assert_eq!(convert_memory("512M").unwrap(), "512");
        assert_eq!(convert_memory("1024").unwrap(), "1024");
        assert!(matches!(
            convert_memory("3X"),
            Err(MachinaError::InvalidResource { .. })
        ));
        assert!(convert_memory("").is_err());
        assert!(convert_memory("G").is_err());
    }

    #[test]
    fn hypervisor_names() {
        assert_eq!("libvirt".parse::<HypervisorKind>().unwrap(), HypervisorKind::Libvirt);
        assert_eq!("qemu".parse::<HypervisorKind>().unwrap(), HypervisorKind::Qemu);
        assert!("vbox".parse::<HypervisorKind>().is_err());
        assert_eq!(HypervisorKind::Qemu.to_string(), "qemu");
    }
}
