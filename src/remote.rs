//! ssh / scp / rsync argument construction for a provisioned machine.

use std::path::{Path, PathBuf};

use crate::error::MachinaError;
use crate::spec::MachineSpec;

/// Login destination, `user@ip`.
pub fn destination(spec: &MachineSpec) -> String {
    format!("{}@{}", spec.credentials.username, spec.network.ip_address)
}

/// `ssh` arguments running `command` on the machine, or an interactive
/// login when `command` is `None`.
pub fn ssh_args(spec: &MachineSpec, key: &Path, command: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-i".to_string(),
        key.display().to_string(),
        destination(spec),
    ];
    if let Some(cmd) = command {
        args.push(cmd.to_string());
    }
    args
}

/// Recursive `scp` arguments from `src` to `dst`.
pub fn scp_args(key: &Path, src: &str, dst: &str) -> Vec<String> {
    vec![
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-i".to_string(),
        key.display().to_string(),
        "-r".to_string(),
        src.to_string(),
        dst.to_string(),
    ]
}

/// `rsync -ru` over ssh with the machine key.
pub fn rsync_args(key: &Path, src: &str, dst: &str) -> Vec<String> {
    vec![
        "-ru".to_string(),
        "-e".to_string(),
        format!("ssh -o StrictHostKeyChecking=no -i {}", key.display()),
        src.to_string(),
        dst.to_string(),
    ]
}

/// `<machine>:<path>` on the guest side of a copy.
pub fn remote_path(spec: &MachineSpec, path: &str) -> String {
    format!("{}:{path}", destination(spec))
}

/// Which way a `copy` goes. The argument containing `:` names the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyDirection {
    Upload {
        local: PathBuf,
        machine: String,
        guest: String,
    },
    Download {
        machine: String,
        guest: String,
        local: PathBuf,
    },
}

impl CopyDirection {
    pub fn machine(&self) -> &str {
        match self {
            CopyDirection::Upload { machine, .. } | CopyDirection::Download { machine, .. } => {
                machine
            }
        }
    }
}

fn split_remote(arg: &str) -> Option<(&str, &str)> {
    arg.split_once(':')
}

pub fn parse_copy_args(src: &str, dst: &str) -> Result<CopyDirection, MachinaError> {
    match (split_remote(src), split_remote(dst)) {
        (Some((machine, guest)), None) => Ok(CopyDirection::Download {
            machine: machine.to_string(),
            guest: guest.to_string(),
            local: PathBuf::from(dst),
        }),
        (None, Some((machine, guest))) => Ok(CopyDirection::Upload {
            local: PathBuf::from(src),
            machine: machine.to_string(),
            guest: guest.to_string(),
        }),
        (Some(_), Some(_)) => Err(MachinaError::Validation {
            message: "only one side of a copy may name a machine".into(),
        }),
        (None, None) => Err(MachinaError::Validation {
            message: "one side of a copy must be <machine>:<path>".into(),
        }),
    }
    .and_then(|direction| {
        if direction.machine().is_empty() {
            return Err(MachinaError::Validation {
                message: "missing machine name before ':'".into(),
            });
        }
        Ok(direction)
    })
}
