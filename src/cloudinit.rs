//! Guest identity: SSH keypair, cloud-init user-data and the script bundle
//! copied into the guest on first boot.

use std::path::Path;

use facet_value::{VArray, Value, value};
use rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};

use crate::driver::HypervisorKind;
use crate::error::MachinaError;
use crate::spec::MachineSpec;

/// OpenSSH-encoded keypair.
pub struct KeyPair {
    pub private: String,
    pub public: String,
}

pub fn generate_keypair() -> Result<KeyPair, MachinaError> {
    let key_error = |e: ssh_key::Error| MachinaError::Validation {
        message: format!("generating ssh key: {e}"),
    };
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(key_error)?;
    let private = key.to_openssh(LineEnding::LF).map_err(key_error)?;
    let public = key.public_key().to_openssh().map_err(key_error)?;
    Ok(KeyPair {
        private: private.to_string(),
        public,
    })
}

/// `#cloud-config` user-data creating the login user with `public_key`.
pub fn build_user_data(spec: &MachineSpec, public_key: &str) -> Result<String, MachinaError> {
    let creds = &spec.credentials;
    let user = value!({
        "name": (creds.username.as_str()),
        "password": (creds.password.as_str()),
        "ssh_authorized_keys": (Value::from(VArray::from_iter([Value::from(public_key)]))),
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
        "groups": (creds.groups.join(", ").as_str()),
        "home": (format!("/home/{}", creds.username).as_str()),
        "shell": "/bin/bash",
        "lock_passwd": false,
    });

    let config = value!({
        "hostname": (spec.name.as_str()),
        "manage_etc_hosts": true,
        "users": [user],
        "ssh_pwauth": true,
        "disable_root": false,
        "chpasswd": {
            "list": (format!("{0}:{0}", creds.username).as_str()),
            "expire": false,
        },
    });

    let yaml = facet_yaml::to_string(&config).map_err(|e| MachinaError::Validation {
        message: format!("serializing user-data: {e}"),
    })?;
    // cloud-init wants #cloud-config as the very first line
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    Ok(format!("#cloud-config\n{yaml}"))
}

// ── script bundle ─────────────────────────────────────────

const SERVICE_UNIT: &str = "\
[Unit]
Description=machina mount

[Service]
Type=forking
User=machina
Group=machina
ExecStart=/etc/machina/machina
StandardOutput=journal

[Install]
WantedBy=multi-user.target
";

pub struct BundleFile {
    pub name: &'static str,
    pub contents: String,
    pub mode: u32,
}

/// Files staged in `bin/` and copied to `/tmp/machina` in the guest.
pub struct ScriptBundle {
    pub files: Vec<BundleFile>,
}

fn prepare_script(username: &str) -> String {
    format!(
        "#!/bin/bash
sudo mkdir -p /etc/machina/results
sudo mv /tmp/machina/* /etc/machina
echo 'source /etc/machina/machinarc' >> $HOME/.bashrc
sudo chcon -R -t bin_t /etc/machina/machina.service
sudo cp /etc/machina/machina.service /etc/systemd/system/machina.service
sudo chmod 664 /etc/systemd/system/machina.service
sudo systemctl daemon-reload
sudo systemctl enable machina.service
sudo systemctl start machina.service
sudo chown -R {username}:{username} /etc/machina/*
"
    )
}

/// Boot-time script mounting the shared folder. Qemu exposes the share
/// under its mount tag, libvirt under the guest path.
fn mount_script(spec: &MachineSpec, hypervisor: HypervisorKind) -> String {
    let host_path = match hypervisor {
        HypervisorKind::Qemu => &spec.mount.name,
        HypervisorKind::Libvirt => &spec.mount.guest_path,
    };
    format!(
        "#!/bin/bash
HOST_PATH=\"{host_path}\"
GUEST_PATH=\"{guest}\"
if [[ \"$GUEST_PATH\" != \"\" ]]; then
\tmkdir -p $GUEST_PATH
\tsudo mount -t 9p $HOST_PATH $GUEST_PATH
fi

exit 0
",
        guest = spec.mount.guest_path,
    )
}

impl ScriptBundle {
    pub fn build(spec: &MachineSpec, hypervisor: HypervisorKind) -> Self {
        let files = vec![
            BundleFile {
                name: "machina.service",
                contents: SERVICE_UNIT.to_string(),
                mode: 0o744,
            },
            BundleFile {
                name: "prepare.sh",
                contents: prepare_script(&spec.credentials.username),
                mode: 0o744,
            },
            BundleFile {
                name: "install.sh",
                contents: spec.scripts.install.clone(),
                mode: 0o744,
            },
            BundleFile {
                name: "machina",
                contents: mount_script(spec, hypervisor),
                mode: 0o744,
            },
            BundleFile {
                name: "machinarc",
                contents: spec.scripts.init.clone(),
                mode: 0o644,
            },
        ];
        Self { files }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.files
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.contents.as_str())
    }

    /// Write every file into `dir`, creating it.
    pub fn write(&self, dir: &Path) -> Result<(), MachinaError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| MachinaError::io(format!("creating {}", dir.display()), e))?;
        for file in &self.files {
            let path = dir.join(file.name);
            write_with_mode(&path, file.contents.as_bytes(), file.mode)?;
        }
        Ok(())
    }
}

/// Write `data` to `path` and set its permission bits.
pub fn write_with_mode(path: &Path, data: &[u8], mode: u32) -> Result<(), MachinaError> {
    std::fs::write(path, data)
        .map_err(|e| MachinaError::io(format!("writing {}", path.display()), e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| MachinaError::io(format!("setting mode on {}", path.display()), e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}
