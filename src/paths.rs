use std::path::{Path, PathBuf};

/// Root of all machina data: `~/.local/share/machina/`
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("machina")
}

/// Default config file: `~/.config/machina/machina.toml`
pub fn config_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("machina")
        .join("machina.toml")
}

/// Name of the manifest listing a cluster's members.
pub const CLUSTER_MANIFEST: &str = "cluster.yaml";

/// Artifact layout inside a single machine directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachinePaths {
    root: PathBuf,
}

impl MachinePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn disk(&self) -> PathBuf {
        self.root.join("disk.img")
    }

    pub fn seed(&self) -> PathBuf {
        self.root.join("seed.img")
    }

    /// Qemu only.
    pub fn pid(&self) -> PathBuf {
        self.root.join("vm.pid")
    }

    /// Libvirt only.
    pub fn log(&self) -> PathBuf {
        self.root.join("output.log")
    }

    pub fn key(&self) -> PathBuf {
        self.root.join("id_ed25519")
    }

    pub fn network_config(&self) -> PathBuf {
        self.root.join("network.cfg")
    }

    pub fn user_data(&self) -> PathBuf {
        self.root.join("userdata.yaml")
    }

    pub fn descriptor(&self) -> PathBuf {
        self.root.join("instance.yaml")
    }

    /// Transient staging directory for the guest script bundle.
    pub fn bin(&self) -> PathBuf {
        self.root.join("bin")
    }
}
