//! The on-disk machine store. A machine directory is the durable record of
//! how far provisioning got.

use std::fmt;
use std::path::{Path, PathBuf};

use facet::Facet;

use crate::config::DirectoriesConfig;
use crate::error::MachinaError;
use crate::paths::{CLUSTER_MANIFEST, MachinePaths};
use crate::spec::MachineSpec;

// ── MachineState ──────────────────────────────────────────

/// How far provisioning progressed, reconstructed from artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MachineState {
    /// No directory yet.
    Defined,
    /// Directory exists, nothing written.
    DirectoryCreated,
    /// Keys, user-data, network config and descriptor written.
    Prepared,
    /// Boot and seed disks exist; scripts still staged.
    DisksReady,
    /// Handed to the hypervisor; scripts still staged.
    Created,
    /// Script bundle delivered and staging removed.
    ScriptsRun,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineState::Defined => "defined",
            MachineState::DirectoryCreated => "directory created",
            MachineState::Prepared => "prepared",
            MachineState::DisksReady => "disks ready",
            MachineState::Created => "created",
            MachineState::ScriptsRun => "provisioned",
        };
        f.write_str(s)
    }
}

pub fn detect_state(paths: &MachinePaths) -> MachineState {
    if !paths.root().is_dir() {
        return MachineState::Defined;
    }
    if !paths.descriptor().exists() {
        return MachineState::DirectoryCreated;
    }
    if !paths.disk().exists() || !paths.seed().exists() {
        return MachineState::Prepared;
    }
    if paths.bin().exists() {
        if paths.log().exists() || paths.pid().exists() {
            return MachineState::Created;
        }
        return MachineState::DisksReady;
    }
    MachineState::ScriptsRun
}

// ── descriptor ────────────────────────────────────────────

pub fn save_descriptor(spec: &MachineSpec, paths: &MachinePaths) -> Result<(), MachinaError> {
    let yaml = facet_yaml::to_string(spec).map_err(|e| MachinaError::Validation {
        message: format!("serializing descriptor for {}: {e}", spec.name),
    })?;
    let path = paths.descriptor();
    std::fs::write(&path, yaml)
        .map_err(|e| MachinaError::io(format!("writing {}", path.display()), e))
}

pub fn load_descriptor(paths: &MachinePaths) -> Result<MachineSpec, MachinaError> {
    let path = paths.descriptor();
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| MachinaError::io(format!("reading {}", path.display()), e))?;
    facet_yaml::from_str(&contents).map_err(|e| MachinaError::Parse {
        template: path.display().to_string(),
        message: e.to_string(),
    })
}

// ── cluster manifest ──────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct ClusterManifest {
    #[facet(default)]
    pub name: String,
    #[facet(default)]
    pub results: String,
    /// Concrete member names in expansion order.
    #[facet(default)]
    pub members: Vec<String>,
}

/// A stored machine: its descriptor and where it lives.
#[derive(Debug, Clone)]
pub struct MachineRecord {
    pub spec: MachineSpec,
    pub paths: MachinePaths,
}

/// What a user-supplied name refers to.
#[derive(Debug, Clone)]
pub enum Located {
    Machine(MachineRecord),
    Cluster {
        manifest: ClusterManifest,
        members: Vec<MachineRecord>,
        /// Members whose directory exists but whose descriptor failed to load.
        unreadable: Vec<String>,
    },
}

impl Located {
    /// Machines in operation order.
    pub fn machines(&self) -> Vec<&MachineRecord> {
        match self {
            Located::Machine(m) => vec![m],
            Located::Cluster { members, .. } => members.iter().collect(),
        }
    }
}

fn subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// Instance and cluster directories from config.
#[derive(Debug, Clone)]
pub struct Workspace {
    instances: PathBuf,
    clusters: PathBuf,
}

impl Workspace {
    pub fn new(dirs: &DirectoriesConfig) -> Self {
        Self {
            instances: dirs.instances(),
            clusters: dirs.clusters(),
        }
    }

    pub fn cluster_dir(&self, cluster: &str) -> PathBuf {
        self.clusters.join(cluster)
    }

    /// `<clusters>/<cluster>/<name>` for members, `<instances>/<name>` otherwise.
    pub fn paths_for(&self, spec: &MachineSpec) -> MachinePaths {
        if spec.is_clustered() {
            MachinePaths::new(self.cluster_dir(&spec.cluster).join(&spec.name))
        } else {
            MachinePaths::new(self.instances.join(&spec.name))
        }
    }

    pub fn save_manifest(&self, manifest: &ClusterManifest) -> Result<(), MachinaError> {
        let dir = self.cluster_dir(&manifest.name);
        std::fs::create_dir_all(&dir)
            .map_err(|e| MachinaError::io(format!("creating {}", dir.display()), e))?;
        let yaml = facet_yaml::to_string(manifest).map_err(|e| MachinaError::Validation {
            message: format!("serializing cluster manifest: {e}"),
        })?;
        let path = dir.join(CLUSTER_MANIFEST);
        std::fs::write(&path, yaml)
            .map_err(|e| MachinaError::io(format!("writing {}", path.display()), e))
    }

    fn load_manifest(&self, cluster: &str) -> Option<ClusterManifest> {
        let path = self.cluster_dir(cluster).join(CLUSTER_MANIFEST);
        let contents = std::fs::read_to_string(path).ok()?;
        facet_yaml::from_str(&contents).ok()
    }

    fn record(paths: MachinePaths) -> Result<MachineRecord, MachinaError> {
        let spec = load_descriptor(&paths)?;
        Ok(MachineRecord { spec, paths })
    }

    /// Load every member in manifest order. Members never created are
    /// skipped; members on disk with a broken descriptor are reported.
    fn cluster_members(&self, manifest: &ClusterManifest) -> (Vec<MachineRecord>, Vec<String>) {
        let dir = self.cluster_dir(&manifest.name);
        let mut members = Vec::new();
        let mut unreadable = Vec::new();
        for name in &manifest.members {
            let paths = MachinePaths::new(dir.join(name));
            if !paths.root().is_dir() {
                continue;
            }
            match Self::record(paths) {
                Ok(record) => members.push(record),
                Err(e) => {
                    tracing::warn!(cluster = %manifest.name, machine = %name, error = %e, "unreadable member");
                    unreadable.push(format!("{name}: {e}"));
                }
            }
        }
        (members, unreadable)
    }

    /// Resolve `name` to a single machine, a cluster member, or a whole cluster.
    pub fn locate(&self, name: &str) -> Result<Located, MachinaError> {
        let single = MachinePaths::new(self.instances.join(name));
        if single.descriptor().exists() {
            return Ok(Located::Machine(Self::record(single)?));
        }

        if let Some(manifest) = self.load_manifest(name) {
            let (members, unreadable) = self.cluster_members(&manifest);
            return Ok(Located::Cluster {
                manifest,
                members,
                unreadable,
            });
        }

        for cluster_dir in subdirs(&self.clusters) {
            let member = MachinePaths::new(cluster_dir.join(name));
            if member.descriptor().exists() {
                return Ok(Located::Machine(Self::record(member)?));
            }
        }

        Err(MachinaError::NotFound { name: name.into() })
    }

    /// Every stored machine: single instances first, then cluster members.
    pub fn all_machines(&self) -> Vec<MachineRecord> {
        let mut records: Vec<MachineRecord> = subdirs(&self.instances)
            .into_iter()
            .filter_map(|dir| Self::record(MachinePaths::new(dir)).ok())
            .collect();

        for cluster_dir in subdirs(&self.clusters) {
            let Some(name) = cluster_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match self.load_manifest(name) {
                Some(manifest) => records.extend(self.cluster_members(&manifest).0),
                None => records.extend(
                    subdirs(&cluster_dir)
                        .into_iter()
                        .filter_map(|dir| Self::record(MachinePaths::new(dir)).ok()),
                ),
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::spec::{Network, Resources};

    fn spec(name: &str, cluster: &str) -> MachineSpec {
        MachineSpec {
            kind: "Machine".into(),
            name: name.into(),
            cluster: cluster.into(),
            resources: Resources {
                cpus: 2,
                memory: "1G".into(),
                disk: "10G".into(),
            },
            network: Network {
                ip_address: "192.168.122.10".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn store(ws: &Workspace, spec: &MachineSpec) -> MachinePaths {
        let paths = ws.paths_for(spec);
        std::fs::create_dir_all(paths.root()).unwrap();
        save_descriptor(spec, &paths).unwrap();
        paths
    }

    #[test]
    fn descriptor_round_trip_keeps_network_and_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let paths = MachinePaths::new(dir.path());
        let original = spec("site-web-1", "site");
        save_descriptor(&original, &paths).unwrap();
        assert_eq!(load_descriptor(&paths).unwrap(), original);
    }

    #[test]
    fn state_follows_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let paths = MachinePaths::new(dir.path().join("web"));
        assert_eq!(detect_state(&paths), MachineState::Defined);

        std::fs::create_dir_all(paths.root()).unwrap();
        assert_eq!(detect_state(&paths), MachineState::DirectoryCreated);

        save_descriptor(&spec("web", ""), &paths).unwrap();
        std::fs::create_dir_all(paths.bin()).unwrap();
        assert_eq!(detect_state(&paths), MachineState::Prepared);

        std::fs::write(paths.disk(), b"").unwrap();
        std::fs::write(paths.seed(), b"").unwrap();
        assert_eq!(detect_state(&paths), MachineState::DisksReady);

        std::fs::write(paths.log(), b"").unwrap();
        assert_eq!(detect_state(&paths), MachineState::Created);

        std::fs::remove_dir_all(paths.bin()).unwrap();
        assert_eq!(detect_state(&paths), MachineState::ScriptsRun);
        assert!(MachineState::ScriptsRun > MachineState::DisksReady);
    }

    #[test]
    fn locate_single_member_and_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(&test_config(dir.path()).directories);

        store(&ws, &spec("devbox", ""));
        store(&ws, &spec("site-web-1", "site"));
        store(&ws, &spec("site-web-2", "site"));
        ws.save_manifest(&ClusterManifest {
            name: "site".into(),
            results: "site".into(),
            members: vec!["site-web-1".into(), "site-web-2".into()],
        })
        .unwrap();

        assert!(matches!(ws.locate("devbox").unwrap(), Located::Machine(ref m) if m.spec.name == "devbox"));
        assert!(matches!(ws.locate("site-web-2").unwrap(), Located::Machine(ref m) if m.spec.cluster == "site"));

        let Located::Cluster {
            manifest,
            members,
            unreadable,
        } = ws.locate("site").unwrap()
        else {
            panic!("expected cluster");
        };
        assert_eq!(manifest.members.len(), 2);
        assert!(unreadable.is_empty());
        let names: Vec<_> = members.iter().map(|m| m.spec.name.as_str()).collect();
        assert_eq!(names, vec!["site-web-1", "site-web-2"]);

        assert!(matches!(ws.locate("ghost"), Err(MachinaError::NotFound { .. })));
    }

    #[test]
    fn corrupt_member_is_reported_not_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(&test_config(dir.path()).directories);
        let broken = store(&ws, &spec("site-web-1", "site"));
        store(&ws, &spec("site-web-2", "site"));
        ws.save_manifest(&ClusterManifest {
            name: "site".into(),
            results: "site".into(),
            members: vec!["site-web-1".into(), "site-web-2".into(), "site-web-3".into()],
        })
        .unwrap();
        std::fs::write(broken.descriptor(), "resources: [not, a, map\n").unwrap();

        let Located::Cluster {
            members, unreadable, ..
        } = ws.locate("site").unwrap()
        else {
            panic!("expected cluster");
        };
        let names: Vec<_> = members.iter().map(|m| m.spec.name.as_str()).collect();
        assert_eq!(names, vec!["site-web-2"]);
        assert_eq!(unreadable.len(), 1);
        assert!(unreadable[0].starts_with("site-web-1: "));
    }

    #[test]
    fn all_machines_lists_instances_then_members() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(&test_config(dir.path()).directories);
        store(&ws, &spec("b-box", ""));
        store(&ws, &spec("a-box", ""));
        store(&ws, &spec("site-db", "site"));
        ws.save_manifest(&ClusterManifest {
            name: "site".into(),
            results: String::new(),
            members: vec!["site-db".into()],
        })
        .unwrap();

        let names: Vec<_> = ws
            .all_machines()
            .into_iter()
            .map(|m| m.spec.name)
            .collect();
        assert_eq!(names, vec!["a-box", "b-box", "site-db"]);
    }
}
