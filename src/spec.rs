//! Declarative machine and cluster descriptions as they appear in templates
//! and in the persisted `instance.yaml` descriptor.

use std::collections::BTreeMap;

use facet::Facet;

pub const KIND_MACHINE: &str = "Machine";
pub const KIND_CLUSTER: &str = "Cluster";

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct MachineSpec {
    #[facet(default)]
    pub kind: String,
    #[facet(default)]
    pub name: String,
    #[facet(default)]
    pub extends: String,
    #[facet(default)]
    pub replicas: u32,
    #[facet(default)]
    pub image: Image,
    #[facet(default)]
    pub credentials: Credentials,
    #[facet(default)]
    pub resources: Resources,
    #[facet(default)]
    pub scripts: Scripts,
    #[facet(default)]
    pub mount: Mount,
    #[facet(default)]
    pub network: Network,
    #[facet(default)]
    pub connection: String,
    #[facet(default)]
    pub variant: String,
    /// Owning cluster, empty for single machines.
    #[facet(default)]
    pub cluster: String,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct Image {
    #[facet(default)]
    pub url: String,
    /// `algorithm:hexdigest`
    #[facet(default)]
    pub checksum: String,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct Credentials {
    #[facet(default)]
    pub username: String,
    #[facet(default)]
    pub password: String,
    #[facet(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct Resources {
    #[facet(default)]
    pub cpus: u32,
    #[facet(default)]
    pub memory: String,
    #[facet(default)]
    pub disk: String,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct Scripts {
    #[facet(default)]
    pub install: String,
    #[facet(default)]
    pub init: String,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct Mount {
    #[facet(default)]
    pub name: String,
    #[facet(default, rename = "hostPath")]
    pub host_path: String,
    #[facet(default, rename = "guestPath")]
    pub guest_path: String,
}

impl Mount {
    pub fn is_set(&self) -> bool {
        !self.name.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct Network {
    #[facet(default, rename = "nicName")]
    pub nic_name: String,
    #[facet(default, rename = "ipAddress")]
    pub ip_address: String,
    #[facet(default)]
    pub gateway: String,
    #[facet(default, rename = "macAddress")]
    pub mac_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct ClusterSpec {
    #[facet(default)]
    pub kind: String,
    #[facet(default)]
    pub name: String,
    #[facet(default)]
    pub machines: Vec<MachineSpec>,
    /// Substituted into member scripts as `{{ key }}`.
    #[facet(default)]
    pub params: BTreeMap<String, String>,
    /// Results subdirectory name; the cluster name when empty.
    #[facet(default)]
    pub results: String,
}

impl ClusterSpec {
    pub fn results_name(&self) -> &str {
        if self.results.is_empty() {
            &self.name
        } else {
            &self.results
        }
    }
}

/// Only the discriminator, decoded before the concrete type is chosen.
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct KindProbe {
    #[facet(default)]
    pub kind: String,
}

fn fill(slot: &mut String, base: &str) {
    if slot.is_empty() {
        slot.push_str(base);
    }
}

impl MachineSpec {
    /// Fill every unset field from `base`. Scripts and mount are never taken
    /// from a base; the child's own values always stand.
    pub fn inherit(&mut self, base: &MachineSpec) {
        fill(&mut self.kind, &base.kind);
        fill(&mut self.name, &base.name);
        if self.replicas == 0 {
            self.replicas = base.replicas;
        }

        fill(&mut self.image.url, &base.image.url);
        fill(&mut self.image.checksum, &base.image.checksum);

        fill(&mut self.credentials.username, &base.credentials.username);
        fill(&mut self.credentials.password, &base.credentials.password);
        if self.credentials.groups.is_empty() {
            self.credentials.groups = base.credentials.groups.clone();
        }

        if self.resources.cpus == 0 {
            self.resources.cpus = base.resources.cpus;
        }
        fill(&mut self.resources.memory, &base.resources.memory);
        fill(&mut self.resources.disk, &base.resources.disk);

        fill(&mut self.network.nic_name, &base.network.nic_name);
        fill(&mut self.network.ip_address, &base.network.ip_address);
        fill(&mut self.network.gateway, &base.network.gateway);
        fill(&mut self.network.mac_address, &base.network.mac_address);

        fill(&mut self.connection, &base.connection);
        fill(&mut self.variant, &base.variant);
    }

    /// Upper-case the memory and disk sizes so `2g` and `2G` compare equal.
    pub fn normalize_units(&mut self) {
        self.resources.memory = self.resources.memory.to_uppercase();
        self.resources.disk = self.resources.disk.to_uppercase();
    }

    pub fn is_clustered(&self) -> bool {
        !self.cluster.is_empty()
    }
}
