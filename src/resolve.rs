//! Turns raw template bytes into an effective Machine or Cluster spec,
//! walking `extends` chains through a [`TemplateSource`].

use crate::config::validate_name;
use crate::error::MachinaError;
use crate::spec::{ClusterSpec, KIND_CLUSTER, KIND_MACHINE, KindProbe, MachineSpec};
use crate::template::{TemplateSource, derived_name};
use crate::topology;

/// A fully resolved template. Cluster members are resolved but not yet
/// expanded into replicas.
#[derive(Debug, Clone, PartialEq)]
pub enum Template {
    Machine(MachineSpec),
    Cluster(ClusterSpec),
}

impl Template {
    pub fn name(&self) -> &str {
        match self {
            Template::Machine(m) => &m.name,
            Template::Cluster(c) => &c.name,
        }
    }
}

// ── decoding ──────────────────────────────────────────────

fn utf8<'b>(template: &str, bytes: &'b [u8]) -> Result<&'b str, MachinaError> {
    std::str::from_utf8(bytes).map_err(|e| MachinaError::Parse {
        template: template.into(),
        message: e.to_string(),
    })
}

fn parse_error(template: &str, e: impl std::fmt::Display) -> MachinaError {
    MachinaError::Parse {
        template: template.into(),
        message: e.to_string(),
    }
}

fn decode_kind(template: &str, bytes: &[u8]) -> Result<String, MachinaError> {
    let probe: KindProbe =
        facet_yaml::from_str(utf8(template, bytes)?).map_err(|e| parse_error(template, e))?;
    Ok(probe.kind)
}

fn decode_machine(template: &str, bytes: &[u8]) -> Result<MachineSpec, MachinaError> {
    facet_yaml::from_str(utf8(template, bytes)?).map_err(|e| parse_error(template, e))
}

fn decode_cluster(template: &str, bytes: &[u8]) -> Result<ClusterSpec, MachinaError> {
    facet_yaml::from_str(utf8(template, bytes)?).map_err(|e| parse_error(template, e))
}

fn require_machine_kind(template: &str, kind: &str) -> Result<(), MachinaError> {
    if kind.is_empty() || kind == KIND_MACHINE {
        Ok(())
    } else {
        Err(MachinaError::UnsupportedKind {
            template: template.into(),
            kind: kind.into(),
        })
    }
}

// ── resolver ──────────────────────────────────────────────

pub struct Resolver<'a, S> {
    source: &'a S,
}

impl<'a, S: TemplateSource> Resolver<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// Load `identifier` from the source and resolve it.
    pub async fn load(&self, identifier: &str) -> Result<Template, MachinaError> {
        let bytes = self.source.load(identifier).await?;
        self.resolve(identifier, &bytes).await
    }

    /// Resolve already-loaded template bytes. `identifier` names the template
    /// in errors and supplies its name when the document has none.
    pub async fn resolve(&self, identifier: &str, bytes: &[u8]) -> Result<Template, MachinaError> {
        let kind = decode_kind(identifier, bytes)?;
        match kind.as_str() {
            KIND_MACHINE => {
                let mut spec = decode_machine(identifier, bytes)?;
                if spec.name.is_empty() {
                    spec.name = derived_name(identifier);
                }
                validate_name(&spec.name)?;
                let spec = self.resolve_machine(spec).await?;
                Ok(Template::Machine(spec))
            }
            KIND_CLUSTER => {
                let mut cluster = decode_cluster(identifier, bytes)?;
                if cluster.name.is_empty() {
                    cluster.name = derived_name(identifier);
                }
                validate_name(&cluster.name)?;

                let members = std::mem::take(&mut cluster.machines);
                for member in members {
                    require_machine_kind(&cluster.name, &member.kind)?;
                    if member.name.is_empty() {
                        return Err(MachinaError::Validation {
                            message: format!("cluster '{}' has a member without a name", cluster.name),
                        });
                    }
                    validate_name(&member.name)?;
                    cluster.machines.push(self.resolve_machine(member).await?);
                }
                topology::ensure_unique_names(&cluster.name, &topology::expand(&cluster))?;
                tracing::debug!(
                    cluster = %cluster.name,
                    members = cluster.machines.len(),
                    "resolved cluster template"
                );
                Ok(Template::Cluster(cluster))
            }
            other => Err(MachinaError::UnsupportedKind {
                template: identifier.into(),
                kind: other.into(),
            }),
        }
    }

    /// Merge the `extends` chain into `spec` and normalize units.
    async fn resolve_machine(&self, mut spec: MachineSpec) -> Result<MachineSpec, MachinaError> {
        let mut visited: Vec<String> = Vec::new();

        while !spec.extends.is_empty() {
            let parent = std::mem::take(&mut spec.extends);
            if visited.contains(&parent) {
                visited.push(parent);
                return Err(MachinaError::CyclicExtends {
                    template: spec.name,
                    chain: visited.join(" -> "),
                });
            }
            visited.push(parent.clone());

            let bytes = self.source.load(&parent).await?;
            let mut base = decode_machine(&parent, &bytes)?;
            require_machine_kind(&parent, &base.kind)?;
            tracing::debug!(machine = %spec.name, base = %parent, "merging base template");

            spec.extends = std::mem::take(&mut base.extends);
            base.scripts = Default::default();
            base.mount = Default::default();
            spec.inherit(&base);
        }

        spec.kind = KIND_MACHINE.into();
        // Cluster membership comes from expansion only.
        spec.cluster.clear();
        spec.normalize_units();
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::MemorySource;

    const BASE: &str = r#"
kind: Machine
name: base
image:
  url: https://cloud.example/jammy.img
  checksum: sha256:abcd
credentials:
  username: machina
  password: machina
  groups:
    - admin
resources:
  cpus: 2
  memory: 1g
  disk: 20g
scripts:
  install: echo base-install
mount:
  name: base-share
  hostPath: /srv/base
  guestPath: /mnt/base
variant: ubuntu22.04
"#;

    async fn resolve_with(source: &MemorySource, id: &str) -> Result<Template, MachinaError> {
        Resolver::new(source).load(id).await
    }

    #[tokio::test]
    async fn child_inherits_and_normalizes_memory() {
        let source = MemorySource::new().with("base", BASE).with(
            "web",
            r#"
kind: Machine
name: web
extends: base
mount:
  name: share
  hostPath: /home/me/site
  guestPath: /var/www
"#,
        );
        let Template::Machine(spec) = resolve_with(&source, "web").await.unwrap() else {
            panic!("expected machine");
        };
        assert_eq!(spec.resources.memory, "1G");
        assert_eq!(spec.resources.disk, "20G");
        assert_eq!(spec.resources.cpus, 2);
        assert_eq!(spec.mount.name, "share");
        assert_eq!(spec.mount.host_path, "/home/me/site");
        assert_eq!(spec.scripts.install, "");
        assert_eq!(spec.extends, "");
        assert_eq!(spec.name, "web");
    }

    #[tokio::test]
    async fn multi_hop_chain_keeps_leaf_scripts() {
        let source = MemorySource::new()
            .with("base", BASE)
            .with(
                "mid",
                "kind: Machine\nname: mid\nextends: base\nvariant: debian12\nscripts:\n  init: echo mid\n",
            )
            .with(
                "leaf",
                "kind: Machine\nname: leaf\nextends: mid\nscripts:\n  install: echo leaf\n",
            );
        let Template::Machine(spec) = resolve_with(&source, "leaf").await.unwrap() else {
            panic!("expected machine");
        };
        assert_eq!(spec.variant, "debian12");
        assert_eq!(spec.image.url, "https://cloud.example/jammy.img");
        assert_eq!(spec.scripts.install, "echo leaf");
        assert_eq!(spec.scripts.init, "");
        assert!(!spec.mount.is_set());
        assert_eq!(source.loads(), vec!["leaf", "mid", "base"]);
    }

    #[tokio::test]
    async fn cycle_is_reported() {
        let source = MemorySource::new()
            .with("a", "kind: Machine\nname: a\nextends: b\n")
            .with("b", "kind: Machine\nname: b\nextends: c\n")
            .with("c", "kind: Machine\nname: c\nextends: b\n");
        let err = resolve_with(&source, "a").await.unwrap_err();
        match err {
            MachinaError::CyclicExtends { template, chain } => {
                assert_eq!(template, "a");
                assert_eq!(chain, "b -> c -> b");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_kind_rejected() {
        let source = MemorySource::new().with("odd", "kind: Pod\nname: odd\n");
        let err = resolve_with(&source, "odd").await.unwrap_err();
        assert!(matches!(err, MachinaError::UnsupportedKind { ref kind, .. } if kind == "Pod"));
    }

    #[tokio::test]
    async fn missing_base_is_fetch_error() {
        let source = MemorySource::new().with("web", "kind: Machine\nname: web\nextends: gone\n");
        let err = resolve_with(&source, "web").await.unwrap_err();
        assert!(matches!(err, MachinaError::Fetch { .. }));
    }

    #[tokio::test]
    async fn malformed_yaml_is_parse_error() {
        let source = MemorySource::new().with("bad", "kind: [Machine\n");
        let err = resolve_with(&source, "bad").await.unwrap_err();
        assert!(matches!(err, MachinaError::Parse { ref template, .. } if template == "bad"));
    }

    #[tokio::test]
    async fn unnamed_machine_takes_identifier() {
        let source = MemorySource::new().with("devbox", "kind: Machine\nresources:\n  memory: 512m\n");
        let template = resolve_with(&source, "devbox").await.unwrap();
        assert_eq!(template.name(), "devbox");
    }

    #[tokio::test]
    async fn cluster_members_resolved_without_expansion() {
        let source = MemorySource::new().with("base", BASE).with(
            "site",
            r#"
kind: Cluster
name: site
params:
  domain: example.org
machines:
  - name: web
    extends: base
    replicas: 3
  - name: db
    resources:
      memory: 4g
"#,
        );
        let Template::Cluster(cluster) = resolve_with(&source, "site").await.unwrap() else {
            panic!("expected cluster");
        };
        assert_eq!(cluster.machines.len(), 2);
        assert_eq!(cluster.machines[0].replicas, 3);
        assert_eq!(cluster.machines[0].resources.memory, "1G");
        assert_eq!(cluster.machines[0].kind, KIND_MACHINE);
        assert_eq!(cluster.machines[1].resources.memory, "4G");
        assert_eq!(cluster.params.get("domain").map(String::as_str), Some("example.org"));
    }

    #[tokio::test]
    async fn cluster_member_with_other_kind_rejected() {
        let source = MemorySource::new().with(
            "site",
            "kind: Cluster\nname: site\nmachines:\n  - name: inner\n    kind: Cluster\n",
        );
        let err = resolve_with(&source, "site").await.unwrap_err();
        assert!(matches!(err, MachinaError::UnsupportedKind { .. }));
    }

    #[tokio::test]
    async fn duplicate_member_names_rejected() {
        let source = MemorySource::new().with(
            "site",
            "kind: Cluster\nname: site\nmachines:\n  - name: web\n    replicas: 2\n  - name: web-1\n",
        );
        let err = resolve_with(&source, "site").await.unwrap_err();
        assert!(matches!(err, MachinaError::Validation { .. }), "{err}");
        assert!(err.to_string().contains("site-web-1"));
    }

    #[tokio::test]
    async fn template_cannot_claim_a_cluster() {
        let source = MemorySource::new()
            .with("devbox", "kind: Machine\nname: devbox\ncluster: stolen\n")
            .with(
                "site",
                "kind: Cluster\nname: site\nmachines:\n  - name: web\n    cluster: other\n",
            );
        let Template::Machine(spec) = resolve_with(&source, "devbox").await.unwrap() else {
            panic!("expected machine");
        };
        assert!(spec.cluster.is_empty());
        assert!(!spec.is_clustered());

        let Template::Cluster(cluster) = resolve_with(&source, "site").await.unwrap() else {
            panic!("expected cluster");
        };
        assert!(cluster.machines[0].cluster.is_empty());
        assert_eq!(topology::expand(&cluster)[0].cluster, "site");
    }
}
