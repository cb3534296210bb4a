//! Cluster fan-out: one concrete machine per member replica.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::MachinaError;
use crate::spec::{ClusterSpec, MachineSpec};

/// Replace `{{ key }}` (inner whitespace optional) with each param value.
fn substitute(text: &str, params: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start..].find("}}") else {
            break;
        };
        let key = rest[start + 2..start + len].trim();
        out.push_str(&rest[..start]);
        match params.get(key) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + len + 2]),
        }
        rest = &rest[start + len + 2..];
    }
    out.push_str(rest);
    out
}

/// Concrete machines in member order, then replica order. Names are
/// `<cluster>-<member>`, with a 1-based `-<i>` suffix when replicas > 1.
pub fn expand(cluster: &ClusterSpec) -> Vec<MachineSpec> {
    let mut machines = Vec::new();
    for member in &cluster.machines {
        let replicas = member.replicas.max(1);
        for i in 0..replicas {
            let mut machine = member.clone();
            machine.name = if replicas > 1 {
                format!("{}-{}-{}", cluster.name, member.name, i + 1)
            } else {
                format!("{}-{}", cluster.name, member.name)
            };
            machine.replicas = 1;
            machine.cluster = cluster.name.clone();
            if !cluster.params.is_empty() {
                machine.scripts.install = substitute(&machine.scripts.install, &cluster.params);
                machine.scripts.init = substitute(&machine.scripts.init, &cluster.params);
            }
            machines.push(machine);
        }
    }
    machines
}

/// Fail when two expanded machines share a name, e.g. member `web` with two
/// replicas next to a member called `web-1`.
pub fn ensure_unique_names(cluster: &str, machines: &[MachineSpec]) -> Result<(), MachinaError> {
    let mut seen = BTreeSet::new();
    for machine in machines {
        if !seen.insert(machine.name.as_str()) {
            return Err(MachinaError::Validation {
                message: format!(
                    "cluster '{cluster}' expands to machine '{}' more than once",
                    machine.name
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, replicas: u32) -> MachineSpec {
        MachineSpec {
            name: name.into(),
            replicas,
            ..Default::default()
        }
    }

    fn names(machines: &[MachineSpec]) -> Vec<&str> {
        machines.iter().map(|m| m.name.as_str()).collect()
    }

    #[test]
    fn replicas_get_numbered_suffixes() {
        let cluster = ClusterSpec {
            name: "site".into(),
            machines: vec![member("web", 3)],
            ..Default::default()
        };
        assert_eq!(
            names(&expand(&cluster)),
            vec!["site-web-1", "site-web-2", "site-web-3"]
        );
    }

    #[test]
    fn single_replica_has_no_suffix() {
        for replicas in [0, 1] {
            let cluster = ClusterSpec {
                name: "site".into(),
                machines: vec![member("db", replicas)],
                ..Default::default()
            };
            assert_eq!(names(&expand(&cluster)), vec!["site-db"]);
        }
    }

    #[test]
    fn member_order_then_replica_order() {
        let cluster = ClusterSpec {
            name: "k8s".into(),
            machines: vec![member("control", 1), member("worker", 2)],
            ..Default::default()
        };
        let machines = expand(&cluster);
        assert_eq!(
            names(&machines),
            vec!["k8s-control", "k8s-worker-1", "k8s-worker-2"]
        );
        assert!(machines.iter().all(|m| m.cluster == "k8s"));
    }

    #[test]
    fn params_fill_member_scripts() {
        let mut web = member("web", 1);
        web.scripts.install = "echo {{ domain }} {{port}} {{ missing }}".into();
        let cluster = ClusterSpec {
            name: "site".into(),
            machines: vec![web],
            params: BTreeMap::from([
                ("domain".to_string(), "example.org".to_string()),
                ("port".to_string(), "8080".to_string()),
            ]),
            ..Default::default()
        };
        let machines = expand(&cluster);
        assert_eq!(machines[0].scripts.install, "echo example.org 8080 {{ missing }}");
    }

    #[test]
    fn colliding_expansions_rejected() {
        let cluster = ClusterSpec {
            name: "site".into(),
            machines: vec![member("web", 2), member("web-1", 1)],
            ..Default::default()
        };
        let err = ensure_unique_names(&cluster.name, &expand(&cluster)).unwrap_err();
        assert!(err.to_string().contains("'site-web-1' more than once"), "{err}");

        let cluster = ClusterSpec {
            name: "site".into(),
            machines: vec![member("web", 2), member("db", 1)],
            ..Default::default()
        };
        assert!(ensure_unique_names(&cluster.name, &expand(&cluster)).is_ok());
    }
}
