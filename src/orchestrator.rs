//! Drives machines through provisioning and teardown.
//!
//! Every operation runs sequentially; cluster-wide operations follow the
//! expansion order in both directions. Hypervisor-specific work goes to the
//! bound [`Driver`], process execution to the [`CommandRunner`].

use std::path::PathBuf;

use rand_core::OsRng;

use crate::cloudinit::{self, ScriptBundle};
use crate::config::Config;
use crate::driver::Driver;
use crate::error::MachinaError;
use crate::fetch::HttpFetch;
use crate::image;
use crate::machine::{self, ClusterManifest, Located, MachineRecord, MachineState, Workspace};
use crate::network;
use crate::paths::MachinePaths;
use crate::probe::Prober;
use crate::progress::StepProgress;
use crate::remote::{self, CopyDirection};
use crate::resolve::{Resolver, Template};
use crate::runner::CommandRunner;
use crate::spec::MachineSpec;
use crate::template::TemplateStore;
use crate::topology;

/// Lifecycle steps a single machine passes through on `create`.
pub const PROVISION_STEPS: usize = 7;

/// Concrete machines to provision, plus the cluster they form.
#[derive(Debug, Clone)]
pub struct Plan {
    pub machines: Vec<MachineSpec>,
    pub cluster: Option<ClusterManifest>,
}

impl Plan {
    /// Results subdirectory for cluster runs.
    pub fn results(&self) -> Option<&str> {
        self.cluster.as_ref().map(|c| c.results.as_str())
    }
}

/// How one machine's provisioning ended.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub spec: MachineSpec,
    /// The readiness wait timed out; later steps were still attempted.
    pub stuck: bool,
}

pub struct Orchestrator<R, F> {
    config: Config,
    driver: Driver,
    workspace: Workspace,
    prober: Prober,
    runner: R,
    fetcher: F,
}

impl<R: CommandRunner, F: HttpFetch> Orchestrator<R, F> {
    pub fn new(config: Config, runner: R, fetcher: F) -> Result<Self, MachinaError> {
        let driver = Driver::from_config(&config)?;
        let workspace = Workspace::new(&config.directories);
        let prober = Prober::new(&config.probe);
        Ok(Self {
            config,
            driver,
            workspace,
            prober,
            runner,
            fetcher,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn templates(&self) -> TemplateStore<'_, F> {
        TemplateStore::new(&self.config.catalog, &self.fetcher)
    }

    // ── planning ──────────────────────────────────────────

    pub async fn load_template(&self, identifier: &str) -> Result<Template, MachinaError> {
        let store = self.templates();
        Resolver::new(&store).load(identifier).await
    }

    /// Expand a resolved template into the machines `create` will build.
    pub fn plan(&self, template: Template) -> Plan {
        match template {
            Template::Machine(spec) => Plan {
                machines: vec![spec],
                cluster: None,
            },
            Template::Cluster(cluster) => {
                let machines = topology::expand(&cluster);
                let manifest = ClusterManifest {
                    name: cluster.name.clone(),
                    results: cluster.results_name().to_string(),
                    members: machines.iter().map(|m| m.name.clone()).collect(),
                };
                Plan {
                    machines,
                    cluster: Some(manifest),
                }
            }
        }
    }

    // ── provisioning steps ────────────────────────────────

    /// Create the machine directory. An existing one is never reused.
    pub fn create_dir(&self, spec: &MachineSpec) -> Result<MachinePaths, MachinaError> {
        let paths = self.workspace.paths_for(spec);
        if paths.root().exists() {
            return Err(MachinaError::AlreadyExists {
                name: spec.name.clone(),
            });
        }
        std::fs::create_dir_all(paths.root())
            .map_err(|e| MachinaError::io(format!("creating {}", paths.root().display()), e))?;
        tracing::debug!(machine = %spec.name, dir = %paths.root().display(), "created machine directory");
        Ok(paths)
    }

    /// Generate network identity and keys, write every artifact and stage
    /// the guest script bundle.
    pub fn prepare(&self, spec: &mut MachineSpec, paths: &MachinePaths) -> Result<(), MachinaError> {
        spec.network = network::generate(&mut OsRng);
        let netplan = network::netplan(&spec.network)?;
        std::fs::write(paths.network_config(), netplan)
            .map_err(|e| MachinaError::io("writing network config", e))?;

        let keys = cloudinit::generate_keypair()?;
        let user_data = cloudinit::build_user_data(spec, &keys.public)?;
        std::fs::write(paths.user_data(), user_data)
            .map_err(|e| MachinaError::io("writing user-data", e))?;
        cloudinit::write_with_mode(&paths.key(), keys.private.as_bytes(), 0o600)?;

        ScriptBundle::build(spec, self.driver.kind()).write(&paths.bin())?;
        machine::save_descriptor(spec, paths)?;

        tracing::info!(
            machine = %spec.name,
            ip = %spec.network.ip_address,
            mac = %spec.network.mac_address,
            "prepared machine"
        );
        Ok(())
    }

    /// Fetch the base image unless a local copy already has the checksum.
    pub async fn download_image(&self, spec: &MachineSpec) -> Result<PathBuf, MachinaError> {
        image::ensure_image(
            &spec.image.url,
            &spec.image.checksum,
            &self.config.directories.images(),
            &self.fetcher,
        )
        .await
    }

    /// Copy-on-write boot disk over the base image plus the cloud-init seed.
    pub async fn create_disks(
        &self,
        spec: &MachineSpec,
        paths: &MachinePaths,
    ) -> Result<(), MachinaError> {
        let base = self
            .config
            .directories
            .images()
            .join(image::filename_from_url(&spec.image.url)?);

        let mut args: Vec<String> = vec![
            "create".into(),
            "-F".into(),
            "qcow2".into(),
            "-b".into(),
            base.display().to_string(),
            "-f".into(),
            "qcow2".into(),
            paths.disk().display().to_string(),
        ];
        if !spec.resources.disk.is_empty() {
            args.push(spec.resources.disk.clone());
        }
        self.runner.run("qemu-img", &args).await?;

        let seed_args = vec![
            format!("--network-config={}", paths.network_config().display()),
            paths.seed().display().to_string(),
            paths.user_data().display().to_string(),
        ];
        self.runner.run("cloud-localds", &seed_args).await?;
        Ok(())
    }

    pub async fn create(&self, spec: &MachineSpec, paths: &MachinePaths) -> Result<(), MachinaError> {
        self.driver.create(&self.runner, spec, paths).await
    }

    /// Wait until the machine's ssh port answers. Ctrl-C cancels.
    pub async fn wait(&self, spec: &MachineSpec) -> Result<(), MachinaError> {
        tokio::select! {
            result = self.prober.wait(&spec.name, &spec.network.ip_address) => result,
            _ = tokio::signal::ctrl_c() => Err(MachinaError::Cancelled {
                name: spec.name.clone(),
            }),
        }
    }

    /// Deliver the script bundle, run prepare and install in the guest,
    /// sync cluster results both ways, then drop the staging directory.
    pub async fn run_init_scripts(
        &self,
        spec: &MachineSpec,
        paths: &MachinePaths,
        results: Option<&str>,
    ) -> Result<(), MachinaError> {
        let key = paths.key();
        let bin = format!("{}/", paths.bin().display());

        self.runner
            .run("scp", &remote::scp_args(&key, &bin, &remote::remote_path(spec, "/tmp/machina")))
            .await?;
        self.runner
            .run("ssh", &remote::ssh_args(spec, &key, Some("/tmp/machina/prepare.sh")))
            .await?;

        let local_results = results.map(|name| self.config.directories.results().join(name));
        if let Some(ref dir) = local_results {
            std::fs::create_dir_all(dir)
                .map_err(|e| MachinaError::io(format!("creating {}", dir.display()), e))?;
            let dir_arg = dir.display().to_string();
            self.runner
                .run("chmod", &["-R".into(), "+x".into(), dir_arg.clone()])
                .await?;
            self.runner
                .run(
                    "rsync",
                    &remote::rsync_args(&key, &dir_arg, &remote::remote_path(spec, "/etc/machina/results")),
                )
                .await?;
        }

        self.runner
            .run("ssh", &remote::ssh_args(spec, &key, Some("/etc/machina/install.sh")))
            .await?;

        if let Some(name) = results {
            let src = remote::remote_path(spec, &format!("/etc/machina/results/{name}"));
            let dst = self.config.directories.results().display().to_string();
            self.runner
                .run("rsync", &remote::rsync_args(&key, &src, &dst))
                .await?;
        }

        std::fs::remove_dir_all(paths.bin())
            .map_err(|e| MachinaError::io(format!("removing {}", paths.bin().display()), e))?;
        tracing::info!(machine = %spec.name, "init scripts complete");
        Ok(())
    }

    /// Run the full pipeline for one machine. A readiness timeout is
    /// reported through `stuck`, not as an error.
    pub async fn provision(
        &self,
        mut spec: MachineSpec,
        results: Option<&str>,
        progress: &mut StepProgress,
    ) -> Result<Provisioned, MachinaError> {
        let owned_name = spec.name.clone();
        let name = owned_name.as_str();
        let step = |step: &'static str| move |e: MachinaError| e.in_step(name, step);

        let paths = progress
            .run(&format!("{name}: creating directory"), |_| {
                std::future::ready(self.create_dir(&spec))
            })
            .await
            .map_err(step("create directory"))?;

        progress
            .run(&format!("{name}: preparing"), |_| {
                std::future::ready(self.prepare(&mut spec, &paths))
            })
            .await
            .map_err(step("prepare"))?;

        let machine = &spec;
        let paths = &paths;

        progress
            .run(&format!("{name}: fetching image"), |s| async move {
                let image = self.download_image(machine).await?;
                s.set_done_label(format!("{name}: image {}", image.display()));
                Ok::<(), MachinaError>(())
            })
            .await
            .map_err(step("download image"))?;

        progress
            .run(&format!("{name}: creating disks"), |_| {
                self.create_disks(machine, paths)
            })
            .await
            .map_err(step("create disks"))?;

        progress
            .run(&format!("{name}: creating machine"), |_| {
                self.create(machine, paths)
            })
            .await
            .map_err(step("create"))?;

        let waited = progress
            .run(&format!("{name}: waiting for ssh"), |_| self.wait(machine))
            .await;
        let stuck = match waited {
            Ok(()) => false,
            Err(e) if e.is_timeout() => {
                tracing::warn!(machine = %name, "readiness wait timed out");
                progress.info(&format!("{name} appears to be stuck, continuing"));
                true
            }
            Err(e) => return Err(e.in_step(name, "wait")),
        };

        progress
            .run(&format!("{name}: running scripts"), |_| {
                self.run_init_scripts(machine, paths, results)
            })
            .await
            .map_err(step("run init scripts"))?;

        Ok(Provisioned { spec, stuck })
    }

    /// Provision every machine in the plan. Stops at the first failure.
    pub async fn provision_plan(
        &self,
        plan: Plan,
        progress: &mut StepProgress,
    ) -> Result<Vec<Provisioned>, MachinaError> {
        if let Some(ref manifest) = plan.cluster {
            if self.workspace.cluster_dir(&manifest.name).exists() {
                return Err(MachinaError::AlreadyExists {
                    name: manifest.name.clone(),
                });
            }
            self.workspace.save_manifest(manifest)?;
        }
        progress.add_steps(plan.machines.len() * PROVISION_STEPS);

        let results = plan.results().map(str::to_string);
        let mut done = Vec::with_capacity(plan.machines.len());
        for spec in plan.machines {
            done.push(self.provision(spec, results.as_deref(), progress).await?);
        }
        Ok(done)
    }

    // ── day-two operations ────────────────────────────────

    /// Start and wait. `Ok(true)` when the wait timed out.
    pub async fn start(&self, record: &MachineRecord) -> Result<bool, MachinaError> {
        let state = machine::detect_state(&record.paths);
        if state < MachineState::DisksReady {
            return Err(MachinaError::Validation {
                message: format!("machine '{}' is not provisioned ({state})", record.spec.name),
            });
        }
        self.driver
            .start(&self.runner, &record.spec, &record.paths)
            .await
            .map_err(|e| e.in_step(&record.spec.name, "start"))?;
        match self.wait(&record.spec).await {
            Ok(()) => Ok(false),
            Err(e) if e.is_timeout() => Ok(true),
            Err(e) => Err(e.in_step(&record.spec.name, "wait")),
        }
    }

    pub async fn stop(&self, record: &MachineRecord, force: bool) -> Result<(), MachinaError> {
        let (result, step) = if force {
            (
                self.driver.force_stop(&self.runner, &record.spec, &record.paths).await,
                "force stop",
            )
        } else {
            (
                self.driver.stop(&self.runner, &record.spec, &record.paths).await,
                "stop",
            )
        };
        result.map_err(|e| e.in_step(&record.spec.name, step))
    }

    pub async fn status(&self, record: &MachineRecord) -> Result<String, MachinaError> {
        self.driver
            .status(&self.runner, &record.spec, &record.paths)
            .await
    }

    /// Remove a machine everywhere. Every sub-step runs; failures are
    /// aggregated into one `Teardown` error.
    pub async fn delete(&self, record: &MachineRecord) -> Result<(), MachinaError> {
        let spec = &record.spec;
        let mut failures = Vec::new();

        match self.driver.delete(&self.runner, spec, &record.paths).await {
            Ok(()) => {}
            Err(MachinaError::Teardown { failures: f, .. }) => failures.extend(f),
            Err(e) => failures.push(e.to_string()),
        }

        if !spec.network.ip_address.is_empty() {
            let args = vec!["-R".to_string(), spec.network.ip_address.clone()];
            if let Err(e) = self.runner.run("ssh-keygen", &args).await {
                failures.push(format!("ssh-keygen -R: {e}"));
            }
        }

        if record.paths.root().exists() {
            if let Err(e) = std::fs::remove_dir_all(record.paths.root()) {
                failures.push(format!("removing {}: {e}", record.paths.root().display()));
            }
        }

        if failures.is_empty() {
            tracing::info!(machine = %spec.name, "deleted");
            Ok(())
        } else {
            Err(MachinaError::Teardown {
                name: spec.name.clone(),
                failures,
            })
        }
    }

    /// Delete a machine or every member of a cluster, best-effort per member.
    /// The cluster directory is kept while any member could not be loaded,
    /// so nothing is removed without its hypervisor teardown.
    pub async fn delete_located(&self, located: &Located) -> Result<(), MachinaError> {
        let mut failures = Vec::new();
        for record in located.machines() {
            if let Err(e) = self.delete(record).await {
                failures.push(e.to_string());
            }
        }
        if let Located::Cluster {
            manifest,
            unreadable,
            ..
        } = located
        {
            let dir = self.workspace.cluster_dir(&manifest.name);
            if !unreadable.is_empty() {
                failures.extend(unreadable.iter().map(|u| format!("unreadable member {u}")));
            } else if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    failures.push(format!("removing {}: {e}", dir.display()));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            let name = match located {
                Located::Machine(m) => m.spec.name.clone(),
                Located::Cluster { manifest, .. } => manifest.name.clone(),
            };
            Err(MachinaError::Teardown { name, failures })
        }
    }

    /// Interactive ssh session.
    pub async fn shell(&self, record: &MachineRecord) -> Result<(), MachinaError> {
        let args = remote::ssh_args(&record.spec, &record.paths.key(), None);
        self.runner.interactive("ssh", &args).await
    }

    /// scp in the direction the arguments describe.
    pub async fn copy(
        &self,
        record: &MachineRecord,
        direction: &CopyDirection,
    ) -> Result<(), MachinaError> {
        let key = record.paths.key();
        let (src, dst) = match direction {
            CopyDirection::Upload { local, guest, .. } => (
                local.display().to_string(),
                remote::remote_path(&record.spec, guest),
            ),
            CopyDirection::Download { guest, local, .. } => (
                remote::remote_path(&record.spec, guest),
                local.display().to_string(),
            ),
        };
        self.runner.run("scp", &remote::scp_args(&key, &src, &dst)).await?;
        Ok(())
    }
}
