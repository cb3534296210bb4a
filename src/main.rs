use std::io::IsTerminal;
use std::path::Path;

use clap::Parser;
use console::style;
use inquire::Confirm;

use machina::cli::{Cli, Command};
use machina::config;
use machina::error::MachinaError;
use machina::fetch::HttpClient;
use machina::health;
use machina::logging::{self, DeferredFileHandle};
use machina::machine::{Located, MachineRecord};
use machina::orchestrator::Orchestrator;
use machina::paths;
use machina::progress::{OutputMode, StepProgress};
use machina::remote;
use machina::runner::ProcessRunner;

type Machina = Orchestrator<ProcessRunner, HttpClient>;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let file_log = logging::init(cli.verbose);

    let log_to_file = cli.command.logs_to_file();
    let open = || open_orchestrator(cli.config.as_deref(), cli.verbose, &file_log, log_to_file);

    match cli.command {
        Command::Health => {
            print!("{}", health::render(&health::check_tools(health::REQUIRED_TOOLS)));
        }
        Command::Version => println!("{}", version_text()),
        Command::Create { name, file } => {
            let (orch, mode) = open()?;
            run_create(&orch, name, file, mode).await?
        }
        Command::Start { names } => {
            let (orch, _) = open()?;
            for name in &names {
                let located = orch.workspace().locate(name)?;
                for record in located.machines() {
                    let stuck = orch.start(record).await?;
                    report_started(record, stuck);
                }
            }
        }
        Command::Stop { names, force } => {
            let (orch, _) = open()?;
            for name in &names {
                let located = orch.workspace().locate(name)?;
                for record in located.machines() {
                    orch.stop(record, force).await?;
                    println!("{} stopped", record.spec.name);
                }
            }
        }
        Command::Delete { name, yes } => {
            let (orch, _) = open()?;
            let located = orch.workspace().locate(&name)?;
            if !yes && !confirm_delete(&name)? {
                println!("Cancelled.");
                return Ok(());
            }
            orch.delete_located(&located).await?;
            println!("{name} deleted");
        }
        Command::List => {
            let (orch, _) = open()?;
            run_list(&orch).await
        }
        Command::Shell { name } => {
            let (orch, _) = open()?;
            let record = single_machine(&orch, &name)?;
            orch.shell(&record).await?;
        }
        Command::Copy { src, dst } => {
            let direction = remote::parse_copy_args(&src, &dst)?;
            let (orch, _) = open()?;
            let record = single_machine(&orch, direction.machine())?;
            orch.copy(&record, &direction).await?;
        }
        Command::Template { name } => {
            let (orch, _) = open()?;
            match name.as_deref() {
                None | Some("list") => {
                    println!("{}", style("NAME").bold());
                    for template in orch.templates().list_available().await {
                        println!("{template}");
                    }
                }
                Some(name) => {
                    let body = orch.templates().fetch_remote(name).await?;
                    print!("{}", String::from_utf8_lossy(&body));
                }
            }
        }
    }

    Ok(())
}

/// Load config, activate file logging when asked, and bind the driver.
fn open_orchestrator(
    config_path: Option<&Path>,
    verbose: bool,
    file_log: &DeferredFileHandle,
    log_to_file: bool,
) -> Result<(Machina, OutputMode), MachinaError> {
    let config_path = config_path.map_or_else(paths::config_file, Path::to_path_buf);
    let config = config::load_config(&config_path)?;

    if log_to_file {
        let log_path = config.directories.instances().join(logging::LOG_FILE);
        if let Err(e) = file_log.set_file(&log_path) {
            tracing::warn!(path = %log_path.display(), error = %e, "file logging unavailable");
        }
    }

    let mode = OutputMode::detect(verbose, std::io::stdout().is_terminal());
    let show_download = matches!(mode, OutputMode::Normal | OutputMode::Verbose);
    let orch = Orchestrator::new(config, ProcessRunner, HttpClient::new(show_download)?)?;
    Ok((orch, mode))
}

async fn run_create(
    orch: &Machina,
    name: String,
    file: Option<std::path::PathBuf>,
    mode: OutputMode,
) -> Result<(), MachinaError> {
    let identifier = match file {
        Some(path) => {
            if !path.exists() {
                return Err(MachinaError::NotFound {
                    name: path.display().to_string(),
                });
            }
            path.display().to_string()
        }
        None => name,
    };

    let template = orch.load_template(&identifier).await?;
    tracing::info!(template = %template.name(), "template resolved");
    let plan = orch.plan(template);

    let mut progress = StepProgress::new(0, mode);
    let provisioned = orch.provision_plan(plan, &mut progress).await?;

    for machine in &provisioned {
        if machine.stuck {
            eprintln!(
                "{} {} appears to be stuck; check its console",
                style("warning:").yellow().bold(),
                machine.spec.name
            );
        }
        println!(
            "{} created ({}@{})",
            machine.spec.name, machine.spec.credentials.username, machine.spec.network.ip_address
        );
    }
    Ok(())
}

fn report_started(record: &MachineRecord, stuck: bool) {
    if stuck {
        eprintln!(
            "{} {} started but appears to be stuck",
            style("warning:").yellow().bold(),
            record.spec.name
        );
    } else {
        println!("{} started", record.spec.name);
    }
}

fn single_machine(orch: &Machina, name: &str) -> Result<MachineRecord, MachinaError> {
    match orch.workspace().locate(name)? {
        Located::Machine(record) => Ok(record),
        Located::Cluster { .. } => Err(MachinaError::Validation {
            message: format!("'{name}' is a cluster; name one of its machines"),
        }),
    }
}

fn confirm_delete(name: &str) -> Result<bool, MachinaError> {
    if !std::io::stdin().is_terminal() {
        return Err(MachinaError::Validation {
            message: format!("refusing to delete '{name}' without --yes on a non-interactive terminal"),
        });
    }
    Confirm::new(&format!("Delete machine '{name}'?"))
        .with_default(false)
        .prompt()
        .map_err(|e| match e {
            inquire::InquireError::OperationCanceled
            | inquire::InquireError::OperationInterrupted => MachinaError::Cancelled {
                name: name.to_string(),
            },
            other => MachinaError::Validation {
                message: format!("prompt error: {other}"),
            },
        })
}

async fn run_list(orch: &Machina) {
    let mut rows = vec![[
        "NAME".to_string(),
        "IP ADDRESS".to_string(),
        "STATUS".to_string(),
        "CPUS".to_string(),
        "MEMORY".to_string(),
        "DISK".to_string(),
        "VARIANT".to_string(),
    ]];
    for record in orch.workspace().all_machines() {
        let status = match orch.status(&record).await {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(machine = %record.spec.name, error = %e, "status failed");
                "error".to_string()
            }
        };
        let spec = record.spec;
        rows.push([
            spec.name,
            spec.network.ip_address,
            status,
            spec.resources.cpus.to_string(),
            spec.resources.memory,
            spec.resources.disk,
            spec.variant,
        ]);
    }

    let mut widths = [0usize; 7];
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }
    for (i, row) in rows.iter().enumerate() {
        let line = row
            .iter()
            .zip(widths)
            .map(|(cell, w)| format!("{cell:<w$}"))
            .collect::<Vec<_>>()
            .join("  ");
        let line = line.trim_end();
        if i == 0 {
            println!("{}", style(line).bold());
        } else {
            println!("{line}");
        }
    }
}

fn version_text() -> String {
    format!(
        "machina {}\ncommit: {}\nbuilt: {}",
        env!("CARGO_PKG_VERSION"),
        option_env!("MACHINA_GIT_COMMIT").unwrap_or("none"),
        option_env!("MACHINA_BUILD_DATE").unwrap_or("unknown"),
    )
}
