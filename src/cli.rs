use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "machina", about = "Template-driven virtual machine provisioning")]
pub struct Cli {
    /// Path to config file [default: ~/.config/machina/machina.toml]
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision a machine or cluster from a template
    #[command(visible_alias = "new")]
    Create {
        /// Catalog template name
        #[arg(default_value = "default")]
        name: String,

        /// Local template file (takes precedence over the catalog)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Start stopped machines or clusters
    Start {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Stop machines or clusters
    Stop {
        #[arg(required = true)]
        names: Vec<String>,

        /// Kill instead of a graceful shutdown
        #[arg(short, long)]
        force: bool,
    },

    /// Delete a machine or a whole cluster
    #[command(visible_alias = "rm")]
    Delete {
        name: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// List machines
    #[command(visible_alias = "ls")]
    List,

    /// Open an ssh session on a machine
    #[command(visible_alias = "sh")]
    Shell { name: String },

    /// Copy files between host and machine (`<machine>:<path>` marks the guest side)
    #[command(visible_alias = "cp")]
    Copy { src: String, dst: String },

    /// List catalog templates, or print one
    #[command(visible_alias = "tpl")]
    Template { name: Option<String> },

    /// Check that required host tools are installed
    Health,

    /// Print version information
    Version,
}

impl Command {
    /// Commands that touch the hypervisor log to the instances directory.
    pub fn logs_to_file(&self) -> bool {
        matches!(self, Command::Create { .. } | Command::Start { .. })
    }
}
