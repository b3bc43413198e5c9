//! CLI command handling.
//!
//! Provides subcommands for:
//! - Checking the Docker daemon (`check`)
//! - Running a one-off command in a container (`exec`)
//! - Attaching an interactive terminal (`attach`)
//! - Provisioning and destroying sandboxes (`provision`, `destroy`)
//! - Reaping orphaned processes after a restart (`cleanup-orphans`)
//! - Listing recorded sandboxes (`list`)

mod attach;
mod check;
mod sandbox;

pub use attach::run_attach_command;
pub use check::run_check_command;
pub use sandbox::{
    run_cleanup_command, run_destroy_command, run_exec_command, run_list_command,
    run_provision_command,
};

use std::path::PathBuf;

use clap::{ColorChoice, Parser, Subcommand};
use uuid::Uuid;

/// Default location of the sandbox record file.
pub const DEFAULT_STATE_FILE: &str = ".devsandbox/sandboxes.json";

#[derive(Parser, Debug)]
#[command(name = "devsandbox")]
#[command(about = "Provision Docker development sandboxes and open sessions in them")]
#[command(
    long_about = "devsandbox drives the Docker Engine directly to build per-user sandboxes.\nExamples:\n  devsandbox check\n  devsandbox provision --name demo --owner dev --template-dir ./template\n  devsandbox attach devsandbox-1a2b3c4d-app"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// File holding sandbox records
    #[arg(long, global = true, env = "DEVSANDBOX_STATE", default_value = DEFAULT_STATE_FILE)]
    pub state: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that the Docker daemon is reachable
    #[command(
        about = "Check Docker availability",
        long_about = "Pings the daemon over its socket and reports its version.\nExample: devsandbox check"
    )]
    Check,

    /// Run a command in a container and print its output
    #[command(
        about = "Run a command in a container",
        long_about = "Runs a command without a TTY and prints stdout and stderr.\nExample: devsandbox exec my-app -- ls -la /workspace"
    )]
    Exec {
        /// Container id or name
        container: String,

        /// Run as this user
        #[arg(short, long)]
        user: Option<String>,

        /// Command and arguments
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },

    /// Attach an interactive terminal to a container
    #[command(
        about = "Open a terminal in a container",
        long_about = "Opens a tmux-backed shell and bridges it to this terminal.\nPress Ctrl-] to detach.\nExample: devsandbox attach my-app --label main"
    )]
    Attach {
        /// Container id or name
        container: String,

        /// Terminal label; reusing a label re-attaches to the same tmux session
        #[arg(short, long, default_value = "main")]
        label: String,

        /// Shell user
        #[arg(short, long, default_value = "dev")]
        user: String,
    },

    /// Create (or re-provision) a sandbox
    #[command(
        about = "Provision a sandbox",
        long_about = "Creates the network, database and app container, uploads the template and runs its scripts.\nExample: devsandbox provision --name demo --owner dev --template-dir ./template"
    )]
    Provision {
        /// Provision an existing record instead of creating one
        #[arg(long, conflicts_with = "name")]
        id: Option<Uuid>,

        /// Display name for a new sandbox
        #[arg(long, default_value = "sandbox")]
        name: String,

        /// Sandbox user and owner of the files
        #[arg(long, default_value = "dev")]
        owner: String,

        /// Directory with bootstrap.sh, startup.sh and files/
        #[arg(long)]
        template_dir: Option<PathBuf>,
    },

    /// Remove everything a sandbox owns
    #[command(
        about = "Destroy a sandbox",
        long_about = "Stops sessions and removes the sidecar, containers and network.\nSandboxes without a record are removed by their derived resource names.\nExample: devsandbox destroy --id 1a2b3c4d-..."
    )]
    Destroy {
        /// Sandbox id
        #[arg(long)]
        id: Uuid,
    },

    /// Kill processes left over from a previous run in every running sandbox
    #[command(name = "cleanup-orphans")]
    CleanupOrphans,

    /// List recorded sandboxes
    List,
}

/// Dispatch a parsed command.
pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = crate::config::Config::from_env()?;
    match cli.command {
        Command::Check => run_check_command(&config).await,
        Command::Exec {
            container,
            user,
            cmd,
        } => run_exec_command(&config, &container, user.as_deref(), cmd).await,
        Command::Attach {
            container,
            label,
            user,
        } => run_attach_command(&config, &container, &label, &user).await,
        Command::Provision {
            id,
            name,
            owner,
            template_dir,
        } => run_provision_command(config, &cli.state, id, &name, &owner, template_dir).await,
        Command::Destroy { id } => run_destroy_command(config, &cli.state, id).await,
        Command::CleanupOrphans => run_cleanup_command(config, &cli.state).await,
        Command::List => run_list_command(&cli.state).await,
    }
}
