mod commands;
mod utils;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agentstack")]
#[command(
    about = "Provision and tear down the agent application's AWS environment",
    long_about = None
)]
struct Cli {
    /// Project name; prefixes every resource
    #[arg(short, long, global = true, env = "AGENTSTACK_PROJECT")]
    project: Option<String>,

    /// AWS region
    #[arg(short, long, global = true, env = "AGENTSTACK_REGION")]
    region: Option<String>,

    /// Settings file instead of the usual search
    #[arg(long, global = true, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create every resource of the environment, or act on an existing instance
    Install {
        /// Re-run the setup script on the project instance, or on INSTANCE_ID
        #[arg(
            long,
            value_name = "INSTANCE_ID",
            num_args = 0..=1,
            conflicts_with = "verify_deployment"
        )]
        run_setup: Option<Option<String>>,

        /// Report which subnets the project instances landed in
        #[arg(long)]
        verify_deployment: bool,

        /// Run against an in-memory account with no waits
        #[arg(long)]
        dry_run: bool,

        /// Leave missing API keys empty instead of prompting
        #[arg(long)]
        non_interactive: bool,
    },
    /// Delete every resource of the environment
    Uninstall {
        /// Run against an in-memory account with no waits
        #[arg(long)]
        dry_run: bool,
    },
    /// Reassemble a recorded agent event stream and print the answer
    Replay {
        /// JSON-lines file of agent events
        events_file: PathBuf,
    },
    /// Show version information
    Version,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli).await {
        utils::print_failure(&err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Version needs no settings
    if matches!(cli.command, Commands::Version) {
        println!("agentstack {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let options = utils::GlobalOptions {
        project: cli.project,
        region: cli.region,
        settings: cli.settings,
    };

    match cli.command {
        Commands::Install {
            run_setup,
            verify_deployment,
            dry_run,
            non_interactive,
        } => {
            let context = utils::Context::load(&options, dry_run).await?;
            if let Some(instance_id) = run_setup {
                commands::install::run_setup(&context, instance_id.as_deref()).await?;
            } else if verify_deployment {
                commands::install::verify_deployment(&context).await?;
            } else {
                commands::install::handle(&context, non_interactive).await?;
            }
        }
        Commands::Uninstall { dry_run } => {
            let context = utils::Context::load(&options, dry_run).await?;
            commands::uninstall::handle(&context).await?;
        }
        Commands::Replay { events_file } => {
            commands::replay::handle(&events_file).await?;
        }
        Commands::Version => {
            unreachable!("Version is handled before settings loading");
        }
    }

    Ok(())
}
