use agentstack_cloud::{CloudProvider, ConfigStore, MemoryProvider, RemoteShell};
use agentstack_cloud_aws::AwsProvider;
use agentstack_config::{Overrides, Settings};
use agentstack_deploy::{DeployError, RunConfig};
use anyhow::Context as _;
use colored::Colorize;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::path::PathBuf;

const RULE_WIDTH: usize = 60;

/// Flags shared by every subcommand
pub struct GlobalOptions {
    pub project: Option<String>,
    pub region: Option<String>,
    pub settings: Option<PathBuf>,
}

/// The account the commands act on
pub enum Backend {
    Aws(AwsProvider),
    /// `--dry-run`
    Memory(MemoryProvider),
}

/// Everything a command needs: settings, the run config and the account
pub struct Context {
    pub settings: Settings,
    pub run: RunConfig,
    pub store: ConfigStore,
    pub backend: Backend,
}

impl Context {
    pub async fn load(options: &GlobalOptions, dry_run: bool) -> anyhow::Result<Self> {
        let overrides = Overrides {
            project_name: options.project.clone(),
            region: options.region.clone(),
        };
        let settings = Settings::load(options.settings.as_deref(), &overrides)
            .context("Failed to load settings")?;

        let backend = if dry_run {
            println!("{}", "Dry run: using an in-memory account".yellow());
            Backend::Memory(MemoryProvider::new())
        } else {
            Backend::Aws(AwsProvider::new(settings.region.clone())?)
        };

        let auth = backend.provider().check_auth().await?;
        if !auth.authenticated {
            return Err(DeployError::NotAuthenticated(auth.error.unwrap_or_default()).into());
        }
        let account_id = auth
            .account_id
            .context("Caller identity did not include an account id")?;
        tracing::debug!(account = %account_id, caller = ?auth.caller, "Authenticated");

        let mut run = RunConfig::new(&settings.project_name, &settings.region, account_id);
        run.git_name = settings.git_name().to_string();
        run.repository_owner = settings.repository_owner.clone();
        run.instance_type = settings.instance_type.clone();
        run.volume_size_gb = settings.volume_size_gb;
        run.app_port = settings.app_port;

        let store = ConfigStore::new(&settings.config_path);
        Ok(Self {
            settings,
            run,
            store,
            backend,
        })
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self.backend, Backend::Memory(_))
    }
}

impl Backend {
    pub fn provider(&self) -> &dyn CloudProvider {
        match self {
            Backend::Aws(aws) => aws,
            Backend::Memory(memory) => memory,
        }
    }

    pub fn shell(&self) -> &dyn RemoteShell {
        match self {
            Backend::Aws(aws) => aws,
            Backend::Memory(memory) => memory,
        }
    }
}

pub fn rule() -> String {
    "=".repeat(RULE_WIDTH)
}

/// Title between two rules
pub fn print_banner(title: &str) {
    println!("{}", rule());
    println!("{}", title.bold());
    println!("{}", rule());
}

pub fn print_field(label: &str, value: impl std::fmt::Display) {
    println!("  {}: {}", label, value.to_string().cyan());
}

pub fn minutes(elapsed: std::time::Duration) -> String {
    format!("{:.2} minutes", elapsed.as_secs_f64() / 60.0)
}

/// Failure banner, error chain and backtrace on stderr
pub fn print_failure(err: &anyhow::Error) {
    eprintln!();
    eprintln!("{}", rule().red());
    eprintln!("{}", "Failed!".red().bold());
    eprintln!("{}", rule().red());
    eprintln!("{} {}", "Error:".red().bold(), err);
    for cause in err.chain().skip(1) {
        eprintln!("  {} {}", "Caused by:".yellow(), cause);
    }
    eprintln!("{}", rule().red());

    let backtrace = err.backtrace();
    if backtrace.status() == BacktraceStatus::Captured {
        eprintln!("{}", backtrace);
    } else {
        eprintln!("{}", Backtrace::force_capture());
    }
}
