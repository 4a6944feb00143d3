use crate::utils::{self, Context};
use agentstack_deploy::{Teardown, TeardownTimings};
use colored::Colorize;

pub async fn handle(context: &Context) -> anyhow::Result<()> {
    let run = &context.run;
    utils::print_banner("Starting AWS Infrastructure Cleanup");
    utils::print_field("Project", &run.project_name);
    utils::print_field("Region", &run.region);
    utils::print_field("Account ID", &run.account_id);
    println!("{}", utils::rule());

    let mut teardown = Teardown::new(context.backend.provider(), run.clone());
    if context.is_dry_run() {
        teardown = teardown.with_timings(TeardownTimings::immediate());
    }
    let report = teardown.run().await;
    let elapsed = std::time::Duration::from_millis(report.duration_ms);

    println!();
    if report.is_success() {
        utils::print_banner(&format!(
            "{} Infrastructure Cleanup Completed Successfully!",
            "✓".green()
        ));
        println!("  {}", report);
        println!("Total cleanup time: {}", utils::minutes(elapsed));
        println!("{}", utils::rule());
        return Ok(());
    }

    for entry in &report.failed {
        eprintln!(
            "  {} {} {}: {}",
            "✗".red(),
            entry.kind,
            entry.name,
            entry.error.as_deref().unwrap_or("unknown error")
        );
    }
    anyhow::bail!(
        "Cleanup finished with {} failure(s) after {} ({})",
        report.failed.len(),
        utils::minutes(elapsed),
        report
    )
}
