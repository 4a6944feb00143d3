use crate::utils::{self, Context};
use agentstack_cloud::RetryConfig;
use agentstack_deploy::{
    DialoguerPrompt, EmptyPrompt, HttpProbe, ProvisionOutcome, Provisioner, RemoteSetup,
    RemoteTimings, ReqwestProbe, SecretPrompt, StageTimings, StaticProbe,
};
use colored::Colorize;
use std::time::Instant;

/// Full provisioning run
pub async fn handle(context: &Context, non_interactive: bool) -> anyhow::Result<()> {
    let run = &context.run;
    utils::print_banner("Starting AWS Infrastructure Deployment");
    utils::print_field("Project", &run.project_name);
    utils::print_field("Region", &run.region);
    utils::print_field("Account ID", &run.account_id);
    utils::print_field("Bucket Name", run.bucket_name());
    utils::print_field("Instance Type", &context.settings.instance_type);
    println!("{}", utils::rule());

    let started = Instant::now();
    let interactive = !non_interactive && !context.is_dry_run();
    let prompt: &dyn SecretPrompt = if interactive { &DialoguerPrompt } else { &EmptyPrompt };

    let reqwest_probe;
    let static_probe = StaticProbe(200);
    let probe: &dyn HttpProbe = if context.is_dry_run() {
        &static_probe
    } else {
        reqwest_probe = ReqwestProbe::new()?;
        &reqwest_probe
    };

    let mut provisioner = Provisioner::new(
        context.backend.provider(),
        run.clone(),
        context.store.clone(),
        prompt,
        probe,
    );
    if context.is_dry_run() {
        provisioner = provisioner
            .with_timings(StageTimings::immediate())
            .with_retry(RetryConfig::immediate(3));
    }

    match provisioner.run().await {
        Ok(outcome) => {
            print_summary(&outcome, context);
            Ok(())
        }
        Err(err) => {
            eprintln!(
                "{} {}",
                "Deployment time before failure:".red(),
                utils::minutes(started.elapsed())
            );
            Err(err.into())
        }
    }
}

fn print_summary(outcome: &ProvisionOutcome, context: &Context) {
    println!();
    utils::print_banner(&format!(
        "{} Infrastructure Deployment Completed Successfully!",
        "✓".green()
    ));
    println!("Summary:");
    utils::print_field("S3 Bucket", &outcome.storage.bucket);
    utils::print_field("VPC ID", &outcome.network.vpc_id);
    utils::print_field("Public Subnets", outcome.network.public_ids().join(", "));
    utils::print_field("Private Subnets", outcome.network.private_ids().join(", "));
    utils::print_field("ALB DNS", format!("http://{}/", outcome.load_balancer.dns));
    utils::print_field("CloudFront Domain", format!("https://{}", outcome.distribution.domain));
    utils::print_field(
        "EC2 Instance ID",
        format!("{} (deployed in private subnet)", outcome.instance.id),
    );
    utils::print_field("OpenSearch Endpoint", &outcome.collection.endpoint);
    utils::print_field("Knowledge Base ID", &outcome.knowledge_base.id);
    utils::print_field("Knowledge Base Role", &outcome.identities.knowledge_base_role_arn);
    utils::print_field("Config File", context.store.path().display());
    println!();
    println!("Total deployment time: {}", utils::minutes(outcome.elapsed));
    println!("{}", utils::rule());
    if !outcome.readiness.is_ready() {
        println!(
            "{}",
            "Note: the application did not answer yet; check again in a few minutes".yellow()
        );
    }
    println!("Note: CloudFront distribution may take 15-20 minutes to fully deploy");
    println!("Note: EC2 instance user data script will install and start the application");
    println!("{}", utils::rule());
}

fn remote(context: &Context) -> RemoteSetup<'_> {
    let setup = RemoteSetup::new(
        context.backend.provider(),
        context.backend.shell(),
        context.run.clone(),
        context.store.clone(),
    );
    if context.is_dry_run() {
        setup.with_timings(RemoteTimings::immediate())
    } else {
        setup
    }
}

/// `--run-setup [INSTANCE_ID]`
pub async fn run_setup(context: &Context, instance_id: Option<&str>) -> anyhow::Result<()> {
    let outcome = remote(context).run_setup(instance_id).await?;

    utils::print_banner(&format!("{} Setup Script Execution Completed", "✓".green()));
    utils::print_field("Instance ID", &outcome.instance_id);
    utils::print_field("Command ID", &outcome.command_id);
    utils::print_field("Status", &outcome.status);
    if !outcome.output.is_empty() {
        println!("  Output: {}...", outcome.output);
    }
    println!("{}", utils::rule());
    Ok(())
}

/// `--verify-deployment`
pub async fn verify_deployment(context: &Context) -> anyhow::Result<()> {
    let audits = remote(context).verify_deployment().await?;

    let exposed = audits.iter().filter(|a| a.is_exposed()).count();
    utils::print_banner("Deployment Verification");
    utils::print_field("Instances", audits.len());
    if exposed == 0 {
        println!("  {} No instance is reachable outside the load balancer", "✓".green());
    } else {
        println!(
            "  {} {} instance(s) in a public subnet or with a public IP",
            "⚠".yellow(),
            exposed
        );
    }
    println!("{}", utils::rule());
    Ok(())
}
