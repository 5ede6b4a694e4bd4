//! fleetprobe - acceptance checks for a deployed agent fleet
//!
//! Usage: `fleetprobe [SCENARIO...]`
//!
//! Without arguments every scenario family whose hosts are in the inventory
//! runs. Exits non-zero when any check fails.

use anyhow::{Context, Result};
use chrono::Utc;

use fleetprobe::scenarios::{run_selected, Report, ScenarioContext, ScenarioKind};
use fleetprobe::{logging, ArtifactStore, Host, Inventory, LocalHost, SuiteConfig};

fn parse_scenarios(args: &[String]) -> Result<Vec<ScenarioKind>> {
    args.iter()
        .map(|arg| arg.parse::<ScenarioKind>().map_err(anyhow::Error::msg))
        .collect()
}

fn print_summary(report: &Report) {
    println!();
    for outcome in report.outcomes() {
        println!("{}", outcome);
    }
    println!();
    println!(
        "{} passed, {} failed ({} checks)",
        report.passed(),
        report.failed(),
        report.outcomes().len()
    );
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Usage: fleetprobe [SCENARIO...]");
        println!();
        println!("Scenarios:");
        for kind in ScenarioKind::ALL {
            println!("  {:<14} hosts: {}", kind.name(), kind.group());
        }
        println!();
        println!("Example config:");
        println!("{}", SuiteConfig::example_toml());
        return Ok(());
    }

    // Load configuration
    let config = SuiteConfig::load().context("Failed to load configuration")?;

    // Initialize logging
    logging::init(&config.log_level);

    let controller = LocalHost::detect();
    tracing::info!("Starting fleetprobe at {}", Utc::now().to_rfc3339());
    tracing::info!("Controller: {} ({})", controller.name(), controller.platform());
    tracing::info!("Backend: {} via {:?}", config.backend_url, config.transport);

    let explicit = !args.is_empty();
    let kinds = if explicit {
        parse_scenarios(&args)?
    } else {
        ScenarioKind::ALL.to_vec()
    };

    let inventory = Inventory::load(config.instance_config.as_deref(), &config.vars_files)
        .context("Failed to load inventory")?;
    let artifacts = ArtifactStore::new(&config.artifacts_dir);

    let ctx = ScenarioContext::new(config, inventory, artifacts);
    let mut report = Report::new();
    run_selected(&kinds, explicit, &ctx, &mut report);

    print_summary(&report);

    if report.outcomes().is_empty() {
        anyhow::bail!("No checks ran; is the inventory loaded?");
    }
    if !report.is_success() {
        anyhow::bail!("{} check(s) failed", report.failed());
    }

    tracing::info!("All checks passed");
    Ok(())
}
