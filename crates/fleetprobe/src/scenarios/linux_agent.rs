//! Agent package, services, and logs on Linux VMs

use anyhow::{ensure, Context};
use fleetprobe_common::{linux_agent_log, process_agent_log, LogPolicy, PollPolicy};

use super::{check_log, Report, ScenarioContext};
use crate::artifacts::ArtifactStore;
use crate::host::Host;

const SCENARIO: &str = "linux_agent";

pub const AGENT_PACKAGE: &str = "stackstate-agent";
pub const AGENT_SERVICE: &str = "stackstate-agent";
pub const PROCESS_AGENT_SERVICE: &str = "stackstate-agent-process";
pub const AGENT_LOG: &str = "/var/log/stackstate-agent/agent.log";
pub const PROCESS_AGENT_LOG: &str = "/var/log/stackstate-agent/process-agent.log";

/// Package is installed; builds from master must carry a 2.x version
pub fn agent_installed(host: &dyn Host, agent_current_branch: Option<&str>) -> anyhow::Result<()> {
    let package = host.package(AGENT_PACKAGE)?;
    let version = package
        .version
        .as_deref()
        .with_context(|| format!("package {} is not installed", AGENT_PACKAGE))?;

    if agent_current_branch == Some("master") {
        ensure!(
            version.starts_with('2'),
            "expected a 2.x {} on master, found {}",
            AGENT_PACKAGE,
            version
        );
    }
    Ok(())
}

/// Agent service running and enabled, process agent running
///
/// The process agent's enabled state is not checked: on systemd RedHat
/// hosts the package does not enable it.
pub fn agent_services(host: &dyn Host) -> anyhow::Result<()> {
    let agent = host.service(AGENT_SERVICE)?;
    ensure!(agent.exists, "service {} does not exist", AGENT_SERVICE);
    ensure!(agent.running, "service {} is not running", AGENT_SERVICE);
    ensure!(
        agent.enabled == Some(true),
        "service {} is not enabled",
        AGENT_SERVICE
    );

    let process = host.service(PROCESS_AGENT_SERVICE)?;
    ensure!(process.exists, "service {} does not exist", PROCESS_AGENT_SERVICE);
    ensure!(process.running, "service {} is not running", PROCESS_AGENT_SERVICE);
    Ok(())
}

pub fn agent_log(
    host: &dyn Host,
    policy: &LogPolicy,
    poll: &PollPolicy,
    artifacts: &ArtifactStore,
) -> anyhow::Result<()> {
    let artifact = format!("{}-agent.log", host.name());
    check_log(host, AGENT_LOG, policy, poll, artifacts, &artifact)
}

pub fn process_agent_log_clean(
    host: &dyn Host,
    policy: &LogPolicy,
    poll: &PollPolicy,
    artifacts: &ArtifactStore,
) -> anyhow::Result<()> {
    let artifact = format!("{}-process.log", host.name());
    check_log(host, PROCESS_AGENT_LOG, policy, poll, artifacts, &artifact)
}

/// Branch the agent was built from: the inventory var, else the config
fn agent_branch(ctx: &ScenarioContext) -> Option<String> {
    ctx.inventory
        .var("agent_current_branch")
        .ok()
        .or_else(|| ctx.config.agent_current_branch.clone())
}

pub fn run(ctx: &ScenarioContext, host: &dyn Host, report: &mut Report) {
    let name = host.name();
    let branch = agent_branch(ctx);

    report.record(SCENARIO, "agent_installed", name, || {
        agent_installed(host, branch.as_deref())
    });
    report.record(SCENARIO, "agent_services", name, || agent_services(host));

    report.record(SCENARIO, "agent_log", name, || {
        let policy = ctx.log_policy(linux_agent_log)?;
        let poll = ctx.config.poll.short()?;
        agent_log(host, &policy, &poll, &ctx.artifacts)
    });

    report.record(SCENARIO, "process_agent_log", name, || {
        let policy = ctx.log_policy(process_agent_log)?;
        let poll = ctx.config.poll.short()?;
        process_agent_log_clean(host, &policy, &poll, &ctx.artifacts)
    });
}
