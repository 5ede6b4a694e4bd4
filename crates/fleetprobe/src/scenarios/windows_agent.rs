//! Agent package, services, and logs on the Windows VM

use anyhow::{ensure, Context};
use fleetprobe_common::{process_agent_log, trace_agent_log, windows_agent_log};

use super::{check_log, Report, ScenarioContext};
use crate::host::Host;

const SCENARIO: &str = "windows_agent";

pub const AGENT_PACKAGE: &str = "StackState Agent";
pub const AGENT_LOG: &str = r"c:\programdata\stackstate\logs\agent.log";
pub const PROCESS_AGENT_LOG: &str = r"c:\programdata\stackstate\logs\process-agent.log";
pub const TRACE_AGENT_LOG: &str = r"c:\programdata\stackstate\logs\trace-agent.log";

/// Expected service graph: name, dependencies, dependents
pub const SERVICES: [(&str, &[&str], &[&str]); 3] = [
    (
        "stackstateagent",
        &[],
        &["stackstate-process-agent", "stackstate-trace-agent"],
    ),
    ("stackstate-trace-agent", &["stackstateagent"], &[]),
    ("stackstate-process-agent", &["stackstateagent"], &[]),
];

/// Package installed with the expected major version
pub fn agent_installed(host: &dyn Host, major_version: &str) -> anyhow::Result<()> {
    let package = host.package(AGENT_PACKAGE)?;
    let version = package
        .version
        .as_deref()
        .with_context(|| format!("package {} is not installed", AGENT_PACKAGE))?;

    ensure!(
        version.starts_with(&format!("{}.", major_version)),
        "expected {} {}.x, found {}",
        AGENT_PACKAGE,
        major_version,
        version
    );
    Ok(())
}

fn sorted(names: &[String]) -> Vec<String> {
    let mut names = names.to_vec();
    names.sort();
    names
}

/// Every agent service exists, runs, and is wired to the others
pub fn agent_services(host: &dyn Host) -> anyhow::Result<()> {
    for (name, deps, dependents) in SERVICES {
        let service = host.service(name)?;
        ensure!(service.exists, "service {} does not exist", name);
        ensure!(service.running, "service {} is not running", name);

        let expected: Vec<String> = deps.iter().map(|s| s.to_string()).collect();
        ensure!(
            sorted(&service.dependencies) == expected,
            "service {} depends on {:?}, expected {:?}",
            name,
            service.dependencies,
            expected
        );

        let expected: Vec<String> = dependents.iter().map(|s| s.to_string()).collect();
        ensure!(
            sorted(&service.dependents) == expected,
            "service {} is depended on by {:?}, expected {:?}",
            name,
            service.dependents,
            expected
        );
    }
    Ok(())
}

pub fn run(ctx: &ScenarioContext, host: &dyn Host, report: &mut Report) {
    let name = host.name();

    report.record(SCENARIO, "agent_installed", name, || {
        let major_version = ctx.inventory.var("major_version")?;
        agent_installed(host, &major_version)
    });

    report.record(SCENARIO, "agent_services", name, || agent_services(host));

    report.record(SCENARIO, "agent_log", name, || {
        let policy = ctx.log_policy(windows_agent_log)?;
        let artifact = format!("{}-agent.log", name);
        check_log(host, AGENT_LOG, &policy, &ctx.config.poll.short()?, &ctx.artifacts, &artifact)
    });

    report.record(SCENARIO, "process_agent_log", name, || {
        let policy = ctx.log_policy(process_agent_log)?;
        let artifact = format!("{}-process.log", name);
        check_log(
            host,
            PROCESS_AGENT_LOG,
            &policy,
            &ctx.config.poll.short()?,
            &ctx.artifacts,
            &artifact,
        )
    });

    report.record(SCENARIO, "trace_agent_log", name, || {
        let policy = ctx.log_policy(trace_agent_log)?;
        let artifact = format!("{}-trace.log", name);
        check_log(
            host,
            TRACE_AGENT_LOG,
            &policy,
            &ctx.config.poll.short()?,
            &ctx.artifacts,
            &artifact,
        )
    });
}
