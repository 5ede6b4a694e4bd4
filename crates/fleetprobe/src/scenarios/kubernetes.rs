//! Cluster agent rollout on the Kubernetes test cluster

use anyhow::ensure;
use fleetprobe_common::{wait_until, PollPolicy};

use super::receiver::receiver_healthy;
use super::{Report, ScenarioContext};
use crate::backend::ReceiverHealth;
use crate::host::Host;

const SCENARIO: &str = "kubernetes";

pub const NODE_AGENT: &str = "daemonset/stackstate-agent";
pub const CLUSTER_AGENT: &str = "deployment/stackstate-cluster-agent";

/// Receiver health, retried while the cluster settles
pub fn receiver_healthy_eventually(
    health: &dyn ReceiverHealth,
    poll: &PollPolicy,
) -> anyhow::Result<()> {
    wait_until(poll, || receiver_healthy(health))
}

/// `kubectl wait` until the workload reports the available condition
pub fn workload_available(host: &dyn Host, resource: &str, poll: &PollPolicy) -> anyhow::Result<()> {
    let command = format!(
        "kubectl wait --for=condition=available --timeout=30s {}",
        resource
    );

    wait_until(poll, || -> anyhow::Result<()> {
        let output = host.run(&command)?;
        ensure!(
            output.success(),
            "{} not available (exit {}): {}",
            resource,
            output.exit_code,
            output.stderr.trim()
        );
        Ok(())
    })
}

pub fn run(ctx: &ScenarioContext, host: &dyn Host, report: &mut Report) {
    let name = host.name();

    report.record(SCENARIO, "receiver_healthy", name, || {
        let backend = ctx.backend(host)?;
        receiver_healthy_eventually(&backend, &ctx.config.poll.cluster()?)
    });

    report.record(SCENARIO, "node_agent_available", name, || {
        workload_available(host, NODE_AGENT, &ctx.config.poll.cluster()?)
    });

    report.record(SCENARIO, "cluster_agent_available", name, || {
        workload_available(host, CLUSTER_AGENT, &ctx.config.poll.cluster()?)
    });
}
