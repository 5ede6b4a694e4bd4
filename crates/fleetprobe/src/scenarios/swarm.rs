//! Docker Swarm integration: service metrics and topology

use anyhow::{ensure, Context};
use fleetprobe_common::{
    data_path, require_all, wait_until, Component, EntityData, Expectation, PollPolicy, Relation,
    TopologyError,
};

use super::{fetch_snapshot, Report, ScenarioContext};
use crate::artifacts::ArtifactStore;
use crate::backend::{TopicQuery, TopicSource, MULTI_METRICS_TOPIC, SWARM_TOPOLOGY_TOPIC};
use crate::host::Host;

const SCENARIO: &str = "swarm";

pub const SERVICE_TYPE: &str = "swarm-service";
pub const SERVICE_ID_PATTERN: &str = r"urn:swarm-service:/.*";
pub const CREATES_ID_PATTERN: &str = r"urn:swarm-service:/.*->urn:container:/.*";

/// Per-service replica metrics the swarm check reports
pub const SERVICE_METRIC_KEYS: [&str; 2] = [
    "swarm.service.desired_replicas",
    "swarm.service.running_replicas",
];

/// Branches that pin the images of the stack under test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackBranches {
    pub agent: String,
    pub stackstate: String,
}

fn service_named(data: &EntityData, name: &str, image_prefix: &str) -> bool {
    data.get("name").and_then(|v| v.as_str()) == Some(name)
        && data
            .get("image")
            .and_then(|v| v.as_str())
            .is_some_and(|image| image.starts_with(image_prefix))
}

fn is_global(data: &EntityData) -> bool {
    data_path(data, &["spec", "Mode", "Global"]).is_some()
}

fn has_single_replica(data: &EntityData) -> bool {
    data_path(data, &["spec", "Mode", "Replicated", "Replicas"]).and_then(|v| v.as_u64()) == Some(1)
}

/// The six services of the test stack
pub fn service_expectations(
    branches: &StackBranches,
) -> Result<Vec<Expectation<Component>>, TopologyError> {
    let nginx = Expectation::component(
        "Should find the nginx swarm service component",
        SERVICE_TYPE,
        SERVICE_ID_PATTERN,
    )?
    .with_data(|d| service_named(d, "nginx", "nginx:latest@") && is_global(d));

    let replicated = [
        (
            "agent",
            "agent_stackstate-agent",
            format!("stackstate/stackstate-agent-2-test:{}@", branches.agent),
        ),
        (
            "receiver",
            "agent_receiver",
            format!("quay.io/stackstate/stackstate-receiver:{}@", branches.stackstate),
        ),
        (
            "topic-api",
            "agent_topic-api",
            format!("quay.io/stackstate/stackstate-topic-api:{}@", branches.stackstate),
        ),
        ("kafka", "agent_kafka", "wurstmeister/kafka:2.12-2.3.1@".to_string()),
        (
            "zookeeper",
            "agent_zookeeper",
            "wurstmeister/zookeeper:latest@".to_string(),
        ),
    ];

    let mut expectations = vec![nginx];
    for (label, name, image) in replicated {
        expectations.push(
            Expectation::component(
                format!("Should find the {} swarm service component", label),
                SERVICE_TYPE,
                SERVICE_ID_PATTERN,
            )?
            .with_data(move |d| service_named(d, name, &image) && has_single_replica(d)),
        );
    }
    Ok(expectations)
}

pub fn creates_relation_expectation() -> Result<Expectation<Relation>, TopologyError> {
    Expectation::relation(
        "Should find the relation between swarm service and its tasks",
        "creates",
        CREATES_ID_PATTERN,
    )
}

pub fn service_metrics(
    source: &dyn TopicSource,
    poll: &PollPolicy,
    artifacts: &ArtifactStore,
) -> anyhow::Result<()> {
    let query = TopicQuery::new(MULTI_METRICS_TOPIC, 3000);

    wait_until(poll, || -> anyhow::Result<()> {
        let snapshot = fetch_snapshot(
            source,
            &query,
            artifacts,
            "topic-docker-swarm-sts-multi-metrics.json",
        )?;
        let keys = snapshot.multi_metric_keys("convertedMetric", Some("serviceName"));

        for key in SERVICE_METRIC_KEYS {
            ensure!(keys.contains(key), "no {} on any swarm service yet", key);
        }
        Ok(())
    })
}

pub fn topology(
    source: &dyn TopicSource,
    poll: &PollPolicy,
    artifacts: &ArtifactStore,
    branches: &StackBranches,
) -> anyhow::Result<()> {
    let query = TopicQuery::new(SWARM_TOPOLOGY_TOPIC, 1500);
    let components = service_expectations(branches)?;
    let relation = creates_relation_expectation()?;

    wait_until(poll, || -> anyhow::Result<()> {
        let snapshot = fetch_snapshot(
            source,
            &query,
            artifacts,
            "topic-docker-swarm-integrations.json",
        )?;
        require_all(&snapshot, &components)?;
        relation.require(&snapshot)?;
        Ok(())
    })
}

fn branches(ctx: &ScenarioContext) -> anyhow::Result<StackBranches> {
    Ok(StackBranches {
        agent: ctx
            .config
            .agent_current_branch
            .clone()
            .context("AGENT_CURRENT_BRANCH is not set")?,
        stackstate: ctx
            .config
            .stackstate_branch
            .clone()
            .context("STACKSTATE_BRANCH is not set")?,
    })
}

pub fn run(ctx: &ScenarioContext, host: &dyn Host, report: &mut Report) {
    let name = host.name();

    report.record(SCENARIO, "service_metrics", name, || {
        let backend = ctx.backend(host)?;
        service_metrics(&backend, &ctx.config.poll.swarm_metrics()?, &ctx.artifacts)
    });

    report.record(SCENARIO, "topology", name, || {
        let backend = ctx.backend(host)?;
        topology(&backend, &ctx.config.poll.short()?, &ctx.artifacts, &branches(ctx)?)
    });
}
