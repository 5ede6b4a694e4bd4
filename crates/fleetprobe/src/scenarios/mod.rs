//! Acceptance scenarios
//!
//! Each family targets one host group of the provisioned environment. A
//! family is a list of named checks; every check returns `anyhow::Result<()>`
//! and its outcome lands in a [`Report`].

pub mod kubernetes;
pub mod linux_agent;
pub mod receiver;
pub mod swarm;
pub mod windows_agent;


use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use fleetprobe_common::{wait_until, LogPolicy, PollPolicy, TopicSnapshot};
use tracing::{info, warn};

use crate::artifacts::ArtifactStore;
use crate::backend::{Backend, BackendError, HostCurlTopicSource, HttpTopicSource, TopicQuery, TopicSource};
use crate::config::{SuiteConfig, Transport};
use crate::host::{Host, LocalHost, Platform};
use crate::inventory::Inventory;

/// Instances at these addresses run commands without ssh
const LOOPBACK_ADDRESSES: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// Scenario families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioKind {
    LinuxAgent,
    WindowsAgent,
    Receiver,
    Kubernetes,
    Swarm,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 5] = [
        Self::LinuxAgent,
        Self::WindowsAgent,
        Self::Receiver,
        Self::Kubernetes,
        Self::Swarm,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::LinuxAgent => "linux_agent",
            Self::WindowsAgent => "windows_agent",
            Self::Receiver => "receiver",
            Self::Kubernetes => "kubernetes",
            Self::Swarm => "swarm",
        }
    }

    /// Host group the family runs against
    pub fn group(&self) -> &'static str {
        match self {
            Self::LinuxAgent => "agent_vm",
            Self::WindowsAgent => "agent_win_vm",
            Self::Receiver => "receiver_vm",
            Self::Kubernetes => "kubernetes-cluster-agent",
            Self::Swarm => "agent-swarm-master",
        }
    }

    pub fn platform(&self) -> Platform {
        match self {
            Self::WindowsAgent => Platform::Windows,
            _ => Platform::Linux,
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ScenarioKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|k| k.name() == normalized)
            .ok_or_else(|| {
                format!(
                    "Unknown scenario '{}' (expected one of: {})",
                    s,
                    Self::ALL.map(|k| k.name()).join(", ")
                )
            })
    }
}

/// Result of one check on one host
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub scenario: String,
    pub check: String,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// Rendered error chain when the check failed
    pub error: Option<String>,
}

impl CheckOutcome {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed() { "PASS" } else { "FAIL" };
        write!(
            f,
            "{} {}::{} [{}] at {} ({:.1}s)",
            status,
            self.scenario,
            self.check,
            self.host,
            self.started_at.format("%H:%M:%S"),
            self.duration.as_secs_f64()
        )?;
        if let Some(error) = &self.error {
            write!(f, "\n    {}", error)?;
        }
        Ok(())
    }
}

/// Collected check outcomes of a run
#[derive(Debug, Default)]
pub struct Report {
    outcomes: Vec<CheckOutcome>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one check and record its outcome
    pub fn record<F>(&mut self, scenario: &str, check: &str, host: &str, f: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        info!(scenario, check, host, "Running check");
        let started_at = Utc::now();
        let start = Instant::now();
        let result = f();
        let duration = start.elapsed();

        let error = match result {
            Ok(()) => {
                info!(scenario, check, host, elapsed_ms = duration.as_millis() as u64, "Check passed");
                None
            }
            Err(e) => {
                warn!(scenario, check, host, error = %format!("{:#}", e), "Check failed");
                Some(format!("{:#}", e))
            }
        };

        let passed = error.is_none();
        self.outcomes.push(CheckOutcome {
            scenario: scenario.to_string(),
            check: check.to_string(),
            host: host.to_string(),
            started_at,
            duration,
            error,
        });
        passed
    }

    pub fn outcomes(&self) -> &[CheckOutcome] {
        &self.outcomes
    }

    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.passed()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes.iter().filter(|o| !o.passed())
    }
}

/// Everything a scenario needs besides the host it runs on
pub struct ScenarioContext {
    pub config: SuiteConfig,
    pub inventory: Inventory,
    pub artifacts: ArtifactStore,
}

impl ScenarioContext {
    pub fn new(config: SuiteConfig, inventory: Inventory, artifacts: ArtifactStore) -> Self {
        Self {
            config,
            inventory,
            artifacts,
        }
    }

    /// Topic source for checks running against `host`
    pub fn backend<'a>(&self, host: &'a dyn Host) -> Result<Backend<'a>, BackendError> {
        Ok(match self.config.transport {
            Transport::Curl => Backend::Curl(HostCurlTopicSource::new(
                host,
                &self.config.backend_url,
                &self.config.health_url,
            )),
            Transport::Http => Backend::Http(HttpTopicSource::new(
                &self.config.backend_url,
                &self.config.health_url,
            )?),
        })
    }

    /// Built-in log policy extended with the configured allow-list
    pub fn log_policy<F>(&self, builtin: F) -> anyhow::Result<LogPolicy>
    where
        F: FnOnce() -> Result<LogPolicy, fleetprobe_common::LogScanError>,
    {
        Ok(builtin()?.with_extra_allow_rules(&self.config.allow_list)?)
    }
}

/// Run one family against one host
pub fn run_scenario(kind: ScenarioKind, ctx: &ScenarioContext, host: &dyn Host, report: &mut Report) {
    info!(scenario = %kind, host = host.name(), "Starting scenario");
    match kind {
        ScenarioKind::LinuxAgent => linux_agent::run(ctx, host, report),
        ScenarioKind::WindowsAgent => windows_agent::run(ctx, host, report),
        ScenarioKind::Receiver => receiver::run(ctx, host, report),
        ScenarioKind::Kubernetes => kubernetes::run(ctx, host, report),
        ScenarioKind::Swarm => swarm::run(ctx, host, report),
    }
}

/// Resolve each family's hosts through the inventory and run it
///
/// With `explicit` set, a family whose hosts are missing from the inventory
/// is reported as a failure instead of being skipped.
pub fn run_selected(kinds: &[ScenarioKind], explicit: bool, ctx: &ScenarioContext, report: &mut Report) {
    for &kind in kinds {
        for member in ctx.config.group_members(kind.group()) {
            if !ctx.inventory.has_instance(&member) {
                if explicit {
                    report.record(kind.name(), "resolve_host", &member, || {
                        anyhow::bail!("instance '{}' is not in the inventory", member)
                    });
                } else {
                    info!(scenario = %kind, instance = %member, "Instance not provisioned, skipping");
                }
                continue;
            }

            let is_local = ctx
                .inventory
                .address(&member)
                .is_ok_and(|address| LOOPBACK_ADDRESSES.contains(&address));
            if is_local {
                let host = LocalHost::new(&member, kind.platform());
                run_scenario(kind, ctx, &host, report);
                continue;
            }

            match ctx.inventory.ssh_host(&member, kind.platform(), &ctx.config.ssh) {
                Ok(host) => run_scenario(kind, ctx, &host, report),
                Err(e) => {
                    report.record(kind.name(), "resolve_host", &member, || Err(e.into()));
                }
            }
        }
    }
}

/// Fetch one topic page, keep a copy, and decode it
pub(crate) fn fetch_snapshot(
    source: &dyn TopicSource,
    query: &TopicQuery,
    artifacts: &ArtifactStore,
    artifact_name: &str,
) -> anyhow::Result<TopicSnapshot> {
    let raw = source
        .fetch_raw(query)
        .with_context(|| format!("fetching topic {}", query.topic))?;
    artifacts.save_json(artifact_name, &raw);
    TopicSnapshot::from_json(&raw).with_context(|| format!("decoding topic {}", query.topic))
}

/// Wait for a log's success markers, keep a copy, then scan it for errors
pub(crate) fn check_log(
    host: &dyn Host,
    path: &str,
    policy: &LogPolicy,
    poll: &PollPolicy,
    artifacts: &ArtifactStore,
    artifact_name: &str,
) -> anyhow::Result<()> {
    wait_until(poll, || -> anyhow::Result<()> {
        let text = host.read_file(path)?;
        policy.check_markers(&text)?;
        Ok(())
    })
    .with_context(|| format!("waiting for {} markers in {}", policy.name(), path))?;

    let text = host.read_file(path)?;
    artifacts.save(artifact_name, &text);
    policy
        .check_clean(&text)
        .with_context(|| format!("scanning {} for errors", path))?;
    Ok(())
}
