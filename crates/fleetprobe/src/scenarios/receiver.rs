//! Receiver machine: docker layout, health, and what the agents delivered

use std::collections::BTreeSet;

use anyhow::{bail, ensure, Context};
use fleetprobe_common::{
    find_incoming_connection, find_outgoing_connection, wait_until, Connection, ConnectionType,
    Direction, PollPolicy, TopicSnapshot,
};

use super::{fetch_snapshot, Report, ScenarioContext};
use crate::artifacts::ArtifactStore;
use crate::backend::{
    ReceiverHealth, TopicQuery, TopicSource, CONNECTIONS_TOPIC, GENERIC_EVENTS_TOPIC,
    METRICS_TOPIC, MULTI_METRICS_TOPIC,
};
use crate::host::{Host, PathKind};
use crate::inventory::Inventory;

const SCENARIO: &str = "receiver";

pub const DOCKER_DIR: &str = "/etc/docker/";
pub const COMPOSE_FILE: &str = "/home/ubuntu/docker-compose.yml";

/// Event names every agent host must have reported, exactly
pub const EXPECTED_EVENTS: [(&str, &[&str]); 3] = [
    ("agent-ubuntu", &["System.Agent Startup", "processStateEvent"]),
    ("agent-fedora", &["System.Agent Startup", "processStateEvent"]),
    ("agent-win", &["System.Agent Startup"]),
];

/// Value keys of a `processMetrics` multi-metric
pub const PROCESS_METRIC_KEYS: [&str; 22] = [
    "cpu_nice",
    "cpu_userPct",
    "cpu_userTime",
    "cpu_systemPct",
    "cpu_numThreads",
    "io_writeRate",
    "io_writeBytesRate",
    "cpu_totalPct",
    "voluntaryCtxSwitches",
    "mem_dirty",
    "involuntaryCtxSwitches",
    "io_readRate",
    "openFdCount",
    "mem_shared",
    "cpu_systemTime",
    "io_readBytesRate",
    "mem_data",
    "mem_vms",
    "mem_lib",
    "mem_text",
    "mem_swap",
    "mem_rss",
];

/// Acceptable range of a reported value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    Any,
    Exactly(f64),
    Above(f64),
    Between(f64, f64),
}

impl Bound {
    pub fn holds(&self, value: f64) -> bool {
        match *self {
            Self::Any => true,
            Self::Exactly(expected) => value == expected,
            Self::Above(min) => value > min,
            Self::Between(min, max) => value > min && value < max,
        }
    }
}

/// Host metric bounds for a small cloud VM without swap
pub const HOST_METRIC_BOUNDS: [(&str, Bound); 12] = [
    ("system.swap.total", Bound::Exactly(0.0)),
    ("system.swap.pct_free", Bound::Exactly(1.0)),
    ("system.mem.total", Bound::Above(900.0)),
    ("system.mem.usable", Bound::Between(500.0, 1000.0)),
    ("system.mem.pct_usable", Bound::Between(0.5, 1.0)),
    ("system.load.norm.1", Bound::Above(0.0)),
    ("system.cpu.idle", Bound::Above(0.0)),
    ("system.cpu.iowait", Bound::Above(0.0)),
    ("system.cpu.system", Bound::Above(0.0)),
    ("system.cpu.user", Bound::Above(0.0)),
    ("system.fs.file_handles.in_use", Bound::Above(0.0)),
    ("system.fs.file_handles.max", Bound::Above(10000.0)),
];

/// Public and private address of one agent VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmAddresses {
    pub public: String,
    pub private: String,
}

impl VmAddresses {
    fn from_inventory(inventory: &Inventory, instance: &str) -> anyhow::Result<Self> {
        Ok(Self {
            public: inventory.address(instance)?.to_string(),
            private: inventory.private_address(instance)?.to_string(),
        })
    }
}

/// The three agent VMs taking part in the connection tests
///
/// Fedora and Windows connect to a listener on Ubuntu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPeers {
    pub ubuntu: VmAddresses,
    pub fedora: VmAddresses,
    pub windows: VmAddresses,
}

impl ConnectionPeers {
    pub fn from_inventory(inventory: &Inventory) -> anyhow::Result<Self> {
        Ok(Self {
            ubuntu: VmAddresses::from_inventory(inventory, "agent-ubuntu")?,
            fedora: VmAddresses::from_inventory(inventory, "agent-fedora")?,
            windows: VmAddresses::from_inventory(inventory, "agent-win")?,
        })
    }
}

/// Which end of the connection reported it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Seen from the sender: local is the origin, remote is the listener
    Sender,
    /// Seen from the listener: local is the listener, remote is the origin
    Listener,
}

/// Expected shape of one observed connection
#[derive(Debug, Clone)]
pub struct ConnectionCheck {
    pub label: &'static str,
    pub side: Side,
    pub origin: String,
    pub dest: String,
    pub direction: Direction,
    pub sent: Bound,
    pub received: Bound,
}

impl ConnectionCheck {
    fn locate<'a>(&self, snapshot: &'a TopicSnapshot, port: u16) -> Option<&'a Connection> {
        match self.side {
            Side::Sender => find_outgoing_connection(snapshot, port, &self.origin, &self.dest),
            Side::Listener => find_incoming_connection(snapshot, port, &self.origin, &self.dest),
        }
    }

    pub fn verify(&self, snapshot: &TopicSnapshot, port: u16) -> anyhow::Result<()> {
        let conn = self.locate(snapshot, port).with_context(|| {
            format!(
                "{}: no connection {} -> {} on port {}",
                self.label, self.origin, self.dest, port
            )
        })?;

        ensure!(
            conn.direction == self.direction,
            "{}: direction {:?}, expected {:?}",
            self.label,
            conn.direction,
            self.direction
        );
        ensure!(
            conn.connection_type == ConnectionType::Tcp,
            "{}: connection type {:?}, expected TCP",
            self.label,
            conn.connection_type
        );
        ensure!(
            self.sent.holds(conn.bytes_sent_per_second),
            "{}: bytesSentPerSecond {} outside {:?}",
            self.label,
            conn.bytes_sent_per_second,
            self.sent
        );
        ensure!(
            self.received.holds(conn.bytes_received_per_second),
            "{}: bytesReceivedPerSecond {} outside {:?}",
            self.label,
            conn.bytes_received_per_second,
            self.received
        );
        Ok(())
    }
}

/// Connections opened after the agents started, with traffic metrics
///
/// The Windows agent does not collect byte rates on the sending side.
pub fn after_start_checks(peers: &ConnectionPeers) -> Vec<ConnectionCheck> {
    vec![
        ConnectionCheck {
            label: "fedora outgoing",
            side: Side::Sender,
            origin: peers.fedora.private.clone(),
            dest: peers.ubuntu.public.clone(),
            direction: Direction::Outgoing,
            sent: Bound::Above(10.0),
            received: Bound::Exactly(0.0),
        },
        ConnectionCheck {
            label: "fedora incoming",
            side: Side::Listener,
            origin: peers.fedora.public.clone(),
            dest: peers.ubuntu.private.clone(),
            direction: Direction::Incoming,
            sent: Bound::Exactly(0.0),
            received: Bound::Above(10.0),
        },
        ConnectionCheck {
            label: "windows outgoing",
            side: Side::Sender,
            origin: peers.windows.private.clone(),
            dest: peers.ubuntu.public.clone(),
            direction: Direction::Outgoing,
            sent: Bound::Exactly(0.0),
            received: Bound::Exactly(0.0),
        },
        ConnectionCheck {
            label: "windows incoming",
            side: Side::Listener,
            origin: peers.windows.public.clone(),
            dest: peers.ubuntu.private.clone(),
            direction: Direction::Incoming,
            sent: Bound::Exactly(0.0),
            received: Bound::Above(10.0),
        },
    ]
}

/// Connections that already existed when the agents started
///
/// Linux `/proc` scanning cannot tell the direction of an outgoing
/// connection that predates the agent.
pub fn before_start_checks(peers: &ConnectionPeers) -> Vec<ConnectionCheck> {
    let check = |label, side, origin: &str, dest: &str, direction| ConnectionCheck {
        label,
        side,
        origin: origin.to_string(),
        dest: dest.to_string(),
        direction,
        sent: Bound::Any,
        received: Bound::Any,
    };

    vec![
        check(
            "fedora outgoing",
            Side::Sender,
            &peers.fedora.private,
            &peers.ubuntu.public,
            Direction::None,
        ),
        check(
            "fedora incoming",
            Side::Listener,
            &peers.fedora.public,
            &peers.ubuntu.private,
            Direction::Incoming,
        ),
        check(
            "windows outgoing",
            Side::Sender,
            &peers.windows.private,
            &peers.ubuntu.public,
            Direction::Outgoing,
        ),
        check(
            "windows incoming",
            Side::Listener,
            &peers.windows.public,
            &peers.ubuntu.private,
            Direction::Incoming,
        ),
    ]
}

pub fn docker_layout(host: &dyn Host) -> anyhow::Result<()> {
    let dir = host.path_kind(DOCKER_DIR)?;
    ensure!(dir == PathKind::Directory, "{} is {:?}, expected a directory", DOCKER_DIR, dir);

    let compose = host.path_kind(COMPOSE_FILE)?;
    ensure!(compose == PathKind::File, "{} is {:?}, expected a file", COMPOSE_FILE, compose);
    Ok(())
}

pub fn receiver_healthy(health: &dyn ReceiverHealth) -> anyhow::Result<()> {
    let status = health.health_status()?;
    ensure!(status == 200, "receiver health returned {}", status);
    Ok(())
}

pub fn generic_events(
    source: &dyn TopicSource,
    poll: &PollPolicy,
    artifacts: &ArtifactStore,
) -> anyhow::Result<()> {
    let query = TopicQuery::new(GENERIC_EVENTS_TOPIC, 40).with_offset(0);

    wait_until(poll, || -> anyhow::Result<()> {
        let snapshot = fetch_snapshot(source, &query, artifacts, &query.artifact_name())?;
        let events = snapshot.events_by_host();

        for (host, names) in EXPECTED_EVENTS {
            let expected: BTreeSet<String> = names.iter().map(|s| s.to_string()).collect();
            let actual = events.get(host).cloned().unwrap_or_default();
            ensure!(
                actual == expected,
                "events from {}: {:?}, expected {:?}",
                host,
                actual,
                expected
            );
        }
        Ok(())
    })
}

/// Verify a batch of connection checks against the connections topic
pub fn connections(
    source: &dyn TopicSource,
    poll: &PollPolicy,
    artifacts: &ArtifactStore,
    checks: &[ConnectionCheck],
    port: u16,
) -> anyhow::Result<()> {
    let query = TopicQuery::new(CONNECTIONS_TOPIC, 1000);

    wait_until(poll, || -> anyhow::Result<()> {
        let snapshot = fetch_snapshot(source, &query, artifacts, &query.artifact_name())?;
        for check in checks {
            check.verify(&snapshot, port)?;
        }
        Ok(())
    })
}

pub fn host_metrics(
    source: &dyn TopicSource,
    poll: &PollPolicy,
    artifacts: &ArtifactStore,
) -> anyhow::Result<()> {
    let query = TopicQuery::new(METRICS_TOPIC, 1000);

    wait_until(poll, || -> anyhow::Result<()> {
        let snapshot = fetch_snapshot(source, &query, artifacts, &query.artifact_name())?;
        let metrics = snapshot.latest_metric_values();

        for (name, bound) in HOST_METRIC_BOUNDS {
            let value = *metrics
                .get(name)
                .with_context(|| format!("metric {} not reported yet", name))?;
            ensure!(bound.holds(value), "{} = {} outside {:?}", name, value, bound);
        }
        Ok(())
    })
}

pub fn process_metrics(
    source: &dyn TopicSource,
    poll: &PollPolicy,
    artifacts: &ArtifactStore,
) -> anyhow::Result<()> {
    let query = TopicQuery::new(MULTI_METRICS_TOPIC, 1000);
    let expected: BTreeSet<&str> = PROCESS_METRIC_KEYS.into_iter().collect();

    wait_until(poll, || -> anyhow::Result<()> {
        let snapshot = fetch_snapshot(source, &query, artifacts, &query.artifact_name())?;
        let Some(metric) = snapshot.multi_metrics().find(|m| m.name == "processMetrics") else {
            bail!("no processMetrics multi-metric reported yet");
        };

        let actual: BTreeSet<&str> = metric.values.keys().map(String::as_str).collect();
        ensure!(
            actual == expected,
            "processMetrics keys differ: missing {:?}, unexpected {:?}",
            expected.difference(&actual).collect::<Vec<_>>(),
            actual.difference(&expected).collect::<Vec<_>>()
        );
        Ok(())
    })
}

pub fn run(ctx: &ScenarioContext, host: &dyn Host, report: &mut Report) {
    let name = host.name();

    report.record(SCENARIO, "docker_layout", name, || docker_layout(host));

    let backend = match ctx.backend(host) {
        Ok(backend) => backend,
        Err(e) => {
            report.record(SCENARIO, "backend", name, || Err(e.into()));
            return;
        }
    };

    report.record(SCENARIO, "receiver_healthy", name, || receiver_healthy(&backend));

    report.record(SCENARIO, "generic_events", name, || {
        generic_events(&backend, &ctx.config.poll.short()?, &ctx.artifacts)
    });

    report.record(SCENARIO, "connections_after_start", name, || {
        let peers = ConnectionPeers::from_inventory(&ctx.inventory)?;
        let port = ctx.inventory.var_as::<u16>("test_connection_port_after_start")?;
        connections(
            &backend,
            &ctx.config.poll.short()?,
            &ctx.artifacts,
            &after_start_checks(&peers),
            port,
        )
    });

    report.record(SCENARIO, "connections_before_start", name, || {
        let peers = ConnectionPeers::from_inventory(&ctx.inventory)?;
        let port = ctx.inventory.var_as::<u16>("test_connection_port_before_start")?;
        connections(
            &backend,
            &ctx.config.poll.short()?,
            &ctx.artifacts,
            &before_start_checks(&peers),
            port,
        )
    });

    report.record(SCENARIO, "host_metrics", name, || {
        host_metrics(&backend, &ctx.config.poll.short()?, &ctx.artifacts)
    });

    report.record(SCENARIO, "process_metrics", name, || {
        process_metrics(&backend, &ctx.config.poll.short()?, &ctx.artifacts)
    });
}
