//! Topology assertion matching
//!
//! Lookups scan a [`TopicSnapshot`] in stored order and return the first
//! entity of the requested type for which both the identifier predicate and
//! the data predicate hold. Absence is reported as `None`; turning absence
//! into a failure is left to [`Expectation::require`] or the caller.

use std::fmt;
use std::marker::PhantomData;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::payload::{Component, Connection, EntityData, Relation, TopicSnapshot};

/// Errors from declarative topology expectations
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("Invalid external id pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("{description}: no {kind} of type '{type_name}' matched")]
    NotFound {
        kind: &'static str,
        description: String,
        type_name: String,
    },
}

/// Common view over components and relations
pub trait Entity: Sized + 'static {
    /// Human readable kind, used in diagnostics
    const KIND: &'static str;

    fn external_id(&self) -> &str;

    fn type_name(&self) -> &str;

    fn data(&self) -> &EntityData;

    /// All entities of this kind in the snapshot, in stored order
    fn all(snapshot: &TopicSnapshot) -> Box<dyn Iterator<Item = &Self> + '_>;
}

impl Entity for Component {
    const KIND: &'static str = "component";

    fn external_id(&self) -> &str {
        &self.external_id
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn data(&self) -> &EntityData {
        &self.data
    }

    fn all(snapshot: &TopicSnapshot) -> Box<dyn Iterator<Item = &Self> + '_> {
        Box::new(snapshot.components())
    }
}

impl Entity for Relation {
    const KIND: &'static str = "relation";

    fn external_id(&self) -> &str {
        &self.external_id
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn data(&self) -> &EntityData {
        &self.data
    }

    fn all(snapshot: &TopicSnapshot) -> Box<dyn Iterator<Item = &Self> + '_> {
        Box::new(snapshot.relations())
    }
}

/// First entity of `type_name` satisfying both predicates
pub fn find_entity<'a, E, I, D>(
    snapshot: &'a TopicSnapshot,
    type_name: &str,
    external_id_pred: I,
    data_pred: D,
) -> Option<&'a E>
where
    E: Entity + 'a,
    I: Fn(&str) -> bool,
    D: Fn(&EntityData) -> bool,
{
    E::all(snapshot)
        .filter(|e| e.type_name() == type_name)
        .find(|e| external_id_pred(e.external_id()) && data_pred(e.data()))
}

pub fn find_component<'a, I, D>(
    snapshot: &'a TopicSnapshot,
    type_name: &str,
    external_id_pred: I,
    data_pred: D,
) -> Option<&'a Component>
where
    I: Fn(&str) -> bool,
    D: Fn(&EntityData) -> bool,
{
    find_entity(snapshot, type_name, external_id_pred, data_pred)
}

pub fn find_relation<'a, I, D>(
    snapshot: &'a TopicSnapshot,
    type_name: &str,
    external_id_pred: I,
    data_pred: D,
) -> Option<&'a Relation>
where
    I: Fn(&str) -> bool,
    D: Fn(&EntityData) -> bool,
{
    find_entity(snapshot, type_name, external_id_pred, data_pred)
}

/// Walk a nested path of object keys inside entity data
pub fn data_path<'a>(data: &'a EntityData, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    rest.iter()
        .try_fold(data.get(*first)?, |value, key| value.get(*key))
}

type DataPredicate = Box<dyn Fn(&EntityData) -> bool + Send + Sync>;

/// A described expectation that a matching entity exists
pub struct Expectation<E> {
    description: String,
    type_name: String,
    external_id: Regex,
    data: DataPredicate,
    _kind: PhantomData<fn() -> E>,
}

impl<E: Entity> Expectation<E> {
    /// Expect an entity of `type_name` whose external id matches `pattern`
    ///
    /// The pattern is searched for anywhere in the identifier. Any data is
    /// accepted until [`Expectation::with_data`] narrows it.
    pub fn new(
        description: impl Into<String>,
        type_name: impl Into<String>,
        external_id_pattern: &str,
    ) -> Result<Self, TopologyError> {
        Ok(Self {
            description: description.into(),
            type_name: type_name.into(),
            external_id: Regex::new(external_id_pattern)?,
            data: Box::new(|_| true),
            _kind: PhantomData,
        })
    }

    /// Require the entity data to satisfy `predicate`
    pub fn with_data<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&EntityData) -> bool + Send + Sync + 'static,
    {
        self.data = Box::new(predicate);
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn find<'a>(&self, snapshot: &'a TopicSnapshot) -> Option<&'a E> {
        find_entity(
            snapshot,
            &self.type_name,
            |id| self.external_id.is_match(id),
            |data| (self.data)(data),
        )
    }

    /// Like [`Expectation::find`] but absence becomes a descriptive error
    pub fn require<'a>(&self, snapshot: &'a TopicSnapshot) -> Result<&'a E, TopologyError> {
        debug!(assertion = %self.description, "Checking topology expectation");
        self.find(snapshot).ok_or_else(|| TopologyError::NotFound {
            kind: E::KIND,
            description: self.description.clone(),
            type_name: self.type_name.clone(),
        })
    }
}

impl Expectation<Component> {
    pub fn component(
        description: impl Into<String>,
        type_name: impl Into<String>,
        external_id_pattern: &str,
    ) -> Result<Self, TopologyError> {
        Self::new(description, type_name, external_id_pattern)
    }
}

impl Expectation<Relation> {
    pub fn relation(
        description: impl Into<String>,
        type_name: impl Into<String>,
        external_id_pattern: &str,
    ) -> Result<Self, TopologyError> {
        Self::new(description, type_name, external_id_pattern)
    }
}

impl<E> fmt::Debug for Expectation<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expectation")
            .field("description", &self.description)
            .field("type_name", &self.type_name)
            .field("external_id", &self.external_id.as_str())
            .finish_non_exhaustive()
    }
}

/// Check every expectation in order, stopping at the first missing entity
pub fn require_all<'a, E: Entity>(
    snapshot: &'a TopicSnapshot,
    expectations: &[Expectation<E>],
) -> Result<Vec<&'a E>, TopologyError> {
    expectations.iter().map(|e| e.require(snapshot)).collect()
}

/// Connection as seen from the sending endpoint
pub fn find_outgoing_connection<'a>(
    snapshot: &'a TopicSnapshot,
    port: u16,
    origin: &str,
    dest: &str,
) -> Option<&'a Connection> {
    snapshot.connections().find(|c| {
        c.remote_port() == port && c.remote_address() == dest && c.local_address() == origin
    })
}

/// Connection as seen from the receiving endpoint
pub fn find_incoming_connection<'a>(
    snapshot: &'a TopicSnapshot,
    port: u16,
    origin: &str,
    dest: &str,
) -> Option<&'a Connection> {
    snapshot.connections().find(|c| {
        c.local_port() == port && c.local_address() == dest && c.remote_address() == origin
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    fn component(external_id: &str, type_name: &str, data: Value) -> Value {
        json!({ "message": { "TopologyElement": { "payload": { "TopologyComponent": {
            "externalId": external_id,
            "typeName": type_name,
            "data": data.to_string()
        } } } } })
    }

    fn relation(external_id: &str, type_name: &str) -> Value {
        json!({ "message": { "TopologyElement": { "payload": { "TopologyRelation": {
            "externalId": external_id,
            "typeName": type_name,
            "data": "{}"
        } } } } })
    }

    fn swarm_snapshot() -> TopicSnapshot {
        TopicSnapshot::from_value(json!({ "messages": [
            component("urn:swarm-service:/kafka1", "swarm-service", json!({
                "name": "agent_kafka",
                "image": "wurstmeister/kafka:2.12-2.3.1@sha256:1",
                "spec": { "Mode": { "Replicated": { "Replicas": 1 } } }
            })),
            component("urn:swarm-service:/nginx1", "swarm-service", json!({
                "name": "nginx",
                "image": "nginx:latest@sha256:2",
                "spec": { "Mode": { "Global": {} } }
            })),
            component("urn:container:/c1", "container", json!({ "name": "nginx" })),
            relation("urn:swarm-service:/nginx1->urn:container:/c1", "creates"),
            relation("urn:swarm-service:/kafka1->urn:container:/c2", "creates"),
        ] }))
        .unwrap()
    }

    fn connection(local: (&str, u16), remote: (&str, u16), direction: &str) -> Value {
        json!({
            "direction": direction,
            "connectionType": "TCP",
            "localEndpoint": { "endpoint": { "ip": { "address": local.0 }, "port": local.1 } },
            "remoteEndpoint": { "endpoint": { "ip": { "address": remote.0 }, "port": remote.1 } }
        })
    }

    #[test]
    fn test_empty_snapshot_has_no_match() {
        let snapshot = TopicSnapshot::default();
        assert!(find_component(&snapshot, "swarm-service", |_| true, |_| true).is_none());
        assert!(find_relation(&snapshot, "creates", |_| true, |_| true).is_none());
    }

    #[test]
    fn test_data_predicate_selects_nginx_not_kafka() {
        let snapshot = swarm_snapshot();
        let found = find_component(&snapshot, "swarm-service", |_| true, |d| d["name"] == "nginx")
            .unwrap();

        assert_eq!(found.external_id, "urn:swarm-service:/nginx1");
    }

    #[test]
    fn test_type_filter_is_exact() {
        let snapshot = swarm_snapshot();
        let found = find_component(&snapshot, "container", |_| true, |d| d["name"] == "nginx")
            .unwrap();
        assert_eq!(found.type_name, "container");

        assert!(find_component(&snapshot, "swarm", |_| true, |_| true).is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let snapshot = swarm_snapshot();
        let found = find_component(&snapshot, "swarm-service", |_| true, |_| true).unwrap();
        assert_eq!(found.data["name"], "agent_kafka");
    }

    #[test]
    fn test_both_predicates_must_hold() {
        let snapshot = swarm_snapshot();
        let found = find_component(
            &snapshot,
            "swarm-service",
            |id| id.ends_with("kafka1"),
            |d| d["name"] == "nginx",
        );
        assert!(found.is_none());
    }

    #[test]
    fn test_relation_pattern_match() {
        let snapshot = swarm_snapshot();
        let pattern = Regex::new(r"urn:swarm-service:/.*->urn:container:/.*").unwrap();
        let found = find_relation(&snapshot, "creates", |id| pattern.is_match(id), |_| true).unwrap();
        assert_eq!(found.external_id, "urn:swarm-service:/nginx1->urn:container:/c1");

        let none = find_relation(&snapshot, "creates", |id| id.contains("urn:volume:"), |_| true);
        assert!(none.is_none());
    }

    #[test]
    fn test_expectation_require_reports_description() {
        let snapshot = swarm_snapshot();
        let expectation = Expectation::component(
            "Should find the zookeeper swarm service component",
            "swarm-service",
            r"urn:swarm-service:/.*",
        )
        .unwrap()
        .with_data(|d| d["name"] == "agent_zookeeper");

        let err = expectation.require(&snapshot).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Should find the zookeeper swarm service component: no component of type 'swarm-service' matched"
        );
    }

    #[test]
    fn test_require_all_stops_at_first_missing() {
        let snapshot = swarm_snapshot();
        let expectations = vec![
            Expectation::component("nginx", "swarm-service", "urn:swarm-service:/")
                .unwrap()
                .with_data(|d| d["name"] == "nginx"),
            Expectation::component("kafka", "swarm-service", "urn:swarm-service:/")
                .unwrap()
                .with_data(|d| d["name"] == "agent_kafka"),
        ];
        let found = require_all(&snapshot, &expectations).unwrap();
        assert_eq!(found.len(), 2);

        let missing = vec![
            Expectation::relation("volume", "mounts", ".*").unwrap(),
            Expectation::relation("creates", "creates", ".*").unwrap(),
        ];
        match require_all(&snapshot, &missing) {
            Err(TopologyError::NotFound { description, kind, .. }) => {
                assert_eq!(description, "volume");
                assert_eq!(kind, "relation");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_pattern() {
        let result = Expectation::component("broken", "swarm-service", "urn:(");
        assert!(matches!(result, Err(TopologyError::InvalidPattern(_))));
    }

    #[test_case(&["spec", "Mode", "Replicated", "Replicas"], Some(json!(1)) ; "nested value")]
    #[test_case(&["spec", "Mode", "Global"], None ; "missing branch")]
    #[test_case(&["name"], Some(json!("agent_kafka")) ; "top level")]
    #[test_case(&[], None ; "empty path")]
    fn test_data_path(path: &[&str], expected: Option<Value>) {
        let snapshot = swarm_snapshot();
        let kafka = snapshot.components().next().unwrap();
        assert_eq!(data_path(&kafka.data, path).cloned(), expected);
    }

    #[test]
    fn test_connection_finders() {
        let snapshot = TopicSnapshot::from_value(json!({ "messages": [
            { "message": { "Connections": { "connections": [
                connection(("172.31.0.5", 51000), ("54.1.2.3", 7777), "OUTGOING"),
                connection(("172.31.0.9", 7777), ("54.9.9.9", 51000), "INCOMING"),
            ] } } }
        ] }))
        .unwrap();

        let outgoing = find_outgoing_connection(&snapshot, 7777, "172.31.0.5", "54.1.2.3").unwrap();
        assert_eq!(outgoing.local_port(), 51000);

        let incoming = find_incoming_connection(&snapshot, 7777, "54.9.9.9", "172.31.0.9").unwrap();
        assert_eq!(incoming.remote_port(), 51000);

        assert!(find_outgoing_connection(&snapshot, 7777, "172.31.0.9", "54.1.2.3").is_none());
        assert!(find_incoming_connection(&snapshot, 8888, "54.9.9.9", "172.31.0.9").is_none());
    }
}
