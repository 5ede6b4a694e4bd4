//! Typed topic payloads
//!
//! The topic API returns `{"messages": [{"key": .., "message": {"<Kind>": {..}}}]}`.
//! Every envelope is decoded into a tagged [`Payload`] when the snapshot is
//! fetched, so a malformed message is rejected up front instead of failing
//! deep inside an assertion.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors that can occur while decoding a topic snapshot
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Malformed topic payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Attached attributes of a topology entity
pub type EntityData = Map<String, Value>;

/// One point-in-time read of a topic
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicSnapshot {
    #[serde(default)]
    pub messages: Vec<Envelope>,
}

/// A single message wrapper as returned by the topic API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub key: Option<String>,
    pub message: Payload,
}

/// Known payload kinds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    GenericEvent(GenericEvent),
    Connections(Connections),
    Metric(Metric),
    MultiMetric(MultiMetric),
    TopologyElement(TopologyElement),
}

/// Event emitted by an agent (startup, process state changes, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericEvent {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connections {
    #[serde(default)]
    pub connections: Vec<Connection>,
}

/// Direction of a connection as seen from the reporting side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Incoming,
    Outgoing,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionType {
    Tcp,
    Udp,
}

/// Network connection observed by a process agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub direction: Direction,
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub bytes_sent_per_second: f64,
    #[serde(default)]
    pub bytes_received_per_second: f64,
    pub local_endpoint: EndpointRef,
    pub remote_endpoint: EndpointRef,
}

impl Connection {
    pub fn local_address(&self) -> &str {
        &self.local_endpoint.endpoint.ip.address
    }

    pub fn local_port(&self) -> u16 {
        self.local_endpoint.endpoint.port
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_endpoint.endpoint.ip.address
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_endpoint.endpoint.port
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRef {
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddress,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAddress {
    pub address: String,
}

/// Single-valued metric series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub value: Vec<MetricValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricValue {
    pub value: f64,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Metric carrying several named values under one set of tags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiMetric {
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyElement {
    pub payload: TopologyPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TopologyPayload {
    TopologyComponent(Component),
    TopologyRelation(Relation),
}

/// A monitored resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub external_id: String,
    pub type_name: String,
    #[serde(default, deserialize_with = "deserialize_entity_data")]
    pub data: EntityData,
}

/// A directed association between two resources
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub external_id: String,
    pub type_name: String,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_entity_data")]
    pub data: EntityData,
}

/// Topology data is usually shipped as a JSON-encoded string.
fn deserialize_entity_data<'de, D>(deserializer: D) -> Result<EntityData, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        Value::String(raw) if raw.trim().is_empty() => Ok(Map::new()),
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(D::Error::custom(format!(
                "topology data must be an object, got {}",
                other
            ))),
            Err(e) => Err(D::Error::custom(format!("invalid topology data: {}", e))),
        },
        other => Err(D::Error::custom(format!(
            "topology data must be an object, got {}",
            other
        ))),
    }
}

impl TopicSnapshot {
    /// Decode a topic API response
    pub fn from_json(raw: &str) -> Result<Self, PayloadError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_value(value: Value) -> Result<Self, PayloadError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn payloads(&self) -> impl Iterator<Item = &Payload> {
        self.messages.iter().map(|m| &m.message)
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.payloads().filter_map(|p| match p {
            Payload::TopologyElement(TopologyElement {
                payload: TopologyPayload::TopologyComponent(c),
            }) => Some(c),
            _ => None,
        })
    }

    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.payloads().filter_map(|p| match p {
            Payload::TopologyElement(TopologyElement {
                payload: TopologyPayload::TopologyRelation(r),
            }) => Some(r),
            _ => None,
        })
    }

    pub fn generic_events(&self) -> impl Iterator<Item = &GenericEvent> {
        self.payloads().filter_map(|p| match p {
            Payload::GenericEvent(e) => Some(e),
            _ => None,
        })
    }

    /// All connections across every `Connections` message, in order
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.payloads()
            .filter_map(|p| match p {
                Payload::Connections(c) => Some(c.connections.iter()),
                _ => None,
            })
            .flatten()
    }

    pub fn metrics(&self) -> impl Iterator<Item = &Metric> {
        self.payloads().filter_map(|p| match p {
            Payload::Metric(m) => Some(m),
            _ => None,
        })
    }

    pub fn multi_metrics(&self) -> impl Iterator<Item = &MultiMetric> {
        self.payloads().filter_map(|p| match p {
            Payload::MultiMetric(m) => Some(m),
            _ => None,
        })
    }

    /// Event names grouped by reporting host
    pub fn events_by_host(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut events: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for event in self.generic_events() {
            events
                .entry(event.host.clone())
                .or_default()
                .insert(event.name.clone());
        }
        events
    }

    /// Metric name to value, later values overwriting earlier ones
    pub fn latest_metric_values(&self) -> BTreeMap<String, f64> {
        self.metrics()
            .flat_map(|m| m.value.iter().map(move |v| (m.name.clone(), v.value)))
            .collect()
    }

    /// Union of value keys over multi-metrics with the given name
    ///
    /// When `required_tag` is set only metrics carrying that tag count.
    pub fn multi_metric_keys(&self, name: &str, required_tag: Option<&str>) -> BTreeSet<String> {
        self.multi_metrics()
            .filter(|m| m.name == name)
            .filter(|m| required_tag.map_or(true, |tag| m.tags.contains_key(tag)))
            .flat_map(|m| m.values.keys().cloned())
            .collect()
    }
}
