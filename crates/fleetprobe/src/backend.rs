//! Topic API and receiver health clients
//!
//! The topic API replays what the receiver pushed to Kafka. It usually only
//! listens on the receiver machine's localhost, so besides a direct HTTP
//! client there is a source that shells out to `curl` on a [`Host`].

use std::time::Duration;

use fleetprobe_common::{PayloadError, TopicSnapshot};
use thiserror::Error;
use tracing::{debug, error};

use crate::host::{shell_quote, Host, HostError};

pub const GENERIC_EVENTS_TOPIC: &str = "sts_generic_events";
pub const CONNECTIONS_TOPIC: &str = "sts_correlate_endpoints";
pub const METRICS_TOPIC: &str = "sts_metrics";
pub const MULTI_METRICS_TOPIC: &str = "sts_multi_metrics";
pub const SWARM_TOPOLOGY_TOPIC: &str = "sts_topo_docker-swarm_agents";

/// Per-request timeout for the HTTP client
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Host(#[from] HostError),
}

/// One page of a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicQuery {
    pub topic: String,
    pub limit: usize,
    pub offset: Option<usize>,
}

impl TopicQuery {
    pub fn new(topic: impl Into<String>, limit: usize) -> Self {
        Self {
            topic: topic.into(),
            limit,
            offset: None,
        }
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Path and query string relative to the API base URL
    pub fn path(&self) -> String {
        match self.offset {
            Some(offset) => format!(
                "/api/topic/{}?offset={}&limit={}",
                self.topic, offset, self.limit
            ),
            None => format!("/api/topic/{}?limit={}", self.topic, self.limit),
        }
    }

    /// File name used when saving the observed page
    pub fn artifact_name(&self) -> String {
        format!("topic-{}.json", self.topic)
    }
}

/// Something that can return raw topic pages
#[cfg_attr(test, mockall::automock)]
pub trait TopicSource {
    /// Raw JSON body of one topic page
    fn fetch_raw(&self, query: &TopicQuery) -> Result<String, BackendError>;

    /// Topic page decoded into typed envelopes
    fn fetch_topic(&self, query: &TopicQuery) -> Result<TopicSnapshot, BackendError> {
        let raw = self.fetch_raw(query)?;
        Ok(TopicSnapshot::from_json(&raw)?)
    }
}

/// Receiver health endpoint
#[cfg_attr(test, mockall::automock)]
pub trait ReceiverHealth {
    /// HTTP status code of the health endpoint
    fn health_status(&self) -> Result<u16, BackendError>;

    fn is_healthy(&self) -> Result<bool, BackendError> {
        Ok(self.health_status()? == 200)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// Direct HTTP client
pub struct HttpTopicSource {
    base_url: String,
    health_url: String,
    client: reqwest::blocking::Client,
}

impl HttpTopicSource {
    pub fn new(
        base_url: impl Into<String>,
        health_url: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let base_url = base_url.into();
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| BackendError::Http {
                url: base_url.clone(),
                source,
            })?;

        Ok(Self {
            base_url,
            health_url: health_url.into(),
            client,
        })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, BackendError> {
        debug!(%url, "GET");
        self.client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .map_err(|source| BackendError::Http {
                url: url.to_string(),
                source,
            })
    }
}

impl TopicSource for HttpTopicSource {
    fn fetch_raw(&self, query: &TopicQuery) -> Result<String, BackendError> {
        let url = join_url(&self.base_url, &query.path());
        let response = self.get(&url)?;

        if !response.status().is_success() {
            let status = response.status();
            error!("Topic request failed: {} - {}", url, status);
            return Err(BackendError::Status {
                url,
                status: status.as_u16(),
            });
        }

        response
            .text()
            .map_err(|source| BackendError::Http { url, source })
    }
}

impl ReceiverHealth for HttpTopicSource {
    fn health_status(&self) -> Result<u16, BackendError> {
        Ok(self.get(&self.health_url)?.status().as_u16())
    }
}

/// Runs `curl` on a host that can reach the API
pub struct HostCurlTopicSource<'a> {
    host: &'a dyn Host,
    base_url: String,
    health_url: String,
}

impl<'a> HostCurlTopicSource<'a> {
    pub fn new(
        host: &'a dyn Host,
        base_url: impl Into<String>,
        health_url: impl Into<String>,
    ) -> Self {
        Self {
            host,
            base_url: base_url.into(),
            health_url: health_url.into(),
        }
    }
}

impl TopicSource for HostCurlTopicSource<'_> {
    /// Body of the page; curl appends the status code on a line of its own
    fn fetch_raw(&self, query: &TopicQuery) -> Result<String, BackendError> {
        let url = join_url(&self.base_url, &query.path());
        let command = format!("curl -s -w \"\\n%{{http_code}}\" {}", shell_quote(&url));
        let stdout = self.host.check_output(&command)?;

        let (body, code) = stdout
            .trim_end()
            .rsplit_once('\n')
            .unwrap_or(("", stdout.trim_end()));
        let status: u16 = code.trim().parse().map_err(|_| {
            BackendError::Host(HostError::Parse {
                command: command.clone(),
                reason: format!("'{}' is not an HTTP status code", code.trim()),
            })
        })?;

        if !(200..300).contains(&status) {
            error!("Topic request failed: {} - {}", url, status);
            return Err(BackendError::Status { url, status });
        }
        Ok(body.to_string())
    }
}

impl ReceiverHealth for HostCurlTopicSource<'_> {
    fn health_status(&self) -> Result<u16, BackendError> {
        let command = format!(
            "curl -s -o /dev/null -w \"%{{http_code}}\" {}",
            shell_quote(&self.health_url)
        );
        let stdout = self.host.check_output(&command)?;

        stdout.trim().parse().map_err(|_| {
            BackendError::Host(HostError::Parse {
                command,
                reason: format!("'{}' is not an HTTP status code", stdout.trim()),
            })
        })
    }
}

/// Whichever source the configured transport selects
pub enum Backend<'a> {
    Curl(HostCurlTopicSource<'a>),
    Http(HttpTopicSource),
}

impl TopicSource for Backend<'_> {
    fn fetch_raw(&self, query: &TopicQuery) -> Result<String, BackendError> {
        match self {
            Self::Curl(source) => source.fetch_raw(query),
            Self::Http(source) => source.fetch_raw(query),
        }
    }
}

impl ReceiverHealth for Backend<'_> {
    fn health_status(&self) -> Result<u16, BackendError> {
        match self {
            Self::Curl(source) => source.health_status(),
            Self::Http(source) => source.health_status(),
        }
    }
}
