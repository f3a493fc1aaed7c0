//! Client for the Cassandra administrative interface
//!
//! Cassandra exposes StorageService attributes over an HTTP+JSON bridge.
//! Responses wrap the attribute payload in a `value` field. This client
//! reports distinct errors for a non-200 response (naming expected vs
//! actual code), malformed JSON, and a missing value payload.
//!
//! No retries happen at this layer; retry policy belongs to the periodic
//! resync mechanism.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::debug;

use crate::version::Version;
use crate::Error;

/// Default port of the administrative HTTP bridge
pub const DEFAULT_ADMIN_PORT: u16 = 8778;

/// Fixed introspection path for StorageService attributes
const STORAGE_SERVICE_PATH: &str = "/jolokia/read/org.apache.cassandra.db:type=StorageService";

/// Raw administrative snapshot of a Cassandra node.
///
/// Field names follow the StorageService attribute names as reported by
/// the HTTP bridge.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "PascalCase")]
pub struct AdminStatus {
    /// Mapping from host address to host id for every known node
    pub host_id_map: BTreeMap<String, String>,

    /// Hosts currently considered live
    pub live_nodes: Vec<String>,

    /// Hosts currently considered unreachable
    pub unreachable_nodes: Vec<String>,

    /// Hosts leaving the ring
    pub leaving_nodes: Vec<String>,

    /// Hosts joining the ring
    pub joining_nodes: Vec<String>,

    /// Hosts moving tokens
    pub moving_nodes: Vec<String>,

    /// Host id of the queried node itself
    pub local_host_id: Option<String>,

    /// Cassandra release version of the queried node
    pub release_version: Option<String>,
}

impl AdminStatus {
    /// True when the snapshot carries no node information at all
    pub fn is_empty(&self) -> bool {
        self.host_id_map.is_empty()
            && self.live_nodes.is_empty()
            && self.unreachable_nodes.is_empty()
            && self.leaving_nodes.is_empty()
            && self.joining_nodes.is_empty()
            && self.moving_nodes.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    value: Option<AdminStatus>,
}

/// HTTP client for a single node's administrative interface
#[derive(Clone)]
pub struct AdminClient {
    base_url: String,
    http: reqwest::Client,
}

impl AdminClient {
    /// Create a client for the given base URL (e.g. `http://127.0.0.1:8778`)
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    /// Fetch the current administrative snapshot.
    ///
    /// Errors distinguish transport failures, unexpected status codes,
    /// malformed JSON and an absent value payload.
    pub async fn status(&self) -> crate::Result<AdminStatus> {
        let url = format!("{}{}", self.base_url, STORAGE_SERVICE_PATH);
        debug!(url = %url, "Querying admin interface");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::admin(format!("request to {url} failed: {e}")))?;

        let code = response.status();
        if code != reqwest::StatusCode::OK {
            return Err(Error::admin(format!(
                "unexpected status code from {url}: expected 200, got {}",
                code.as_u16()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::admin(format!("failed to read response body: {e}")))?;
        let parsed: ReadResponse = serde_json::from_str(&body)
            .map_err(|e| Error::admin(format!("malformed introspection response: {e}")))?;

        parsed
            .value
            .ok_or_else(|| Error::admin("introspection response missing value payload"))
    }

    /// Fetch the node's release version.
    ///
    /// A snapshot without a release version is an error: the node is
    /// expected to always report one once its admin interface is up.
    pub async fn version(&self) -> crate::Result<Version> {
        let status = self.status().await?;
        let raw = status
            .release_version
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::admin("admin status missing ReleaseVersion field"))?;
        Version::parse(&raw)
    }
}
