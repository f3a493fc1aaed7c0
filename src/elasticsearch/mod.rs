//! Elasticsearch pilot support
//!
//! Elasticsearch reports its identity on the HTTP root endpoint. The pilot
//! only needs the version from it; cluster membership is left to the
//! database's own discovery.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::controller::PilotStrategy;
use crate::crd::{ElasticsearchPilotStatus, Pilot, PilotStatus};
use crate::process::CommandDescriptor;
use crate::version::Version;
use crate::Error;

/// Default port of the HTTP interface
pub const DEFAULT_HTTP_PORT: u16 = 9200;

#[derive(Debug, Deserialize)]
struct RootResponse {
    version: Option<VersionInfo>,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    number: Option<String>,
}

/// Database-specific behaviour for Elasticsearch nodes
pub struct ElasticsearchStrategy {
    base_url: String,
    http: reqwest::Client,
}

impl ElasticsearchStrategy {
    /// Create a strategy talking to the given HTTP base URL
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

    async fn fetch_version(&self) -> crate::Result<Version> {
        let url = format!("{}/", self.base_url);
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

        let parsed: RootResponse = response
            .json()
            .await
            .map_err(|e| Error::admin(format!("malformed root response: {e}")))?;
        let raw = parsed
            .version
            .and_then(|v| v.number)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::admin("root response missing version.number field"))?;
        Version::parse(&raw)
    }
}

#[async_trait]
impl PilotStrategy for ElasticsearchStrategy {
    fn build_command(&self, _pilot: &Pilot) -> CommandDescriptor {
        CommandDescriptor::new("elasticsearch")
    }

    async fn sync(&self, pilot: &mut Pilot) -> crate::Result<()> {
        let version = self.fetch_version().await?;
        debug!(version = %version, "Elasticsearch state observed");

        pilot
            .status
            .get_or_insert_with(PilotStatus::default)
            .elasticsearch = Some(ElasticsearchPilotStatus {
            version: Some(version),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::PilotSpec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn server_returning(template: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(template)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn sync_records_the_reported_version() {
        let server = server_returning(ResponseTemplate::new(200).set_body_json(
            serde_json::json!({
                "name": "es-0",
                "cluster_name": "search",
                "version": {"number": "5.6.4"},
                "tagline": "You Know, for Search"
            }),
        ))
        .await;

        let strategy = ElasticsearchStrategy::new(server.uri());
        let mut pilot = Pilot::new("es-0", PilotSpec::default());
        strategy.sync(&mut pilot).await.unwrap();

        let es = pilot.status.unwrap().elasticsearch.unwrap();
        assert_eq!(es.version, Some(Version::parse("5.6.4").unwrap()));
    }

    #[tokio::test]
    async fn missing_version_number_is_an_error() {
        let server = server_returning(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"name": "es-0"})),
        )
        .await;

        let strategy = ElasticsearchStrategy::new(server.uri());
        let mut pilot = Pilot::new("es-0", PilotSpec::default());
        let err = strategy.sync(&mut pilot).await.unwrap_err();
        assert!(err.to_string().contains("version.number"), "got: {err}");
    }

    #[tokio::test]
    async fn non_200_is_an_error() {
        let server = server_returning(ResponseTemplate::new(503)).await;

        let strategy = ElasticsearchStrategy::new(server.uri());
        let mut pilot = Pilot::new("es-0", PilotSpec::default());
        let err = strategy.sync(&mut pilot).await.unwrap_err();
        assert!(err.to_string().contains("503"), "got: {err}");
    }
}
