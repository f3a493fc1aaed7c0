//! Cassandra pilot strategy

use async_trait::async_trait;
use tracing::debug;

use crate::controller::PilotStrategy;
use crate::crd::{CassandraPilotStatus, Pilot, PilotStatus};
use crate::process::CommandDescriptor;
use crate::version::Version;

use super::client::AdminClient;
use super::nodes::compute_node_map;

/// Database-specific behaviour for Cassandra nodes.
///
/// Launches Cassandra in the foreground (the pilot is the supervisor) and
/// reconciles the node's administrative snapshot into the Pilot status.
pub struct CassandraStrategy {
    admin: AdminClient,
}

impl CassandraStrategy {
    /// Create a strategy talking to the given admin interface base URL
    pub fn new(admin_url: impl Into<String>) -> Self {
        Self {
            admin: AdminClient::new(admin_url),
        }
    }
}

#[async_trait]
impl PilotStrategy for CassandraStrategy {
    fn build_command(&self, _pilot: &Pilot) -> CommandDescriptor {
        // Foreground mode keeps Cassandra a direct child of the pilot.
        CommandDescriptor::new("cassandra").arg("-f")
    }

    async fn sync(&self, pilot: &mut Pilot) -> crate::Result<()> {
        let status = self.admin.status().await?;
        let nodes = compute_node_map(&status)?;

        let version = match status.release_version.as_deref().filter(|v| !v.is_empty()) {
            Some(raw) => Some(Version::parse(raw)?),
            None => None,
        };

        debug!(
            nodes = nodes.len(),
            version = version.as_ref().map(|v| v.as_str()).unwrap_or("unknown"),
            "Cassandra state observed"
        );

        pilot
            .status
            .get_or_insert_with(PilotStatus::default)
            .cassandra = Some(CassandraPilotStatus {
            version,
            node_count: Some(nodes.len() as u32),
        });
        Ok(())
    }
}
