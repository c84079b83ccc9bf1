//! Run-wide environment preparation.

use async_trait::async_trait;
use bollard::Docker;
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use crossmatrix_core::error::Operation;
use crossmatrix_core::ports::{EnvironmentPreparer, ResourceHandle, ResourceKind};
use crossmatrix_core::{Error, Result};
use tracing::{debug, info};

/// Ensures a bridge network exists for the job containers.
///
/// Only a network created by this preparer is returned for teardown; an
/// existing one is reused and left alone.
pub struct NetworkPreparer {
    docker: Docker,
    name: String,
}

impl NetworkPreparer {
    pub fn new(docker: Docker, name: impl Into<String>) -> Self {
        Self {
            docker,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl EnvironmentPreparer for NetworkPreparer {
    async fn prepare(&self) -> Result<Option<ResourceHandle>> {
        if self
            .docker
            .inspect_network(&self.name, None::<InspectNetworkOptions<String>>)
            .await
            .is_ok()
        {
            debug!(network = %self.name, "Reusing existing network");
            return Ok(None);
        }

        info!(network = %self.name, "Creating network");
        self.docker
            .create_network(CreateNetworkOptions {
                name: self.name.clone(),
                driver: "bridge".to_string(),
                check_duplicate: true,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                Error::backend(
                    Operation::Prepare,
                    format!("Failed to create network {}: {}", self.name, e),
                )
            })?;

        Ok(Some(ResourceHandle::new(
            ResourceKind::Network,
            &self.name,
            None,
        )))
    }
}

/// Preparer for runs that need no shared environment.
pub struct NoopPreparer;

#[async_trait]
impl EnvironmentPreparer for NoopPreparer {
    async fn prepare(&self) -> Result<Option<ResourceHandle>> {
        Ok(None)
    }
}
