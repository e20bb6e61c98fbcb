//! Snapshotting a provisioned environment into a reusable image.

use thiserror::Error;

use crate::cloud::{CloudError, CloudGateway};
use crate::environment::Environment;
use crate::report::Reporter;

/// Errors raised while snapshotting.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The environment has no resolvable instance; nothing was requested.
    #[error("environment has not been created; try running `nimbus up` first")]
    EnvironmentNotCreated,
    /// Provider failure during lookup or snapshot creation.
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Creates named image snapshots of running environments.
#[derive(Debug)]
pub struct SnapshotManager<'a, G, R> {
    gateway: &'a G,
    reporter: &'a R,
}

impl<'a, G: CloudGateway, R: Reporter> SnapshotManager<'a, G, R> {
    /// Creates a manager borrowing the gateway and reporter.
    #[must_use]
    pub const fn new(gateway: &'a G, reporter: &'a R) -> Self {
        Self { gateway, reporter }
    }

    /// Snapshots the environment's instance into an image called `name`,
    /// returning the provider's image identifier.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::EnvironmentNotCreated`] when the instance
    /// cannot be resolved; no provider call is made in that case.
    pub async fn snapshot(
        &self,
        environment: &mut Environment,
        name: &str,
    ) -> Result<String, SnapshotError> {
        let Some(server_id) = environment
            .server(self.gateway)
            .await?
            .map(|server| server.id.clone())
        else {
            return Err(SnapshotError::EnvironmentNotCreated);
        };

        self.reporter.info(&format!("creating snapshot '{name}'"));
        let image_id = self.gateway.create_snapshot(&server_id, name).await?;
        self.reporter
            .info(&format!("snapshot '{name}' created as image {image_id}"));
        Ok(image_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeGateway, RecordingReporter, sample_config, sample_server};

    #[tokio::test]
    async fn unresolvable_instance_is_a_precondition_failure() {
        let gateway = FakeGateway::new();
        let reporter = RecordingReporter::new();
        let manager = SnapshotManager::new(&gateway, &reporter);
        let mut env = Environment::new(sample_config("dev"));

        let err = manager.snapshot(&mut env, "golden").await.unwrap_err();

        assert!(matches!(err, SnapshotError::EnvironmentNotCreated));
        assert!(gateway.created_snapshots().is_empty());
    }

    #[tokio::test]
    async fn resolved_instance_is_snapshotted_under_the_given_name() {
        let gateway = FakeGateway::new();
        gateway.seed_server(sample_server("srv-1", "dev"));
        let reporter = RecordingReporter::new();
        let manager = SnapshotManager::new(&gateway, &reporter);
        let mut env = Environment::new(sample_config("dev"));

        let image_id = manager.snapshot(&mut env, "golden").await.unwrap();

        assert!(!image_id.is_empty());
        assert_eq!(
            gateway.created_snapshots(),
            vec![(String::from("srv-1"), String::from("golden"))]
        );
    }
}
