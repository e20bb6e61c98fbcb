//! Environment state: configuration plus memoized provider lookups.

use crate::cloud::{CloudError, CloudGateway, ServerRecord};
use crate::config::EnvironmentConfig;

/// One development environment, identified by its name.
///
/// The resolved instance and public IP are cached in explicit optional
/// fields. Both caches populate on first access and are cleared by
/// [`Environment::invalidate`], which [`Environment::delete`] calls after a
/// successful teardown.
#[derive(Clone, Debug)]
pub struct Environment {
    config: EnvironmentConfig,
    server: Option<ServerRecord>,
    ip: Option<String>,
}

impl Environment {
    /// Wraps a parsed configuration with empty caches.
    #[must_use]
    pub const fn new(config: EnvironmentConfig) -> Self {
        Self {
            config,
            server: None,
            ip: None,
        }
    }

    /// Returns the environment's configuration.
    #[must_use]
    pub const fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// Returns the environment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Resolves the environment's instance, memoizing the result.
    ///
    /// # Errors
    ///
    /// Propagates provider lookup failures.
    pub async fn server<G: CloudGateway>(
        &mut self,
        gateway: &G,
    ) -> Result<Option<&ServerRecord>, CloudError> {
        if self.server.is_none() {
            self.server = gateway.find_instance(&self.config.name).await?;
        }
        Ok(self.server.as_ref())
    }

    /// Resolves the environment's public IP, memoizing the result.
    ///
    /// Returns `None` when the instance does not exist or carries no
    /// floating address yet.
    ///
    /// # Errors
    ///
    /// Propagates provider lookup failures.
    pub async fn ip<G: CloudGateway>(&mut self, gateway: &G) -> Result<Option<String>, CloudError> {
        if self.ip.is_none() {
            let Some(server_id) = self.server(gateway).await?.map(|server| server.id.clone())
            else {
                return Ok(None);
            };
            self.ip = gateway.find_assigned_ip(&server_id).await?;
        }
        Ok(self.ip.clone())
    }

    /// Stores a freshly created instance in the cache.
    pub fn cache_server(&mut self, server: ServerRecord) {
        self.server = Some(server);
    }

    /// Stores a confirmed public IP in the cache.
    pub fn cache_ip(&mut self, ip: String) {
        self.ip = Some(ip);
    }

    /// Clears both caches.
    pub fn invalidate(&mut self) {
        self.server = None;
        self.ip = None;
    }

    /// Destroys the environment's instance and invalidates the caches.
    ///
    /// Returns `false` when no instance exists for the environment name.
    ///
    /// # Errors
    ///
    /// Propagates provider failures; the caches are left untouched so the
    /// caller can retry.
    pub async fn delete<G: CloudGateway>(&mut self, gateway: &G) -> Result<bool, CloudError> {
        let Some(server_id) = self.server(gateway).await?.map(|server| server.id.clone()) else {
            return Ok(false);
        };
        gateway.delete_instance(&server_id).await?;
        self.invalidate();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeGateway, sample_config, sample_server};

    fn environment() -> Environment {
        Environment::new(sample_config("dev"))
    }

    #[tokio::test]
    async fn server_is_resolved_once_and_memoized() {
        let gateway = FakeGateway::new();
        gateway.seed_server(sample_server("srv-1", "dev"));
        let mut env = environment();

        assert!(env.server(&gateway).await.unwrap().is_some());
        assert!(env.server(&gateway).await.unwrap().is_some());
        assert_eq!(gateway.find_instance_calls(), 1);
    }

    #[tokio::test]
    async fn ip_requires_a_resolvable_server() {
        let gateway = FakeGateway::new();
        let mut env = environment();

        assert_eq!(env.ip(&gateway).await.unwrap(), None);
    }

    #[tokio::test]
    async fn ip_is_memoized_after_first_lookup() {
        let gateway = FakeGateway::new();
        gateway.seed_server(sample_server("srv-1", "dev"));
        gateway.push_assigned_ip(Some("203.0.113.9"));
        let mut env = environment();

        assert_eq!(
            env.ip(&gateway).await.unwrap(),
            Some(String::from("203.0.113.9"))
        );
        // Second access must not consult the gateway again.
        assert_eq!(
            env.ip(&gateway).await.unwrap(),
            Some(String::from("203.0.113.9"))
        );
        assert_eq!(gateway.find_assigned_ip_calls(), 1);
    }

    #[tokio::test]
    async fn delete_destroys_the_instance_and_invalidates_caches() {
        let gateway = FakeGateway::new();
        gateway.seed_server(sample_server("srv-1", "dev"));
        let mut env = environment();

        assert!(env.delete(&gateway).await.unwrap());
        assert_eq!(gateway.deleted_instances(), vec![String::from("srv-1")]);

        // The cache is empty again; a fresh lookup hits the gateway.
        gateway.clear_servers();
        assert!(env.server(&gateway).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_without_instance_is_a_no_op() {
        let gateway = FakeGateway::new();
        let mut env = environment();

        assert!(!env.delete(&gateway).await.unwrap());
        assert!(gateway.deleted_instances().is_empty());
    }
}
