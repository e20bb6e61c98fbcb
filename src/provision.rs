//! End-to-end environment build orchestration.
//!
//! The build sequence is a chain of idempotent setup steps followed by two
//! bounded polls that absorb the provider's eventual consistency: instances
//! take time to attach a fixed address, and a freshly bound floating IP
//! takes time to become observable. Resources created before a polling
//! failure are left in place; the flow is safe to re-run.

use std::time::Duration;

use thiserror::Error;

use crate::cloud::{CloudError, CloudGateway, CreateServerParams, FloatingIp, ServerRecord};
use crate::environment::Environment;
use crate::keypair::{KeypairError, KeypairManager};
use crate::poll::{PollOutcome, poll};
use crate::report::{BuildPhase, Reporter};
use crate::security::SecurityPolicyManager;

const FIXED_IP_ATTEMPTS: u32 = 600;
const FLOATING_IP_ATTEMPTS: u32 = 60;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Errors surfaced while building an environment.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The configured image does not exist; nothing was created.
    #[error("image '{name}' not found")]
    ImageNotFound {
        /// Image name that failed to resolve.
        name: String,
    },
    /// The instance never reported a fixed network address.
    #[error("instance {instance_id} was never assigned a fixed IP")]
    FixedIpAssignFailure {
        /// Provider instance identifier.
        instance_id: String,
    },
    /// The floating IP binding never became observable.
    #[error("floating IP {address} never became visible on instance {instance_id}")]
    FloatingIpAssignFailure {
        /// Provider instance identifier.
        instance_id: String,
        /// Address that was assigned but never confirmed.
        address: String,
    },
    /// Keypair registration failed.
    #[error(transparent)]
    Keypair(#[from] KeypairError),
    /// Provider failure outside the recoverable cases.
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Drives the full build sequence for one environment.
#[derive(Debug)]
pub struct ProvisioningOrchestrator<'a, G, R> {
    gateway: &'a G,
    reporter: &'a R,
    fixed_ip_attempts: u32,
    floating_ip_attempts: u32,
    poll_interval: Duration,
}

impl<'a, G, R> ProvisioningOrchestrator<'a, G, R>
where
    G: CloudGateway,
    R: Reporter,
{
    /// Creates an orchestrator with the production polling budget
    /// (600 x 1s for the fixed IP, 60 x 1s for the floating IP).
    #[must_use]
    pub const fn new(gateway: &'a G, reporter: &'a R) -> Self {
        Self {
            gateway,
            reporter,
            fixed_ip_attempts: FIXED_IP_ATTEMPTS,
            floating_ip_attempts: FLOATING_IP_ATTEMPTS,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Overrides the polling interval.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the fixed-IP attempt budget.
    #[must_use]
    pub const fn with_fixed_ip_attempts(mut self, attempts: u32) -> Self {
        self.fixed_ip_attempts = attempts;
        self
    }

    /// Overrides the floating-IP confirmation attempt budget.
    #[must_use]
    pub const fn with_floating_ip_attempts(mut self, attempts: u32) -> Self {
        self.floating_ip_attempts = attempts;
        self
    }

    /// Builds the environment's instance and returns it once its floating
    /// IP is confirmed.
    ///
    /// The resolved instance and IP are cached on `environment`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::ImageNotFound`] before any resource is
    /// created, [`ProvisionError::FixedIpAssignFailure`] or
    /// [`ProvisionError::FloatingIpAssignFailure`] when a poll budget is
    /// exhausted, and provider errors otherwise. No rollback is attempted.
    pub async fn build(&self, environment: &mut Environment) -> Result<ServerRecord, ProvisionError> {
        let config = environment.config().clone();

        let image = self
            .gateway
            .find_image(&config.image_name)
            .await?
            .ok_or_else(|| ProvisionError::ImageNotFound {
                name: config.image_name.clone(),
            })?;
        let flavor = self
            .gateway
            .find_flavor(&config.flavor_name)
            .await?
            .ok_or_else(|| {
                CloudError::NotFound {
                    resource: format!("flavor '{}'", config.flavor_name),
                }
            })?;

        self.reporter
            .info(&format!("using security group '{}'", config.security_group));
        SecurityPolicyManager::new(self.gateway, self.reporter)
            .ensure(&config.security_group)
            .await?;
        self.reporter.phase(BuildPhase::SecurityReady);

        let mut params = CreateServerParams {
            name: config.name.clone(),
            image_id: image.id,
            flavor_id: flavor.id,
            security_groups: vec![config.security_group.clone()],
            key_name: None,
            userdata_path: None,
        };

        if let (Some(keypair_name), Some(public_key_path)) =
            (&config.keypair_name, &config.public_key_path)
        {
            self.reporter
                .info(&format!("using keypair '{keypair_name}'"));
            KeypairManager::new(self.gateway, self.reporter)
                .ensure(keypair_name, public_key_path)
                .await?;
            params.key_name = Some(keypair_name.clone());
        }
        self.reporter.phase(BuildPhase::KeypairReady);

        if let Some(userdata_path) = &config.userdata_path {
            self.reporter
                .info(&format!("using userdata from {userdata_path}"));
            params.userdata_path = Some(userdata_path.clone());
        }

        self.reporter.info("creating instance");
        let server = self.gateway.create_instance(&params).await?;
        self.reporter.phase(BuildPhase::InstanceRequested);

        let server = self.wait_for_fixed_ip(server).await?;
        self.reporter.phase(BuildPhase::FixedIpAssigned);

        let ip = self.acquire_floating_ip().await?;
        self.reporter.info(&format!("assigning {}", ip.address));
        self.gateway.assign_ip(&server.id, &ip).await?;
        self.reporter.phase(BuildPhase::FloatingIpAcquired);

        let address = self.confirm_floating_ip(&server, &ip).await?;
        environment.cache_ip(address);
        environment.cache_server(server.clone());
        self.reporter.phase(BuildPhase::Ready);

        Ok(server)
    }

    /// Polls until the instance reports a network attachment.
    async fn wait_for_fixed_ip(
        &self,
        server: ServerRecord,
    ) -> Result<ServerRecord, ProvisionError> {
        self.reporter.info("waiting for fixed IP");
        let gateway = self.gateway;
        let server_id = server.id.clone();

        let outcome = poll(self.fixed_ip_attempts, self.poll_interval, || {
            let id = server_id.clone();
            async move {
                let current = gateway.get_instance(&id).await?;
                Ok::<_, CloudError>(current.has_network_attachment().then_some(current))
            }
        })
        .await?;

        match outcome {
            PollOutcome::Ready(current) => Ok(current),
            PollOutcome::TimedOut => Err(ProvisionError::FixedIpAssignFailure {
                instance_id: server.id,
            }),
        }
    }

    /// Finds a free floating IP, allocating a fresh one and retrying the
    /// lookup exactly once when the pool is empty.
    async fn acquire_floating_ip(&self) -> Result<FloatingIp, ProvisionError> {
        match self.gateway.find_free_floating_ip().await {
            Ok(ip) => Ok(ip),
            Err(CloudError::NoIpsAvailable) => {
                self.reporter.info("allocating a new floating IP");
                self.gateway.allocate_floating_ip().await?;
                Ok(self.gateway.find_free_floating_ip().await?)
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Polls until the assigned floating IP is observable on the instance.
    async fn confirm_floating_ip(
        &self,
        server: &ServerRecord,
        ip: &FloatingIp,
    ) -> Result<String, ProvisionError> {
        self.reporter.info("waiting for the assigned IP to appear");
        let gateway = self.gateway;
        let server_id = server.id.clone();

        let outcome = poll(self.floating_ip_attempts, self.poll_interval, || {
            let id = server_id.clone();
            async move { gateway.find_assigned_ip(&id).await }
        })
        .await?;

        match outcome {
            PollOutcome::Ready(address) => Ok(address),
            PollOutcome::TimedOut => Err(ProvisionError::FloatingIpAssignFailure {
                instance_id: server.id.clone(),
                address: ip.address.clone(),
            }),
        }
    }
}
