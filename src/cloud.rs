//! Cloud provider gateway: the capability set the orchestrator consumes.
//!
//! The trait is intentionally thin. It mirrors the provider operations the
//! provisioning flow needs and nothing else; the production implementation
//! lives in [`crate::openstack`] and test doubles in
//! [`crate::test_support`].

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::runner::RunnerError;

/// Resolved boot image reference.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageRef {
    /// Provider assigned identifier.
    pub id: String,
    /// Human readable image name.
    pub name: String,
}

/// Resolved instance sizing (flavor) reference.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlavorRef {
    /// Provider assigned identifier.
    pub id: String,
    /// Human readable flavor name.
    pub name: String,
}

/// Provider view of a compute instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerRecord {
    /// Provider assigned identifier.
    pub id: String,
    /// Instance name, unique per project.
    pub name: String,
    /// Lifecycle state as reported by the provider.
    pub status: String,
    /// Network attachments, keyed by network name. Empty immediately after
    /// creation until the provider attaches a fixed address.
    pub addresses: BTreeMap<String, Vec<String>>,
}

impl ServerRecord {
    /// Returns `true` once at least one network reports an address.
    #[must_use]
    pub fn has_network_attachment(&self) -> bool {
        self.addresses.values().any(|addrs| !addrs.is_empty())
    }

    /// Flattens every attached address into a single list.
    #[must_use]
    pub fn all_addresses(&self) -> Vec<String> {
        self.addresses.values().flatten().cloned().collect()
    }
}

/// A provider managed floating address, free or bound to an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FloatingIp {
    /// Provider assigned identifier.
    pub id: String,
    /// The publicly routable address.
    pub address: String,
    /// Fixed address the floating IP is bound to, when assigned.
    pub fixed_ip: Option<String>,
    /// Port the floating IP is bound to, when assigned.
    pub port_id: Option<String>,
}

impl FloatingIp {
    /// Returns `true` when the address is not bound to any instance.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.fixed_ip.is_none() && self.port_id.is_none()
    }
}

/// Named firewall group reference.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecurityGroupRef {
    /// Provider assigned identifier.
    pub id: String,
    /// Group name.
    pub name: String,
}

/// A single ingress rule within a security group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecurityRule {
    /// Transport protocol (`icmp`, `tcp`, ...).
    pub protocol: String,
    /// Start of the destination port range; `-1` means the whole range.
    pub port_from: i32,
    /// End of the destination port range; `-1` means the whole range.
    pub port_to: i32,
    /// Source CIDR the rule admits.
    pub cidr: String,
}

impl SecurityRule {
    /// Builds a rule admitting `cidr` on the given port range.
    #[must_use]
    pub fn new(protocol: &str, port_from: i32, port_to: i32, cidr: &str) -> Self {
        Self {
            protocol: protocol.to_owned(),
            port_from,
            port_to,
            cidr: cidr.to_owned(),
        }
    }
}

/// Registered SSH keypair reference.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeypairRef {
    /// Keypair name.
    pub name: String,
    /// Public key fingerprint, when the provider reports one.
    pub fingerprint: Option<String>,
}

/// Parameters for an instance creation request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateServerParams {
    /// Instance name.
    pub name: String,
    /// Resolved image identifier.
    pub image_id: String,
    /// Resolved flavor identifier.
    pub flavor_id: String,
    /// Security groups attached at boot.
    pub security_groups: Vec<String>,
    /// Keypair registered for login, when configured.
    pub key_name: Option<String>,
    /// Local userdata payload handed to the provider, when configured.
    pub userdata_path: Option<Utf8PathBuf>,
}

/// Errors raised by cloud gateways.
///
/// Recoverable outcomes the ensure/acquire logic matches on are tagged
/// variants ([`CloudError::AlreadyExists`], [`CloudError::NoIpsAvailable`])
/// rather than being folded into the generic provider failure.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CloudError {
    /// The provider rejected a create because the resource already exists.
    #[error("{resource} already exists")]
    AlreadyExists {
        /// Description of the conflicting resource.
        resource: String,
    },
    /// A lookup required by the caller matched nothing.
    #[error("{resource} not found")]
    NotFound {
        /// Description of the missing resource.
        resource: String,
    },
    /// No free floating IP is currently available.
    #[error("no free floating IPs available")]
    NoIpsAvailable,
    /// The provider client could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// The provider reported a failure the caller cannot recover from.
    #[error("provider command exited with status {status_text}: {stderr}")]
    Provider {
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the provider client.
        stderr: String,
    },
    /// The provider returned a payload that could not be decoded.
    #[error("failed to decode provider response: {message}")]
    Decode {
        /// Decoder error string.
        message: String,
    },
    /// A local I/O step needed to talk to the provider failed.
    #[error("local I/O error: {message}")]
    Io {
        /// Operating system error string.
        message: String,
    },
}

impl From<RunnerError> for CloudError {
    fn from(value: RunnerError) -> Self {
        match value {
            RunnerError::Spawn { program, message } => Self::Spawn { program, message },
        }
    }
}

/// Future returned by gateway operations.
pub type CloudFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CloudError>> + Send + 'a>>;

/// Capability set consumed by the provisioning and sync flows.
pub trait CloudGateway {
    /// Resolves an image by name; `None` when no image matches.
    fn find_image<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<ImageRef>>;

    /// Resolves a flavor by name; `None` when no flavor matches.
    fn find_flavor<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<FlavorRef>>;

    /// Finds the instance carrying the given name, if one exists.
    fn find_instance<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<ServerRecord>>;

    /// Fetches the current state of an instance by identifier.
    fn get_instance<'a>(&'a self, id: &'a str) -> CloudFuture<'a, ServerRecord>;

    /// Issues an instance creation request.
    fn create_instance<'a>(
        &'a self,
        params: &'a CreateServerParams,
    ) -> CloudFuture<'a, ServerRecord>;

    /// Destroys an instance.
    fn delete_instance<'a>(&'a self, id: &'a str) -> CloudFuture<'a, ()>;

    /// Returns the floating address currently observable on the instance.
    fn find_assigned_ip<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, Option<String>>;

    /// Finds a free floating IP.
    ///
    /// Fails with [`CloudError::NoIpsAvailable`] when every allocated
    /// address is bound.
    fn find_free_floating_ip(&self) -> CloudFuture<'_, FloatingIp>;

    /// Allocates a new floating IP from the provider's pool.
    fn allocate_floating_ip(&self) -> CloudFuture<'_, FloatingIp>;

    /// Binds a floating IP to an instance.
    fn assign_ip<'a>(
        &'a self,
        instance_id: &'a str,
        ip: &'a FloatingIp,
    ) -> CloudFuture<'a, ()>;

    /// Looks up a security group by name; `None` when absent.
    fn find_security_group<'a>(
        &'a self,
        name: &'a str,
    ) -> CloudFuture<'a, Option<SecurityGroupRef>>;

    /// Creates a named security group.
    fn create_security_group<'a>(&'a self, name: &'a str) -> CloudFuture<'a, SecurityGroupRef>;

    /// Adds an ingress rule to a security group.
    fn create_security_group_rule<'a>(
        &'a self,
        group: &'a str,
        rule: &'a SecurityRule,
    ) -> CloudFuture<'a, ()>;

    /// Looks up a registered keypair by name; `None` when absent.
    fn find_keypair<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<KeypairRef>>;

    /// Registers a public key under the given name.
    fn create_keypair<'a>(
        &'a self,
        name: &'a str,
        public_key: &'a str,
    ) -> CloudFuture<'a, ()>;

    /// Snapshots a running instance into a named image, returning the image
    /// identifier.
    fn create_snapshot<'a>(
        &'a self,
        instance_id: &'a str,
        name: &'a str,
    ) -> CloudFuture<'a, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_record_reports_network_attachment() {
        let mut server = ServerRecord {
            id: String::from("srv-1"),
            name: String::from("dev"),
            status: String::from("BUILD"),
            addresses: BTreeMap::new(),
        };
        assert!(!server.has_network_attachment());

        server
            .addresses
            .insert(String::from("private"), vec![String::from("10.0.0.4")]);
        assert!(server.has_network_attachment());
        assert_eq!(server.all_addresses(), vec![String::from("10.0.0.4")]);
    }

    #[test]
    fn empty_network_entries_do_not_count_as_attachment() {
        let mut server = ServerRecord {
            id: String::from("srv-1"),
            name: String::from("dev"),
            status: String::from("BUILD"),
            addresses: BTreeMap::new(),
        };
        server.addresses.insert(String::from("private"), Vec::new());
        assert!(!server.has_network_attachment());
    }

    #[test]
    fn floating_ip_freedom_requires_no_binding() {
        let free = FloatingIp {
            id: String::from("fip-1"),
            address: String::from("203.0.113.9"),
            fixed_ip: None,
            port_id: None,
        };
        let bound = FloatingIp {
            fixed_ip: Some(String::from("10.0.0.4")),
            ..free.clone()
        };

        assert!(free.is_free());
        assert!(!bound.is_free());
    }
}
