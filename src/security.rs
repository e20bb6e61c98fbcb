//! Idempotent security group and rule provisioning.

use crate::cloud::{CloudError, CloudGateway, SecurityRule};
use crate::report::Reporter;

/// The rule set every nimbus security group carries: ICMP plus the TCP
/// ports development environments commonly expose.
#[must_use]
pub fn canonical_rules() -> Vec<SecurityRule> {
    [
        ("icmp", -1, -1),
        ("tcp", 22, 22),
        ("tcp", 443, 443),
        ("tcp", 80, 80),
        ("tcp", 8080, 8080),
        ("tcp", 5000, 5000),
        ("tcp", 9292, 9292),
    ]
    .into_iter()
    .map(|(protocol, from, to)| SecurityRule::new(protocol, from, to, "0.0.0.0/0"))
    .collect()
}

/// Ensures a named security group and its canonical rule set exist.
#[derive(Debug)]
pub struct SecurityPolicyManager<'a, G, R> {
    gateway: &'a G,
    reporter: &'a R,
}

impl<'a, G: CloudGateway, R: Reporter> SecurityPolicyManager<'a, G, R> {
    /// Creates a manager borrowing the gateway and reporter.
    #[must_use]
    pub const fn new(gateway: &'a G, reporter: &'a R) -> Self {
        Self { gateway, reporter }
    }

    /// Idempotently ensures `name` exists with the canonical rules.
    ///
    /// A provider conflict on the group or on any rule means another run got
    /// there first; it is logged and swallowed. Rules are applied on every
    /// call so a partially configured group converges.
    ///
    /// # Errors
    ///
    /// Propagates provider failures other than "already exists".
    pub async fn ensure(&self, name: &str) -> Result<(), CloudError> {
        if self.gateway.find_security_group(name).await?.is_none() {
            match self.gateway.create_security_group(name).await {
                Ok(_) => self.reporter.info(&format!("created security group '{name}'")),
                Err(CloudError::AlreadyExists { .. }) => {
                    self.reporter
                        .info(&format!("security group '{name}' already exists"));
                }
                Err(other) => return Err(other),
            }
        }

        for rule in canonical_rules() {
            match self.gateway.create_security_group_rule(name, &rule).await {
                Ok(()) => {}
                Err(CloudError::AlreadyExists { .. }) => {
                    self.reporter.info(&format!(
                        "rule {}/{}-{} already present on '{name}'",
                        rule.protocol, rule.port_from, rule.port_to
                    ));
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }
}
