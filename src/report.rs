//! Progress reporting seam.
//!
//! Components never log through ambient global state; they notify an
//! injected [`Reporter`]. The production reporter forwards to `tracing`,
//! and tests capture events with the recording double in
//! [`crate::test_support`].

use std::fmt;

/// Milestones of the build state machine, in the order they are reached.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildPhase {
    /// Security group and canonical rules are in place.
    SecurityReady,
    /// Keypair registration settled (present or not configured).
    KeypairReady,
    /// Instance creation request accepted by the provider.
    InstanceRequested,
    /// The instance reports at least one fixed network address.
    FixedIpAssigned,
    /// A floating IP was acquired and the binding requested.
    FloatingIpAcquired,
    /// The floating IP is observable on the instance.
    Ready,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::SecurityReady => "security-ready",
            Self::KeypairReady => "keypair-ready",
            Self::InstanceRequested => "instance-requested",
            Self::FixedIpAssigned => "fixed-ip-assigned",
            Self::FloatingIpAcquired => "floating-ip-acquired",
            Self::Ready => "ready",
        };
        f.write_str(label)
    }
}

/// Observer notified as the lifecycle flows make progress.
pub trait Reporter {
    /// Reports that the build reached a phase.
    fn phase(&self, phase: BuildPhase);

    /// Reports routine progress.
    fn info(&self, message: &str);

    /// Reports a recoverable problem.
    fn warn(&self, message: &str);
}

/// Reporter that forwards events to the `tracing` subscriber.
#[derive(Clone, Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn phase(&self, phase: BuildPhase) {
        tracing::info!(phase = %phase, "build phase reached");
    }

    fn info(&self, message: &str) {
        tracing::info!("{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!("{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_render_stable_labels() {
        let labels: Vec<String> = [
            BuildPhase::SecurityReady,
            BuildPhase::KeypairReady,
            BuildPhase::InstanceRequested,
            BuildPhase::FixedIpAssigned,
            BuildPhase::FloatingIpAcquired,
            BuildPhase::Ready,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        assert_eq!(
            labels,
            vec![
                "security-ready",
                "keypair-ready",
                "instance-requested",
                "fixed-ip-assigned",
                "floating-ip-acquired",
                "ready",
            ]
        );
    }
}
