//! Core library for the Nimbus environment tool.
//!
//! The crate exposes a cloud gateway abstraction for provisioning
//! short-lived development instances and an OpenStack implementation that
//! powers the full lifecycle (build → confirm networking → sync files →
//! snapshot → destroy).

pub mod cloud;
pub mod config;
pub mod environment;
pub mod files;
pub mod keypair;
pub mod openstack;
pub mod poll;
pub mod provision;
pub mod remote;
pub mod report;
pub mod runner;
pub mod security;
pub mod snapshot;
pub mod test_support;

pub use cloud::{
    CloudError, CloudFuture, CloudGateway, CreateServerParams, FlavorRef, FloatingIp, ImageRef,
    KeypairRef, SecurityGroupRef, SecurityRule, ServerRecord,
};
pub use config::{ConfigError, EnvironmentConfig, FileMapping};
pub use environment::Environment;
pub use files::{FileSyncer, FilesError, SyncReport};
pub use keypair::{KeypairError, KeypairManager};
pub use openstack::OpenStackGateway;
pub use poll::{PollOutcome, poll};
pub use provision::{ProvisionError, ProvisioningOrchestrator};
pub use remote::{PutOptions, RemoteError, RemoteExecutor, SshExecutor, SshTarget};
pub use report::{BuildPhase, Reporter, TracingReporter};
pub use runner::{CommandOutput, CommandRunner, ProcessCommandRunner, RunnerError};
pub use security::SecurityPolicyManager;
pub use snapshot::{SnapshotError, SnapshotManager};
