//! Resilient upload of configured files onto a provisioned environment.
//!
//! Early provisioning is the worst time to talk to a machine: sshd may not
//! be up yet and the network path can flap. Directory creation and uploads
//! therefore retry transient network failures on a fixed budget, and a
//! mapping that cannot be synced is abandoned with a warning instead of
//! aborting the rest of the batch.

use std::time::Duration;

use shell_escape::unix::escape;
use thiserror::Error;
use tokio::time::sleep;

use crate::cloud::{CloudError, CloudGateway};
use crate::config::FileMapping;
use crate::environment::Environment;
use crate::remote::{PutOptions, RemoteError, RemoteExecutor, SshTarget};
use crate::report::Reporter;

const UPLOAD_ATTEMPTS: u32 = 24;
const UPLOAD_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Errors that abort a sync before any file operation happens.
#[derive(Debug, Error)]
pub enum FilesError {
    /// The environment has no resolvable public IP.
    #[error("could not determine the environment's IP; run `nimbus up` first")]
    IpUnresolved,
    /// Provider failure while resolving the environment.
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Outcome counts for one sync batch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SyncReport {
    /// Mappings uploaded successfully.
    pub uploaded: usize,
    /// Mappings skipped because the local file is missing.
    pub skipped: usize,
    /// Mappings abandoned after exhausting the retry budget.
    pub abandoned: usize,
}

/// Uploads an environment's configured file mappings over SSH.
#[derive(Debug)]
pub struct FileSyncer<'a, G, X, R> {
    gateway: &'a G,
    executor: &'a X,
    reporter: &'a R,
    attempts: u32,
    retry_delay: Duration,
}

impl<'a, G, X, R> FileSyncer<'a, G, X, R>
where
    G: CloudGateway,
    X: RemoteExecutor,
    R: Reporter,
{
    /// Creates a syncer with the production retry budget (24 x 10s).
    #[must_use]
    pub const fn new(gateway: &'a G, executor: &'a X, reporter: &'a R) -> Self {
        Self {
            gateway,
            executor,
            reporter,
            attempts: UPLOAD_ATTEMPTS,
            retry_delay: UPLOAD_RETRY_DELAY,
        }
    }

    /// Overrides the retry delay.
    ///
    /// This is primarily used by tests to keep retry scenarios fast.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Overrides the per-operation attempt budget.
    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Uploads every configured mapping, in configured order.
    ///
    /// Each upload mirrors the local file mode and lands with elevated
    /// privilege so destinations outside the login user's home work. A
    /// missing local file, or a mapping that exhausts its retry budget, is
    /// reported and skipped; neither aborts the batch.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::IpUnresolved`] when the environment's IP cannot
    /// be resolved; no file operation is attempted in that case.
    pub async fn sync(&self, environment: &mut Environment) -> Result<SyncReport, FilesError> {
        let Some(host) = environment.ip(self.gateway).await? else {
            return Err(FilesError::IpUnresolved);
        };
        let target = SshTarget {
            user: environment.config().remote_user.clone(),
            host,
        };

        let mut report = SyncReport::default();
        for mapping in environment.config().files.clone() {
            self.sync_mapping(&target, &mapping, &mut report).await;
        }
        Ok(report)
    }

    async fn sync_mapping(&self, target: &SshTarget, mapping: &FileMapping, report: &mut SyncReport) {
        if !mapping.local.exists() {
            self.reporter
                .warn(&format!("file '{}' not found, skipping", mapping.local));
            report.skipped += 1;
            return;
        }

        self.reporter.info(&format!(
            "putting file from '{}' to '{}'",
            mapping.local, mapping.remote
        ));

        if let Some(parent) = mapping.remote.parent() {
            let mkdir = format!("mkdir -p {}", escape(parent.as_str().into()));
            let created = self
                .with_retry(&format!("create directory '{parent}'"), || {
                    self.executor.run_command(target, &mkdir)
                })
                .await;
            if !created {
                report.abandoned += 1;
                return;
            }
        }

        let options = PutOptions {
            preserve_mode: true,
            elevate: true,
        };
        let uploaded = self
            .with_retry(&format!("upload '{}'", mapping.local), || {
                self.executor
                    .put_file(target, &mapping.local, &mapping.remote, &options)
            })
            .await;
        if uploaded {
            report.uploaded += 1;
        } else {
            report.abandoned += 1;
        }
    }

    /// Runs `operation` until it succeeds or the budget is spent, retrying
    /// only transient network failures. Returns `true` on success.
    async fn with_retry<F>(&self, what: &str, mut operation: F) -> bool
    where
        F: FnMut() -> Result<(), RemoteError>,
    {
        for attempt in 1..=self.attempts {
            match operation() {
                Ok(()) => return true,
                Err(RemoteError::Network { .. }) if attempt < self.attempts => {
                    self.reporter.warn(&format!(
                        "unable to {what} (attempt {attempt}/{}), retrying in {}s",
                        self.attempts,
                        self.retry_delay.as_secs()
                    ));
                    sleep(self.retry_delay).await;
                }
                Err(err) => {
                    self.reporter.warn(&format!("giving up trying to {what}: {err}"));
                    return false;
                }
            }
        }
        false
    }
}
