//! Idempotent SSH keypair registration.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::cloud::{CloudError, CloudGateway};
use crate::report::Reporter;

/// Errors raised while ensuring a keypair exists.
#[derive(Debug, Error)]
pub enum KeypairError {
    /// The local public key file could not be read.
    #[error("failed to read public key {path}: {message}")]
    ReadKey {
        /// Path that was expected to hold the public key.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Provider failure during lookup or registration.
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Ensures a named keypair is registered with the provider.
#[derive(Debug)]
pub struct KeypairManager<'a, G, R> {
    gateway: &'a G,
    reporter: &'a R,
}

impl<'a, G: CloudGateway, R: Reporter> KeypairManager<'a, G, R> {
    /// Creates a manager borrowing the gateway and reporter.
    #[must_use]
    pub const fn new(gateway: &'a G, reporter: &'a R) -> Self {
        Self { gateway, reporter }
    }

    /// Registers `name` from the key at `public_key_path` unless a keypair
    /// with that name already exists. The key file is only read when
    /// registration is actually needed.
    ///
    /// # Errors
    ///
    /// Returns [`KeypairError::ReadKey`] when the public key file is
    /// unreadable, or propagates provider failures other than a
    /// registration race.
    pub async fn ensure(&self, name: &str, public_key_path: &Utf8Path) -> Result<(), KeypairError> {
        if self.gateway.find_keypair(name).await?.is_some() {
            return Ok(());
        }

        self.reporter
            .info(&format!("no keypair named '{name}' found, registering"));
        let public_key =
            std::fs::read_to_string(public_key_path).map_err(|err| KeypairError::ReadKey {
                path: public_key_path.to_path_buf(),
                message: err.to_string(),
            })?;

        match self.gateway.create_keypair(name, &public_key).await {
            Ok(()) => Ok(()),
            Err(CloudError::AlreadyExists { .. }) => {
                self.reporter
                    .info(&format!("keypair '{name}' already exists"));
                Ok(())
            }
            Err(other) => Err(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeGateway, RecordingReporter};
    use camino::Utf8PathBuf;
    use std::io::Write;

    fn write_key(dir: &tempfile::TempDir, contents: &str) -> Utf8PathBuf {
        let path = dir.path().join("id_ed25519.pub");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "{contents}").unwrap();
        Utf8PathBuf::from_path_buf(path).unwrap()
    }

    #[tokio::test]
    async fn absent_keypair_is_registered_from_the_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_key(&dir, "ssh-ed25519 AAAA dev@laptop");
        let gateway = FakeGateway::new();
        let reporter = RecordingReporter::new();
        let manager = KeypairManager::new(&gateway, &reporter);

        manager.ensure("devkey", &path).await.unwrap();

        assert_eq!(
            gateway.created_keypairs(),
            vec![(
                String::from("devkey"),
                String::from("ssh-ed25519 AAAA dev@laptop")
            )]
        );
    }

    #[tokio::test]
    async fn present_keypair_skips_registration_and_file_read() {
        let gateway = FakeGateway::new();
        gateway.seed_keypair("devkey");
        let reporter = RecordingReporter::new();
        let manager = KeypairManager::new(&gateway, &reporter);

        // The path does not exist; the no-op branch must never touch it.
        let missing = Utf8Path::new("/nonexistent/id_ed25519.pub");
        manager.ensure("devkey", missing).await.unwrap();

        assert!(gateway.created_keypairs().is_empty());
    }

    #[tokio::test]
    async fn unreadable_key_file_is_a_filesystem_error() {
        let gateway = FakeGateway::new();
        let reporter = RecordingReporter::new();
        let manager = KeypairManager::new(&gateway, &reporter);

        let missing = Utf8Path::new("/nonexistent/id_ed25519.pub");
        let err = manager.ensure("devkey", missing).await.unwrap_err();

        assert!(matches!(err, KeypairError::ReadKey { .. }));
        assert!(gateway.created_keypairs().is_empty());
    }

    #[tokio::test]
    async fn registration_race_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_key(&dir, "ssh-ed25519 AAAA dev@laptop");
        let gateway = FakeGateway::new();
        gateway.fail_keypair_create_with_conflict();
        let reporter = RecordingReporter::new();
        let manager = KeypairManager::new(&gateway, &reporter);

        manager.ensure("devkey", &path).await.unwrap();

        assert!(
            reporter
                .infos()
                .iter()
                .any(|message| message.contains("already exists"))
        );
    }
}
