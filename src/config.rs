//! Environment configuration loading via `ortho-config`.

use std::str::FromStr;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One local file to mirror onto the environment.
///
/// The loader round-trips field values while merging layers and accepts
/// them as CLI arguments, so mappings serialize and parse from a
/// `local:remote` pair.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileMapping {
    /// Absolute local source path.
    pub local: Utf8PathBuf,
    /// Absolute remote destination path.
    pub remote: Utf8PathBuf,
}

impl FromStr for FileMapping {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            ConfigError::Parse(format!(
                "invalid file mapping '{value}': expected 'local:remote'"
            ))
        };
        let (local, remote) = value.split_once(':').ok_or_else(invalid)?;
        if local.is_empty() || remote.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            local: Utf8PathBuf::from(local),
            remote: Utf8PathBuf::from(remote),
        })
    }
}

/// Environment definition merged from defaults, configuration files, and
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "NIMBUS")]
pub struct EnvironmentConfig {
    /// Environment name, unique per cloud project. Doubles as the instance
    /// name.
    pub name: String,
    /// Boot image name, resolved against the provider at build time.
    pub image_name: String,
    /// Flavor name for instance sizing.
    pub flavor_name: String,
    /// Login user on the provisioned instance.
    #[ortho_config(default = "ubuntu".to_owned())]
    pub remote_user: String,
    /// Security group attached to the instance.
    #[ortho_config(default = "nimbus".to_owned())]
    pub security_group: String,
    /// Keypair registered with the provider, when SSH key login is wanted.
    pub keypair_name: Option<String>,
    /// Local public key uploaded when the keypair is first registered.
    pub public_key_path: Option<Utf8PathBuf>,
    /// Userdata payload handed to the instance at boot.
    pub userdata_path: Option<Utf8PathBuf>,
    /// External network that floating IPs are allocated from.
    #[ortho_config(default = "public".to_owned())]
    pub external_network: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Ordered local-to-remote file mappings uploaded by `nimbus files`.
    #[ortho_config(default = Vec::new())]
    pub files: Vec<FileMapping>,
}

impl EnvironmentConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("nimbus")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// or when a keypair name is configured without a public key path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(&self.name, "environment name", "NIMBUS_NAME", "name")?;
        Self::require_field(
            &self.image_name,
            "image name",
            "NIMBUS_IMAGE_NAME",
            "image_name",
        )?;
        Self::require_field(
            &self.flavor_name,
            "flavor name",
            "NIMBUS_FLAVOR_NAME",
            "flavor_name",
        )?;
        Self::require_field(
            &self.remote_user,
            "remote login user",
            "NIMBUS_REMOTE_USER",
            "remote_user",
        )?;
        Self::require_field(
            &self.security_group,
            "security group name",
            "NIMBUS_SECURITY_GROUP",
            "security_group",
        )?;

        if self.keypair_name.is_some() && self.public_key_path.is_none() {
            return Err(ConfigError::MissingField(String::from(
                "keypair_name is set but public_key_path is not; set \
                 NIMBUS_PUBLIC_KEY_PATH or add public_key_path to nimbus.toml",
            )));
        }
        Ok(())
    }

    fn require_field(
        value: &str,
        description: &str,
        env_var: &str,
        toml_key: &str,
    ) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {description}: set {env_var} or add {toml_key} to nimbus.toml"
            )));
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_config;
    use rstest::rstest;

    #[test]
    fn validate_accepts_complete_config() {
        assert!(sample_config("dev").validate().is_ok());
    }

    #[test]
    fn validate_rejects_blank_name() {
        let mut config = sample_config("dev");
        config.name = String::from("  ");

        let err = config.validate().unwrap_err();
        assert!(
            matches!(err, ConfigError::MissingField(ref message) if message.contains("NIMBUS_NAME")),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn validate_rejects_keypair_without_public_key_path() {
        let mut config = sample_config("dev");
        config.keypair_name = Some(String::from("devkey"));
        config.public_key_path = None;

        let err = config.validate().unwrap_err();
        assert!(
            matches!(err, ConfigError::MissingField(ref message) if message.contains("public_key_path")),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn file_mappings_round_trip_through_the_loader_format() {
        let files: Vec<FileMapping> = serde_json::from_str(
            r#"[{"local": "/home/dev/app.conf", "remote": "/etc/app/app.conf"}]"#,
        )
        .unwrap();
        assert_eq!(files[0].local, Utf8PathBuf::from("/home/dev/app.conf"));
        assert_eq!(files[0].remote, Utf8PathBuf::from("/etc/app/app.conf"));

        let rendered = serde_json::to_string(&files).unwrap();
        assert!(rendered.contains("/etc/app/app.conf"), "rendered: {rendered}");
    }

    #[test]
    fn file_mapping_parses_from_a_colon_separated_pair() {
        let mapping: FileMapping = "/home/dev/app.conf:/etc/app/app.conf".parse().unwrap();
        assert_eq!(mapping.local, Utf8PathBuf::from("/home/dev/app.conf"));
        assert_eq!(mapping.remote, Utf8PathBuf::from("/etc/app/app.conf"));
    }

    #[rstest]
    #[case::no_separator("/home/dev/app.conf")]
    #[case::empty_local(":/etc/app/app.conf")]
    #[case::empty_remote("/home/dev/app.conf:")]
    fn file_mapping_rejects_malformed_pairs(#[case] value: &str) {
        let err = value.parse::<FileMapping>().unwrap_err();
        assert!(
            matches!(err, ConfigError::Parse(ref message) if message.contains("local:remote")),
            "unexpected error: {err}"
        );
    }

    #[rstest]
    #[case::image(|config: &mut EnvironmentConfig| config.image_name = String::new())]
    #[case::flavor(|config: &mut EnvironmentConfig| config.flavor_name = String::new())]
    #[case::user(|config: &mut EnvironmentConfig| config.remote_user = String::new())]
    #[case::group(|config: &mut EnvironmentConfig| config.security_group = String::new())]
    fn validate_rejects_blank_required_fields(#[case] blank: fn(&mut EnvironmentConfig)) {
        let mut config = sample_config("dev");
        blank(&mut config);
        assert!(config.validate().is_err());
    }
}
