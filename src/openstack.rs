//! OpenStack implementation of [`CloudGateway`].
//!
//! The gateway drives the `openstack` CLI with `-f json` output rather than
//! speaking HTTP itself; authentication and endpoint discovery stay with the
//! operator's existing `clouds.yaml`/`OS_*` setup. Provider conflicts and
//! missing resources are recognised from the CLI's stderr so callers get the
//! tagged [`CloudError`] variants the ensure logic matches on.

use std::ffi::OsString;
use std::io::Write;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::cloud::{
    CloudError, CloudFuture, CloudGateway, CreateServerParams, FlavorRef, FloatingIp, ImageRef,
    KeypairRef, SecurityGroupRef, SecurityRule, ServerRecord,
};
use crate::runner::{CommandOutput, CommandRunner};

const DEFAULT_OPENSTACK_BIN: &str = "openstack";

/// Row shape shared by `image list` and `flavor list`.
#[derive(Debug, Deserialize)]
struct ResourceRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
}

/// Row shape of `floating ip list`.
#[derive(Debug, Deserialize)]
struct FloatingIpRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Floating IP Address")]
    address: String,
    #[serde(rename = "Fixed IP Address")]
    fixed_ip: Option<String>,
    #[serde(rename = "Port", alias = "Port ID")]
    port_id: Option<String>,
}

impl From<FloatingIpRow> for FloatingIp {
    fn from(row: FloatingIpRow) -> Self {
        Self {
            id: row.id,
            address: row.address,
            fixed_ip: row.fixed_ip,
            port_id: row.port_id,
        }
    }
}

/// Detail shape of `floating ip create`.
#[derive(Debug, Deserialize)]
struct FloatingIpDetail {
    id: String,
    floating_ip_address: String,
    #[serde(default)]
    fixed_ip_address: Option<String>,
    #[serde(default)]
    port_id: Option<String>,
}

/// Detail shape of `server show` and `server create`.
#[derive(Debug, Deserialize)]
struct ServerDetail {
    id: String,
    name: String,
    status: String,
    #[serde(default)]
    addresses: std::collections::BTreeMap<String, Vec<String>>,
}

impl From<ServerDetail> for ServerRecord {
    fn from(detail: ServerDetail) -> Self {
        Self {
            id: detail.id,
            name: detail.name,
            status: detail.status,
            addresses: detail.addresses,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SecurityGroupDetail {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct KeypairDetail {
    name: String,
    #[serde(default)]
    fingerprint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedImage {
    id: String,
}

fn cli_args(parts: &[&str]) -> Vec<OsString> {
    parts.iter().map(OsString::from).collect()
}

fn is_conflict(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("already exists") || lowered.contains("conflict") || lowered.contains("409")
}

fn is_not_found(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("not found")
        || lowered.contains("404")
        || (lowered.starts_with("no ") && lowered.contains("found"))
}

/// Gateway backed by the `openstack` command-line client.
#[derive(Clone, Debug)]
pub struct OpenStackGateway<R: CommandRunner> {
    runner: R,
    bin: String,
    external_network: String,
}

impl<R: CommandRunner> OpenStackGateway<R> {
    /// Creates a gateway allocating floating IPs from `external_network`.
    #[must_use]
    pub fn new(runner: R, external_network: impl Into<String>) -> Self {
        Self {
            runner,
            bin: DEFAULT_OPENSTACK_BIN.to_owned(),
            external_network: external_network.into(),
        }
    }

    /// Overrides the client binary path.
    #[must_use]
    pub fn with_binary(mut self, bin: impl Into<String>) -> Self {
        self.bin = bin.into();
        self
    }

    fn exec(&self, args: Vec<OsString>) -> Result<CommandOutput, CloudError> {
        Ok(self.runner.run(&self.bin, &args)?)
    }

    fn failure(output: &CommandOutput, resource: &str) -> CloudError {
        if is_conflict(&output.stderr) {
            return CloudError::AlreadyExists {
                resource: resource.to_owned(),
            };
        }
        CloudError::Provider {
            status: output.code,
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        }
    }

    fn expect_success(
        output: CommandOutput,
        resource: &str,
    ) -> Result<CommandOutput, CloudError> {
        if output.is_success() {
            Ok(output)
        } else {
            Err(Self::failure(&output, resource))
        }
    }

    fn decode<T: DeserializeOwned>(payload: &str) -> Result<T, CloudError> {
        serde_json::from_str(payload).map_err(|err| CloudError::Decode {
            message: err.to_string(),
        })
    }

    /// Runs a `show`-style command, mapping a not-found failure to `None`.
    fn show_json<T: DeserializeOwned>(
        &self,
        args: Vec<OsString>,
        resource: &str,
    ) -> Result<Option<T>, CloudError> {
        let output = self.exec(args)?;
        if output.is_success() {
            return Ok(Some(Self::decode(&output.stdout)?));
        }
        if is_not_found(&output.stderr) {
            return Ok(None);
        }
        Err(Self::failure(&output, resource))
    }

    fn list_json<T: DeserializeOwned>(
        &self,
        args: Vec<OsString>,
        resource: &str,
    ) -> Result<Vec<T>, CloudError> {
        let output = Self::expect_success(self.exec(args)?, resource)?;
        Self::decode(&output.stdout)
    }

    fn server_detail(&self, id: &str) -> Result<ServerRecord, CloudError> {
        let detail: Option<ServerDetail> = self.show_json(
            cli_args(&["server", "show", id, "-f", "json"]),
            &format!("server {id}"),
        )?;
        detail.map(ServerRecord::from).ok_or_else(|| CloudError::NotFound {
            resource: format!("server {id}"),
        })
    }

    fn floating_ip_rows(&self) -> Result<Vec<FloatingIpRow>, CloudError> {
        self.list_json(
            cli_args(&["floating", "ip", "list", "-f", "json"]),
            "floating IP list",
        )
    }
}

impl<R> CloudGateway for OpenStackGateway<R>
where
    R: CommandRunner + Send + Sync,
{
    fn find_image<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<ImageRef>> {
        Box::pin(async move {
            let rows: Vec<ResourceRow> = self.list_json(
                cli_args(&["image", "list", "--name", name, "-f", "json"]),
                "image list",
            )?;
            Ok(rows
                .into_iter()
                .find(|row| row.name == name)
                .map(|row| ImageRef {
                    id: row.id,
                    name: row.name,
                }))
        })
    }

    fn find_flavor<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<FlavorRef>> {
        Box::pin(async move {
            let rows: Vec<ResourceRow> =
                self.list_json(cli_args(&["flavor", "list", "-f", "json"]), "flavor list")?;
            Ok(rows
                .into_iter()
                .find(|row| row.name == name)
                .map(|row| FlavorRef {
                    id: row.id,
                    name: row.name,
                }))
        })
    }

    fn find_instance<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<ServerRecord>> {
        Box::pin(async move {
            let rows: Vec<ResourceRow> = self.list_json(
                cli_args(&["server", "list", "--name", name, "-f", "json"]),
                "server list",
            )?;
            let Some(row) = rows.into_iter().find(|row| row.name == name) else {
                return Ok(None);
            };
            // The list view omits addresses; fetch the full record.
            self.server_detail(&row.id).map(Some)
        })
    }

    fn get_instance<'a>(&'a self, id: &'a str) -> CloudFuture<'a, ServerRecord> {
        Box::pin(async move { self.server_detail(id) })
    }

    fn create_instance<'a>(
        &'a self,
        params: &'a CreateServerParams,
    ) -> CloudFuture<'a, ServerRecord> {
        Box::pin(async move {
            let mut args = cli_args(&[
                "server",
                "create",
                "--image",
                &params.image_id,
                "--flavor",
                &params.flavor_id,
            ]);
            for group in &params.security_groups {
                args.push(OsString::from("--security-group"));
                args.push(OsString::from(group));
            }
            if let Some(key_name) = &params.key_name {
                args.push(OsString::from("--key-name"));
                args.push(OsString::from(key_name));
            }
            if let Some(userdata_path) = &params.userdata_path {
                args.push(OsString::from("--user-data"));
                args.push(OsString::from(userdata_path.as_str()));
            }
            args.extend(cli_args(&["-f", "json"]));
            args.push(OsString::from(&params.name));

            let output = Self::expect_success(
                self.exec(args)?,
                &format!("server '{}'", params.name),
            )?;
            let detail: ServerDetail = Self::decode(&output.stdout)?;
            Ok(detail.into())
        })
    }

    fn delete_instance<'a>(&'a self, id: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let output = self.exec(cli_args(&["server", "delete", id]))?;
            Self::expect_success(output, &format!("server {id}")).map(|_| ())
        })
    }

    fn find_assigned_ip<'a>(&'a self, instance_id: &'a str) -> CloudFuture<'a, Option<String>> {
        Box::pin(async move {
            let server = self.server_detail(instance_id)?;
            let addresses = server.all_addresses();
            let assigned = self.floating_ip_rows()?.into_iter().find(|row| {
                row.fixed_ip
                    .as_ref()
                    .is_some_and(|fixed| addresses.iter().any(|addr| addr == fixed))
                    || addresses.iter().any(|addr| *addr == row.address)
            });
            Ok(assigned.map(|row| row.address))
        })
    }

    fn find_free_floating_ip(&self) -> CloudFuture<'_, FloatingIp> {
        Box::pin(async move {
            self.floating_ip_rows()?
                .into_iter()
                .map(FloatingIp::from)
                .find(FloatingIp::is_free)
                .ok_or(CloudError::NoIpsAvailable)
        })
    }

    fn allocate_floating_ip(&self) -> CloudFuture<'_, FloatingIp> {
        Box::pin(async move {
            let output = Self::expect_success(
                self.exec(cli_args(&[
                    "floating",
                    "ip",
                    "create",
                    &self.external_network,
                    "-f",
                    "json",
                ]))?,
                "floating IP",
            )?;
            let detail: FloatingIpDetail = Self::decode(&output.stdout)?;
            Ok(FloatingIp {
                id: detail.id,
                address: detail.floating_ip_address,
                fixed_ip: detail.fixed_ip_address,
                port_id: detail.port_id,
            })
        })
    }

    fn assign_ip<'a>(&'a self, instance_id: &'a str, ip: &'a FloatingIp) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let output = self.exec(cli_args(&[
                "server",
                "add",
                "floating",
                "ip",
                instance_id,
                &ip.address,
            ]))?;
            Self::expect_success(output, &format!("floating IP {}", ip.address)).map(|_| ())
        })
    }

    fn find_security_group<'a>(
        &'a self,
        name: &'a str,
    ) -> CloudFuture<'a, Option<SecurityGroupRef>> {
        Box::pin(async move {
            let detail: Option<SecurityGroupDetail> = self.show_json(
                cli_args(&["security", "group", "show", name, "-f", "json"]),
                &format!("security group '{name}'"),
            )?;
            Ok(detail.map(|detail| SecurityGroupRef {
                id: detail.id,
                name: detail.name,
            }))
        })
    }

    fn create_security_group<'a>(&'a self, name: &'a str) -> CloudFuture<'a, SecurityGroupRef> {
        Box::pin(async move {
            let output = Self::expect_success(
                self.exec(cli_args(&["security", "group", "create", name, "-f", "json"]))?,
                &format!("security group '{name}'"),
            )?;
            let detail: SecurityGroupDetail = Self::decode(&output.stdout)?;
            Ok(SecurityGroupRef {
                id: detail.id,
                name: detail.name,
            })
        })
    }

    fn create_security_group_rule<'a>(
        &'a self,
        group: &'a str,
        rule: &'a SecurityRule,
    ) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let mut args = cli_args(&[
                "security",
                "group",
                "rule",
                "create",
                "--ingress",
                "--protocol",
                &rule.protocol,
                "--remote-ip",
                &rule.cidr,
            ]);
            // A negative range means "all ports" (ICMP); the CLI expects the
            // port option to be omitted entirely in that case.
            if rule.port_from >= 0 {
                args.push(OsString::from("--dst-port"));
                args.push(OsString::from(format!(
                    "{}:{}",
                    rule.port_from, rule.port_to
                )));
            }
            args.push(OsString::from(group));

            let output = self.exec(args)?;
            Self::expect_success(
                output,
                &format!("rule {}/{}-{}", rule.protocol, rule.port_from, rule.port_to),
            )
            .map(|_| ())
        })
    }

    fn find_keypair<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<KeypairRef>> {
        Box::pin(async move {
            let detail: Option<KeypairDetail> = self.show_json(
                cli_args(&["keypair", "show", name, "-f", "json"]),
                &format!("keypair '{name}'"),
            )?;
            Ok(detail.map(|detail| KeypairRef {
                name: detail.name,
                fingerprint: detail.fingerprint,
            }))
        })
    }

    fn create_keypair<'a>(&'a self, name: &'a str, public_key: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            // The CLI only accepts a key file, not inline key material.
            let mut key_file =
                tempfile::NamedTempFile::new().map_err(|err| CloudError::Io {
                    message: err.to_string(),
                })?;
            key_file
                .write_all(public_key.as_bytes())
                .map_err(|err| CloudError::Io {
                    message: err.to_string(),
                })?;
            key_file.flush().map_err(|err| CloudError::Io {
                message: err.to_string(),
            })?;

            let mut args = cli_args(&["keypair", "create", "--public-key"]);
            args.push(key_file.path().as_os_str().to_owned());
            args.extend(cli_args(&["-f", "json"]));
            args.push(OsString::from(name));

            let output = self.exec(args)?;
            Self::expect_success(output, &format!("keypair '{name}'")).map(|_| ())
        })
    }

    fn create_snapshot<'a>(&'a self, instance_id: &'a str, name: &'a str) -> CloudFuture<'a, String> {
        Box::pin(async move {
            let output = Self::expect_success(
                self.exec(cli_args(&[
                    "server",
                    "image",
                    "create",
                    "--name",
                    name,
                    instance_id,
                    "-f",
                    "json",
                ]))?,
                &format!("snapshot '{name}'"),
            )?;
            let image: CreatedImage = Self::decode(&output.stdout)?;
            Ok(image.id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;

    fn gateway(runner: ScriptedRunner) -> OpenStackGateway<ScriptedRunner> {
        OpenStackGateway::new(runner, "public")
    }

    #[tokio::test]
    async fn find_image_returns_the_matching_row() {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(0),
            r#"[{"ID": "img-1", "Name": "precise", "Status": "active"}]"#,
            "",
        );
        let gw = gateway(runner.clone());

        let image = gw.find_image("precise").await.unwrap().unwrap();
        assert_eq!(image.id, "img-1");

        let rendered = runner.invocations()[0].command_string();
        assert!(rendered.starts_with("openstack image list --name precise"));
    }

    #[tokio::test]
    async fn find_image_returns_none_for_an_empty_listing() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "[]", "");
        let gw = gateway(runner);

        assert!(gw.find_image("precise").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_flavor_filters_by_exact_name() {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(0),
            r#"[{"ID": "1", "Name": "m1.tiny"}, {"ID": "2", "Name": "m1.small"}]"#,
            "",
        );
        let gw = gateway(runner);

        let flavor = gw.find_flavor("m1.small").await.unwrap().unwrap();
        assert_eq!(flavor.id, "2");
    }

    #[tokio::test]
    async fn missing_security_group_maps_to_none() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(1), "", "No SecurityGroup found for nimbus");
        let gw = gateway(runner);

        assert!(gw.find_security_group("nimbus").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conflicting_group_create_maps_to_already_exists() {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(1),
            "",
            "ConflictException: 409: security group nimbus already exists",
        );
        let gw = gateway(runner);

        let err = gw.create_security_group("nimbus").await.unwrap_err();
        assert!(matches!(err, CloudError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn icmp_rule_omits_the_port_option() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let gw = gateway(runner.clone());
        let rule = SecurityRule::new("icmp", -1, -1, "0.0.0.0/0");

        gw.create_security_group_rule("nimbus", &rule).await.unwrap();

        let rendered = runner.invocations()[0].command_string();
        assert!(!rendered.contains("--dst-port"), "rendered: {rendered}");
        assert!(rendered.ends_with("nimbus"));
    }

    #[tokio::test]
    async fn tcp_rule_carries_a_port_range() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let gw = gateway(runner.clone());
        let rule = SecurityRule::new("tcp", 22, 22, "0.0.0.0/0");

        gw.create_security_group_rule("nimbus", &rule).await.unwrap();

        let rendered = runner.invocations()[0].command_string();
        assert!(rendered.contains("--dst-port 22:22"), "rendered: {rendered}");
    }

    #[tokio::test]
    async fn free_floating_ip_lookup_skips_bound_addresses() {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(0),
            r#"[
                {"ID": "fip-1", "Floating IP Address": "203.0.113.8",
                 "Fixed IP Address": "10.0.0.3", "Port": "port-1"},
                {"ID": "fip-2", "Floating IP Address": "203.0.113.9",
                 "Fixed IP Address": null, "Port": null}
            ]"#,
            "",
        );
        let gw = gateway(runner);

        let ip = gw.find_free_floating_ip().await.unwrap();
        assert_eq!(ip.address, "203.0.113.9");
    }

    #[tokio::test]
    async fn fully_bound_pool_reports_no_ips_available() {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(0),
            r#"[{"ID": "fip-1", "Floating IP Address": "203.0.113.8",
                 "Fixed IP Address": "10.0.0.3", "Port": "port-1"}]"#,
            "",
        );
        let gw = gateway(runner);

        let err = gw.find_free_floating_ip().await.unwrap_err();
        assert!(matches!(err, CloudError::NoIpsAvailable));
    }

    #[tokio::test]
    async fn find_assigned_ip_matches_on_the_fixed_address() {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(0),
            r#"{"id": "srv-1", "name": "dev", "status": "ACTIVE",
                "addresses": {"private": ["10.0.0.4"]}}"#,
            "",
        );
        runner.push_output(
            Some(0),
            r#"[{"ID": "fip-2", "Floating IP Address": "203.0.113.9",
                 "Fixed IP Address": "10.0.0.4", "Port": "port-2"}]"#,
            "",
        );
        let gw = gateway(runner);

        let ip = gw.find_assigned_ip("srv-1").await.unwrap();
        assert_eq!(ip.as_deref(), Some("203.0.113.9"));
    }

    #[tokio::test]
    async fn find_assigned_ip_is_none_without_a_binding() {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(0),
            r#"{"id": "srv-1", "name": "dev", "status": "ACTIVE",
                "addresses": {"private": ["10.0.0.4"]}}"#,
            "",
        );
        runner.push_output(Some(0), "[]", "");
        let gw = gateway(runner);

        assert!(gw.find_assigned_ip("srv-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_instance_builds_the_full_argument_set() {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(0),
            r#"{"id": "srv-1", "name": "dev", "status": "BUILD", "addresses": {}}"#,
            "",
        );
        let gw = gateway(runner.clone());

        let params = CreateServerParams {
            name: String::from("dev"),
            image_id: String::from("img-1"),
            flavor_id: String::from("flv-1"),
            security_groups: vec![String::from("nimbus")],
            key_name: Some(String::from("devkey")),
            userdata_path: Some(camino::Utf8PathBuf::from("/home/dev/userdata.sh")),
        };
        let server = gw.create_instance(&params).await.unwrap();

        assert_eq!(server.id, "srv-1");
        assert_eq!(server.status, "BUILD");
        assert!(!server.has_network_attachment());
        let rendered = runner.invocations()[0].command_string();
        assert!(rendered.contains("--image img-1"));
        assert!(rendered.contains("--flavor flv-1"));
        assert!(rendered.contains("--security-group nimbus"));
        assert!(rendered.contains("--key-name devkey"));
        assert!(rendered.contains("--user-data /home/dev/userdata.sh"));
        assert!(rendered.ends_with("dev"));
    }

    #[tokio::test]
    async fn create_keypair_hands_the_cli_a_key_file() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let gw = gateway(runner.clone());

        gw.create_keypair("devkey", "ssh-ed25519 AAAA dev@laptop")
            .await
            .unwrap();

        let rendered = runner.invocations()[0].command_string();
        assert!(rendered.contains("--public-key"));
        assert!(rendered.ends_with("devkey"));
    }

    #[tokio::test]
    async fn create_snapshot_returns_the_image_id() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), r#"{"id": "img-9", "name": "golden"}"#, "");
        let gw = gateway(runner.clone());

        let image_id = gw.create_snapshot("srv-1", "golden").await.unwrap();
        assert_eq!(image_id, "img-9");

        let rendered = runner.invocations()[0].command_string();
        assert!(rendered.contains("server image create --name golden srv-1"));
    }

    #[tokio::test]
    async fn provider_failures_carry_the_exit_status_and_stderr() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(2), "", "Unauthorized (HTTP 401)");
        let gw = gateway(runner);

        let err = gw.find_image("precise").await.unwrap_err();
        assert!(
            matches!(err, CloudError::Provider { status: Some(2), ref stderr, .. }
                if stderr.contains("401"))
        );
    }
}
