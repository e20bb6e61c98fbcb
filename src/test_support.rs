//! Test doubles and fixtures shared across unit and behavioural tests.
//!
//! Gateway futures are `Send`, so the doubles keep their state behind
//! `Mutex` rather than `RefCell`. All scripting methods take `&self` so a
//! double can be borrowed by the code under test while the test keeps a
//! handle for inspection.

use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::sync::{Mutex, MutexGuard, PoisonError};

use camino::Utf8Path;

use crate::cloud::{
    CloudError, CloudFuture, CloudGateway, CreateServerParams, FlavorRef, FloatingIp, ImageRef,
    KeypairRef, SecurityGroupRef, SecurityRule, ServerRecord,
};
use crate::config::EnvironmentConfig;
use crate::remote::{PutOptions, RemoteError, RemoteExecutor, SshTarget};
use crate::report::{BuildPhase, Reporter};
use crate::runner::{CommandOutput, CommandRunner, RunnerError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A fully populated configuration for an environment called `name`.
#[must_use]
pub fn sample_config(name: &str) -> EnvironmentConfig {
    EnvironmentConfig {
        name: name.to_owned(),
        image_name: String::from("precise"),
        flavor_name: String::from("m1.small"),
        remote_user: String::from("ubuntu"),
        security_group: String::from("nimbus"),
        keypair_name: None,
        public_key_path: None,
        userdata_path: None,
        external_network: String::from("public"),
        ssh_bin: String::from("ssh"),
        scp_bin: String::from("scp"),
        files: Vec::new(),
    }
}

/// An active server with one private address.
#[must_use]
pub fn sample_server(id: &str, name: &str) -> ServerRecord {
    sample_server_with_address(id, name, "10.0.0.4")
}

/// An active server carrying `address` on its private network.
#[must_use]
pub fn sample_server_with_address(id: &str, name: &str, address: &str) -> ServerRecord {
    let mut addresses = BTreeMap::new();
    addresses.insert(String::from("private"), vec![address.to_owned()]);
    ServerRecord {
        id: id.to_owned(),
        name: name.to_owned(),
        status: String::from("ACTIVE"),
        addresses,
    }
}

/// One recorded call to a [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program that was requested.
    pub program: String,
    /// Arguments as passed.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Renders the invocation as a single shell-like string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut rendered = self.program.clone();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&arg.to_string_lossy());
        }
        rendered
    }
}

#[derive(Debug, Default)]
struct ScriptedRunnerState {
    outputs: VecDeque<CommandOutput>,
    invocations: Vec<CommandInvocation>,
}

/// Command runner returning scripted outputs instead of spawning processes.
///
/// Outputs are consumed in push order; once the script is exhausted every
/// call succeeds with empty output. Clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: std::sync::Arc<Mutex<ScriptedRunnerState>>,
}

impl ScriptedRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts one command outcome.
    pub fn push_output(&self, code: Option<i32>, stdout: &str, stderr: &str) {
        lock(&self.state).outputs.push_back(CommandOutput {
            code,
            stdout: stdout.to_owned(),
            stderr: stderr.to_owned(),
        });
    }

    /// Scripts a zero-exit success with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Scripts a failure with the given exit code and empty output.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Scripts a failure with the given exit code and a stderr message.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "scripted failure");
    }

    /// Every invocation recorded so far, in call order.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.state).invocations.clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RunnerError> {
        let mut state = lock(&self.state);
        state.invocations.push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        Ok(state.outputs.pop_front().unwrap_or(CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        }))
    }
}

#[derive(Debug, Default)]
struct RecordingReporterState {
    phases: Vec<BuildPhase>,
    infos: Vec<String>,
    warns: Vec<String>,
}

/// Reporter that records every event for later assertions.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    state: Mutex<RecordingReporterState>,
}

impl RecordingReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Phases reported so far, in order.
    #[must_use]
    pub fn phases(&self) -> Vec<BuildPhase> {
        lock(&self.state).phases.clone()
    }

    /// Info messages reported so far, in order.
    #[must_use]
    pub fn infos(&self) -> Vec<String> {
        lock(&self.state).infos.clone()
    }

    /// Warnings reported so far, in order.
    #[must_use]
    pub fn warns(&self) -> Vec<String> {
        lock(&self.state).warns.clone()
    }
}

impl Reporter for RecordingReporter {
    fn phase(&self, phase: BuildPhase) {
        lock(&self.state).phases.push(phase);
    }

    fn info(&self, message: &str) {
        lock(&self.state).infos.push(message.to_owned());
    }

    fn warn(&self, message: &str) {
        lock(&self.state).warns.push(message.to_owned());
    }
}

#[derive(Debug, Default)]
struct ScriptedExecutorState {
    command_results: VecDeque<Result<(), RemoteError>>,
    put_results: VecDeque<Result<(), RemoteError>>,
    command_calls: usize,
    put_calls: usize,
}

/// Remote executor returning scripted results.
///
/// Commands and uploads are scripted independently; an exhausted script
/// succeeds.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    state: Mutex<ScriptedExecutorState>,
}

fn scripted_network_failure() -> RemoteError {
    RemoteError::Network {
        target: String::from("scripted"),
        stderr: String::from("scripted network failure"),
    }
}

impl ScriptedExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_command_success(&self) {
        lock(&self.state).command_results.push_back(Ok(()));
    }

    pub fn push_command_network_failure(&self) {
        lock(&self.state)
            .command_results
            .push_back(Err(scripted_network_failure()));
    }

    pub fn push_command_failure(&self, code: i32) {
        lock(&self.state)
            .command_results
            .push_back(Err(RemoteError::Command {
                status: Some(code),
                status_text: code.to_string(),
                stderr: String::from("scripted failure"),
            }));
    }

    pub fn push_put_success(&self) {
        lock(&self.state).put_results.push_back(Ok(()));
    }

    pub fn push_put_network_failure(&self) {
        lock(&self.state)
            .put_results
            .push_back(Err(scripted_network_failure()));
    }

    /// Number of remote commands attempted.
    #[must_use]
    pub fn command_calls(&self) -> usize {
        lock(&self.state).command_calls
    }

    /// Number of uploads attempted.
    #[must_use]
    pub fn put_calls(&self) -> usize {
        lock(&self.state).put_calls
    }
}

impl RemoteExecutor for ScriptedExecutor {
    fn run_command(&self, _target: &SshTarget, _command: &str) -> Result<(), RemoteError> {
        let mut state = lock(&self.state);
        state.command_calls += 1;
        state.command_results.pop_front().unwrap_or(Ok(()))
    }

    fn put_file(
        &self,
        _target: &SshTarget,
        _local: &Utf8Path,
        _remote: &Utf8Path,
        _options: &PutOptions,
    ) -> Result<(), RemoteError> {
        let mut state = lock(&self.state);
        state.put_calls += 1;
        state.put_results.pop_front().unwrap_or(Ok(()))
    }
}

#[derive(Debug, Default)]
struct FakeGatewayState {
    images: Vec<(String, String)>,
    flavors: Vec<(String, String)>,
    servers: Vec<ServerRecord>,
    instance_states: VecDeque<ServerRecord>,
    created_instances: Vec<CreateServerParams>,
    deleted_instances: Vec<String>,
    next_server_seq: u64,
    find_instance_calls: usize,
    get_instance_calls: usize,
    assigned_ips: VecDeque<Option<String>>,
    find_assigned_ip_calls: usize,
    floating_pool: Vec<FloatingIp>,
    refill_on_allocate: Option<String>,
    allocation_count: usize,
    assigned_bindings: Vec<(String, String)>,
    security_groups: Vec<String>,
    created_security_groups: Vec<String>,
    created_rules: Vec<SecurityRule>,
    fail_group_create: bool,
    fail_rule_create_conflict: bool,
    fail_rule_create_provider: bool,
    keypairs: Vec<String>,
    created_keypairs: Vec<(String, String)>,
    fail_keypair_create: bool,
    created_snapshots: Vec<(String, String)>,
}

/// In-memory [`CloudGateway`] with a scripting and inspection surface.
#[derive(Debug, Default)]
pub struct FakeGateway {
    state: Mutex<FakeGatewayState>,
}

fn conflict(resource: &str) -> CloudError {
    CloudError::AlreadyExists {
        resource: resource.to_owned(),
    }
}

fn provider_failure() -> CloudError {
    CloudError::Provider {
        status: Some(1),
        status_text: String::from("1"),
        stderr: String::from("scripted provider failure"),
    }
}

impl FakeGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_image(&self, name: &str, id: &str) {
        lock(&self.state).images.push((name.to_owned(), id.to_owned()));
    }

    pub fn seed_flavor(&self, name: &str, id: &str) {
        lock(&self.state).flavors.push((name.to_owned(), id.to_owned()));
    }

    pub fn seed_server(&self, server: ServerRecord) {
        lock(&self.state).servers.push(server);
    }

    pub fn clear_servers(&self) {
        lock(&self.state).servers.clear();
    }

    /// Queues a record returned by the next `get_instance` call. Once the
    /// queue drains, `get_instance` falls back to the stored server.
    pub fn push_instance_state(&self, server: ServerRecord) {
        lock(&self.state).instance_states.push_back(server);
    }

    /// Queues a result for the next `find_assigned_ip` call. Once the queue
    /// drains, lookups report no assigned address.
    pub fn push_assigned_ip(&self, address: Option<&str>) {
        lock(&self.state)
            .assigned_ips
            .push_back(address.map(ToOwned::to_owned));
    }

    /// Adds a free floating IP to the pool.
    pub fn seed_free_floating_ip(&self, address: &str) {
        let mut state = lock(&self.state);
        let id = format!("fip-{}", state.floating_pool.len() + 1);
        state.floating_pool.push(FloatingIp {
            id,
            address: address.to_owned(),
            fixed_ip: None,
            port_id: None,
        });
    }

    /// Makes the next allocation add `address` to the (initially empty)
    /// pool. Without this, allocations succeed but the pool stays empty.
    pub fn refill_pool_on_allocate(&self, address: &str) {
        lock(&self.state).refill_on_allocate = Some(address.to_owned());
    }

    pub fn seed_security_group(&self, name: &str) {
        lock(&self.state).security_groups.push(name.to_owned());
    }

    pub fn fail_group_create_with_conflict(&self) {
        lock(&self.state).fail_group_create = true;
    }

    pub fn fail_rule_create_with_conflict(&self) {
        lock(&self.state).fail_rule_create_conflict = true;
    }

    pub fn fail_rule_create_with_provider_error(&self) {
        lock(&self.state).fail_rule_create_provider = true;
    }

    pub fn seed_keypair(&self, name: &str) {
        lock(&self.state).keypairs.push(name.to_owned());
    }

    pub fn fail_keypair_create_with_conflict(&self) {
        lock(&self.state).fail_keypair_create = true;
    }

    #[must_use]
    pub fn find_instance_calls(&self) -> usize {
        lock(&self.state).find_instance_calls
    }

    #[must_use]
    pub fn get_instance_calls(&self) -> usize {
        lock(&self.state).get_instance_calls
    }

    #[must_use]
    pub fn find_assigned_ip_calls(&self) -> usize {
        lock(&self.state).find_assigned_ip_calls
    }

    #[must_use]
    pub fn created_instances(&self) -> Vec<CreateServerParams> {
        lock(&self.state).created_instances.clone()
    }

    #[must_use]
    pub fn deleted_instances(&self) -> Vec<String> {
        lock(&self.state).deleted_instances.clone()
    }

    #[must_use]
    pub fn allocation_count(&self) -> usize {
        lock(&self.state).allocation_count
    }

    /// Bindings recorded by `assign_ip`, as (instance id, address) pairs.
    #[must_use]
    pub fn assigned_bindings(&self) -> Vec<(String, String)> {
        lock(&self.state).assigned_bindings.clone()
    }

    #[must_use]
    pub fn created_security_groups(&self) -> Vec<String> {
        lock(&self.state).created_security_groups.clone()
    }

    #[must_use]
    pub fn created_rules(&self) -> Vec<SecurityRule> {
        lock(&self.state).created_rules.clone()
    }

    /// Registrations recorded by `create_keypair`, as (name, key) pairs.
    #[must_use]
    pub fn created_keypairs(&self) -> Vec<(String, String)> {
        lock(&self.state).created_keypairs.clone()
    }

    /// Snapshots recorded, as (instance id, snapshot name) pairs.
    #[must_use]
    pub fn created_snapshots(&self) -> Vec<(String, String)> {
        lock(&self.state).created_snapshots.clone()
    }
}

impl CloudGateway for FakeGateway {
    fn find_image<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<ImageRef>> {
        Box::pin(async move {
            Ok(lock(&self.state)
                .images
                .iter()
                .find(|(image_name, _)| image_name == name)
                .map(|(image_name, id)| ImageRef {
                    id: id.clone(),
                    name: image_name.clone(),
                }))
        })
    }

    fn find_flavor<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<FlavorRef>> {
        Box::pin(async move {
            Ok(lock(&self.state)
                .flavors
                .iter()
                .find(|(flavor_name, _)| flavor_name == name)
                .map(|(flavor_name, id)| FlavorRef {
                    id: id.clone(),
                    name: flavor_name.clone(),
                }))
        })
    }

    fn find_instance<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<ServerRecord>> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.find_instance_calls += 1;
            Ok(state
                .servers
                .iter()
                .find(|server| server.name == name)
                .cloned())
        })
    }

    fn get_instance<'a>(&'a self, id: &'a str) -> CloudFuture<'a, ServerRecord> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.get_instance_calls += 1;
            if let Some(server) = state.instance_states.pop_front() {
                return Ok(server);
            }
            state
                .servers
                .iter()
                .find(|server| server.id == id)
                .cloned()
                .ok_or_else(|| CloudError::NotFound {
                    resource: format!("server {id}"),
                })
        })
    }

    fn create_instance<'a>(
        &'a self,
        params: &'a CreateServerParams,
    ) -> CloudFuture<'a, ServerRecord> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.next_server_seq += 1;
            let server = ServerRecord {
                id: format!("srv-{}", state.next_server_seq),
                name: params.name.clone(),
                status: String::from("BUILD"),
                addresses: BTreeMap::new(),
            };
            state.created_instances.push(params.clone());
            state.servers.push(server.clone());
            Ok(server)
        })
    }

    fn delete_instance<'a>(&'a self, id: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.servers.retain(|server| server.id != id);
            state.deleted_instances.push(id.to_owned());
            Ok(())
        })
    }

    fn find_assigned_ip<'a>(&'a self, _instance_id: &'a str) -> CloudFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.find_assigned_ip_calls += 1;
            Ok(state.assigned_ips.pop_front().flatten())
        })
    }

    fn find_free_floating_ip(&self) -> CloudFuture<'_, FloatingIp> {
        Box::pin(async move {
            lock(&self.state)
                .floating_pool
                .iter()
                .find(|ip| ip.is_free())
                .cloned()
                .ok_or(CloudError::NoIpsAvailable)
        })
    }

    fn allocate_floating_ip(&self) -> CloudFuture<'_, FloatingIp> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.allocation_count += 1;
            let refill = state.refill_on_allocate.take();
            let address = refill
                .clone()
                .unwrap_or_else(|| String::from("203.0.113.99"));
            let ip = FloatingIp {
                id: format!("fip-alloc-{}", state.allocation_count),
                address,
                fixed_ip: None,
                port_id: None,
            };
            // Only a scripted refill lands in the pool; this models a
            // provider whose fresh allocations are not yet listable.
            if refill.is_some() {
                state.floating_pool.push(ip.clone());
            }
            Ok(ip)
        })
    }

    fn assign_ip<'a>(&'a self, instance_id: &'a str, ip: &'a FloatingIp) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            lock(&self.state)
                .assigned_bindings
                .push((instance_id.to_owned(), ip.address.clone()));
            Ok(())
        })
    }

    fn find_security_group<'a>(
        &'a self,
        name: &'a str,
    ) -> CloudFuture<'a, Option<SecurityGroupRef>> {
        Box::pin(async move {
            let state = lock(&self.state);
            let known = state
                .security_groups
                .iter()
                .chain(state.created_security_groups.iter())
                .any(|group| group == name);
            Ok(known.then(|| SecurityGroupRef {
                id: format!("sg-{name}"),
                name: name.to_owned(),
            }))
        })
    }

    fn create_security_group<'a>(&'a self, name: &'a str) -> CloudFuture<'a, SecurityGroupRef> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if state.fail_group_create {
                return Err(conflict(&format!("security group '{name}'")));
            }
            state.created_security_groups.push(name.to_owned());
            Ok(SecurityGroupRef {
                id: format!("sg-{name}"),
                name: name.to_owned(),
            })
        })
    }

    fn create_security_group_rule<'a>(
        &'a self,
        _group: &'a str,
        rule: &'a SecurityRule,
    ) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if state.fail_rule_create_provider {
                return Err(provider_failure());
            }
            if state.fail_rule_create_conflict {
                return Err(conflict("security group rule"));
            }
            state.created_rules.push(rule.clone());
            Ok(())
        })
    }

    fn find_keypair<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<KeypairRef>> {
        Box::pin(async move {
            let state = lock(&self.state);
            let known = state
                .keypairs
                .iter()
                .any(|keypair| keypair == name)
                || state
                    .created_keypairs
                    .iter()
                    .any(|(keypair, _)| keypair == name);
            Ok(known.then(|| KeypairRef {
                name: name.to_owned(),
                fingerprint: None,
            }))
        })
    }

    fn create_keypair<'a>(&'a self, name: &'a str, public_key: &'a str) -> CloudFuture<'a, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if state.fail_keypair_create {
                return Err(conflict(&format!("keypair '{name}'")));
            }
            state
                .created_keypairs
                .push((name.to_owned(), public_key.to_owned()));
            Ok(())
        })
    }

    fn create_snapshot<'a>(&'a self, instance_id: &'a str, name: &'a str) -> CloudFuture<'a, String> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state
                .created_snapshots
                .push((instance_id.to_owned(), name.to_owned()));
            Ok(format!("img-snap-{}", state.created_snapshots.len()))
        })
    }
}
