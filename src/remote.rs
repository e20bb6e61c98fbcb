//! Remote command execution and file transfer over the system SSH tools.
//!
//! The executor drives `ssh` and `scp` through [`CommandRunner`]. Exit
//! status 255 is how both tools report connection-level failures, so it is
//! surfaced as a transient [`RemoteError::Network`] the file syncer can
//! retry; any other non-zero status is a command failure.

use std::ffi::OsString;
use std::fmt;

use camino::Utf8Path;
use shell_escape::unix::escape;
use thiserror::Error;
use uuid::Uuid;

use crate::runner::{CommandOutput, CommandRunner, RunnerError};

const NETWORK_FAILURE_STATUS: i32 = 255;

/// Login target for remote operations.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTarget {
    /// Remote login user.
    pub user: String,
    /// Host name or address.
    pub host: String,
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Options applied to a file upload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PutOptions {
    /// Mirror the local file mode on the remote side.
    pub preserve_mode: bool,
    /// Stage the upload and move it into place with elevated privilege.
    pub elevate: bool,
}

/// Errors raised by remote operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Transient connection-level failure; safe to retry.
    #[error("network failure talking to {target}: {stderr}")]
    Network {
        /// Target the connection was made to.
        target: String,
        /// Stderr captured from the transport tool.
        stderr: String,
    },
    /// The remote command ran and failed.
    #[error("remote command exited with status {status_text}: {stderr}")]
    Command {
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// The transport tool could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

impl From<RunnerError> for RemoteError {
    fn from(value: RunnerError) -> Self {
        match value {
            RunnerError::Spawn { program, message } => Self::Spawn { program, message },
        }
    }
}

/// Capability set consumed by the file syncer.
pub trait RemoteExecutor {
    /// Runs a shell command on the target.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Network`] on connection failures and
    /// [`RemoteError::Command`] when the command exits non-zero.
    fn run_command(&self, target: &SshTarget, command: &str) -> Result<(), RemoteError>;

    /// Uploads a local file to the target.
    ///
    /// # Errors
    ///
    /// Same classification as [`RemoteExecutor::run_command`].
    fn put_file(
        &self,
        target: &SshTarget,
        local: &Utf8Path,
        remote: &Utf8Path,
        options: &PutOptions,
    ) -> Result<(), RemoteError>;
}

/// Executor backed by the system `ssh` and `scp` binaries.
#[derive(Clone, Debug)]
pub struct SshExecutor<R: CommandRunner> {
    runner: R,
    ssh_bin: String,
    scp_bin: String,
}

impl<R: CommandRunner> SshExecutor<R> {
    /// Creates an executor using the given binaries.
    #[must_use]
    pub fn new(runner: R, ssh_bin: impl Into<String>, scp_bin: impl Into<String>) -> Self {
        Self {
            runner,
            ssh_bin: ssh_bin.into(),
            scp_bin: scp_bin.into(),
        }
    }

    fn batch_options() -> Vec<OsString> {
        vec![
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-o"),
            OsString::from("StrictHostKeyChecking=no"),
            OsString::from("-o"),
            OsString::from("UserKnownHostsFile=/dev/null"),
        ]
    }

    fn classify(target: &SshTarget, output: &CommandOutput) -> Result<(), RemoteError> {
        if output.is_success() {
            return Ok(());
        }
        if output.code == Some(NETWORK_FAILURE_STATUS) {
            return Err(RemoteError::Network {
                target: target.to_string(),
                stderr: output.stderr.clone(),
            });
        }
        Err(RemoteError::Command {
            status: output.code,
            status_text: output.status_text(),
            stderr: output.stderr.clone(),
        })
    }

    fn scp(
        &self,
        target: &SshTarget,
        local: &Utf8Path,
        remote_path: &str,
        preserve_mode: bool,
    ) -> Result<(), RemoteError> {
        let mut args = Self::batch_options();
        if preserve_mode {
            args.push(OsString::from("-p"));
        }
        args.push(OsString::from(local.as_str()));
        args.push(OsString::from(format!("{target}:{remote_path}")));

        let output = self.runner.run(&self.scp_bin, &args)?;
        Self::classify(target, &output)
    }
}

impl<R: CommandRunner> RemoteExecutor for SshExecutor<R> {
    fn run_command(&self, target: &SshTarget, command: &str) -> Result<(), RemoteError> {
        let mut args = Self::batch_options();
        args.push(OsString::from(target.to_string()));
        args.push(OsString::from(command));

        let output = self.runner.run(&self.ssh_bin, &args)?;
        Self::classify(target, &output)
    }

    fn put_file(
        &self,
        target: &SshTarget,
        local: &Utf8Path,
        remote: &Utf8Path,
        options: &PutOptions,
    ) -> Result<(), RemoteError> {
        if !options.elevate {
            return self.scp(target, local, remote.as_str(), options.preserve_mode);
        }

        // scp runs as the login user, which may not be allowed to write the
        // destination. Stage under /tmp and move into place with sudo.
        let staging = format!("/tmp/nimbus-upload-{}", Uuid::new_v4().simple());
        self.scp(target, local, &staging, options.preserve_mode)?;

        let move_command = format!(
            "sudo mv {} {}",
            escape(staging.as_str().into()),
            escape(remote.as_str().into())
        );
        self.run_command(target, &move_command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;

    fn target() -> SshTarget {
        SshTarget {
            user: String::from("ubuntu"),
            host: String::from("203.0.113.9"),
        }
    }

    fn executor(runner: ScriptedRunner) -> SshExecutor<ScriptedRunner> {
        SshExecutor::new(runner, "ssh", "scp")
    }

    #[test]
    fn run_command_builds_batch_mode_ssh_invocation() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let exec = executor(runner.clone());

        exec.run_command(&target(), "mkdir -p /etc/app").unwrap();

        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].program, "ssh");
        let rendered = invocations[0].command_string();
        assert!(rendered.contains("BatchMode=yes"), "rendered: {rendered}");
        assert!(rendered.contains("ubuntu@203.0.113.9"));
        assert!(rendered.ends_with("mkdir -p /etc/app"));
    }

    #[test]
    fn exit_255_is_a_network_error() {
        let runner = ScriptedRunner::new();
        runner.push_exit_code(255);
        let exec = executor(runner);

        let err = exec.run_command(&target(), "true").unwrap_err();
        assert!(matches!(err, RemoteError::Network { .. }));
    }

    #[test]
    fn other_failures_are_command_errors() {
        let runner = ScriptedRunner::new();
        runner.push_failure(1);
        let exec = executor(runner);

        let err = exec.run_command(&target(), "false").unwrap_err();
        assert!(matches!(err, RemoteError::Command { status: Some(1), .. }));
    }

    #[test]
    fn plain_put_uploads_directly_to_the_destination() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let exec = executor(runner.clone());

        exec.put_file(
            &target(),
            Utf8Path::new("/home/dev/.vimrc"),
            Utf8Path::new("/home/ubuntu/.vimrc"),
            &PutOptions {
                preserve_mode: true,
                elevate: false,
            },
        )
        .unwrap();

        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].program, "scp");
        let rendered = invocations[0].command_string();
        assert!(rendered.contains(" -p "), "mode flag missing: {rendered}");
        assert!(rendered.ends_with("ubuntu@203.0.113.9:/home/ubuntu/.vimrc"));
    }

    #[test]
    fn elevated_put_stages_then_moves_with_sudo() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        runner.push_success();
        let exec = executor(runner.clone());

        exec.put_file(
            &target(),
            Utf8Path::new("/home/dev/app.conf"),
            Utf8Path::new("/etc/app/app.conf"),
            &PutOptions {
                preserve_mode: true,
                elevate: true,
            },
        )
        .unwrap();

        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0].program, "scp");
        assert!(
            invocations[0]
                .command_string()
                .contains(":/tmp/nimbus-upload-")
        );
        assert_eq!(invocations[1].program, "ssh");
        let move_command = invocations[1].command_string();
        assert!(move_command.contains("sudo mv /tmp/nimbus-upload-"));
        assert!(move_command.ends_with("/etc/app/app.conf"));
    }

    #[test]
    fn staging_failure_skips_the_move(){
        let runner = ScriptedRunner::new();
        runner.push_exit_code(255);
        let exec = executor(runner.clone());

        let err = exec
            .put_file(
                &target(),
                Utf8Path::new("/home/dev/app.conf"),
                Utf8Path::new("/etc/app/app.conf"),
                &PutOptions {
                    preserve_mode: false,
                    elevate: true,
                },
            )
            .unwrap_err();

        assert!(matches!(err, RemoteError::Network { .. }));
        assert_eq!(runner.invocations().len(), 1);
    }
}
