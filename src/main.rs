//! Binary entry point for the Nimbus CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;

use nimbus::{
    CloudError, ConfigError, Environment, EnvironmentConfig, FileSyncer, FilesError,
    OpenStackGateway, ProcessCommandRunner, ProvisionError, ProvisioningOrchestrator, SnapshotError,
    SnapshotManager, SshExecutor, TracingReporter,
};

#[derive(Debug, Parser)]
#[command(
    name = "nimbus",
    about = "Provision, sync, and snapshot ephemeral cloud development environments",
    arg_required_else_help = true
)]
enum Cli {
    #[command(about = "Build the environment and confirm its public IP")]
    Up,
    #[command(about = "Upload the configured file mappings to the environment")]
    Files,
    #[command(about = "Print the environment's public IP")]
    Ip,
    #[command(about = "Snapshot the environment into a named image")]
    Snapshot(SnapshotCommand),
    #[command(about = "Destroy the environment's instance")]
    Destroy,
}

#[derive(Debug, Parser)]
struct SnapshotCommand {
    /// Name of the image the snapshot is saved under.
    name: String,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Files(#[from] FilesError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error("environment has not been provisioned; try running `nimbus up` first")]
    NotProvisioned,
}

type Gateway = OpenStackGateway<ProcessCommandRunner>;

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let config = load_config()?;
    let gateway = OpenStackGateway::new(ProcessCommandRunner, config.external_network.clone());
    let mut environment = Environment::new(config);

    match cli {
        Cli::Up => up(&gateway, &mut environment).await,
        Cli::Files => files(&gateway, &mut environment).await,
        Cli::Ip => ip(&gateway, &mut environment).await,
        Cli::Snapshot(command) => snapshot(&gateway, &mut environment, &command.name).await,
        Cli::Destroy => destroy(&gateway, &mut environment).await,
    }
}

fn load_config() -> Result<EnvironmentConfig, CliError> {
    let config = EnvironmentConfig::load_without_cli_args()?;
    config.validate()?;
    Ok(config)
}

async fn up(gateway: &Gateway, environment: &mut Environment) -> Result<(), CliError> {
    let reporter = TracingReporter;

    if environment.server(gateway).await?.is_some() {
        tracing::info!(
            "environment '{}' already exists, skipping build",
            environment.name()
        );
    } else {
        ProvisioningOrchestrator::new(gateway, &reporter)
            .build(environment)
            .await?;
    }

    if !environment.config().files.is_empty() {
        sync_files(gateway, environment).await?;
    }

    let address = environment.ip(gateway).await?.ok_or(CliError::NotProvisioned)?;
    writeln!(io::stdout(), "{address}").ok();
    Ok(())
}

async fn files(gateway: &Gateway, environment: &mut Environment) -> Result<(), CliError> {
    let report = sync_files(gateway, environment).await?;
    tracing::info!(
        uploaded = report.uploaded,
        skipped = report.skipped,
        abandoned = report.abandoned,
        "file sync finished"
    );
    Ok(())
}

async fn sync_files(
    gateway: &Gateway,
    environment: &mut Environment,
) -> Result<nimbus::SyncReport, CliError> {
    let reporter = TracingReporter;
    let config = environment.config();
    let executor = SshExecutor::new(
        ProcessCommandRunner,
        config.ssh_bin.clone(),
        config.scp_bin.clone(),
    );

    Ok(FileSyncer::new(gateway, &executor, &reporter)
        .sync(environment)
        .await?)
}

async fn ip(gateway: &Gateway, environment: &mut Environment) -> Result<(), CliError> {
    let address = environment.ip(gateway).await?.ok_or(CliError::NotProvisioned)?;
    writeln!(io::stdout(), "{address}").ok();
    Ok(())
}

async fn snapshot(
    gateway: &Gateway,
    environment: &mut Environment,
    name: &str,
) -> Result<(), CliError> {
    let reporter = TracingReporter;
    let image_id = SnapshotManager::new(gateway, &reporter)
        .snapshot(environment, name)
        .await?;
    writeln!(io::stdout(), "{image_id}").ok();
    Ok(())
}

async fn destroy(gateway: &Gateway, environment: &mut Environment) -> Result<(), CliError> {
    if environment.delete(gateway).await? {
        tracing::info!("environment '{}' destroyed", environment.name());
    } else {
        tracing::warn!("environment '{}' does not exist", environment.name());
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
