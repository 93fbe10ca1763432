use std::path::PathBuf;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use mbflash_cli::{init_tracing, record_policy, resolve_revision};
use mbflash_core::session::{SessionConfig, UpdateSession};
use mbflash_core::transport::RpcTransport;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Flash an Intel-HEX image through a register-protocol bootloader", long_about = None)]
struct Args {
    /// Broker address (e.g. tcp://localhost:5555)
    #[arg(short = 'a', long)]
    broker: Option<String>,

    /// Service name the device is reached through
    #[arg(short, long)]
    service: Option<String>,

    /// Path to the Intel-HEX image
    #[arg(short, long)]
    file: Option<String>,

    /// Slave id of the target device (1..=255)
    #[arg(short = 't', long = "slave", value_parser = clap::value_parser!(u8).range(1..))]
    slave: Option<u8>,

    /// Built-in protocol revision (v1, v2)
    #[arg(long)]
    revision: Option<String>,

    /// Protocol revision defined in a TOML file
    #[arg(long)]
    revision_file: Option<PathBuf>,

    /// Session configuration file (TOML); flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fail on extended/start address records instead of skipping them
    #[arg(long)]
    strict_records: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn build_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig::default(),
    };

    if let Some(broker) = &args.broker {
        config.endpoint.broker = broker.clone();
    }
    if let Some(service) = &args.service {
        config.endpoint.service = service.clone();
    }
    if let Some(file) = &args.file {
        config.firmware_path = Some(file.clone());
    }
    if let Some(slave) = args.slave {
        config.slave_id = slave;
    }
    if args.strict_records {
        config.record_policy = record_policy(true);
    }
    config.revision = resolve_revision(
        args.revision.as_deref(),
        args.revision_file.as_deref(),
        config.revision,
    )?;
    Ok(config)
}

fn missing_arguments(config: &SessionConfig) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if config.endpoint.broker.is_empty() {
        missing.push("-a <BROKER>");
    }
    if config.endpoint.service.is_empty() {
        missing.push("-s <SERVICE>");
    }
    if config.firmware_path.as_deref().is_none_or(str::is_empty) {
        missing.push("-f <FILE>");
    }
    if config.slave_id == 0 {
        missing.push("-t <SLAVE>");
    }
    missing
}

#[cfg(feature = "mdp")]
fn open_transport() -> Result<Box<dyn RpcTransport>> {
    Ok(Box::new(mbflash_core::transport::MdpTransport::new()))
}

#[cfg(not(feature = "mdp"))]
fn open_transport() -> Result<Box<dyn RpcTransport>> {
    anyhow::bail!("no broker transport available, rebuild with the `mdp` feature")
}

fn run(config: SessionConfig) -> Result<()> {
    let transport = open_transport()?;
    let session = UpdateSession::new(config, transport);
    let summary = session.run()?;
    info!(
        pages = summary.pages,
        bytes = summary.bytes,
        "Firmware update finished"
    );
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = init_tracing(args.verbose) {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    let missing = missing_arguments(&config);
    if !missing.is_empty() {
        Args::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                format!("missing/invalid required arguments: {}", missing.join(", ")),
            )
            .exit();
    }

    info!(
        endpoint = %config.endpoint,
        slave = config.slave_id,
        revision = %config.revision.name,
        "Starting firmware update"
    );

    if let Err(e) = run(config) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
