//! Shared plumbing for the `fwchecksum` and `fwupdate` tools.

use std::path::Path;

use anyhow::{Context, Result, bail};
use mbflash_core::ihex::{Record, RecordPolicy, decode_file};
use mbflash_core::protocol::ProtocolRevision;

/// Install the stderr log subscriber.
///
/// `RUST_LOG` overrides the default level (`info`, or `debug` when verbose).
pub fn init_tracing(verbose: bool) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    Ok(())
}

pub fn record_policy(strict: bool) -> RecordPolicy {
    if strict {
        RecordPolicy::Reject
    } else {
        RecordPolicy::Skip
    }
}

/// Read and decode an Intel-HEX file.
pub fn load_records(path: impl AsRef<Path>) -> Result<Vec<Record>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let records =
        decode_file(&text).with_context(|| format!("failed to decode {}", path.display()))?;
    Ok(records)
}

/// Pick the protocol revision: a TOML file wins over a built-in name, which
/// wins over the configured one.
pub fn resolve_revision(
    name: Option<&str>,
    file: Option<&Path>,
    configured: ProtocolRevision,
) -> Result<ProtocolRevision> {
    match (name, file) {
        (Some(_), Some(_)) => bail!("--revision and --revision-file are mutually exclusive"),
        (_, Some(file)) => ProtocolRevision::load_from_file(file)
            .with_context(|| format!("failed to load revision from {}", file.display())),
        (Some(name), None) => Ok(ProtocolRevision::builtin(name)?),
        (None, None) => Ok(configured),
    }
}
