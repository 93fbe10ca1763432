use clap::Parser;
use mbflash_cli::{init_tracing, load_records, record_policy};
use mbflash_core::crc16::image_checksum;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "CRC16 of the payload of an Intel-HEX image", long_about = None)]
struct Args {
    /// Path to the Intel-HEX image
    #[arg(short, long)]
    file: String,

    /// Fail on extended/start address records instead of skipping them
    #[arg(long)]
    strict_records: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn run(args: &Args) -> anyhow::Result<()> {
    let records = load_records(&args.file)?;
    info!(records = records.len(), file = %args.file, "Image decoded");

    let crc = image_checksum(&records, record_policy(args.strict_records))?;
    println!("{}", crc);
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = init_tracing(args.verbose) {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(&args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
