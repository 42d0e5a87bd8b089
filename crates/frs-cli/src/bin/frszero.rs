//! `frszero DEVICE SAVE-FILE`
//!
//! Writes zeroes over every block of DEVICE not covered by the loop-file
//! extents recorded in SAVE-FILE (a persistence artifact written by
//! `frsremap`).

use anyhow::Context;
use clap::Parser;
use frs_io::DeviceFile;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "frszero",
    about = "Zero every block of DEVICE not covered by the extents in SAVE-FILE",
    disable_version_flag = true
)]
struct Cli {
    /// Block device to zero.
    device: PathBuf,
    /// Persistence artifact holding the loop-file extents.
    save_file: PathBuf,
}

fn main() {
    frs_cli::init_tracing();
    let cli = frs_cli::parse_or_exit::<Cli>();
    if let Err(error) = run(&cli) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let device = DeviceFile::open(&cli.device)
        .with_context(|| format!("cannot open device '{}'", cli.device.display()))?;
    frs_cli::zero_device_holes(&device, &cli.save_file)
        .with_context(|| format!("zeroing holes of '{}' failed", cli.device.display()))?;
    Ok(())
}
