//! `frsremap DEVICE LOOP-FILE ZERO-FILE`
//!
//! Rearranges the raw blocks of DEVICE so that the filesystem image stored
//! in LOOP-FILE occupies the device directly.

use anyhow::Context;
use clap::Parser;
use frs_remap::{run_reshape, ReshapeConfig};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "frsremap",
    about = "Rearrange DEVICE so the filesystem image in LOOP-FILE occupies it directly",
    disable_version_flag = true
)]
struct Cli {
    /// Block device holding the filesystem being replaced.
    device: PathBuf,
    /// Regular file on DEVICE containing the new filesystem image.
    loop_file: PathBuf,
    /// Regular file on DEVICE whose extents approximate the free space.
    zero_file: PathBuf,
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
    run_reshape(
        &cli.device,
        &cli.loop_file,
        &cli.zero_file,
        &ReshapeConfig::default(),
    )
    .with_context(|| format!("remap of '{}' failed", cli.device.display()))?;
    Ok(())
}
