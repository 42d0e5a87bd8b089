//! `frsmove SOURCE-TREE TARGET-TREE`
//!
//! Moves a whole directory subtree onto another mount, preserving metadata,
//! hard links, symlinks, devices and sockets.

use anyhow::Context;
use clap::Parser;
use frs_move::{SimulationMode, TreeMover};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "frsmove",
    about = "Move SOURCE-TREE onto TARGET-TREE, metadata and hard links included",
    disable_version_flag = true
)]
struct Cli {
    /// Tree to move.
    source_tree: PathBuf,
    /// Destination; may be on a different filesystem.
    target_tree: PathBuf,
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
    TreeMover::new(SimulationMode::Real)
        .move_tree(&cli.source_tree, &cli.target_tree)
        .with_context(|| {
            format!(
                "move of '{}' onto '{}' failed",
                cli.source_tree.display(),
                cli.target_tree.display()
            )
        })?;
    Ok(())
}
