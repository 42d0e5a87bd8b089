#![forbid(unsafe_code)]
//! Shared plumbing for the fsreshape binaries: logging setup, the exit-code
//! contract for argument parsing, and the hole-zeroing operation.

use clap::error::ErrorKind;
use clap::Parser;
use frs_error::Result;
use frs_extent::ExtentMap;
use frs_io::{persist, BlockIo, DeviceFile};
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the stderr log subscriber; `RUST_LOG` overrides the `info`
/// default.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Parse the command line, exiting 0 on `--help` and 1 on a usage error
/// (with the hint to try `--help` on stderr).
pub fn parse_or_exit<C: Parser>() -> C {
    match C::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.kind() == ErrorKind::DisplayHelp => {
            print!("{err}");
            std::process::exit(0);
        }
        Err(err) => {
            eprint!("{err}");
            std::process::exit(1);
        }
    }
}

const ZERO_CHUNK: usize = 1024 * 1024;

/// Write zeroes over every device block not covered by the loop-file
/// extents recorded in the persistence artifact at `save_file`.
pub fn zero_device_holes(device: &DeviceFile, save_file: &Path) -> Result<()> {
    let (loop_extents, bitmask) = persist::read_extents_file::<u64>(save_file)?;
    let block_size_log2 = bitmask.effective_block_size_log2().unwrap_or(0);

    let holes =
        ExtentMap::complement0_logical_shift(&loop_extents, block_size_log2, device.length());
    info!(
        target: "frs::cli::zero",
        holes = holes.len(),
        blocks = holes.total_count(),
        block_size = 1_u64 << block_size_log2,
        "zeroing device holes"
    );

    let zeroes = vec![0_u8; ZERO_CHUNK];
    for extent in holes.iter() {
        let mut offset = extent.physical << block_size_log2;
        let mut left = extent.length << block_size_log2;
        while left > 0 {
            let chunk = left.min(ZERO_CHUNK as u64);
            device.write_at(offset, &zeroes[..chunk as usize])?;
            offset += chunk;
            left -= chunk;
        }
    }
    device.sync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use frs_extent::{BlockBitmask, Extent, ExtentVector};

    #[test]
    fn zeroes_exactly_the_uncovered_blocks() {
        const BS: u64 = 4096;
        let dir = tempfile::tempdir().unwrap();

        // 4-block device, every byte 0xAA.
        let device_path = dir.path().join("device.img");
        std::fs::write(&device_path, vec![0xAA_u8; (4 * BS) as usize]).unwrap();

        // Artifact: loop data at blocks 0 and 2 (byte-granular records).
        let vector: ExtentVector<u64> =
            vec![Extent::new(0, 0, BS), Extent::new(2 * BS, 2 * BS, BS)].into();
        let mut bitmask = BlockBitmask::new();
        bitmask.or_vector(&vector);
        bitmask.or_value(4 * BS);
        let save_file = dir.path().join("extents");
        persist::write_extents_file(&save_file, &vector, bitmask).unwrap();

        let device = DeviceFile::open(&device_path).unwrap();
        zero_device_holes(&device, &save_file).unwrap();

        let content = std::fs::read(&device_path).unwrap();
        for block in 0..4_u64 {
            let start = (block * BS) as usize;
            let expected = if block % 2 == 0 { 0xAA } else { 0x00 };
            assert!(
                content[start..start + BS as usize]
                    .iter()
                    .all(|&b| b == expected),
                "block {block} has wrong content"
            );
        }
    }

    #[test]
    fn missing_artifact_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let device_path = dir.path().join("device.img");
        std::fs::write(&device_path, vec![0_u8; 4096]).unwrap();
        let device = DeviceFile::open(&device_path).unwrap();
        assert!(zero_device_holes(&device, &dir.path().join("absent")).is_err());
    }
}
