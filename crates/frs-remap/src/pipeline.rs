//! The end-to-end remap job: open the descriptor set, probe the layouts,
//! persist the resume artifact, plan storage, then shuffle until the device
//! holds the image directly.

use crate::Remapper;
use frs_error::{FrsError, Result};
use frs_extent::ExtentMap;
use frs_io::persist;
use frs_io::{BlockIo, FiemapProbe, FilesystemProbe, Job, RemapIo};
use frs_storage::{create_storage, page_size, plan_primary};
use frs_types::Offset;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Storage budget bounds when the caller does not request a size.
const STORAGE_BUDGET_MIN: u64 = 16 << 20;
const STORAGE_BUDGET_MAX: u64 = 256 << 20;

/// Knobs of a remap run; the defaults describe a fresh job rooted in the
/// current directory.
#[derive(Debug, Clone)]
pub struct ReshapeConfig {
    /// Directory that receives the hidden `.fstransform` work root.
    pub work_root: PathBuf,
    /// Nonzero resumes that job id; zero claims a fresh one.
    pub job_id: u32,
    /// Scratch budget in bytes; zero picks a default from the device size.
    pub storage_size: u64,
}

impl Default for ReshapeConfig {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from("."),
            job_id: 0,
            storage_size: 0,
        }
    }
}

fn default_storage_budget(device_length: u64) -> u64 {
    (device_length / 1024)
        .clamp(STORAGE_BUDGET_MIN, STORAGE_BUDGET_MAX)
        .min(device_length)
}

/// Run a whole remap job with the shipped FIEMAP probe.
pub fn run_reshape(
    device_path: &Path,
    loop_path: &Path,
    zero_path: &Path,
    config: &ReshapeConfig,
) -> Result<()> {
    run_reshape_with(&FiemapProbe, device_path, loop_path, zero_path, config)
}

/// Run a whole remap job with a caller-supplied probe.
pub fn run_reshape_with(
    probe: &dyn FilesystemProbe,
    device_path: &Path,
    loop_path: &Path,
    zero_path: &Path,
    config: &ReshapeConfig,
) -> Result<()> {
    let job = Job::init(&config.work_root, config.job_id, config.storage_size)?;
    let mut io = RemapIo::new();
    io.open(device_path, loop_path, zero_path)?;

    let result = run_job(probe, &mut io, &job);
    io.close();
    job.quit();
    result
}

fn run_job(probe: &dyn FilesystemProbe, io: &mut RemapIo, job: &Job) -> Result<()> {
    let (loop_extents, free_extents, bitmask) = io.read_extents(probe)?;
    let device_length = io.device_length()?;
    let Some(block_log2) = bitmask.effective_block_size_log2() else {
        return Err(FrsError::Invalid(
            "image and free space report no extents".to_owned(),
        ));
    };
    let block_size = 1_u64 << block_log2;
    info!(
        target: "frs::remap::pipeline",
        block_size,
        device_length,
        "effective block size determined"
    );

    // The artifact is the resume anchor; it must exist before the first
    // device mutation.
    persist::write_extents_file(&job.extents_file(), &loop_extents, bitmask)?;
    io.close_extents();

    let mut loop_blocks = loop_extents;
    loop_blocks.shift_right(block_log2)?;
    let loop_map = ExtentMap::from_vector(&loop_blocks)?;
    let mut free_blocks = free_extents;
    free_blocks.shift_right(block_log2)?;
    let free_map = ExtentMap::from_vector(&free_blocks)?;
    let device_blocks = device_length >> block_log2;

    // Storage budget: a byte count that is a multiple of both the block
    // size and the page size, so primary extents stay mappable.
    let align = (page_size() as u64).max(block_size);
    let requested = if job.storage_size() > 0 {
        job.storage_size()
    } else {
        default_storage_budget(device_length)
    };
    let budget = frs_types::align_down(requested, align)
        .unwrap_or(align)
        .max(align);
    let align_log2_blocks = align.trailing_zeros().saturating_sub(block_log2);
    debug!(
        target: "frs::remap::pipeline",
        requested, budget, "storage budget"
    );

    let (primary_blocks, secondary_blocks) = plan_primary(
        &free_map,
        &loop_map,
        device_blocks,
        budget >> block_log2,
        job.storage_size_exact(),
        align_log2_blocks,
    )?;

    let mut primary_bytes = primary_blocks;
    primary_bytes.shift_left(block_log2)?;
    let secondary_bytes = secondary_blocks
        .checked_shl_lossless(block_log2)
        .ok_or(FrsError::Overflow)?;

    let plan = create_storage(
        io.device()?.file(),
        &primary_bytes,
        secondary_bytes,
        &job.storage_file(),
    )?;

    let worker = Remapper::new(io.device()?, plan, &loop_map, &free_map, block_log2)?;
    let stats = worker.run()?;
    io.device()?.sync()?;
    info!(
        target: "frs::remap::pipeline",
        placed = stats.placed_blocks,
        staged = stats.staged_blocks,
        "device now holds the image"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use frs_extent::{BlockBitmask, Extent, ExtentVector};
    use frs_io::device_length_of;
    use std::collections::HashMap;
    use std::fs::File;
    use std::os::unix::fs::MetadataExt;

    const BS: u64 = 4096;

    /// Probe answering from canned per-inode layouts.
    struct FakeProbe {
        layouts: HashMap<u64, ExtentVector<u64>>,
    }

    impl FilesystemProbe for FakeProbe {
        fn extents_of(&self, file: &File) -> Result<(ExtentVector<u64>, BlockBitmask<u64>)> {
            let ino = file.metadata()?.ino();
            let vector = self
                .layouts
                .get(&ino)
                .cloned()
                .ok_or_else(|| FrsError::Invalid("unexpected file probed".to_owned()))?;
            let mut bitmask = BlockBitmask::new();
            bitmask.or_vector(&vector);
            Ok((vector, bitmask))
        }

        fn device_size(&self, file: &File) -> Result<u64> {
            device_length_of(file)
        }
    }

    fn blocks(ranges: &[(u64, u64, u64)]) -> ExtentVector<u64> {
        ranges
            .iter()
            .map(|&(physical, logical, length)| {
                Extent::new(physical * BS, logical * BS, length * BS)
            })
            .collect()
    }

    #[test]
    fn whole_job_reshapes_an_image_file() {
        let root = tempfile::tempdir().unwrap();
        let device_path = root.path().join("device.img");
        let loop_path = root.path().join("loopfile");
        let zero_path = root.path().join("zerofile");

        // 64-block device image: recognizable bytes everywhere, image
        // pattern at the loop extents' physical positions.
        let device_blocks = 64_u64;
        let mut content = vec![0xEE_u8; (device_blocks * BS) as usize];
        let loop_layout = [(20_u64, 0_u64, 8_u64), (40, 8, 4), (2, 12, 4)];
        for &(physical, logical, length) in &loop_layout {
            for i in 0..length {
                let start = ((physical + i) * BS) as usize;
                content[start..start + BS as usize].fill((logical + i) as u8 + 1);
            }
        }
        std::fs::write(&device_path, &content).unwrap();
        std::fs::write(&loop_path, b"placeholder").unwrap();
        std::fs::write(&zero_path, b"placeholder").unwrap();

        // Zero-file extents: every block that is neither image data nor
        // old-filesystem payload. Logical offsets are just sequential.
        let free_ranges = [(0_u64, 2_u64), (6, 14), (28, 12), (44, 20)];
        let mut logical = 0;
        let mut free_vector = ExtentVector::new();
        for &(physical, length) in &free_ranges {
            free_vector.push(Extent::new(physical * BS, logical * BS, length * BS));
            logical += length;
        }

        let probe = FakeProbe {
            layouts: HashMap::from([
                (
                    File::open(&loop_path).unwrap().metadata().unwrap().ino(),
                    blocks(&loop_layout),
                ),
                (
                    File::open(&zero_path).unwrap().metadata().unwrap().ino(),
                    free_vector,
                ),
            ]),
        };

        let config = ReshapeConfig {
            work_root: root.path().to_path_buf(),
            job_id: 0,
            storage_size: 64 * 1024,
        };
        run_reshape_with(&probe, &device_path, &loop_path, &zero_path, &config).unwrap();

        // The image must now occupy the device head, block by block.
        let reshaped = std::fs::read(&device_path).unwrap();
        for block in 0..16_u64 {
            let start = (block * BS) as usize;
            assert!(
                reshaped[start..start + BS as usize]
                    .iter()
                    .all(|&b| b == block as u8 + 1),
                "image block {block} not in place"
            );
        }

        // Resume artifact exists and parses back to the probed layout.
        let artifact = root.path().join(".fstransform/job.1/extents");
        assert!(artifact.is_file());
        let (saved, saved_mask) = persist::read_extents_file::<u64>(&artifact).unwrap();
        assert_eq!(
            ExtentMap::from_vector(&saved).unwrap(),
            ExtentMap::from_vector(&blocks(&loop_layout)).unwrap()
        );
        assert_eq!(saved_mask.effective_block_size_log2(), Some(12));

        // The secondary storage file (if one was needed) is gone; the job
        // directory stays as the resume anchor.
        assert!(!root.path().join(".fstransform/job.1.storage").exists());
        assert!(root.path().join(".fstransform/job.1").is_dir());
    }

    #[test]
    fn default_budget_scales_with_device() {
        assert_eq!(default_storage_budget(1 << 40), 256 << 20);
        assert_eq!(default_storage_budget(64 << 30), 64 << 20);
        assert_eq!(default_storage_budget(1 << 20), 1 << 20);
    }
}
