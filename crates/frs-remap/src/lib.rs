#![forbid(unsafe_code)]
//! The block remap worker.
//!
//! Consumes the image layout (where the new filesystem's blocks currently
//! sit on the device) and the free-space layout, and shuffles device blocks
//! until every image block sits at its own logical offset, at which point
//! the device *is* the new filesystem. The scratch region from the storage
//! planner breaks the cycles of the permutation.
//!
//! The worker is generic over [`BlockIo`] so the whole shuffle is testable
//! against an in-memory device.

pub mod pipeline;

pub use pipeline::{run_reshape, run_reshape_with, ReshapeConfig};

use frs_error::{FrsError, Result};
use frs_extent::{Extent, ExtentMap};
use frs_io::BlockIo;
use frs_storage::StoragePlan;
use tracing::{debug, info, trace};

const TRANSFER_CHUNK: usize = 64 * 1024;

/// An image fragment parked in the scratch region, waiting for its target
/// range to free up.
#[derive(Debug, Clone, Copy)]
struct StagedChunk {
    /// Target position, in blocks.
    target: u64,
    /// Length in blocks.
    length: u64,
    /// Byte offset inside the scratch region.
    mem_offset: u64,
}

/// Counters reported after a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemapStats {
    /// Blocks copied directly to their final position.
    pub placed_blocks: u64,
    /// Blocks that had to bounce through the scratch region.
    pub staged_blocks: u64,
}

/// Drives the shuffle loop. Owns the storage plan for its whole lifetime;
/// the device is borrowed from the descriptor set that outlives the job.
#[derive(Debug)]
pub struct Remapper<'d, D: BlockIo> {
    device: &'d D,
    storage: StoragePlan,
    /// Image blocks not yet in place: logical → current physical, in blocks.
    remaining: ExtentMap<u64>,
    /// Identity map of device blocks that may be overwritten right now.
    free: ExtentMap<u64>,
    /// Identity map of every device block the worker may ever write.
    allowed: ExtentMap<u64>,
    /// Identity map of free byte ranges inside the scratch region.
    free_storage: ExtentMap<u64>,
    staged: Vec<StagedChunk>,
    block_size_log2: u32,
    transfer: Vec<u8>,
}

impl<'d, D: BlockIo> Remapper<'d, D> {
    /// Build a worker from the probed layouts, both already converted to
    /// blocks of `2^block_size_log2` bytes.
    ///
    /// Fails with `Invalid` if the image's target layout is not fully
    /// covered by image data plus free space: remapping would have to
    /// destroy live data of the old filesystem.
    pub fn new(
        device: &'d D,
        storage: StoragePlan,
        loop_map: &ExtentMap<u64>,
        free_space: &ExtentMap<u64>,
        block_size_log2: u32,
    ) -> Result<Self> {
        let device_blocks = device.length() >> block_size_log2;

        // Every device block the worker may ever touch.
        let mut allowed = loop_map.physical_coverage();
        for extent in free_space.physical_coverage().iter() {
            allowed.insert(extent)?;
        }

        for extent in loop_map.iter() {
            if extent.physical_end() > device_blocks || extent.logical_end() > device_blocks {
                return Err(FrsError::Invalid(format!(
                    "image extent (physical {}, logical {}, length {}) exceeds device ({device_blocks} blocks)",
                    extent.physical, extent.logical, extent.length
                )));
            }
            if !allowed.contains_range(extent.logical, extent.length) {
                return Err(FrsError::Invalid(format!(
                    "target blocks [{}, {}) hold live data outside the image and free space",
                    extent.logical,
                    extent.logical_end()
                )));
            }
        }

        // Blocks that still need to move: everything whose current position
        // differs from its target.
        let mut remaining = ExtentMap::new();
        for extent in loop_map.iter() {
            if extent.physical != extent.logical {
                remaining.insert(extent)?;
            }
        }

        // Writable now: free space that holds no image data, minus the
        // blocks claimed as primary scratch.
        let mut free = free_space
            .physical_coverage()
            .intersect_all(&loop_map.complement0_physical(device_blocks));
        for scratch in storage.primary() {
            let (physical, length) = (scratch.physical, scratch.length);
            if physical.trailing_zeros() < block_size_log2
                || length.trailing_zeros() < block_size_log2
            {
                return Err(FrsError::Invalid(format!(
                    "scratch extent ({physical}, {length}) is not block-aligned"
                )));
            }
            free.remove(physical >> block_size_log2, length >> block_size_log2);
        }

        let mut free_storage = ExtentMap::new();
        let storage_bytes = storage.mmap_size() as u64;
        free_storage.insert(Extent::new(0, 0, storage_bytes))?;

        debug!(
            target: "frs::remap",
            pending = remaining.total_count(),
            free = free.total_count(),
            storage = storage_bytes,
            "remap worker ready"
        );
        Ok(Self {
            device,
            storage,
            remaining,
            free,
            allowed,
            free_storage,
            staged: Vec::new(),
            block_size_log2,
            transfer: vec![0_u8; TRANSFER_CHUNK],
        })
    }

    /// Blocks still out of place (parked chunks included).
    #[must_use]
    pub fn pending_blocks(&self) -> u64 {
        self.remaining.total_count() + self.staged.iter().map(|c| c.length).sum::<u64>()
    }

    /// Run the shuffle to completion.
    ///
    /// A device write error is fatal: the image layout is partially mutated
    /// and only a resume from the persistence artifact can continue.
    pub fn run(mut self) -> Result<RemapStats> {
        let mut stats = RemapStats::default();

        while !self.remaining.is_empty() || !self.staged.is_empty() {
            let mut progress = false;
            progress |= self.place_direct(&mut stats)?;
            progress |= self.flush_staged(&mut stats)?;
            if progress {
                continue;
            }
            if !self.stage_one(&mut stats)? {
                return Err(FrsError::Invalid(
                    "remap stalled: no free target and no scratch space left".to_owned(),
                ));
            }
        }

        self.device.sync()?;
        self.storage.sync()?;
        info!(
            target: "frs::remap",
            placed = stats.placed_blocks,
            staged = stats.staged_blocks,
            "remap complete"
        );
        Ok(stats)
    }

    /// Copy every sub-extent whose target range is currently free straight
    /// to its final position.
    fn place_direct(&mut self, stats: &mut RemapStats) -> Result<bool> {
        let mut progress = false;
        let snapshot: Vec<Extent<u64>> = self.remaining.iter().collect();
        for extent in snapshot {
            for part in self.free.intersect_range(extent.logical, extent.length) {
                let src = extent.physical + (part.logical - extent.logical);
                let dst = part.logical;
                self.check_writable(dst, part.length)?;
                self.copy_on_device(src, dst, part.length)?;
                trace!(
                    target: "frs::remap",
                    src, dst, blocks = part.length, "placed"
                );
                self.remaining.remove(part.logical, part.length);
                self.free.remove(dst, part.length);
                self.free.insert(Extent::new(src, src, part.length))?;
                stats.placed_blocks += part.length;
                progress = true;
            }
        }
        Ok(progress)
    }

    /// Write out every parked chunk whose target range has freed up,
    /// splitting chunks that can only partially land.
    fn flush_staged(&mut self, stats: &mut RemapStats) -> Result<bool> {
        let mut progress = false;
        let mut still_staged = Vec::new();

        for chunk in std::mem::take(&mut self.staged) {
            let parts = self.free.intersect_range(chunk.target, chunk.length);
            if parts.is_empty() {
                still_staged.push(chunk);
                continue;
            }

            let mut cursor = chunk.target;
            let chunk_end = chunk.target + chunk.length;
            for part in parts {
                if part.logical > cursor {
                    still_staged.push(StagedChunk {
                        target: cursor,
                        length: part.logical - cursor,
                        mem_offset: chunk.mem_offset
                            + ((cursor - chunk.target) << self.block_size_log2),
                    });
                }
                let mem = chunk.mem_offset
                    + ((part.logical - chunk.target) << self.block_size_log2);
                let bytes = part.length << self.block_size_log2;
                self.check_writable(part.logical, part.length)?;
                {
                    let data = self.storage.slice(mem as usize, bytes as usize)?;
                    self.device
                        .write_at(part.logical << self.block_size_log2, data)?;
                }
                trace!(
                    target: "frs::remap",
                    dst = part.logical,
                    blocks = part.length,
                    "flushed from scratch"
                );
                self.free.remove(part.logical, part.length);
                self.free_storage.insert(Extent::new(mem, mem, bytes))?;
                progress = true;
                cursor = part.logical_end();
            }
            if cursor < chunk_end {
                still_staged.push(StagedChunk {
                    target: cursor,
                    length: chunk_end - cursor,
                    mem_offset: chunk.mem_offset
                        + ((cursor - chunk.target) << self.block_size_log2),
                });
            }
        }

        self.staged = still_staged;
        Ok(progress)
    }

    /// Park the front of the first out-of-place extent in the scratch
    /// region, vacating its source blocks. Returns false when the scratch
    /// region is exhausted.
    fn stage_one(&mut self, stats: &mut RemapStats) -> Result<bool> {
        let Some(extent) = self.remaining.first() else {
            return Ok(false);
        };
        let Some(segment) = self.free_storage.first() else {
            return Ok(false);
        };
        let blocks = extent.length.min(segment.length >> self.block_size_log2);
        if blocks == 0 {
            return Ok(false);
        }
        let bytes = blocks << self.block_size_log2;
        let mem = segment.logical;

        {
            let slot = self.storage.slice_mut(mem as usize, bytes as usize)?;
            self.device
                .read_at(extent.physical << self.block_size_log2, slot)?;
        }
        trace!(
            target: "frs::remap",
            src = extent.physical,
            blocks,
            mem,
            "staged into scratch"
        );

        self.free_storage.remove(mem, bytes);
        self.remaining.remove(extent.logical, blocks);
        self.free
            .insert(Extent::new(extent.physical, extent.physical, blocks))?;
        self.staged.push(StagedChunk {
            target: extent.logical,
            length: blocks,
            mem_offset: mem,
        });
        stats.staged_blocks += blocks;
        Ok(true)
    }

    fn check_writable(&self, block: u64, length: u64) -> Result<()> {
        if self.allowed.contains_range(block, length) {
            Ok(())
        } else {
            Err(FrsError::Invalid(format!(
                "refusing to write blocks [{block}, {}): outside image + free space",
                block + length
            )))
        }
    }

    /// Device-to-device copy, overlap-safe.
    fn copy_on_device(&mut self, src_block: u64, dst_block: u64, blocks: u64) -> Result<()> {
        let src = src_block << self.block_size_log2;
        let dst = dst_block << self.block_size_log2;
        let total = blocks << self.block_size_log2;
        let chunk = self.transfer.len() as u64;

        let overlapping = src < dst && dst < src + total;
        if overlapping {
            // Copy back-to-front so the not-yet-copied tail survives.
            let mut pos = total;
            while pos > 0 {
                let n = pos.min(chunk);
                pos -= n;
                let buf = &mut self.transfer[..n as usize];
                self.device.read_at(src + pos, buf)?;
                self.device.write_at(dst + pos, buf)?;
            }
        } else {
            let mut pos = 0;
            while pos < total {
                let n = (total - pos).min(chunk);
                let buf = &mut self.transfer[..n as usize];
                self.device.read_at(src + pos, buf)?;
                self.device.write_at(dst + pos, buf)?;
                pos += n;
            }
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
