//! Recursive tree mover: migrate a whole directory subtree from one mount
//! to another, preserving metadata, hard links, symlinks, devices and
//! sockets.
//!
//! A plain `rename` is tried first; when the kernel answers `EXDEV` (or the
//! target simply cannot be renamed onto), the mover walks the source tree,
//! reproduces every entry at the target and removes the source behind
//! itself. Hard-linked files are recreated as hard links through an inode
//! cache instead of being copied once per name.

use frs_error::{FrsError, Result};
use std::collections::HashMap;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{
    lchown, symlink, DirBuilderExt, FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt,
};
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

const COPY_CHUNK: usize = 64 * 1024;

/// Whether destructive operations actually happen.
///
/// In `DryRun` every mutation becomes a logged no-op and the initial rename
/// deliberately reports `EXDEV`, so the whole recursive path is exercised
/// without touching anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationMode {
    Real,
    DryRun,
}

impl SimulationMode {
    #[must_use]
    pub fn is_dry_run(self) -> bool {
        matches!(self, Self::DryRun)
    }
}

/// Moves one tree. Holds the inode cache for the lifetime of the move.
#[derive(Debug)]
pub struct TreeMover {
    mode: SimulationMode,
    /// `(device, inode)` of hard-linked sources → the target path already
    /// created for them.
    inode_cache: HashMap<(u64, u64), PathBuf>,
}

impl TreeMover {
    #[must_use]
    pub fn new(mode: SimulationMode) -> Self {
        Self {
            mode,
            inode_cache: HashMap::new(),
        }
    }

    /// Move `source_root` onto `target_root`.
    pub fn move_tree(&mut self, source_root: &Path, target_root: &Path) -> Result<()> {
        match self.move_rename(source_root, target_root) {
            Ok(()) => {
                trace!(
                    target: "frs::move",
                    source = %source_root.display(),
                    dest = %target_root.display(),
                    "rename fast path succeeded"
                );
                return Ok(());
            }
            Err(err) => {
                debug!(
                    target: "frs::move",
                    error = %err,
                    "rename fast path unavailable, walking the tree"
                );
            }
        }

        // Later chmod calls reproduce modes exactly; a nonzero creation mask
        // would skew everything created in between.
        if !self.mode.is_dry_run() {
            sys::clear_umask();
        }
        self.move_entry(source_root, target_root)
    }

    /// Fast path. A dry run reports `EXDEV` so the recursion still runs.
    fn move_rename(&self, source: &Path, target: &Path) -> std::io::Result<()> {
        if self.mode.is_dry_run() {
            return Err(std::io::Error::from_raw_os_error(libc::EXDEV));
        }
        fs::rename(source, target)
    }

    /// Move a single file, special file or whole directory.
    fn move_entry(&mut self, source: &Path, target: &Path) -> Result<()> {
        trace!(
            target: "frs::move",
            source = %source.display(),
            dest = %target.display(),
            "move"
        );
        let stat = fs::symlink_metadata(source)?;

        if stat.is_file() {
            return self.move_file(source, &stat, target);
        }
        if !stat.is_dir() {
            return self.move_special(source, &stat, target);
        }

        self.create_dir(target)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            self.move_entry(&entry.path(), &target.join(entry.file_name()))?;
        }
        self.copy_stat(target, &stat)?;
        self.remove_dir(source)
    }

    /// If `source` is one name of a hard-linked inode already reproduced at
    /// the target, link it there instead of copying again.
    fn link_from_cache(&mut self, source: &Path, stat: &Metadata, target: &Path) -> Result<bool> {
        if stat.nlink() <= 1 {
            return Ok(false);
        }
        let key = (stat.dev(), stat.ino());
        if let Some(existing) = self.inode_cache.get(&key) {
            trace!(
                target: "frs::move",
                source = %source.display(),
                dest = %target.display(),
                original = %existing.display(),
                "hard link"
            );
            if !self.mode.is_dry_run() {
                fs::hard_link(existing, target)?;
                fs::remove_file(source)?;
            }
            return Ok(true);
        }
        self.inode_cache.insert(key, target.to_path_buf());
        Ok(false)
    }

    fn move_file(&mut self, source: &Path, stat: &Metadata, target: &Path) -> Result<()> {
        trace!(
            target: "frs::move",
            source = %source.display(),
            dest = %target.display(),
            "move_file"
        );
        if self.link_from_cache(source, stat, target)? {
            return Ok(());
        }
        if self.mode.is_dry_run() {
            return Ok(());
        }

        let mut input = File::open(source)?;
        let mut output = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(stat.mode() & 0o7777)
            .open(target)?;
        self.copy_stream(&mut input, &mut output, source, target)?;
        drop(output);
        drop(input);

        self.copy_stat(target, stat)?;
        fs::remove_file(source)?;
        Ok(())
    }

    /// Byte-for-byte stream copy.
    fn copy_stream(
        &self,
        input: &mut File,
        output: &mut File,
        source: &Path,
        target: &Path,
    ) -> Result<()> {
        // TODO: detect holes in the source (SEEK_DATA/SEEK_HOLE) and
        // reproduce them with seeks instead of writing zeroes.
        let mut buffer = vec![0_u8; COPY_CHUNK];
        loop {
            let got = match input.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(
                        target: "frs::move",
                        source = %source.display(),
                        "read failed: {err}"
                    );
                    return Err(err.into());
                }
            };
            // write_all restarts on EINTR.
            output.write_all(&buffer[..got]).map_err(|err| {
                debug!(
                    target: "frs::move",
                    dest = %target.display(),
                    "write failed: {err}"
                );
                FrsError::Io(err)
            })?;
        }
        Ok(())
    }

    fn move_special(&mut self, source: &Path, stat: &Metadata, target: &Path) -> Result<()> {
        trace!(
            target: "frs::move",
            source = %source.display(),
            dest = %target.display(),
            "move_special"
        );
        if self.link_from_cache(source, stat, target)? {
            return Ok(());
        }
        if self.mode.is_dry_run() {
            return Ok(());
        }

        let file_type = stat.file_type();
        if file_type.is_char_device() || file_type.is_block_device() || file_type.is_socket() {
            let mode = (stat.mode() | 0o600) & !0o077;
            if let Err(err) = sys::mknod(target, mode, stat.rdev()) {
                if !file_type.is_socket() {
                    return Err(err);
                }
                // A socket is meaningless without its listener; losing it
                // must not abort the whole move.
                warn!(
                    target: "frs::move",
                    dest = %target.display(),
                    error = %err,
                    "cannot recreate UNIX socket"
                );
                fs::remove_file(source)?;
                return Ok(());
            }
        } else if file_type.is_fifo() {
            sys::mkfifo(target, 0o600)?;
        } else if file_type.is_symlink() {
            let link_target = fs::read_link(source)?;
            symlink(&link_target, target)?;
        } else {
            return Err(FrsError::Unsupported(format!(
                "special file '{}' has unknown type {:o}",
                source.display(),
                stat.mode() & libc::S_IFMT
            )));
        }

        self.copy_stat(target, stat)?;
        fs::remove_file(source)?;
        Ok(())
    }

    fn create_dir(&self, target: &Path) -> Result<()> {
        trace!(target: "frs::move", dest = %target.display(), "create_dir");
        if self.mode.is_dry_run() {
            return Ok(());
        }
        fs::DirBuilder::new().mode(0o700).create(target)?;
        Ok(())
    }

    fn remove_dir(&self, source: &Path) -> Result<()> {
        trace!(target: "frs::move", source = %source.display(), "remove_dir");
        if self.mode.is_dry_run() {
            return Ok(());
        }
        fs::remove_dir(source)?;
        Ok(())
    }

    /// Reproduce timestamps, owner and mode on `target`.
    ///
    /// Timestamps first and non-fatally; then owner, then mode. chmod must
    /// come after lchown because chown strips set-uid/set-gid bits.
    fn copy_stat(&self, target: &Path, stat: &Metadata) -> Result<()> {
        if self.mode.is_dry_run() {
            return Ok(());
        }

        if let Err(err) = sys::set_file_times(target, stat.atime(), stat.mtime()) {
            warn!(
                target: "frs::move",
                dest = %target.display(),
                error = %err,
                "cannot reproduce timestamps"
            );
        }

        lchown(target, Some(stat.uid()), Some(stat.gid()))?;

        if !stat.file_type().is_symlink() {
            fs::set_permissions(target, fs::Permissions::from_mode(stat.mode() & 0o7777))?;
        }
        Ok(())
    }
}

// ── Syscalls std does not cover ─────────────────────────────────────────────

mod sys {
    use frs_error::{FrsError, Result};
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    fn c_path(path: &Path) -> Result<CString> {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|_| FrsError::Invalid(format!("path contains NUL: {}", path.display())))
    }

    pub fn clear_umask() {
        // SAFETY: umask only swaps the process creation mask.
        unsafe {
            libc::umask(0);
        }
    }

    pub fn mknod(path: &Path, mode: u32, rdev: u64) -> Result<()> {
        let path = c_path(path)?;
        // SAFETY: NUL-terminated path plus plain integer arguments.
        if unsafe { libc::mknod(path.as_ptr(), mode, rdev) } != 0 {
            return Err(FrsError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn mkfifo(path: &Path, mode: u32) -> Result<()> {
        let path = c_path(path)?;
        // SAFETY: as above.
        if unsafe { libc::mkfifo(path.as_ptr(), mode) } != 0 {
            return Err(FrsError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// utimes-style timestamp copy, microseconds zeroed.
    pub fn set_file_times(path: &Path, atime: i64, mtime: i64) -> Result<()> {
        let path = c_path(path)?;
        let times = [
            libc::timeval {
                tv_sec: atime,
                tv_usec: 0,
            },
            libc::timeval {
                tv_sec: mtime,
                tv_usec: 0,
            },
        ];
        // SAFETY: NUL-terminated path and a two-element timeval array.
        if unsafe { libc::utimes(path.as_ptr(), times.as_ptr()) } != 0 {
            return Err(FrsError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(path: &Path, content: &[u8], mode: u32) {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)
            .unwrap();
        file.write_all(content).unwrap();
        // Creation honors the umask; make the mode explicit.
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    fn build_tree(root: &Path) {
        fs::create_dir(root).unwrap();
        write_file(&root.join("a.txt"), b"alpha", 0o644);
        write_file(&root.join("exec.sh"), b"#!/bin/sh\n", 0o751);
        fs::create_dir(root.join("sub")).unwrap();
        write_file(&root.join("sub/inner.bin"), &[7_u8; 100_000], 0o600);
        symlink("a.txt", root.join("link")).unwrap();
        sys::mkfifo(&root.join("pipe"), 0o600).unwrap();
    }

    #[test]
    fn rename_fast_path_moves_in_one_step() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let target = dir.path().join("dst");
        build_tree(&source);
        let inode_before = fs::metadata(source.join("a.txt")).unwrap().ino();

        TreeMover::new(SimulationMode::Real)
            .move_tree(&source, &target)
            .unwrap();

        assert!(!source.exists());
        // Same inode proves rename, not copy.
        assert_eq!(fs::metadata(target.join("a.txt")).unwrap().ino(), inode_before);
    }

    #[test]
    fn recursive_move_reproduces_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let target = dir.path().join("dst");
        build_tree(&source);

        let src_mtime = fs::symlink_metadata(source.join("a.txt")).unwrap().mtime();
        let src_uid = fs::symlink_metadata(&source).unwrap().uid();

        let mut mover = TreeMover::new(SimulationMode::Real);
        // Drive the recursion directly; the rename fast path is covered
        // separately.
        mover.move_entry(&source, &target).unwrap();

        assert!(!source.exists(), "source tree must be removed");
        assert_eq!(fs::read(target.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(
            fs::read(target.join("sub/inner.bin")).unwrap(),
            vec![7_u8; 100_000]
        );

        let mode = |p: &Path| fs::symlink_metadata(p).unwrap().mode() & 0o7777;
        assert_eq!(mode(&target.join("a.txt")), 0o644);
        assert_eq!(mode(&target.join("exec.sh")), 0o751);
        assert_eq!(mode(&target.join("sub/inner.bin")), 0o600);

        let link = fs::symlink_metadata(target.join("link")).unwrap();
        assert!(link.file_type().is_symlink());
        assert_eq!(
            fs::read_link(target.join("link")).unwrap(),
            PathBuf::from("a.txt")
        );

        assert!(fs::symlink_metadata(target.join("pipe"))
            .unwrap()
            .file_type()
            .is_fifo());

        // Metadata reproduced: owner and (second-granular) mtime.
        let moved = fs::symlink_metadata(target.join("a.txt")).unwrap();
        assert_eq!(moved.mtime(), src_mtime);
        assert_eq!(fs::symlink_metadata(&target).unwrap().uid(), src_uid);
    }

    #[test]
    fn hard_links_are_reconnected_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let target = dir.path().join("dst");
        fs::create_dir(&source).unwrap();
        write_file(&source.join("first"), b"shared", 0o644);
        fs::hard_link(source.join("first"), source.join("second")).unwrap();

        let mut mover = TreeMover::new(SimulationMode::Real);
        mover.move_entry(&source, &target).unwrap();

        let a = fs::metadata(target.join("first")).unwrap();
        let b = fs::metadata(target.join("second")).unwrap();
        assert_eq!(a.ino(), b.ino(), "hard link was split into two inodes");
        assert_eq!(a.nlink(), 2);
        assert_eq!(fs::read(target.join("second")).unwrap(), b"shared");
    }

    #[test]
    fn dry_run_walks_everything_but_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let target = dir.path().join("dst");
        build_tree(&source);

        TreeMover::new(SimulationMode::DryRun)
            .move_tree(&source, &target)
            .unwrap();

        assert!(source.join("a.txt").exists(), "dry run removed a source file");
        assert!(source.join("sub/inner.bin").exists());
        assert!(!target.exists(), "dry run created the target");
    }

    #[test]
    fn missing_source_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut mover = TreeMover::new(SimulationMode::Real);
        let err = mover
            .move_entry(&dir.path().join("absent"), &dir.path().join("dst"))
            .unwrap_err();
        assert!(matches!(err, FrsError::Io(_)));
    }

    #[test]
    fn empty_directory_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let target = dir.path().join("dst");
        fs::create_dir(&source).unwrap();
        fs::set_permissions(&source, fs::Permissions::from_mode(0o755)).unwrap();

        let mut mover = TreeMover::new(SimulationMode::Real);
        mover.move_entry(&source, &target).unwrap();

        assert!(!source.exists());
        let meta = fs::metadata(&target).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.mode() & 0o7777, 0o755);
    }
}
