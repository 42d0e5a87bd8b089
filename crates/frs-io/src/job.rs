//! Per-invocation work directory under the hidden `.fstransform` root.
//!
//! A job owns a directory `<root>/.fstransform/job.<id>/` holding the
//! persistence artifact; the directory is deliberately left behind on exit
//! so an interrupted run can be resumed from it.

use frs_error::{FrsError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::info;

/// Name of the hidden work root created under the target filesystem.
pub const WORK_DIR_NAME: &str = ".fstransform";

/// A claimed work directory plus the storage budget attached to it.
#[derive(Debug)]
pub struct Job {
    id: u32,
    dir: PathBuf,
    storage_size: u64,
    storage_size_exact: bool,
}

impl Job {
    /// Claim a work directory under `<root>/.fstransform/`.
    ///
    /// With `requested_id == 0`, picks the lowest id whose directory can be
    /// created exclusively. A nonzero `requested_id` claims exactly that id
    /// and fails if it is already taken (the resume path).
    pub fn init(root: &Path, requested_id: u32, storage_size: u64) -> Result<Self> {
        let work_root = root.join(WORK_DIR_NAME);
        match fs::create_dir(&work_root) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err.into()),
        }

        let (id, dir) = if requested_id != 0 {
            let dir = work_root.join(format!("job.{requested_id}"));
            fs::create_dir(&dir)?;
            (requested_id, dir)
        } else {
            Self::claim_lowest_id(&work_root)?
        };

        info!(target: "frs::io::job", id, dir = %dir.display(), "started job");
        Ok(Self {
            id,
            dir,
            storage_size,
            storage_size_exact: requested_id != 0,
        })
    }

    fn claim_lowest_id(work_root: &Path) -> Result<(u32, PathBuf)> {
        for id in 1..u32::MAX {
            let dir = work_root.join(format!("job.{id}"));
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(FrsError::Invalid("work directory ids exhausted".to_owned()))
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the persistence artifact inside the job directory.
    #[must_use]
    pub fn extents_file(&self) -> PathBuf {
        self.dir.join("extents")
    }

    /// Path of the secondary-storage file, a sibling of the job directory.
    #[must_use]
    pub fn storage_file(&self) -> PathBuf {
        self.dir
            .parent()
            .unwrap_or(&self.dir)
            .join(format!("job.{}.storage", self.id))
    }

    #[must_use]
    pub fn storage_size(&self) -> u64 {
        self.storage_size
    }

    pub fn set_storage_size(&mut self, bytes: u64) {
        self.storage_size = bytes;
    }

    /// True if the storage budget must be honored exactly (resumed jobs).
    #[must_use]
    pub fn storage_size_exact(&self) -> bool {
        self.storage_size_exact
    }

    /// End the job. The directory stays behind as the resume anchor.
    pub fn quit(self) {
        info!(target: "frs::io::job", id = self.id, "job finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_picks_lowest_free_id() {
        let root = tempfile::tempdir().unwrap();
        let first = Job::init(root.path(), 0, 0).unwrap();
        assert_eq!(first.id(), 1);
        let second = Job::init(root.path(), 0, 0).unwrap();
        assert_eq!(second.id(), 2);

        // Freeing id 1 makes it the lowest again.
        fs::remove_dir_all(first.dir()).unwrap();
        let third = Job::init(root.path(), 0, 0).unwrap();
        assert_eq!(third.id(), 1);
    }

    #[test]
    fn requested_id_is_exclusive() {
        let root = tempfile::tempdir().unwrap();
        let job = Job::init(root.path(), 7, 0).unwrap();
        assert_eq!(job.id(), 7);
        assert!(job.storage_size_exact());
        assert!(Job::init(root.path(), 7, 0).is_err());
    }

    #[test]
    fn paths_follow_layout() {
        let root = tempfile::tempdir().unwrap();
        let job = Job::init(root.path(), 0, 4096).unwrap();
        assert!(job.dir().starts_with(root.path().join(WORK_DIR_NAME)));
        assert_eq!(job.extents_file(), job.dir().join("extents"));
        assert_eq!(
            job.storage_file(),
            root.path().join(WORK_DIR_NAME).join("job.1.storage")
        );
        assert_eq!(job.storage_size(), 4096);
        assert!(!job.storage_size_exact());
    }

    #[test]
    fn quit_keeps_the_directory() {
        let root = tempfile::tempdir().unwrap();
        let job = Job::init(root.path(), 0, 0).unwrap();
        let dir = job.dir().to_path_buf();
        job.quit();
        assert!(dir.is_dir());
    }
}
