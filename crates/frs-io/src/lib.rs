//! I/O plumbing for the remapper: extent probing, the resume artifact and
//! the device/loop-file/zero-file descriptor set.
//!
//! The algebra upstream is pure; everything that touches a file descriptor
//! lives here. Syscalls not covered by `std` (FIEMAP, `BLKGETSIZE64`) are
//! confined to the `probe` module.

pub mod device;
pub mod job;
pub mod persist;
pub mod probe;

pub use device::{BlockIo, DeviceFile, RemapIo, Role};
pub use job::Job;
pub use probe::{device_length_of, FiemapProbe, FilesystemProbe};
