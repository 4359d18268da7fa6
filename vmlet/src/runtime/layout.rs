//! On-disk layout of the vmlet home directory.
//!
//! ```text
//! <home>/
//!   logs/vmlet.log
//!   <vm-name>/
//!     <vm-name>.qcow2      primary disk
//!     seed.img             seed disk
//!     <vm-name>.socket     QMP control socket (created by QEMU)
//! ```

use crate::disk::DiskFormat;
use std::path::{Path, PathBuf};

pub mod filenames {
    pub const LOG_FILE: &str = "vmlet.log";
    pub const SEED_DISK_STEM: &str = "seed";
    pub const SOCKET_EXT: &str = "socket";
}

pub mod subdirs {
    pub const LOGS_DIR: &str = "logs";
}

/// Layout rooted at the vmlet home directory.
#[derive(Debug, Clone)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
        }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(subdirs::LOGS_DIR)
    }

    /// Layout of a single VM. `name` must already be validated.
    pub fn vm_layout(&self, name: &str) -> VmLayout {
        VmLayout {
            name: name.to_string(),
            root: self.home_dir.join(name),
        }
    }
}

/// Per-VM paths, all pure functions of the home directory and the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmLayout {
    name: String,
    root: PathBuf,
}

impl VmLayout {
    pub fn working_dir(&self) -> &Path {
        &self.root
    }

    pub fn primary_disk_path(&self) -> PathBuf {
        self.root
            .join(format!("{}.{}", self.name, DiskFormat::Qcow2.extension()))
    }

    pub fn seed_disk_path(&self) -> PathBuf {
        self.root.join(format!(
            "{}.{}",
            filenames::SEED_DISK_STEM,
            DiskFormat::Raw.extension()
        ))
    }

    pub fn socket_path(&self) -> PathBuf {
        self.root
            .join(format!("{}.{}", self.name, filenames::SOCKET_EXT))
    }
}
