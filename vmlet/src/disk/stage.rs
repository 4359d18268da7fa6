//! Working directory creation and all-or-nothing disk copies.

use super::DiskFormat;
use crate::errors::{VmletError, VmletResult};
use std::fs::{self, DirBuilder, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Mode for the working directory and any parents we create.
const WORKING_DIR_MODE: u32 = 0o755;

const PARTIAL_SUFFIX: &str = ".partial";

/// Bytes copied between cancellation checks.
const COPY_CHUNK: usize = 1024 * 1024;

/// A disk image copied into a VM's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedDisk {
    pub path: PathBuf,
    pub format: DiskFormat,
    pub size_bytes: u64,
}

/// Create the working directory and any missing parents.
pub fn prepare_working_dir(path: &Path) -> VmletResult<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(WORKING_DIR_MODE)
        .create(path)
        .map_err(|e| VmletError::staging("create working directory", path, e))?;

    if !path.is_dir() {
        return Err(VmletError::staging(
            "create working directory",
            path,
            io::Error::new(io::ErrorKind::AlreadyExists, "exists and is not a directory"),
        ));
    }

    Ok(())
}

/// Copy `source` to `dest` so that `dest` only ever appears complete.
///
/// Bytes are written to `<dest>.partial`, synced, both handles closed, and
/// the partial file is then renamed onto `dest`. On failure the partial file
/// is left in place for the caller to inspect or remove.
///
/// Blocking. `cancel` is checked between chunks; once it fires the copy
/// stops, `dest` is not touched and `Cancelled` is returned.
pub fn copy_disk(
    source: &Path,
    dest: &Path,
    format: DiskFormat,
    cancel: &CancellationToken,
) -> VmletResult<StagedDisk> {
    let copy_op = || format!("copy from {}", source.display());
    let cancelled = || VmletError::Cancelled(format!("copy to {}", dest.display()));

    let mut input =
        File::open(source).map_err(|e| VmletError::staging("open source", source, e))?;
    let expected = input
        .metadata()
        .map_err(|e| VmletError::staging("stat source", source, e))?
        .len();

    let partial = partial_path(dest);
    let mut output =
        File::create(&partial).map_err(|e| VmletError::staging("create destination", &partial, e))?;

    let mut buf = vec![0u8; COPY_CHUNK];
    let mut copied: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(VmletError::staging(copy_op(), source, e)),
        };
        output
            .write_all(&buf[..n])
            .map_err(|e| VmletError::staging(copy_op(), &partial, e))?;
        copied += n as u64;
    }

    output
        .sync_all()
        .map_err(|e| VmletError::staging("sync destination", &partial, e))?;
    drop(output);
    drop(input);

    if copied != expected {
        return Err(VmletError::staging(
            copy_op(),
            &partial,
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("copied {} of {} bytes", copied, expected),
            ),
        ));
    }

    if cancel.is_cancelled() {
        return Err(cancelled());
    }
    fs::rename(&partial, dest).map_err(|e| VmletError::staging("publish destination", dest, e))?;

    tracing::debug!(
        source = %source.display(),
        dest = %dest.display(),
        bytes = copied,
        "Disk staged"
    );

    Ok(StagedDisk {
        path: dest.to_path_buf(),
        format,
        size_bytes: copied,
    })
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}
