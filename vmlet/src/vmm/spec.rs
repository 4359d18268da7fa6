//! Immutable description of one VM.

use crate::errors::{VmletError, VmletResult};
use crate::runtime::{FilesystemLayout, VmLayout, VmletOptions};
use std::path::{Path, PathBuf};

/// Longest VM name accepted; the name also names the unit and the socket.
pub const MAX_NAME_LEN: usize = 64;

/// `sun_path` is 108 bytes on Linux including the trailing NUL.
pub const UNIX_SOCKET_PATH_LIMIT: usize = 107;

/// A validated VM description.
///
/// Construct with [`VmSpec::new`]; every derived path comes from the name and
/// the home directory, so two specs built from equal inputs are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    name: String,
    layout: VmLayout,
    backing_image_source: PathBuf,
    seed_image_source: PathBuf,
    cpu_count: u32,
    memory_mb: u32,
    executable: PathBuf,
    cpu_model: String,
    machine: String,
}

impl VmSpec {
    pub fn new(name: &str, options: &VmletOptions) -> VmletResult<Self> {
        validate_name(name)?;

        if options.cpus == 0 {
            return Err(VmletError::Config(format!("{}: cpu count must be >= 1", name)));
        }
        if options.memory_mb == 0 {
            return Err(VmletError::Config(format!("{}: memory must be >= 1 MB", name)));
        }

        let layout = FilesystemLayout::new(&options.home_dir).vm_layout(name);
        let socket_len = layout.socket_path().as_os_str().len();
        if socket_len > UNIX_SOCKET_PATH_LIMIT {
            return Err(VmletError::Config(format!(
                "control socket path {} is {} bytes, limit is {}",
                layout.socket_path().display(),
                socket_len,
                UNIX_SOCKET_PATH_LIMIT
            )));
        }

        Ok(Self {
            name: name.to_string(),
            layout,
            backing_image_source: options.backing_image.clone(),
            seed_image_source: options.seed_image.clone(),
            cpu_count: options.cpus,
            memory_mb: options.memory_mb,
            executable: options.qemu_binary.clone(),
            cpu_model: options.cpu_model.clone(),
            machine: options.machine.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unit name registered with the init system.
    pub fn unit_name(&self) -> String {
        format!("{}.service", self.name)
    }

    pub fn layout(&self) -> &VmLayout {
        &self.layout
    }

    pub fn working_directory(&self) -> &Path {
        self.layout.working_dir()
    }

    pub fn control_socket_path(&self) -> PathBuf {
        self.layout.socket_path()
    }

    pub fn backing_image_source(&self) -> &Path {
        &self.backing_image_source
    }

    pub fn seed_image_source(&self) -> &Path {
        &self.seed_image_source
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }

    pub fn memory_mb(&self) -> u32 {
        self.memory_mb
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn cpu_model(&self) -> &str {
        &self.cpu_model
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }
}

/// Names become directory, file and unit names, so keep them to a portable set.
pub fn validate_name(name: &str) -> VmletResult<()> {
    if name.is_empty() {
        return Err(VmletError::Config("VM name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(VmletError::Config(format!(
            "VM name is {} bytes, limit is {}",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(VmletError::Config(format!(
            "VM name must not start with '.' or '-': {}",
            name
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(VmletError::Config(format!(
            "VM name {:?} contains invalid character {:?}",
            name, bad
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> VmletOptions {
        VmletOptions {
            home_dir: PathBuf::from("/srv/vmlet"),
            ..VmletOptions::default()
        }
    }

    #[test]
    fn test_derived_paths() {
        let spec = VmSpec::new("vm3", &options()).unwrap();

        assert_eq!(spec.working_directory(), Path::new("/srv/vmlet/vm3"));
        assert_eq!(
            spec.control_socket_path(),
            PathBuf::from("/srv/vmlet/vm3/vm3.socket")
        );
        assert_eq!(spec.unit_name(), "vm3.service");
    }

    #[test]
    fn test_equal_inputs_give_equal_specs() {
        let a = VmSpec::new("vm3", &options()).unwrap();
        let b = VmSpec::new("vm3", &options()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_unsafe_names() {
        for name in ["", "../etc", "a/b", ".hidden", "-flag", "vm 3", "vm\n"] {
            assert!(
                VmSpec::new(name, &options()).is_err(),
                "name {:?} should be rejected",
                name
            );
        }
        assert!(VmSpec::new(&"a".repeat(MAX_NAME_LEN + 1), &options()).is_err());
    }

    #[test]
    fn test_accepts_portable_names() {
        for name in ["vm3", "web-01", "db_primary", "node.2"] {
            assert!(VmSpec::new(name, &options()).is_ok(), "{}", name);
        }
    }

    #[test]
    fn test_rejects_zero_resources() {
        let no_cpu = VmletOptions {
            cpus: 0,
            ..options()
        };
        assert!(VmSpec::new("vm3", &no_cpu).is_err());

        let no_mem = VmletOptions {
            memory_mb: 0,
            ..options()
        };
        assert!(VmSpec::new("vm3", &no_mem).is_err());
    }

    #[test]
    fn test_rejects_socket_path_over_limit() {
        let deep = VmletOptions {
            home_dir: PathBuf::from(format!("/{}", "d".repeat(100))),
            ..options()
        };
        let err = VmSpec::new("vm3", &deep).unwrap_err();
        assert!(err.to_string().contains("limit"));
    }
}
