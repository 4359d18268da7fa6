//! `VmSpec` → unit descriptor.

use super::{UnitDescriptor, UnitSection};
use crate::disk::DiskFormat;
use crate::vmm::VmSpec;
use std::path::Path;

pub mod sections {
    pub const IDENTITY: &str = "Unit";
    pub const EXECUTION: &str = "Service";
    pub const ACTIVATION: &str = "Install";
}

const WANTED_BY: &str = "multi-user.target";

/// Build the unit descriptor for `spec`. Total and deterministic.
pub fn build_unit(spec: &VmSpec) -> UnitDescriptor {
    let exec_start = launch_args(spec)
        .iter()
        .map(|arg| escape_exec_arg(arg))
        .collect::<Vec<_>>()
        .join(" ");

    UnitDescriptor::new(vec![
        UnitSection::new(sections::IDENTITY).directive(
            "Description",
            format!("QEMU virtual machine {}", spec.name()),
        ),
        UnitSection::new(sections::EXECUTION)
            .directive(
                "WorkingDirectory",
                escape_specifiers(&spec.working_directory().display().to_string()),
            )
            .directive("ExecStart", exec_start),
        UnitSection::new(sections::ACTIVATION).directive("WantedBy", WANTED_BY),
    ])
}

/// QEMU command line in launch order, one element per argv entry.
pub fn launch_args(spec: &VmSpec) -> Vec<String> {
    let layout = spec.layout();
    vec![
        spec.executable().display().to_string(),
        // QMP control socket: QEMU listens, does not wait for a client
        "-qmp".to_string(),
        format!(
            "unix:{},server=on,wait=off",
            qemu_opt_value(&spec.control_socket_path())
        ),
        "-cpu".to_string(),
        spec.cpu_model().to_string(),
        "-smp".to_string(),
        spec.cpu_count().to_string(),
        "-machine".to_string(),
        spec.machine().to_string(),
        "-m".to_string(),
        spec.memory_mb().to_string(),
        "-drive".to_string(),
        drive_arg(&layout.primary_disk_path(), DiskFormat::Qcow2),
        "-drive".to_string(),
        drive_arg(&layout.seed_disk_path(), DiskFormat::Raw),
    ]
}

fn drive_arg(path: &Path, format: DiskFormat) -> String {
    format!(
        "if=virtio,format={},file={}",
        format.as_str(),
        qemu_opt_value(path)
    )
}

/// QEMU option values end at `,`; a literal comma is written `,,`.
fn qemu_opt_value(path: &Path) -> String {
    path.display().to_string().replace(',', ",,")
}

/// Escape a path-valued directive such as `WorkingDirectory=`.
///
/// Only specifiers are expanded there; the value is taken verbatim otherwise.
fn escape_specifiers(value: &str) -> String {
    value.replace('%', "%%")
}

/// Escape one argv entry for `ExecStart=`.
///
/// `%` and `$` are systemd specifier/variable prefixes and are doubled;
/// entries with whitespace, quotes or backslashes are double-quoted.
fn escape_exec_arg(arg: &str) -> String {
    let escaped = arg.replace('%', "%%").replace('$', "$$");
    if escaped.contains(|c: char| c.is_whitespace() || c == '"' || c == '\\') {
        let inner = escaped.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{}\"", inner)
    } else {
        escaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::VmletOptions;
    use std::path::PathBuf;

    fn spec(name: &str, cpus: u32, memory_mb: u32) -> VmSpec {
        let options = VmletOptions {
            home_dir: PathBuf::from("/srv/vmlet"),
            cpus,
            memory_mb,
            ..VmletOptions::default()
        };
        VmSpec::new(name, &options).unwrap()
    }

    #[test]
    fn test_vm3_launch_command_order() {
        let unit = build_unit(&spec("vm3", 2, 2048));
        let exec = unit
            .section(sections::EXECUTION)
            .and_then(|s| s.get("ExecStart"))
            .unwrap();

        let expected_in_order = [
            "/usr/bin/qemu-system-x86_64",
            "-qmp unix:/srv/vmlet/vm3/vm3.socket,server=on,wait=off",
            "-smp 2",
            "-m 2048",
            "file=/srv/vmlet/vm3/vm3.qcow2",
            "file=/srv/vmlet/vm3/seed.img",
        ];
        let mut cursor = 0;
        for needle in expected_in_order {
            let found = exec[cursor..]
                .find(needle)
                .unwrap_or_else(|| panic!("{needle:?} missing or out of order in {exec}"));
            cursor += found + needle.len();
        }
        assert!(exec.starts_with("/usr/bin/qemu-system-x86_64 "));
    }

    #[test]
    fn test_sections_in_fixed_order() {
        let unit = build_unit(&spec("vm3", 2, 2048));
        let names: Vec<&str> = unit.sections().iter().map(|s| s.name()).collect();
        assert_eq!(names, ["Unit", "Service", "Install"]);

        let service = unit.section(sections::EXECUTION).unwrap();
        let keys: Vec<&str> = service.directives().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["WorkingDirectory", "ExecStart"]);
        assert_eq!(service.get("WorkingDirectory"), Some("/srv/vmlet/vm3"));
        assert_eq!(
            unit.section(sections::ACTIVATION).and_then(|s| s.get("WantedBy")),
            Some("multi-user.target")
        );
        assert!(
            unit.section(sections::IDENTITY)
                .and_then(|s| s.get("Description"))
                .unwrap()
                .contains("vm3")
        );
    }

    #[test]
    fn test_equal_specs_render_identically() {
        let a = build_unit(&spec("vm3", 2, 2048)).to_bytes();
        let b = build_unit(&spec("vm3", 2, 2048)).to_bytes();
        assert_eq!(a, b);
        assert_eq!(
            build_unit(&spec("vm3", 2, 2048)).render(),
            build_unit(&spec("vm3", 2, 2048)).render()
        );
    }

    #[test]
    fn test_different_specs_render_differently() {
        let a = build_unit(&spec("vm3", 2, 2048)).render();
        let b = build_unit(&spec("vm3", 4, 2048)).render();
        assert_ne!(a, b);
    }

    #[test]
    fn test_launch_args_are_separate_argv_entries() {
        let args = launch_args(&spec("vm3", 2, 2048));
        assert_eq!(args[0], "/usr/bin/qemu-system-x86_64");
        assert_eq!(args[1], "-qmp");
        let smp = args.iter().position(|a| a == "-smp").unwrap();
        assert_eq!(args[smp + 1], "2");
        assert_eq!(args.iter().filter(|a| *a == "-drive").count(), 2);
    }

    #[test]
    fn test_escape_exec_arg() {
        assert_eq!(escape_exec_arg("plain"), "plain");
        assert_eq!(escape_exec_arg("/var/my vms/x"), "\"/var/my vms/x\"");
        assert_eq!(escape_exec_arg("50%"), "50%%");
        assert_eq!(escape_exec_arg("$HOME"), "$$HOME");
        assert_eq!(escape_exec_arg("a\"b c"), "\"a\\\"b c\"");
    }

    fn spec_at(home: &str) -> VmSpec {
        let options = VmletOptions {
            home_dir: PathBuf::from(home),
            ..VmletOptions::default()
        };
        VmSpec::new("vm3", &options).unwrap()
    }

    #[test]
    fn test_working_directory_is_taken_verbatim() {
        let working_dir = |home: &str| {
            build_unit(&spec_at(home))
                .section(sections::EXECUTION)
                .and_then(|s| s.get("WorkingDirectory"))
                .unwrap()
                .to_string()
        };

        assert_eq!(working_dir("/srv/my vms"), "/srv/my vms/vm3");
        assert_eq!(working_dir("/srv/$data"), "/srv/$data/vm3");
        assert_eq!(working_dir("/srv/100%"), "/srv/100%%/vm3");
    }

    #[test]
    fn test_commas_in_paths_are_doubled_for_qemu() {
        let args = launch_args(&spec_at("/srv/a,b"));

        assert!(args.contains(&"unix:/srv/a,,b/vm3/vm3.socket,server=on,wait=off".to_string()));
        assert!(args.contains(&"if=virtio,format=qcow2,file=/srv/a,,b/vm3/vm3.qcow2".to_string()));
        assert!(args.contains(&"if=virtio,format=raw,file=/srv/a,,b/vm3/seed.img".to_string()));
    }
}
