//! systemd unit descriptors for VMs.
//!
//! A descriptor is an ordered list of sections, each an ordered list of
//! `key=value` directives. Rendering is deterministic: equal [`VmSpec`](crate::vmm::VmSpec)s
//! render to byte-identical text, which is what makes redeployment of an
//! unchanged VM a no-op.

mod builder;

pub use builder::{build_unit, launch_args, sections};

use std::fmt;

/// One `[Section]` of a unit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSection {
    name: String,
    directives: Vec<(String, String)>,
}

impl UnitSection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directives: Vec::new(),
        }
    }

    pub fn directive(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.directives.push((key.into(), value.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directives(&self) -> &[(String, String)] {
        &self.directives
    }

    /// First value for `key` in this section.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.directives
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Ordered unit file contents.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnitDescriptor {
    sections: Vec<UnitSection>,
}

impl UnitDescriptor {
    pub fn new(sections: Vec<UnitSection>) -> Self {
        Self { sections }
    }

    pub fn sections(&self) -> &[UnitSection] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&UnitSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Unit file text: sections separated by a blank line, one trailing newline.
    pub fn render(&self) -> String {
        self.to_string()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.render().into_bytes()
    }
}

impl fmt::Display for UnitDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "[{}]", section.name)?;
            for (key, value) in &section.directives {
                writeln!(f, "{}={}", key, value)?;
            }
        }
        Ok(())
    }
}
