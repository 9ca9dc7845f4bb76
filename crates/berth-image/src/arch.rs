//! CPU architecture classes and base-image compatibility.
//!
//! Most library images only publish amd64 builds. On other architectures a
//! scratch build swaps the deepest known library base for a community port.

use std::fmt;

use berth_common::error::{BerthError, Result};

/// Architecture classes that matter for base-image selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 64-bit x86; also used for 32-bit x86 hosts.
    Amd64,
    /// 32-bit ARM.
    Arm,
    /// 64-bit ARM.
    Arm64,
}

/// Community ports of library images for 32-bit ARM.
const ARM_BASE_IMAGES: &[(&str, &str)] = &[
    ("library/ubuntu", "ioft/armhf-ubuntu"),
    ("library/alpine", "container4armhf/armhf-alpine"),
    ("library/busybox", "container4armhf/armhf-busybox"),
    ("library/archlinux", "armv7/armhf-archlinux"),
    ("library/debian", "armbuild/debian"),
];

/// Native 64-bit ARM ports. Lookups fall back to [`ARM_BASE_IMAGES`].
const ARM64_BASE_IMAGES: &[(&str, &str)] = &[];

impl Arch {
    /// Classifies a `uname -m` style machine name.
    #[must_use]
    pub fn parse(machine: &str) -> Option<Self> {
        let machine = machine.trim().to_ascii_lowercase();
        match machine.as_str() {
            "x86_64" | "amd64" | "x86" | "i386" | "i686" => Some(Self::Amd64),
            "aarch64" | "arm64" => Some(Self::Arm64),
            "arm" | "armhf" | "armel" => Some(Self::Arm),
            m if m.starts_with("armv") => Some(Self::Arm),
            _ => None,
        }
    }

    /// Classifies a machine name, treating unknown machines as amd64.
    #[must_use]
    pub fn from_machine(machine: &str) -> Self {
        Self::parse(machine).unwrap_or_else(|| {
            tracing::warn!(machine, "unknown host architecture, assuming amd64");
            Self::Amd64
        })
    }

    /// Classifies the host from its `uname` machine name.
    ///
    /// Falls back to amd64 when the machine is unknown or `uname` fails.
    #[must_use]
    pub fn detect() -> Self {
        match nix::sys::utsname::uname() {
            Ok(info) => Self::from_machine(&info.machine().to_string_lossy()),
            Err(e) => {
                tracing::warn!(error = %e, "uname failed, assuming amd64");
                Self::Amd64
            }
        }
    }

    /// Parses a user-requested architecture name.
    ///
    /// # Errors
    ///
    /// Returns a config error if `name` has no known class.
    pub fn from_name(name: &str) -> Result<Self> {
        Self::parse(name).ok_or_else(|| BerthError::config(format!("unknown architecture: {name}")))
    }

    /// Returns the canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
        }
    }

    const fn base_images(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Amd64 => &[],
            Self::Arm => ARM_BASE_IMAGES,
            Self::Arm64 => ARM64_BASE_IMAGES,
        }
    }

    const fn fallbacks(self) -> &'static [Self] {
        match self {
            Self::Arm64 => &[Self::Arm],
            Self::Amd64 | Self::Arm => &[],
        }
    }

    /// Returns a base image usable on this architecture in place of `name`.
    ///
    /// `name` is a normalized repository name without tag, such as
    /// `library/alpine`. Amd64 accepts every image unchanged.
    #[must_use]
    pub fn compatible_base_image(self, name: &str) -> Option<String> {
        if self == Self::Amd64 {
            return Some(name.to_string());
        }
        std::iter::once(self)
            .chain(self.fallbacks().iter().copied())
            .find_map(|arch| {
                arch.base_images()
                    .iter()
                    .find(|(from, _)| *from == name)
                    .map(|(_, to)| (*to).to_string())
            })
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
