//! Target platform detection for release artifacts

use std::fmt;

/// A supported (OS, architecture) pair, named the way release assets are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlatformTarget {
    os_tag: &'static str,
    arch_tag: &'static str,
    exe_suffix: &'static str,
}

impl PlatformTarget {
    /// Identifies the platform this process runs on.
    /// Returns None for anything outside the published release matrix.
    pub fn identify() -> Option<Self> {
        Self::from_parts(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Maps `std::env::consts::{OS, ARCH}` style values to a target
    pub fn from_parts(os: &str, arch: &str) -> Option<Self> {
        let (os_tag, exe_suffix) = match os {
            "macos" => ("apple-darwin", ""),
            "linux" => ("unknown-linux-gnu", ""),
            "windows" => ("pc-windows-msvc", ".exe"),
            _ => return None,
        };

        let arch_tag = match arch {
            "aarch64" => "aarch64",
            "x86_64" => "x86_64",
            _ => return None,
        };

        Some(Self {
            os_tag,
            arch_tag,
            exe_suffix,
        })
    }

    pub fn os_tag(&self) -> &'static str {
        self.os_tag
    }

    pub fn arch_tag(&self) -> &'static str {
        self.arch_tag
    }

    /// ".exe" on Windows, empty elsewhere
    pub fn exe_suffix(&self) -> &'static str {
        self.exe_suffix
    }

    /// Rust target triple, e.g. "x86_64-unknown-linux-gnu"
    pub fn triple(&self) -> String {
        format!("{}-{}", self.arch_tag, self.os_tag)
    }
}

impl fmt::Display for PlatformTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.arch_tag, self.os_tag)
    }
}
