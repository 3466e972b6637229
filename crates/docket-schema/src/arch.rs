//! Architecture targets.
//!
//! The set of supported targets is closed. Every naming scheme an artifact
//! source may use is an exhaustive `match` over [`ArchTarget`], so adding a
//! target without teaching every scheme about it fails to compile.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArchError {
    #[error("unsupported architecture target '{0}' (supported: amd64, arm64, arm/v7)")]
    Unsupported(String),
}

/// A (CPU architecture, ABI variant) pair the image can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchTarget {
    Amd64,
    Arm64,
    ArmV7,
}

/// Naming convention used by an artifact source for the architecture part of its URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchStyle {
    /// `amd64`, `arm64`, `armhf`
    #[default]
    Debian,
    /// `x86_64`, `aarch64`, `armhf`
    Gnu,
    /// `amd64`, `arm64`, `arm-v7`
    Docker,
}

impl ArchTarget {
    pub const ALL: [ArchTarget; 3] = [ArchTarget::Amd64, ArchTarget::Arm64, ArchTarget::ArmV7];

    /// Parse the pair Docker exposes as `TARGETARCH` / `TARGETVARIANT`.
    pub fn parse(arch: &str, variant: &str) -> Result<Self, ArchError> {
        let arch_n = arch.trim().to_lowercase();
        let variant_n = variant.trim().to_lowercase();
        match (arch_n.as_str(), variant_n.as_str()) {
            ("amd64" | "x86_64", "") => Ok(Self::Amd64),
            ("arm64" | "aarch64", "" | "v8") => Ok(Self::Arm64),
            ("arm" | "armhf", "v7") | ("armv7" | "armv7l", "") => Ok(Self::ArmV7),
            _ if variant_n.is_empty() => Err(ArchError::Unsupported(arch.to_owned())),
            _ => Err(ArchError::Unsupported(format!("{arch}/{variant}"))),
        }
    }

    /// Parse a platform string such as `linux/arm/v7` or `arm64`.
    pub fn parse_platform(platform: &str) -> Result<Self, ArchError> {
        let trimmed = platform.trim();
        let without_os = trimmed.strip_prefix("linux/").unwrap_or(trimmed);
        match without_os.split_once('/') {
            Some((arch, variant)) => Self::parse(arch, variant),
            None => Self::parse(without_os, ""),
        }
    }

    /// Target matching the machine this binary was compiled for.
    pub fn host() -> Result<Self, ArchError> {
        Self::parse(std::env::consts::ARCH, "")
    }

    pub fn debian_name(self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
            Self::ArmV7 => "armhf",
        }
    }

    pub fn gnu_name(self) -> &'static str {
        match self {
            Self::Amd64 => "x86_64",
            Self::Arm64 => "aarch64",
            Self::ArmV7 => "armhf",
        }
    }

    pub fn docker_name(self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
            Self::ArmV7 => "arm-v7",
        }
    }

    pub fn platform(self) -> &'static str {
        match self {
            Self::Amd64 => "linux/amd64",
            Self::Arm64 => "linux/arm64",
            Self::ArmV7 => "linux/arm/v7",
        }
    }

    pub fn render(self, style: ArchStyle) -> &'static str {
        match style {
            ArchStyle::Debian => self.debian_name(),
            ArchStyle::Gnu => self.gnu_name(),
            ArchStyle::Docker => self.docker_name(),
        }
    }
}

impl fmt::Display for ArchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.platform())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_target_pairs() {
        assert_eq!(ArchTarget::parse("amd64", "").unwrap(), ArchTarget::Amd64);
        assert_eq!(ArchTarget::parse("arm64", "").unwrap(), ArchTarget::Arm64);
        assert_eq!(ArchTarget::parse("arm", "v7").unwrap(), ArchTarget::ArmV7);
    }

    #[test]
    fn parses_platform_strings() {
        assert_eq!(
            ArchTarget::parse_platform("linux/arm/v7").unwrap(),
            ArchTarget::ArmV7
        );
        assert_eq!(
            ArchTarget::parse_platform("linux/amd64").unwrap(),
            ArchTarget::Amd64
        );
        assert_eq!(ArchTarget::parse_platform("arm64").unwrap(), ArchTarget::Arm64);
    }

    #[test]
    fn unsupported_targets_are_rejected() {
        for (arch, variant) in [
            ("arm", "v6"),
            ("arm", ""),
            ("riscv64", ""),
            ("386", ""),
            ("s390x", ""),
            ("", ""),
        ] {
            let err = ArchTarget::parse(arch, variant).unwrap_err();
            assert!(matches!(err, ArchError::Unsupported(_)), "{arch}/{variant}");
        }
    }

    #[test]
    fn unsupported_error_names_the_pair() {
        let err = ArchTarget::parse("arm", "v6").unwrap_err();
        assert!(err.to_string().contains("arm/v6"));
    }

    #[test]
    fn every_target_has_distinct_names_per_style() {
        for style in [ArchStyle::Debian, ArchStyle::Gnu, ArchStyle::Docker] {
            let mut names: Vec<&str> = ArchTarget::ALL.iter().map(|t| t.render(style)).collect();
            names.sort_unstable();
            names.dedup();
            assert_eq!(names.len(), ArchTarget::ALL.len(), "{style:?}");
        }
    }

    #[test]
    fn platform_roundtrips_through_parse() {
        for target in ArchTarget::ALL {
            assert_eq!(ArchTarget::parse_platform(target.platform()).unwrap(), target);
        }
    }

    #[test]
    fn serde_uses_lowercase_keys() {
        let json = serde_json::to_string(&ArchTarget::ArmV7).unwrap();
        assert_eq!(json, "\"armv7\"");
    }
}
