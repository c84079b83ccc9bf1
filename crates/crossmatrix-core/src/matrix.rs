//! Matrix entry types.
//!
//! A matrix entry is one (platform, architecture, build options) combination.
//! Entries are validated once when the document is loaded and are immutable
//! afterwards; the scheduler derives exactly one job from each.

use crate::ids::JobId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Alpine,
    Freebsd,
    Openbsd,
    Netbsd,
    Macos,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::Linux,
        Platform::Alpine,
        Platform::Freebsd,
        Platform::Openbsd,
        Platform::Netbsd,
        Platform::Macos,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Alpine => "alpine",
            Platform::Freebsd => "freebsd",
            Platform::Openbsd => "openbsd",
            Platform::Netbsd => "netbsd",
            Platform::Macos => "macos",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "alpine" => Ok(Platform::Alpine),
            "freebsd" => Ok(Platform::Freebsd),
            "openbsd" => Ok(Platform::Openbsd),
            "netbsd" => Ok(Platform::Netbsd),
            "macos" | "darwin" => Ok(Platform::Macos),
            _ => Err(format!(
                "Unknown platform '{}'. Valid platforms: linux, alpine, freebsd, openbsd, netbsd, macos",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    #[serde(alias = "x86_64")]
    Amd64,
    #[serde(alias = "aarch64")]
    Arm64,
    #[serde(alias = "arm")]
    Armv7,
    #[serde(alias = "x86")]
    I386,
    Riscv64,
}

impl Architecture {
    pub const ALL: [Architecture; 5] = [
        Architecture::Amd64,
        Architecture::Arm64,
        Architecture::Armv7,
        Architecture::I386,
        Architecture::Riscv64,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
            Architecture::Armv7 => "armv7",
            Architecture::I386 => "i386",
            Architecture::Riscv64 => "riscv64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "amd64" | "x86_64" => Ok(Architecture::Amd64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            "armv7" | "arm" => Ok(Architecture::Armv7),
            "i386" | "x86" => Ok(Architecture::I386),
            "riscv64" => Ok(Architecture::Riscv64),
            _ => Err(format!(
                "Unknown architecture '{}'. Valid architectures: amd64, arm64, armv7, i386, riscv64",
                s
            )),
        }
    }
}

/// One combination to build and test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatrixEntry {
    pub id: JobId,
    pub platform: Platform,
    pub architecture: Architecture,
    #[serde(default)]
    pub build_options: Vec<String>,
    /// Explicit backend target; when absent the resolver table decides.
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub variant_suffix: String,
}

impl MatrixEntry {
    pub fn new(platform: Platform, architecture: Architecture) -> Self {
        Self {
            id: Self::default_id(platform, architecture, ""),
            platform,
            architecture,
            build_options: Vec::new(),
            target_id: None,
            variant_suffix: String::new(),
        }
    }

    /// `{platform}-{architecture}`, plus `-{suffix}` for non-empty suffixes.
    pub fn default_id(platform: Platform, architecture: Architecture, suffix: &str) -> JobId {
        if suffix.is_empty() {
            JobId::new(format!("{}-{}", platform, architecture))
        } else {
            JobId::new(format!("{}-{}-{}", platform, architecture, suffix))
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = JobId::new(id);
        self
    }

    pub fn with_build_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.build_options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target_id = Some(target.into());
        self
    }

    pub fn with_variant(mut self, suffix: impl Into<String>) -> Self {
        self.variant_suffix = suffix.into();
        self.id = Self::default_id(self.platform, self.architecture, &self.variant_suffix);
        self
    }

    pub fn pair(&self) -> (Platform, Architecture) {
        (self.platform, self.architecture)
    }

    /// `platform/architecture` label used in summaries.
    pub fn pair_label(&self) -> String {
        format!("{}/{}", self.platform, self.architecture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_id() {
        let entry = MatrixEntry::new(Platform::Linux, Architecture::Amd64);
        assert_eq!(entry.id.as_str(), "linux-amd64");

        let entry = entry.with_variant("static");
        assert_eq!(entry.id.as_str(), "linux-amd64-static");
    }

    #[test]
    fn test_architecture_aliases() {
        assert_eq!("x86_64".parse::<Architecture>().unwrap(), Architecture::Amd64);
        assert_eq!("AARCH64".parse::<Architecture>().unwrap(), Architecture::Arm64);
        assert!("sparc".parse::<Architecture>().is_err());
    }

    #[test]
    fn test_platform_serde_names() {
        let yaml = serde_yaml::to_string(&Platform::Freebsd).unwrap();
        assert_eq!(yaml.trim(), "freebsd");
        let parsed: Architecture = serde_yaml::from_str("aarch64").unwrap();
        assert_eq!(parsed, Architecture::Arm64);
    }
}
