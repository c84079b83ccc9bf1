//! Platform/architecture to backend target resolution.
//!
//! Target identifiers and build flags are opaque strings: they are looked up
//! here and handed to the backend untouched.

use crate::error::{Error, Result};
use crate::matrix::{Architecture, MatrixEntry, Platform};
use serde::Serialize;
use tracing::warn;

/// Everything the runner needs to build one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildParameters {
    pub platform: Platform,
    pub architecture: Architecture,
    pub target_id: String,
    /// Docker platform string, e.g. `linux/arm/v7`.
    pub docker_platform: String,
    pub build_options: Vec<String>,
    /// Set when an unsupported pair was mapped onto the baseline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_from: Option<(Platform, Architecture)>,
}

struct TargetRow {
    platform: Platform,
    architecture: Architecture,
    target_id: &'static str,
    docker_platform: &'static str,
    default_flags: &'static [&'static str],
}

const fn row(
    platform: Platform,
    architecture: Architecture,
    target_id: &'static str,
    docker_platform: &'static str,
    default_flags: &'static [&'static str],
) -> TargetRow {
    TargetRow {
        platform,
        architecture,
        target_id,
        docker_platform,
        default_flags,
    }
}

use Architecture::*;
use Platform::*;

const STATIC: &[&str] = &["-Dstatic=true"];

static TARGETS: &[TargetRow] = &[
    row(Linux, Amd64, "x86_64-linux-gnu", "linux/amd64", &[]),
    row(Linux, Arm64, "aarch64-linux-gnu", "linux/arm64", &[]),
    row(Linux, Armv7, "arm-linux-gnueabihf", "linux/arm/v7", &[]),
    row(Linux, I386, "x86-linux-gnu", "linux/386", &[]),
    row(Linux, Riscv64, "riscv64-linux-gnu", "linux/riscv64", &[]),
    row(Alpine, Amd64, "x86_64-linux-musl", "linux/amd64", STATIC),
    row(Alpine, Arm64, "aarch64-linux-musl", "linux/arm64", STATIC),
    row(Alpine, Armv7, "arm-linux-musleabihf", "linux/arm/v7", STATIC),
    row(Alpine, I386, "x86-linux-musl", "linux/386", STATIC),
    row(Alpine, Riscv64, "riscv64-linux-musl", "linux/riscv64", STATIC),
    // BSD targets cross-compile inside a Linux amd64 container.
    row(Freebsd, Amd64, "x86_64-freebsd", "linux/amd64", &[]),
    row(Openbsd, Amd64, "x86_64-openbsd", "linux/amd64", &[]),
    row(Netbsd, Amd64, "x86_64-netbsd", "linux/amd64", &[]),
];

const BASELINE: (Platform, Architecture) = (Linux, Amd64);

/// Pure lookup from (platform, architecture) to build parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetResolver {
    baseline_fallback: bool,
}

impl TargetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map unsupported pairs onto linux/amd64 instead of rejecting them.
    pub fn with_baseline_fallback(mut self, enabled: bool) -> Self {
        self.baseline_fallback = enabled;
        self
    }

    pub fn is_supported(platform: Platform, architecture: Architecture) -> bool {
        lookup(platform, architecture).is_some()
    }

    /// All supported pairs in table order.
    pub fn supported_pairs() -> impl Iterator<Item = (Platform, Architecture, &'static str)> {
        TARGETS
            .iter()
            .map(|r| (r.platform, r.architecture, r.target_id))
    }

    pub fn resolve(&self, platform: Platform, architecture: Architecture) -> Result<BuildParameters> {
        if let Some(row) = lookup(platform, architecture) {
            return Ok(params(row, None));
        }

        if self.baseline_fallback
            && let Some(row) = lookup(BASELINE.0, BASELINE.1)
        {
            warn!(
                platform = %platform,
                architecture = %architecture,
                target = row.target_id,
                "Unsupported combination, falling back to baseline target"
            );
            let mut resolved = params(row, Some((platform, architecture)));
            resolved.platform = platform;
            resolved.architecture = architecture;
            return Ok(resolved);
        }

        Err(Error::UnsupportedCombination {
            platform: platform.to_string(),
            architecture: architecture.to_string(),
        })
    }

    /// Resolve an entry, applying its target override and appending its
    /// build options after the table defaults.
    pub fn resolve_entry(&self, entry: &MatrixEntry) -> Result<BuildParameters> {
        let mut resolved = self.resolve(entry.platform, entry.architecture)?;
        if let Some(target) = &entry.target_id
            && resolved.fallback_from.is_none()
        {
            resolved.target_id = target.clone();
        }
        resolved
            .build_options
            .extend(entry.build_options.iter().cloned());
        Ok(resolved)
    }
}

fn lookup(platform: Platform, architecture: Architecture) -> Option<&'static TargetRow> {
    TARGETS
        .iter()
        .find(|r| r.platform == platform && r.architecture == architecture)
}

fn params(row: &TargetRow, fallback_from: Option<(Platform, Architecture)>) -> BuildParameters {
    BuildParameters {
        platform: row.platform,
        architecture: row.architecture,
        target_id: row.target_id.to_string(),
        docker_platform: row.docker_platform.to_string(),
        build_options: row.default_flags.iter().map(|s| s.to_string()).collect(),
        fallback_from,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_table() {
        let cases = [
            (Linux, Amd64, "x86_64-linux-gnu", "linux/amd64"),
            (Linux, Armv7, "arm-linux-gnueabihf", "linux/arm/v7"),
            (Alpine, Arm64, "aarch64-linux-musl", "linux/arm64"),
            (Alpine, I386, "x86-linux-musl", "linux/386"),
            (Freebsd, Amd64, "x86_64-freebsd", "linux/amd64"),
            (Netbsd, Amd64, "x86_64-netbsd", "linux/amd64"),
        ];

        let resolver = TargetResolver::new();
        for (platform, arch, target, docker) in cases {
            let params = resolver.resolve(platform, arch).unwrap();
            assert_eq!(params.target_id, target, "{platform}/{arch}");
            assert_eq!(params.docker_platform, docker, "{platform}/{arch}");
            assert!(params.fallback_from.is_none());
        }
    }

    #[test]
    fn test_unsupported_pairs_rejected() {
        let resolver = TargetResolver::new();
        for (platform, arch) in [(Freebsd, Arm64), (Openbsd, Riscv64), (Macos, Amd64), (Macos, Arm64)] {
            let err = resolver.resolve(platform, arch).unwrap_err();
            assert!(
                matches!(err, Error::UnsupportedCombination { .. }),
                "{platform}/{arch}"
            );
        }
    }

    #[test]
    fn test_baseline_fallback_is_opt_in() {
        let resolver = TargetResolver::new().with_baseline_fallback(true);
        let params = resolver.resolve(Freebsd, Arm64).unwrap();
        assert_eq!(params.target_id, "x86_64-linux-gnu");
        assert_eq!(params.platform, Freebsd);
        assert_eq!(params.fallback_from, Some((Freebsd, Arm64)));
    }

    #[test]
    fn test_resolve_entry_override_and_options() {
        let entry = MatrixEntry::new(Alpine, Amd64)
            .with_target("x86_64-linux-musl.2.0")
            .with_build_options(["-Dtls=false"]);
        let params = TargetResolver::new().resolve_entry(&entry).unwrap();

        assert_eq!(params.target_id, "x86_64-linux-musl.2.0");
        assert_eq!(params.build_options, vec!["-Dstatic=true", "-Dtls=false"]);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let resolver = TargetResolver::new();
        let a = resolver.resolve(Linux, Riscv64).unwrap();
        let b = resolver.resolve(Linux, Riscv64).unwrap();
        assert_eq!(a, b);
    }
}
