//! Matrix expansion: document to ordered, uniquely identified entries.

use crossmatrix_core::config::MatrixDocument;
use crossmatrix_core::matrix::{Architecture, MatrixEntry, Platform};
use crossmatrix_core::{ConfigError, JobId, Result};
use std::collections::HashSet;
use tracing::debug;

/// Platform and architecture lists from the command line. Empty means all.
#[derive(Debug, Clone, Default)]
pub struct MatrixFilter {
    pub platforms: Vec<Platform>,
    pub architectures: Vec<Architecture>,
}

impl MatrixFilter {
    pub fn accepts(&self, platform: Platform, architecture: Architecture) -> bool {
        (self.platforms.is_empty() || self.platforms.contains(&platform))
            && (self.architectures.is_empty() || self.architectures.contains(&architecture))
    }
}

/// Expander for matrix documents.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Enabled platforms x architectures x variants, plus includes, minus
    /// excludes, then narrowed by the filter. Order follows the document.
    pub fn expand(&self, doc: &MatrixDocument, filter: &MatrixFilter) -> Result<Vec<MatrixEntry>> {
        let mut entries = Vec::new();

        for platform in doc.platforms.iter().filter(|p| p.enabled) {
            for &arch in &platform.architectures {
                let target = platform.target_map.get(&arch);

                let mut base = MatrixEntry::new(platform.name, arch)
                    .with_build_options(platform.build_options.iter().cloned());
                if let Some(target) = target {
                    base = base.with_target(target.clone());
                }

                let variants: Vec<MatrixEntry> = platform
                    .variants
                    .iter()
                    .map(|variant| {
                        let options = platform
                            .build_options
                            .iter()
                            .chain(variant.build_options.iter())
                            .cloned();
                        base.clone()
                            .with_variant(variant.suffix.trim())
                            .with_build_options(options)
                    })
                    .collect();

                entries.push(base);
                entries.extend(variants);
            }
        }

        let mut seen: HashSet<JobId> = entries.iter().map(|e| e.id.clone()).collect();

        // Apply includes
        for (i, include) in doc.include.iter().enumerate() {
            let mut entry = MatrixEntry::new(include.platform, include.architecture)
                .with_build_options(include.build_options.iter().cloned());
            if let Some(variant) = &include.variant {
                entry = entry.with_variant(variant.clone());
            }
            if let Some(id) = &include.id {
                entry = entry.with_id(id.clone());
            }
            if let Some(target) = &include.target {
                entry = entry.with_target(target.clone());
            }

            if !JobId::is_valid(entry.id.as_str()) {
                return Err(ConfigError::Invalid {
                    path: doc.source.clone(),
                    field: format!("include[{i}]"),
                    message: format!("job id '{}' is not a safe directory name", entry.id),
                }
                .into());
            }
            if !seen.insert(entry.id.clone()) {
                return Err(ConfigError::Invalid {
                    path: doc.source.clone(),
                    field: format!("include[{i}]"),
                    message: format!("duplicate job id '{}'", entry.id),
                }
                .into());
            }
            entries.push(entry);
        }

        // Apply excludes
        entries.retain(|entry| {
            !doc.exclude.iter().any(|pattern| {
                pattern.matches(entry.platform, entry.architecture, &entry.variant_suffix)
            })
        });

        entries.retain(|entry| filter.accepts(entry.platform, entry.architecture));

        debug!(count = entries.len(), "Expanded matrix");
        Ok(entries)
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossmatrix_core::config::parse_document;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn doc(yaml: &str) -> MatrixDocument {
        parse_document(yaml, Path::new("crossmatrix.yaml")).unwrap()
    }

    fn ids(entries: &[MatrixEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.id.as_str()).collect()
    }

    const BASE: &str = r#"
platforms:
  - name: linux
    base_image: ubuntu:22.04
    dockerfile: Dockerfile.linux
    architectures: [amd64, arm64]
    build_options: ["-Drelease"]
    variants:
      - suffix: static
        build_options: ["-Dstatic=true"]
  - name: alpine
    base_image: alpine:3.19
    dockerfile: Dockerfile.alpine
    architectures: [amd64]
    target_map:
      amd64: x86_64-linux-musl.1.2
  - name: freebsd
    enabled: false
    base_image: ubuntu:22.04
    dockerfile: Dockerfile.freebsd
    architectures: [amd64]
"#;

    #[test]
    fn test_expansion_order_and_variants() {
        let entries = MatrixExpander::new()
            .expand(&doc(BASE), &MatrixFilter::default())
            .unwrap();

        assert_eq!(
            ids(&entries),
            vec![
                "linux-amd64",
                "linux-amd64-static",
                "linux-arm64",
                "linux-arm64-static",
                "alpine-amd64",
            ]
        );
        assert_eq!(entries[1].build_options, vec!["-Drelease", "-Dstatic=true"]);
        assert_eq!(entries[4].target_id.as_deref(), Some("x86_64-linux-musl.1.2"));
    }

    #[test]
    fn test_include_and_exclude() {
        let yaml = format!(
            "{BASE}include:\n  - platform: freebsd\n    architecture: arm64\nexclude:\n  - platform: linux\n    variant: static\n"
        );
        let entries = MatrixExpander::new()
            .expand(&doc(&yaml), &MatrixFilter::default())
            .unwrap();

        assert_eq!(
            ids(&entries),
            vec!["linux-amd64", "linux-arm64", "alpine-amd64", "freebsd-arm64"]
        );
    }

    #[test]
    fn test_duplicate_include_rejected() {
        let yaml = format!("{BASE}include:\n  - platform: linux\n    architecture: amd64\n");
        let err = MatrixExpander::new()
            .expand(&doc(&yaml), &MatrixFilter::default())
            .unwrap_err();
        assert!(err.to_string().contains("duplicate job id 'linux-amd64'"));
    }

    #[test]
    fn test_include_with_traversal_id_rejected() {
        let yaml = format!(
            "{BASE}include:\n  - id: ../../etc\n    platform: freebsd\n    architecture: arm64\n"
        );
        let err = MatrixExpander::new()
            .expand(&doc(&yaml), &MatrixFilter::default())
            .unwrap_err();
        assert!(err.to_string().contains("include[0]"));
        assert!(err.to_string().contains("not a safe directory name"));
    }

    #[test]
    fn test_filter_narrows_entries() {
        let filter = MatrixFilter {
            platforms: vec![Platform::Linux],
            architectures: vec![Architecture::Arm64],
        };
        let entries = MatrixExpander::new().expand(&doc(BASE), &filter).unwrap();
        assert_eq!(ids(&entries), vec!["linux-arm64", "linux-arm64-static"]);
    }
}
