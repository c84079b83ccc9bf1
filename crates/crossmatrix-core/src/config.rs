//! Matrix document: the YAML file describing what to build and test.

use crate::error::ConfigError;
use crate::ids::JobId;
use crate::matrix::{Architecture, Platform};
use crate::policy::{MAX_TIMEOUT_SECS, PolicySettings};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DOCUMENT: &str = "crossmatrix.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MatrixDocument {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub build: BuildConfig,
    pub platforms: Vec<PlatformConfig>,
    #[serde(default)]
    pub include: Vec<IncludeEntry>,
    #[serde(default)]
    pub exclude: Vec<ExcludePattern>,
    #[serde(default)]
    pub test_suites: BTreeMap<String, TestSuiteConfig>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub artifacts: ArtifactConfig,
    #[serde(default)]
    pub policy: DocumentPolicy,
    /// Docker network shared by all job containers.
    #[serde(default)]
    pub network: Option<String>,
    /// File the document was loaded from.
    #[serde(skip)]
    pub source: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BuildConfig {
    /// Build context, relative to the document's directory.
    #[serde(default = "default_context")]
    pub context: PathBuf,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            context: default_context(),
            args: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlatformConfig {
    pub name: Platform,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub base_image: String,
    #[serde(default)]
    pub dockerfile: String,
    #[serde(default)]
    pub architectures: Vec<Architecture>,
    /// Per-architecture target overrides.
    #[serde(default)]
    pub target_map: BTreeMap<Architecture, String>,
    #[serde(default)]
    pub build_options: Vec<String>,
    #[serde(default)]
    pub variants: Vec<VariantConfig>,
}

fn default_true() -> bool {
    true
}

/// Extra build options producing one more entry per architecture.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VariantConfig {
    pub suffix: String,
    #[serde(default)]
    pub build_options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IncludeEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub platform: Platform,
    pub architecture: Architecture,
    #[serde(default)]
    pub build_options: Vec<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
}

/// Removes expanded entries. Absent fields match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ExcludePattern {
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub architecture: Option<Architecture>,
    #[serde(default)]
    pub variant: Option<String>,
}

impl ExcludePattern {
    pub fn matches(&self, platform: Platform, architecture: Architecture, variant: &str) -> bool {
        self.platform.is_none_or(|p| p == platform)
            && self.architecture.is_none_or(|a| a == architecture)
            && self.variant.as_deref().is_none_or(|v| v == variant)
    }

    fn is_empty(&self) -> bool {
        self.platform.is_none() && self.architecture.is_none() && self.variant.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TestSuiteConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds allowed for each command in the suite.
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub tests: Vec<TestCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TestCommand {
    pub name: String,
    pub command: String,
    /// Failure is recorded as informational instead of failing the job.
    #[serde(default)]
    pub optional: bool,
}

/// Timeouts in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TimeoutConfig {
    #[serde(default)]
    pub global: Option<u64>,
    #[serde(default)]
    pub build: Option<u64>,
    #[serde(default)]
    pub run: Option<u64>,
    #[serde(default)]
    pub test: Option<u64>,
    #[serde(default)]
    pub cleanup: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactConfig {
    /// Paths inside the container copied out after the tests.
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Policy defaults from the document. CLI flags take precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DocumentPolicy {
    #[serde(default)]
    pub continue_on_error: Option<bool>,
    #[serde(default)]
    pub parallel: Option<bool>,
    #[serde(default)]
    pub per_job_timeout: Option<u64>,
    #[serde(default)]
    pub keep_resources_on_failure: Option<bool>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub teardown_attempts: Option<u32>,
    #[serde(default)]
    pub grace_period: Option<u64>,
}

const INVALID_NAME: &str =
    "may only contain letters, digits, '.', '_' and '-', and must start and end with a letter or digit";
const TIMEOUT_TOO_LARGE: &str = "timeout exceeds one week (604800 seconds)";

/// One semantic problem in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn into_error(self, path: &Path) -> ConfigError {
        ConfigError::Invalid {
            path: path.to_path_buf(),
            field: self.field,
            message: self.message,
        }
    }
}

/// Load and validate a matrix document.
pub fn load_document(path: impl AsRef<Path>) -> Result<MatrixDocument, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let document = parse_document(&content, path)?;
    if let Some(issue) = document.validate().into_iter().next() {
        return Err(issue.into_error(path));
    }
    Ok(document)
}

/// Parse without semantic validation.
pub fn parse_document(content: &str, path: &Path) -> Result<MatrixDocument, ConfigError> {
    let mut document: MatrixDocument =
        serde_yaml::from_str(content).map_err(|e| ConfigError::from_yaml(path, e))?;
    document.source = path.to_path_buf();
    Ok(document)
}

impl MatrixDocument {
    /// Every semantic problem in the document, in document order.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.platforms.is_empty() {
            issues.push(ValidationIssue::new("platforms", "no platforms defined"));
        }

        let mut seen = HashSet::new();
        for (i, platform) in self.platforms.iter().enumerate() {
            let field = |name: &str| format!("platforms[{i}].{name}");

            if !seen.insert(platform.name) {
                issues.push(ValidationIssue::new(
                    field("name"),
                    format!("platform {} defined more than once", platform.name),
                ));
            }
            if platform.base_image.trim().is_empty() {
                issues.push(ValidationIssue::new(field("base_image"), "missing base_image"));
            }
            if platform.dockerfile.trim().is_empty() {
                issues.push(ValidationIssue::new(field("dockerfile"), "missing dockerfile"));
            }
            if platform.architectures.is_empty() {
                issues.push(ValidationIssue::new(
                    field("architectures"),
                    "no architectures listed",
                ));
            }
            for arch in platform.target_map.keys() {
                if !platform.architectures.contains(arch) {
                    issues.push(ValidationIssue::new(
                        format!("platforms[{i}].target_map.{arch}"),
                        format!("architecture {arch} is not listed for {}", platform.name),
                    ));
                }
            }

            let mut suffixes = HashSet::new();
            for (j, variant) in platform.variants.iter().enumerate() {
                let suffix = variant.suffix.trim();
                if suffix.is_empty() {
                    issues.push(ValidationIssue::new(
                        format!("platforms[{i}].variants[{j}].suffix"),
                        "variant suffix must not be empty",
                    ));
                } else if !JobId::is_valid(suffix) {
                    issues.push(ValidationIssue::new(
                        format!("platforms[{i}].variants[{j}].suffix"),
                        format!("'{suffix}' {INVALID_NAME}"),
                    ));
                } else if !suffixes.insert(suffix) {
                    issues.push(ValidationIssue::new(
                        format!("platforms[{i}].variants[{j}].suffix"),
                        format!("duplicate variant suffix '{suffix}'"),
                    ));
                }
            }
        }

        for (i, include) in self.include.iter().enumerate() {
            if let Some(id) = &include.id
                && !JobId::is_valid(id)
            {
                issues.push(ValidationIssue::new(
                    format!("include[{i}].id"),
                    format!("'{id}' {INVALID_NAME}"),
                ));
            }
            if let Some(variant) = &include.variant
                && !JobId::is_valid(variant)
            {
                issues.push(ValidationIssue::new(
                    format!("include[{i}].variant"),
                    format!("'{variant}' {INVALID_NAME}"),
                ));
            }
        }

        for (i, pattern) in self.exclude.iter().enumerate() {
            if pattern.is_empty() {
                issues.push(ValidationIssue::new(
                    format!("exclude[{i}]"),
                    "pattern matches every entry",
                ));
            }
        }

        for (name, suite) in &self.test_suites {
            if suite.timeout == 0 {
                issues.push(ValidationIssue::new(
                    format!("test_suites.{name}.timeout"),
                    "missing or zero timeout",
                ));
            } else if suite.timeout > MAX_TIMEOUT_SECS {
                issues.push(ValidationIssue::new(
                    format!("test_suites.{name}.timeout"),
                    TIMEOUT_TOO_LARGE,
                ));
            }
            if suite.tests.is_empty() {
                issues.push(ValidationIssue::new(
                    format!("test_suites.{name}.tests"),
                    "suite has no tests",
                ));
            }
            for (k, test) in suite.tests.iter().enumerate() {
                if test.command.trim().is_empty() {
                    issues.push(ValidationIssue::new(
                        format!("test_suites.{name}.tests[{k}].command"),
                        "empty command",
                    ));
                }
            }
        }

        let timeouts = [
            ("timeouts.global", self.timeouts.global),
            ("timeouts.build", self.timeouts.build),
            ("timeouts.run", self.timeouts.run),
            ("timeouts.test", self.timeouts.test),
            ("timeouts.cleanup", self.timeouts.cleanup),
            ("policy.per_job_timeout", self.policy.per_job_timeout),
        ];
        for (field, value) in timeouts {
            match value {
                Some(0) => issues.push(ValidationIssue::new(field, "timeout must be positive")),
                Some(v) if v > MAX_TIMEOUT_SECS => {
                    issues.push(ValidationIssue::new(field, TIMEOUT_TOO_LARGE))
                }
                _ => {}
            }
        }
        if self.policy.grace_period.is_some_and(|v| v > MAX_TIMEOUT_SECS) {
            issues.push(ValidationIssue::new("policy.grace_period", TIMEOUT_TOO_LARGE));
        }
        if self.policy.max_parallel == Some(0) {
            issues.push(ValidationIssue::new(
                "policy.max_parallel",
                "must be at least 1",
            ));
        }

        issues
    }

    pub fn platform(&self, platform: Platform) -> Option<&PlatformConfig> {
        self.platforms.iter().find(|p| p.name == platform)
    }

    /// Enabled suites in name order.
    pub fn enabled_suites(&self) -> impl Iterator<Item = (&String, &TestSuiteConfig)> {
        self.test_suites.iter().filter(|(_, s)| s.enabled)
    }

    /// Build context resolved against the document's directory.
    pub fn context_dir(&self) -> PathBuf {
        if self.build.context.is_absolute() {
            return self.build.context.clone();
        }
        let base = self.source.parent().unwrap_or_else(|| Path::new("."));
        base.join(&self.build.context)
    }

    /// Policy from document values over built-in defaults.
    pub fn policy_settings(&self) -> PolicySettings {
        let mut policy = PolicySettings::default();
        let doc = &self.policy;

        if let Some(v) = doc.continue_on_error {
            policy.continue_on_error = v;
        }
        if let Some(v) = doc.parallel {
            policy.parallel = v;
        }
        if let Some(v) = doc.per_job_timeout {
            policy.per_job_timeout = Duration::from_secs(v);
        }
        if let Some(v) = doc.keep_resources_on_failure {
            policy.keep_resources_on_failure = v;
        }
        if doc.max_parallel.is_some() {
            policy.max_parallel = doc.max_parallel;
        }
        if let Some(v) = doc.teardown_attempts {
            policy.teardown_attempts = v.max(1);
        }
        if let Some(v) = doc.grace_period {
            policy.grace_period = Duration::from_secs(v);
        }

        if let Some(v) = self.timeouts.build {
            policy.timeouts.build = Duration::from_secs(v);
        }
        if let Some(v) = self.timeouts.run {
            policy.timeouts.run = Duration::from_secs(v);
        }
        if let Some(v) = self.timeouts.test {
            policy.timeouts.exec = Duration::from_secs(v);
        }
        if let Some(v) = self.timeouts.cleanup {
            policy.timeouts.teardown = Duration::from_secs(v);
        }
        policy.timeouts.global = self.timeouts.global.map(Duration::from_secs);

        policy
    }
}

/// Written by `crossmatrix init`.
pub const STARTER_DOCUMENT: &str = r#"# crossmatrix matrix document
name: my-project

build:
  context: .

platforms:
  - name: linux
    base_image: ubuntu:22.04
    dockerfile: docker/Dockerfile.linux
    architectures: [amd64, arm64]

  - name: alpine
    base_image: alpine:3.19
    dockerfile: docker/Dockerfile.alpine
    architectures: [amd64, arm64]
    variants:
      - suffix: small
        build_options: ["-Doptimize=ReleaseSmall"]

  - name: freebsd
    enabled: false
    base_image: ubuntu:22.04
    dockerfile: docker/Dockerfile.freebsd
    architectures: [amd64]

exclude:
  - platform: alpine
    architecture: arm64
    variant: small

test_suites:
  basic:
    timeout: 300
    tests:
      - name: version
        command: ./app --version
      - name: help
        command: ./app --help
      - name: capability-probe
        command: ./app --probe
        optional: true

timeouts:
  global: 3600
  build: 600
  test: 300
  cleanup: 60

artifacts:
  paths:
    - /build/out

policy:
  continue_on_error: true
  parallel: false
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(yaml: &str) -> MatrixDocument {
        parse_document(yaml, Path::new("crossmatrix.yaml")).unwrap()
    }

    #[test]
    fn test_starter_document_is_valid() {
        let doc = parse(STARTER_DOCUMENT);
        assert_eq!(doc.validate(), vec![]);
        assert_eq!(doc.platforms.len(), 3);
        assert!(!doc.platforms[2].enabled);
        assert!(doc.test_suites["basic"].tests[2].optional);
    }

    #[test]
    fn test_malformed_yaml_has_location() {
        let yaml = "platforms:\n  - name: linux\n    architectures: [amd64\n";
        let err = parse_document(yaml, Path::new("m.yaml")).unwrap_err();
        match err {
            ConfigError::Parse { line, .. } => assert!(line > 0),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_platform_is_parse_error() {
        let yaml = "platforms:\n  - name: plan9\n";
        let err = parse_document(yaml, Path::new("m.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validation_field_paths() {
        let yaml = r#"
platforms:
  - name: linux
    base_image: ubuntu:22.04
    dockerfile: Dockerfile
    architectures: [amd64]
  - name: alpine
    base_image: alpine:3.19
    architectures: []
test_suites:
  smoke:
    tests: []
timeouts:
  build: 0
"#;
        let fields: Vec<String> = parse(yaml).validate().into_iter().map(|i| i.field).collect();
        assert_eq!(
            fields,
            vec![
                "platforms[1].dockerfile",
                "platforms[1].architectures",
                "test_suites.smoke.timeout",
                "test_suites.smoke.tests",
                "timeouts.build",
            ]
        );
    }

    #[test]
    fn test_oversized_timeouts_rejected() {
        let yaml = r#"
platforms:
  - name: linux
    base_image: a
    dockerfile: b
    architectures: [amd64]
timeouts:
  global: 604800
  build: 604801
policy:
  per_job_timeout: 18446744073709551615
  grace_period: 18446744073709551615
"#;
        let fields: Vec<String> = parse(yaml).validate().into_iter().map(|i| i.field).collect();
        assert_eq!(
            fields,
            vec!["timeouts.build", "policy.per_job_timeout", "policy.grace_period"]
        );
    }

    #[test]
    fn test_include_ids_must_be_path_safe() {
        let yaml = r#"
platforms:
  - name: linux
    base_image: a
    dockerfile: b
    architectures: [amd64]
include:
  - id: ../escape
    platform: linux
    architecture: arm64
  - id: /abs
    platform: alpine
    architecture: amd64
  - id: alpine-static_1.2
    platform: alpine
    architecture: arm64
  - platform: linux
    architecture: riscv64
    variant: a+b
"#;
        let fields: Vec<String> = parse(yaml).validate().into_iter().map(|i| i.field).collect();
        assert_eq!(
            fields,
            vec!["include[0].id", "include[1].id", "include[3].variant"]
        );
    }

    #[test]
    fn test_duplicate_platform_rejected() {
        let yaml = r#"
platforms:
  - name: linux
    base_image: a
    dockerfile: b
    architectures: [amd64]
  - name: linux
    base_image: a
    dockerfile: b
    architectures: [arm64]
"#;
        let issues = parse(yaml).validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "platforms[1].name");
    }

    #[test]
    fn test_policy_settings_from_document() {
        let yaml = r#"
platforms:
  - name: linux
    base_image: a
    dockerfile: b
    architectures: [amd64]
timeouts:
  global: 900
  test: 20
policy:
  continue_on_error: false
  per_job_timeout: 120
"#;
        let policy = parse(yaml).policy_settings();
        assert!(!policy.continue_on_error);
        assert_eq!(policy.per_job_timeout, Duration::from_secs(120));
        assert_eq!(policy.timeouts.exec, Duration::from_secs(20));
        assert_eq!(policy.timeouts.global, Some(Duration::from_secs(900)));
        assert_eq!(policy.timeouts.build, Duration::from_secs(600));
    }

    #[test]
    fn test_load_document_reports_first_issue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crossmatrix.yaml");
        std::fs::write(&path, "platforms: []\n").unwrap();

        let err = load_document(&path).unwrap_err();
        match err {
            ConfigError::Invalid { field, .. } => assert_eq!(field, "platforms"),
            other => panic!("unexpected error: {other}"),
        }

        let missing = load_document(dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(missing, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_context_dir_relative_to_document() {
        let mut doc = parse(STARTER_DOCUMENT);
        doc.source = PathBuf::from("/work/project/crossmatrix.yaml");
        doc.build.context = PathBuf::from("src");
        assert_eq!(doc.context_dir(), PathBuf::from("/work/project/src"));
    }
}
