//! Per-user CLI defaults.
//!
//! Values here sit between the matrix document and the command line: a flag
//! always wins, the file fills in what the flag left unset.

use anyhow::{Context, Result};
use crossmatrix_report::ReportFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Where run output goes when `--output` is not given.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Extra report formats written on every run.
    #[serde(default)]
    pub formats: Vec<String>,
    /// Docker network for job containers, overriding the document.
    pub docker_network: Option<String>,
    /// Worker cap in parallel mode.
    pub max_parallel: Option<usize>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("crossmatrix-results")
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            formats: Vec::new(),
            docker_network: None,
            max_parallel: None,
        }
    }
}

impl CliConfig {
    /// Load configuration from the platform config directory.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Get the configuration file path.
    pub fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "crossmatrix", "crossmatrix")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    pub fn report_formats(&self) -> Result<Vec<ReportFormat>> {
        self.formats
            .iter()
            .map(|f| f.parse::<ReportFormat>().map_err(anyhow::Error::msg))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = CliConfig::load_from(&dir.path().join("config.yaml")).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("crossmatrix-results"));
        assert!(config.formats.is_empty());
    }

    #[test]
    fn test_load_and_parse_formats() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "output_dir: /tmp/out\nformats: [junit, html]\ndocker_network: ci\nmax_parallel: 4\n",
        )
        .unwrap();

        let config = CliConfig::load_from(&path).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.docker_network.as_deref(), Some("ci"));
        assert_eq!(config.max_parallel, Some(4));
        assert_eq!(
            config.report_formats().unwrap(),
            vec![ReportFormat::Junit, ReportFormat::Html]
        );
    }

    #[test]
    fn test_unknown_format_rejected() {
        let config = CliConfig {
            formats: vec!["pdf".to_string()],
            ..CliConfig::default()
        };
        assert!(config.report_formats().is_err());
    }
}
