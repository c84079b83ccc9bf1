//! CLI command definitions.

use clap::{Args, Subcommand};
use crossmatrix_core::config::DEFAULT_DOCUMENT;
use crossmatrix_core::matrix::{Architecture, Platform};
use crossmatrix_core::policy::MAX_TIMEOUT_SECS;
use crossmatrix_report::ReportFormat;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Build and test every matrix entry
    Run(RunArgs),

    /// Validate a matrix document
    Validate {
        /// Path to the matrix document
        #[arg(default_value = DEFAULT_DOCUMENT)]
        path: PathBuf,
    },

    /// Show the expanded matrix without running it
    Matrix {
        #[command(flatten)]
        selection: Selection,

        /// Map unsupported pairs onto the baseline target
        #[arg(long)]
        allow_fallback: bool,

        /// Print entries as JSON
        #[arg(long)]
        json: bool,
    },

    /// List supported platform/architecture pairs
    Targets,

    /// Write a starter matrix document
    Init {
        #[arg(default_value = DEFAULT_DOCUMENT)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the JSON Schema of the report (or of the matrix document)
    Schema {
        /// Schema of the matrix document instead
        #[arg(long)]
        document: bool,
    },
}

/// Document path and command-line narrowing shared by `run` and `matrix`.
#[derive(Args, Debug, Clone)]
pub struct Selection {
    /// Path to the matrix document
    #[arg(short, long, default_value = DEFAULT_DOCUMENT)]
    pub config: PathBuf,

    /// Only these platforms (repeatable)
    #[arg(short, long = "platform")]
    pub platforms: Vec<Platform>,

    /// Only these architectures (repeatable)
    #[arg(short, long = "arch")]
    pub architectures: Vec<Architecture>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub selection: Selection,

    /// Per-job timeout in seconds
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..=MAX_TIMEOUT_SECS))]
    pub timeout: Option<u64>,

    /// Run jobs concurrently
    #[arg(long)]
    pub parallel: bool,

    /// Worker cap in parallel mode
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Stop scheduling new jobs after the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Keep images and containers of failed jobs for debugging
    #[arg(long)]
    pub keep_resources: bool,

    /// Output directory for logs, artifacts and reports
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Extra report formats (repeatable); json and text are always written
    #[arg(short, long = "format")]
    pub formats: Vec<ReportFormat>,

    /// Map unsupported pairs onto the baseline target
    #[arg(long)]
    pub allow_fallback: bool,
}
