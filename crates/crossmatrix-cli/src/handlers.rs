//! Command handlers.

use crate::commands::{RunArgs, Selection};
use crate::config::CliConfig;
use crate::signals;
use anyhow::{Context, Result};
use console::style;
use crossmatrix_core::{ConfigError, RunId};
use crossmatrix_core::config::{MatrixDocument, STARTER_DOCUMENT, load_document, parse_document};
use crossmatrix_core::matrix::MatrixEntry;
use crossmatrix_core::policy::PolicySettings;
use crossmatrix_core::ports::{EnvironmentPreparer, ExecutionBackend};
use crossmatrix_core::report::Report;
use crossmatrix_core::targets::TargetResolver;
use crossmatrix_report::{render, write_reports};
use crossmatrix_runner::{
    DockerBackend, DockerConfig, JobRunner, NetworkPreparer, NoopPreparer, ResourceLifecycle,
    RunnerSettings, TeardownConfig,
};
use crossmatrix_scheduler::{MatrixExpander, MatrixFilter, MatrixScheduler};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Execute the matrix and write the reports.
pub async fn run(config: &CliConfig, args: RunArgs) -> Result<ExitCode> {
    let doc = load_document(&args.selection.config)?;
    let entries = expand(&doc, &args.selection)?;
    if entries.is_empty() {
        println!("{} No matrix entries selected", style("!").yellow());
    }

    let policy = run_policy(&doc, config, &args);
    let run_id = RunId::new();
    let output_dir = args
        .output
        .clone()
        .unwrap_or_else(|| config.output_dir.clone());
    let mut formats = config.report_formats()?;
    formats.extend(args.formats.iter().copied());

    let mut settings = RunnerSettings::from_document(run_id, &doc, output_dir.clone());
    if config.docker_network.is_some() {
        settings.network = config.docker_network.clone();
    }

    println!(
        "{} Running {} jobs ({}, {})",
        style("▶").cyan(),
        style(entries.len()).bold(),
        if policy.parallel { "parallel" } else { "sequential" },
        if policy.continue_on_error {
            "continue-on-error"
        } else {
            "stop-on-error"
        }
    );
    info!(run = %run_id, output = %output_dir.display(), "Starting run");

    let docker = Arc::new(DockerBackend::connect(DockerConfig::default())?);
    let preparer: Arc<dyn EnvironmentPreparer> = match &settings.network {
        Some(name) => Arc::new(NetworkPreparer::new(docker.client().clone(), name.clone())),
        None => Arc::new(NoopPreparer),
    };
    let backend: Arc<dyn ExecutionBackend> = docker;

    let lifecycle = ResourceLifecycle::new(Arc::clone(&backend), TeardownConfig::from(&policy));
    let runner = Arc::new(JobRunner::new(
        backend,
        Arc::clone(&lifecycle),
        Arc::new(settings),
    ));

    let cancel = CancellationToken::new();
    let abort = CancellationToken::new();
    let signal_task = tokio::spawn(signals::cancel_on_signal(cancel.clone(), abort.clone()));

    let scheduler = MatrixScheduler::new(run_id, runner, lifecycle, Arc::new(policy), cancel)
        .with_abort(abort)
        .with_resolver(TargetResolver::new().with_baseline_fallback(args.allow_fallback))
        .with_preparer(preparer);
    let outcome = scheduler.execute(entries).await;
    signal_task.abort();
    let report = outcome.context("matrix run aborted")?;

    let written = write_reports(&report, &output_dir, &formats)?;
    let rendered = render(&report)?;
    println!("\n{}", rendered.summary);
    for path in &written {
        println!("  {} {}", style("→").dim(), path.display());
    }

    Ok(verdict(&report))
}

/// Document policy, then the CLI config file, then flags.
pub fn run_policy(doc: &MatrixDocument, config: &CliConfig, args: &RunArgs) -> PolicySettings {
    let mut policy = doc.policy_settings();

    if let Some(max) = config.max_parallel {
        policy = policy.with_max_parallel(max);
    }

    if let Some(secs) = args.timeout {
        policy = policy.with_per_job_timeout(Duration::from_secs(secs));
    }
    if args.parallel {
        policy.parallel = true;
    }
    if let Some(max) = args.max_parallel {
        policy = policy.with_max_parallel(max);
    }
    if args.fail_fast {
        policy = policy.with_continue_on_error(false);
    }
    if args.keep_resources {
        policy = policy.with_keep_resources_on_failure(true);
    }
    policy
}

fn verdict(report: &Report) -> ExitCode {
    if report.is_success() {
        println!("{} Matrix run succeeded", style("✓").green());
        ExitCode::SUCCESS
    } else {
        println!("{} Matrix run failed", style("✗").red());
        ExitCode::FAILURE
    }
}

fn expand(doc: &MatrixDocument, selection: &Selection) -> Result<Vec<MatrixEntry>> {
    let filter = MatrixFilter {
        platforms: selection.platforms.clone(),
        architectures: selection.architectures.clone(),
    };
    Ok(MatrixExpander::new().expand(doc, &filter)?)
}

/// Validate a matrix document, reporting every problem found.
pub fn validate(path: &Path) -> Result<ExitCode> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        }
        .into());
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let doc = parse_document(&content, path)?;

    let issues = doc.validate();
    if let Some(first) = issues.first() {
        for issue in &issues {
            println!("{} {}: {}", style("✗").red(), issue.field, issue.message);
        }
        return Err(first.clone().into_error(path).into());
    }

    let entries = MatrixExpander::new().expand(&doc, &MatrixFilter::default())?;
    println!(
        "{} {} is valid",
        style("✓").green(),
        doc.name.as_deref().unwrap_or("matrix document")
    );
    println!("  Platforms: {}", doc.platforms.iter().filter(|p| p.enabled).count());
    println!("  Entries: {}", entries.len());
    println!("  Test suites: {}", doc.enabled_suites().count());

    Ok(ExitCode::SUCCESS)
}

/// Show the expanded matrix with resolved targets.
pub fn matrix(selection: &Selection, allow_fallback: bool, json: bool) -> Result<ExitCode> {
    let doc = load_document(&selection.config)?;
    let entries = expand(&doc, selection)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(ExitCode::SUCCESS);
    }

    let resolver = TargetResolver::new().with_baseline_fallback(allow_fallback);
    for entry in &entries {
        match resolver.resolve_entry(entry) {
            Ok(params) => {
                let note = if params.fallback_from.is_some() {
                    style(" (fallback)").yellow().to_string()
                } else {
                    String::new()
                };
                println!(
                    "  {} {:<28} {:<22} {}{}",
                    style("●").green(),
                    entry.id,
                    params.target_id,
                    params.build_options.join(" "),
                    note
                );
            }
            Err(e) => println!(
                "  {} {:<28} {}",
                style("○").dim(),
                entry.id,
                style(format!("skipped: {}", e)).dim()
            ),
        }
    }
    println!("\n{} entries", entries.len());
    Ok(ExitCode::SUCCESS)
}

/// List supported platform/architecture pairs.
pub fn targets() -> Result<ExitCode> {
    println!("{:<10} {:<8} {}", "PLATFORM", "ARCH", "TARGET");
    for (platform, arch, target) in TargetResolver::supported_pairs() {
        println!("{:<10} {:<8} {}", platform, arch, target);
    }
    Ok(ExitCode::SUCCESS)
}

/// Write the starter document.
pub fn init(path: &Path, force: bool) -> Result<ExitCode> {
    if path.exists() && !force {
        println!(
            "{} {} already exists (use --force to overwrite)",
            style("!").yellow(),
            path.display()
        );
        return Ok(ExitCode::SUCCESS);
    }

    std::fs::write(path, STARTER_DOCUMENT)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("{} Created {}", style("✓").green(), path.display());
    Ok(ExitCode::SUCCESS)
}

/// Print the JSON Schema of the report or the matrix document.
pub fn schema(document: bool) -> Result<ExitCode> {
    let schema = if document {
        schemars::schema_for!(MatrixDocument)
    } else {
        schemars::schema_for!(Report)
    };
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(ExitCode::SUCCESS)
}

/// Exit status for an error that escaped a handler: 2 for configuration
/// problems, 1 otherwise.
pub fn exit_status_for(err: &anyhow::Error) -> u8 {
    let is_config = err.chain().any(|cause| {
        cause.downcast_ref::<ConfigError>().is_some()
            || matches!(
                cause.downcast_ref::<crossmatrix_core::Error>(),
                Some(crossmatrix_core::Error::Config(_))
            )
    });
    if is_config {
        2
    } else {
        warn!(error = %err, "Run failed");
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Selection;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const DOC: &str = r#"
platforms:
  - name: linux
    base_image: ubuntu:22.04
    dockerfile: Dockerfile
    architectures: [amd64]
policy:
  continue_on_error: true
  max_parallel: 2
"#;

    fn args() -> RunArgs {
        RunArgs {
            selection: Selection {
                config: PathBuf::from("crossmatrix.yaml"),
                platforms: Vec::new(),
                architectures: Vec::new(),
            },
            timeout: None,
            parallel: false,
            max_parallel: None,
            fail_fast: false,
            keep_resources: false,
            output: None,
            formats: Vec::new(),
            allow_fallback: false,
        }
    }

    fn doc() -> MatrixDocument {
        parse_document(DOC, Path::new("crossmatrix.yaml")).unwrap()
    }

    #[test]
    fn test_flags_override_document_and_config() {
        let config = CliConfig {
            max_parallel: Some(8),
            ..CliConfig::default()
        };
        let mut args = args();
        args.timeout = Some(5);
        args.fail_fast = true;
        args.parallel = true;

        let policy = run_policy(&doc(), &config, &args);
        assert_eq!(policy.per_job_timeout, Duration::from_secs(5));
        assert!(!policy.continue_on_error);
        assert!(policy.parallel);
        assert_eq!(policy.max_parallel, Some(8));

        args.max_parallel = Some(3);
        assert_eq!(run_policy(&doc(), &config, &args).max_parallel, Some(3));
    }

    #[test]
    fn test_document_policy_used_without_flags() {
        let policy = run_policy(&doc(), &CliConfig::default(), &args());
        assert!(policy.continue_on_error);
        assert!(!policy.parallel);
        assert_eq!(policy.max_parallel, Some(2));
    }

    #[test]
    fn test_config_errors_exit_with_two() {
        let err: anyhow::Error = ConfigError::NotFound {
            path: PathBuf::from("missing.yaml"),
        }
        .into();
        assert_eq!(exit_status_for(&err), 2);

        let wrapped: anyhow::Error = crossmatrix_core::Error::from(ConfigError::NotFound {
            path: PathBuf::from("missing.yaml"),
        })
        .into();
        assert_eq!(exit_status_for(&wrapped), 2);

        let other = anyhow::anyhow!("docker unavailable");
        assert_eq!(exit_status_for(&other), 1);
    }

    #[test]
    fn test_init_writes_starter_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crossmatrix.yaml");

        init(&path, false).unwrap();
        assert!(load_document(&path).is_ok());

        std::fs::write(&path, "custom").unwrap();
        init(&path, false).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "custom");
    }

    #[test]
    fn test_validate_rejects_invalid_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crossmatrix.yaml");
        std::fs::write(&path, "platforms:\n  - name: linux\n    base_image: ''\n    dockerfile: ''\n    architectures: [amd64]\n").unwrap();

        let err = validate(&path).unwrap_err();
        assert_eq!(exit_status_for(&err), 2);
    }
}
