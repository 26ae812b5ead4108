// CLI commands for running and operating Sentinel
use anyhow::{bail, Context, Result};
use sentinel_common::config::ServiceConfig;
use sentinel_common::redis;
use sentinel_common::types::{Language, ResourceLimits, Submission, SubmissionOutcome};
use sentinel_engine::toolchain::{ToolchainConfigManager, ToolchainRegistry};
use sentinel_engine::Executor;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::LimitArgs;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

impl LimitArgs {
    pub fn to_limits(&self) -> Result<ResourceLimits> {
        let memory_bytes = match self.memory_mb {
            Some(mb) => mb
                .checked_mul(1024 * 1024)
                .with_context(|| format!("--memory-mb {} is too large", mb))?,
            None => 0,
        };
        Ok(ResourceLimits {
            cpu_time_secs: self.cpu.unwrap_or(0),
            max_processes: self.procs.unwrap_or(0),
            memory_bytes,
            wall_timeout_ms: self.timeout_ms.unwrap_or(0),
            max_output_bytes: self.max_output.unwrap_or(0),
        })
    }
}

fn read_submission(language: &str, file: &Path, stdin: Option<&Path>, limits: &LimitArgs) -> Result<Submission> {
    let language: Language = language.parse()?;
    let source = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let mut submission = Submission::new(language, source, limits.to_limits()?);
    if let Some(path) = stdin {
        submission.stdin = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    }
    Ok(submission)
}

fn load_config() -> Result<(ServiceConfig, ToolchainConfigManager)> {
    let config = ServiceConfig::from_env().context("Invalid configuration")?;
    let manager = ToolchainConfigManager::load(&config.languages_config)?;
    Ok((config, manager))
}

/// Execute a file through the engine in this process and print the outcome
pub async fn run_local(
    language: &str,
    file: &Path,
    stdin: Option<&Path>,
    no_cache: bool,
    limits: &LimitArgs,
) -> Result<()> {
    let submission = read_submission(language, file, stdin, limits)?;
    let (mut config, manager) = load_config()?;
    if no_cache {
        config.cache_enabled = false;
    }

    let registry = ToolchainRegistry::probe(&manager, &[submission.language]).await;
    let executor = Executor::from_config(&config, registry);
    executor.scratch().ensure_ready()?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let outcome = executor.run(submission, &cancel).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    match outcome {
        SubmissionOutcome::Executed { result } if result.exit_code == Some(0) => Ok(()),
        SubmissionOutcome::Executed { .. } => std::process::exit(1),
        SubmissionOutcome::CompileError { .. } => std::process::exit(2),
        SubmissionOutcome::Failed { .. } => std::process::exit(3),
    }
}

/// Queue a file for the workers and poll until its record appears
pub async fn submit(
    language: &str,
    file: &Path,
    stdin: Option<&Path>,
    tenant: &str,
    wait_secs: u64,
    limits: &LimitArgs,
) -> Result<()> {
    let mut submission = read_submission(language, file, stdin, limits)?;
    submission.tenant = tenant.to_string();
    let config = ServiceConfig::from_env().context("Invalid configuration")?;
    let submission = submission.accept(&config.intake)?;

    let client = ::redis::Client::open(config.redis_url.as_str()).context("Failed to create Redis client")?;
    let mut conn = ::redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    redis::push_submission(&mut conn, &submission, config.result_ttl_secs).await?;
    eprintln!("📨 Queued submission {}", submission.id);

    let deadline = Instant::now() + Duration::from_secs(wait_secs);
    loop {
        if let Some(record) = redis::get_record(&mut conn, &submission.id).await? {
            println!("{}", serde_json::to_string_pretty(&record)?);
            return Ok(());
        }
        if Instant::now() >= deadline {
            let status = redis::get_status(&mut conn, &submission.id).await?;
            bail!(
                "No outcome for {} after {}s (status: {:?})",
                submission.id,
                wait_secs,
                status
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Run the cleanup sweep over the configured scratch and cache directories
pub async fn sweep(max_age_secs: Option<u64>) -> Result<()> {
    let config = ServiceConfig::from_env().context("Invalid configuration")?;
    let max_age = max_age_secs.map(Duration::from_secs).unwrap_or(config.workspace_max_age);
    let executor = Executor::from_config(&config, ToolchainRegistry::default());

    println!("🧹 Sweeping {} (max age {:?})", config.scratch_dir.display(), max_age);
    let report = tokio::task::spawn_blocking(move || executor.sweep(max_age)).await?;
    println!(
        "✅ Workspaces removed: {}, kept: {}, failed: {}; cache temp dirs removed: {}",
        report.workspaces.removed, report.workspaces.kept, report.workspaces.failed, report.cache_temp_removed
    );
    Ok(())
}

/// Probe every configured toolchain and print a table
pub async fn list_toolchains() -> Result<()> {
    let (_, manager) = load_config()?;
    let languages = manager.list_languages();
    if languages.is_empty() {
        println!("No toolchains configured.");
        return Ok(());
    }

    let registry = ToolchainRegistry::probe(&manager, &languages).await;
    let available = registry.available();

    println!("📋 Configured Toolchains:\n");
    println!("{:<10} {:<12} {:<10} {}", "LANGUAGE", "STATUS", "COMPILED", "VERSION / REASON");
    println!("{}", "─".repeat(80));
    for language in languages {
        let compiled = manager
            .get_config(language)
            .map(|c| if c.compile.is_some() { "yes" } else { "no" })
            .unwrap_or("?");
        match available.iter().find(|(l, _)| *l == language) {
            Some((_, version)) => println!("{:<10} {:<12} {:<10} {}", language, "available", compiled, version),
            None => {
                let reason = registry.unavailable().get(&language).cloned().unwrap_or_default();
                println!("{:<10} {:<12} {:<10} {}", language, "unavailable", compiled, reason);
            }
        }
    }
    Ok(())
}
