/// Execution pipeline: intake → provision → build (or cache hit) → run
///
/// The [`Executor`] owns the injected handles (scratch space, artifact cache,
/// toolchain registry, admission gate) and drives one submission at a time
/// through them. The workspace is created before any subprocess starts and
/// removed before the result is returned, whatever the outcome.
use crate::admission::{Admission, AdmissionPermit};
use crate::cache::{ArtifactCache, CacheKey, EntryMeta};
use crate::confine::Confinement;
use crate::error::{ExecutorError, Result};
use crate::supervisor::Supervisor;
use crate::toolchain::{ToolchainAdapter, ToolchainRegistry};
use crate::workspace::{ScratchLimits, ScratchSpace, SweepReport, Workspace};
use sentinel_common::config::ServiceConfig;
use sentinel_common::types::{ExecutionResult, IntakePolicy, Submission, SubmissionOutcome};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a cleanup pass removed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub workspaces: SweepReport,
    pub cache_temp_removed: usize,
}

pub struct Executor {
    scratch: ScratchSpace,
    cache: Option<Arc<ArtifactCache>>,
    toolchains: RwLock<ToolchainRegistry>,
    supervisor: Supervisor,
    admission: Admission,
    policy: IntakePolicy,
}

impl Executor {
    pub fn new(
        scratch: ScratchSpace,
        cache: Option<ArtifactCache>,
        toolchains: ToolchainRegistry,
        admission: Admission,
        policy: IntakePolicy,
    ) -> Self {
        Self {
            scratch,
            cache: cache.map(Arc::new),
            toolchains: RwLock::new(toolchains),
            supervisor: Supervisor::default().with_confinement(Confinement::detect(Vec::new())),
            admission,
            policy,
        }
    }

    pub fn from_config(config: &ServiceConfig, toolchains: ToolchainRegistry) -> Self {
        let scratch = ScratchSpace::new(
            &config.scratch_dir,
            ScratchLimits {
                max_workspaces: config.max_workspaces,
                tenant_quota: config.tenant_quota,
                min_free_bytes: config.min_free_bytes,
            },
        );
        let confinement = Confinement::detect(config.sandbox_writable.clone());
        // Without confinement a program could rewrite cached artifacts
        let cache_enabled = config.cache_enabled && confinement.is_enabled();
        if config.cache_enabled && !cache_enabled {
            warn!("artifact cache disabled: sandboxed programs cannot be confined");
        }
        let cache = cache_enabled.then(|| ArtifactCache::new(&config.cache_dir));
        Self::new(
            scratch,
            cache,
            toolchains,
            Admission::new(config.max_workers, config.max_queued),
            config.intake.clone(),
        )
        .with_confinement(confinement)
    }

    pub fn with_confinement(mut self, confinement: Confinement) -> Self {
        self.supervisor = self.supervisor.with_confinement(confinement);
        self
    }

    pub fn is_caching(&self) -> bool {
        self.cache.is_some()
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn scratch(&self) -> &ScratchSpace {
        &self.scratch
    }

    pub fn toolchains(&self) -> ToolchainRegistry {
        self.toolchains.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Swap in a freshly probed registry
    pub fn replace_toolchains(&self, registry: ToolchainRegistry) {
        *self.toolchains.write().unwrap_or_else(|e| e.into_inner()) = registry;
    }

    fn resolve(&self, submission: &Submission) -> Result<Arc<dyn ToolchainAdapter>> {
        self.toolchains
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolve(submission.language)
    }

    /// Scratch and cache writable, every requested toolchain present
    pub fn check_preconditions(&self) -> Result<()> {
        self.scratch.ensure_ready()?;
        if let Some(cache) = &self.cache {
            cache.ensure_ready()?;
        }
        let registry = self.toolchains.read().unwrap_or_else(|e| e.into_inner());
        if let Some((language, reason)) = registry.unavailable().iter().next() {
            return Err(ExecutorError::ToolchainUnavailable {
                language: *language,
                reason: reason.clone(),
            });
        }
        Ok(())
    }

    /// Remove orphaned workspaces and abandoned cache temp directories
    pub fn sweep(&self, max_age: Duration) -> MaintenanceReport {
        let workspaces = self.scratch.sweep(max_age);
        let cache_temp_removed = self.cache.as_ref().map(|c| c.sweep_temp(max_age)).unwrap_or(0);
        if workspaces.removed > 0 || cache_temp_removed > 0 {
            info!(
                workspaces_removed = workspaces.removed,
                workspaces_failed = workspaces.failed,
                cache_temp_removed,
                "cleanup sweep finished"
            );
        }
        MaintenanceReport {
            workspaces,
            cache_temp_removed,
        }
    }

    /// Admit and run one submission
    pub async fn execute(&self, submission: Submission, cancel: &CancellationToken) -> Result<ExecutionResult> {
        let permit = self.admission.admit().await?;
        self.execute_admitted(submission, cancel, &permit).await
    }

    /// Run a submission under a permit the caller already holds
    #[tracing::instrument(
        skip_all,
        fields(submission_id = %submission.id, language = %submission.language, tenant = %submission.tenant)
    )]
    pub async fn execute_admitted(
        &self,
        submission: Submission,
        cancel: &CancellationToken,
        _permit: &AdmissionPermit,
    ) -> Result<ExecutionResult> {
        let submission = submission.accept(&self.policy)?;
        let adapter = self.resolve(&submission)?;
        let workspace = self.scratch.provision(&submission).await?;

        let result = self.run_in(&workspace, &submission, adapter.as_ref(), cancel).await;

        if let Err(e) = workspace.release().await {
            warn!(error = %e, "workspace release failed");
        }
        result
    }

    /// Convenience wrapper producing the caller-facing outcome
    pub async fn run(&self, submission: Submission, cancel: &CancellationToken) -> SubmissionOutcome {
        outcome_of(self.execute(submission, cancel).await)
    }

    async fn run_in(
        &self,
        workspace: &Workspace,
        submission: &Submission,
        adapter: &dyn ToolchainAdapter,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        workspace.write_source(adapter.source_file(), &submission.source).await?;

        let build_started = Instant::now();
        let (artifact_dir, cache_hit) = self.build(workspace, submission, adapter, cancel).await?;
        let build_ms = build_started.elapsed().as_millis() as u64;
        debug!(build_ms, cache_hit, "artifact ready");

        let spec = adapter.run_command(workspace, &artifact_dir);
        let report = match self
            .supervisor
            .execute(&spec, &submission.limits, &submission.stdin, cancel)
            .await
        {
            Ok(report) => report,
            Err(ExecutorError::Spawn { kind, program, message })
                if kind == std::io::ErrorKind::NotFound && !spec.program.starts_with(workspace.root()) =>
            {
                return Err(ExecutorError::ToolchainUnavailable {
                    language: submission.language,
                    reason: format!("{}: {}", program, message),
                });
            }
            Err(ExecutorError::Spawn { program, message, .. }) => {
                return Err(ExecutorError::Internal(format!("could not start {}: {}", program, message)));
            }
            Err(e) => return Err(e),
        };

        let result = ExecutionResult {
            submission_id: submission.id,
            status: report.status,
            exit_code: report.exit_code,
            signal: report.signal,
            stdout: String::from_utf8_lossy(&report.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&report.stderr).into_owned(),
            stdout_truncated: report.stdout_truncated,
            stderr_truncated: report.stderr_truncated,
            duration_ms: report.duration.as_millis() as u64,
            violation: report.violation,
            cache_hit,
            build_ms,
        };
        info!(
            status = ?result.status,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            cache_hit,
            "submission executed"
        );
        Ok(result)
    }

    /// Produce the directory to run from, plus whether the build was skipped
    async fn build(
        &self,
        workspace: &Workspace,
        submission: &Submission,
        adapter: &dyn ToolchainAdapter,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, bool)> {
        let cache = match &self.cache {
            Some(cache) if adapter.is_compiled() => cache,
            _ => {
                let dir = adapter
                    .build(workspace, &submission.limits, &self.supervisor, cancel)
                    .await?;
                return Ok((dir, false));
            }
        };

        let key = CacheKey::derive(
            submission.language,
            adapter.version(),
            &adapter.compile_flags(),
            &submission.source,
        );
        let meta = EntryMeta {
            language: submission.language,
            toolchain_version: adapter.version().to_string(),
        };
        let (artifact, hit) = cache
            .get_or_build(&key, meta, || {
                adapter.build(workspace, &submission.limits, &self.supervisor, cancel)
            })
            .await?;
        debug!(cache_key = %key, hit, "artifact resolved");

        let bin_dir = workspace.bin_dir();
        cache.stage(&artifact, &bin_dir).await?;
        Ok((bin_dir, hit))
    }
}

/// Map a pipeline result onto the caller-facing outcome
pub fn outcome_of(result: Result<ExecutionResult>) -> SubmissionOutcome {
    match result {
        Ok(result) => SubmissionOutcome::Executed { result },
        Err(e) => e.into_outcome(),
    }
}
