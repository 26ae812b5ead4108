/// Pipeline tests for the executor
///
/// A shell "compiler" stands in for g++ so these run anywhere `/bin/sh`
/// exists:
/// 1. Workspaces exist only while a submission runs
/// 2. Concurrent submissions with one cache key build exactly once
/// 3. A cached artifact skips the build on the second run
/// 4. Compile failures surface diagnostics and never execute
/// 5. Timeouts, process ceilings and cancellation end in a clean scratch root
/// 6. Programs cannot write into the artifact cache

#[cfg(test)]
mod pipeline_tests {
    use crate::admission::Admission;
    use crate::cache::ArtifactCache;
    use crate::confine::{self, Confinement};
    use crate::error::ExecutorError;
    use crate::executor::{outcome_of, Executor};
    use crate::toolchain::{adapter_for, CommandTemplate, CompileStep, ToolchainConfig, ToolchainRegistry};
    use crate::workspace::{ScratchLimits, ScratchSpace};
    use sentinel_common::config::ServiceConfig;
    use sentinel_common::types::{
        ExecutionStatus, FailureKind, IntakePolicy, Language, LimitViolation, ResourceLimits, Submission,
        SubmissionOutcome,
    };
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        _dir: TempDir,
        scratch_root: PathBuf,
        cache_root: PathBuf,
        build_log: PathBuf,
        executor: Arc<Executor>,
    }

    impl Harness {
        fn builds(&self) -> usize {
            std::fs::read_to_string(&self.build_log)
                .map(|log| log.lines().count())
                .unwrap_or(0)
        }

        fn workspaces(&self) -> Vec<String> {
            std::fs::read_dir(&self.scratch_root)
                .map(|entries| {
                    entries
                        .flatten()
                        .map(|e| e.file_name().to_string_lossy().into_owned())
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    /// "Compiles" a shell script: syntax check, log the build, copy it out
    fn shell_compiler(build_log: &Path) -> ToolchainConfig {
        let script = format!(
            "sh -n \"$1\" || exit 1; echo \"$2\" >> {}; sleep 0.3; cp \"$1\" \"$2/program\"",
            build_log.display()
        );
        ToolchainConfig {
            language: Language::Cpp,
            version: "sh-cc".to_string(),
            source_file: "main.sh".to_string(),
            version_command: CommandTemplate {
                command: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "echo 1.0".to_string()],
            },
            compile: Some(CompileStep {
                command: "/bin/sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    script,
                    "cc".to_string(),
                    "{source}".to_string(),
                    "{artifact_dir}".to_string(),
                ],
                cpu_time_secs: 5,
                timeout_ms: 10_000,
            }),
            run: CommandTemplate {
                command: "/bin/sh".to_string(),
                args: vec!["{artifact_dir}/program".to_string()],
            },
            env: BTreeMap::new(),
            limit_data_segment: false,
            oom_markers: Vec::new(),
        }
    }

    fn shell_interpreter() -> ToolchainConfig {
        ToolchainConfig {
            language: Language::Python,
            version: "sh".to_string(),
            source_file: "main.sh".to_string(),
            version_command: CommandTemplate {
                command: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "echo 1.0".to_string()],
            },
            compile: None,
            run: CommandTemplate {
                command: "/bin/sh".to_string(),
                args: vec!["{source}".to_string()],
            },
            env: BTreeMap::new(),
            limit_data_segment: false,
            oom_markers: Vec::new(),
        }
    }

    fn harness_with(cache_enabled: bool, admission: Admission) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let scratch_root = dir.path().join("scratch");
        let cache_root = dir.path().join("cache");
        // The shell compiler logs outside its workspace
        let log_dir = dir.path().join("logs");
        std::fs::create_dir(&log_dir).unwrap();
        let build_log = log_dir.join("builds.log");

        let scratch = ScratchSpace::new(
            &scratch_root,
            ScratchLimits {
                max_workspaces: 32,
                tenant_quota: 16,
                min_free_bytes: 0,
            },
        );
        scratch.ensure_ready().unwrap();
        let cache = cache_enabled.then(|| ArtifactCache::new(&cache_root));
        let registry = ToolchainRegistry::from_adapters(vec![
            adapter_for(shell_compiler(&build_log), "sh-cc (1.0)".to_string()),
            adapter_for(shell_interpreter(), "sh (1.0)".to_string()),
        ]);

        let executor = Executor::new(scratch, cache, registry, admission, IntakePolicy::default())
            .with_confinement(Confinement::detect(vec![log_dir]));
        executor.check_preconditions().unwrap();

        Harness {
            _dir: dir,
            scratch_root,
            cache_root,
            build_log,
            executor: Arc::new(executor),
        }
    }

    fn harness() -> Harness {
        harness_with(true, Admission::new(16, 16))
    }

    fn limits() -> ResourceLimits {
        ResourceLimits {
            cpu_time_secs: 2,
            max_processes: 10,
            memory_bytes: 256 * 1024 * 1024,
            wall_timeout_ms: 5_000,
            max_output_bytes: 64 * 1024,
        }
    }

    fn submission(source: &str) -> Submission {
        Submission::new(Language::Cpp, source.as_bytes().to_vec(), limits())
    }

    /// Test: exit status comes through and the workspace is gone afterwards
    #[tokio::test]
    async fn test_exit_code_and_workspace_teardown() {
        let h = harness();
        assert!(h.workspaces().is_empty());

        let result = h
            .executor
            .execute(submission("exit 42"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.exit_code, Some(42));
        assert!(result.stdout.is_empty());
        assert!(result.stderr.is_empty());
        assert!(result.violation.is_none());
        assert!(!result.cache_hit);

        // the build ran inside a workspace under the scratch root
        let log = std::fs::read_to_string(&h.build_log).unwrap();
        assert!(log.trim().starts_with(h.scratch_root.to_str().unwrap()));
        assert!(h.workspaces().is_empty(), "leaked: {:?}", h.workspaces());
        assert_eq!(h.executor.scratch().active(), 0);
    }

    /// Test: eight concurrent submissions, one source, one build
    #[tokio::test]
    async fn test_concurrent_submissions_build_once() {
        let h = harness();
        let source = "echo shared artifact";

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let executor = h.executor.clone();
                tokio::spawn(async move {
                    executor
                        .execute(submission(source), &CancellationToken::new())
                        .await
                })
            })
            .collect();

        let mut built = 0;
        for result in futures_util::future::join_all(tasks).await {
            let result = result.unwrap().unwrap();
            assert_eq!(result.exit_code, Some(0));
            assert_eq!(result.stdout, "shared artifact\n");
            if !result.cache_hit {
                built += 1;
            }
        }

        assert_eq!(h.builds(), 1);
        assert_eq!(built, 1);
        assert!(h.workspaces().is_empty());
    }

    /// Test: second run of the same source is served from the cache
    #[tokio::test]
    async fn test_second_run_is_cache_hit() {
        let h = harness();
        let cancel = CancellationToken::new();

        let first = h.executor.execute(submission("echo $((6 * 7))"), &cancel).await.unwrap();
        let second = h.executor.execute(submission("echo $((6 * 7))"), &cancel).await.unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.stdout, "42\n");
        assert_eq!(first.stdout, second.stdout);
        assert_eq!(first.exit_code, second.exit_code);
        assert_eq!(h.builds(), 1);
    }

    /// Test: without a cache every submission builds
    #[tokio::test]
    async fn test_cache_disabled_always_builds() {
        let h = harness_with(false, Admission::new(4, 4));
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let result = h.executor.execute(submission("echo again"), &cancel).await.unwrap();
            assert!(!result.cache_hit);
        }
        assert_eq!(h.builds(), 2);
    }

    /// Test: syntax errors come back as diagnostics, nothing runs
    #[tokio::test]
    async fn test_compile_error_reports_diagnostics() {
        let h = harness();
        let outcome = h
            .executor
            .run(submission("if then fi ("), &CancellationToken::new())
            .await;

        match outcome {
            SubmissionOutcome::CompileError { diagnostics, truncated } => {
                assert!(!diagnostics.trim().is_empty());
                assert!(!truncated);
            }
            other => panic!("expected CompileError, got {:?}", other),
        }
        assert_eq!(h.builds(), 0);
        assert!(h.workspaces().is_empty());
    }

    /// Test: an infinite loop stops at the wall-clock limit
    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let h = harness();
        let mut s = submission("while :; do :; done");
        s.limits.wall_timeout_ms = 500;

        let started = Instant::now();
        let result = h.executor.execute(s, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert!(result.violation.is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(h.workspaces().is_empty());
    }

    /// Test: forking past the ceiling is stopped and nothing survives
    #[tokio::test]
    async fn test_fork_beyond_ceiling() {
        let h = harness();
        let mut s = submission("for i in $(seq 1 30); do sleep 30 & done; wait");
        s.limits.max_processes = 4;

        let result = h.executor.execute(s, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::LimitExceeded);
        assert_eq!(result.violation, Some(LimitViolation::ProcessCount));
        assert!(h.workspaces().is_empty());
    }

    /// Test: stdin reaches the program and interpreted languages skip the build
    #[tokio::test]
    async fn test_interpreted_with_stdin() {
        let h = harness();
        let mut s = Submission::new(Language::Python, b"read line; echo \"got $line\"".to_vec(), limits());
        s.stdin = b"ping\n".to_vec();

        let result = h.executor.execute(s, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.stdout, "got ping\n");
        assert!(!result.cache_hit);
        assert_eq!(h.builds(), 0);
    }

    /// Test: unknown toolchains fail fast and are fatal
    #[tokio::test]
    async fn test_missing_toolchain_is_fatal() {
        let h = harness();
        let s = Submission::new(Language::Java, b"class Main {}".to_vec(), limits());

        let err = h.executor.execute(s, &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            outcome_of(Err(err)),
            SubmissionOutcome::Failed { kind: FailureKind::ToolchainUnavailable, .. }
        ));
        assert!(h.workspaces().is_empty());
    }

    /// Test: invalid input never reaches the provisioner
    #[tokio::test]
    async fn test_invalid_submission_rejected() {
        let h = harness();
        let mut s = submission("echo hi");
        s.limits.max_processes = 10_000;

        let err = h.executor.execute(s, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidSubmission(_)));

        let err = h
            .executor
            .execute(submission(""), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidSubmission(_)));
    }

    /// Test: cancellation ends the run and cleans up
    #[tokio::test]
    async fn test_cancellation_releases_workspace() {
        let h = harness();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(800)).await;
            trigger.cancel();
        });

        let err = h.executor.execute(submission("sleep 30"), &cancel).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled));
        assert!(h.workspaces().is_empty());
    }

    /// Test: a full gate with no queue room rejects new work
    #[tokio::test]
    async fn test_overloaded_when_gate_full() {
        let h = harness_with(true, Admission::new(1, 0));
        let _held = h.executor.admission().admit().await.unwrap();

        let outcome = h.executor.run(submission("echo hi"), &CancellationToken::new()).await;
        assert!(matches!(
            outcome,
            SubmissionOutcome::Failed { kind: FailureKind::Overloaded, .. }
        ));
    }

    fn cached_programs(cache_root: &Path) -> Vec<Vec<u8>> {
        std::fs::read_dir(cache_root)
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| std::fs::read(e.path().join("program")).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Test: a program cannot rewrite another submission's cached artifact
    #[tokio::test]
    async fn test_program_cannot_modify_cache() {
        if !confine::is_supported() {
            return;
        }
        let h = harness();
        let cancel = CancellationToken::new();

        let first = h.executor.execute(submission("echo hello"), &cancel).await.unwrap();
        assert_eq!(first.stdout, "hello\n");
        assert_eq!(cached_programs(&h.cache_root), vec![b"echo hello".to_vec()]);

        let attack = format!(
            "for d in {cache}/*/; do printf 'echo pwned\\n' > \"$d/program\"; rm -f \"$d/entry.json\"; done; \
             touch {cache}/planted; mkdir {cache}/forged",
            cache = h.cache_root.display()
        );
        let attacker = h.executor.execute(submission(&attack), &cancel).await.unwrap();
        assert_ne!(attacker.exit_code, Some(0));

        let second = h.executor.execute(submission("echo hello"), &cancel).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.stdout, "hello\n");
        assert!(!h.cache_root.join("planted").exists());
        assert!(!h.cache_root.join("forged").exists());
        assert!(cached_programs(&h.cache_root).contains(&b"echo hello".to_vec()));
    }

    /// Test: the configured executor only caches when programs are confined
    #[tokio::test]
    async fn test_cache_requires_confinement() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let cache = dir.path().join("cache");
        let config = ServiceConfig::from_lookup(|key| match key {
            "SENTINEL_SCRATCH_DIR" => Some(scratch.display().to_string()),
            "SENTINEL_CACHE_DIR" => Some(cache.display().to_string()),
            _ => None,
        })
        .unwrap();

        let executor = Executor::from_config(&config, ToolchainRegistry::default());
        assert_eq!(executor.is_caching(), confine::is_supported());
    }
}
