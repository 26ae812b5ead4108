/// Execution Supervisor - runs one command under a resource ceiling
///
/// **Guarantees:**
/// - The command runs in its own process group with kernel limits installed
///   before exec and a scrubbed environment
/// - When confinement is enabled, the command can write only beneath its
///   own writable paths
/// - A monitor samples the whole process tree and enforces process-count,
///   memory and CPU ceilings; a deadline enforces wall-clock time
/// - Any termination path kills every member of the tree, and the tree is
///   killed again when the supervising future is dropped (cancellation)
/// - Output is captured into bounded buffers; the rest is drained and dropped
///
/// Every terminal state (Completed, TimedOut, LimitExceeded, Crashed) comes
/// back as a well-formed [`ProcessReport`].
use crate::confine::Confinement;
use crate::error::{ExecutorError, Result};
use crate::limits::KernelLimits;
use crate::process_tree;
use sentinel_common::types::{ExecutionStatus, LimitViolation, ResourceLimits};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long to wait for pipes to close once the tree is dead
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Fully resolved command line for one supervised process
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Apply RLIMIT_DATA; runtimes that reserve large heaps opt out and rely
    /// on the RSS monitor instead
    pub limit_data_segment: bool,
    /// Directories the command may write beneath
    pub writable: Vec<PathBuf>,
    /// stderr text a runtime prints when an allocation is refused
    pub oom_markers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessReport {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration: Duration,
    pub violation: Option<LimitViolation>,
    /// Process group id of the supervised tree
    pub pgid: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Running,
    Finished(ExecutionStatus),
}

#[derive(Debug)]
struct CaptureBuffer {
    data: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CaptureBuffer {
    fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

type SharedCapture = Arc<Mutex<CaptureBuffer>>;

async fn capture<R: AsyncRead + Unpin>(mut reader: R, buffer: SharedCapture) {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
                buf.push(&chunk[..n]);
            }
        }
    }
}

fn take_capture(buffer: &SharedCapture) -> (Vec<u8>, bool) {
    let mut buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
    (std::mem::take(&mut buf.data), buf.truncated)
}

/// Kills the process tree when dropped unless disarmed
struct TreeGuard {
    pgid: i32,
    armed: bool,
}

impl Drop for TreeGuard {
    fn drop(&mut self) {
        if self.armed {
            process_tree::kill_tree(self.pgid);
        }
    }
}

async fn kill_tree(pgid: i32) {
    if tokio::task::spawn_blocking(move || process_tree::kill_tree(pgid)).await.is_err() {
        process_tree::kill_tree(pgid);
    }
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    poll_interval: Duration,
    confinement: Confinement,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            confinement: Confinement::disabled(),
        }
    }
}

impl Supervisor {
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..Self::default()
        }
    }

    pub fn with_confinement(mut self, confinement: Confinement) -> Self {
        self.confinement = confinement;
        self
    }

    pub fn confinement(&self) -> &Confinement {
        &self.confinement
    }

    /// Run `spec` to a terminal state under `limits`.
    ///
    /// Returns `Err` only when the process could not be started or the run was
    /// cancelled; limit violations and crashes are reported in the result.
    #[tracing::instrument(skip(self, spec, stdin, cancel), fields(program = %spec.program.display()))]
    pub async fn execute(
        &self,
        spec: &CommandSpec,
        limits: &ResourceLimits,
        stdin: &[u8],
        cancel: &CancellationToken,
    ) -> Result<ProcessReport> {
        let mut state = State::Pending;
        let output_cap = limits.max_output_bytes as usize;
        let kernel_limits = KernelLimits::new(limits, spec.limit_data_segment);
        let ruleset = self
            .confinement
            .prepare(&spec.writable)
            .map_err(|e| ExecutorError::Internal(format!("landlock ruleset: {}", e)))?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        // SAFETY: the closure only issues setrlimit, prctl and landlock
        // syscalls and takes a lock nothing else holds.
        unsafe {
            cmd.pre_exec(move || {
                kernel_limits.apply()?;
                match &ruleset {
                    Some(ruleset) => ruleset.enforce(),
                    None => Ok(()),
                }
            });
        }

        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }

        let mut child = cmd.spawn().map_err(|e| ExecutorError::Spawn {
            program: spec.program.display().to_string(),
            kind: e.kind(),
            message: e.to_string(),
        })?;
        let pgid = child
            .id()
            .ok_or_else(|| ExecutorError::Internal("child exited before its pid was read".into()))?
            as i32;
        let mut guard = TreeGuard { pgid, armed: true };
        let start = Instant::now();
        state = match state {
            State::Pending => State::Running,
            other => other,
        };
        debug!(pgid, ?state, "process started");

        let stdout_buf: SharedCapture = Arc::new(Mutex::new(CaptureBuffer::new(output_cap)));
        let stderr_buf: SharedCapture = Arc::new(Mutex::new(CaptureBuffer::new(output_cap)));
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(capture(out, stdout_buf.clone())));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(capture(err, stderr_buf.clone())));
        }
        if let Some(mut pipe) = child.stdin.take() {
            let input = stdin.to_vec();
            tokio::spawn(async move {
                // The program may exit without reading; a broken pipe is fine.
                let _ = pipe.write_all(&input).await;
                let _ = pipe.shutdown().await;
            });
        }

        let deadline = tokio::time::Instant::now() + Duration::from_millis(limits.wall_timeout_ms);
        let cpu_budget = Duration::from_secs(limits.cpu_time_secs);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut violation: Option<(ExecutionStatus, LimitViolation)> = None;
        let mut exit_status = None;

        while exit_status.is_none() && violation.is_none() {
            tokio::select! {
                status = child.wait() => {
                    exit_status = Some(status?);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    violation = Some((ExecutionStatus::TimedOut, LimitViolation::WallClock));
                }
                _ = cancel.cancelled() => {
                    kill_tree(pgid).await;
                    let _ = child.wait().await;
                    guard.armed = false;
                    debug!(pgid, "process tree cancelled");
                    return Err(ExecutorError::Cancelled);
                }
                _ = ticker.tick() => {
                    let usage = tokio::task::spawn_blocking(move || process_tree::sample_tree(pgid))
                        .await
                        .unwrap_or_default();
                    if usage.processes > limits.max_processes as usize {
                        violation = Some((ExecutionStatus::LimitExceeded, LimitViolation::ProcessCount));
                    } else if usage.rss_bytes > limits.memory_bytes {
                        violation = Some((ExecutionStatus::LimitExceeded, LimitViolation::Memory));
                    } else if usage.cpu >= cpu_budget {
                        violation = Some((ExecutionStatus::TimedOut, LimitViolation::CpuTime));
                    }
                }
            }
        }

        // Whatever happened, nothing from this tree may outlive the call.
        kill_tree(pgid).await;
        let exit_status = match exit_status {
            Some(status) => status,
            None => child.wait().await?,
        };
        guard.armed = false;
        let duration = start.elapsed();

        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(DRAIN_GRACE, reader).await.is_err() {
                warn!(pgid, "output pipe still open after tree was killed");
                abort.abort();
            }
        }
        let (stdout, stdout_truncated) = take_capture(&stdout_buf);
        let (stderr, stderr_truncated) = take_capture(&stderr_buf);

        let exit_code = exit_status.code();
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            exit_status.signal()
        };

        let (status, violation) = match violation {
            Some((status, kind)) => (status, Some(kind)),
            None if refused_allocation(exit_code, &stderr, &spec.oom_markers) => {
                (ExecutionStatus::LimitExceeded, Some(LimitViolation::Memory))
            }
            None => classify_exit(exit_code, signal),
        };
        state = State::Finished(status);
        debug!(pgid, ?state, ?exit_code, ?signal, duration_ms = duration.as_millis() as u64, "process finished");

        Ok(ProcessReport {
            status,
            exit_code,
            signal,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            duration,
            violation,
            pgid,
        })
    }
}

/// Terminal state for a process that exited without the monitor stepping in
fn classify_exit(
    exit_code: Option<i32>,
    signal: Option<i32>,
) -> (ExecutionStatus, Option<LimitViolation>) {
    match (exit_code, signal) {
        (Some(_), _) => (ExecutionStatus::Completed, None),
        (None, Some(sig)) if sig == nix::sys::signal::Signal::SIGXCPU as i32 => {
            (ExecutionStatus::TimedOut, Some(LimitViolation::CpuTime))
        }
        _ => (ExecutionStatus::Crashed, None),
    }
}

/// An abnormal exit whose stderr shows the runtime running out of memory.
///
/// RLIMIT_DATA sits above the memory ceiling, so an allocation the kernel
/// refuses was already over it.
fn refused_allocation(exit_code: Option<i32>, stderr: &[u8], markers: &[String]) -> bool {
    if exit_code == Some(0) {
        return false;
    }
    let stderr = String::from_utf8_lossy(stderr);
    markers.iter().any(|m| !m.is_empty() && stderr.contains(m.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            env: Vec::new(),
            limit_data_segment: false,
            writable: Vec::new(),
            oom_markers: Vec::new(),
        }
    }

    fn limits(wall_timeout_ms: u64, max_processes: u32) -> ResourceLimits {
        ResourceLimits {
            cpu_time_secs: 5,
            max_processes,
            memory_bytes: 512 * 1024 * 1024,
            wall_timeout_ms,
            max_output_bytes: 64 * 1024,
        }
    }

    #[test]
    fn test_capture_buffer_truncates() {
        let mut buf = CaptureBuffer::new(5);
        buf.push(b"abc");
        assert!(!buf.truncated);
        buf.push(b"defg");
        assert!(buf.truncated);
        assert_eq!(buf.data, b"abcde");
        buf.push(b"more");
        assert_eq!(buf.data, b"abcde");
    }

    #[test]
    fn test_classify_exit() {
        assert_eq!(classify_exit(Some(42), None), (ExecutionStatus::Completed, None));
        assert_eq!(classify_exit(None, Some(11)), (ExecutionStatus::Crashed, None));
        assert_eq!(
            classify_exit(None, Some(nix::sys::signal::Signal::SIGXCPU as i32)),
            (ExecutionStatus::TimedOut, Some(LimitViolation::CpuTime))
        );
    }

    #[tokio::test]
    async fn test_exit_code_and_output() {
        let report = Supervisor::default()
            .execute(
                &sh("echo out; echo err >&2; exit 42"),
                &limits(5_000, 10),
                b"",
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.exit_code, Some(42));
        assert_eq!(report.stdout, b"out\n");
        assert_eq!(report.stderr, b"err\n");
        assert!(report.violation.is_none());
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let report = Supervisor::default()
            .execute(&sh("cat"), &limits(5_000, 10), b"hello sandbox", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.stdout, b"hello sandbox");
    }

    #[tokio::test]
    async fn test_environment_is_scrubbed() {
        std::env::set_var("SENTINEL_SUPERVISOR_SECRET", "leak");
        let report = Supervisor::default()
            .execute(
                &sh("echo \"[$SENTINEL_SUPERVISOR_SECRET]\""),
                &limits(5_000, 10),
                b"",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.stdout, b"[]\n");
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let started = Instant::now();
        let report = Supervisor::default()
            .execute(&sh("while :; do :; done"), &limits(300, 10), b"", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, ExecutionStatus::TimedOut);
        assert_eq!(report.violation, Some(LimitViolation::WallClock));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_fork_explosion_is_stopped_and_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let pids = dir.path().join("pids");
        let script = format!(
            "for i in $(seq 1 40); do sleep 30 & echo $! >> {}; done; wait",
            pids.display()
        );

        let report = Supervisor::default()
            .execute(&sh(&script), &limits(10_000, 5), b"", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, ExecutionStatus::LimitExceeded);
        assert_eq!(report.violation, Some(LimitViolation::ProcessCount));

        let recorded = std::fs::read_to_string(&pids).unwrap_or_default();
        for pid in recorded.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
            assert!(!process_tree::is_running(pid), "descendant {} survived", pid);
        }
        assert!(process_tree::tree_members(report.pgid, &process_tree::snapshot()).is_empty());
    }

    #[tokio::test]
    async fn test_background_children_do_not_outlive_parent() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bg");
        let script = format!("sleep 30 & echo $! > {}; exit 0", pid_file.display());

        let report = Supervisor::default()
            .execute(&sh(&script), &limits(5_000, 10), b"", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, ExecutionStatus::Completed);

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(!process_tree::is_running(pid));
    }

    #[tokio::test]
    async fn test_runaway_output_is_truncated() {
        let mut l = limits(5_000, 10);
        l.max_output_bytes = 1024;
        let report = Supervisor::default()
            .execute(&sh("yes sentinel | head -c 1000000"), &l, b"", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.stdout.len(), 1024);
        assert!(report.stdout_truncated);
        assert!(!report.stderr_truncated);
    }

    #[tokio::test]
    async fn test_cpu_budget_is_enforced() {
        let mut l = limits(10_000, 10);
        l.cpu_time_secs = 1;
        let report = Supervisor::default()
            .execute(&sh("while :; do :; done"), &l, b"", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, ExecutionStatus::TimedOut);
        assert_eq!(report.violation, Some(LimitViolation::CpuTime));
    }

    #[test]
    fn test_refused_allocation_needs_marker_and_failure() {
        let markers = vec!["std::bad_alloc".to_string()];
        let stderr = b"terminate called after throwing an instance of 'std::bad_alloc'\n";
        assert!(refused_allocation(None, stderr, &markers));
        assert!(refused_allocation(Some(134), stderr, &markers));
        assert!(!refused_allocation(Some(0), stderr, &markers));
        assert!(!refused_allocation(None, b"Segmentation fault\n", &markers));
        assert!(!refused_allocation(None, stderr, &[]));
    }

    #[tokio::test]
    async fn test_memory_ceiling_with_data_limit() {
        let mut spec = sh(r#"x=$(head -c 200000000 /dev/zero | tr '\0' a); echo "${#x}""#);
        spec.limit_data_segment = true;
        let mut l = limits(20_000, 10);
        l.memory_bytes = 16 * 1024 * 1024;

        let report = Supervisor::default()
            .execute(&spec, &l, b"", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, ExecutionStatus::LimitExceeded);
        assert_eq!(report.violation, Some(LimitViolation::Memory));
        assert!(process_tree::tree_members(report.pgid, &process_tree::snapshot()).is_empty());
    }

    #[tokio::test]
    async fn test_out_of_memory_abort_is_memory_violation() {
        let mut spec = sh("echo \"terminate called after throwing an instance of 'std::bad_alloc'\" >&2; kill -ABRT $$");
        spec.limit_data_segment = true;
        spec.oom_markers = vec!["std::bad_alloc".to_string()];

        let report = Supervisor::default()
            .execute(&spec, &limits(5_000, 10), b"", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, ExecutionStatus::LimitExceeded);
        assert_eq!(report.violation, Some(LimitViolation::Memory));
        assert_eq!(report.signal, Some(6));
    }

    #[tokio::test]
    async fn test_confined_command_cannot_write_outside() {
        if !crate::confine::is_supported() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let own = dir.path().join("own");
        std::fs::create_dir(&own).unwrap();
        let outside = dir.path().join("outside");

        let mut spec = sh(&format!("echo a > {}/ok; echo b > {}", own.display(), outside.display()));
        spec.writable = vec![own.clone()];
        let report = Supervisor::default()
            .with_confinement(Confinement::landlock(Vec::new()))
            .execute(&spec, &limits(5_000, 10), b"", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_ne!(report.exit_code, Some(0));
        assert!(own.join("ok").exists());
        assert!(!outside.exists());
    }

    #[tokio::test]
    async fn test_crash_by_signal() {
        let report = Supervisor::default()
            .execute(&sh("kill -SEGV $$"), &limits(5_000, 10), b"", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, ExecutionStatus::Crashed);
        assert_eq!(report.signal, Some(11));
        assert!(report.exit_code.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_kills_tree() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = Supervisor::default()
            .execute(&sh("sleep 30"), &limits(60_000, 10), b"", &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let spec = CommandSpec {
            program: PathBuf::from("/nonexistent/sentinel-compiler"),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
            env: Vec::new(),
            limit_data_segment: true,
            writable: Vec::new(),
            oom_markers: Vec::new(),
        };
        let err = Supervisor::default()
            .execute(&spec, &limits(1_000, 10), b"", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::Spawn { kind: std::io::ErrorKind::NotFound, .. }
        ));
    }
}
