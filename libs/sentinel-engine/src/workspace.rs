/// Sandbox Provisioner - per-submission workspaces under the scratch root
///
/// **Layout:**
/// `<scratch>/<owner-pid>-<created-unix-secs>-<uuid>/{src,build,bin,run}`
///
/// The owner pid and creation time live in the directory name so the cleanup
/// sweep can decide whether a workspace is orphaned without trusting anything
/// the sandboxed program could have written.
///
/// **Release:** a [`Workspace`] deletes its directory when dropped, so every
/// exit path (error, panic, cancellation) tears it down. The sweep is the
/// safety net for a worker that died without running destructors.
use crate::error::{ExecutorError, Result};
use nix::sys::signal::kill;
use nix::sys::statvfs::statvfs;
use nix::unistd::Pid;
use sentinel_common::types::Submission;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

const NAME_ATTEMPTS: usize = 4;

#[derive(Debug, Clone)]
pub struct ScratchLimits {
    pub max_workspaces: usize,
    pub tenant_quota: usize,
    pub min_free_bytes: u64,
}

impl Default for ScratchLimits {
    fn default() -> Self {
        Self {
            max_workspaces: 64,
            tenant_quota: 4,
            min_free_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Default)]
struct Occupancy {
    total: usize,
    per_tenant: HashMap<String, usize>,
}

impl Occupancy {
    fn release(&mut self, tenant: &str) {
        self.total = self.total.saturating_sub(1);
        if let Some(count) = self.per_tenant.get_mut(tenant) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_tenant.remove(tenant);
            }
        }
    }
}

/// Shared scratch root handed to the executor
#[derive(Debug, Clone)]
pub struct ScratchSpace {
    root: PathBuf,
    limits: ScratchLimits,
    occupancy: Arc<Mutex<Occupancy>>,
}

impl ScratchSpace {
    pub fn new(root: impl Into<PathBuf>, limits: ScratchLimits) -> Self {
        Self {
            root: root.into(),
            limits,
            occupancy: Arc::new(Mutex::new(Occupancy::default())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of workspaces currently provisioned by this process
    pub fn active(&self) -> usize {
        self.lock().total
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Occupancy> {
        self.occupancy.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check that the scratch root exists and is writable
    pub fn ensure_ready(&self) -> Result<()> {
        let unavailable =
            |e: std::io::Error| ExecutorError::ScratchUnavailable(format!("{}: {}", self.root.display(), e));

        fs::create_dir_all(&self.root).map_err(unavailable)?;
        let probe = self.root.join(format!(".probe-{}", Uuid::new_v4().simple()));
        fs::write(&probe, b"").map_err(unavailable)?;
        fs::remove_file(&probe).map_err(unavailable)?;
        Ok(())
    }

    fn free_bytes(&self) -> Result<u64> {
        let stat = statvfs(&self.root)
            .map_err(|e| ExecutorError::ScratchUnavailable(format!("statvfs {}: {}", self.root.display(), e)))?;
        Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
    }

    /// Allocate a fresh workspace for `submission`
    #[tracing::instrument(skip(self, submission), fields(submission_id = %submission.id, tenant = %submission.tenant))]
    pub async fn provision(&self, submission: &Submission) -> Result<Workspace> {
        {
            let mut occupancy = self.lock();
            if occupancy.total >= self.limits.max_workspaces {
                return Err(ExecutorError::ResourceExhausted(format!(
                    "scratch root holds {} workspaces (limit {})",
                    occupancy.total, self.limits.max_workspaces
                )));
            }
            let tenant_count = occupancy.per_tenant.get(&submission.tenant).copied().unwrap_or(0);
            if tenant_count >= self.limits.tenant_quota {
                return Err(ExecutorError::ResourceExhausted(format!(
                    "tenant '{}' already holds {} workspaces (quota {})",
                    submission.tenant, tenant_count, self.limits.tenant_quota
                )));
            }
            occupancy.total += 1;
            *occupancy.per_tenant.entry(submission.tenant.clone()).or_insert(0) += 1;
        }

        // From here on the reservation is owned by the workspace value and
        // released by its Drop, including on the error paths below.
        let mut workspace = Workspace {
            path: PathBuf::new(),
            tenant: submission.tenant.clone(),
            occupancy: self.occupancy.clone(),
            released: true,
        };

        let free = self.free_bytes()?;
        if free < self.limits.min_free_bytes {
            return Err(ExecutorError::ResourceExhausted(format!(
                "scratch filesystem has {} bytes free (floor {})",
                free, self.limits.min_free_bytes
            )));
        }

        let mut attempts = 0;
        let path = loop {
            attempts += 1;
            let candidate = self.root.join(workspace_name(std::process::id(), now_secs(), Uuid::new_v4()));
            match tokio::fs::create_dir(&candidate).await {
                Ok(()) => break candidate,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempts < NAME_ATTEMPTS => {
                    warn!(path = %candidate.display(), "workspace name collision, retrying");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ExecutorError::ScratchUnavailable(format!(
                        "{}: {}",
                        self.root.display(),
                        e
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        };
        workspace.path = path;
        workspace.released = false;

        tokio::fs::set_permissions(&workspace.path, fs::Permissions::from_mode(0o700)).await?;
        for dir in [workspace.src_dir(), workspace.build_dir(), workspace.bin_dir(), workspace.run_dir()] {
            tokio::fs::create_dir(&dir).await?;
        }

        debug!(path = %workspace.path.display(), "workspace provisioned");
        Ok(workspace)
    }

    /// Remove workspaces left behind by dead workers or older than `max_age`
    pub fn sweep(&self, max_age: Duration) -> SweepReport {
        sweep_workspaces(&self.root, max_age)
    }
}

/// One submission's exclusively owned directory
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    tenant: String,
    occupancy: Arc<Mutex<Occupancy>>,
    released: bool,
}

impl Workspace {
    pub fn root(&self) -> &Path {
        &self.path
    }

    pub fn src_dir(&self) -> PathBuf {
        self.path.join("src")
    }

    pub fn build_dir(&self) -> PathBuf {
        self.path.join("build")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.path.join("bin")
    }

    /// Working directory of the sandboxed program
    pub fn run_dir(&self) -> PathBuf {
        self.path.join("run")
    }

    pub async fn write_source(&self, file_name: &str, source: &[u8]) -> Result<PathBuf> {
        let path = self.src_dir().join(file_name);
        tokio::fs::write(&path, source).await?;
        Ok(path)
    }

    /// Delete the directory now instead of at drop time
    pub async fn release(mut self) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || force_remove_dir(&path))
            .await
            .map_err(|e| ExecutorError::Internal(format!("workspace cleanup task failed: {}", e)))??;
        self.released = true;
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = force_remove_dir(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to remove workspace");
            }
        }
        self.occupancy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .release(&self.tenant);
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn workspace_name(pid: u32, created: u64, id: Uuid) -> String {
    format!("{}-{}-{}", pid, created, id.simple())
}

fn parse_workspace_name(name: &str) -> Option<(i32, u64)> {
    let mut parts = name.splitn(3, '-');
    let pid = parts.next()?.parse().ok()?;
    let created = parts.next()?.parse().ok()?;
    let id = parts.next()?;
    Uuid::parse_str(id).ok()?;
    Some((pid, created))
}

fn owner_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Remove a directory tree even if the sandboxed program stripped its own
/// write permissions.
pub(crate) fn force_remove_dir(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            restore_permissions(path);
            fs::remove_dir_all(path)
        }
        Err(e) => Err(e),
    }
}

fn restore_permissions(path: &Path) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    if meta.is_dir() {
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o700));
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                restore_permissions(&entry.path());
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub kept: usize,
    pub failed: usize,
}

/// Cleanup sweep over a scratch root
pub fn sweep_workspaces(root: &Path, max_age: Duration) -> SweepReport {
    let mut report = SweepReport::default();
    let Ok(entries) = fs::read_dir(root) else {
        return report;
    };
    let now = now_secs();
    let me = std::process::id() as i32;

    for entry in entries.flatten() {
        let path = entry.path();
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();

        let stale = match parse_workspace_name(&name) {
            Some((pid, created)) => {
                let expired = now.saturating_sub(created) > max_age.as_secs();
                expired || (pid != me && !owner_alive(pid))
            }
            None => entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|m| m.elapsed().ok())
                .map(|age| age > max_age)
                .unwrap_or(false),
        };

        if !stale {
            report.kept += 1;
            continue;
        }
        match force_remove_dir(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "swept stale workspace");
                report.removed += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to sweep workspace");
                report.failed += 1;
            }
        }
    }

    if report.removed > 0 || report.failed > 0 {
        info!(
            removed = report.removed,
            kept = report.kept,
            failed = report.failed,
            root = %root.display(),
            "workspace sweep finished"
        );
    }
    report
}
