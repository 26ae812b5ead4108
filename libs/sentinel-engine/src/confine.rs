// Filesystem confinement for sandboxed processes.
//
// Landlock lets the child read the whole filesystem but write only beneath
// its own workspace (plus a few character devices and any operator-configured
// paths). The ruleset is built in the parent and only enforced between fork
// and exec.

use landlock::{
    path_beneath_rules, Access, AccessFs, CompatLevel, Compatible, Ruleset, RulesetAttr, RulesetCreated,
    RulesetCreatedAttr, RulesetError, RulesetStatus, ABI,
};
use nix::errno::Errno;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, OnceLock};
use tracing::{debug, warn};

const LANDLOCK_ABI: ABI = ABI::V5;
const WRITABLE_DEVICES: &[&str] = &["/dev/null", "/dev/zero", "/dev/full"];

/// Which writes a supervised process may perform
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Confinement {
    enabled: bool,
    extra_writable: Vec<PathBuf>,
}

impl Confinement {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Confine writes to the command's own paths plus `extra_writable`.
    /// Spawning fails if the kernel cannot enforce it.
    pub fn landlock(extra_writable: Vec<PathBuf>) -> Self {
        Self {
            enabled: true,
            extra_writable,
        }
    }

    /// Landlock where the kernel supports it, otherwise nothing
    pub fn detect(extra_writable: Vec<PathBuf>) -> Self {
        if is_supported() {
            Self::landlock(extra_writable)
        } else {
            warn!("Landlock is not available on this kernel; sandboxed programs can write outside their workspace");
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Ruleset for a command that may write beneath `writable`
    pub(crate) fn prepare(&self, writable: &[PathBuf]) -> Result<Option<PendingRuleset>, RulesetError> {
        if !self.enabled {
            return Ok(None);
        }
        let paths: Vec<&Path> = writable
            .iter()
            .chain(self.extra_writable.iter())
            .map(PathBuf::as_path)
            .collect();
        Ok(Some(PendingRuleset(Mutex::new(Some(build_ruleset(&paths)?)))))
    }
}

/// A created ruleset waiting to be applied in the child
pub(crate) struct PendingRuleset(Mutex<Option<RulesetCreated>>);

impl PendingRuleset {
    /// Restrict the calling process. Runs inside `pre_exec`.
    pub(crate) fn enforce(&self) -> io::Result<()> {
        let ruleset = self.0.lock().unwrap_or_else(|e| e.into_inner()).take();
        match ruleset.map(RulesetCreated::restrict_self) {
            Some(Ok(status)) if status.ruleset != RulesetStatus::NotEnforced => Ok(()),
            _ => Err(io::Error::from_raw_os_error(Errno::EPERM as i32)),
        }
    }
}

fn build_ruleset(writable: &[&Path]) -> Result<RulesetCreated, RulesetError> {
    let read = AccessFs::from_read(LANDLOCK_ABI);
    let all = AccessFs::from_all(LANDLOCK_ABI);

    Ruleset::default()
        .set_compatibility(CompatLevel::BestEffort)
        .handle_access(all)?
        .create()?
        .add_rules(path_beneath_rules(&["/"], read))?
        .add_rules(path_beneath_rules(WRITABLE_DEVICES, all))?
        .add_rules(path_beneath_rules(writable, all))
}

/// Whether this kernel enforces Landlock, checked once per process
pub fn is_supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| {
        let pending = match Confinement::landlock(Vec::new()).prepare(&[]) {
            Ok(Some(pending)) => pending,
            Ok(None) => return false,
            Err(e) => {
                debug!(error = %e, "Landlock ruleset could not be created");
                return false;
            }
        };

        let mut cmd = std::process::Command::new("/bin/sh");
        cmd.args(["-c", "exit 0"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: enforce only takes an uncontended lock and issues the
        // landlock and prctl syscalls.
        unsafe {
            cmd.pre_exec(move || pending.enforce());
        }
        matches!(cmd.status(), Ok(status) if status.success())
    })
}
