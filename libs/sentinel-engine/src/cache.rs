/// Result Cache - content-addressed build artifacts
///
/// **Entry layout:** `<cache>/<key>/` holds the artifact files plus an
/// `entry.json` manifest with the SHA-256 of every file. Entries appear by
/// atomic rename of a fully written `.tmp-<uuid>` directory, so readers never
/// observe a partial entry. An entry whose manifest is missing or whose
/// digests no longer match is treated as a miss, logged and removed.
///
/// **Single-flight:** concurrent `get_or_build` calls for one key share a
/// single build. The first caller becomes the leader and publishes its
/// outcome on a watch channel; the others wait on it. If the leader is
/// dropped mid-build, a waiter takes over.
use crate::error::{ExecutorError, Result};
use crate::workspace::force_remove_dir;
use chrono::{DateTime, Utc};
use sentinel_common::types::Language;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MANIFEST: &str = "entry.json";
const TEMP_PREFIX: &str = ".tmp-";

/// Hex SHA-256 over (language, toolchain version, flags, source)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn derive(language: Language, toolchain_version: &str, flags: &[String], source: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };
        field(language.as_str().as_bytes());
        field(toolchain_version.as_bytes());
        field(&(flags.len() as u64).to_le_bytes());
        for flag in flags {
            field(flag.as_bytes());
        }
        field(source);
        CacheKey(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who produced an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub language: Language,
    pub toolchain_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    key: String,
    #[serde(flatten)]
    meta: EntryMeta,
    created_at: DateTime<Utc>,
    files: BTreeMap<String, String>,
}

/// A verified cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub key: CacheKey,
    pub dir: PathBuf,
}

type BuildOutcome = Result<Artifact>;

#[derive(Debug)]
pub struct ArtifactCache {
    root: PathBuf,
    inflight: Mutex<HashMap<CacheKey, watch::Receiver<Option<BuildOutcome>>>>,
}

/// Removes the leader's in-flight slot however the build ends
struct InflightSlot<'a> {
    cache: &'a ArtifactCache,
    key: CacheKey,
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        self.cache
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

enum Role {
    Leader(watch::Sender<Option<BuildOutcome>>),
    Follower(watch::Receiver<Option<BuildOutcome>>),
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_ready(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| {
            ExecutorError::ScratchUnavailable(format!("cache directory {}: {}", self.root.display(), e))
        })
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    /// Verified entry for `key`, or None on a miss.
    /// Corrupt entries are removed and reported as misses.
    pub async fn lookup(&self, key: &CacheKey) -> Option<Artifact> {
        let dir = self.entry_dir(key);
        let owned_key = key.clone();
        let verified = tokio::task::spawn_blocking(move || verify_entry(&owned_key, &dir))
            .await
            .unwrap_or_else(|e| Err(ExecutorError::Internal(e.to_string())));

        match verified {
            Ok(Some(artifact)) => Some(artifact),
            Ok(None) => None,
            Err(err) => {
                warn!(cache_key = %key, error = %err, "discarding corrupt cache entry");
                let dir = self.entry_dir(key);
                let _ = tokio::task::spawn_blocking(move || discard(&dir)).await;
                None
            }
        }
    }

    /// Atomically publish the contents of `build_dir` under `key`
    pub async fn insert(&self, key: &CacheKey, build_dir: &Path, meta: EntryMeta) -> Result<Artifact> {
        let root = self.root.clone();
        let key = key.clone();
        let build_dir = build_dir.to_path_buf();
        tokio::task::spawn_blocking(move || insert_entry(&root, &key, &build_dir, meta))
            .await
            .map_err(|e| ExecutorError::Internal(format!("cache insert task failed: {}", e)))?
    }

    /// Return the cached artifact for `key`, building it at most once across
    /// concurrent callers. The flag is true when this caller did not build.
    ///
    /// `build` returns the directory holding the freshly built files.
    pub async fn get_or_build<F, Fut>(&self, key: &CacheKey, meta: EntryMeta, build: F) -> Result<(Artifact, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PathBuf>>,
    {
        let mut build = Some(build);
        loop {
            if let Some(artifact) = self.lookup(key).await {
                debug!(cache_key = %key, "cache hit");
                return Ok((artifact, true));
            }

            let role = {
                let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
                match inflight.get(key) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        inflight.insert(key.clone(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Follower(mut rx) => {
                    debug!(cache_key = %key, "waiting on in-flight build");
                    let published = match rx.wait_for(|outcome| outcome.is_some()).await {
                        Ok(outcome) => outcome.clone(),
                        // Leader went away without publishing; compete again
                        Err(_) => continue,
                    };
                    if let Some(outcome) = published {
                        return outcome.map(|artifact| (artifact, true));
                    }
                }
                Role::Leader(tx) => {
                    let _slot = InflightSlot {
                        cache: self,
                        key: key.clone(),
                    };

                    // Another worker may have finished between lookup and lock
                    if let Some(artifact) = self.lookup(key).await {
                        tx.send_replace(Some(Ok(artifact.clone())));
                        return Ok((artifact, true));
                    }

                    let build = build
                        .take()
                        .ok_or_else(|| ExecutorError::Internal("build closure already consumed".into()))?;
                    info!(cache_key = %key, language = %meta.language, "cache miss, building");
                    let outcome = match build().await {
                        Ok(build_dir) => self.insert(key, &build_dir, meta.clone()).await,
                        Err(e) => Err(e),
                    };
                    // A cancelled build says nothing about the source; waiters
                    // see the channel close and one of them builds instead.
                    if matches!(outcome, Err(ExecutorError::Cancelled)) {
                        return Err(ExecutorError::Cancelled);
                    }
                    tx.send_replace(Some(outcome.clone()));
                    return outcome.map(|artifact| (artifact, false));
                }
            }
        }
    }

    /// Copy an artifact into `dest` so the program cannot touch cached bytes
    pub async fn stage(&self, artifact: &Artifact, dest: &Path) -> Result<()> {
        let src = artifact.dir.clone();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&src, &dest, true))
            .await
            .map_err(|e| ExecutorError::Internal(format!("stage task failed: {}", e)))?
            .map_err(ExecutorError::from)
    }

    /// Remove temporary directories abandoned by interrupted inserts
    pub fn sweep_temp(&self, max_age: Duration) -> usize {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(TEMP_PREFIX) {
                continue;
            }
            let old = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|m| m.elapsed().ok())
                .map(|age| age > max_age)
                .unwrap_or(true);
            if old && force_remove_dir(&entry.path()).is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

fn corrupt(key: &CacheKey, reason: impl Into<String>) -> ExecutorError {
    ExecutorError::CacheCorruption {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn verify_entry(key: &CacheKey, dir: &Path) -> Result<Option<Artifact>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let raw = fs::read(dir.join(MANIFEST)).map_err(|e| corrupt(key, format!("manifest unreadable: {}", e)))?;
    let manifest: Manifest =
        serde_json::from_slice(&raw).map_err(|e| corrupt(key, format!("manifest invalid: {}", e)))?;
    if manifest.key != key.as_str() {
        return Err(corrupt(key, format!("manifest belongs to {}", manifest.key)));
    }
    if manifest.files.is_empty() {
        return Err(corrupt(key, "manifest lists no files"));
    }
    for (relative, expected) in &manifest.files {
        let actual = hash_file(&dir.join(relative)).map_err(|e| corrupt(key, format!("{}: {}", relative, e)))?;
        if &actual != expected {
            return Err(corrupt(key, format!("{} digest mismatch", relative)));
        }
    }
    Ok(Some(Artifact {
        key: key.clone(),
        dir: dir.to_path_buf(),
    }))
}

fn discard(dir: &Path) {
    // Move aside first so a concurrent insert can take the name immediately
    let Some(root) = dir.parent() else {
        return;
    };
    let aside = root.join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4().simple()));
    let target = if fs::rename(dir, &aside).is_ok() { aside } else { dir.to_path_buf() };
    let _ = force_remove_dir(&target);
}

fn insert_entry(root: &Path, key: &CacheKey, build_dir: &Path, meta: EntryMeta) -> Result<Artifact> {
    let temp = root.join(format!("{}{}", TEMP_PREFIX, Uuid::new_v4().simple()));
    let result = write_temp_entry(key, build_dir, &temp, meta).and_then(|()| publish(root, key, &temp));
    if temp.exists() {
        let _ = force_remove_dir(&temp);
    }
    result
}

fn write_temp_entry(key: &CacheKey, build_dir: &Path, temp: &Path, meta: EntryMeta) -> Result<()> {
    copy_tree(build_dir, temp, false)?;

    let mut files = BTreeMap::new();
    collect_digests(temp, temp, &mut files)?;
    if files.is_empty() {
        return Err(ExecutorError::Internal(format!(
            "build for {} produced no files in {}",
            key,
            build_dir.display()
        )));
    }

    let manifest = Manifest {
        key: key.to_string(),
        meta,
        created_at: Utc::now(),
        files,
    };
    let payload = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| ExecutorError::Internal(format!("manifest encoding failed: {}", e)))?;
    let manifest_path = temp.join(MANIFEST);
    fs::write(&manifest_path, payload)?;
    fs::File::open(&manifest_path)?.sync_all()?;
    Ok(())
}

fn publish(root: &Path, key: &CacheKey, temp: &Path) -> Result<Artifact> {
    let dest = root.join(key.as_str());
    for _ in 0..2 {
        match fs::rename(temp, &dest) {
            Ok(()) => {
                return Ok(Artifact {
                    key: key.clone(),
                    dir: dest,
                })
            }
            Err(e) if dest.exists() => {
                // Lost a race with another process; keep theirs if it is sound
                match verify_entry(key, &dest) {
                    Ok(Some(artifact)) => return Ok(artifact),
                    Ok(None) | Err(_) => {
                        debug!(cache_key = %key, error = %e, "replacing unusable entry");
                        discard(&dest);
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ExecutorError::Internal(format!("could not publish cache entry {}", key)))
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn collect_digests(base: &Path, dir: &Path, out: &mut BTreeMap<String, String>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_digests(base, &path, out)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(base)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
                .to_string_lossy()
                .into_owned();
            if relative != MANIFEST {
                out.insert(relative, hash_file(&path)?);
            }
        }
    }
    Ok(())
}

/// Recursive copy of regular files and directories; symlinks are skipped
fn copy_tree(src: &Path, dest: &Path, skip_manifest: bool) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let name = entry.file_name();
        if skip_manifest && name == MANIFEST {
            continue;
        }
        let target = dest.join(&name);
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target, false)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
