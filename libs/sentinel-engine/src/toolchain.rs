// Toolchain configuration, adapters and the per-language registry.
//
// Toolchains are described in config/languages.json. Each entry names the
// source file the submission is written to, an optional compile step and the
// run command. Argument templates may use `{source}`, `{artifact_dir}` and
// `{workspace}`.
use crate::error::{ExecutorError, Result};
use crate::supervisor::{CommandSpec, Supervisor, SANDBOX_PATH};
use crate::workspace::Workspace;
use anyhow::{bail, Context};
use async_trait::async_trait;
use sentinel_common::types::{ExecutionStatus, Language, LimitViolation, ResourceLimits};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Compiler diagnostics kept for the caller
pub const DIAGNOSTICS_LIMIT: u64 = 64 * 1024;
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

fn default_compile_cpu_secs() -> u64 {
    10
}

fn default_compile_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileStep {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_compile_cpu_secs")]
    pub cpu_time_secs: u64,
    #[serde(default = "default_compile_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainConfig {
    pub language: Language,
    /// Label shown to operators; the probed version goes into cache keys
    pub version: String,
    pub source_file: String,
    pub version_command: CommandTemplate,
    #[serde(default)]
    pub compile: Option<CompileStep>,
    pub run: CommandTemplate,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub limit_data_segment: bool,
    /// stderr text the runtime prints when an allocation is refused
    #[serde(default)]
    pub oom_markers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<ToolchainConfig>,
}

/// Toolchain configuration manager
#[derive(Debug, Clone)]
pub struct ToolchainConfigManager {
    configs: HashMap<Language, ToolchainConfig>,
}

impl ToolchainConfigManager {
    /// Load toolchain configurations from languages.json
    pub fn load(config_path: &Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            bail!("Toolchain config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::from_json(&content).with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Load with default path (config/languages.json)
    pub fn load_default() -> anyhow::Result<Self> {
        Self::load(Path::new("config/languages.json"))
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let languages_json: LanguagesJson = serde_json::from_str(content)?;

        let mut configs = HashMap::new();
        for config in languages_json.languages {
            if config.source_file.is_empty() || config.source_file.contains('/') {
                bail!("{}: source_file must be a plain file name", config.language);
            }
            if let Some(previous) = configs.insert(config.language, config) {
                bail!("{} is configured more than once", previous.language);
            }
        }
        Ok(Self { configs })
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: Language) -> anyhow::Result<&ToolchainConfig> {
        self.configs
            .get(&language)
            .ok_or_else(|| anyhow::anyhow!("No toolchain configured for language: {}", language))
    }

    /// List all configured languages
    pub fn list_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.configs.keys().copied().collect();
        languages.sort_by_key(|l| l.as_str());
        languages
    }
}

/// Values substituted into command templates
struct Placeholders<'a> {
    source: &'a Path,
    artifact_dir: &'a Path,
    workspace: &'a Path,
}

impl Placeholders<'_> {
    fn render(&self, template: &str) -> String {
        template
            .replace("{source}", &self.source.to_string_lossy())
            .replace("{artifact_dir}", &self.artifact_dir.to_string_lossy())
            .replace("{workspace}", &self.workspace.to_string_lossy())
    }

    fn render_all(&self, templates: &[String]) -> Vec<String> {
        templates.iter().map(|t| self.render(t)).collect()
    }

    fn render_env(&self, env: &BTreeMap<String, String>) -> Vec<(String, String)> {
        env.iter().map(|(k, v)| (k.clone(), self.render(v))).collect()
    }
}

/// Language-specific build and run steps
#[async_trait]
pub trait ToolchainAdapter: Send + Sync {
    fn language(&self) -> Language;

    /// Pinned toolchain version, part of every cache key
    fn version(&self) -> &str;

    fn source_file(&self) -> &str;

    /// Everything besides the source that changes the build output
    fn compile_flags(&self) -> Vec<String>;

    fn is_compiled(&self) -> bool;

    /// Build the workspace's source, returning the directory holding the
    /// artifact files. Interpreted toolchains return the source directory.
    async fn build(
        &self,
        workspace: &Workspace,
        limits: &ResourceLimits,
        supervisor: &Supervisor,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;

    /// Invocation of the program whose artifacts sit in `artifact_dir`
    fn run_command(&self, workspace: &Workspace, artifact_dir: &Path) -> CommandSpec;
}

fn run_spec(config: &ToolchainConfig, workspace: &Workspace, artifact_dir: &Path) -> CommandSpec {
    let source = workspace.src_dir().join(&config.source_file);
    let placeholders = Placeholders {
        source: &source,
        artifact_dir,
        workspace: workspace.root(),
    };
    CommandSpec {
        program: PathBuf::from(placeholders.render(&config.run.command)),
        args: placeholders.render_all(&config.run.args),
        cwd: workspace.run_dir(),
        env: placeholders.render_env(&config.env),
        limit_data_segment: config.limit_data_segment,
        writable: vec![workspace.root().to_path_buf()],
        oom_markers: config.oom_markers.clone(),
    }
}

pub struct CompiledToolchain {
    config: ToolchainConfig,
    compile: CompileStep,
    version: String,
}

impl CompiledToolchain {
    fn build_limits(&self, limits: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            cpu_time_secs: self.compile.cpu_time_secs,
            wall_timeout_ms: self.compile.timeout_ms,
            max_processes: limits.max_processes,
            memory_bytes: limits.memory_bytes,
            max_output_bytes: DIAGNOSTICS_LIMIT,
        }
    }
}

#[async_trait]
impl ToolchainAdapter for CompiledToolchain {
    fn language(&self) -> Language {
        self.config.language
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn source_file(&self) -> &str {
        &self.config.source_file
    }

    fn compile_flags(&self) -> Vec<String> {
        let mut flags = vec![self.compile.command.clone()];
        flags.extend(self.compile.args.iter().cloned());
        flags
    }

    fn is_compiled(&self) -> bool {
        true
    }

    #[tracing::instrument(skip_all, fields(language = %self.config.language))]
    async fn build(
        &self,
        workspace: &Workspace,
        limits: &ResourceLimits,
        supervisor: &Supervisor,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let source = workspace.src_dir().join(&self.config.source_file);
        let artifact_dir = workspace.build_dir();
        let placeholders = Placeholders {
            source: &source,
            artifact_dir: &artifact_dir,
            workspace: workspace.root(),
        };
        let spec = CommandSpec {
            program: PathBuf::from(placeholders.render(&self.compile.command)),
            args: placeholders.render_all(&self.compile.args),
            cwd: artifact_dir.clone(),
            env: placeholders.render_env(&self.config.env),
            limit_data_segment: self.config.limit_data_segment,
            writable: vec![workspace.root().to_path_buf()],
            oom_markers: Vec::new(),
        };

        let report = match supervisor.execute(&spec, &self.build_limits(limits), b"", cancel).await {
            Ok(report) => report,
            Err(ExecutorError::Spawn { kind, message, .. }) if kind == std::io::ErrorKind::NotFound => {
                return Err(ExecutorError::ToolchainUnavailable {
                    language: self.config.language,
                    reason: format!("{}: {}", self.compile.command, message),
                });
            }
            Err(e) => return Err(e),
        };

        match report.status {
            ExecutionStatus::Completed if report.exit_code == Some(0) => Ok(artifact_dir),
            ExecutionStatus::Completed | ExecutionStatus::Crashed => {
                let mut diagnostics = String::from_utf8_lossy(&report.stderr).into_owned();
                if !report.stdout.is_empty() {
                    if !diagnostics.is_empty() && !diagnostics.ends_with('\n') {
                        diagnostics.push('\n');
                    }
                    diagnostics.push_str(&String::from_utf8_lossy(&report.stdout));
                }
                if let Some(signal) = report.signal {
                    diagnostics.push_str(&format!("\ncompiler terminated by signal {}", signal));
                }
                Err(ExecutorError::CompileError {
                    diagnostics,
                    truncated: report.stdout_truncated || report.stderr_truncated,
                })
            }
            ExecutionStatus::TimedOut => Err(ExecutorError::Timeout {
                violation: report.violation.unwrap_or(LimitViolation::WallClock),
            }),
            ExecutionStatus::LimitExceeded => Err(ExecutorError::LimitExceeded {
                violation: report.violation.unwrap_or(LimitViolation::Memory),
            }),
        }
    }

    fn run_command(&self, workspace: &Workspace, artifact_dir: &Path) -> CommandSpec {
        run_spec(&self.config, workspace, artifact_dir)
    }
}

pub struct InterpretedToolchain {
    config: ToolchainConfig,
    version: String,
}

#[async_trait]
impl ToolchainAdapter for InterpretedToolchain {
    fn language(&self) -> Language {
        self.config.language
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn source_file(&self) -> &str {
        &self.config.source_file
    }

    fn compile_flags(&self) -> Vec<String> {
        Vec::new()
    }

    fn is_compiled(&self) -> bool {
        false
    }

    async fn build(
        &self,
        workspace: &Workspace,
        _limits: &ResourceLimits,
        _supervisor: &Supervisor,
        _cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        Ok(workspace.src_dir())
    }

    fn run_command(&self, workspace: &Workspace, artifact_dir: &Path) -> CommandSpec {
        run_spec(&self.config, workspace, artifact_dir)
    }
}

/// Build the adapter for `config` with an already pinned version
pub fn adapter_for(config: ToolchainConfig, version: String) -> Arc<dyn ToolchainAdapter> {
    match config.compile.clone() {
        Some(compile) => Arc::new(CompiledToolchain {
            config,
            compile,
            version,
        }),
        None => Arc::new(InterpretedToolchain { config, version }),
    }
}

/// Run the version command and return the first line it prints
pub async fn probe_version(config: &ToolchainConfig) -> Result<String> {
    let unavailable = |reason: String| ExecutorError::ToolchainUnavailable {
        language: config.language,
        reason,
    };

    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        tokio::process::Command::new(&config.version_command.command)
            .args(&config.version_command.args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| unavailable(format!("{} did not answer within {:?}", config.version_command.command, PROBE_TIMEOUT)))?
    .map_err(|e| unavailable(format!("{}: {}", config.version_command.command, e)))?;

    if !output.status.success() {
        return Err(unavailable(format!(
            "{} exited with {}",
            config.version_command.command, output.status
        )));
    }

    // Some toolchains (older javac) print their version on stderr
    let text = if output.stdout.iter().any(|b| !b.is_ascii_whitespace()) {
        output.stdout
    } else {
        output.stderr
    };
    let line = String::from_utf8_lossy(&text)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .ok_or_else(|| unavailable(format!("{} printed no version", config.version_command.command)))?;

    Ok(format!("{} ({})", config.version, line))
}

/// Make sure the compiler and the runtime can be found on the sandbox PATH.
///
/// The version command alone is not enough: `javac` may answer while `java`
/// is missing. Commands built from placeholders are produced by the build.
pub fn check_programs(config: &ToolchainConfig) -> Result<()> {
    let programs = config
        .compile
        .iter()
        .map(|c| c.command.as_str())
        .chain(std::iter::once(config.run.command.as_str()))
        .filter(|program| !program.contains('{'));

    for program in programs {
        which::which_in(program, Some(SANDBOX_PATH), "/").map_err(|e| ExecutorError::ToolchainUnavailable {
            language: config.language,
            reason: format!("{}: {}", program, e),
        })?;
    }
    Ok(())
}

/// Adapters keyed by language, resolved once at startup
#[derive(Clone, Default)]
pub struct ToolchainRegistry {
    adapters: HashMap<Language, Arc<dyn ToolchainAdapter>>,
    unavailable: HashMap<Language, String>,
}

impl ToolchainRegistry {
    /// Probe every requested language; failures are recorded, not returned
    pub async fn probe(manager: &ToolchainConfigManager, languages: &[Language]) -> Self {
        let mut registry = Self::default();
        for &language in languages {
            let config = match manager.get_config(language) {
                Ok(config) => config.clone(),
                Err(e) => {
                    warn!(%language, error = %e, "toolchain not configured");
                    registry.unavailable.insert(language, e.to_string());
                    continue;
                }
            };
            let probed = match check_programs(&config) {
                Ok(()) => probe_version(&config).await,
                Err(e) => Err(e),
            };
            match probed {
                Ok(version) => {
                    info!(%language, %version, "toolchain available");
                    registry.adapters.insert(language, adapter_for(config, version));
                }
                Err(e) => {
                    warn!(%language, error = %e, "toolchain unavailable");
                    registry.unavailable.insert(language, e.to_string());
                }
            }
        }
        registry
    }

    pub fn from_adapters(adapters: impl IntoIterator<Item = Arc<dyn ToolchainAdapter>>) -> Self {
        Self {
            adapters: adapters.into_iter().map(|a| (a.language(), a)).collect(),
            unavailable: HashMap::new(),
        }
    }

    pub fn resolve(&self, language: Language) -> Result<Arc<dyn ToolchainAdapter>> {
        if let Some(adapter) = self.adapters.get(&language) {
            return Ok(adapter.clone());
        }
        let reason = self
            .unavailable
            .get(&language)
            .cloned()
            .unwrap_or_else(|| "no toolchain registered".to_string());
        Err(ExecutorError::ToolchainUnavailable { language, reason })
    }

    /// Available languages with their pinned versions
    pub fn available(&self) -> Vec<(Language, String)> {
        let mut list: Vec<(Language, String)> = self
            .adapters
            .iter()
            .map(|(language, adapter)| (*language, adapter.version().to_string()))
            .collect();
        list.sort_by_key(|(language, _)| language.as_str());
        list
    }

    pub fn unavailable(&self) -> &HashMap<Language, String> {
        &self.unavailable
    }

    pub fn is_healthy(&self) -> bool {
        self.unavailable.is_empty() && !self.adapters.is_empty()
    }
}
