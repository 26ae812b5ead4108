use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Languages the executor knows how to build and run.
///
/// The wire form is the lowercase tag (`"cpp"`, `"java"`, ...). Each variant
/// maps to exactly one toolchain entry in `config/languages.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Cpp,
    Java,
    Python,
    Rust,
}

impl Language {
    pub const ALL: [Language; 4] = [Language::Cpp, Language::Java, Language::Python, Language::Rust];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::Python => "python",
            Language::Rust => "rust",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = IntakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpp" | "c++" | "cxx" | "cc" => Ok(Language::Cpp),
            "java" => Ok(Language::Java),
            "python" | "py" | "python3" => Ok(Language::Python),
            "rust" | "rs" => Ok(Language::Rust),
            other => Err(IntakeError::UnknownLanguage(other.to_string())),
        }
    }
}

/// Rejections raised while accepting a submission
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntakeError {
    #[error("unknown language '{0}'")]
    UnknownLanguage(String),
    #[error("source code is empty")]
    EmptySource,
    #[error("source code is {size} bytes, maximum is {max}")]
    SourceTooLarge { size: usize, max: usize },
    #[error("stdin is {size} bytes, maximum is {max}")]
    StdinTooLarge { size: usize, max: usize },
    #[error("{limit} = {value} exceeds the ceiling of {max}")]
    LimitAboveCeiling {
        limit: &'static str,
        value: u64,
        max: u64,
    },
    #[error("invalid tenant name '{0}'")]
    InvalidTenant(String),
}

/// Per-submission resource ceilings.
///
/// A zero field means "not specified" and is replaced by the policy default
/// during intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpu_time_secs: u64,
    pub max_processes: u32,
    pub memory_bytes: u64,
    pub wall_timeout_ms: u64,
    pub max_output_bytes: u64,
}

/// Ceilings and defaults applied at intake
#[derive(Debug, Clone)]
pub struct IntakePolicy {
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    pub defaults: ResourceLimits,
    pub ceilings: ResourceLimits,
}

impl Default for IntakePolicy {
    fn default() -> Self {
        Self {
            max_source_bytes: 1024 * 1024,
            max_stdin_bytes: 10 * 1024 * 1024,
            defaults: ResourceLimits {
                cpu_time_secs: 2,
                max_processes: 16,
                memory_bytes: 256 * 1024 * 1024,
                wall_timeout_ms: 5_000,
                max_output_bytes: 64 * 1024,
            },
            ceilings: ResourceLimits {
                cpu_time_secs: 30,
                max_processes: 64,
                memory_bytes: 1024 * 1024 * 1024,
                wall_timeout_ms: 60_000,
                max_output_bytes: 4 * 1024 * 1024,
            },
        }
    }
}

impl ResourceLimits {
    /// Fill unspecified fields from the policy defaults and reject anything
    /// above the policy ceilings.
    pub fn normalize(&self, policy: &IntakePolicy) -> Result<ResourceLimits, IntakeError> {
        fn pick(value: u64, default: u64, max: u64, limit: &'static str) -> Result<u64, IntakeError> {
            let value = if value == 0 { default } else { value };
            if value > max {
                return Err(IntakeError::LimitAboveCeiling { limit, value, max });
            }
            Ok(value)
        }

        let d = &policy.defaults;
        let c = &policy.ceilings;
        Ok(ResourceLimits {
            cpu_time_secs: pick(self.cpu_time_secs, d.cpu_time_secs, c.cpu_time_secs, "cpu_time_secs")?,
            max_processes: pick(
                self.max_processes as u64,
                d.max_processes as u64,
                c.max_processes as u64,
                "max_processes",
            )? as u32,
            memory_bytes: pick(self.memory_bytes, d.memory_bytes, c.memory_bytes, "memory_bytes")?,
            wall_timeout_ms: pick(self.wall_timeout_ms, d.wall_timeout_ms, c.wall_timeout_ms, "wall_timeout_ms")?,
            max_output_bytes: pick(
                self.max_output_bytes,
                d.max_output_bytes,
                c.max_output_bytes,
                "max_output_bytes",
            )?,
        })
    }
}

fn default_tenant() -> String {
    "anonymous".to_string()
}

/// One unit of user code plus its execution parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    pub language: Language,
    #[serde(with = "base64_bytes")]
    pub source: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub stdin: Vec<u8>,
    #[serde(default)]
    pub limits: ResourceLimits,
}

impl Submission {
    pub fn new(language: Language, source: impl Into<Vec<u8>>, limits: ResourceLimits) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant: default_tenant(),
            language,
            source: source.into(),
            stdin: Vec::new(),
            limits,
        }
    }

    /// Validate and normalize a submission; the returned value is what the
    /// executor runs and is never modified afterwards.
    pub fn accept(self, policy: &IntakePolicy) -> Result<Submission, IntakeError> {
        if self.source.is_empty() {
            return Err(IntakeError::EmptySource);
        }
        if self.source.len() > policy.max_source_bytes {
            return Err(IntakeError::SourceTooLarge {
                size: self.source.len(),
                max: policy.max_source_bytes,
            });
        }
        if self.stdin.len() > policy.max_stdin_bytes {
            return Err(IntakeError::StdinTooLarge {
                size: self.stdin.len(),
                max: policy.max_stdin_bytes,
            });
        }
        let tenant_ok = !self.tenant.is_empty()
            && self.tenant.len() <= 64
            && self
                .tenant
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !tenant_ok {
            return Err(IntakeError::InvalidTenant(self.tenant));
        }

        let limits = self.limits.normalize(policy)?;
        Ok(Submission { limits, ..self })
    }
}

/// Terminal state of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Completed,
    TimedOut,
    LimitExceeded,
    Crashed,
}

/// Which ceiling a process tree ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitViolation {
    WallClock,
    CpuTime,
    ProcessCount,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub submission_id: Uuid,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration_ms: u64,
    pub violation: Option<LimitViolation>,
    pub cache_hit: bool,
    pub build_ms: u64,
}

impl ExecutionResult {
    pub fn limit_violated(&self) -> bool {
        self.violation.is_some()
    }
}

/// Failure classes reported back to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidSubmission,
    Overloaded,
    ResourceExhausted,
    Timeout,
    LimitExceeded,
    ToolchainUnavailable,
    ScratchUnavailable,
    Cancelled,
    Internal,
}

/// What a caller gets back for a submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Executed { result: ExecutionResult },
    CompileError { diagnostics: String, truncated: bool },
    Failed { kind: FailureKind, message: String },
}

/// Lifecycle of a queued submission as seen through the status key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Queued,
    Running,
    Finished,
}

/// Persisted outcome of one submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub submission_id: Uuid,
    pub language: Language,
    pub tenant: String,
    pub outcome: SubmissionOutcome,
    pub finished_at: DateTime<Utc>,
}

mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_parsing() {
        assert_eq!("cpp".parse::<Language>().unwrap(), Language::Cpp);
        assert_eq!("C++".parse::<Language>().unwrap(), Language::Cpp);
        assert_eq!("py".parse::<Language>().unwrap(), Language::Python);
        assert!(matches!(
            "cobol".parse::<Language>(),
            Err(IntakeError::UnknownLanguage(_))
        ));
        assert_eq!(Language::Java.to_string(), "java");
    }

    #[test]
    fn test_normalize_fills_defaults() {
        let policy = IntakePolicy::default();
        let limits = ResourceLimits {
            cpu_time_secs: 3,
            ..Default::default()
        }
        .normalize(&policy)
        .unwrap();

        assert_eq!(limits.cpu_time_secs, 3);
        assert_eq!(limits.max_processes, policy.defaults.max_processes);
        assert_eq!(limits.wall_timeout_ms, policy.defaults.wall_timeout_ms);
    }

    #[test]
    fn test_normalize_rejects_above_ceiling() {
        let policy = IntakePolicy::default();
        let err = ResourceLimits {
            max_processes: 10_000,
            ..Default::default()
        }
        .normalize(&policy)
        .unwrap_err();

        assert!(matches!(
            err,
            IntakeError::LimitAboveCeiling { limit: "max_processes", .. }
        ));
    }

    #[test]
    fn test_accept_rejects_bad_payloads() {
        let policy = IntakePolicy::default();

        let empty = Submission::new(Language::Cpp, Vec::new(), ResourceLimits::default());
        assert_eq!(empty.accept(&policy).unwrap_err(), IntakeError::EmptySource);

        let huge = Submission::new(
            Language::Cpp,
            vec![b'x'; policy.max_source_bytes + 1],
            ResourceLimits::default(),
        );
        assert!(matches!(
            huge.accept(&policy),
            Err(IntakeError::SourceTooLarge { .. })
        ));

        let mut bad_tenant = Submission::new(Language::Cpp, "int main(){}", ResourceLimits::default());
        bad_tenant.tenant = "../etc".to_string();
        assert!(matches!(
            bad_tenant.accept(&policy),
            Err(IntakeError::InvalidTenant(_))
        ));
    }

    #[test]
    fn test_submission_wire_format() {
        let json = r#"{
            "id": "7b0a0f4e-3f4b-4c1e-9d55-5f6f3f1d2a10",
            "language": "cpp",
            "source": "aW50IG1haW4oKXtyZXR1cm4gNDI7fQ==",
            "limits": { "cpu_time_secs": 2, "max_processes": 10, "wall_timeout_ms": 5000 }
        }"#;

        let submission: Submission = serde_json::from_str(json).unwrap();
        assert_eq!(submission.source, b"int main(){return 42;}");
        assert_eq!(submission.tenant, "anonymous");
        assert!(submission.stdin.is_empty());
        assert_eq!(submission.limits.memory_bytes, 0);
    }

    #[test]
    fn test_outcome_is_tagged() {
        let outcome = SubmissionOutcome::Failed {
            kind: FailureKind::Overloaded,
            message: "busy".to_string(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["outcome"], "failed");
        assert_eq!(value["kind"], "overloaded");
    }
}
