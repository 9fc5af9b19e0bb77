//! Execution records, targets and dispatch requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Opaque execution identifier (ULID string).
pub type ExecutionId = String;

/// Name used for the single orchestrator workspace.
pub const DEFAULT_ORCHESTRATOR: &str = "default";

/// Front-end a request came from.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Web,
    Chat,
    Cli,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Web => write!(f, "web"),
            Source::Chat => write!(f, "chat"),
            Source::Cli => write!(f, "cli"),
        }
    }
}

/// Kind of target an execution runs against.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Orchestrator,
    Project,
    Agent,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetType::Orchestrator => write!(f, "orchestrator"),
            TargetType::Project => write!(f, "project"),
            TargetType::Agent => write!(f, "agent"),
        }
    }
}

impl FromStr for TargetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "orchestrator" => Ok(TargetType::Orchestrator),
            "project" => Ok(TargetType::Project),
            "agent" => Ok(TargetType::Agent),
            _ => Err(format!("Unknown target type: {}", s)),
        }
    }
}

/// An addressable target.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    pub kind: TargetType,
    pub name: String,
}

impl Target {
    pub fn new(kind: TargetType, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn orchestrator() -> Self {
        Self::new(TargetType::Orchestrator, DEFAULT_ORCHESTRATOR)
    }

    /// The `type:name` key used for admission and status.
    pub fn key(&self) -> String {
        target_key(self.kind, &self.name)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

impl FromStr for Target {
    type Err = String;

    /// Accepts `type:name`, or a bare `orchestrator`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((kind, name)) if !name.trim().is_empty() => {
                Ok(Target::new(kind.parse()?, name.trim()))
            }
            Some(_) => Err(format!("Missing target name in '{}'", s)),
            None if s.eq_ignore_ascii_case("orchestrator") => Ok(Target::orchestrator()),
            None => Err(format!("Target must look like type:name, got '{}'", s)),
        }
    }
}

pub fn target_key(kind: TargetType, name: &str) -> String {
    format!("{}:{}", kind, name)
}

/// Execution lifecycle status. Terminal values never change.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Error,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Error => write!(f, "error"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Structured result reported by the CLI when it exits.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub output: String,
    pub session_id: Option<String>,
    pub duration_ms: Option<u64>,
    pub cost_usd: Option<f64>,
    pub is_error: bool,
}

/// A request to run a prompt against a target.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub source: Source,
    pub target_type: TargetType,
    pub target_name: String,
    pub prompt: String,
    /// Resolved from the workspace settings when omitted.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub resume_session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub plan_mode: bool,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub use_docker: bool,
    /// Resume the target's last session when no session id is given.
    #[serde(default)]
    pub continue_session: bool,
}

impl DispatchRequest {
    pub fn new(source: Source, target: Target, prompt: impl Into<String>) -> Self {
        Self {
            source,
            target_type: target.kind,
            target_name: target.name,
            prompt: prompt.into(),
            cwd: None,
            resume_session_id: None,
            model: None,
            plan_mode: false,
            agent_name: None,
            use_docker: false,
            continue_session: false,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_resume(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(session_id.into());
        self
    }

    pub fn target(&self) -> Target {
        Target::new(self.target_type, self.target_name.clone())
    }

    pub fn target_key(&self) -> String {
        target_key(self.target_type, &self.target_name)
    }
}

/// One run of the CLI against a target.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: ExecutionId,
    pub source: Source,
    pub target_type: TargetType,
    pub target_name: String,
    pub prompt: String,
    pub cwd: Option<PathBuf>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<ExecutionResult>,
    pub error: Option<String>,
    pub model: Option<String>,
    pub resume_session_id: Option<String>,
    pub plan_mode: bool,
    pub agent_name: Option<String>,
    pub use_docker: bool,
    /// Queue sequence number this execution was promoted from.
    pub queue_seq: Option<u64>,
}

impl Execution {
    pub(crate) fn running(id: ExecutionId, request: &DispatchRequest, queue_seq: Option<u64>) -> Self {
        Self {
            id,
            source: request.source,
            target_type: request.target_type,
            target_name: request.target_name.clone(),
            prompt: request.prompt.clone(),
            cwd: request.cwd.clone(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
            model: request.model.clone(),
            resume_session_id: request.resume_session_id.clone(),
            plan_mode: request.plan_mode,
            agent_name: request.agent_name.clone(),
            use_docker: request.use_docker,
            queue_seq,
        }
    }

    pub fn target(&self) -> Target {
        Target::new(self.target_type, self.target_name.clone())
    }

    pub fn target_key(&self) -> String {
        target_key(self.target_type, &self.target_name)
    }

    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running
    }

    /// Wall-clock duration, if the execution has finished.
    pub fn elapsed_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parses_type_and_name() {
        let target: Target = "project:website".parse().unwrap();
        assert_eq!(target, Target::new(TargetType::Project, "website"));
        assert_eq!(target.key(), "project:website");

        assert_eq!("orchestrator".parse::<Target>().unwrap(), Target::orchestrator());
        assert!("robot:x".parse::<Target>().is_err());
        assert!("agent:".parse::<Target>().is_err());
        assert!("website".parse::<Target>().is_err());
    }

    #[test]
    fn dispatch_request_reads_camel_case_with_defaults() {
        let request: DispatchRequest = serde_json::from_str(
            r#"{"source":"web","targetType":"agent","targetName":"scout","prompt":"hi","planMode":true}"#,
        )
        .unwrap();

        assert_eq!(request.target_key(), "agent:scout");
        assert!(request.plan_mode);
        assert!(!request.use_docker);
        assert!(request.cwd.is_none());
        assert!(request.resume_session_id.is_none());
    }

    #[test]
    fn only_running_is_non_terminal() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Error.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }
}
