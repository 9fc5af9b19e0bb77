//! Configuration loading for TaskRelay.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::execution::{Target, TargetType};
use crate::core::output_buffer::DEFAULT_CAPACITY;
use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Get the TaskRelay home directory (~/.taskrelay).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".taskrelay"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.taskrelay/settings.json, falling back to defaults
/// when the file does not exist yet.
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;

    if !path.exists() {
        tracing::info!("No settings at {}, using defaults", path.display());
        let settings = Settings::default();
        validate_settings(&settings)?;
        return Ok(settings);
    }

    load_settings_from(&path)
}

/// Load and validate settings from an explicit path.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Write settings to an explicit path, creating parent directories.
pub fn save_settings_to(settings: &Settings, path: &Path) -> Result<()> {
    validate_settings(settings)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.buffer.capacity == 0 {
        return Err(Error::Config(
            "buffer.capacity must be at least 1".to_string(),
        ));
    }
    if settings.telegram.digest_interval_ms < 250 {
        return Err(Error::Config(format!(
            "telegram.digest_interval_ms must be >= 250 (got {})",
            settings.telegram.digest_interval_ms
        )));
    }
    if settings.cli.binary.trim().is_empty() {
        return Err(Error::Config("cli.binary must not be empty".to_string()));
    }
    Ok(())
}

/// AI CLI invocation settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CliConfig {
    #[serde(default = "default_cli_binary")]
    pub binary: String,
    pub default_model: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Image used when a request asks to run inside docker.
    pub docker_image: Option<String>,
}

fn default_cli_binary() -> String {
    "claude".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            binary: default_cli_binary(),
            default_model: None,
            extra_args: Vec::new(),
            docker_image: None,
        }
    }
}

/// Where target working directories live.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WorkspaceConfig {
    #[serde(default = "default_orchestrator_dir")]
    pub orchestrator_dir: PathBuf,
    #[serde(default = "default_projects_dir")]
    pub projects_dir: PathBuf,
    #[serde(default = "default_agents_dir")]
    pub agents_dir: PathBuf,
}

fn home_or_relative() -> PathBuf {
    get_home_dir().unwrap_or_else(|_| PathBuf::from(".taskrelay"))
}

fn default_orchestrator_dir() -> PathBuf {
    home_or_relative().join("workspace")
}

fn default_projects_dir() -> PathBuf {
    home_or_relative().join("projects")
}

fn default_agents_dir() -> PathBuf {
    home_or_relative().join("agents")
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            orchestrator_dir: default_orchestrator_dir(),
            projects_dir: default_projects_dir(),
            agents_dir: default_agents_dir(),
        }
    }
}

impl WorkspaceConfig {
    /// Resolve the working directory for a target.
    pub fn resolve(&self, target: &Target) -> PathBuf {
        match target.kind {
            TargetType::Orchestrator => self.orchestrator_dir.clone(),
            TargetType::Project => self.projects_dir.join(&target.name),
            TargetType::Agent => self.agents_dir.join(&target.name),
        }
    }
}

/// Output buffer and in-memory retention.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
    /// Terminal executions kept in memory before their buffers are cleared.
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
}

fn default_buffer_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_recent_limit() -> usize {
    50
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_buffer_capacity(),
            recent_limit: default_recent_limit(),
        }
    }
}

/// Web dashboard server.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WebConfig {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

fn default_web_host() -> String {
    "0.0.0.0".to_string()
}

fn default_web_port() -> u16 {
    3333
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
        }
    }
}

/// Telegram bot.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    /// Chats allowed to dispatch. Empty allows everyone.
    #[serde(default)]
    pub allowed_chat_ids: Vec<i64>,
    #[serde(default = "default_digest_interval_ms")]
    pub digest_interval_ms: u64,
}

fn default_digest_interval_ms() -> u64 {
    1500
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            allowed_chat_ids: Vec::new(),
            digest_interval_ms: default_digest_interval_ms(),
        }
    }
}

impl TelegramConfig {
    pub fn is_chat_allowed(&self, chat_id: i64) -> bool {
        self.allowed_chat_ids.is_empty() || self.allowed_chat_ids.contains(&chat_id)
    }
}

/// TaskRelay settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub cli: CliConfig,

    #[serde(default)]
    pub workspace: WorkspaceConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub web: WebConfig,

    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_settings_fill_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"web": {"port": 4000}, "buffer": {"capacity": 10}}"#).unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.web.port, 4000);
        assert_eq!(settings.web.host, "0.0.0.0");
        assert_eq!(settings.buffer.capacity, 10);
        assert_eq!(settings.buffer.recent_limit, 50);
        assert_eq!(settings.cli.binary, "claude");
        assert_eq!(settings.telegram.digest_interval_ms, 1500);
    }

    #[test]
    fn saved_settings_load_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = Settings::default();
        settings.telegram.allowed_chat_ids = vec![99];

        save_settings_to(&settings, &path).unwrap();
        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded.telegram.allowed_chat_ids, vec![99]);
        assert_eq!(loaded.web.port, settings.web.port);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"buffer": {"capacity": 0}}"#).unwrap();

        assert!(matches!(load_settings_from(&path), Err(Error::Config(_))));
    }

    #[test]
    fn targets_resolve_under_workspace_dirs() {
        let workspace = WorkspaceConfig {
            orchestrator_dir: PathBuf::from("/w/main"),
            projects_dir: PathBuf::from("/w/projects"),
            agents_dir: PathBuf::from("/w/agents"),
        };

        assert_eq!(
            workspace.resolve(&Target::orchestrator()),
            PathBuf::from("/w/main")
        );
        assert_eq!(
            workspace.resolve(&Target::new(TargetType::Project, "site")),
            PathBuf::from("/w/projects/site")
        );
        assert_eq!(
            workspace.resolve(&Target::new(TargetType::Agent, "scout")),
            PathBuf::from("/w/agents/scout")
        );
    }

    #[test]
    fn empty_allow_list_allows_everyone() {
        let mut telegram = TelegramConfig::default();
        assert!(telegram.is_chat_allowed(42));
        telegram.allowed_chat_ids = vec![7];
        assert!(!telegram.is_chat_allowed(42));
        assert!(telegram.is_chat_allowed(7));
    }
}
