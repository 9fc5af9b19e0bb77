//! Claude CLI runner.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

use super::{prepare, CliRunner};
use crate::config::CliConfig;
use crate::core::execution::DispatchRequest;

pub struct ClaudeRunner {
    cli_path: String,
    default_model: Option<String>,
    extra_args: Vec<String>,
    docker_image: Option<String>,
}

impl ClaudeRunner {
    pub fn new() -> Self {
        Self::from_config(&CliConfig::default())
    }

    pub fn from_config(config: &CliConfig) -> Self {
        Self {
            cli_path: config.binary.clone(),
            default_model: config.default_model.clone(),
            extra_args: config.extra_args.clone(),
            docker_image: config.docker_image.clone(),
        }
    }

    /// CLI arguments for a request, without the binary.
    pub fn args(&self, request: &DispatchRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if let Some(model) = selected_model_arg(request.model.as_deref())
            .or_else(|| selected_model_arg(self.default_model.as_deref()))
        {
            args.push("--model".to_string());
            args.push(model);
        }

        if let Some(session) = request
            .resume_session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            args.push("--resume".to_string());
            args.push(session.to_string());
        }

        if request.plan_mode {
            args.push("--permission-mode".to_string());
            args.push("plan".to_string());
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }
}

impl Default for ClaudeRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn selected_model_arg(model: Option<&str>) -> Option<String> {
    model
        .map(str::trim)
        .filter(|m| !m.is_empty() && *m != "default")
        .map(ToString::to_string)
}

#[async_trait]
impl CliRunner for ClaudeRunner {
    fn name(&self) -> &str {
        "claude"
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.cli_path)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn command(&self, request: &DispatchRequest) -> Command {
        let args = self.args(request);

        let mut cmd = match (&self.docker_image, &request.cwd) {
            (Some(image), Some(cwd)) if request.use_docker => {
                let mut cmd = Command::new("docker");
                cmd.arg("run")
                    .arg("--rm")
                    .arg("-i")
                    .arg("-v")
                    .arg(format!("{}:/workspace", cwd.display()))
                    .arg("-w")
                    .arg("/workspace")
                    .arg(image)
                    .arg(&self.cli_path)
                    .args(&args);
                cmd
            }
            _ => {
                if request.use_docker {
                    tracing::warn!("Docker requested but no cli.docker_image configured; running on host");
                }
                let mut cmd = Command::new(&self.cli_path);
                cmd.args(&args);
                cmd
            }
        };

        prepare(&mut cmd, request);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::execution::{Source, Target};

    fn request() -> DispatchRequest {
        DispatchRequest::new(Source::Web, Target::orchestrator(), "fix the build")
    }

    #[test]
    fn default_model_does_not_force_override() {
        assert_eq!(selected_model_arg(Some("default")), None);
        assert_eq!(selected_model_arg(Some("")), None);
        assert_eq!(selected_model_arg(Some("opus")), Some("opus".to_string()));
    }

    #[test]
    fn overrides_become_flags() {
        let runner = ClaudeRunner::new();
        let mut req = request().with_model("opus").with_resume("sess-9");
        req.plan_mode = true;

        let args = runner.args(&req);
        assert_eq!(&args[..2], ["-p", "fix the build"]);
        assert!(args.windows(2).any(|w| w == ["--output-format", "stream-json"]));
        assert!(args.windows(2).any(|w| w == ["--model", "opus"]));
        assert!(args.windows(2).any(|w| w == ["--resume", "sess-9"]));
        assert!(args.windows(2).any(|w| w == ["--permission-mode", "plan"]));
    }

    #[test]
    fn config_default_model_applies_when_request_has_none() {
        let runner = ClaudeRunner::from_config(&CliConfig {
            default_model: Some("sonnet".into()),
            extra_args: vec!["--max-turns".into(), "5".into()],
            ..CliConfig::default()
        });

        let args = runner.args(&request());
        assert!(args.windows(2).any(|w| w == ["--model", "sonnet"]));
        assert!(!args.contains(&"--resume".to_string()));
        assert_eq!(&args[args.len() - 2..], ["--max-turns", "5"]);
    }
}
