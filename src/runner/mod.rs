//! AI CLI runners: how the external process for an execution is built.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;

pub mod claude;
pub mod stream;

pub use claude::ClaudeRunner;
pub use stream::{parse_stream_line, StreamLine};

use crate::core::execution::DispatchRequest;

/// Builds the external process for a dispatch request.
#[async_trait]
pub trait CliRunner: Send + Sync {
    /// Runner name.
    fn name(&self) -> &str;

    /// Check if the CLI binary can be launched.
    async fn is_available(&self) -> bool;

    /// Build the command for a request. The caller spawns it.
    fn command(&self, request: &DispatchRequest) -> Command;
}

/// Apply the stdio wiring every runner needs: no stdin, piped output, and
/// the child is killed if its handle is dropped.
pub fn prepare(cmd: &mut Command, request: &DispatchRequest) {
    if let Some(dir) = &request.cwd {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
}

/// Runner that treats the prompt as a shell script. Lets process-level
/// behaviour be exercised without the real CLI.
#[cfg(test)]
pub mod testing {
    use super::*;

    pub struct ScriptRunner;

    #[async_trait]
    impl CliRunner for ScriptRunner {
        fn name(&self) -> &str {
            "script"
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn command(&self, request: &DispatchRequest) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&request.prompt);
            prepare(&mut cmd, request);
            cmd
        }
    }

    /// Shell line printing a successful structured result.
    pub fn result_line(text: &str, session: &str) -> String {
        format!(
            r#"echo '{{"type":"result","subtype":"success","is_error":false,"duration_ms":12,"total_cost_usd":0.01,"session_id":"{}","result":"{}"}}'"#,
            session, text
        )
    }
}
