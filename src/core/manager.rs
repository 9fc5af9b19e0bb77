//! Execution manager: spawns and supervises one CLI process per execution.
//!
//! All execution state (records, cancel handles, the output buffer) lives
//! behind one mutex. Output is appended and published while that lock is
//! held, and [`ExecutionManager::attach`] snapshots the buffer and subscribes
//! under the same lock, so a late subscriber's catch-up text and its live
//! chunks meet exactly.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::oneshot;

use super::events::{EventBus, ExecutionEvent, Interest, Subscription};
use super::execution::{
    DispatchRequest, Execution, ExecutionId, ExecutionResult, ExecutionStatus,
};
use super::output_buffer::OutputBuffer;
use super::session::SessionStore;
use crate::error::Error;
use crate::runner::{parse_stream_line, CliRunner, StreamLine};

/// Longest stderr tail kept for error messages.
const STDERR_TAIL_CHARS: usize = 2000;

/// How long to wait for stderr to drain after the process exits.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How an execution ended, before it is written to the record.
#[derive(Debug)]
enum Outcome {
    Completed(ExecutionResult),
    Failed {
        message: String,
        result: Option<ExecutionResult>,
    },
    Cancelled,
}

/// Catch-up view handed to a newly attached subscriber.
pub struct Attachment {
    pub execution: Execution,
    /// Output produced before the subscription was made.
    pub catch_up: String,
    /// Live events after `catch_up`; `None` when the execution already ended.
    pub live: Option<Subscription>,
}

/// A terminal execution and its output, as persisted across restarts.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RecentEntry {
    pub execution: Execution,
    pub output: String,
}

struct ManagerState {
    executions: HashMap<ExecutionId, Execution>,
    cancels: HashMap<ExecutionId, oneshot::Sender<()>>,
    cancel_requested: HashSet<ExecutionId>,
    /// Terminal executions, oldest first.
    recent: VecDeque<ExecutionId>,
    buffer: OutputBuffer,
}

pub struct ExecutionManager {
    runner: Arc<dyn CliRunner>,
    bus: EventBus,
    recent_limit: usize,
    sessions: Option<Arc<SessionStore>>,
    state: Mutex<ManagerState>,
}

impl ExecutionManager {
    pub fn new(
        runner: Arc<dyn CliRunner>,
        bus: EventBus,
        buffer_capacity: usize,
        recent_limit: usize,
    ) -> Self {
        Self {
            runner,
            bus,
            recent_limit,
            sessions: None,
            state: Mutex::new(ManagerState {
                executions: HashMap::new(),
                cancels: HashMap::new(),
                cancel_requested: HashSet::new(),
                recent: VecDeque::new(),
                buffer: OutputBuffer::new(buffer_capacity),
            }),
        }
    }

    /// Resolve session continuation when an execution starts and record
    /// sessions before its terminal event is published.
    pub fn with_sessions(mut self, sessions: Arc<SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Start an execution. The caller has already checked that the target is
    /// free. Spawn failures still produce an id: the execution goes straight
    /// to `error`.
    pub fn start(self: &Arc<Self>, mut request: DispatchRequest, queue_seq: Option<u64>) -> ExecutionId {
        if let Some(sessions) = &self.sessions {
            sessions.apply(&mut request);
            if let Some(model) = &request.model {
                sessions.record_model(&request.target_key(), model);
            }
        }

        let id = ulid::Ulid::new().to_string();
        let execution = Execution::running(id.clone(), &request, queue_seq);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        {
            let mut state = self.lock();
            state.executions.insert(id.clone(), execution.clone());
            state.cancels.insert(id.clone(), cancel_tx);
            self.bus.publish(ExecutionEvent::Started {
                id: id.clone(),
                info: execution,
            });
        }

        tracing::info!(
            "Starting execution {} on {} via {}",
            id,
            request.target_key(),
            self.runner.name()
        );

        match self.spawn(&request) {
            Ok(child) => {
                let manager = Arc::clone(self);
                let task_id = id.clone();
                tokio::spawn(async move {
                    manager.supervise(task_id, child, cancel_rx).await;
                });
            }
            Err(e) => {
                tracing::warn!("Execution {} failed to spawn: {}", id, e);
                self.finish(
                    &id,
                    Outcome::Failed {
                        message: e.to_string(),
                        result: None,
                    },
                );
            }
        }

        id
    }

    fn spawn(&self, request: &DispatchRequest) -> Result<Child, Error> {
        let cwd = request
            .cwd
            .as_ref()
            .ok_or_else(|| Error::Spawn("no working directory resolved".to_string()))?;

        if !cwd.is_dir() {
            return Err(Error::Spawn(format!(
                "working directory does not exist: {}",
                cwd.display()
            )));
        }

        self.runner
            .command(request)
            .spawn()
            .map_err(|e| Error::Spawn(format!("failed to launch {}: {}", self.runner.name(), e)))
    }

    async fn supervise(self: Arc<Self>, id: ExecutionId, mut child: Child, mut cancel_rx: oneshot::Receiver<()>) {
        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(read_tail(stderr)));
        let mut result: Option<ExecutionResult> = None;
        let mut cancelled = false;

        // After a read error the rest of stdout is discarded, never left
        // unread, so the child does not die on a closed pipe.
        let mut discard = None;
        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut line = Vec::new();
            let mut failed = false;
            loop {
                line.clear();
                tokio::select! {
                    read = reader.read_until(b'\n', &mut line) => match read {
                        Ok(0) => break,
                        Ok(_) => match parse_stream_line(&decode_line(&line)) {
                            StreamLine::Text(chunk) => self.append_output(&id, &chunk),
                            StreamLine::Result(parsed) => result = Some(parsed),
                            StreamLine::Ignored => {}
                        },
                        Err(e) => {
                            tracing::warn!("Execution {} stdout read failed: {}", id, e);
                            failed = true;
                            break;
                        }
                    },
                    _ = &mut cancel_rx => {
                        cancelled = true;
                        break;
                    }
                }
            }
            if failed {
                discard = Some(tokio::spawn(async move {
                    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                }));
            }
        }

        let status = if cancelled {
            kill_and_wait(&mut child).await
        } else {
            tokio::select! {
                status = child.wait() => status,
                _ = &mut cancel_rx => {
                    cancelled = true;
                    kill_and_wait(&mut child).await
                }
            }
        };

        if let Some(task) = discard {
            task.abort();
        }

        let stderr = match stderr_task {
            Some(task) => match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await {
                Ok(Ok(text)) => text,
                _ => String::new(),
            },
            None => String::new(),
        };

        let outcome = if cancelled {
            Outcome::Cancelled
        } else {
            match status {
                Ok(status) => resolve_exit(status, result, &stderr),
                Err(e) => Outcome::Failed {
                    message: format!("failed to wait for process: {}", e),
                    result,
                },
            }
        };

        self.finish(&id, outcome);
    }

    fn append_output(&self, id: &str, chunk: &str) {
        let mut state = self.lock();
        if !state.executions.get(id).is_some_and(Execution::is_running) {
            return;
        }
        state.buffer.append(id, chunk);
        self.bus.publish(ExecutionEvent::Output {
            id: id.to_string(),
            chunk: chunk.to_string(),
        });
    }

    /// Apply a terminal transition. The first one wins; later calls are
    /// no-ops and return false.
    fn finish(&self, id: &str, outcome: Outcome) -> bool {
        let mut state = self.lock();
        state.cancels.remove(id);
        state.cancel_requested.remove(id);

        let Some(execution) = state.executions.get_mut(id) else {
            return false;
        };
        if execution.status.is_terminal() {
            return false;
        }

        execution.completed_at = Some(Utc::now());
        let event = match outcome {
            Outcome::Completed(result) => {
                // Recorded before the event goes out, so whatever the event
                // promotes next already sees this session.
                if let (Some(sessions), Some(session)) = (&self.sessions, result.session_id.as_deref()) {
                    tracing::debug!("Target {} now on session {}", execution.target_key(), session);
                    sessions.record_session(&execution.target_key(), session);
                }
                execution.status = ExecutionStatus::Completed;
                execution.result = Some(result);
                tracing::info!("Execution {} completed", id);
                ExecutionEvent::Completed {
                    id: id.to_string(),
                    info: execution.clone(),
                }
            }
            Outcome::Failed { message, result } => {
                execution.status = ExecutionStatus::Error;
                execution.result = result;
                execution.error = Some(message.clone());
                tracing::warn!("Execution {} failed: {}", id, message);
                ExecutionEvent::Errored {
                    id: id.to_string(),
                    info: execution.clone(),
                    message,
                }
            }
            Outcome::Cancelled => {
                execution.status = ExecutionStatus::Cancelled;
                tracing::info!("Execution {} cancelled", id);
                ExecutionEvent::Cancelled {
                    id: id.to_string(),
                    info: execution.clone(),
                }
            }
        };

        self.bus.publish(event);
        state.recent.push_back(id.to_string());
        self.prune_recent(&mut state);
        true
    }

    fn prune_recent(&self, state: &mut ManagerState) {
        while state.recent.len() > self.recent_limit {
            let Some(old) = state.recent.pop_front() else {
                break;
            };
            state.executions.remove(&old);
            state.buffer.clear(&old);
            tracing::debug!("Execution {} left the recent window", old);
        }
    }

    /// Request cancellation. Returns false when the execution is unknown,
    /// already terminal, or a cancel is already in flight.
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = self.lock();
        match state.executions.get(id) {
            Some(execution) if execution.is_running() => {}
            _ => return false,
        }
        if !state.cancel_requested.insert(id.to_string()) {
            return false;
        }

        if let Some(tx) = state.cancels.remove(id) {
            if tx.send(()).is_ok() {
                tracing::info!("Cancel requested for execution {}", id);
                return true;
            }
        }
        drop(state);

        // No supervisor left to signal.
        self.finish(id, Outcome::Cancelled)
    }

    /// Cancel every running execution, returning how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let running: Vec<ExecutionId> = self.active().into_iter().map(|e| e.id).collect();
        running.iter().filter(|id| self.cancel(id)).count()
    }

    /// Wait until nothing is running, up to `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.active().is_empty() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }

    pub fn is_target_active(&self, target_key: &str) -> bool {
        self.lock()
            .executions
            .values()
            .any(|e| e.is_running() && e.target_key() == target_key)
    }

    /// Running executions, oldest first.
    pub fn active(&self) -> Vec<Execution> {
        let mut active: Vec<Execution> = self
            .lock()
            .executions
            .values()
            .filter(|e| e.is_running())
            .cloned()
            .collect();
        active.sort_by_key(|e| e.started_at);
        active
    }

    /// Terminal executions still retained, newest first.
    pub fn recent(&self) -> Vec<Execution> {
        let state = self.lock();
        state
            .recent
            .iter()
            .rev()
            .filter_map(|id| state.executions.get(id).cloned())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Execution> {
        self.lock().executions.get(id).cloned()
    }

    pub fn output(&self, id: &str) -> Option<String> {
        self.lock().buffer.get(id).map(ToString::to_string)
    }

    /// Executions currently holding buffered output.
    pub fn buffered(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn find_by_queue_seq(&self, seq: u64) -> Option<Execution> {
        self.lock()
            .executions
            .values()
            .find(|e| e.queue_seq == Some(seq))
            .cloned()
    }

    /// Attach to an execution: current output plus, if it is still running,
    /// a live subscription that starts exactly after that output.
    pub fn attach(&self, id: &str) -> Option<Attachment> {
        let state = self.lock();
        let execution = state.executions.get(id)?.clone();
        let catch_up = state.buffer.get(id).unwrap_or_default().to_string();
        let live = execution
            .is_running()
            .then(|| self.bus.subscribe(Interest::Execution(id.to_string())));

        Some(Attachment {
            execution,
            catch_up,
            live,
        })
    }

    /// Terminal executions and their output, oldest first.
    pub fn snapshot(&self) -> Vec<RecentEntry> {
        let state = self.lock();
        state
            .recent
            .iter()
            .filter_map(|id| {
                let execution = state.executions.get(id)?.clone();
                let output = state.buffer.get(id).unwrap_or_default().to_string();
                Some(RecentEntry { execution, output })
            })
            .collect()
    }

    /// Re-register an execution from a previous run. Records still marked
    /// running are closed as errors, since their process is gone. No events
    /// are published.
    pub fn restore(&self, entry: RecentEntry) {
        let RecentEntry {
            mut execution,
            output,
        } = entry;

        if execution.is_running() {
            execution.status = ExecutionStatus::Error;
            execution.error = Some("server restarted before the execution finished".to_string());
            execution.completed_at = Some(Utc::now());
        }

        let mut state = self.lock();
        if state.executions.contains_key(&execution.id) {
            return;
        }
        state.buffer.seed(&execution.id, &output);
        state.recent.push_back(execution.id.clone());
        state.executions.insert(execution.id.clone(), execution);
        self.prune_recent(&mut state);
    }
}

async fn kill_and_wait(child: &mut Child) -> std::io::Result<ExitStatus> {
    if let Err(e) = child.start_kill() {
        tracing::debug!("Kill signal not delivered: {}", e);
    }
    child.wait().await
}

/// Decode one stdout line, tolerating invalid UTF-8 and CRLF endings.
fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

async fn read_tail<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut bytes = Vec::new();
    if let Err(e) = reader.read_to_end(&mut bytes).await {
        tracing::debug!("stderr read failed: {}", e);
    }
    let text = String::from_utf8_lossy(&bytes);
    let text = text.trim();
    let skip = text.chars().count().saturating_sub(STDERR_TAIL_CHARS);
    text.chars().skip(skip).collect()
}

fn resolve_exit(status: ExitStatus, result: Option<ExecutionResult>, stderr: &str) -> Outcome {
    match result {
        Some(result) if result.is_error => Outcome::Failed {
            message: if result.output.is_empty() {
                "CLI reported an error".to_string()
            } else {
                result.output.clone()
            },
            result: Some(result),
        },
        Some(result) if status.success() => Outcome::Completed(result),
        Some(result) => Outcome::Failed {
            message: with_stderr(format!("process {}", describe_exit(status)), stderr),
            result: Some(result),
        },
        None if status.success() => Outcome::Failed {
            message: with_stderr("failed to parse result".to_string(), stderr),
            result: None,
        },
        None => Outcome::Failed {
            message: with_stderr(format!("process {}", describe_exit(status)), stderr),
            result: None,
        },
    }
}

fn with_stderr(message: String, stderr: &str) -> String {
    if stderr.is_empty() {
        message
    } else {
        format!("{}: {}", message, stderr)
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {}", signal);
        }
    }
    "exited abnormally".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::execution::{Source, Target, TargetType};
    use crate::runner::testing::{result_line, ScriptRunner};
    use tempfile::TempDir;

    fn manager() -> Arc<ExecutionManager> {
        Arc::new(ExecutionManager::new(
            Arc::new(ScriptRunner),
            EventBus::new(),
            250,
            50,
        ))
    }

    fn script(dir: &TempDir, body: &str) -> DispatchRequest {
        DispatchRequest::new(Source::Web, Target::new(TargetType::Project, "p"), body)
            .with_cwd(dir.path())
    }

    /// Collect events until the execution's terminal event.
    async fn until_terminal(sub: &mut Subscription) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(10), sub.recv())
            .await
            .expect("timed out waiting for events")
        {
            let done = event.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn successful_run_streams_then_completes() {
        let dir = TempDir::new().unwrap();
        let manager = manager();
        let mut sub = manager.bus().subscribe(Interest::All);

        let body = format!("echo one; echo two; {}", result_line("ok", "s-1"));
        let id = manager.start(script(&dir, &body), None);
        let events = until_terminal(&mut sub).await;

        let kinds: Vec<&str> = events.iter().map(ExecutionEvent::kind).collect();
        assert_eq!(kinds, ["start", "output", "output", "complete"]);

        let execution = manager.get(&id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        let result = execution.result.unwrap();
        assert_eq!(result.session_id.as_deref(), Some("s-1"));
        assert_eq!(result.output, "ok");
        assert_eq!(manager.output(&id).as_deref(), Some("one\ntwo\n"));
        assert!(!manager.is_target_active("project:p"));
    }

    #[tokio::test]
    async fn invalid_utf8_line_does_not_stop_the_stream() {
        let dir = TempDir::new().unwrap();
        let manager = manager();
        let mut sub = manager.bus().subscribe(Interest::Lifecycle);

        let body = format!(
            r"echo before; printf 'bad\377byte\n'; seq 1 20000; {}",
            result_line("ok", "s-utf8")
        );
        let id = manager.start(script(&dir, &body), None);
        until_terminal(&mut sub).await;

        let execution = manager.get(&id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed, "{:?}", execution.error);
        let output = manager.output(&id).unwrap();
        assert!(output.starts_with("before\nbad\u{FFFD}byte\n1\n2\n"), "{}", output.chars().take(40).collect::<String>());
        assert!(output.ends_with("19999\n20000\n"));
    }

    #[tokio::test]
    async fn crlf_and_unterminated_lines_are_kept() {
        let dir = TempDir::new().unwrap();
        let manager = manager();
        let mut sub = manager.bus().subscribe(Interest::Lifecycle);

        let body = format!(r"printf 'crlf\r\n'; {}; printf 'tail'", result_line("ok", "s"));
        let id = manager.start(script(&dir, &body), None);
        until_terminal(&mut sub).await;

        assert_eq!(manager.get(&id).unwrap().status, ExecutionStatus::Completed);
        assert_eq!(manager.output(&id).as_deref(), Some("crlf\ntail\n"));
    }

    #[test]
    fn decode_line_strips_endings_and_replaces_bad_bytes() {
        assert_eq!(decode_line(b"plain\n"), "plain");
        assert_eq!(decode_line(b"dos\r\n"), "dos");
        assert_eq!(decode_line(b"no end"), "no end");
        assert_eq!(decode_line(b"a\xffb\n"), "a\u{FFFD}b");
    }

    #[tokio::test]
    async fn missing_result_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let manager = manager();
        let mut sub = manager.bus().subscribe(Interest::Lifecycle);

        let id = manager.start(script(&dir, "echo partial"), None);
        let events = until_terminal(&mut sub).await;

        assert!(matches!(
            events.last(),
            Some(ExecutionEvent::Errored { message, .. }) if message.contains("failed to parse result")
        ));
        assert_eq!(manager.output(&id).as_deref(), Some("partial\n"));
    }

    #[tokio::test]
    async fn crash_keeps_partial_output_and_exit_detail() {
        let dir = TempDir::new().unwrap();
        let manager = manager();
        let mut sub = manager.bus().subscribe(Interest::Lifecycle);

        let id = manager.start(script(&dir, "echo halfway; echo oops >&2; exit 3"), None);
        let events = until_terminal(&mut sub).await;

        let Some(ExecutionEvent::Errored { message, .. }) = events.last() else {
            panic!("expected error event, got {:?}", events.last().map(ExecutionEvent::kind));
        };
        assert!(message.contains("exited with code 3"), "{}", message);
        assert!(message.contains("oops"), "{}", message);
        assert_eq!(manager.output(&id).as_deref(), Some("halfway\n"));
    }

    #[tokio::test]
    async fn tool_reported_failure_is_an_error() {
        let dir = TempDir::new().unwrap();
        let manager = manager();
        let mut sub = manager.bus().subscribe(Interest::Lifecycle);

        let body = r#"echo '{"type":"result","subtype":"error_during_execution","is_error":true,"result":"rate limited"}'"#;
        let id = manager.start(script(&dir, body), None);
        until_terminal(&mut sub).await;

        let execution = manager.get(&id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Error);
        assert_eq!(execution.error.as_deref(), Some("rate limited"));
        assert!(execution.result.unwrap().is_error);
    }

    #[tokio::test]
    async fn bad_directory_errors_immediately_without_output() {
        let manager = manager();
        let mut sub = manager.bus().subscribe(Interest::All);

        let request = DispatchRequest::new(Source::Chat, Target::orchestrator(), "echo hi")
            .with_cwd("/definitely/not/here");
        let id = manager.start(request, None);

        // Spawn failure is synchronous: the record is already terminal.
        let execution = manager.get(&id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Error);
        assert!(execution.error.unwrap().contains("working directory does not exist"));
        assert_eq!(manager.output(&id), None);

        let kinds: Vec<&str> = until_terminal(&mut sub).await.iter().map(ExecutionEvent::kind).collect();
        assert_eq!(kinds, ["start", "error"]);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_emits_one_terminal_event() {
        let dir = TempDir::new().unwrap();
        let manager = manager();
        let mut sub = manager.bus().subscribe(Interest::Lifecycle);

        let id = manager.start(script(&dir, "echo started; exec sleep 30"), None);
        assert!(manager.cancel(&id));
        assert!(!manager.cancel(&id));

        let events = until_terminal(&mut sub).await;
        assert_eq!(events.last().map(ExecutionEvent::kind), Some("cancel"));
        assert!(!manager.cancel(&id));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sub.try_recv().is_none());
        assert_eq!(manager.get(&id).unwrap().status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let manager = manager();
        let mut sub = manager.bus().subscribe(Interest::Lifecycle);

        let id = manager.start(script(&dir, &result_line("done", "s")), None);
        until_terminal(&mut sub).await;

        assert!(!manager.cancel(&id));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sub.try_recv().is_none());
        assert_eq!(manager.get(&id).unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn mid_run_attach_has_no_gap_or_duplicate() {
        let dir = TempDir::new().unwrap();
        let manager = manager();
        let mut all = manager.bus().subscribe(Interest::All);

        let body = format!(
            "for i in 1 2 3 4 5 6 7 8; do echo line$i; sleep 0.05; done; {}",
            result_line("ok", "s")
        );
        let id = manager.start(script(&dir, &body), None);

        // Wait until some output exists, then attach mid-run.
        loop {
            if manager.output(&id).is_some_and(|o| o.contains("line3")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let attachment = manager.attach(&id).unwrap();
        let mut seen = attachment.catch_up.clone();
        let mut live = attachment.live.expect("still running");
        while let Some(event) = live.recv().await {
            if let ExecutionEvent::Output { chunk, .. } = event {
                seen.push_str(&chunk);
            }
        }

        until_terminal(&mut all).await;
        let expected: String = (1..=8).map(|i| format!("line{}\n", i)).collect();
        assert_eq!(seen, expected);
        assert_eq!(manager.output(&id).unwrap(), expected);
    }

    #[tokio::test]
    async fn attach_to_finished_execution_has_no_live_stream() {
        let dir = TempDir::new().unwrap();
        let manager = manager();
        let mut sub = manager.bus().subscribe(Interest::Lifecycle);

        let body = format!("echo hi; {}", result_line("ok", "s"));
        let id = manager.start(script(&dir, &body), None);
        until_terminal(&mut sub).await;

        let attachment = manager.attach(&id).unwrap();
        assert_eq!(attachment.catch_up, "hi\n");
        assert!(attachment.live.is_none());
        assert!(manager.attach("missing").is_none());
    }

    #[tokio::test]
    async fn recent_window_clears_old_buffers() {
        let dir = TempDir::new().unwrap();
        let manager = Arc::new(ExecutionManager::new(
            Arc::new(ScriptRunner),
            EventBus::new(),
            250,
            2,
        ));
        let mut sub = manager.bus().subscribe(Interest::Lifecycle);

        let mut ids = Vec::new();
        for i in 0..3 {
            let body = format!("echo run{}; {}", i, result_line("ok", "s"));
            ids.push(manager.start(script(&dir, &body), None));
            until_terminal(&mut sub).await;
        }

        assert!(manager.get(&ids[0]).is_none());
        assert!(manager.output(&ids[0]).is_none());
        assert_eq!(manager.buffered(), 2);
        assert_eq!(manager.recent().len(), 2);
        assert_eq!(manager.recent()[0].id, ids[2]);
    }

    #[tokio::test]
    async fn restore_seeds_buffer_and_closes_stale_runs() {
        let manager = manager();
        let request = DispatchRequest::new(Source::Web, Target::orchestrator(), "old");
        let stale = Execution::running("old-1".into(), &request, Some(3));

        manager.restore(RecentEntry {
            execution: stale,
            output: "before restart".into(),
        });

        let execution = manager.get("old-1").unwrap();
        assert_eq!(execution.status, ExecutionStatus::Error);
        assert_eq!(manager.output("old-1").as_deref(), Some("before restart"));
        assert_eq!(manager.find_by_queue_seq(3).map(|e| e.id), Some("old-1".to_string()));
        assert_eq!(manager.snapshot().len(), 1);
        assert!(!manager.is_target_active("orchestrator:default"));
    }
}
