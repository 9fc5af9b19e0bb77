//! Composition root: owns the bus, execution manager, command queue and
//! session store, and is the only way front-ends reach them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::events::{EventBus, Interest, TargetStatus};
use super::execution::DispatchRequest;
use super::manager::{Attachment, ExecutionManager, RecentEntry};
use super::queue::{CommandQueue, Dispatch};
use super::session::SessionStore;
use crate::config::{get_home_dir, Settings};
use crate::error::{Error, Result};
use crate::runner::CliRunner;

/// How long shutdown waits for cancelled executions to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Poll step while waiting for cancelled executions.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Files the dispatcher persists between runs.
#[derive(Debug, Clone, Default)]
pub struct StatePaths {
    pub sessions: Option<PathBuf>,
    pub recent: Option<PathBuf>,
}

impl StatePaths {
    /// Files under ~/.taskrelay.
    pub fn from_home() -> Result<Self> {
        let home = get_home_dir()?;
        Ok(Self {
            sessions: Some(home.join("sessions.json")),
            recent: Some(home.join("recent.json")),
        })
    }

    /// Nothing touches disk.
    pub fn ephemeral() -> Self {
        Self::default()
    }
}

pub struct Dispatcher {
    settings: Settings,
    bus: EventBus,
    manager: Arc<ExecutionManager>,
    queue: Arc<CommandQueue>,
    sessions: Arc<SessionStore>,
    recent_path: Option<PathBuf>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Build every component once, restore persisted state and start the
    /// queue drain loop.
    pub async fn new(settings: Settings, runner: Arc<dyn CliRunner>, paths: StatePaths) -> Result<Self> {
        let sessions = Arc::new(match paths.sessions.clone() {
            Some(path) => blocking(move || SessionStore::load(&path)).await?,
            None => SessionStore::in_memory(),
        });

        let bus = EventBus::new();
        let manager = Arc::new(
            ExecutionManager::new(
                runner,
                bus.clone(),
                settings.buffer.capacity,
                settings.buffer.recent_limit,
            )
            .with_sessions(Arc::clone(&sessions)),
        );
        let queue = Arc::new(CommandQueue::new(Arc::clone(&manager)));

        if let Some(path) = &paths.recent {
            let restored = restore_recent(&manager, path).await?;
            if restored > 0 {
                tracing::info!("Restored {} recent executions from {}", restored, path.display());
            }
        }

        let tasks = vec![tokio::spawn(
            Arc::clone(&queue).run_drain(bus.subscribe(Interest::Lifecycle)),
        )];

        Ok(Self {
            settings,
            bus,
            manager,
            queue,
            sessions,
            recent_path: paths.recent,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn manager(&self) -> &Arc<ExecutionManager> {
        &self.manager
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Validate, resolve and admit a request. Session continuation is
    /// resolved later, when the request actually starts.
    pub async fn dispatch(&self, mut request: DispatchRequest) -> Result<Dispatch> {
        if request.prompt.trim().is_empty() {
            return Err(Error::InvalidRequest("prompt must not be empty".to_string()));
        }
        if request.target_name.trim().is_empty() {
            return Err(Error::InvalidRequest("target name must not be empty".to_string()));
        }

        if request.cwd.is_none() {
            request.cwd = Some(self.settings.workspace.resolve(&request.target()));
        }

        tracing::debug!(
            "Dispatch from {} to {} (continue: {})",
            request.source,
            request.target_key(),
            request.continue_session
        );
        Ok(self.queue.submit(request).await)
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.manager.cancel(id)
    }

    pub fn attach(&self, id: &str) -> Option<Attachment> {
        self.manager.attach(id)
    }

    pub fn target_statuses(&self) -> BTreeMap<String, TargetStatus> {
        self.bus.target_statuses()
    }

    /// Stop promoting queued work, cancel what is running, wait for it to
    /// settle, then flush state to disk.
    pub async fn shutdown(&self) -> Result<()> {
        let stranded = self.queue.close().await;
        if stranded > 0 {
            tracing::warn!("{} queued requests will not run", stranded);
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let cancelled = self.manager.cancel_all();
            if cancelled > 0 {
                tracing::info!("Cancelling {} running executions", cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.manager.wait_idle(remaining.min(SHUTDOWN_POLL)).await {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!("Executions still running after {:?}", SHUTDOWN_GRACE);
                break;
            }
        }

        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }

        let sessions = Arc::clone(&self.sessions);
        blocking(move || sessions.save()).await?;
        if let Some(path) = &self.recent_path {
            flush_recent(&self.manager, path).await?;
        }
        tracing::info!("Dispatcher shut down");
        Ok(())
    }
}

/// Run blocking file work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

async fn restore_recent(manager: &ExecutionManager, path: &Path) -> Result<usize> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let entries: Vec<RecentEntry> = match serde_json::from_str(&content) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Ignoring unreadable {}: {}", path.display(), e);
            return Ok(0);
        }
    };
    let count = entries.len();
    for entry in entries {
        manager.restore(entry);
    }
    Ok(count)
}

async fn flush_recent(manager: &ExecutionManager, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let snapshot = manager.snapshot();
    tokio::fs::write(path, serde_json::to_string_pretty(&snapshot)?).await?;
    tracing::debug!("Flushed {} recent executions to {}", snapshot.len(), path.display());
    Ok(())
}
