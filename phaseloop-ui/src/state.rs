//! Shared application state for the UI server.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use phaseloop::core::status::StatusSnapshot;
use phaseloop::engine::LoopHandle;
use phaseloop::io::init::PhaseloopPaths;
use phaseloop::io::status_sink::StatusSink;
use phaseloop::launch::Project;
use tokio::sync::broadcast;

/// Events broadcast to SSE clients.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// The running session published a snapshot.
    Status(Box<StatusSnapshot>),
    PlanChanged,
    ConfigChanged,
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Project root (contains `.phaseloop/` and the plan file).
    pub project_dir: PathBuf,
    /// Broadcast sender for snapshots and file change events.
    pub event_tx: Arc<broadcast::Sender<ChangeEvent>>,
    /// The session started through `/api/start`, kept after it halts so its
    /// final status stays readable.
    session: Arc<Mutex<Option<Arc<LoopHandle>>>>,
    /// Held from the live-session check until the new handle is installed.
    start_lock: Arc<tokio::sync::Mutex<()>>,
}

impl AppState {
    pub fn new(project_dir: PathBuf) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            project_dir,
            event_tx: Arc::new(event_tx),
            session: Arc::new(Mutex::new(None)),
            start_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn paths(&self) -> PhaseloopPaths {
        PhaseloopPaths::new(&self.project_dir)
    }

    /// Project config as currently on disk.
    pub fn project(&self) -> Result<Project> {
        Project::open(&self.project_dir)
    }

    /// Plan file path per the current config, falling back to the default
    /// location when the config cannot be read.
    pub fn plan_path(&self) -> PathBuf {
        match self.project() {
            Ok(project) => project.plan_path,
            Err(_) => self.paths().plan_path(&Default::default()),
        }
    }

    pub fn session(&self) -> Option<Arc<LoopHandle>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// True while a session is running (not yet halted).
    pub fn has_live_session(&self) -> bool {
        self.session().is_some_and(|handle| !handle.is_finished())
    }

    /// Serialize session starts.
    pub async fn lock_start(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.start_lock.lock().await
    }

    pub fn set_session(&self, handle: LoopHandle) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handle));
    }

    /// A status sink forwarding snapshots to SSE subscribers.
    pub fn broadcast_sink(&self) -> BroadcastSink {
        BroadcastSink {
            tx: Arc::clone(&self.event_tx),
        }
    }
}

/// Forwards each snapshot to the broadcast channel. Having no subscribers is
/// not an error.
pub struct BroadcastSink {
    tx: Arc<broadcast::Sender<ChangeEvent>>,
}

impl StatusSink for BroadcastSink {
    fn publish(&mut self, snapshot: &StatusSnapshot) -> Result<()> {
        let _ = self.tx.send(ChangeEvent::Status(Box::new(snapshot.clone())));
        Ok(())
    }
}
