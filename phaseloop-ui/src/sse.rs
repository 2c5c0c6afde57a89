//! Server-Sent Events stream and plan/config file watcher.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::{AppState, ChangeEvent};

#[derive(Serialize)]
struct ChangePayload {
    #[serde(rename = "type")]
    event_type: &'static str,
}

/// Map a change to an SSE event: snapshots go out as `status` events carrying
/// the snapshot JSON, file changes as `change` events.
fn to_sse_event(event: &ChangeEvent) -> Option<Event> {
    let (name, data) = match event {
        ChangeEvent::Status(snapshot) => ("status", serde_json::to_string(snapshot).ok()?),
        ChangeEvent::PlanChanged => (
            "change",
            serde_json::to_string(&ChangePayload {
                event_type: "plan_changed",
            })
            .ok()?,
        ),
        ChangeEvent::ConfigChanged => (
            "change",
            serde_json::to_string(&ChangePayload {
                event_type: "config_changed",
            })
            .ok()?,
        ),
    };
    Some(Event::default().event(name).data(data))
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();
    let current = state.session().map(|handle| handle.get_status());

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));
        if let Some(snapshot) = current {
            if let Some(event) = to_sse_event(&ChangeEvent::Status(Box::new(snapshot))) {
                yield Ok(event);
            }
        }

        loop {
            match rx.recv().await {
                Ok(change_event) => {
                    if let Some(event) = to_sse_event(&change_event) {
                        yield Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Start the file watcher in a background task.
pub fn start_file_watcher(state: AppState) {
    tokio::spawn(async move {
        if let Err(e) = run_file_watcher(state).await {
            warn!(error = %e, "file watcher failed");
        }
    });
}

async fn run_file_watcher(state: AppState) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(250)),
    )?;

    let plan_path = state.plan_path();
    for dir in watched_dirs(&state, &plan_path) {
        if dir.exists() {
            watcher.watch(&dir, RecursiveMode::NonRecursive)?;
            info!(path = %dir.display(), "watching directory");
        }
    }

    let mut pending_events: Vec<NotifyEvent> = Vec::new();
    let mut flush_tick = tokio::time::interval(Duration::from_millis(200));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                pending_events.push(event);
            }
            _ = flush_tick.tick() => {
                if pending_events.is_empty() {
                    continue;
                }
                process_events(&state, &plan_path, &pending_events);
                pending_events.clear();
            }
        }
    }
}

/// The plan file's directory and `.phaseloop/`, deduplicated.
fn watched_dirs(state: &AppState, plan_path: &Path) -> Vec<PathBuf> {
    let mut dirs = vec![state.paths().tool_dir];
    if let Some(parent) = plan_path.parent() {
        if !dirs.iter().any(|d| d == parent) {
            dirs.push(parent.to_path_buf());
        }
    }
    dirs
}

fn process_events(state: &AppState, plan_path: &Path, events: &[NotifyEvent]) {
    let config_path = state.paths().config_path;
    let mut plan_changed = false;
    let mut config_changed = false;

    for event in events {
        // Only care about create/modify events
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }
        for path in &event.paths {
            if path == plan_path {
                plan_changed = true;
            } else if path == &config_path {
                config_changed = true;
            }
        }
    }

    if plan_changed {
        debug!("broadcasting plan change");
        if let Some(handle) = state.session() {
            handle.notify_plan_changed();
        }
        let _ = state.event_tx.send(ChangeEvent::PlanChanged);
    }
    if config_changed {
        debug!("broadcasting config change");
        let _ = state.event_tx.send(ChangeEvent::ConfigChanged);
    }
}
