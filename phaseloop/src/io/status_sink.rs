//! Status sinks: consumers of published snapshots.
//!
//! Sinks are called from the worker thread, outside the session lock, once per
//! published snapshot and in `seq` order. A failing sink is logged and never
//! stops the loop.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::core::status::StatusSnapshot;
use crate::io::atomic::write_atomic;

pub trait StatusSink {
    fn publish(&mut self, snapshot: &StatusSnapshot) -> Result<()>;
}

impl<S: StatusSink + ?Sized> StatusSink for Box<S> {
    fn publish(&mut self, snapshot: &StatusSnapshot) -> Result<()> {
        (**self).publish(snapshot)
    }
}

/// Emits a one-line `info!` event per snapshot.
#[derive(Debug, Default)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn publish(&mut self, snapshot: &StatusSnapshot) -> Result<()> {
        if let Some(result) = &snapshot.last_result {
            info!(
                seq = snapshot.seq,
                phase = %result.phase,
                task = %result.task,
                attempt = result.attempt,
                success = result.success,
                "{}",
                result.summary
            );
        }
        info!(seq = snapshot.seq, "{}", snapshot.headline());
        Ok(())
    }
}

/// Appends each snapshot as one JSON line.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StatusSink for JsonlSink {
    fn publish(&mut self, snapshot: &StatusSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(snapshot).context("serialize snapshot")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))
    }
}

/// Keeps the latest snapshot in a pretty-printed JSON file.
#[derive(Debug)]
pub struct LatestStatusFile {
    path: PathBuf,
}

impl LatestStatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StatusSink for LatestStatusFile {
    fn publish(&mut self, snapshot: &StatusSnapshot) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(snapshot).context("serialize snapshot")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

/// Forwards to every inner sink; one failure does not starve the others.
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<Box<dyn StatusSink + Send>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl StatusSink + Send + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl StatusSink for FanOut {
    fn publish(&mut self, snapshot: &StatusSnapshot) -> Result<()> {
        for sink in &mut self.sinks {
            if let Err(err) = sink.publish(snapshot) {
                warn!(seq = snapshot.seq, err = %format!("{err:#}"), "status sink failed");
            }
        }
        Ok(())
    }
}

/// Read the snapshot last written by `LatestStatusFile`.
pub fn read_latest_status(path: &Path) -> Result<Option<StatusSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let snapshot =
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(snapshot))
}
