//! Recursive filesystem watcher over the service work directory.
//!
//! Emits root-relative changed paths for create/modify/remove/rename events,
//! skipping the housekeeping subtrees so the service's own log and cache
//! writes do not feed back into hot-reload. `stop()` is idempotent.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use notify::event::AccessKind;
use notify::event::AccessMode;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use crate::error::Result;
use crate::error::SupervisorError;
use crate::workdir::is_housekeeping_path;

/// One observed change, as a path relative to the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDirChange {
    pub relative_path: String,
}

struct WatchState {
    watcher: RecommendedWatcher,
    /// Canonical paths with an active watch. The recommended backend is
    /// recursive on every tier-1 platform, so extra registrations are
    /// no-ops there; on non-recursive backends this map is what keeps
    /// newly created subdirectories covered.
    watched: HashSet<PathBuf>,
}

pub struct WorkDirWatcher {
    root: PathBuf,
    state: Mutex<Option<WatchState>>,
}

impl WorkDirWatcher {
    /// Starts watching `root` recursively. Returns the watcher handle and the
    /// change stream.
    pub fn start(root: impl Into<PathBuf>) -> Result<(Self, mpsc::UnboundedReceiver<WorkDirChange>)> {
        let root: PathBuf = root.into();
        let root = root.canonicalize().map_err(|error| SupervisorError::ReadFile {
            path: root.clone(),
            error,
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let event_root = root.clone();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => forward_event(&event_root, &event, &tx),
                Err(err) => warn!("watch error: {err}"),
            }
        })
        .map_err(|err| SupervisorError::Io(std::io::Error::other(err)))?;

        let mut state = WatchState {
            watcher,
            watched: HashSet::new(),
        };
        state
            .watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|err| SupervisorError::Io(std::io::Error::other(err)))?;
        state.watched.insert(root.clone());

        Ok((
            Self {
                root,
                state: Mutex::new(Some(state)),
            },
            rx,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Registers a newly created subdirectory. A no-op if it is already
    /// covered or the watcher has been stopped.
    pub fn track_subdirectory(&self, path: &Path) {
        let Ok(canonical) = path.canonicalize() else {
            return;
        };
        let Ok(mut guard) = self.state.lock() else {
            return;
        };
        let Some(state) = guard.as_mut() else {
            return;
        };
        if !state.watched.insert(canonical.clone()) {
            return;
        }
        if let Err(err) = state.watcher.watch(&canonical, RecursiveMode::Recursive) {
            debug!("could not extend watch to {}: {err}", canonical.display());
        }
    }

    /// Unregisters every active watch. Safe to call multiple times.
    pub fn stop(&self) {
        let Ok(mut guard) = self.state.lock() else {
            return;
        };
        if let Some(mut state) = guard.take() {
            for path in state.watched.clone() {
                let _ = state.watcher.unwatch(&path);
            }
        }
    }
}

impl Drop for WorkDirWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn forward_event(root: &Path, event: &Event, tx: &mpsc::UnboundedSender<WorkDirChange>) {
    if !is_relevant(&event.kind) {
        return;
    }
    for path in &event.paths {
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        if relative.as_os_str().is_empty() || is_housekeeping_path(relative) {
            continue;
        }
        let change = WorkDirChange {
            relative_path: relative.to_string_lossy().into_owned(),
        };
        // Receiver gone means the supervisor is shutting down.
        if tx.send(change).is_err() {
            return;
        }
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    match kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => true,
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => false,
    }
}
