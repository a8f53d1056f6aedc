use std::path::Path;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, DebouncedEventKind, new_debouncer};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Update,
    Delete,
}

/// A settled change to a path inside a project, relative to its root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub change: ChangeKind,
    pub path: String,
}

/// Watches one project directory recursively for as long as it lives.
pub struct ProjectWatcher {
    /// Dropping the debouncer stops the watcher thread.
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
}

impl ProjectWatcher {
    /// Start watching `workspace`. Changes are pushed to `tx` once they have
    /// been quiet for `settle`; paths with an ignored segment are dropped.
    pub fn start(
        workspace: &Workspace,
        settle: Duration,
        ignored: Vec<String>,
        tx: mpsc::UnboundedSender<FileChange>,
    ) -> anyhow::Result<Self> {
        let root = workspace.clone();
        let mut debouncer = new_debouncer(
            settle,
            move |events: Result<Vec<DebouncedEvent>, notify::Error>| {
                let events = match events {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!(error = %e, "project watcher error");
                        return;
                    }
                };
                for event in events {
                    if event.kind != DebouncedEventKind::Any {
                        continue;
                    }
                    if let Some(change) = classify(&root, &ignored, &event.path) {
                        tracing::trace!(path = %change.path, change = ?change.change, "project file changed");
                        // Receiver gone means the editor disconnected.
                        let _ = tx.send(change);
                    }
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(workspace.root(), RecursiveMode::Recursive)?;

        tracing::info!(root = %workspace.root().display(), "project watcher started");

        Ok(Self {
            _debouncer: debouncer,
        })
    }
}

fn classify(workspace: &Workspace, ignored: &[String], path: &Path) -> Option<FileChange> {
    let rel = workspace.relative(path)?;
    if rel.is_empty() || is_ignored(&rel, ignored) {
        return None;
    }
    let change = if path.exists() {
        ChangeKind::Update
    } else {
        ChangeKind::Delete
    };
    Some(FileChange { change, path: rel })
}

/// True when any `/`-separated segment of `rel` is on the ignore list.
pub fn is_ignored(rel: &str, ignored: &[String]) -> bool {
    rel.split('/').any(|seg| ignored.iter().any(|i| i == seg))
}
