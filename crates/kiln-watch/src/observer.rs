//! Filesystem observation via `notify`.

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use kiln_types::{KilnError, Result};

/// Forwards changed file paths under a directory into a dispatcher channel.
/// Observation stops when this value is dropped.
pub struct FsObserver {
    _watcher: RecommendedWatcher,
}

impl FsObserver {
    pub fn new(root: &Path, sink: mpsc::UnboundedSender<PathBuf>) -> Result<Self> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if !matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                ) {
                    return;
                }
                for path in event.paths {
                    // The receiver is gone once the dispatcher has stopped.
                    let _ = sink.send(path);
                }
            }
            Err(e) => tracing::warn!(error = %e, "File watcher error"),
        })
        .map_err(watch_error)?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(watch_error)?;
        tracing::debug!(root = %root.display(), "Observing filesystem");
        Ok(Self { _watcher: watcher })
    }
}

fn watch_error(e: notify::Error) -> KilnError {
    KilnError::Io(std::io::Error::other(e.to_string()))
}
