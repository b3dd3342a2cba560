//! Hot reload triggers for the server document and environment file.
//!
//! Filesystem events are first batched by `notify-debouncer-mini`, then the
//! reload loop coalesces every trigger that arrives within one debounce
//! window into a single reload.

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Batching interval for raw filesystem events, independent of the reload
/// debounce window.
const FS_EVENT_BATCH_MS: u64 = 200;

/// Keeps the underlying filesystem watch alive; dropping it stops watching.
pub struct ConfigWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
    watched: Vec<PathBuf>,
}

impl ConfigWatcher {
    /// Starts watching `files`. Each batch of events touching one of them
    /// sends one trigger on `triggers`.
    ///
    /// Returns `None` when the watch cannot be established; hot reload is
    /// then unavailable but nothing else is affected.
    pub fn spawn(files: &[&Path], triggers: mpsc::UnboundedSender<()>) -> Option<Self> {
        let file_names: BTreeSet<OsString> = files
            .iter()
            .filter_map(|path| path.file_name().map(|name| name.to_os_string()))
            .collect();
        let directories: BTreeSet<PathBuf> = files.iter().map(|path| watch_dir(path)).collect();

        let handler = move |result: DebounceEventResult| match result {
            Ok(events) => {
                let relevant = events.iter().any(|event| {
                    event
                        .path
                        .file_name()
                        .is_some_and(|name| file_names.contains(name))
                });
                if relevant {
                    debug!("Config file change detected");
                    let _ = triggers.send(());
                }
            }
            Err(err) => {
                warn!(error = %err, "Config watch error");
            }
        };

        let mut debouncer =
            match new_debouncer(Duration::from_millis(FS_EVENT_BATCH_MS), handler) {
                Ok(debouncer) => debouncer,
                Err(err) => {
                    warn!(error = %err, "Failed to create config watcher; hot reload disabled");
                    return None;
                }
            };

        let mut watched = Vec::new();
        for dir in directories {
            match debouncer.watcher().watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => watched.push(dir),
                Err(err) => {
                    warn!(
                        path = %dir.display(),
                        error = %err,
                        "Failed to watch config directory; hot reload disabled for it"
                    );
                }
            }
        }

        if watched.is_empty() {
            return None;
        }
        info!(directories = ?watched, "Watching configuration for changes");
        Some(Self {
            _debouncer: debouncer,
            watched,
        })
    }

    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }
}

/// Directory to watch for `file`. Editors often replace files by rename, so
/// the parent directory is watched rather than the file itself.
fn watch_dir(file: &Path) -> PathBuf {
    match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Runs `on_reload` at most once per debounce window, however many triggers
/// arrive within it. `window` is asked for the current length at the start
/// of every window, so a reload can change it. Returns when `cancel` fires
/// or the trigger channel closes.
pub async fn run_reload_loop<W, F, Fut>(
    mut triggers: mpsc::UnboundedReceiver<()>,
    window: W,
    cancel: CancellationToken,
    mut on_reload: F,
) where
    W: Fn() -> Duration,
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    return;
                }
            }
        }

        let deadline = tokio::time::Instant::now() + window();
        let mut closed = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => break,
                trigger = triggers.recv() => {
                    if trigger.is_none() {
                        closed = true;
                        break;
                    }
                }
            }
        }

        on_reload().await;
        if closed {
            return;
        }
    }
}
