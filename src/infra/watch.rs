use notify::event::EventKind;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError, channel};
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatchSignal {
    Changed,
    Error(String),
}

#[derive(Debug)]
pub struct SessionLogWatcher {
    _watcher: RecommendedWatcher,
    rx: Receiver<WatchSignal>,
}

impl SessionLogWatcher {
    pub fn try_recv(&self) -> Option<WatchSignal> {
        self.rx.try_recv().ok()
    }

    /// `None` on timeout or once the watcher has shut down.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WatchSignal> {
        match self.rx.recv_timeout(timeout) {
            Ok(signal) => Some(signal),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Collapses a burst of signals into one; errors win.
    pub fn drain(&self) -> Option<WatchSignal> {
        let mut last = None;
        while let Some(signal) = self.try_recv() {
            if matches!(last, Some(WatchSignal::Error(_))) {
                continue;
            }
            last = Some(signal);
        }
        last
    }
}

#[derive(Debug, Error)]
pub enum WatchSessionLogError {
    #[error("watch error: {0}")]
    Notify(#[from] notify::Error),

    #[error("session log has no parent directory: {0}")]
    NoParent(PathBuf),
}

/// Watches one log file. The parent directory is watched because logs are replaced by rename.
pub fn watch_session_log(path: &Path) -> Result<SessionLogWatcher, WatchSessionLogError> {
    let parent = path
        .parent()
        .ok_or_else(|| WatchSessionLogError::NoParent(path.to_path_buf()))?;
    let target = path.to_path_buf();
    let (tx, rx) = channel::<WatchSignal>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                if touches_log(&event, &target) {
                    let _ = tx.send(WatchSignal::Changed);
                }
            }
            Err(error) => {
                let _ = tx.send(WatchSignal::Error(error.to_string()));
            }
        },
        Config::default(),
    )?;

    watcher.watch(parent, RecursiveMode::NonRecursive)?;

    Ok(SessionLogWatcher {
        _watcher: watcher,
        rx,
    })
}

fn touches_log(event: &notify::Event, target: &Path) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    if event.paths.is_empty() {
        return true;
    }

    event.paths.iter().any(|path| path == target)
}
