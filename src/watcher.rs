// src/watcher.rs

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver},
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{debug, error, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_RETRIES: usize = 10;

/// Something that reacts to a file on disk changing.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;
    async fn on_remove(&self, path: &Path) -> Result<()>;
}

/// Polls a directory and forwards relevant changes to a [`WatchedType`].
/// Dropping it, or calling [`FileWatcher::shutdown`], stops the polling.
pub struct FileWatcher {
    watcher: Option<PollWatcher>,
    dispatch: JoinHandle<()>,
}

impl FileWatcher {
    pub fn new(dir: &Path, target: Arc<dyn WatchedType>) -> Result<Self> {
        if !dir.is_dir() {
            bail!("directory {} does not exist", dir.display());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = PollWatcher::new(
            move |res| {
                // the receiver is gone once the watcher shuts down
                let _ = tx.send(res);
            },
            Config::default()
                .with_poll_interval(POLL_INTERVAL)
                .with_compare_contents(true),
        )
        .context("creating poll watcher")?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching {}", dir.display()))?;

        let dispatch = tokio::spawn(dispatch(rx, target));
        Ok(FileWatcher {
            watcher: Some(watcher),
            dispatch,
        })
    }

    pub fn shutdown(mut self) {
        self.watcher.take();
        self.dispatch.abort();
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

async fn dispatch(mut rx: UnboundedReceiver<notify::Result<Event>>, target: Arc<dyn WatchedType>) {
    while let Some(res) = rx.recv().await {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "watcher error");
                continue;
            }
        };
        let relevant: Vec<PathBuf> = event
            .paths
            .into_iter()
            .filter(|p| target.is_relevant(p))
            .collect();
        if relevant.is_empty() {
            continue;
        }
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in relevant {
                    debug!(path = %path.display(), "file changed");
                    reload(&target, &path).await;
                }
            }
            EventKind::Remove(_) => {
                for path in relevant {
                    if let Err(e) = target.on_remove(&path).await {
                        warn!(path = %path.display(), error = %e, "handling removal failed");
                    }
                }
            }
            _ => {}
        }
    }
}

/// Editors often write a file in several steps, so a failed reload is
/// retried a few times before giving up.
async fn reload(target: &Arc<dyn WatchedType>, path: &Path) {
    for attempt in 1..=MAX_RETRIES {
        match target.on_create_or_modify(path).await {
            Ok(()) => return,
            Err(e) if attempt == MAX_RETRIES => {
                error!(path = %path.display(), error = %e, "reload failed");
            }
            Err(e) => {
                debug!(path = %path.display(), attempt, error = %e, "reload failed, retrying");
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Matches exactly one file.
pub fn same_file(watched: &Path, candidate: &Path) -> bool {
    match (watched.canonicalize(), candidate.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => watched.file_name().is_some() && watched.file_name() == candidate.file_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTarget {
        file: PathBuf,
        changes: AtomicUsize,
    }

    #[async_trait]
    impl WatchedType for CountingTarget {
        fn is_relevant(&self, path: &Path) -> bool {
            same_file(&self.file, path)
        }

        async fn on_create_or_modify(&self, _path: &Path) -> Result<()> {
            self.changes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_remove(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn same_file_matches_by_name_when_missing() {
        assert!(same_file(Path::new("/nowhere/flow.json"), Path::new("/elsewhere/flow.json")));
        assert!(!same_file(Path::new("/nowhere/flow.json"), Path::new("/nowhere/other.json")));
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let target = Arc::new(CountingTarget {
            file: PathBuf::from("x.json"),
            changes: AtomicUsize::new(0),
        });
        assert!(FileWatcher::new(Path::new("/definitely/not/here"), target).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn modifications_reach_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("flow.json");
        std::fs::write(&file, "{}").unwrap();
        let target = Arc::new(CountingTarget {
            file: file.clone(),
            changes: AtomicUsize::new(0),
        });
        let watcher = FileWatcher::new(dir.path(), target.clone()).unwrap();

        sleep(Duration::from_millis(200)).await;
        std::fs::write(&file, "{\"nodes\": []}").unwrap();
        for _ in 0..50 {
            if target.changes.load(Ordering::SeqCst) > 0 {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        assert!(target.changes.load(Ordering::SeqCst) > 0);
        watcher.shutdown();
    }
}
