//! File watcher used to hot-reload key material without a restart.
//!
//! Watches the parent directory of a file plus the resolved symlink target,
//! so replacing the target behind a symlink (the common deployment pattern
//! for rotated secrets) is observed as well. Events for the same file are
//! deduplicated with a per-file one-shot timer; the timer duration is a
//! process-wide tunable that can be changed at runtime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default interval for deduplicating watch events.
const DEFAULT_DEDUPLICATE_WATCH_EVENTS: Duration = Duration::from_millis(100);

static DEDUPLICATE_WATCH_EVENTS_MILLIS: AtomicU64 =
    AtomicU64::new(DEFAULT_DEDUPLICATE_WATCH_EVENTS.as_millis() as u64);

/// Change the event-deduplication interval. Zero disables deduplication.
pub fn set_deduplicate_watch_events(duration: Duration) {
    DEDUPLICATE_WATCH_EVENTS_MILLIS.store(duration.as_millis() as u64, Ordering::Relaxed);
}

pub fn deduplicate_watch_events() -> Duration {
    Duration::from_millis(DEDUPLICATE_WATCH_EVENTS_MILLIS.load(Ordering::Relaxed))
}

type WatchCallback = Arc<dyn Fn(&Path) + Send + Sync>;

/// Watches a single file and fires a callback after it changed.
///
/// The callback always receives the originally watched filename, never the
/// resolved target. Dropping the watcher stops the run task and the
/// underlying OS watcher.
pub struct FileWatcher {
    filename: PathBuf,
    task: JoinHandle<()>,
}

impl FileWatcher {
    pub fn new(
        filename: impl Into<PathBuf>,
        callback: impl Fn(&Path) + Send + Sync + 'static,
    ) -> Result<Self, notify::Error> {
        let filename = filename.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;

        let parent = filename.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;

        let target = resolve_and_watch(&mut watcher, &filename)?;

        let run = RunState {
            filename: filename.clone(),
            target,
            watcher,
            callback: Arc::new(callback),
            timers: Arc::new(Mutex::new(HashMap::new())),
        };
        let task = tokio::spawn(run.run(rx));

        Ok(Self { filename, task })
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Stop watching. Also happens implicitly on drop.
    pub fn close(self) {}
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn resolve_and_watch(
    watcher: &mut RecommendedWatcher,
    filename: &Path,
) -> Result<PathBuf, notify::Error> {
    let target = std::fs::canonicalize(filename)?;
    watcher.watch(&target, RecursiveMode::NonRecursive)?;
    Ok(target)
}

struct RunState {
    filename: PathBuf,
    target: PathBuf,
    watcher: RecommendedWatcher,
    callback: WatchCallback,
    timers: Arc<Mutex<HashMap<PathBuf, JoinHandle<()>>>>,
}

impl RunState {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Result<notify::Event, notify::Error>>) {
        while let Some(res) = rx.recv().await {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(filename = %self.filename.display(), %err, "error watching file");
                    continue;
                }
            };
            self.handle_event(event);
        }

        // Sender dropped: the watcher is gone, cancel pending timers.
        for (_, timer) in self.timers.lock().drain() {
            timer.abort();
        }
    }

    fn handle_event(&mut self, event: notify::Event) {
        use notify::event::ModifyKind;
        // Content writes, creates, renames, and removes; not chmod or access.
        let relevant = matches!(
            event.kind,
            EventKind::Modify(ModifyKind::Data(_))
                | EventKind::Modify(ModifyKind::Name(_))
                | EventKind::Modify(ModifyKind::Any)
                | EventKind::Create(_)
                | EventKind::Remove(_)
        );
        if !relevant {
            return;
        }

        if matches!(event.kind, EventKind::Remove(_)) {
            // Watched target was deleted; assume it was symlinked and try to
            // watch the new target.
            if !event.paths.iter().any(|p| *p == self.target) {
                return;
            }
            self.trigger(self.target.clone());
            match resolve_and_watch(&mut self.watcher, &self.filename) {
                Ok(target) => self.target = target,
                Err(err) => {
                    tracing::warn!(
                        filename = %self.filename.display(),
                        %err,
                        "error updating watcher after target was deleted"
                    );
                }
            }
            return;
        }

        for path in &event.paths {
            if let Ok(meta) = std::fs::symlink_metadata(path) {
                if meta.file_type().is_symlink() {
                    // The symlink itself changed: follow it to the new target.
                    if let Ok(resolved) = std::fs::canonicalize(path) {
                        if resolved != self.target && path_matches(path, &self.filename) {
                            self.target = resolved;
                            self.trigger(path.clone());
                        }
                    }
                    continue;
                }
            }

            if path_matches(path, &self.filename) || path_matches(path, &self.target) {
                self.trigger(path.clone());
            }
        }
    }

    /// Schedule the callback for an observed path, deduplicating repeated
    /// events within the configured interval.
    fn trigger(&self, observed: PathBuf) {
        let deduplicate = deduplicate_watch_events();
        if deduplicate.is_zero() {
            (self.callback)(&self.filename);
            return;
        }

        let mut timers = self.timers.lock();
        if let Some(previous) = timers.remove(&observed) {
            previous.abort();
        }

        let timers_ref = self.timers.clone();
        let callback = self.callback.clone();
        let filename = self.filename.clone();
        let key = observed.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deduplicate).await;
            timers_ref.lock().remove(&key);
            callback(&filename);
        });
        timers.insert(observed, timer);
    }
}

fn path_matches(path: &Path, reference: &Path) -> bool {
    path == reference || path.ends_with(reference) || path.file_name() == reference.file_name()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counted_callback() -> (Arc<AtomicUsize>, impl Fn(&Path) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        (count, move |_: &Path| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn burst_of_writes_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("watched.conf");
        std::fs::write(&file, "initial").unwrap();

        let (count, callback) = counted_callback();
        let watcher = FileWatcher::new(&file, callback).unwrap();
        // Give the OS watcher a moment to arm.
        tokio::time::sleep(Duration::from_millis(50)).await;

        for i in 0..10 {
            std::fs::write(&file, format!("change {i}")).unwrap();
            tokio::time::sleep(Duration::from_millis(4)).await;
        }

        // All ten writes land within the 100ms dedup interval.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        watcher.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_write_fires_after_interval() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("watched.conf");
        std::fs::write(&file, "initial").unwrap();

        let (count, callback) = counted_callback();
        let _watcher = FileWatcher::new(&file, callback).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        std::fs::write(&file, "changed").unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn callback_receives_original_filename() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("watched.conf");
        std::fs::write(&file, "initial").unwrap();

        let seen: Arc<Mutex<Vec<PathBuf>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_ref = seen.clone();
        let file_ref = file.clone();
        let _watcher = FileWatcher::new(&file, move |path: &Path| {
            seen_ref.lock().push(path.to_path_buf());
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        std::fs::write(&file, "changed").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let seen = seen.lock();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|p| *p == file_ref));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replaced_file_is_still_watched() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("watched.conf");
        std::fs::write(&file, "initial").unwrap();

        let (count, callback) = counted_callback();
        let _watcher = FileWatcher::new(&file, callback).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Replace by remove + create, as editors and secret rotation do.
        std::fs::remove_file(&file).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        let after_remove = count.load(Ordering::SeqCst);
        assert!(after_remove >= 1);

        std::fs::write(&file, "replacement").unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(count.load(Ordering::SeqCst) > after_remove);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watching_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("does-not-exist.conf");
        let (_, callback) = counted_callback();
        assert!(FileWatcher::new(&file, callback).is_err());
    }

    #[test]
    fn dedup_tunable_roundtrip() {
        assert_eq!(deduplicate_watch_events(), DEFAULT_DEDUPLICATE_WATCH_EVENTS);
        set_deduplicate_watch_events(DEFAULT_DEDUPLICATE_WATCH_EVENTS);
        assert_eq!(deduplicate_watch_events(), DEFAULT_DEDUPLICATE_WATCH_EVENTS);
    }
}
