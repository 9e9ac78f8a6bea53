//! Filesystem watch registry with self-write suppression.
//!
//! Wraps `notify`'s recommended watcher (inotify on Linux, kqueue on
//! macOS). Each registered watch carries a `last_programmatic_write`
//! timestamp; change notifications arriving within the debounce window
//! of that timestamp are dropped, so the orchestrator's own writes (e.g.
//! generating a project id into the settings file) never feed back as
//! change events.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default suppression window after a programmatic write.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

/// Opaque id for a registered watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

/// Callback invoked with the changed path. Runs on the watcher's thread;
/// keep it cheap and forward into a channel for real work.
pub type ChangeCallback = Arc<dyn Fn(&Path) + Send + Sync>;

struct WatchEntry {
    // Held to keep the OS watch alive; dropped on close.
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

/// Registry of active filesystem watches.
pub struct WatchRegistry {
    debounce: Duration,
    entries: HashMap<WatchId, WatchEntry>,
    marks: Arc<Mutex<HashMap<WatchId, Instant>>>,
    next_id: u64,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::with_debounce(DEBOUNCE_WINDOW)
    }

    pub fn with_debounce(debounce: Duration) -> Self {
        Self {
            debounce,
            entries: HashMap::new(),
            marks: Arc::new(Mutex::new(HashMap::new())),
            next_id: 0,
        }
    }

    /// Watch a single file for changes.
    pub fn watch(&mut self, path: &Path, on_change: ChangeCallback) -> anyhow::Result<WatchId> {
        self.register(path, RecursiveMode::NonRecursive, on_change)
    }

    /// Watch a directory tree recursively.
    pub fn watch_tree(
        &mut self,
        path: &Path,
        on_change: ChangeCallback,
    ) -> anyhow::Result<WatchId> {
        self.register(path, RecursiveMode::Recursive, on_change)
    }

    fn register(
        &mut self,
        path: &Path,
        mode: RecursiveMode,
        on_change: ChangeCallback,
    ) -> anyhow::Result<WatchId> {
        let id = WatchId(self.next_id);
        self.next_id += 1;

        let marks = Arc::clone(&self.marks);
        let debounce = self.debounce;
        let watched = path.to_path_buf();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "watch backend error");
                        return;
                    }
                };
                if !event.kind.is_modify() && !event.kind.is_create() && !event.kind.is_remove() {
                    return;
                }
                // Suppress notifications caused by our own write
                if let Some(mark) = marks.lock().expect("marks lock").get(&id) {
                    if mark.elapsed() < debounce {
                        debug!(path = %watched.display(), "change suppressed inside debounce window");
                        return;
                    }
                }
                for changed in &event.paths {
                    on_change(changed);
                }
            },
            Config::default(),
        )?;
        watcher.watch(path, mode)?;

        debug!(path = %path.display(), ?id, "watch registered");
        self.entries.insert(
            id,
            WatchEntry {
                _watcher: watcher,
                path: path.to_path_buf(),
            },
        );
        Ok(id)
    }

    /// Record that the orchestrator is about to write (or just wrote) the
    /// watched path itself. Notifications inside the debounce window are
    /// dropped.
    pub fn mark_programmatic_write(&self, id: WatchId) {
        self.marks
            .lock()
            .expect("marks lock")
            .insert(id, Instant::now());
    }

    /// Path a watch was registered for.
    pub fn path_of(&self, id: WatchId) -> Option<&Path> {
        self.entries.get(&id).map(|e| e.path.as_path())
    }

    /// Stop one watch.
    pub fn close(&mut self, id: WatchId) {
        if let Some(entry) = self.entries.remove(&id) {
            debug!(path = %entry.path.display(), ?id, "watch closed");
        }
        self.marks.lock().expect("marks lock").remove(&id);
    }

    /// Stop every watch. Idempotent.
    pub fn close_all(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        self.marks.lock().expect("marks lock").clear();
        if count > 0 {
            debug!(count, "all watches closed");
        }
    }

    pub fn active_count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn wait_for_event(rx: &mpsc::Receiver<PathBuf>, timeout: Duration) -> Option<PathBuf> {
        rx.recv_timeout(timeout).ok()
    }

    #[test]
    fn test_watch_fires_on_external_change() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("specdeck.toml");
        std::fs::write(&file, "port = 1\n").unwrap();

        let mut registry = WatchRegistry::new();
        let (tx, rx) = mpsc::channel();
        registry
            .watch(
                &file,
                Arc::new(move |p: &Path| {
                    let _ = tx.send(p.to_path_buf());
                }),
            )
            .unwrap();

        // Give the backend a moment to arm before writing
        std::thread::sleep(Duration::from_millis(300));
        std::fs::write(&file, "port = 2\n").unwrap();

        let changed = wait_for_event(&rx, Duration::from_secs(5));
        assert!(changed.is_some(), "expected a change notification");
    }

    #[test]
    fn test_programmatic_write_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("specdeck.toml");
        std::fs::write(&file, "port = 1\n").unwrap();

        let mut registry = WatchRegistry::new();
        let (tx, rx) = mpsc::channel();
        let id = registry
            .watch(
                &file,
                Arc::new(move |p: &Path| {
                    let _ = tx.send(p.to_path_buf());
                }),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(300));
        registry.mark_programmatic_write(id);
        std::fs::write(&file, "port = 2\n").unwrap();

        assert!(
            wait_for_event(&rx, Duration::from_millis(1500)).is_none(),
            "self-write must not notify"
        );

        // After the window closes, external edits fire again
        std::thread::sleep(Duration::from_millis(1200));
        std::fs::write(&file, "port = 3\n").unwrap();
        assert!(wait_for_event(&rx, Duration::from_secs(5)).is_some());
    }

    #[test]
    fn test_watch_tree_sees_nested_changes() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("deck").join("integration");
        std::fs::create_dir_all(&nested).unwrap();

        let mut registry = WatchRegistry::new();
        let (tx, rx) = mpsc::channel();
        registry
            .watch_tree(
                dir.path(),
                Arc::new(move |p: &Path| {
                    let _ = tx.send(p.to_path_buf());
                }),
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(300));
        std::fs::write(nested.join("new.spec.toml"), "").unwrap();

        let changed = wait_for_event(&rx, Duration::from_secs(5)).expect("nested change");
        assert!(changed.starts_with(dir.path()));
    }

    #[test]
    fn test_close_all_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.toml");
        std::fs::write(&file, "").unwrap();

        let mut registry = WatchRegistry::new();
        registry.watch(&file, Arc::new(|_: &Path| {})).unwrap();
        assert_eq!(registry.active_count(), 1);

        registry.close_all();
        assert_eq!(registry.active_count(), 0);
        registry.close_all();
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_closed_watch_stops_notifying() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.toml");
        std::fs::write(&file, "x = 1\n").unwrap();

        let mut registry = WatchRegistry::new();
        let (tx, rx) = mpsc::channel();
        let id = registry
            .watch(
                &file,
                Arc::new(move |p: &Path| {
                    let _ = tx.send(p.to_path_buf());
                }),
            )
            .unwrap();
        registry.close(id);

        std::thread::sleep(Duration::from_millis(300));
        std::fs::write(&file, "x = 2\n").unwrap();
        assert!(wait_for_event(&rx, Duration::from_millis(1500)).is_none());
    }
}
