use crate::schema::Config;
use arc_swap::ArcSwap;
use notify::{Event, EventKind, RecursiveMode, Watcher as _};
use rendergate_types::GenError;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{sync::mpsc, task::JoinHandle};

/// A configuration handle that reloads swap in place.
pub type SharedConfig = Arc<ArcSwap<Config>>;

/// Keeps a [`SharedConfig`] in sync with a YAML file on disk.
///
/// Consumers hold [`ConfigWatcher::shared`] and read it per operation; the
/// retry orchestrator built from it picks up a new `retry` table on its next
/// invocation.
pub struct ConfigWatcher {
    shared: SharedConfig,
    path: PathBuf,
}

impl ConfigWatcher {
    /// Loads and validates `path` (plus `RENDERGATE_` overrides).
    ///
    /// # Errors
    ///
    /// [`GenError::Config`] when the file is unreadable, malformed or invalid.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, GenError> {
        let path = path.into();
        let config = read_validated(&path)?;
        Ok(Self {
            shared: Arc::new(ArcSwap::from_pointee(config)),
            path,
        })
    }

    /// The swappable handle readers should keep.
    #[must_use]
    pub fn shared(&self) -> SharedConfig {
        Arc::clone(&self.shared)
    }

    /// The configuration in effect right now.
    #[must_use]
    pub fn current(&self) -> Arc<Config> {
        self.shared.load_full()
    }

    /// Re-reads the file. Returns `true` when the active configuration changed.
    ///
    /// # Errors
    ///
    /// An unreadable or invalid file is rejected with [`GenError::Config`];
    /// the previous configuration stays active.
    pub fn reload(&self) -> Result<bool, GenError> {
        let next = read_validated(&self.path)?;
        if *self.shared.load_full() == next {
            return Ok(false);
        }
        self.shared.store(Arc::new(next));
        Ok(true)
    }

    /// Watches the file's directory and reloads on writes to the file.
    ///
    /// Editors often replace a file instead of writing it, so the parent
    /// directory is watched and events are filtered by file name.
    ///
    /// # Errors
    ///
    /// [`GenError::Config`] if the OS watcher cannot be created or attached.
    pub fn watch(self: Arc<Self>) -> Result<JoinHandle<()>, GenError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| GenError::Config(format!("config watcher: {e}")))?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| GenError::Config(format!("watch {}: {e}", dir.display())))?;
        tracing::info!(path = %self.path.display(), "watching configuration");

        Ok(tokio::spawn(async move {
            let _watcher = watcher;
            while let Some(event) = rx.recv().await {
                if self.touches_file(&event) {
                    self.apply_reload();
                }
            }
        }))
    }

    fn touches_file(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
            && event
                .paths
                .iter()
                .any(|p| p.file_name() == self.path.file_name())
    }

    fn apply_reload(&self) {
        let path = self.path.display();
        match self.reload() {
            Ok(true) => tracing::info!(path = %path, "configuration reloaded"),
            Ok(false) => tracing::debug!(path = %path, "configuration unchanged"),
            Err(e) => tracing::warn!(path = %path, error = %e, "configuration rejected"),
        }
    }
}

fn read_validated(path: &Path) -> Result<Config, GenError> {
    let config = Config::from_file(path)
        .map_err(|e| GenError::Config(format!("{}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}
