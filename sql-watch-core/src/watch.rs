//! Filesystem watching: turns `notify` events into sequential engine runs.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::db::Database;
use crate::engine::{Continuation, Prompt, SqlWatch};
use crate::error::Result;

/// How often a settling file is checked for further writes.
const SETTLE_POLL: Duration = Duration::from_millis(100);

/// A change to a file under the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(PathBuf),
    Changed(PathBuf),
    Removed(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Added(p) | WatchEvent::Changed(p) | WatchEvent::Removed(p) => p,
        }
    }
}

/// Map a raw `notify` event to watch events. Directories and access events are dropped.
pub fn classify(event: &Event) -> Vec<WatchEvent> {
    let files = || {
        event
            .paths
            .iter()
            .filter(|p| !p.is_dir())
            .cloned()
            .collect::<Vec<_>>()
    };

    match event.kind {
        EventKind::Create(_) => files().into_iter().map(WatchEvent::Added).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .cloned()
            .map(WatchEvent::Removed)
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            files().into_iter().map(WatchEvent::Added).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut events = Vec::new();
            if let Some(from) = event.paths.first() {
                events.push(WatchEvent::Removed(from.clone()));
            }
            if let Some(to) = event.paths.get(1).filter(|p| !p.is_dir()) {
                events.push(WatchEvent::Added(to.clone()));
            }
            events
        }
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .filter(|p| !p.is_dir())
            .map(|p| {
                if p.exists() {
                    WatchEvent::Added(p.clone())
                } else {
                    WatchEvent::Removed(p.clone())
                }
            })
            .collect(),
        EventKind::Modify(_) => files().into_iter().map(WatchEvent::Changed).collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .cloned()
            .map(WatchEvent::Removed)
            .collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// Size and modification time, or `None` if the file is gone.
fn file_stamp(path: &Path) -> Option<(u64, SystemTime)> {
    let metadata = std::fs::metadata(path).ok()?;
    Some((metadata.len(), metadata.modified().ok()?))
}

/// Wait until `path` has not changed for `settle`. Returns false if it disappeared.
async fn wait_for_write_finish(path: &Path, settle: Duration) -> bool {
    let mut last = file_stamp(path);
    let mut stable_since = tokio::time::Instant::now();
    loop {
        if last.is_none() {
            return false;
        }
        if stable_since.elapsed() >= settle {
            return true;
        }
        tokio::time::sleep(SETTLE_POLL).await;
        let current = file_stamp(path);
        if current != last {
            last = current;
            stable_since = tokio::time::Instant::now();
        }
    }
}

/// Recursive watcher over the script root.
///
/// Only changes made after [`ScriptWatcher::start`] are reported.
pub struct ScriptWatcher {
    receiver: mpsc::UnboundedReceiver<notify::Result<Event>>,
    pending: VecDeque<WatchEvent>,
    settle: Duration,
    _watcher: Option<RecommendedWatcher>,
}

impl ScriptWatcher {
    /// Start watching `root` recursively.
    pub fn start(root: &Path, settle: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        log::debug!("Watching {}", root.display());

        Ok(Self {
            receiver: rx,
            pending: VecDeque::new(),
            settle,
            _watcher: Some(watcher),
        })
    }

    fn enqueue(&mut self, raw: notify::Result<Event>) {
        match raw {
            Ok(event) => {
                self.pending.extend(classify(&event));
            }
            Err(e) => log::debug!("There was an error {}", e),
        }
    }

    fn drain_ready(&mut self) {
        while let Ok(raw) = self.receiver.try_recv() {
            self.enqueue(raw);
        }
    }

    /// The next file event, after the file has finished being written.
    ///
    /// Every notification yields its own event, in arrival order, including
    /// repeats for the same path. Returns `None` once the watcher has stopped.
    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        loop {
            self.drain_ready();
            if self.pending.is_empty() {
                let raw = self.receiver.recv().await?;
                self.enqueue(raw);
                continue;
            }

            let event = self.pending.pop_front()?;
            if let WatchEvent::Added(ref path) | WatchEvent::Changed(ref path) = event {
                if !wait_for_write_finish(path, self.settle).await {
                    continue;
                }
            }
            return Some(event);
        }
    }
}

/// Feed watch events into the engine, one run at a time, until the engine
/// reports it is done or the watcher stops.
pub async fn watch<D: Database, P: Prompt>(
    engine: &mut SqlWatch<D, P>,
    watcher: &mut ScriptWatcher,
) -> Result<()> {
    while let Some(event) = watcher.next_event().await {
        let next = match event {
            WatchEvent::Added(ref path) => {
                log::debug!("File {} has been added", path.display());
                engine.run(false, Some(path)).await?
            }
            WatchEvent::Changed(ref path) => {
                log::debug!("File {} has been changed", path.display());
                engine.run(false, Some(path)).await?
            }
            WatchEvent::Removed(ref path) => {
                log::debug!("File {} has been removed", path.display());
                engine.run(true, Some(path)).await?
            }
        };
        if next == Continuation::Done {
            break;
        }
    }
    Ok(())
}
