//! Directory change detection for the share engine.
//!
//! Wraps a recursive [`notify`] watcher into typed create/update/remove
//! events with wire-relative paths, filtered by the server's ignore
//! pattern. The watcher is an owned instance with an explicit start/stop
//! lifecycle; dropping it stops the OS watch and closes the event channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::paths;
use crate::protocol::{ChangeKind, EntryKind};

/// One typed change inside the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub change: ChangeKind,
    pub entry: EntryKind,
    /// Absolute path on the serving host.
    pub path: PathBuf,
    /// Root-relative wire path.
    pub rel: String,
}

/// Recursive watcher over one directory root.
pub struct Watcher {
    root: PathBuf,
    ignore: Option<Regex>,
    inner: Option<RecommendedWatcher>,
}

impl Watcher {
    pub fn new(root: impl Into<PathBuf>, ignore: Option<Regex>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            bail!("watch root {} is not a directory", root.display());
        }
        Ok(Self {
            root,
            ignore,
            inner: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Begin watching. Returns the receiver of typed events; call from
    /// within a tokio runtime.
    pub fn start(&mut self) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = raw_tx.send(res);
        })
        .context("create file-system watcher")?;
        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", self.root.display()))?;
        self.inner = Some(watcher);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let root = self.root.clone();
        let ignore = self.ignore.clone();
        tokio::spawn(translate_events(root, ignore, raw_rx, out_tx));
        Ok(out_rx)
    }

    /// Stop the OS watch. The event channel closes once pending raw events
    /// drain.
    pub fn stop(&mut self) {
        self.inner = None;
    }
}

/// Index the current tree so later removals can still be typed.
fn seed_known(root: &Path) -> HashMap<PathBuf, EntryKind> {
    let mut known = HashMap::new();
    for entry in WalkDir::new(root).into_iter().flatten() {
        let kind = if entry.file_type().is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };
        known.insert(entry.path().to_path_buf(), kind);
    }
    known
}

async fn translate_events(
    root: PathBuf,
    ignore: Option<Regex>,
    mut raw_rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    out_tx: mpsc::UnboundedSender<WatchEvent>,
) {
    let mut known = seed_known(&root);
    while let Some(raw) = raw_rx.recv().await {
        let event = match raw {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "watcher backend error");
                continue;
            }
        };
        for path in &event.paths {
            let Some(rel) = paths::rel_string(&root, path) else {
                continue;
            };
            if rel.is_empty() || paths::ignored(ignore.as_ref(), &rel) {
                continue;
            }
            let Some(typed) = classify(&mut known, event.kind, path, rel) else {
                continue;
            };
            debug!(change = ?typed.change, entry = ?typed.entry, path = %typed.rel, "change detected");
            if out_tx.send(typed).is_err() {
                return;
            }
        }
    }
}

/// Map one raw notify event on one path to a typed change, updating the
/// known-entries index. Returns `None` for events the protocol does not
/// carry (metadata touches, access events).
fn classify(
    known: &mut HashMap<PathBuf, EntryKind>,
    kind: EventKind,
    path: &Path,
    rel: String,
) -> Option<WatchEvent> {
    let stat_entry = || {
        if path.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        }
    };
    match kind {
        EventKind::Create(_) => {
            let entry = stat_entry();
            known.insert(path.to_path_buf(), entry);
            Some(WatchEvent {
                change: ChangeKind::Create,
                entry,
                path: path.to_path_buf(),
                rel,
            })
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Renames surface as one event per side; the vanished side is a
            // removal, the appearing side a creation.
            if path.exists() {
                let entry = stat_entry();
                let change = if known.insert(path.to_path_buf(), entry).is_some() {
                    ChangeKind::Update
                } else {
                    ChangeKind::Create
                };
                Some(WatchEvent {
                    change,
                    entry,
                    path: path.to_path_buf(),
                    rel,
                })
            } else {
                let entry = known.remove(path).unwrap_or(EntryKind::File);
                Some(WatchEvent {
                    change: ChangeKind::Remove,
                    entry,
                    path: path.to_path_buf(),
                    rel,
                })
            }
        }
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            if known.get(path) == Some(&EntryKind::Dir) || path.is_dir() {
                return None;
            }
            known.insert(path.to_path_buf(), EntryKind::File);
            Some(WatchEvent {
                change: ChangeKind::Update,
                entry: EntryKind::File,
                path: path.to_path_buf(),
                rel,
            })
        }
        EventKind::Remove(_) => {
            let entry = known.remove(path).unwrap_or(EntryKind::File);
            Some(WatchEvent {
                change: ChangeKind::Remove,
                entry,
                path: path.to_path_buf(),
                rel,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    async fn next_matching(
        rx: &mut mpsc::UnboundedReceiver<WatchEvent>,
        want: impl Fn(&WatchEvent) -> bool,
    ) -> WatchEvent {
        timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.expect("watch channel closed");
                if want(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for watch event")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reports_create_and_remove() {
        let tmp = TempDir::new().unwrap();
        let mut watcher = Watcher::new(tmp.path(), None).unwrap();
        let mut rx = watcher.start().unwrap();

        fs::write(tmp.path().join("hello.txt"), "hi").unwrap();
        let created = next_matching(&mut rx, |e| {
            e.rel == "hello.txt" && e.change == ChangeKind::Create
        })
        .await;
        assert_eq!(created.entry, EntryKind::File);

        fs::remove_file(tmp.path().join("hello.txt")).unwrap();
        let removed = next_matching(&mut rx, |e| {
            e.rel == "hello.txt" && e.change == ChangeKind::Remove
        })
        .await;
        assert_eq!(removed.entry, EntryKind::File);

        watcher.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ignore_pattern_filters_events() {
        let tmp = TempDir::new().unwrap();
        let ignore = Regex::new(r"\.swp$").unwrap();
        let mut watcher = Watcher::new(tmp.path(), Some(ignore)).unwrap();
        let mut rx = watcher.start().unwrap();

        fs::write(tmp.path().join("edit.swp"), "x").unwrap();
        fs::write(tmp.path().join("real.txt"), "x").unwrap();

        // The first event to arrive must be for the non-ignored file.
        let event = next_matching(&mut rx, |_| true).await;
        assert_eq!(event.rel, "real.txt");

        watcher.stop();
    }

    #[test]
    fn classify_types_removals_from_known_index() {
        let mut known = HashMap::new();
        known.insert(PathBuf::from("/w/sub"), EntryKind::Dir);
        let event = classify(
            &mut known,
            EventKind::Remove(notify::event::RemoveKind::Any),
            Path::new("/w/sub"),
            "sub".into(),
        )
        .unwrap();
        assert_eq!(event.entry, EntryKind::Dir);
        assert_eq!(event.change, ChangeKind::Remove);
        assert!(known.is_empty());
    }
}
