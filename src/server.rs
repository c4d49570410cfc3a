//! Share engine: accepts connections, answers inspect/sync requests and
//! fans live file-system changes out to synced connections.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use regex::Regex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionEvent};
use crate::paths;
use crate::protocol::{ChangeKind, DirectoryNode, EntryKind, FileEntry, Message, StreamInfo};
use crate::watch::{WatchEvent, Watcher};

/// Configuration for sharing one directory.
#[derive(Debug, Clone)]
pub struct ShareOptions {
    /// `host:port` to listen on.
    pub bind: String,
    /// Directory to share.
    pub dir: PathBuf,
    /// Entries whose root-relative path matches are never sent.
    pub ignore: Option<Regex>,
}

impl Default for ShareOptions {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
            dir: PathBuf::from("."),
            ignore: None,
        }
    }
}

#[derive(Clone)]
struct ConnHandle {
    connection: Connection,
    /// Wire path of the subtree this connection mirrors, once synced.
    synced_root: Arc<Mutex<Option<String>>>,
}

type Registry = Arc<Mutex<HashMap<u64, ConnHandle>>>;

/// A bound share server. Created with [`Server::bind`], driven by
/// [`Server::run`].
pub struct Server {
    root: PathBuf,
    ignore: Option<Regex>,
    listener: TcpListener,
}

impl Server {
    pub async fn bind(options: ShareOptions) -> Result<Self> {
        if !options.dir.exists() {
            bail!("shared directory does not exist: {}", options.dir.display());
        }
        if !options.dir.is_dir() {
            bail!("shared path is not a directory: {}", options.dir.display());
        }
        let root = std::fs::canonicalize(&options.dir)
            .with_context(|| format!("canonicalize {}", options.dir.display()))?;
        let listener = TcpListener::bind(&options.bind)
            .await
            .with_context(|| format!("bind {}", options.bind))?;
        Ok(Self {
            root,
            ignore: options.ignore,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve connections until the task is cancelled or the
    /// listener fails. Starts the watcher and the fan-out loop.
    pub async fn run(self) -> Result<()> {
        let mut watcher = Watcher::new(self.root.clone(), self.ignore.clone())?;
        let watch_rx = watcher.start()?;
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));

        let fan_registry = registry.clone();
        let fan_task = tokio::spawn(fan_out_loop(fan_registry, watch_rx));

        info!(
            addr = %self.listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            root = %self.root.display(),
            "sharing directory"
        );

        let mut next_id: u64 = 1;
        let result = loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => break Err(err.into()),
            };
            let id = next_id;
            next_id += 1;
            debug!(%peer, id, "connection accepted");

            let (connection, events) = Connection::new(socket);
            let handle = ConnHandle {
                connection: connection.clone(),
                synced_root: Arc::new(Mutex::new(None)),
            };
            registry.lock().insert(id, handle.clone());

            let registry = registry.clone();
            let root = self.root.clone();
            let ignore = self.ignore.clone();
            tokio::spawn(async move {
                serve_connection(connection, events, handle.synced_root, root, ignore).await;
                registry.lock().remove(&id);
                debug!(id, "connection closed");
            });
        };
        fan_task.abort();
        watcher.stop();
        result
    }
}

async fn serve_connection(
    connection: Connection,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    synced_root: Arc<Mutex<Option<String>>>,
    root: PathBuf,
    ignore: Option<Regex>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Message(message) => {
                if let Err(err) =
                    handle_message(&connection, &synced_root, &root, ignore.as_ref(), message).await
                {
                    warn!(error = %err, "request failed");
                    let _ = connection.send(&Message::error(err.to_string())).await;
                }
            }
            // Clients never stream content to the server.
            ConnectionEvent::Stream(stream) => {
                debug!(stream = stream.id, "ignoring unexpected incoming stream");
            }
            ConnectionEvent::Error(err) => warn!(error = %err, "connection error"),
            ConnectionEvent::Closed => break,
        }
    }
}

async fn handle_message(
    connection: &Connection,
    synced_root: &Arc<Mutex<Option<String>>>,
    root: &Path,
    ignore: Option<&Regex>,
    message: Message,
) -> Result<()> {
    match message {
        Message::Inspect { data: None } => {
            let listing = paths::list_files(root, ignore)?;
            connection
                .send(&Message::Inspect {
                    data: Some(listing),
                })
                .await
        }
        Message::Sync { dir, data: None } => {
            handle_sync(connection, synced_root, root, ignore, dir).await
        }
        other => {
            debug!(?other, "ignoring message");
            Ok(())
        }
    }
}

/// Serve one sync request: validate, snapshot, preload every file body as a
/// stream, then send the tree and subscribe the connection to live changes.
async fn handle_sync(
    connection: &Connection,
    synced_root: &Arc<Mutex<Option<String>>>,
    root: &Path,
    ignore: Option<&Regex>,
    dir: Option<String>,
) -> Result<()> {
    let requested = dir.unwrap_or_default();
    let subtree = match paths::resolve_under(root, &requested) {
        Ok(path) if path.is_dir() => path,
        _ => {
            // Bad request, not a connection failure: report and stay open.
            connection
                .send(&Message::error(format!(
                    "directory {requested:?} does not exist"
                )))
                .await?;
            return Ok(());
        }
    };

    let tree = build_snapshot(connection, root, &subtree, ignore).await?;
    connection
        .send(&Message::Sync {
            dir: None,
            data: Some(tree),
        })
        .await?;
    *synced_root.lock() = Some(requested.clone());
    info!(subtree = %requested, "connection synced");
    Ok(())
}

/// Recursively read a subtree into a [`DirectoryNode`], streaming each file
/// body ahead of the snapshot message and recording its stream id.
fn build_snapshot<'a>(
    connection: &'a Connection,
    root: &'a Path,
    dir: &'a Path,
    ignore: Option<&'a Regex>,
) -> Pin<Box<dyn Future<Output = Result<DirectoryNode>> + Send + 'a>> {
    Box::pin(async move {
        let rel = paths::rel_string(root, dir).unwrap_or_default();
        let mut node = DirectoryNode {
            path: rel,
            files: Vec::new(),
            children: Vec::new(),
        };

        let mut reader = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("read directory {}", dir.display()))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push((entry.file_name(), is_dir));
        }
        entries.sort();

        for (name, is_dir) in entries {
            let path = dir.join(&name);
            let Some(rel_child) = paths::rel_string(root, &path) else {
                continue;
            };
            if paths::ignored(ignore, &rel_child) {
                continue;
            }
            if is_dir {
                let child = build_snapshot(connection, root, &path, ignore).await?;
                node.children.push(child);
            } else {
                let file = tokio::fs::File::open(&path)
                    .await
                    .with_context(|| format!("open {}", path.display()))?;
                let stream_id = connection.stream(file, StreamInfo::preloading()).await?;
                node.files.push(FileEntry(rel_child, stream_id));
            }
        }
        Ok(node)
    })
}

async fn fan_out_loop(registry: Registry, mut watch_rx: mpsc::UnboundedReceiver<WatchEvent>) {
    while let Some(event) = watch_rx.recv().await {
        fan_out(&registry, event).await;
    }
}

/// Forward one change to every connection whose subscribed subtree contains
/// the changed path. File content rides a stream; removals and directory
/// creations are plain messages.
async fn fan_out(registry: &Registry, event: WatchEvent) {
    let receivers: Vec<Connection> = registry
        .lock()
        .values()
        .filter(|handle| {
            handle
                .synced_root
                .lock()
                .as_deref()
                .is_some_and(|synced| paths::within(synced, &event.rel))
        })
        .map(|handle| handle.connection.clone())
        .collect();
    if receivers.is_empty() {
        return;
    }

    match (event.change, event.entry) {
        (ChangeKind::Remove, entry) => {
            let message = Message::Remove {
                entry,
                path: event.rel.clone(),
            };
            for connection in receivers {
                if let Err(err) = connection.send(&message).await {
                    warn!(error = %err, path = %event.rel, "remove fan-out failed");
                }
            }
        }
        (ChangeKind::Create, EntryKind::Dir) => {
            let message = Message::Create {
                entry: EntryKind::Dir,
                path: event.rel.clone(),
            };
            for connection in receivers {
                if let Err(err) = connection.send(&message).await {
                    warn!(error = %err, path = %event.rel, "mkdir fan-out failed");
                }
            }
        }
        (change @ (ChangeKind::Create | ChangeKind::Update), EntryKind::File) => {
            for connection in receivers {
                let file = match tokio::fs::File::open(&event.path).await {
                    Ok(file) => file,
                    Err(err) => {
                        // The file may already be gone again; a remove event
                        // will follow. The remaining receivers still get
                        // their turn.
                        warn!(error = %err, path = %event.rel, "changed file unreadable");
                        continue;
                    }
                };
                let info = StreamInfo::change(change, EntryKind::File, event.rel.clone());
                if let Err(err) = connection.stream(file, info).await {
                    warn!(error = %err, path = %event.rel, "content fan-out failed");
                }
            }
        }
        // Directory timestamps and similar carry nothing to mirror.
        (ChangeKind::Update, EntryKind::Dir) => {}
    }
}
