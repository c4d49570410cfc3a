//! Mirror engine: requests a snapshot or listing from a sharing server and
//! keeps a local directory identical to the remote subtree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionEvent, IncomingStream};
use crate::paths;
use crate::protocol::{ChangeKind, DirectoryNode, EntryKind, Message};
use crate::url;

/// One change applied to the local mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    pub change: ChangeKind,
    pub entry: EntryKind,
    /// Local path that was touched.
    pub path: PathBuf,
}

/// Client side of one connection to a sharing server.
pub struct Client {
    connection: Connection,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    target_dir: Option<PathBuf>,
    /// Wire path of the remote subtree being mirrored.
    remote_root: Option<String>,
    /// Preloading streams received ahead of the snapshot, keyed by id.
    preloaded: HashMap<u32, IncomingStream>,
}

impl Client {
    /// Connect to `tcp://host:port` (scheme optional).
    pub async fn connect(url: &str) -> Result<Self> {
        let addr = url::parse_url(url)?;
        let socket = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("connect {addr}"))?;
        let (connection, events) = Connection::new(socket);
        Ok(Self {
            connection,
            events,
            target_dir: None,
            remote_root: None,
            preloaded: HashMap::new(),
        })
    }

    /// Request the remote listing. One request in flight at a time.
    pub async fn inspect(&mut self) -> Result<Vec<String>> {
        self.connection
            .send(&Message::Inspect { data: None })
            .await?;
        loop {
            match self.events.recv().await {
                None => bail!("connection closed"),
                Some(ConnectionEvent::Closed) => bail!("connection closed"),
                Some(ConnectionEvent::Message(Message::Inspect {
                    data: Some(listing),
                })) => return Ok(listing),
                Some(ConnectionEvent::Message(Message::Error { data })) => {
                    bail!("server error: {data}")
                }
                Some(ConnectionEvent::Error(err)) => warn!(error = %err, "connection error"),
                Some(other) => debug!(?other, "ignoring while inspecting"),
            }
        }
    }

    /// Mirror the remote share (or `source_dir` inside it) into
    /// `target_dir`. Any existing target is deleted and rebuilt; resolves
    /// once every directory exists and every file body is on disk.
    pub async fn sync(&mut self, target_dir: &Path, source_dir: Option<&str>) -> Result<()> {
        if target_dir.as_os_str().is_empty() {
            bail!("target directory is required");
        }
        self.target_dir = Some(target_dir.to_path_buf());
        self.connection
            .send(&Message::sync_request(source_dir.map(str::to_owned)))
            .await?;

        loop {
            match self.events.recv().await {
                None => bail!("connection closed before sync completed"),
                Some(ConnectionEvent::Closed) => {
                    bail!("connection closed before sync completed")
                }
                Some(ConnectionEvent::Stream(stream)) if stream.info.preloading => {
                    self.preloaded.insert(stream.id, stream);
                }
                Some(ConnectionEvent::Stream(stream)) => {
                    debug!(stream = stream.id, "dropping stream received before snapshot");
                }
                Some(ConnectionEvent::Message(Message::Sync {
                    data: Some(tree), ..
                })) => {
                    self.build_mirror(tree).await?;
                    info!(target = %target_dir.display(), "mirror built");
                    return Ok(());
                }
                Some(ConnectionEvent::Message(Message::Error { data })) => {
                    bail!("server error: {data}")
                }
                Some(ConnectionEvent::Error(err)) => warn!(error = %err, "connection error"),
                Some(other) => debug!(?other, "ignoring while syncing"),
            }
        }
    }

    /// Apply live changes until the connection closes.
    pub async fn run_mirror(&mut self) -> Result<()> {
        while let Some(applied) = self.apply_next().await? {
            info!(change = ?applied.change, path = %applied.path.display(), "applied");
        }
        Ok(())
    }

    /// Wait for the next live change and apply it to the mirror. Returns
    /// `None` once the connection is closed.
    pub async fn apply_next(&mut self) -> Result<Option<AppliedChange>> {
        loop {
            match self.events.recv().await {
                None | Some(ConnectionEvent::Closed) => return Ok(None),
                Some(ConnectionEvent::Message(message)) => {
                    if let Some(applied) = self.apply_message(message).await? {
                        return Ok(Some(applied));
                    }
                }
                Some(ConnectionEvent::Stream(stream)) if stream.info.preloading => {
                    self.preloaded.insert(stream.id, stream);
                }
                Some(ConnectionEvent::Stream(stream)) => {
                    if let Some(applied) = self.apply_stream(stream).await? {
                        return Ok(Some(applied));
                    }
                }
                Some(ConnectionEvent::Error(err)) => warn!(error = %err, "connection error"),
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }

    /// Wipe and rebuild the target from a snapshot, draining every
    /// preloaded file stream into place.
    async fn build_mirror(&mut self, tree: DirectoryNode) -> Result<()> {
        let target = self
            .target_dir
            .clone()
            .context("target directory not set")?;
        self.remote_root = Some(tree.path.clone());

        if tokio::fs::metadata(&target).await.is_ok() {
            tokio::fs::remove_dir_all(&target)
                .await
                .with_context(|| format!("clear existing mirror {}", target.display()))?;
        }
        build_node(&mut self.preloaded, tree.path.as_str(), &target, &tree).await?;
        // Whatever preloading streams remain belong to entries the build
        // never reached; drop them.
        self.preloaded.clear();
        Ok(())
    }

    async fn apply_message(&mut self, message: Message) -> Result<Option<AppliedChange>> {
        match message {
            Message::Create {
                entry: EntryKind::Dir,
                path,
            } => {
                let local = self.local_path(&path)?;
                tokio::fs::create_dir_all(&local)
                    .await
                    .with_context(|| format!("create directory {}", local.display()))?;
                Ok(Some(AppliedChange {
                    change: ChangeKind::Create,
                    entry: EntryKind::Dir,
                    path: local,
                }))
            }
            Message::Create {
                entry: EntryKind::File,
                path,
            } => {
                // Content, if any, follows on its own stream.
                let local = self.local_path(&path)?;
                if let Some(parent) = local.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::File::create(&local)
                    .await
                    .with_context(|| format!("create {}", local.display()))?;
                Ok(Some(AppliedChange {
                    change: ChangeKind::Create,
                    entry: EntryKind::File,
                    path: local,
                }))
            }
            Message::Remove { entry, path } => {
                let local = self.local_path(&path)?;
                let removal = match entry {
                    EntryKind::File => tokio::fs::remove_file(&local).await,
                    EntryKind::Dir => tokio::fs::remove_dir_all(&local).await,
                };
                match removal {
                    Ok(()) => {}
                    // Already gone; removing twice is a no-op, not a crash.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        debug!(path = %local.display(), "remove of absent entry");
                    }
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("remove {}", local.display()));
                    }
                }
                Ok(Some(AppliedChange {
                    change: ChangeKind::Remove,
                    entry,
                    path: local,
                }))
            }
            Message::Error { data } => bail!("server error: {data}"),
            other => {
                debug!(?other, "ignoring message");
                Ok(None)
            }
        }
    }

    /// Write an incoming content stream over the file at its translated
    /// path.
    async fn apply_stream(&mut self, mut stream: IncomingStream) -> Result<Option<AppliedChange>> {
        let Some(remote) = stream.info.path.clone() else {
            debug!(stream = stream.id, "content stream without a path");
            return Ok(None);
        };
        let local = self.local_path(&remote)?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&local)
            .await
            .with_context(|| format!("create {}", local.display()))?;
        stream
            .write_to(&mut file)
            .await
            .with_context(|| format!("write {}", local.display()))?;
        Ok(Some(AppliedChange {
            change: stream.info.event.unwrap_or(ChangeKind::Update),
            entry: EntryKind::File,
            path: local,
        }))
    }

    fn local_path(&self, remote: &str) -> Result<PathBuf> {
        let target = self.target_dir.as_deref().context("no sync target set")?;
        let root = self.remote_root.as_deref().context("not synced yet")?;
        paths::translate(remote, root, target)
    }
}

/// Depth-first rebuild of one snapshot node: directory, its files, then its
/// children. A failure aborts the rest of this subtree only.
fn build_node<'a>(
    preloaded: &'a mut HashMap<u32, IncomingStream>,
    remote_root: &'a str,
    target: &'a Path,
    node: &'a DirectoryNode,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let local_dir = paths::translate(&node.path, remote_root, target)?;
        tokio::fs::create_dir_all(&local_dir)
            .await
            .with_context(|| format!("create directory {}", local_dir.display()))?;

        for entry in &node.files {
            let crate::protocol::FileEntry(remote, stream_id) = entry;
            let mut stream = preloaded.remove(stream_id).with_context(|| {
                format!("snapshot names stream {stream_id} for {remote:?} but it never opened")
            })?;
            let local = paths::translate(remote, remote_root, target)?;
            let mut file = tokio::fs::File::create(&local)
                .await
                .with_context(|| format!("create {}", local.display()))?;
            stream
                .write_to(&mut file)
                .await
                .with_context(|| format!("write {}", local.display()))?;
        }

        for child in &node.children {
            build_node(preloaded, remote_root, target, child).await?;
        }
        Ok(())
    })
}
