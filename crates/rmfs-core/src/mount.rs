//! Mount: the filesystem adapter.
//!
//! Maps POSIX-style calls onto the [`DocumentTree`] and the remote session.
//! One `Mount` is created per mounted device and shared behind an `Arc`;
//! every operation takes `&self`.
//!
//! Locks are always taken in the order handle, tree, session. The tree lock is
//! never held while waiting for a handle, and the staged-content map is only
//! locked for short, non-awaiting sections.

use crate::config::MountConfig;
use crate::convert::{self, ConvertError};
use crate::handles::{FileHandle, HandleState, HandleTable, OpenFile, slice_at};
use crate::lines::{self, LinesError, Page};
use crate::record::{Content, DocumentKind, DocumentRecord, strip_extension};
use crate::remote::{self, RemoteError, RemoteSession};
use crate::render;
use crate::tree::{DocumentTree, NodeId, RefreshReport, RemovePolicy, TreeError};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Largest file accepted for upload.
pub const MAX_FILE_SIZE: u64 = 1 << 32;

/// Largest size a temporary file may be grown to without an open handle.
pub const MAX_SPARSE_TRUNCATE: u64 = 64 << 20;

/// Name of the extended attribute mapped to the bookmark flag.
pub const BOOKMARK_XATTR: &str = "user.bookmarked";

#[derive(Debug, Error)]
pub enum MountError {
    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Notebook error: {0}")]
    Lines(#[from] LinesError),

    #[error("Conversion error: {0}")]
    Convert(#[from] ConvertError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Is a folder: {0}")]
    IsAFolder(String),

    #[error("Read-only: {0}")]
    ReadOnly(String),

    #[error("Bad file handle: {0}")]
    BadHandle(FileHandle),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, MountError>;

/// Error classes the kernel binding turns into errno values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    NotEmpty,
    NotADirectory,
    IsADirectory,
    Busy,
    PermissionDenied,
    Unsupported,
    BadHandle,
    InvalidArgument,
    Io,
}

impl MountError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MountError::Tree(e) => match e {
                TreeError::NotFound(_) => ErrorKind::NotFound,
                TreeError::NameConflict(_) => ErrorKind::AlreadyExists,
                TreeError::NotEmpty(_) => ErrorKind::NotEmpty,
                TreeError::NotAFolder(_) => ErrorKind::NotADirectory,
                TreeError::RootImmutable => ErrorKind::Busy,
                TreeError::CycleRejected => ErrorKind::InvalidArgument,
                TreeError::InconsistentStore(_) => ErrorKind::Io,
            },
            MountError::Remote(RemoteError::NotFound(_)) => ErrorKind::NotFound,
            MountError::IsAFolder(_) => ErrorKind::IsADirectory,
            MountError::ReadOnly(_) => ErrorKind::PermissionDenied,
            MountError::BadHandle(_) => ErrorKind::BadHandle,
            MountError::Unsupported(_) => ErrorKind::Unsupported,
            MountError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            MountError::Remote(_)
            | MountError::Lines(_)
            | MountError::Convert(_)
            | MountError::Json(_)
            | MountError::Task(_) => ErrorKind::Io,
        }
    }
}

/// File attributes of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub node: NodeId,
    pub kind: DocumentKind,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub mtime_millis: u64,
}

impl Attr {
    pub fn is_dir(&self) -> bool {
        self.kind.is_folder()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub node: NodeId,
    pub kind: DocumentKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenedFile {
    pub fh: FileHandle,
    /// Size is not known up front (rendered notebooks); the kernel must not
    /// cache or trust `st_size`.
    pub direct_io: bool,
}

/// Outcome of one flush cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Staged documents uploaded.
    pub committed: usize,
    /// Metadata records written.
    pub written: usize,
    /// Items that failed and stay pending.
    pub failed: usize,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    fn wrote_anything(&self) -> bool {
        self.committed + self.written > 0
    }
}

/// Filesystem adapter for one mounted device.
pub struct Mount<R: RemoteSession> {
    tree: RwLock<DocumentTree>,
    session: Mutex<R>,
    handles: HandleTable,
    /// Content of closed files that is not on the device yet: temporary
    /// (dot-named) files, and uploads waiting for a retry.
    staged: Mutex<HashMap<NodeId, Vec<u8>>>,
    config: MountConfig,
}

impl<R: RemoteSession> Mount<R> {
    /// Read the record store through `session` and build the tree.
    pub async fn open_session(session: R, config: MountConfig) -> Result<Self> {
        let records = load_records(&session).await?;
        let count = records.len();
        let tree = match DocumentTree::rebuild(records.clone()) {
            Ok(tree) => tree,
            Err(e) => {
                tracing::warn!("{}; showing every document at the top level", e);
                DocumentTree::rebuild_flat(records)
            }
        };
        tracing::info!("Loaded {} records from the device", count);

        Ok(Self {
            tree: RwLock::new(tree),
            session: Mutex::new(session),
            handles: HandleTable::new(),
            staged: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn root(&self) -> NodeId {
        crate::tree::ROOT
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    // ========== Attributes ==========

    fn attr_in(tree: &DocumentTree, node: NodeId) -> Result<Attr> {
        let entry = tree
            .get(node)
            .filter(|n| !n.is_deleted())
            .ok_or_else(|| TreeError::NotFound(format!("node {}", node)))?;
        let record = entry.record();
        Ok(Attr {
            node,
            kind: record.kind,
            size: record.payload_size,
            mtime_millis: record.last_modified,
        })
    }

    /// Files being written report the size of their buffer.
    async fn with_local_size(&self, mut attr: Attr) -> Attr {
        if attr.is_dir() {
            return attr;
        }
        let mut local = None;
        for file in self.handles.open_on(attr.node).await {
            if let Some(buffer) = file.lock().await.buffer() {
                local = Some(local.unwrap_or(0).max(buffer.len()));
            }
        }
        if local.is_none() {
            local = self
                .staged
                .lock()
                .await
                .get(&attr.node)
                .map(|data| data.len() as u64);
        }
        if let Some(size) = local {
            attr.size = size;
        }
        attr
    }

    pub async fn getattr(&self, node: NodeId) -> Result<Attr> {
        let attr = Self::attr_in(&*self.tree.read().await, node)?;
        Ok(self.with_local_size(attr).await)
    }

    pub async fn lookup(&self, parent: NodeId, name: &str) -> Result<Attr> {
        let attr = {
            let tree = self.tree.read().await;
            let node = tree.lookup(parent, name)?;
            Self::attr_in(&tree, node)?
        };
        Ok(self.with_local_size(attr).await)
    }

    /// Resolve a `/`-separated path from the root.
    pub async fn resolve(&self, path: &str) -> Result<Attr> {
        let attr = {
            let tree = self.tree.read().await;
            let node = tree.resolve(path)?;
            Self::attr_in(&tree, node)?
        };
        Ok(self.with_local_size(attr).await)
    }

    /// `.` and `..` followed by the folder's children in name order.
    pub async fn readdir(&self, node: NodeId) -> Result<Vec<DirEntry>> {
        let tree = self.tree.read().await;
        let children = tree.children(node)?;
        let parent = tree.get(node).and_then(|n| n.parent()).unwrap_or(node);

        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push(DirEntry {
            name: ".".to_string(),
            node,
            kind: DocumentKind::Folder,
        });
        entries.push(DirEntry {
            name: "..".to_string(),
            node: parent,
            kind: DocumentKind::Folder,
        });
        for (name, child) in children {
            if let Some(entry) = tree.get(child) {
                entries.push(DirEntry {
                    name,
                    node: child,
                    kind: entry.kind(),
                });
            }
        }
        Ok(entries)
    }

    // ========== Structure ==========

    pub async fn mkdir(&self, parent: NodeId, name: &str) -> Result<Attr> {
        self.refresh_if_configured().await;
        let node = self
            .tree
            .write()
            .await
            .create_child(parent, name, DocumentKind::Folder)?;
        tracing::debug!("mkdir {} -> node {}", name, node);
        self.flush_pending().await;
        self.getattr(node).await
    }

    pub async fn rmdir(&self, parent: NodeId, name: &str) -> Result<()> {
        self.refresh_if_configured().await;
        {
            let mut tree = self.tree.write().await;
            let node = tree.lookup(parent, name)?;
            let is_folder = tree.get(node).is_some_and(|n| n.kind().is_folder());
            if !is_folder {
                return Err(TreeError::NotAFolder(name.to_string()).into());
            }
            let removed = tree.remove(node, self.config.rmdir)?;
            tracing::debug!("rmdir {} removed {} nodes", name, removed.len());
        }
        self.flush_pending().await;
        Ok(())
    }

    pub async fn unlink(&self, parent: NodeId, name: &str) -> Result<()> {
        self.refresh_if_configured().await;
        {
            let mut tree = self.tree.write().await;
            let node = tree.lookup(parent, name)?;
            if tree.get(node).is_some_and(|n| n.kind().is_folder()) {
                return Err(MountError::IsAFolder(name.to_string()));
            }
            tree.remove(node, RemovePolicy::RequireEmpty)?;
            self.staged.lock().await.remove(&node);
            tracing::debug!("unlink {}", name);
        }
        self.flush_pending().await;
        Ok(())
    }

    /// Move or rename. An existing target name is an error, never replaced.
    pub async fn rename(
        &self,
        parent: NodeId,
        name: &str,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<()> {
        self.refresh_if_configured().await;
        let node = {
            let mut tree = self.tree.write().await;
            let node = tree.lookup(parent, name)?;
            tree.move_node(node, new_parent, new_name)?;
            node
        };
        tracing::debug!("rename {} -> {}", name, new_name);

        if !new_name.starts_with('.') {
            let staged = self.staged.lock().await.remove(&node);
            if let Some(data) = staged {
                self.commit(node, data).await?;
            }
        }
        self.flush_pending().await;
        Ok(())
    }

    // ========== Files ==========

    /// Create a new file and open it for writing.
    pub async fn create(&self, parent: NodeId, name: &str) -> Result<(Attr, OpenedFile)> {
        self.refresh_if_configured().await;
        let node = self.tree.write().await.create_child(
            parent,
            name,
            DocumentKind::for_new_file(name),
        )?;
        let fh = self.handles.insert(OpenFile::writer(node)).await;
        tracing::debug!("create {} -> node {}, handle {}", name, node, fh);
        let attr = self.getattr(node).await?;
        Ok((
            attr,
            OpenedFile {
                fh,
                direct_io: false,
            },
        ))
    }

    /// Open a file. Only files created through this mount and not yet on the
    /// device can be opened for writing.
    pub async fn open(&self, node: NodeId, write: bool) -> Result<OpenedFile> {
        let (kind, provisional, name) = {
            let tree = self.tree.read().await;
            let entry = tree
                .get(node)
                .filter(|n| !n.is_deleted())
                .ok_or_else(|| TreeError::NotFound(format!("node {}", node)))?;
            (entry.kind(), entry.is_provisional(), entry.file_name().to_string())
        };
        if kind.is_folder() {
            return Err(MountError::IsAFolder(name));
        }

        let staged = if provisional {
            self.staged.lock().await.get(&node).cloned()
        } else {
            None
        };

        let file = if write {
            if !provisional {
                return Err(MountError::ReadOnly(name));
            }
            let mut file = OpenFile::writer(node);
            if let (Some(data), Some(buffer)) = (staged, file.buffer_mut()) {
                buffer.write_at(0, &data);
                buffer.mark_clean();
            }
            file
        } else if provisional {
            OpenFile {
                node,
                state: HandleState::Reader {
                    cache: Some(staged.unwrap_or_default()),
                },
            }
        } else {
            OpenFile::reader(node)
        };

        let fh = self.handles.insert(file).await;
        tracing::debug!("open {} (write: {}) -> handle {}", name, write, fh);
        Ok(OpenedFile {
            fh,
            direct_io: kind == DocumentKind::Notebook,
        })
    }

    pub async fn read(&self, fh: FileHandle, offset: u64, size: u32) -> Result<Vec<u8>> {
        let file = self.handles.get(fh).await.ok_or(MountError::BadHandle(fh))?;
        let mut file = file.lock().await;
        let node = file.node;
        match &mut file.state {
            HandleState::Writer(buffer) => Ok(buffer.read_at(offset, size).to_vec()),
            HandleState::Reader { cache } => {
                if cache.is_none() {
                    *cache = Some(self.load_content(node).await?);
                }
                let data = cache.as_deref().unwrap_or_default();
                Ok(slice_at(data, offset, size).to_vec())
            }
        }
    }

    pub async fn write(&self, fh: FileHandle, offset: u64, data: &[u8]) -> Result<u32> {
        let file = self.handles.get(fh).await.ok_or(MountError::BadHandle(fh))?;
        let mut file = file.lock().await;
        let node = file.node;
        let buffer = file
            .buffer_mut()
            .ok_or_else(|| MountError::ReadOnly(format!("handle {} on node {}", fh, node)))?;
        if offset.saturating_add(data.len() as u64) > MAX_FILE_SIZE {
            return Err(MountError::InvalidArgument(format!(
                "write past {} bytes",
                MAX_FILE_SIZE
            )));
        }
        Ok(buffer.write_at(offset, data) as u32)
    }

    /// Resize a file being written, or a new file that has no content yet.
    pub async fn truncate(&self, node: NodeId, fh: Option<FileHandle>, len: u64) -> Result<Attr> {
        if len > MAX_FILE_SIZE {
            return Err(MountError::InvalidArgument(format!(
                "size over {} bytes",
                MAX_FILE_SIZE
            )));
        }

        let files = match fh {
            Some(fh) => match self.handles.get(fh).await {
                Some(file) => vec![file],
                None => return Err(MountError::BadHandle(fh)),
            },
            None => self.handles.open_on(node).await,
        };
        let mut resized = false;
        for file in files {
            if let Some(buffer) = file.lock().await.buffer_mut() {
                buffer.truncate(len);
                resized = true;
            }
        }
        if resized {
            return self.getattr(node).await;
        }

        let (provisional, name) = {
            let tree = self.tree.read().await;
            let entry = tree
                .get(node)
                .filter(|n| !n.is_deleted())
                .ok_or_else(|| TreeError::NotFound(format!("node {}", node)))?;
            (entry.is_provisional(), entry.file_name().to_string())
        };
        if !provisional {
            let attr = self.getattr(node).await?;
            if attr.size == len || attr.is_dir() {
                return Ok(attr);
            }
            return Err(MountError::ReadOnly(name));
        }

        let current = self.getattr(node).await?;
        if current.size == len {
            return Ok(current);
        }
        let mut staged = self.staged.lock().await;
        if len == 0 {
            staged.remove(&node);
        } else if !name.starts_with('.') {
            // Zeros are never a document; content only arrives through a handle
            return Err(MountError::Unsupported(format!(
                "resizing {} without writing it",
                name
            )));
        } else if len > MAX_SPARSE_TRUNCATE {
            return Err(MountError::InvalidArgument(format!(
                "growing {} past {} bytes",
                name, MAX_SPARSE_TRUNCATE
            )));
        } else {
            staged.entry(node).or_default().resize(len as usize, 0);
        }
        drop(staged);
        self.getattr(node).await
    }

    /// Commit a dirty write buffer. Called on every close of a descriptor.
    pub async fn flush(&self, fh: FileHandle) -> Result<()> {
        let file = self.handles.get(fh).await.ok_or(MountError::BadHandle(fh))?;
        let mut file = file.lock().await;
        let node = file.node;
        let Some(buffer) = file.buffer_mut() else {
            return Ok(());
        };
        if !buffer.is_dirty() {
            return Ok(());
        }
        // A failed upload is kept in `staged` and retried by the next flush
        // cycle. Content that cannot be converted is retried on release.
        buffer.mark_clean();
        let data = buffer.contents().to_vec();
        let result = self.commit(node, data).await;
        if let Err(MountError::Convert(_)) = result {
            buffer.mark_dirty();
        }
        result
    }

    /// Drop a handle, committing anything still unwritten.
    pub async fn release(&self, fh: FileHandle) -> Result<()> {
        let file = self
            .handles
            .remove(fh)
            .await
            .ok_or(MountError::BadHandle(fh))?;
        let mut file = file.lock().await;
        let node = file.node;
        let Some(buffer) = file.buffer_mut() else {
            return Ok(());
        };
        if !buffer.is_dirty() {
            return Ok(());
        }
        buffer.mark_clean();
        let data = buffer.contents().to_vec();
        self.commit(node, data).await
    }

    // ========== Bookmarks ==========

    pub async fn bookmarked(&self, node: NodeId) -> Result<bool> {
        let tree = self.tree.read().await;
        let entry = tree
            .get(node)
            .filter(|n| !n.is_deleted())
            .ok_or_else(|| TreeError::NotFound(format!("node {}", node)))?;
        Ok(entry.record().pinned)
    }

    /// Set the bookmark flag from an extended attribute value.
    pub async fn set_bookmarked(&self, node: NodeId, value: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(value);
        let pinned = match text.trim_matches(|c: char| c.is_whitespace() || c == '\0') {
            v if ["yes", "true", "1"].iter().any(|t| t.eq_ignore_ascii_case(v)) => true,
            v if ["no", "false", "0"].iter().any(|t| t.eq_ignore_ascii_case(v)) => false,
            other => {
                return Err(MountError::Unsupported(format!(
                    "bookmark value {:?}",
                    other
                )));
            }
        };
        self.tree.write().await.set_pinned(node, pinned)?;
        self.flush_pending().await;
        Ok(())
    }

    // ========== Device synchronisation ==========

    /// Upload new content for `node`: convert, then payload, `.content` and
    /// metadata.
    ///
    /// The stored kind is the sniffed one, so a PDF written as `x.epub`
    /// is listed as `x.pdf` once the tree is reloaded. Unconvertible content
    /// discards the node when no handle is left open on it.
    async fn commit(&self, node: NodeId, data: Vec<u8>) -> Result<()> {
        let name = {
            let tree = self.tree.read().await;
            match tree.get(node).filter(|n| !n.is_deleted()) {
                Some(entry) => entry.file_name().to_string(),
                None => {
                    tracing::debug!("Node {} went away before its content was written", node);
                    return Ok(());
                }
            }
        };

        if data.is_empty() {
            tracing::debug!("Not uploading empty file {}", name);
            return Ok(());
        }
        if name.starts_with('.') {
            tracing::debug!("Keeping temporary file {} local", name);
            self.staged.lock().await.insert(node, data);
            return Ok(());
        }

        let (kind, payload) = match convert::prepare_upload(data).await {
            Ok(converted) => converted,
            Err(e) => {
                if self.handles.open_on(node).await.is_empty() {
                    tracing::warn!("Cannot upload {}, dropping it: {}", name, e);
                    self.tree.write().await.discard(node);
                    self.staged.lock().await.remove(&node);
                } else {
                    tracing::warn!("Cannot upload {} yet: {}", name, e);
                }
                return Err(e.into());
            }
        };

        let mut tree = self.tree.write().await;
        let Some(entry) = tree.get(node).filter(|n| !n.is_deleted()) else {
            tracing::debug!("Node {} went away while its content was converted", node);
            return Ok(());
        };
        let id = entry.record().id.clone();
        if let Some(ext) = kind.extension()
            && DocumentKind::for_new_file(&name).extension() != Some(ext)
        {
            tracing::info!(
                "{} holds {:?} content, listed as {}.{} once reloaded",
                name,
                kind,
                strip_extension(&name),
                ext
            );
        }
        let session = self.session.lock().await;

        let uploaded = async {
            let path = remote::payload_path(&id, kind)
                .ok_or_else(|| MountError::Unsupported(format!("{:?} payload", kind)))?;
            session.upload_file(&payload, &path).await?;
            upload_json(&*session, &remote::content_path(&id), &Content::for_document(kind))
                .await
        }
        .await;
        if let Err(e) = uploaded {
            tracing::warn!("Upload of {} failed, will retry: {}", name, e);
            self.staged.lock().await.insert(node, payload);
            return Err(e);
        }

        tree.mark_committed(node, kind, payload.len() as u64)?;
        self.staged.lock().await.remove(&node);
        let record = tree.get(node).map(|n| n.record().clone());
        if let Some(record) = record {
            match write_metadata(&*session, &record).await {
                Ok(()) => tree.mark_flushed(node),
                Err(e) => {
                    // The node stays dirty and is picked up by the next flush
                    tracing::warn!("Metadata for {} not written: {}", name, e);
                    return Err(e);
                }
            }
        }
        tracing::info!("Uploaded {} ({} bytes)", name, payload.len());

        if self.config.reload_after_flush {
            self.reload(&*session).await;
        }
        Ok(())
    }

    /// Write every pending change to the device. Failed items stay pending.
    pub async fn flush_pending(&self) -> FlushReport {
        let mut report = FlushReport::default();

        for (node, data) in self.retryable_uploads().await {
            match self.commit(node, data).await {
                Ok(()) => report.committed += 1,
                Err(e) => {
                    tracing::warn!("Retry of node {} failed: {}", node, e);
                    report.failed += 1;
                }
            }
        }

        let mut tree = self.tree.write().await;
        let pending = tree.pending();
        if pending.is_empty() {
            return report;
        }
        let session = self.session.lock().await;

        for node in pending {
            let Some(entry) = tree.get(node) else {
                continue;
            };
            let record = entry.record().clone();
            let new_folder = entry.is_provisional() && record.kind.is_folder();

            let result = async {
                if new_folder {
                    upload_json(&*session, &remote::content_path(&record.id), &Content::for_folder())
                        .await?;
                }
                write_metadata(&*session, &record).await
            }
            .await;

            match result {
                Ok(()) => {
                    tree.mark_flushed(node);
                    report.written += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to write {} ({}): {}",
                        tree.path_of(node).unwrap_or_else(|| record.id.clone()),
                        record.id,
                        e
                    );
                    report.failed += 1;
                }
            }
        }

        if report.written > 0 && self.config.reload_after_flush {
            self.reload(&*session).await;
        }
        tracing::debug!(
            "Flush wrote {} records, {} failed",
            report.written,
            report.failed
        );
        report
    }

    /// Staged content under a permanent name, left over from failed uploads.
    async fn retryable_uploads(&self) -> Vec<(NodeId, Vec<u8>)> {
        let tree = self.tree.read().await;
        let staged = self.staged.lock().await;
        let mut retry: Vec<(NodeId, Vec<u8>)> = staged
            .iter()
            .filter(|(node, _)| {
                tree.get(**node)
                    .is_some_and(|n| !n.is_deleted() && !n.file_name().starts_with('.'))
            })
            .map(|(node, data)| (*node, data.clone()))
            .collect();
        retry.sort_by_key(|(node, _)| *node);
        retry
    }

    async fn reload(&self, session: &R) {
        if self.config.reload_command.is_empty() {
            return;
        }
        let argv = &self.config.reload_command;
        match session.execute_command(argv).await.and_then(|o| o.check(argv)) {
            Ok(_) => tracing::debug!("Device reloaded"),
            Err(e) => tracing::warn!("Device reload failed: {}", e),
        }
    }

    /// Merge the device's current record store into the tree.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let mut tree = self.tree.write().await;
        let records = {
            let session = self.session.lock().await;
            load_records(&*session).await?
        };
        let report = tree.refresh(records);
        if report != RefreshReport::default() {
            tracing::info!(
                "Refresh: {} added, {} updated, {} removed, {} kept local",
                report.added,
                report.updated,
                report.removed,
                report.preserved
            );
        }
        Ok(report)
    }

    async fn refresh_if_configured(&self) {
        if self.config.refresh_before_mutation
            && let Err(e) = self.refresh().await
        {
            tracing::warn!("Refresh before change failed: {}", e);
        }
    }

    /// Final flush, then let the device re-read its index.
    pub async fn shutdown(&self) -> FlushReport {
        let report = self.flush_pending().await;
        if !report.is_clean() {
            tracing::warn!("{} changes could not be written to the device", report.failed);
        }
        let session = self.session.lock().await;
        self.reload(&*session).await;
        if report.wrote_anything() {
            tracing::info!(
                "Shutdown flush: {} uploads, {} records",
                report.committed,
                report.written
            );
        }
        report
    }

    // ========== Content ==========

    async fn load_content(&self, node: NodeId) -> Result<Vec<u8>> {
        let (record, provisional) = {
            let tree = self.tree.read().await;
            let entry = tree
                .get(node)
                .filter(|n| !n.is_deleted())
                .ok_or_else(|| TreeError::NotFound(format!("node {}", node)))?;
            (entry.record().clone(), entry.is_provisional())
        };
        if provisional {
            return Ok(self
                .staged
                .lock()
                .await
                .get(&node)
                .cloned()
                .unwrap_or_default());
        }

        match record.kind {
            DocumentKind::Folder => Err(MountError::IsAFolder(record.visible_name)),
            DocumentKind::Pdf | DocumentKind::Epub => {
                let path = remote::payload_path(&record.id, record.kind).ok_or_else(|| {
                    MountError::Unsupported(format!("{:?} payload", record.kind))
                })?;
                let data = self.session.lock().await.download_file(&path).await?;
                Ok(data)
            }
            DocumentKind::Notebook => {
                let pages = self.notebook_pages(&record).await?;
                let strokes: usize = pages.iter().map(Page::stroke_count).sum();
                let page_count = pages.len();
                let pdf = tokio::task::spawn_blocking(move || render::render(&pages)).await?;
                tracing::debug!(
                    "Rendered {} ({} pages, {} strokes, {} bytes)",
                    record.visible_name,
                    page_count,
                    strokes,
                    pdf.len()
                );
                self.tree.write().await.set_size(node, pdf.len() as u64);
                Ok(pdf)
            }
        }
    }

    /// Fetch and decode every page of a notebook, in page order.
    async fn notebook_pages(&self, record: &DocumentRecord) -> Result<Vec<Page>> {
        let session = self.session.lock().await;
        let id = &record.id;

        if !record.pages.is_empty() {
            let mut pages = Vec::with_capacity(record.pages.len());
            for page in &record.pages {
                match session.download_file(&remote::page_path(id, page)).await {
                    Ok(bytes) => pages.extend(lines::decode(&bytes)?),
                    // Pages never written on have no stroke file
                    Err(RemoteError::NotFound(_)) => pages.push(Page::default()),
                    Err(e) => return Err(e.into()),
                }
            }
            return Ok(pages);
        }

        match session.download_file(&remote::lines_path(id)).await {
            Ok(bytes) => return Ok(lines::decode(&bytes)?),
            Err(RemoteError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let entries = match session.list_dir(id).await {
            Ok(entries) => entries,
            Err(RemoteError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut indexed: Vec<(u32, String)> = entries
            .into_iter()
            .filter(|e| !e.is_dir)
            .filter_map(|e| {
                let index = e.name.strip_suffix(".rm")?.parse().ok()?;
                Some((index, e.name))
            })
            .collect();
        indexed.sort();

        let mut pages = Vec::with_capacity(indexed.len());
        for (_, name) in indexed {
            let bytes = session.download_file(&format!("{}/{}", id, name)).await?;
            pages.extend(lines::decode(&bytes)?);
        }
        Ok(pages)
    }
}

async fn load_records<R: RemoteSession + ?Sized>(session: &R) -> Result<Vec<DocumentRecord>> {
    Ok(session
        .list_metadata()
        .await?
        .into_iter()
        .filter_map(DocumentRecord::from_raw)
        .collect())
}

async fn upload_json<R, T>(session: &R, path: &str, value: &T) -> Result<()>
where
    R: RemoteSession + ?Sized,
    T: Serialize + Sync,
{
    let bytes = serde_json::to_vec_pretty(value)?;
    session.upload_file(&bytes, path).await?;
    Ok(())
}

async fn write_metadata<R: RemoteSession + ?Sized>(
    session: &R,
    record: &DocumentRecord,
) -> Result<()> {
    upload_json(session, &remote::metadata_path(&record.id), &record.to_metadata()).await
}
