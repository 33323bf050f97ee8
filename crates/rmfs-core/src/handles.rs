//! Open-file handles.
//!
//! Each handle owns its state behind its own mutex: a write buffer for files
//! being written, or a lazily filled read cache. The table itself is only
//! locked long enough to insert, find or remove an entry.

use crate::tree::NodeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

pub type FileHandle = u64;

/// Whole-object write buffer, committed on flush or release.
#[derive(Debug, Default, Clone)]
pub struct WriteBuffer {
    data: Vec<u8>,
    dirty: bool,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `bytes` at `offset`, zero-filling any gap. Returns the number of
    /// bytes written.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> usize {
        let start = offset as usize;
        let end = start + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(bytes);
        self.dirty = true;
        bytes.len()
    }

    pub fn truncate(&mut self, len: u64) {
        self.data.resize(len as usize, 0);
        self.dirty = true;
    }

    pub fn read_at(&self, offset: u64, size: u32) -> &[u8] {
        slice_at(&self.data, offset, size)
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Written or truncated since the last commit.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// What an open handle holds.
#[derive(Debug)]
pub enum HandleState {
    /// Read-only handle. Content is fetched (or rendered) on first read and
    /// kept until release.
    Reader { cache: Option<Vec<u8>> },
    Writer(WriteBuffer),
}

#[derive(Debug)]
pub struct OpenFile {
    pub node: NodeId,
    pub state: HandleState,
}

impl OpenFile {
    pub fn reader(node: NodeId) -> Self {
        Self {
            node,
            state: HandleState::Reader { cache: None },
        }
    }

    pub fn writer(node: NodeId) -> Self {
        Self {
            node,
            state: HandleState::Writer(WriteBuffer::new()),
        }
    }

    pub fn buffer(&self) -> Option<&WriteBuffer> {
        match &self.state {
            HandleState::Writer(buffer) => Some(buffer),
            HandleState::Reader { .. } => None,
        }
    }

    pub fn buffer_mut(&mut self) -> Option<&mut WriteBuffer> {
        match &mut self.state {
            HandleState::Writer(buffer) => Some(buffer),
            HandleState::Reader { .. } => None,
        }
    }
}

/// The part of `data` a read of `size` bytes at `offset` returns.
pub fn slice_at(data: &[u8], offset: u64, size: u32) -> &[u8] {
    let start = (offset as usize).min(data.len());
    let end = start.saturating_add(size as usize).min(data.len());
    &data[start..end]
}

struct Slot {
    node: NodeId,
    file: Arc<Mutex<OpenFile>>,
}

/// Handle number to open file.
pub struct HandleTable {
    slots: Mutex<HashMap<FileHandle, Slot>>,
    next: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    pub async fn insert(&self, file: OpenFile) -> FileHandle {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        let slot = Slot {
            node: file.node,
            file: Arc::new(Mutex::new(file)),
        };
        self.slots.lock().await.insert(fh, slot);
        fh
    }

    pub async fn get(&self, fh: FileHandle) -> Option<Arc<Mutex<OpenFile>>> {
        self.slots.lock().await.get(&fh).map(|s| s.file.clone())
    }

    pub async fn remove(&self, fh: FileHandle) -> Option<Arc<Mutex<OpenFile>>> {
        self.slots.lock().await.remove(&fh).map(|s| s.file)
    }

    /// Every handle open on `node`.
    pub async fn open_on(&self, node: NodeId) -> Vec<Arc<Mutex<OpenFile>>> {
        self.slots
            .lock()
            .await
            .values()
            .filter(|s| s.node == node)
            .map(|s| s.file.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
