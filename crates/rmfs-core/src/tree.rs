//! DocumentTree: hierarchical view over the device's flat record store.
//!
//! Nodes live in an arena keyed by `NodeId`. Parent and child links are ids,
//! never references, so a corrupt store (cycles, dangling parents) can be
//! detected and repaired while linking instead of looping forever.
//!
//! The tree only tracks local state. Writing dirty nodes to the device is the
//! job of [`crate::mount::Mount`], which owns the remote session; the tree
//! exposes [`DocumentTree::pending`] and [`DocumentTree::mark_flushed`] for it.

use crate::record::{DocumentKind, DocumentRecord, Parent, strip_extension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Stable arena index. Doubles as the inode number exposed to the kernel.
pub type NodeId = u64;

/// The root folder.
pub const ROOT: NodeId = 1;
/// Hidden folder holding records the device has moved to its trash.
const TRASH: NodeId = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("No such file or folder: {0}")]
    NotFound(String),

    #[error("Name already in use: {0}")]
    NameConflict(String),

    #[error("Cannot move a folder into itself or one of its descendants")]
    CycleRejected,

    #[error("Folder is not empty: {0}")]
    NotEmpty(String),

    #[error("Not a folder: {0}")]
    NotAFolder(String),

    #[error("The root folder cannot be moved or removed")]
    RootImmutable,

    #[error("Inconsistent store: {0}")]
    InconsistentStore(String),
}

pub type Result<T> = std::result::Result<T, TreeError>;

/// What `remove` does with a folder that still has children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemovePolicy {
    /// Refuse with `NotEmpty`, like `rmdir(2)`.
    #[default]
    RequireEmpty,
    /// Delete the folder and everything below it.
    Cascade,
}

/// One entry in the arena.
#[derive(Debug, Clone)]
pub struct TreeNode {
    record: DocumentRecord,
    /// Disambiguated name under the parent.
    file_name: String,
    parent: Option<NodeId>,
    children: BTreeMap<String, NodeId>,
    /// Local changes not yet written to the device.
    dirty: bool,
    /// Created locally and never confirmed by the device.
    provisional: bool,
    /// Name given locally (create/rename). Used instead of the derived name
    /// until the node is clean and the tree is refreshed.
    local_name: Option<String>,
}

impl TreeNode {
    fn new(record: DocumentRecord) -> Self {
        Self {
            file_name: String::new(),
            record,
            parent: None,
            children: BTreeMap::new(),
            dirty: false,
            provisional: false,
            local_name: None,
        }
    }

    pub fn record(&self) -> &DocumentRecord {
        &self.record
    }

    pub fn kind(&self) -> DocumentKind {
        self.record.kind
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_provisional(&self) -> bool {
        self.provisional
    }

    pub fn is_deleted(&self) -> bool {
        self.record.deleted
    }

    /// The name this node asks for before disambiguation.
    fn wanted_name(&self) -> String {
        self.local_name
            .clone()
            .unwrap_or_else(|| self.record.file_name())
    }
}

/// Counts from a [`DocumentTree::refresh`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Local nodes kept as-is because they have unflushed changes.
    pub preserved: usize,
}

/// Hierarchical document tree built from flat records.
#[derive(Debug)]
pub struct DocumentTree {
    nodes: HashMap<NodeId, TreeNode>,
    by_id: HashMap<String, NodeId>,
    next_node: NodeId,
}

impl Default for DocumentTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentTree {
    /// An empty tree holding only the root.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT, TreeNode::new(DocumentRecord::root()));

        let mut trash = DocumentRecord::root();
        trash.id = crate::record::TRASH_PARENT.to_string();
        nodes.insert(TRASH, TreeNode::new(trash));

        Self {
            nodes,
            by_id: HashMap::new(),
            next_node: TRASH + 1,
        }
    }

    /// Build a tree from a full record snapshot.
    ///
    /// Records are linked in input order, which decides who gets a ` (2)`
    /// suffix when names collide. Cycles and dangling parents are repaired by
    /// attaching the offending record to the root.
    pub fn rebuild(records: Vec<DocumentRecord>) -> Result<Self> {
        let mut tree = Self::new();
        let order = tree.insert_all(records);
        tree.link(&order, false)?;
        debug!("Built document tree with {} records", order.len());
        Ok(tree)
    }

    /// Fallback used when `rebuild` reports an inconsistent store: every
    /// visible record is attached directly to the root.
    pub fn rebuild_flat(records: Vec<DocumentRecord>) -> Self {
        let mut tree = Self::new();
        let order = tree.insert_all(records);
        if let Err(e) = tree.link(&order, true) {
            warn!("Flat rebuild still inconsistent: {}", e);
        }
        tree
    }

    fn insert_all(&mut self, records: Vec<DocumentRecord>) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(records.len());
        for record in records {
            if record.deleted {
                continue;
            }
            if self.by_id.contains_key(&record.id) {
                warn!("Duplicate record id {}, keeping the first", record.id);
                continue;
            }
            order.push(self.insert_unlinked(record));
        }
        order
    }

    fn insert_unlinked(&mut self, record: DocumentRecord) -> NodeId {
        let node = self.next_node;
        self.next_node += 1;
        self.by_id.insert(record.id.clone(), node);
        self.nodes.insert(node, TreeNode::new(record));
        node
    }

    /// Recompute every parent/child link for `order`.
    fn link(&mut self, order: &[NodeId], flatten: bool) -> Result<()> {
        for node in self.nodes.values_mut() {
            node.children.clear();
            node.parent = None;
        }

        let mut parents: HashMap<NodeId, NodeId> = HashMap::with_capacity(order.len());
        for &node in order {
            let parent = self.effective_parent(node, flatten);
            parents.insert(node, parent);
        }
        if !flatten {
            self.break_cycles(order, &mut parents);
        }

        for &node in order {
            let parent = parents.get(&node).copied().unwrap_or(ROOT);
            self.attach(node, parent);
        }

        self.check_connected(order)
    }

    /// The parent a record should hang under, ignoring cycles.
    fn effective_parent(&self, node: NodeId, flatten: bool) -> NodeId {
        let Some(entry) = self.nodes.get(&node) else {
            return ROOT;
        };
        match &entry.record.parent {
            Parent::Root => ROOT,
            Parent::Trash => TRASH,
            Parent::Folder(_) if flatten => ROOT,
            Parent::Folder(parent_id) => {
                let target = self.by_id.get(parent_id).copied().filter(|id| {
                    self.nodes
                        .get(id)
                        .is_some_and(|p| p.record.kind.is_folder() && !p.record.deleted)
                });
                match target {
                    Some(parent) => parent,
                    None => {
                        warn!(
                            "Record {} ({:?}) has no usable parent {}, attaching to root",
                            entry.record.id, entry.record.visible_name, parent_id
                        );
                        ROOT
                    }
                }
            }
        }
    }

    /// Walk every parent chain once and re-root the node that closes a cycle.
    fn break_cycles(&self, order: &[NodeId], parents: &mut HashMap<NodeId, NodeId>) {
        #[derive(Clone, Copy, PartialEq)]
        enum Visit {
            InProgress,
            Done,
        }

        let mut state: HashMap<NodeId, Visit> = HashMap::with_capacity(order.len());
        for &start in order {
            let mut trail = Vec::new();
            let mut cursor = start;
            loop {
                if cursor == ROOT || cursor == TRASH {
                    break;
                }
                match state.get(&cursor) {
                    Some(Visit::Done) => break,
                    Some(Visit::InProgress) => {
                        if let Some(entry) = self.nodes.get(&cursor) {
                            warn!(
                                "Parent cycle through {} ({:?}), attaching it to root",
                                entry.record.id, entry.record.visible_name
                            );
                        }
                        parents.insert(cursor, ROOT);
                        break;
                    }
                    None => {
                        state.insert(cursor, Visit::InProgress);
                        trail.push(cursor);
                        cursor = parents.get(&cursor).copied().unwrap_or(ROOT);
                    }
                }
            }
            for node in trail {
                state.insert(node, Visit::Done);
            }
        }
    }

    fn attach(&mut self, node: NodeId, parent: NodeId) {
        let Some(entry) = self.nodes.get(&node) else {
            return;
        };
        let wanted = entry.wanted_name();
        let kind = entry.record.kind;
        let Some(parent_entry) = self.nodes.get_mut(&parent) else {
            return;
        };
        let name = unique_name(&parent_entry.children, &wanted, kind);
        parent_entry.children.insert(name.clone(), node);
        if let Some(entry) = self.nodes.get_mut(&node) {
            entry.parent = Some(parent);
            entry.file_name = name;
        }
    }

    fn check_connected(&self, order: &[NodeId]) -> Result<()> {
        let limit = self.nodes.len() + 1;
        for &node in order {
            let mut cursor = node;
            let mut steps = 0;
            while cursor != ROOT && cursor != TRASH {
                steps += 1;
                match self.nodes.get(&cursor).and_then(|n| n.parent) {
                    Some(parent) if steps <= limit => cursor = parent,
                    _ => {
                        return Err(TreeError::InconsistentStore(format!(
                            "record {} is not connected to the root",
                            self.nodes
                                .get(&node)
                                .map(|n| n.record.id.as_str())
                                .unwrap_or("?")
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    // ========== Queries ==========

    pub fn root(&self) -> NodeId {
        ROOT
    }

    pub fn get(&self, node: NodeId) -> Option<&TreeNode> {
        self.nodes.get(&node)
    }

    /// Look up the node for a record id.
    pub fn node_for_id(&self, id: &str) -> Option<NodeId> {
        self.by_id.get(id).copied()
    }

    /// Number of records in the arena, tombstones included.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn node(&self, node: NodeId) -> Result<&TreeNode> {
        self.nodes
            .get(&node)
            .ok_or_else(|| TreeError::NotFound(format!("node {}", node)))
    }

    /// A node that is linked into the tree and not deleted.
    fn active(&self, node: NodeId) -> Result<&TreeNode> {
        let entry = self.node(node)?;
        if entry.record.deleted || (node != ROOT && entry.parent.is_none()) {
            return Err(TreeError::NotFound(entry.file_name.clone()));
        }
        Ok(entry)
    }

    fn folder(&self, node: NodeId) -> Result<&TreeNode> {
        let entry = self.active(node)?;
        if !entry.record.kind.is_folder() {
            return Err(TreeError::NotAFolder(entry.file_name.clone()));
        }
        Ok(entry)
    }

    /// Find `name` in the folder `parent`.
    pub fn lookup(&self, parent: NodeId, name: &str) -> Result<NodeId> {
        self.folder(parent)?
            .children
            .get(name)
            .copied()
            .ok_or_else(|| TreeError::NotFound(name.to_string()))
    }

    /// Walk `segments` from the root.
    pub fn resolve_path<S: AsRef<str>>(&self, segments: &[S]) -> Result<NodeId> {
        segments
            .iter()
            .try_fold(ROOT, |node, segment| self.lookup(node, segment.as_ref()))
    }

    /// Resolve a `/`-separated path relative to the root.
    pub fn resolve(&self, path: &str) -> Result<NodeId> {
        let segments: Vec<&str> = path
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        self.resolve_path(&segments)
    }

    /// Children of a folder, sorted by name.
    pub fn children(&self, node: NodeId) -> Result<Vec<(String, NodeId)>> {
        Ok(self
            .folder(node)?
            .children
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect())
    }

    /// Display path of a node, for logging.
    pub fn path_of(&self, node: NodeId) -> Option<String> {
        let mut parts = Vec::new();
        let mut cursor = node;
        while cursor != ROOT {
            let entry = self.nodes.get(&cursor)?;
            parts.push(entry.file_name.as_str());
            cursor = entry.parent?;
            if parts.len() > self.nodes.len() {
                return None;
            }
        }
        parts.reverse();
        Some(format!("/{}", parts.join("/")))
    }

    /// Depth-first listing of every visible node below the root.
    pub fn walk(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self
            .nodes
            .get(&ROOT)
            .map(|root| root.children.values().rev().copied().collect())
            .unwrap_or_default();
        while let Some(node) = stack.pop() {
            out.push(node);
            if let Some(entry) = self.nodes.get(&node) {
                stack.extend(entry.children.values().rev().copied());
            }
        }
        out
    }

    fn parent_ref(&self, folder: NodeId) -> Parent {
        if folder == ROOT {
            return Parent::Root;
        }
        match self.nodes.get(&folder) {
            Some(entry) => Parent::Folder(entry.record.id.clone()),
            None => Parent::Root,
        }
    }

    // ========== Mutations ==========

    /// Add a provisional child. The record gets a fresh id and is only
    /// confirmed once it has been written to the device.
    pub fn create_child(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: DocumentKind,
    ) -> Result<NodeId> {
        if self.folder(parent)?.children.contains_key(name) {
            return Err(TreeError::NameConflict(name.to_string()));
        }

        let visible = if kind.is_folder() {
            name
        } else {
            strip_extension(name)
        };
        let record = DocumentRecord::new(
            Uuid::new_v4().to_string(),
            kind,
            visible,
            self.parent_ref(parent),
        );
        let node = self.insert_unlinked(record);

        if let Some(entry) = self.nodes.get_mut(&node) {
            entry.provisional = true;
            entry.dirty = true;
            entry.local_name = Some(name.to_string());
            entry.file_name = name.to_string();
            entry.parent = Some(parent);
        }
        if let Some(parent_entry) = self.nodes.get_mut(&parent) {
            parent_entry.children.insert(name.to_string(), node);
        }
        Ok(node)
    }

    /// Move and/or rename `node`. Either every link is updated or nothing is.
    pub fn move_node(&mut self, node: NodeId, new_parent: NodeId, new_name: &str) -> Result<()> {
        if node == ROOT {
            return Err(TreeError::RootImmutable);
        }
        let entry = self.active(node)?;
        let old_parent = entry.parent.ok_or(TreeError::RootImmutable)?;
        let old_name = entry.file_name.clone();
        let target = self.folder(new_parent)?;

        let mut cursor = Some(new_parent);
        while let Some(id) = cursor {
            if id == node {
                return Err(TreeError::CycleRejected);
            }
            cursor = self.nodes.get(&id).and_then(|n| n.parent);
        }

        match target.children.get(new_name) {
            Some(&existing) if existing == node => return Ok(()),
            Some(_) => return Err(TreeError::NameConflict(new_name.to_string())),
            None => {}
        }

        let parent_ref = self.parent_ref(new_parent);
        if let Some(parent_entry) = self.nodes.get_mut(&old_parent) {
            parent_entry.children.remove(&old_name);
        }
        if let Some(parent_entry) = self.nodes.get_mut(&new_parent) {
            parent_entry.children.insert(new_name.to_string(), node);
        }
        if let Some(entry) = self.nodes.get_mut(&node) {
            entry.parent = Some(new_parent);
            entry.file_name = new_name.to_string();
            entry.local_name = Some(new_name.to_string());
            entry.record.parent = parent_ref;
            entry.record.visible_name = if entry.record.kind.is_folder() {
                new_name.to_string()
            } else {
                strip_extension(new_name).to_string()
            };
            entry.record.touch();
            entry.dirty = true;
        }
        Ok(())
    }

    /// Mark `node` and its subtree deleted. Returns every affected node.
    ///
    /// Nodes the device has seen become dirty tombstones until the deletion is
    /// flushed; provisional nodes are dropped immediately.
    pub fn remove(&mut self, node: NodeId, policy: RemovePolicy) -> Result<Vec<NodeId>> {
        if node == ROOT {
            return Err(TreeError::RootImmutable);
        }
        let entry = self.active(node)?;
        if entry.record.kind.is_folder()
            && policy == RemovePolicy::RequireEmpty
            && !entry.children.is_empty()
        {
            return Err(TreeError::NotEmpty(entry.file_name.clone()));
        }
        let parent = entry.parent.ok_or(TreeError::RootImmutable)?;
        let name = entry.file_name.clone();

        if let Some(parent_entry) = self.nodes.get_mut(&parent) {
            parent_entry.children.remove(&name);
        }

        let mut subtree = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            subtree.push(current);
            if let Some(entry) = self.nodes.get(&current) {
                stack.extend(entry.children.values().copied());
            }
        }

        for &current in &subtree {
            let Some(entry) = self.nodes.get_mut(&current) else {
                continue;
            };
            entry.children.clear();
            entry.parent = None;
            if entry.provisional {
                let id = entry.record.id.clone();
                self.nodes.remove(&current);
                self.by_id.remove(&id);
            } else {
                entry.record.deleted = true;
                entry.record.touch();
                entry.dirty = true;
            }
        }
        Ok(subtree)
    }

    /// Drop a provisional node whose content never made it to the device.
    pub fn discard(&mut self, node: NodeId) {
        let Some(entry) = self.nodes.get(&node) else {
            return;
        };
        if !entry.provisional {
            return;
        }
        let id = entry.record.id.clone();
        let name = entry.file_name.clone();
        let parent = entry.parent;
        if let Some(parent) = parent
            && let Some(parent_entry) = self.nodes.get_mut(&parent)
        {
            parent_entry.children.remove(&name);
        }
        self.nodes.remove(&node);
        self.by_id.remove(&id);
    }

    /// Set the bookmark flag.
    pub fn set_pinned(&mut self, node: NodeId, pinned: bool) -> Result<()> {
        self.active(node)?;
        if let Some(entry) = self.nodes.get_mut(&node)
            && entry.record.pinned != pinned
        {
            entry.record.pinned = pinned;
            entry.record.touch();
            entry.dirty = true;
        }
        Ok(())
    }

    /// Record that the payload of a new document has been uploaded. The
    /// node stops being provisional and its metadata becomes due.
    pub fn mark_committed(&mut self, node: NodeId, kind: DocumentKind, size: u64) -> Result<()> {
        self.active(node)?;
        if let Some(entry) = self.nodes.get_mut(&node) {
            entry.record.kind = kind;
            entry.record.payload_size = size;
            entry.record.page_count = 1;
            entry.record.modified = true;
            entry.record.touch();
            entry.provisional = false;
            entry.dirty = true;
        }
        Ok(())
    }

    /// Remember the size of content produced locally (rendered notebooks).
    pub fn set_size(&mut self, node: NodeId, size: u64) {
        if let Some(entry) = self.nodes.get_mut(&node) {
            entry.record.payload_size = size;
        }
    }

    /// Dirty nodes whose metadata can be written now, in id order.
    ///
    /// Provisional documents are excluded: their metadata is only written
    /// together with their content.
    pub fn pending(&self) -> Vec<NodeId> {
        let mut pending: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.dirty && !(n.provisional && !n.record.kind.is_folder()))
            .map(|(id, _)| *id)
            .collect();
        pending.sort_unstable();
        pending
    }

    /// The device confirmed the write for `node`. Tombstones are dropped.
    pub fn mark_flushed(&mut self, node: NodeId) {
        let Some(entry) = self.nodes.get_mut(&node) else {
            return;
        };
        if entry.record.deleted {
            let id = entry.record.id.clone();
            self.nodes.remove(&node);
            self.by_id.remove(&id);
            return;
        }
        entry.dirty = false;
        entry.provisional = false;
    }

    /// Merge a fresh remote snapshot into the tree.
    ///
    /// Records are matched by id and keep their `NodeId`. Nodes with
    /// unflushed local changes win over the snapshot; clean nodes missing
    /// from it are dropped.
    pub fn refresh(&mut self, records: Vec<DocumentRecord>) -> RefreshReport {
        let mut report = RefreshReport::default();
        let mut order = Vec::with_capacity(records.len());
        let mut seen: HashSet<String> = HashSet::with_capacity(records.len());

        for record in records {
            if !seen.insert(record.id.clone()) {
                continue;
            }
            match self.by_id.get(&record.id).copied() {
                Some(node) => {
                    let Some(entry) = self.nodes.get_mut(&node) else {
                        continue;
                    };
                    if entry.dirty || entry.provisional {
                        report.preserved += 1;
                        if !entry.record.deleted {
                            order.push(node);
                        }
                        continue;
                    }
                    if record.deleted {
                        self.nodes.remove(&node);
                        self.by_id.remove(&record.id);
                        report.removed += 1;
                        continue;
                    }
                    if entry.record.fingerprint() != record.fingerprint() {
                        report.updated += 1;
                    }
                    entry.record = record;
                    entry.local_name = None;
                    order.push(node);
                }
                None => {
                    if record.deleted {
                        continue;
                    }
                    order.push(self.insert_unlinked(record));
                    report.added += 1;
                }
            }
        }

        let mut stale: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(id, n)| **id != ROOT && **id != TRASH && !seen.contains(&n.record.id))
            .map(|(id, _)| *id)
            .collect();
        stale.sort_unstable();
        for node in stale {
            let Some(entry) = self.nodes.get(&node) else {
                continue;
            };
            if entry.dirty || entry.provisional {
                report.preserved += 1;
                if !entry.record.deleted {
                    order.push(node);
                }
            } else {
                let id = entry.record.id.clone();
                self.nodes.remove(&node);
                self.by_id.remove(&id);
                report.removed += 1;
            }
        }

        if let Err(e) = self.link(&order, false) {
            warn!("{}; attaching every record to the root", e);
            let _ = self.link(&order, true);
        }
        report
    }
}

/// Pick a name not yet used among `children`, inserting ` (n)` before the
/// kind's extension.
fn unique_name(children: &BTreeMap<String, NodeId>, name: &str, kind: DocumentKind) -> String {
    if !children.contains_key(name) {
        return name.to_string();
    }
    let split = kind.extension().and_then(|ext| {
        name.strip_suffix(ext)
            .and_then(|rest| rest.strip_suffix('.'))
            .map(|stem| (stem, ext))
    });
    let mut n = 2;
    loop {
        let candidate = match split {
            Some((stem, ext)) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", name, n),
        };
        if !children.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, kind: DocumentKind, name: &str, parent: &str) -> DocumentRecord {
        let mut record =
            DocumentRecord::new(id.to_string(), kind, name, Parent::from_raw(parent));
        record.metadata_modified = false;
        record.modified = false;
        record
    }

    fn folder(id: &str, name: &str, parent: &str) -> DocumentRecord {
        record(id, DocumentKind::Folder, name, parent)
    }

    fn notebook(id: &str, name: &str, parent: &str) -> DocumentRecord {
        record(id, DocumentKind::Notebook, name, parent)
    }

    fn names(tree: &DocumentTree, node: NodeId) -> Vec<String> {
        tree.children(node)
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    /// Snapshot of every visible path, for "unchanged" assertions.
    fn paths(tree: &DocumentTree) -> Vec<String> {
        tree.walk()
            .into_iter()
            .map(|n| tree.path_of(n).unwrap())
            .collect()
    }

    #[test]
    fn test_rebuild_example() {
        let tree = DocumentTree::rebuild(vec![
            folder("A", "Notes", ""),
            notebook("B", "Diary", "A"),
        ])
        .unwrap();

        assert_eq!(names(&tree, ROOT), vec!["Notes"]);
        let notes = tree.resolve("/Notes").unwrap();
        assert_eq!(names(&tree, notes), vec!["Diary.pdf"]);

        let diary = tree.resolve_path(&["Notes", "Diary.pdf"]).unwrap();
        assert_eq!(tree.get(diary).unwrap().kind(), DocumentKind::Notebook);
        assert_eq!(tree.path_of(diary).unwrap(), "/Notes/Diary.pdf");
    }

    #[test]
    fn test_lookup_is_case_sensitive() {
        let tree = DocumentTree::rebuild(vec![folder("A", "Notes", "")]).unwrap();
        assert!(tree.resolve("/Notes").is_ok());
        assert_eq!(
            tree.resolve("/notes"),
            Err(TreeError::NotFound("notes".to_string()))
        );
    }

    #[test]
    fn test_duplicate_names_are_disambiguated_in_discovery_order() {
        let records = vec![
            notebook("n1", "Diary", ""),
            notebook("n2", "Diary", ""),
            notebook("n3", "Diary", ""),
        ];
        let tree = DocumentTree::rebuild(records.clone()).unwrap();
        assert_eq!(
            names(&tree, ROOT),
            vec!["Diary (2).pdf", "Diary (3).pdf", "Diary.pdf"]
        );
        let first = tree.resolve("/Diary.pdf").unwrap();
        assert_eq!(tree.get(first).unwrap().record().id, "n1");

        // Same input, same answer
        let again = DocumentTree::rebuild(records).unwrap();
        let first_again = again.resolve("/Diary.pdf").unwrap();
        assert_eq!(again.get(first_again).unwrap().record().id, "n1");

        // Reversed discovery order flips who gets the plain name
        let reversed = DocumentTree::rebuild(vec![
            notebook("n2", "Diary", ""),
            notebook("n1", "Diary", ""),
        ])
        .unwrap();
        let plain = reversed.resolve("/Diary.pdf").unwrap();
        assert_eq!(reversed.get(plain).unwrap().record().id, "n2");
    }

    #[test]
    fn test_folder_and_document_with_same_name_do_not_collide() {
        let tree = DocumentTree::rebuild(vec![
            folder("f", "Diary", ""),
            notebook("n", "Diary", ""),
        ])
        .unwrap();
        assert_eq!(names(&tree, ROOT), vec!["Diary", "Diary.pdf"]);
    }

    #[test]
    fn test_folder_name_collision_appends_suffix() {
        let tree = DocumentTree::rebuild(vec![
            folder("f1", "v1.2", ""),
            folder("f2", "v1.2", ""),
        ])
        .unwrap();
        assert_eq!(names(&tree, ROOT), vec!["v1.2", "v1.2 (2)"]);
    }

    #[test]
    fn test_two_node_cycle_is_broken() {
        let tree = DocumentTree::rebuild(vec![
            folder("A", "A", "B"),
            folder("B", "B", "A"),
            notebook("C", "C", "A"),
        ])
        .unwrap();

        let visited = tree.walk();
        assert_eq!(visited.len(), 3);
        for node in visited {
            assert!(tree.path_of(node).is_some());
        }
    }

    #[test]
    fn test_self_parent_is_attached_to_root() {
        let tree = DocumentTree::rebuild(vec![folder("A", "Loop", "A")]).unwrap();
        assert_eq!(names(&tree, ROOT), vec!["Loop"]);
    }

    #[test]
    fn test_long_cycle_terminates() {
        let mut records = Vec::new();
        for i in 0..50 {
            let parent = format!("f{}", (i + 1) % 50);
            records.push(folder(&format!("f{}", i), &format!("F{}", i), &parent));
        }
        let tree = DocumentTree::rebuild(records).unwrap();
        assert_eq!(tree.walk().len(), 50);
        assert_eq!(tree.children(ROOT).unwrap().len(), 1);
    }

    #[test]
    fn test_orphans_attach_to_root() {
        let tree = DocumentTree::rebuild(vec![
            notebook("n", "Lost", "missing-folder"),
            record("p", DocumentKind::Pdf, "Paper", "n"),
        ])
        .unwrap();
        // A document is not a valid parent either
        assert_eq!(names(&tree, ROOT), vec!["Lost.pdf", "Paper.pdf"]);
    }

    #[test]
    fn test_trash_and_deleted_records_are_hidden() {
        let mut gone = notebook("d", "Gone", "");
        gone.deleted = true;
        let tree = DocumentTree::rebuild(vec![
            folder("t", "Trashed", "trash"),
            notebook("c", "Inside", "t"),
            gone,
            notebook("k", "Kept", ""),
        ])
        .unwrap();
        assert_eq!(names(&tree, ROOT), vec!["Kept.pdf"]);
        assert_eq!(tree.walk().len(), 1);
        assert!(tree.node_for_id("d").is_none());
    }

    #[test]
    fn test_depth_first_walk_visits_every_record_once() {
        // Deterministic pseudo-random acyclic store: parents are always
        // folders created earlier, input order is scrambled.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        let mut folders: Vec<String> = vec![String::new()];
        let mut records = Vec::new();
        for i in 0..300 {
            let parent = folders[(next() as usize) % folders.len()].clone();
            let name = format!("item{}", next() % 20);
            if next() % 3 == 0 {
                let id = format!("f{}", i);
                records.push(folder(&id, &name, &parent));
                folders.push(id);
            } else {
                records.push(notebook(&format!("n{}", i), &name, &parent));
            }
        }
        for i in (1..records.len()).rev() {
            let j = (next() as usize) % (i + 1);
            records.swap(i, j);
        }

        let tree = DocumentTree::rebuild(records.clone()).unwrap();
        let visited = tree.walk();
        assert_eq!(visited.len(), records.len());

        let ids: HashSet<&str> = visited
            .iter()
            .map(|n| tree.get(*n).unwrap().record().id.as_str())
            .collect();
        assert_eq!(ids.len(), records.len());

        for node in visited {
            let mut cursor = node;
            let mut steps = 0;
            while cursor != ROOT {
                cursor = tree.get(cursor).unwrap().parent().unwrap();
                steps += 1;
                assert!(steps <= records.len());
            }
            // Every record sits under the folder it names
            let entry = tree.get(node).unwrap();
            let parent = entry.parent().unwrap();
            let expected = entry.record().parent.as_raw();
            assert_eq!(tree.get(parent).unwrap().record().id, expected);
        }
    }

    #[test]
    fn test_move_into_descendant_is_rejected_without_changes() {
        let mut tree = DocumentTree::rebuild(vec![
            folder("A", "A", ""),
            folder("B", "B", "A"),
            folder("C", "C", "B"),
        ])
        .unwrap();
        let a = tree.resolve("/A").unwrap();
        let c = tree.resolve("/A/B/C").unwrap();
        let before = paths(&tree);

        assert_eq!(tree.move_node(a, c, "A"), Err(TreeError::CycleRejected));
        assert_eq!(tree.move_node(a, a, "A2"), Err(TreeError::CycleRejected));
        assert_eq!(paths(&tree), before);
        assert!(tree.pending().is_empty());
    }

    #[test]
    fn test_move_to_taken_name_is_rejected() {
        let mut tree = DocumentTree::rebuild(vec![
            notebook("a", "One", ""),
            notebook("b", "Two", ""),
        ])
        .unwrap();
        let one = tree.resolve("/One.pdf").unwrap();
        assert_eq!(
            tree.move_node(one, ROOT, "Two.pdf"),
            Err(TreeError::NameConflict("Two.pdf".to_string()))
        );
        assert!(tree.resolve("/One.pdf").is_ok());
    }

    #[test]
    fn test_move_updates_links_and_record() {
        let mut tree = DocumentTree::rebuild(vec![
            folder("A", "Work", ""),
            record("p", DocumentKind::Pdf, "Paper", ""),
        ])
        .unwrap();
        let paper = tree.resolve("/Paper.pdf").unwrap();
        let work = tree.resolve("/Work").unwrap();

        tree.move_node(paper, work, "Final.pdf").unwrap();

        assert!(tree.resolve("/Paper.pdf").is_err());
        assert_eq!(tree.resolve("/Work/Final.pdf").unwrap(), paper);
        let entry = tree.get(paper).unwrap();
        assert_eq!(entry.record().visible_name, "Final");
        assert_eq!(entry.record().parent, Parent::Folder("A".to_string()));
        assert_eq!(entry.record().version, 2);
        assert_eq!(tree.pending(), vec![paper]);
    }

    #[test]
    fn test_move_onto_itself_is_a_no_op() {
        let mut tree = DocumentTree::rebuild(vec![notebook("a", "One", "")]).unwrap();
        let one = tree.resolve("/One.pdf").unwrap();
        tree.move_node(one, ROOT, "One.pdf").unwrap();
        assert!(tree.pending().is_empty());
    }

    #[test]
    fn test_root_is_immutable() {
        let mut tree = DocumentTree::new();
        assert_eq!(
            tree.move_node(ROOT, ROOT, "x"),
            Err(TreeError::RootImmutable)
        );
        assert_eq!(
            tree.remove(ROOT, RemovePolicy::Cascade),
            Err(TreeError::RootImmutable)
        );
    }

    #[test]
    fn test_create_child() {
        let mut tree = DocumentTree::rebuild(vec![
            folder("A", "Notes", ""),
            notebook("n", "Diary", ""),
        ])
        .unwrap();
        let notes = tree.resolve("/Notes").unwrap();

        let node = tree
            .create_child(notes, "report.pdf", DocumentKind::Pdf)
            .unwrap();
        let entry = tree.get(node).unwrap();
        assert!(entry.is_provisional());
        assert!(entry.is_dirty());
        assert_eq!(entry.record().visible_name, "report");
        assert_eq!(entry.record().parent, Parent::Folder("A".to_string()));
        assert_eq!(tree.resolve("/Notes/report.pdf").unwrap(), node);

        // Uncommitted documents are not flushable yet
        assert!(tree.pending().is_empty());

        assert_eq!(
            tree.create_child(notes, "report.pdf", DocumentKind::Pdf),
            Err(TreeError::NameConflict("report.pdf".to_string()))
        );
        let diary = tree.resolve("/Diary.pdf").unwrap();
        assert!(matches!(
            tree.create_child(diary, "x", DocumentKind::Folder),
            Err(TreeError::NotAFolder(_))
        ));
    }

    #[test]
    fn test_created_folder_is_pending_until_flushed() {
        let mut tree = DocumentTree::new();
        let node = tree.create_child(ROOT, "New", DocumentKind::Folder).unwrap();
        assert_eq!(tree.pending(), vec![node]);

        tree.mark_flushed(node);
        assert!(tree.pending().is_empty());
        assert!(!tree.get(node).unwrap().is_provisional());
    }

    #[test]
    fn test_remove_policies() {
        let mut tree = DocumentTree::rebuild(vec![
            folder("A", "A", ""),
            folder("B", "B", "A"),
            notebook("n", "Note", "B"),
        ])
        .unwrap();
        let a = tree.resolve("/A").unwrap();

        assert_eq!(
            tree.remove(a, RemovePolicy::RequireEmpty),
            Err(TreeError::NotEmpty("A".to_string()))
        );
        assert_eq!(tree.walk().len(), 3);

        let removed = tree.remove(a, RemovePolicy::Cascade).unwrap();
        assert_eq!(removed.len(), 3);
        assert!(tree.walk().is_empty());
        assert_eq!(tree.pending().len(), 3);
        for node in &removed {
            assert!(tree.get(*node).unwrap().is_deleted());
        }

        for node in removed {
            tree.mark_flushed(node);
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn test_removing_provisional_node_drops_it() {
        let mut tree = DocumentTree::new();
        let node = tree.create_child(ROOT, "tmp", DocumentKind::Folder).unwrap();
        tree.remove(node, RemovePolicy::RequireEmpty).unwrap();
        assert!(tree.get(node).is_none());
        assert!(tree.pending().is_empty());
    }

    #[test]
    fn test_refresh_merges_by_id() {
        let mut tree = DocumentTree::rebuild(vec![
            folder("A", "Notes", ""),
            notebook("n", "Diary", "A"),
            notebook("old", "Old", ""),
        ])
        .unwrap();
        let diary = tree.resolve("/Notes/Diary.pdf").unwrap();
        let notes = tree.resolve("/Notes").unwrap();

        // Local rename not yet flushed
        tree.move_node(diary, ROOT, "Journal.pdf").unwrap();

        // The device bumps the version of everything it edits
        let mut renamed = folder("A", "Notes renamed", "");
        renamed.version += 1;
        let report = tree.refresh(vec![
            renamed,
            notebook("n", "Diary", "A"),
            notebook("new", "Fresh", "A"),
        ]);

        assert_eq!(report.added, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.preserved, 1);

        // Node ids survive, dirty edit wins, remote rename applied
        assert_eq!(tree.resolve("/Journal.pdf").unwrap(), diary);
        assert_eq!(tree.resolve("/Notes renamed").unwrap(), notes);
        assert!(tree.resolve("/Notes renamed/Fresh.pdf").is_ok());
        assert!(tree.resolve("/Old.pdf").is_err());
        assert!(tree.get(diary).unwrap().is_dirty());
    }

    #[test]
    fn test_refresh_keeps_provisional_and_tombstones() {
        let mut tree = DocumentTree::rebuild(vec![notebook("n", "Doomed", "")]).unwrap();
        let doomed = tree.resolve("/Doomed.pdf").unwrap();
        tree.remove(doomed, RemovePolicy::RequireEmpty).unwrap();
        let fresh = tree.create_child(ROOT, "Fresh", DocumentKind::Folder).unwrap();

        let report = tree.refresh(vec![notebook("n", "Doomed", "")]);
        assert_eq!(report.preserved, 2);

        assert!(tree.resolve("/Doomed.pdf").is_err());
        assert_eq!(tree.resolve("/Fresh").unwrap(), fresh);
        assert_eq!(tree.pending(), vec![doomed, fresh]);
    }

    #[test]
    fn test_set_pinned_marks_dirty_once() {
        let mut tree = DocumentTree::rebuild(vec![notebook("n", "N", "")]).unwrap();
        let node = tree.resolve("/N.pdf").unwrap();
        tree.set_pinned(node, false).unwrap();
        assert!(tree.pending().is_empty());
        tree.set_pinned(node, true).unwrap();
        assert_eq!(tree.pending(), vec![node]);
        assert!(tree.get(node).unwrap().record().pinned);
    }
}
