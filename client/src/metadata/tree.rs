use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::node::{Node, NodeKind, ROOT_INODE};
use crate::error::DriveError;

/// The inode tree: inode → node plus the remote id → inode index.
///
/// Every non-root node sits in exactly one folder's `children`, the folder
/// its `parent_id` resolves to. Nodes whose parent cannot be resolved are
/// linked under the root instead.
#[derive(Debug, Clone)]
pub struct InodeTree {
    nodes: HashMap<u64, Node>,
    by_remote_id: HashMap<String, u64>,
    current_largest_inode: u64,
}

/// On-disk form of the tree.
#[derive(Debug, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub current_largest_inode: u64,
    pub nodes: Vec<Node>,
}

impl InodeTree {
    pub fn new(root_remote_id: Option<String>) -> Self {
        let root = Node::root(root_remote_id);
        let mut by_remote_id = HashMap::new();
        if let Some(id) = &root.remote_id {
            by_remote_id.insert(id.clone(), ROOT_INODE);
        }
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INODE, root);
        Self { nodes, by_remote_id, current_largest_inode: ROOT_INODE }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn current_largest_inode(&self) -> u64 {
        self.current_largest_inode
    }

    pub fn root_remote_id(&self) -> Option<&str> {
        self.nodes.get(&ROOT_INODE).and_then(|n| n.remote_id.as_deref())
    }

    pub fn get(&self, inode: u64) -> Option<&Node> {
        self.nodes.get(&inode)
    }

    pub fn get_mut(&mut self, inode: u64) -> Option<&mut Node> {
        self.nodes.get_mut(&inode)
    }

    pub fn get_by_remote_id(&self, remote_id: &str) -> Option<&Node> {
        self.by_remote_id.get(remote_id).and_then(|ino| self.nodes.get(ino))
    }

    pub fn inode_of(&self, remote_id: &str) -> Option<u64> {
        self.by_remote_id.get(remote_id).copied()
    }

    pub fn children(&self, inode: u64) -> Option<&[u64]> {
        self.nodes.get(&inode).and_then(Node::children)
    }

    pub fn lookup_child(&self, parent: u64, name: &str) -> Option<u64> {
        self.children(parent)?
            .iter()
            .copied()
            .find(|ino| self.nodes.get(ino).is_some_and(|n| n.name == name))
    }

    /// Resolves a parent remote id to a folder inode.
    fn resolve_folder(&self, parent_id: Option<&str>) -> Option<u64> {
        let inode = self.inode_of(parent_id?)?;
        self.nodes.get(&inode).filter(|n| n.is_folder()).map(|n| n.inode)
    }

    fn next_free_inode(&mut self) -> u64 {
        loop {
            self.current_largest_inode += 1;
            if !self.nodes.contains_key(&self.current_largest_inode) {
                return self.current_largest_inode;
            }
        }
    }

    /// Inserts `node` under a fresh inode and returns it.
    ///
    /// A node whose remote id is already indexed is not inserted twice; the
    /// existing inode is returned.
    pub fn insert(&mut self, mut node: Node) -> u64 {
        if let Some(existing) = node.remote_id.as_deref().and_then(|id| self.inode_of(id)) {
            warn!(remote_id = ?node.remote_id, inode = existing, "remote id already indexed");
            return existing;
        }

        let inode = self.next_free_inode();
        node.inode = inode;
        let parent = match self.resolve_folder(node.parent_id.as_deref()) {
            Some(parent) => parent,
            None => {
                warn!(name = %node.name, parent_id = ?node.parent_id, "parent not found, linking under root");
                node.parent_id = self.root_remote_id().map(str::to_string);
                ROOT_INODE
            }
        };
        if let Some(id) = &node.remote_id {
            self.by_remote_id.insert(id.clone(), inode);
        }
        self.nodes.insert(inode, node);
        self.link(parent, inode);
        inode
    }

    /// Inserts only if the parent is already indexed. Used by passes that
    /// retry unresolved rows later instead of falling back to the root.
    pub fn insert_if_parent_known(&mut self, node: Node) -> Option<u64> {
        self.resolve_folder(node.parent_id.as_deref())?;
        Some(self.insert(node))
    }

    pub fn parent_known(&self, parent_id: Option<&str>) -> bool {
        self.resolve_folder(parent_id).is_some()
    }

    /// Removes `inode` and everything below it. Returns the removed nodes,
    /// or `None` when the inode is unknown or is the root.
    pub fn delete(&mut self, inode: u64) -> Option<Vec<Node>> {
        if inode == ROOT_INODE {
            warn!("refusing to delete the root");
            return None;
        }
        let node = self.nodes.get(&inode)?;
        let parent = self.parent_inode(node);

        if let Some(parent) = parent {
            self.unlink(parent, inode);
        }

        let mut removed = Vec::new();
        let mut stack = vec![inode];
        while let Some(ino) = stack.pop() {
            let Some(node) = self.nodes.remove(&ino) else {
                continue;
            };
            if let Some(id) = &node.remote_id {
                if self.by_remote_id.get(id) == Some(&ino) {
                    self.by_remote_id.remove(id);
                }
            }
            if let NodeKind::Folder { children } = &node.kind {
                stack.extend(children.iter().copied());
            }
            removed.push(node);
        }
        Some(removed)
    }

    /// Moves `inode` under the folder whose remote id is `new_parent_id`.
    /// Unknown parents, and moves that would create a cycle, land under the root.
    pub fn reparent(&mut self, inode: u64, new_parent_id: &str) -> bool {
        if inode == ROOT_INODE {
            return false;
        }
        let Some(node) = self.nodes.get(&inode) else {
            return false;
        };
        let old_parent = self.parent_inode(node);

        let (target, parent_id) = match self.resolve_folder(Some(new_parent_id)) {
            Some(target) if !self.is_ancestor_or_self(inode, target) => {
                (target, Some(new_parent_id.to_string()))
            }
            _ => {
                warn!(inode, new_parent_id, "new parent not usable, moving under root");
                (ROOT_INODE, self.root_remote_id().map(str::to_string))
            }
        };

        if let Some(old) = old_parent {
            self.unlink(old, inode);
        }
        if let Some(node) = self.nodes.get_mut(&inode) {
            node.parent_id = parent_id;
        }
        self.link(target, inode);
        true
    }

    pub fn rename(&mut self, inode: u64, name: &str) -> bool {
        match self.nodes.get_mut(&inode) {
            Some(node) => {
                node.name = name.to_string();
                true
            }
            None => false,
        }
    }

    /// Binds a remote id to an existing node, replacing any previous binding.
    pub fn assign_remote_id(&mut self, inode: u64, remote_id: &str) -> bool {
        let Some(node) = self.nodes.get_mut(&inode) else {
            return false;
        };
        if let Some(old) = node.remote_id.replace(remote_id.to_string()) {
            self.by_remote_id.remove(&old);
        }
        self.by_remote_id.insert(remote_id.to_string(), inode);
        true
    }

    fn parent_inode(&self, node: &Node) -> Option<u64> {
        if node.inode == ROOT_INODE {
            return None;
        }
        // Walk from the recorded parent; fall back to scanning when the
        // parent id was never indexed (the node then lives under root).
        match self.resolve_folder(node.parent_id.as_deref()) {
            Some(p) if self.children(p).is_some_and(|c| c.contains(&node.inode)) => Some(p),
            _ => self
                .nodes
                .values()
                .find(|n| n.children().is_some_and(|c| c.contains(&node.inode)))
                .map(|n| n.inode),
        }
    }

    fn is_ancestor_or_self(&self, ancestor: u64, mut inode: u64) -> bool {
        let mut seen = HashSet::new();
        loop {
            if inode == ancestor {
                return true;
            }
            if !seen.insert(inode) {
                return false;
            }
            let Some(node) = self.nodes.get(&inode) else {
                return false;
            };
            match self.parent_inode(node) {
                Some(p) => inode = p,
                None => return false,
            }
        }
    }

    fn link(&mut self, parent: u64, child: u64) {
        if let Some(NodeKind::Folder { children }) = self.nodes.get_mut(&parent).map(|n| &mut n.kind) {
            if !children.contains(&child) {
                children.push(child);
            }
        }
    }

    fn unlink(&mut self, parent: u64, child: u64) {
        if let Some(NodeKind::Folder { children }) = self.nodes.get_mut(&parent).map(|n| &mut n.kind) {
            children.retain(|c| *c != child);
        }
    }

    pub fn to_snapshot(&self) -> TreeSnapshot {
        let mut nodes: Vec<Node> = self.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.inode);
        TreeSnapshot { current_largest_inode: self.current_largest_inode, nodes }
    }

    /// Rebuilds a tree from its snapshot, repairing child lists so that the
    /// parent/children invariant holds even for a hand-edited file.
    pub fn from_snapshot(snapshot: TreeSnapshot) -> Result<Self, DriveError> {
        let mut nodes: HashMap<u64, Node> = HashMap::with_capacity(snapshot.nodes.len());
        for node in snapshot.nodes {
            if nodes.insert(node.inode, node).is_some() {
                return Err(DriveError::Snapshot("duplicate inode".to_string()));
            }
        }
        match nodes.get(&ROOT_INODE) {
            Some(root) if root.is_folder() => {}
            _ => return Err(DriveError::Snapshot("root folder missing".to_string())),
        }

        let mut by_remote_id = HashMap::new();
        for node in nodes.values() {
            if let Some(id) = &node.remote_id {
                if by_remote_id.insert(id.clone(), node.inode).is_some() {
                    return Err(DriveError::Snapshot(format!("remote id {id} bound twice")));
                }
            }
        }

        let largest = nodes.keys().copied().max().unwrap_or(ROOT_INODE);
        let mut tree = Self {
            nodes,
            by_remote_id,
            current_largest_inode: snapshot.current_largest_inode.max(largest),
        };

        // Resolve every node's parent, then rebuild child lists keeping the
        // stored order for valid entries.
        let root_id = tree.root_remote_id().map(str::to_string);
        let mut parent_of: HashMap<u64, u64> = HashMap::new();
        let inodes: Vec<u64> = tree.nodes.keys().copied().filter(|i| *i != ROOT_INODE).collect();
        for inode in inodes {
            let parent_id = tree.nodes[&inode].parent_id.clone();
            let parent = match tree.resolve_folder(parent_id.as_deref()) {
                Some(p) if p != inode => p,
                _ => {
                    warn!(inode, ?parent_id, "snapshot node without parent, linking under root");
                    if let Some(node) = tree.nodes.get_mut(&inode) {
                        node.parent_id = root_id.clone();
                    }
                    ROOT_INODE
                }
            };
            parent_of.insert(inode, parent);
        }

        let mut stored: HashMap<u64, Vec<u64>> = HashMap::new();
        for node in tree.nodes.values_mut() {
            if let NodeKind::Folder { children } = &mut node.kind {
                stored.insert(node.inode, std::mem::take(children));
            }
        }
        let mut rebuilt: HashMap<u64, Vec<u64>> = HashMap::new();
        for (folder, children) in stored {
            let list = rebuilt.entry(folder).or_default();
            for child in children {
                if parent_of.get(&child) == Some(&folder) && !list.contains(&child) {
                    list.push(child);
                }
            }
        }
        let mut orphans: Vec<(u64, u64)> = parent_of
            .iter()
            .filter(|(child, parent)| !rebuilt.get(parent).is_some_and(|l| l.contains(child)))
            .map(|(c, p)| (*c, *p))
            .collect();
        orphans.sort();
        for (child, parent) in orphans {
            rebuilt.entry(parent).or_default().push(child);
        }
        for (folder, list) in rebuilt {
            if let Some(NodeKind::Folder { children }) = tree.nodes.get_mut(&folder).map(|n| &mut n.kind) {
                *children = list;
            }
        }

        tree.detach_cycles();
        Ok(tree)
    }

    /// Folders that are not reachable from the root (a parent cycle in a
    /// corrupted snapshot) are moved under the root.
    fn detach_cycles(&mut self) {
        let mut reachable = HashSet::new();
        let mut stack = vec![ROOT_INODE];
        while let Some(ino) = stack.pop() {
            if !reachable.insert(ino) {
                continue;
            }
            if let Some(children) = self.children(ino) {
                stack.extend(children.iter().copied());
            }
        }
        let mut stranded: Vec<u64> = self.nodes.keys().copied().filter(|i| !reachable.contains(i)).collect();
        stranded.sort();
        for inode in stranded {
            if reachable.contains(&inode) {
                continue;
            }
            let old = self.parent_inode(&self.nodes[&inode]);
            if let Some(old) = old {
                self.unlink(old, inode);
            }
            let root_id = self.root_remote_id().map(str::to_string);
            if let Some(node) = self.nodes.get_mut(&inode) {
                node.parent_id = root_id;
            }
            self.link(ROOT_INODE, inode);
            let mut stack = vec![inode];
            while let Some(ino) = stack.pop() {
                if reachable.insert(ino) {
                    if let Some(children) = self.children(ino) {
                        stack.extend(children.iter().copied());
                    }
                }
            }
        }
    }

    /// Iterates over all nodes in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }
}
