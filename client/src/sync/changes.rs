//! Application of change-feed entries to the inode tree.
//!
//! Applying an entry is idempotent: an entry applied twice leaves the tree
//! exactly as applying it once.

use tracing::{debug, info};

use crate::api_client::{Change, RemoteObject};
use crate::metadata::{InodeTree, Node, NodeKind};

#[derive(Debug, PartialEq)]
pub enum Applied {
    /// The object and its subtree were removed; carries the removed remote ids.
    Removed(Vec<String>),
    /// An indexed node was brought up to date; carries the fields that changed.
    Updated(Vec<&'static str>),
    Inserted(u64),
    /// The parent is not indexed yet.
    Deferred,
    Skipped,
}

/// Applies one change entry.
pub fn apply_change(tree: &mut InodeTree, change: &Change) -> Applied {
    let gone = change.deleted || change.file.as_ref().is_some_and(|f| !f.is_visible());
    if gone {
        return match tree.inode_of(&change.file_id).and_then(|ino| tree.delete(ino)) {
            Some(removed) => {
                info!(remote_id = %change.file_id, nodes = removed.len(), "removed remotely");
                Applied::Removed(removed.into_iter().filter_map(|n| n.remote_id).collect())
            }
            None => {
                debug!(remote_id = %change.file_id, "deletion of an unknown object");
                Applied::Skipped
            }
        };
    }

    let Some(file) = &change.file else {
        return Applied::Skipped;
    };
    if let Some(inode) = tree.inode_of(&file.id) {
        return Applied::Updated(update_node(tree, inode, file));
    }

    if file.parent_id().is_none() {
        debug!(remote_id = %file.id, "changed object without parents");
        return Applied::Skipped;
    }
    match tree.insert_if_parent_known(Node::from_remote(file)) {
        Some(inode) => {
            debug!(remote_id = %file.id, inode, title = %file.title, "new object");
            Applied::Inserted(inode)
        }
        None => Applied::Deferred,
    }
}

/// Field-level update. Only fields that differ are written and logged.
fn update_node(tree: &mut InodeTree, inode: u64, file: &RemoteObject) -> Vec<&'static str> {
    let mut changed = Vec::new();
    let Some(node) = tree.get_mut(inode) else {
        return changed;
    };

    let ctime = file.created_date.timestamp_millis();
    let mtime = file.modified_date.timestamp_millis();
    if node.ctime != ctime {
        node.ctime = ctime;
        changed.push("ctime");
    }
    if node.mtime != mtime {
        node.mtime = mtime;
        changed.push("mtime");
    }
    let name = file.display_name();
    if node.name != name {
        info!(from = %node.name, to = %name, "renamed remotely");
        node.name = name;
        changed.push("name");
    }
    if node.editable != file.editable {
        node.editable = file.editable;
        changed.push("editable");
    }
    if let NodeKind::File { size, download_url } = &mut node.kind {
        let new_size = file.file_size.unwrap_or(*size);
        if *size != new_size {
            info!(name = %node.name, from = *size, to = new_size, "size changed remotely");
            *size = new_size;
            changed.push("size");
        }
        if file.download_url.is_some() && *download_url != file.download_url {
            *download_url = file.download_url.clone();
            changed.push("download_url");
        }
    }

    let current_parent = node.parent_id.clone();
    if let Some(parent) = file.parent_id() {
        if current_parent.as_deref() != Some(parent) {
            info!(inode, to = parent, "moved remotely");
            tree.reparent(inode, parent);
            changed.push("parent");
        }
    }
    if !changed.is_empty() {
        debug!(inode, ?changed, "updated from change feed");
    }
    changed
}

/// Result of applying a batch.
#[derive(Debug, Default)]
pub struct PassReport {
    pub applied: usize,
    pub removed: Vec<String>,
    /// Entries still waiting for their parent after the last useful pass.
    pub deferred: Vec<Change>,
}

/// Applies a batch, then re-applies only the deferred entries until a pass
/// makes no progress.
pub fn apply_changes(tree: &mut InodeTree, changes: Vec<Change>) -> PassReport {
    let mut report = PassReport::default();
    let mut pending = changes;
    loop {
        let before = pending.len();
        let mut deferred = Vec::new();
        for change in pending {
            match apply_change(tree, &change) {
                Applied::Deferred => deferred.push(change),
                Applied::Removed(ids) => {
                    report.applied += 1;
                    report.removed.extend(ids);
                }
                Applied::Skipped => {}
                _ => report.applied += 1,
            }
        }
        if deferred.is_empty() || deferred.len() == before {
            report.deferred = deferred;
            return report;
        }
        pending = deferred;
    }
}

/// Wraps a listing row deferred by a full scan as a change entry.
pub fn as_change(file: RemoteObject) -> Change {
    Change { id: 0, file_id: file.id.clone(), deleted: false, file: Some(file) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::{FOLDER_MIME, Labels, ParentRef};
    use crate::metadata::ROOT_INODE;
    use chrono::TimeZone;

    fn object(id: &str, parent: &str, title: &str, folder: bool, size: u64, minute: u32) -> RemoteObject {
        let when = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap();
        RemoteObject {
            id: id.into(),
            title: title.into(),
            mime_type: if folder { FOLDER_MIME.into() } else { "text/plain".into() },
            parents: vec![ParentRef { id: parent.into(), is_root: false }],
            file_size: (!folder).then_some(size),
            download_url: (!folder).then(|| format!("http://dl/{id}")),
            created_date: when,
            modified_date: when,
            editable: true,
            labels: Labels::default(),
        }
    }

    fn change(id: u64, file: RemoteObject) -> Change {
        Change { id, file_id: file.id.clone(), deleted: false, file: Some(file) }
    }

    fn deletion(id: u64, file_id: &str) -> Change {
        Change { id, file_id: file_id.into(), deleted: true, file: None }
    }

    fn snapshot(tree: &InodeTree) -> String {
        serde_json::to_string(&tree.to_snapshot()).unwrap()
    }

    #[test]
    fn insert_update_move_delete() {
        let mut tree = InodeTree::new(Some("root".into()));
        let report = apply_changes(
            &mut tree,
            vec![
                change(1, object("docs", "root", "docs", true, 0, 0)),
                change(2, object("a", "docs", "a.txt", false, 10, 0)),
            ],
        );
        assert_eq!(report.applied, 2);
        let docs = tree.lookup_child(ROOT_INODE, "docs").unwrap();
        let a = tree.lookup_child(docs, "a.txt").unwrap();

        let applied = apply_change(&mut tree, &change(3, object("a", "root", "b.txt", false, 20, 5)));
        let Applied::Updated(fields) = applied else {
            panic!("expected an update");
        };
        assert!(fields.contains(&"name") && fields.contains(&"size") && fields.contains(&"parent"));
        assert_eq!(tree.lookup_child(ROOT_INODE, "b.txt"), Some(a));
        assert_eq!(tree.get(a).unwrap().size(), 20);

        let applied = apply_change(&mut tree, &deletion(4, "docs"));
        assert_eq!(applied, Applied::Removed(vec!["docs".into()]));
        assert!(tree.get(docs).is_none());
        assert_eq!(apply_change(&mut tree, &deletion(5, "docs")), Applied::Skipped);
    }

    #[test]
    fn applying_twice_equals_applying_once() {
        let batch = vec![
            change(1, object("docs", "root", "docs", true, 0, 0)),
            change(2, object("a", "docs", "a.txt", false, 10, 1)),
            change(3, object("a", "root", "renamed.txt", false, 11, 2)),
            deletion(4, "docs"),
        ];
        let mut once = InodeTree::new(Some("root".into()));
        let mut twice = InodeTree::new(Some("root".into()));
        for entry in &batch {
            apply_change(&mut once, entry);
            apply_change(&mut twice, entry);
            apply_change(&mut twice, entry);
            assert_eq!(snapshot(&once), snapshot(&twice));
        }
        assert_eq!(once.len(), 2);
        assert!(once.lookup_child(ROOT_INODE, "renamed.txt").is_some());
    }

    #[test]
    fn unchanged_entry_reports_no_fields() {
        let mut tree = InodeTree::new(Some("root".into()));
        let entry = change(1, object("a", "root", "a.txt", false, 10, 0));
        apply_change(&mut tree, &entry);
        assert_eq!(apply_change(&mut tree, &entry), Applied::Updated(vec![]));
    }

    #[test]
    fn children_before_parents_resolve_in_later_passes() {
        let mut tree = InodeTree::new(Some("root".into()));
        let report = apply_changes(
            &mut tree,
            vec![
                change(1, object("f", "sub", "deep.txt", false, 1, 0)),
                change(2, object("sub", "top", "sub", true, 0, 0)),
                change(3, object("top", "root", "top", true, 0, 0)),
                change(4, object("x", "missing", "x.txt", false, 1, 0)),
            ],
        );
        assert_eq!(report.applied, 3);
        assert_eq!(report.deferred.len(), 1);
        assert_eq!(report.deferred[0].file_id, "x");
        let top = tree.lookup_child(ROOT_INODE, "top").unwrap();
        let sub = tree.lookup_child(top, "sub").unwrap();
        assert!(tree.lookup_child(sub, "deep.txt").is_some());
    }

    #[test]
    fn trashed_file_is_removed() {
        let mut tree = InodeTree::new(Some("root".into()));
        apply_change(&mut tree, &change(1, object("a", "root", "a.txt", false, 1, 0)));
        let mut trashed = object("a", "root", "a.txt", false, 1, 0);
        trashed.labels.trashed = true;
        assert_eq!(apply_change(&mut tree, &change(2, trashed)), Applied::Removed(vec!["a".into()]));
        assert!(tree.get_by_remote_id("a").is_none());
    }
}
