//! Cold start: list the whole remote tree and build the inode tree from it.
//!
//! Listing rows are written to the `scan_rows` table page by page before any
//! parsing happens, so a crash mid-listing loses nothing already fetched and
//! the parse works on a stable set.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, params};
use tracing::{debug, info, warn};

use crate::api_client::{RemoteObject, RemoteStore};
use crate::error::DriveError;
use crate::metadata::{InodeTree, Node};
use crate::retry::{RetryPolicy, with_retries};

/// Raw listing rows of the scan in progress.
pub struct ScanStore {
    conn: Mutex<Connection>,
}

impl ScanStore {
    pub fn open(db_path: &Path) -> Result<Self, DriveError> {
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, DriveError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DriveError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS scan_rows (
                id TEXT PRIMARY KEY,
                row TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn clear(&self) -> Result<(), DriveError> {
        self.conn.lock().execute("DELETE FROM scan_rows", [])?;
        Ok(())
    }

    pub fn put_page(&self, rows: &[RemoteObject]) -> Result<(), DriveError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for row in rows {
            tx.execute(
                "INSERT OR REPLACE INTO scan_rows (id, row) VALUES (?1, ?2)",
                params![row.id, serde_json::to_string(row)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn rows(&self) -> Result<Vec<RemoteObject>, DriveError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT row FROM scan_rows")?;
        let raw: Vec<String> = stmt.query_map([], |r| r.get(0))?.collect::<Result<_, _>>()?;
        raw.iter().map(|json| serde_json::from_str(json).map_err(DriveError::from)).collect()
    }
}

/// Outcome of a cold start.
#[derive(Debug)]
pub struct ScanResult {
    pub tree: InodeTree,
    /// Change id current when the listing started.
    pub largest_change_id: u64,
    /// Files whose parent is not (yet) known; retried on the next change pass.
    pub deferred: Vec<RemoteObject>,
    pub unresolved_folders: usize,
}

/// Lists the remote tree and builds a fresh inode tree.
///
/// # Arguments
/// * `remote` - The object store.
/// * `store` - Scratch table for the raw listing.
/// * `policy` - Retry budget for each page.
pub async fn full_scan(
    remote: &dyn RemoteStore,
    store: &ScanStore,
    policy: &RetryPolicy,
) -> Result<ScanResult, DriveError> {
    let root = with_retries(remote, policy, "resolve root", || remote.root()).await?;
    let largest_change_id =
        with_retries(remote, policy, "largest change id", || remote.largest_change_id()).await?;
    info!(root = %root.id, largest_change_id, "starting full scan");

    store.clear()?;
    let mut page_token: Option<String> = None;
    let mut pages = 0;
    loop {
        let token = page_token.clone();
        let page = with_retries(remote, policy, "list files", || remote.list_files(token.as_deref())).await?;
        store.put_page(&page.items)?;
        pages += 1;
        debug!(pages, rows = page.items.len(), "listing page stored");
        match page.next_page_token {
            Some(next) => page_token = Some(next),
            None => break,
        }
    }

    let rows = store.rows()?;
    info!(pages, rows = rows.len(), "listing complete, building tree");
    let mut result = build_tree(&root.id, rows);
    result.largest_change_id = largest_change_id;
    Ok(result)
}

/// Builds the tree from listing rows: folders first, repeating passes over
/// the shrinking set of unplaced folders until a pass places nothing, then
/// files.
pub fn build_tree(root_id: &str, rows: Vec<RemoteObject>) -> ScanResult {
    let mut tree = InodeTree::new(Some(root_id.to_string()));
    let (mut folders, files): (Vec<RemoteObject>, Vec<RemoteObject>) = rows
        .into_iter()
        .filter(|row| row.is_visible() && row.id != root_id)
        .partition(RemoteObject::is_folder);

    loop {
        let before = folders.len();
        folders.retain(|folder| tree.insert_if_parent_known(Node::from_remote(folder)).is_none());
        if folders.is_empty() || folders.len() == before {
            break;
        }
    }
    if !folders.is_empty() {
        warn!(count = folders.len(), "folders with unknown parents were not placed");
        for folder in &folders {
            debug!(id = %folder.id, title = %folder.title, parent = ?folder.parent_id(), "unplaced folder");
        }
    }

    let mut deferred = Vec::new();
    for file in files {
        if tree.insert_if_parent_known(Node::from_remote(&file)).is_none() {
            deferred.push(file);
        }
    }
    if !deferred.is_empty() {
        info!(count = deferred.len(), "files deferred to the next change pass");
    }

    ScanResult { tree, largest_change_id: 0, deferred, unresolved_folders: folders.len() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::{FOLDER_MIME, Labels, ParentRef};
    use crate::metadata::ROOT_INODE;

    fn row(id: &str, parent: &str, title: &str, folder: bool) -> RemoteObject {
        RemoteObject {
            id: id.into(),
            title: title.into(),
            mime_type: if folder { FOLDER_MIME.into() } else { "text/plain".into() },
            parents: vec![ParentRef { id: parent.into(), is_root: parent == "root" }],
            file_size: if folder { None } else { Some(100) },
            download_url: None,
            created_date: chrono::Utc::now(),
            modified_date: chrono::Utc::now(),
            editable: true,
            labels: Labels::default(),
        }
    }

    #[test]
    fn nested_folders_resolve_in_any_order() {
        // Deepest first: needs several passes.
        let rows = vec![
            row("c", "b", "c", true),
            row("b", "a", "b", true),
            row("a", "root", "a", true),
            row("f", "c", "file.txt", false),
        ];
        let result = build_tree("root", rows);
        let tree = &result.tree;
        let a = tree.lookup_child(ROOT_INODE, "a").unwrap();
        let b = tree.lookup_child(a, "b").unwrap();
        let c = tree.lookup_child(b, "c").unwrap();
        assert!(tree.lookup_child(c, "file.txt").is_some());
        assert!(result.deferred.is_empty());
        assert_eq!(result.unresolved_folders, 0);
    }

    #[test]
    fn hidden_trashed_and_orphaned_rows() {
        let mut trashed = row("t", "root", "trash.txt", false);
        trashed.labels.trashed = true;
        let mut hidden = row("h", "root", "hidden", true);
        hidden.labels.hidden = true;
        let rows = vec![
            trashed,
            hidden,
            row("lost", "nowhere", "lost", true),
            row("o", "nowhere", "orphan.txt", false),
            row("n", "root", "na\0me", false),
        ];
        let result = build_tree("root", rows);
        assert_eq!(result.tree.len(), 2);
        assert_eq!(result.unresolved_folders, 1);
        assert_eq!(result.deferred.len(), 1);
        assert_eq!(result.deferred[0].id, "o");
        assert!(result.tree.lookup_child(ROOT_INODE, "name").is_some());
    }

    #[test]
    fn scan_rows_persist_between_pages() {
        let store = ScanStore::in_memory().unwrap();
        store.put_page(&[row("a", "root", "a", true)]).unwrap();
        store.put_page(&[row("b", "a", "b", false), row("a", "root", "a", true)]).unwrap();
        let mut ids: Vec<String> = store.rows().unwrap().into_iter().map(|r| r.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        store.clear().unwrap();
        assert!(store.rows().unwrap().is_empty());
    }
}
