use protocol::DuplicateNode;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, instrument};

use crate::db::{DbError, TypedSled};
use crate::path::FilePathBuilder;

/// A logical file and the replicas it is written to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// unique, the key in the coordinator
    pub name: String,
    pub storage_id: u32,
    pub storage_name: String,
    /// duplication service that created the file
    pub service_id: String,
    /// milliseconds since the unix epoch
    pub create_time: i64,
    pub capacity: u64,
    pub length: u64,
    pub duplicate_nodes: Vec<DuplicateNode>,
}

impl FileNode {
    pub fn new(
        name: impl Into<String>,
        storage_id: u32,
        storage_name: impl Into<String>,
        service_id: impl Into<String>,
        capacity: u64,
        duplicate_nodes: Vec<DuplicateNode>,
    ) -> Self {
        let now = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        Self {
            name: name.into(),
            storage_id,
            storage_name: storage_name.into(),
            service_id: service_id.into(),
            create_time: now as i64,
            capacity,
            length: 0,
            duplicate_nodes,
        }
    }

    /// path of this file on the disk node with secondary id `second_id`
    pub fn path_on(&self, second_id: &str) -> String {
        FilePathBuilder::build_file_path(&self.storage_name, second_id, self.create_time, &self.name)
    }
}

/// Durable record of which logical files exist. Once a file node is
/// deleted here the file counts as gone, whatever its replicas hold.
#[derive(Debug, Clone)]
pub struct FileCoordinator {
    files: sled::Tree,
    counters: sled::Tree,
}

impl FileCoordinator {
    pub fn open(db: &sled::Db) -> Result<Self, DbError> {
        Ok(Self {
            files: db.open_tree("file_nodes")?,
            counters: db.open_tree("file_counters")?,
        })
    }

    /// Returns false if a file node with this name already exists, it is
    /// left as is.
    #[instrument(skip_all, fields(file = %node.name), err)]
    pub fn create(&self, node: &FileNode) -> Result<bool, DbError> {
        let bytes = bincode::serialize(node)?;
        let created = self
            .files
            .compare_and_swap(&node.name, None::<&[u8]>, Some(bytes))?
            .is_ok();
        if created {
            info!("created file node");
        }
        Ok(created)
    }

    /// Replace a stored file node, returns false if it no longer exists
    pub fn update(&self, node: &FileNode) -> Result<bool, DbError> {
        let bytes = bincode::serialize(node)?;
        loop {
            let Some(old) = self.files.get(&node.name)? else {
                return Ok(false);
            };
            let res = self
                .files
                .compare_and_swap(&node.name, Some(old), Some(bytes.clone()))?;
            if res.is_ok() {
                return Ok(true);
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Result<Option<FileNode>, DbError> {
        self.files.get_val(name)
    }

    /// Idempotent, deleting a file node that is already gone returns false
    #[instrument(skip_all, fields(file = %node.name), err)]
    pub fn delete(&self, node: &FileNode) -> Result<bool, DbError> {
        let removed = self.files.remove(&node.name)?.is_some();
        match removed {
            true => info!("deleted file node"),
            false => debug!("file node was already deleted"),
        }
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<FileNode>, DbError> {
        self.files
            .iter()
            .values()
            .map(|bytes| -> Result<FileNode, DbError> { Ok(bincode::deserialize(&bytes?)?) })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// A file name no earlier call for `service_id` returned
    pub fn next_file_name(&self, service_id: &str) -> Result<String, DbError> {
        let n: u64 = self.counters.increment(service_id)?;
        Ok(format!("{service_id}_{n}"))
    }

    /// make everything written so far durable, returns the bytes flushed
    pub fn flush(&self) -> Result<usize, DbError> {
        Ok(self.files.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> FileCoordinator {
        let db = sled::Config::new().temporary(true).open().unwrap();
        FileCoordinator::open(&db).unwrap()
    }

    fn file(name: &str) -> FileNode {
        let replicas = vec![
            DuplicateNode::new("disk_group", "1"),
            DuplicateNode::new("disk_group", "2"),
        ];
        FileNode::new(name, 3, "logs", "dup_1", 1024, replicas)
    }

    #[test]
    fn delete_twice_is_delete_once() {
        let files = coordinator();
        let f = file("f1");
        files.create(&f).unwrap();
        files.create(&file("f2")).unwrap();

        assert!(files.delete(&f).unwrap());
        assert!(!files.delete(&f).unwrap());
        assert_eq!(files.lookup("f1").unwrap(), None);
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn create_does_not_overwrite() {
        let files = coordinator();
        let f = file("f1");
        assert!(files.create(&f).unwrap());

        let mut changed = f.clone();
        changed.length = 99;
        assert!(!files.create(&changed).unwrap());
        assert_eq!(files.lookup("f1").unwrap().unwrap().length, 0);

        assert!(files.update(&changed).unwrap());
        assert_eq!(files.lookup("f1").unwrap().unwrap().length, 99);
    }

    #[test]
    fn update_of_deleted_node() {
        let files = coordinator();
        let f = file("f1");
        files.create(&f).unwrap();
        files.delete(&f).unwrap();
        assert!(!files.update(&f).unwrap());
        assert!(files.is_empty());
    }

    #[test]
    fn names_are_unique() {
        let files = coordinator();
        let a = files.next_file_name("dup_1").unwrap();
        let b = files.next_file_name("dup_1").unwrap();
        assert_ne!(a, b);
        assert_eq!(files.next_file_name("dup_2").unwrap(), "dup_2_0");
    }

    #[test]
    fn list_everything() {
        let files = coordinator();
        files.create(&file("a")).unwrap();
        files.create(&file("b")).unwrap();
        let names: Vec<_> = files.list().unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        files.flush().unwrap();
    }

    #[test]
    fn survives_reopen() {
        let dir = mktemp::Temp::new_dir().unwrap();
        {
            let db = sled::open(dir.join("db")).unwrap();
            FileCoordinator::open(&db).unwrap().create(&file("f")).unwrap();
            db.flush().unwrap();
        }
        let db = sled::open(dir.join("db")).unwrap();
        let files = FileCoordinator::open(&db).unwrap();
        assert_eq!(files.lookup("f").unwrap().unwrap().name, "f");
    }
}
