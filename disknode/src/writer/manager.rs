use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::{FileInfo, FileMeta, RecordBytes, Seq, SequenceInfo, WriteResult};
use tracing::{debug, info, instrument, warn};

use super::record::{self, is_sidecar, sidecar};
use super::{remove_if_exists, RecordFileWriter, WriterError};
use crate::context::{DiskContext, InvalidPath};
use crate::sequence::SequenceCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(WriteResult),
    /// the replica already holds a write at or after this seq
    Rejected { last: Seq },
}

type Shared = Arc<Mutex<RecordFileWriter>>;

/// a writer whose user panicked is still consistent on disk
fn lock(writer: &Mutex<RecordFileWriter>) -> MutexGuard<'_, RecordFileWriter> {
    writer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// All files this disk node has open for writing, keyed by logical path.
///
/// Every method does blocking io, call them from the worker pool.
#[derive(Debug)]
pub struct FileWriterManager {
    ctx: DiskContext,
    /// service id of this disk node, the replica in sequence cache keys
    replica: String,
    sequences: Arc<SequenceCache>,
    writers: DashMap<String, Shared>,
}

impl FileWriterManager {
    pub fn new(ctx: DiskContext, replica: impl Into<String>, sequences: Arc<SequenceCache>) -> Self {
        Self {
            ctx,
            replica: replica.into(),
            sequences,
            writers: DashMap::new(),
        }
    }

    pub fn context(&self) -> &DiskContext {
        &self.ctx
    }

    pub fn replica(&self) -> &str {
        &self.replica
    }

    pub fn open_files(&self) -> usize {
        self.writers.len()
    }

    pub fn is_open(&self, path: &str) -> bool {
        self.ctx
            .normalize(path)
            .map_or(false, |key| self.writers.contains_key(&key))
    }

    fn writer(&self, key: &str) -> Option<Shared> {
        self.writers.get(key).map(|w| w.value().clone())
    }

    fn resolve(&self, path: &str) -> Result<(String, PathBuf), WriterError> {
        let key = self.ctx.normalize(path)?;
        let concrete = self.ctx.concrete_path(&key)?;
        Ok((key, concrete))
    }

    fn publish(&self, key: &str, writer: &RecordFileWriter) {
        if let Some(last) = writer.last_seq() {
            self.sequences
                .record_write(key, &self.replica, last, writer.length());
        }
    }

    /// Open `path` for writing, opening an already open file is a no-op.
    /// Missing directories below the data root are created.
    #[instrument(skip(self), err)]
    pub fn open(&self, path: &str, capacity: Option<u64>) -> Result<(), WriterError> {
        let (key, concrete) = self.resolve(path)?;
        if key == "/" {
            return Err(InvalidPath(path.to_owned()).into());
        }
        if !self.ctx.root().is_dir() {
            return Err(WriterError::RootMissing(self.ctx.root().to_owned()));
        }

        match self.writers.entry(key) {
            Entry::Occupied(_) => debug!("already open"),
            Entry::Vacant(entry) => {
                if let Some(parent) = concrete.parent() {
                    fs::create_dir_all(parent)?;
                }
                let writer = RecordFileWriter::create(&concrete, capacity)?;
                self.publish(entry.key(), &writer);
                entry.insert(Arc::new(Mutex::new(writer)));
            }
        }
        Ok(())
    }

    /// Append `bytes` as write `seq`. Refused if this replica already
    /// acknowledged `seq` or anything after it.
    pub fn write(&self, path: &str, seq: Seq, bytes: &[u8]) -> Result<WriteOutcome, WriterError> {
        let key = self.ctx.normalize(path)?;
        let writer = self
            .writer(&key)
            .ok_or_else(|| WriterError::NotOpen(key.clone()))?;
        let mut writer = lock(&writer);

        if let Some(pos) = self.sequences.get_position(&key, &self.replica) {
            if seq <= pos.seq {
                return Ok(WriteOutcome::Rejected { last: pos.seq });
            }
        }

        let record = writer.append(seq, bytes)?;
        self.sequences
            .record_write(&key, &self.replica, seq, writer.length());
        Ok(WriteOutcome::Written(WriteResult {
            seq,
            offset: record.offset,
            size: record.size,
        }))
    }

    /// Add records pulled from another replica, skipping those already
    /// present. A record that belongs before the tail moves the tail back,
    /// the data file stays ordered by seq. Returns how many were added.
    pub fn recover_records(
        &self,
        path: &str,
        mut records: Vec<RecordBytes>,
    ) -> Result<usize, WriterError> {
        let key = self.ctx.normalize(path)?;
        let writer = self
            .writer(&key)
            .ok_or_else(|| WriterError::NotOpen(key.clone()))?;
        let mut writer = lock(&writer);

        records.sort_by_key(|r| r.seq);
        records.dedup_by_key(|r| r.seq);
        records.retain(|r| !writer.contains(r.seq));
        let Some(first) = records.first().map(|r| r.seq) else {
            return Ok(0);
        };
        let incoming: u64 = records.iter().map(|r| r.bytes.len() as u64).sum();
        writer.check_capacity(incoming)?;

        let added = records.len();
        let mut ordered = writer.split_off(first)?;
        if !ordered.is_empty() {
            debug!("moving {} records to fit in earlier seqs", ordered.len());
        }
        ordered.append(&mut records);
        ordered.sort_by_key(|r| r.seq);
        for RecordBytes { seq, bytes } in ordered {
            writer.append(seq, &bytes)?;
        }

        let length = writer.length();
        if let Some(last) = writer.last_seq() {
            if !self.sequences.record_write(&key, &self.replica, last, length) {
                self.sequences.grow_length(&key, &self.replica, length);
            }
        }
        Ok(added)
    }

    /// False if there is no such file
    pub fn flush(&self, path: &str) -> Result<bool, WriterError> {
        let (key, concrete) = self.resolve(path)?;
        match self.writer(&key) {
            Some(writer) => {
                lock(&writer).flush()?;
                Ok(true)
            }
            // closed files are on disk already
            None => Ok(concrete.is_file()),
        }
    }

    fn flush_where(&self, pred: impl Fn(&RecordFileWriter) -> bool) -> usize {
        let writers: Vec<_> = self
            .writers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut flushed = 0;
        for (key, writer) in writers {
            let mut writer = lock(&writer);
            if !pred(&writer) {
                continue;
            }
            match writer.flush() {
                Ok(()) => flushed += 1,
                Err(e) => warn!("could not flush {key}: {e}"),
            }
        }
        flushed
    }

    /// flush every open file, returns how many were flushed
    pub fn flush_all(&self) -> usize {
        self.flush_where(|_| true)
    }

    pub fn flush_dirty(&self) -> usize {
        self.flush_where(RecordFileWriter::is_dirty)
    }

    /// Finalize the writer for `path`. Closing a file that was closed
    /// before succeeds, closing one that never existed does not.
    #[instrument(skip(self), err)]
    pub fn close(&self, path: &str) -> Result<bool, WriterError> {
        let (key, concrete) = self.resolve(path)?;
        let Some((_, writer)) = self.writers.remove(&key) else {
            return Ok(concrete.is_file() && !sidecar(&concrete).exists());
        };

        let res = lock(&writer).close();
        self.sequences.remove_file(&key);
        let length = res?;
        info!("closed {key}, {length} bytes");
        Ok(true)
    }

    fn discard(&self, key: &str) {
        if let Some((_, writer)) = self.writers.remove(key) {
            lock(&writer).abandon();
        }
        self.sequences.remove_file(key);
    }

    /// Remove a file or directory. Files still being written and non empty
    /// directories are only removed if `force` is set.
    #[instrument(skip(self), err)]
    pub fn delete(&self, path: &str, force: bool) -> Result<bool, WriterError> {
        let (key, concrete) = self.resolve(path)?;
        if key == "/" {
            return Ok(false);
        }

        let meta = match fs::metadata(&concrete) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if meta.is_dir() {
            let below = format!("{key}/");
            let open: Vec<String> = self
                .writers
                .iter()
                .map(|e| e.key().clone())
                .filter(|k| k.starts_with(&below))
                .collect();
            let empty = fs::read_dir(&concrete)?.next().is_none();
            if !force && !empty {
                return Ok(false);
            }
            for key in open {
                self.discard(&key);
            }
            fs::remove_dir_all(&concrete)?;
        } else {
            if self.writers.contains_key(&key) {
                if !force {
                    return Ok(false);
                }
                self.discard(&key);
            }
            fs::remove_file(&concrete)?;
            remove_if_exists(&sidecar(&concrete))?;
        }
        info!("deleted {key}");
        Ok(true)
    }

    /// None unless the file is open for writing
    pub fn sequence_info(&self, path: &str) -> Result<Option<SequenceInfo>, WriterError> {
        let key = self.ctx.normalize(path)?;
        let Some(writer) = self.writer(&key) else {
            return Ok(None);
        };
        let writer = lock(&writer);
        Ok(Some(SequenceInfo {
            seqs: writer.seqs(),
            last_seq: self.sequences.position(&key, &self.replica).seq,
            length: writer.length(),
        }))
    }

    pub fn records(&self, path: &str, seqs: &[Seq]) -> Result<Option<Vec<RecordBytes>>, WriterError> {
        let key = self.ctx.normalize(path)?;
        let Some(writer) = self.writer(&key) else {
            return Ok(None);
        };
        let found = lock(&writer).read_records(seqs)?;
        Ok(Some(found))
    }

    pub fn meta(&self, path: &str) -> Result<Option<FileMeta>, WriterError> {
        let (key, concrete) = self.resolve(path)?;
        if let Some(writer) = self.writer(&key) {
            let writer = lock(&writer);
            return Ok(Some(FileMeta {
                path: key,
                length: writer.length(),
                last_seq: writer.last_seq(),
                records: writer.record_count(),
                writing: true,
            }));
        }

        match fs::metadata(&concrete) {
            Ok(meta) if meta.is_file() => Ok(Some(FileMeta {
                path: key,
                length: meta.len(),
                last_seq: None,
                records: 0,
                writing: false,
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read `size` bytes from `offset`, clamped to the file. Everything
    /// acknowledged so far is visible, also for files still being written.
    pub fn read(&self, path: &str, offset: u64, size: Option<u64>) -> Result<Option<Vec<u8>>, WriterError> {
        let (key, concrete) = self.resolve(path)?;
        if let Some(writer) = self.writer(&key) {
            lock(&writer).flush_buffers()?;
        }

        let mut file = match File::open(&concrete) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Ok(None);
        }

        let len = meta.len();
        let start = offset.min(len);
        let end = size.map_or(len, |size| start.saturating_add(size).min(len));
        let mut buf = vec![0; (end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    /// Entries directly below `path`, or `path` itself if it is a file.
    /// Record sidecars are not listed.
    pub fn list(&self, path: &str) -> Result<Option<Vec<FileInfo>>, WriterError> {
        let (key, concrete) = self.resolve(path)?;
        let meta = match fs::metadata(&concrete) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if meta.is_file() {
            return Ok(Some(vec![FileInfo {
                path: key,
                is_dir: false,
                size: meta.len(),
            }]));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&concrete)? {
            let entry = entry?;
            let path = entry.path();
            if is_sidecar(&path) {
                continue;
            }
            let Some(logical) = self.ctx.logical_path(&path) else {
                continue;
            };
            let meta = entry.metadata()?;
            entries.push(FileInfo {
                path: logical,
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Some(entries))
    }

    /// Copy a file to another logical path on this node, refused if the
    /// target is open for writing.
    pub fn copy(&self, from: &str, to: &str) -> Result<bool, WriterError> {
        let (from_key, from) = self.resolve(from)?;
        let (to_key, to) = self.resolve(to)?;
        if self.writers.contains_key(&to_key) || to_key == "/" {
            return Ok(false);
        }
        if let Some(writer) = self.writer(&from_key) {
            lock(&writer).flush_buffers()?;
        }
        if !from.is_file() {
            return Ok(false);
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&from, &to)?;
        Ok(true)
    }

    /// Reopen every file that has a sidecar, which are the files that were
    /// open when the node stopped. Returns how many were reopened.
    #[instrument(skip(self), err)]
    pub fn rebuild(&self) -> Result<usize, WriterError> {
        let root = self.ctx.root().to_owned();
        if !root.is_dir() {
            return Ok(0);
        }

        let mut reopened = 0;
        let mut to_visit = vec![root];
        while let Some(dir) = to_visit.pop() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    to_visit.push(path);
                } else if is_sidecar(&path) {
                    reopened += usize::from(self.reopen(&path)?);
                }
            }
        }
        info!("reopened {reopened} files");
        Ok(reopened)
    }

    fn reopen(&self, index: &Path) -> Result<bool, WriterError> {
        let data = record::data_file(index);
        if !data.is_file() {
            warn!("removing sidecar without data file: {index:?}");
            remove_if_exists(index)?;
            return Ok(false);
        }
        let Some(key) = self.ctx.logical_path(&data) else {
            return Ok(false);
        };

        let writer = RecordFileWriter::reopen(&data, None)?;
        self.publish(&key, &writer);
        self.writers.insert(key, Arc::new(Mutex::new(writer)));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use mktemp::Temp;

    use super::*;

    fn manager(root: &Path) -> FileWriterManager {
        FileWriterManager::new(
            DiskContext::new(root),
            "disk_1",
            Arc::new(SequenceCache::new()),
        )
    }

    fn written(outcome: WriteOutcome) -> WriteResult {
        match outcome {
            WriteOutcome::Written(res) => res,
            WriteOutcome::Rejected { last } => panic!("write rejected, at {last}"),
        }
    }

    #[test]
    fn writes_advance_the_sequence_cache() {
        let dir = Temp::new_dir().unwrap();
        let writers = manager(&dir);
        writers.open("/logs/1/f", None).unwrap();
        writers.open("/logs/1/f", None).unwrap();

        let res = written(writers.write("/logs/1/f", 1, b"abc").unwrap());
        assert_eq!(res, WriteResult { seq: 1, offset: 0, size: 3 });
        written(writers.write("logs/1/f", 3, b"de").unwrap());

        let pos = writers.sequences.position("/logs/1/f", "disk_1");
        assert_eq!((pos.seq, pos.length), (3, 5));
        assert_eq!(
            writers.write("/logs/1/f", 2, b"x").unwrap(),
            WriteOutcome::Rejected { last: 3 }
        );
        assert_eq!(writers.read("/logs/1/f", 0, None).unwrap().unwrap(), b"abcde");
    }

    #[test]
    fn open_needs_the_data_root() {
        let dir = Temp::new_dir().unwrap();
        let writers = manager(&dir.join("missing"));
        assert!(matches!(
            writers.open("/f", None),
            Err(WriterError::RootMissing(_))
        ));
    }

    #[test]
    fn write_to_unopened_file() {
        let dir = Temp::new_dir().unwrap();
        let writers = manager(&dir);
        assert!(matches!(
            writers.write("/nope", 1, b"a"),
            Err(WriterError::NotOpen(_))
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let dir = Temp::new_dir().unwrap();
        let writers = manager(&dir);
        assert!(!writers.close("/f").unwrap());

        writers.open("/f", None).unwrap();
        written(writers.write("/f", 1, b"abc").unwrap());
        assert!(writers.close("/f").unwrap());
        assert!(writers.close("/f").unwrap());
        assert_eq!(writers.open_files(), 0);
        assert_eq!(writers.sequences.get_position("/f", "disk_1"), None);

        let meta = writers.meta("/f").unwrap().unwrap();
        assert!(!meta.writing);
        assert_eq!(meta.length, 3);
    }

    #[test]
    fn rebuild_restores_open_files() {
        let dir = Temp::new_dir().unwrap();
        {
            let writers = manager(&dir);
            writers.open("/a/f", None).unwrap();
            writers.open("/b", None).unwrap();
            written(writers.write("/a/f", 1, b"12").unwrap());
            written(writers.write("/a/f", 2, b"345").unwrap());
            writers.close("/b").unwrap();
            writers.flush_all();
        }

        let writers = manager(&dir);
        assert_eq!(writers.rebuild().unwrap(), 1);
        assert!(writers.is_open("/a/f"));
        assert!(!writers.is_open("/b"));
        let info = writers.sequence_info("/a/f").unwrap().unwrap();
        assert_eq!(info, SequenceInfo { seqs: vec![1, 2], last_seq: 2, length: 5 });
    }

    #[test]
    fn sidecar_names_survive_restart() {
        let dir = Temp::new_dir().unwrap();
        {
            let writers = manager(&dir);
            assert!(matches!(
                writers.open("/x.rd", None),
                Err(WriterError::InvalidPath(_))
            ));
            writers.open("/x", None).unwrap();
            written(writers.write("/x", 1, b"payload").unwrap());
            writers.flush_all();
        }

        let writers = manager(&dir);
        assert_eq!(writers.rebuild().unwrap(), 1);
        assert!(writers.is_open("/x"));
        assert_eq!(writers.read("/x", 0, None).unwrap().unwrap(), b"payload");
        let listed = writers.list("/").unwrap().unwrap();
        let paths: Vec<_> = listed.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["/x"]);
    }

    #[test]
    fn recovered_records_fill_gaps() {
        let dir = Temp::new_dir().unwrap();
        let writers = manager(&dir);
        writers.open("/f", None).unwrap();
        written(writers.write("/f", 1, b"a").unwrap());
        written(writers.write("/f", 3, b"ccc").unwrap());

        let pulled = vec![
            RecordBytes { seq: 4, bytes: b"dddd".to_vec() },
            RecordBytes { seq: 2, bytes: b"bb".to_vec() },
            RecordBytes { seq: 1, bytes: b"a".to_vec() },
        ];
        assert_eq!(writers.recover_records("/f", pulled).unwrap(), 2);

        let info = writers.sequence_info("/f").unwrap().unwrap();
        assert_eq!(info.seqs, vec![1, 2, 3, 4]);
        assert_eq!(info.last_seq, 4);
        assert_eq!(info.length, 10);

        let pos = writers.sequences.position("/f", "disk_1");
        assert_eq!(pos.length, 10);
        let bytes = writers.records("/f", &[2, 4]).unwrap().unwrap();
        assert_eq!(bytes[0].bytes, b"bb");
        assert_eq!(bytes[1].bytes, b"dddd");
        assert_eq!(writers.read("/f", 0, None).unwrap().unwrap(), b"abbcccdddd");
    }

    #[test]
    fn recovered_replicas_hold_the_same_bytes() {
        let dir_a = Temp::new_dir().unwrap();
        let dir_b = Temp::new_dir().unwrap();
        let a = manager(&dir_a);
        let b = manager(&dir_b);
        a.open("/f", None).unwrap();
        b.open("/f", None).unwrap();
        written(a.write("/f", 1, b"a").unwrap());
        written(a.write("/f", 2, b"bb").unwrap());
        written(a.write("/f", 3, b"ccc").unwrap());
        written(b.write("/f", 1, b"a").unwrap());
        written(b.write("/f", 3, b"ccc").unwrap());

        let pulled = a.records("/f", &[2]).unwrap().unwrap();
        assert_eq!(b.recover_records("/f", pulled).unwrap(), 1);
        assert_eq!(
            a.read("/f", 0, None).unwrap(),
            b.read("/f", 0, None).unwrap()
        );
        assert_eq!(
            a.sequence_info("/f").unwrap().unwrap(),
            b.sequence_info("/f").unwrap().unwrap()
        );

        // survives a restart of b
        b.flush_all();
        drop(b);
        let b = manager(&dir_b);
        b.rebuild().unwrap();
        assert_eq!(b.read("/f", 0, None).unwrap().unwrap(), b"abbccc");
    }

    #[test]
    fn recovery_that_does_not_fit_changes_nothing() {
        let dir = Temp::new_dir().unwrap();
        let writers = manager(&dir);
        writers.open("/f", Some(4)).unwrap();
        written(writers.write("/f", 1, b"a").unwrap());
        written(writers.write("/f", 3, b"ccc").unwrap());

        let pulled = vec![RecordBytes { seq: 2, bytes: b"bb".to_vec() }];
        assert!(matches!(
            writers.recover_records("/f", pulled),
            Err(WriterError::CapacityExceeded { .. })
        ));
        assert_eq!(writers.read("/f", 0, None).unwrap().unwrap(), b"accc");
    }

    #[test]
    fn delete_respects_open_writers() {
        let dir = Temp::new_dir().unwrap();
        let writers = manager(&dir);
        writers.open("/d/f", None).unwrap();

        assert!(!writers.delete("/d/f", false).unwrap());
        assert!(!writers.delete("/d", false).unwrap());
        assert!(writers.delete("/d/f", true).unwrap());
        assert!(!writers.is_open("/d/f"));
        assert!(!writers.delete("/d/f", true).unwrap());
        assert!(writers.delete("/d", false).unwrap());
    }

    #[test]
    fn listing_hides_sidecars() {
        let dir = Temp::new_dir().unwrap();
        let writers = manager(&dir);
        writers.open("/logs/f", None).unwrap();
        written(writers.write("/logs/f", 1, b"abc").unwrap());
        writers.flush("/logs/f").unwrap();
        writers.open("/logs/sub/g", None).unwrap();

        let listed = writers.list("/logs").unwrap().unwrap();
        let paths: Vec<_> = listed.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["/logs/f", "/logs/sub"]);
        assert_eq!(listed[0].size, 3);
        assert!(listed[1].is_dir);
        assert!(writers.list("/nothing").unwrap().is_none());
    }

    #[test]
    fn partial_reads_are_clamped() {
        let dir = Temp::new_dir().unwrap();
        let writers = manager(&dir);
        writers.open("/f", None).unwrap();
        written(writers.write("/f", 1, b"0123456789").unwrap());

        assert_eq!(writers.read("/f", 3, Some(4)).unwrap().unwrap(), b"3456");
        assert_eq!(writers.read("/f", 8, Some(100)).unwrap().unwrap(), b"89");
        assert!(writers.read("/f", 20, None).unwrap().unwrap().is_empty());
        assert!(writers.read("/g", 0, None).unwrap().is_none());
    }

    #[test]
    fn copy_to_another_path() {
        let dir = Temp::new_dir().unwrap();
        let writers = manager(&dir);
        writers.open("/f", None).unwrap();
        written(writers.write("/f", 1, b"abc").unwrap());

        assert!(writers.copy("/f", "/backup/f").unwrap());
        assert_eq!(writers.read("/backup/f", 0, None).unwrap().unwrap(), b"abc");
        assert!(!writers.copy("/f", "/f").unwrap());
        assert!(!writers.copy("/missing", "/g").unwrap());
    }
}
