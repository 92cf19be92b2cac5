use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use protocol::{RecordBytes, Seq};
use tracing::{debug, warn};

use crate::context::InvalidPath;

mod manager;
mod record;

pub use manager::{FileWriterManager, WriteOutcome};
pub use record::{Record, SIDECAR_EXT};
use record::{sidecar, RECORD_LEN};

#[derive(thiserror::Error, Debug)]
pub enum WriterError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    InvalidPath(#[from] InvalidPath),
    #[error("data root does not exist: {0:?}")]
    RootMissing(PathBuf),
    #[error("file is not open for writing: {0}")]
    NotOpen(String),
    #[error("file is already closed: {0:?}")]
    AlreadyClosed(PathBuf),
    #[error("file would grow to {length} bytes, its capacity is {capacity}")]
    CapacityExceeded { capacity: u64, length: u64 },
    #[error("could not encode record: {0}")]
    Record(#[from] bincode::Error),
}

/// Appends writes to a data file and notes where each one landed in a
/// sidecar index. The sidecar lives as long as the file is open, a data
/// file without one is closed for good.
#[derive(Debug)]
pub struct RecordFileWriter {
    path: PathBuf,
    data: BufWriter<File>,
    index: BufWriter<File>,
    records: BTreeMap<Seq, Record>,
    length: u64,
    capacity: Option<u64>,
    dirty: bool,
    closed: bool,
}

impl RecordFileWriter {
    /// Start a new file at `path`, or pick up where a previous writer left
    /// off if the file was never closed.
    pub fn create(path: &Path, capacity: Option<u64>) -> Result<Self, WriterError> {
        let index_path = sidecar(path);
        if path.exists() {
            if index_path.exists() {
                return Self::reopen(path, capacity);
            }
            return Err(WriterError::AlreadyClosed(path.to_owned()));
        }

        let data = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path)?;
        let index = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&index_path)?;
        debug!("created {path:?}");

        Ok(Self {
            path: path.to_owned(),
            data: BufWriter::new(data),
            index: BufWriter::new(index),
            records: BTreeMap::new(),
            length: 0,
            capacity,
            dirty: false,
            closed: false,
        })
    }

    /// Open a file that still has a sidecar, dropping whatever was written
    /// after the last complete record.
    pub fn reopen(path: &Path, capacity: Option<u64>) -> Result<Self, WriterError> {
        let index_path = sidecar(path);
        let data_len = fs::metadata(path)?.len();
        let records = record::read_records(&index_path, data_len)?;
        let length = records.last().map_or(0, Record::end);

        let data = OpenOptions::new().append(true).open(path)?;
        if length < data_len {
            warn!("dropping {} unindexed bytes from {path:?}", data_len - length);
            data.set_len(length)?;
        }
        let index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index_path)?;
        index.set_len((records.len() * RECORD_LEN) as u64)?;

        Ok(Self {
            path: path.to_owned(),
            data: BufWriter::new(data),
            index: BufWriter::new(index),
            records: records.into_iter().map(|r| (r.seq, r)).collect(),
            length,
            capacity,
            dirty: false,
            closed: false,
        })
    }

    pub fn append(&mut self, seq: Seq, bytes: &[u8]) -> Result<Record, WriterError> {
        if self.closed {
            return Err(WriterError::AlreadyClosed(self.path.clone()));
        }
        let size = bytes.len() as u64;
        self.check_capacity(size)?;

        let record = Record {
            seq,
            offset: self.length,
            size,
        };
        self.data.write_all(bytes)?;
        self.index.write_all(&record.to_bytes()?)?;
        self.records.insert(seq, record);
        self.length += size;
        self.dirty = true;
        Ok(record)
    }

    pub fn check_capacity(&self, extra: u64) -> Result<(), WriterError> {
        match self.capacity {
            Some(capacity) if self.length + extra > capacity => Err(WriterError::CapacityExceeded {
                capacity,
                length: self.length + extra,
            }),
            _ => Ok(()),
        }
    }

    /// Remove the records from `seq` on, returning their bytes in seq
    /// order. The data file and sidecar are cut back to the first of them,
    /// so appending afterwards keeps the file ordered by seq.
    pub fn split_off(&mut self, seq: Seq) -> Result<Vec<RecordBytes>, WriterError> {
        if self.closed {
            return Err(WriterError::AlreadyClosed(self.path.clone()));
        }
        let tail: Vec<Seq> = self.records.range(seq..).map(|(seq, _)| *seq).collect();
        let Some(first) = tail.first().and_then(|seq| self.records.get(seq)).copied() else {
            return Ok(Vec::new());
        };

        let removed = self.read_records(&tail)?;
        self.records.split_off(&seq);
        self.data.get_ref().set_len(first.offset)?;
        let index_len = (self.records.len() * RECORD_LEN) as u64;
        self.index.get_ref().set_len(index_len)?;
        self.index.seek(SeekFrom::Start(index_len))?;
        self.length = first.offset;
        self.dirty = true;
        Ok(removed)
    }

    /// hand buffered bytes to the os so other handles can read them
    pub fn flush_buffers(&mut self) -> Result<(), WriterError> {
        // data before index, a record may never point past the data
        self.data.flush()?;
        self.index.flush()?;
        Ok(())
    }

    /// force everything written so far onto stable storage
    pub fn flush(&mut self) -> Result<(), WriterError> {
        self.data.flush()?;
        self.data.get_ref().sync_data()?;
        self.index.flush()?;
        self.index.get_ref().sync_data()?;
        self.dirty = false;
        Ok(())
    }

    /// Flush and finalize the file, returns its length. The sidecar is
    /// removed last so a crash halfway leaves a file that can be reopened.
    pub fn close(&mut self) -> Result<u64, WriterError> {
        if self.closed {
            return Ok(self.length);
        }
        self.flush()?;
        self.data.get_ref().sync_all()?;
        remove_if_exists(&sidecar(&self.path))?;
        self.closed = true;
        Ok(self.length)
    }

    /// stop writing without finalizing, the caller removes the files
    pub fn abandon(&mut self) {
        self.closed = true;
    }

    /// bytes of the requested records, seqs this file does not hold are
    /// skipped
    pub fn read_records(&mut self, seqs: &[Seq]) -> Result<Vec<RecordBytes>, WriterError> {
        self.flush_buffers()?;
        let mut file = File::open(&self.path)?;
        let mut found = Vec::with_capacity(seqs.len());
        for seq in seqs {
            let Some(record) = self.records.get(seq) else {
                continue;
            };
            let mut bytes = vec![0; record.size as usize];
            file.seek(SeekFrom::Start(record.offset))?;
            file.read_exact(&mut bytes)?;
            found.push(RecordBytes { seq: *seq, bytes });
        }
        Ok(found)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn last_seq(&self) -> Option<Seq> {
        self.records.keys().next_back().copied()
    }

    /// ascending
    pub fn seqs(&self) -> Vec<Seq> {
        self.records.keys().copied().collect()
    }

    pub fn contains(&self, seq: Seq) -> bool {
        self.records.contains_key(&seq)
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        res => res,
    }
}

#[cfg(test)]
mod tests {
    use mktemp::Temp;

    use super::*;

    #[test]
    fn append_then_read_back() {
        let dir = Temp::new_dir().unwrap();
        let path = dir.join("f");
        let mut writer = RecordFileWriter::create(&path, None).unwrap();
        writer.append(1, b"hello ").unwrap();
        let second = writer.append(2, b"world").unwrap();
        assert_eq!(second, Record { seq: 2, offset: 6, size: 5 });
        assert_eq!(writer.length(), 11);
        assert!(writer.is_dirty());

        let read = writer.read_records(&[2, 9]).unwrap();
        assert_eq!(read, vec![RecordBytes { seq: 2, bytes: b"world".to_vec() }]);
    }

    #[test]
    fn close_removes_the_sidecar() {
        let dir = Temp::new_dir().unwrap();
        let path = dir.join("f");
        let mut writer = RecordFileWriter::create(&path, None).unwrap();
        writer.append(1, b"abc").unwrap();
        assert_eq!(writer.close().unwrap(), 3);
        assert!(!sidecar(&path).exists());
        assert_eq!(fs::read(&path).unwrap(), b"abc");

        assert!(matches!(writer.append(2, b"d"), Err(WriterError::AlreadyClosed(_))));
        assert!(matches!(
            RecordFileWriter::create(&path, None),
            Err(WriterError::AlreadyClosed(_))
        ));
    }

    #[test]
    fn reopen_truncates_unindexed_bytes() {
        let dir = Temp::new_dir().unwrap();
        let path = dir.join("f");
        {
            let mut writer = RecordFileWriter::create(&path, None).unwrap();
            writer.append(1, b"abc").unwrap();
            writer.append(4, b"de").unwrap();
            writer.flush().unwrap();
        }
        // bytes whose record never got written
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"torn").unwrap();
        drop(file);

        let mut writer = RecordFileWriter::create(&path, None).unwrap();
        assert_eq!(writer.length(), 5);
        assert_eq!(writer.seqs(), vec![1, 4]);
        assert_eq!(fs::metadata(&path).unwrap().len(), 5);

        writer.append(5, b"f").unwrap();
        writer.close().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abcdef");
    }

    #[test]
    fn split_off_cuts_back_the_tail() {
        let dir = Temp::new_dir().unwrap();
        let path = dir.join("f");
        let mut writer = RecordFileWriter::create(&path, None).unwrap();
        writer.append(1, b"a").unwrap();
        writer.append(3, b"ccc").unwrap();
        writer.append(5, b"eeeee").unwrap();

        let tail = writer.split_off(2).unwrap();
        let seqs: Vec<_> = tail.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![3, 5]);
        assert_eq!(tail[0].bytes, b"ccc");
        assert_eq!(writer.length(), 1);
        assert_eq!(writer.seqs(), vec![1]);
        assert!(writer.split_off(9).unwrap().is_empty());

        writer.append(2, b"bb").unwrap();
        writer.append(3, b"ccc").unwrap();
        writer.flush().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abbccc");
        drop(writer);

        // the sidecar was cut back too
        let writer = RecordFileWriter::reopen(&path, None).unwrap();
        assert_eq!(writer.seqs(), vec![1, 2, 3]);
        assert_eq!(writer.length(), 6);
    }

    #[test]
    fn capacity_is_enforced() {
        let dir = Temp::new_dir().unwrap();
        let mut writer = RecordFileWriter::create(&dir.join("f"), Some(4)).unwrap();
        writer.append(1, b"abc").unwrap();
        assert!(matches!(
            writer.append(2, b"de"),
            Err(WriterError::CapacityExceeded { capacity: 4, length: 5 })
        ));
        assert_eq!(writer.length(), 3);
    }
}
