use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use protocol::Seq;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Size of one encoded [`Record`], bincode writes each u64 as 8 bytes
pub const RECORD_LEN: usize = 24;
pub const SIDECAR_EXT: &str = "rd";

/// Where the bytes of one write ended up in the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub seq: Seq,
    pub offset: u64,
    pub size: u64,
}

impl Record {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(buf)
    }
}

/// the record index kept next to a data file while it is being written
pub fn sidecar(data: &Path) -> PathBuf {
    let mut name = OsString::from(data.as_os_str());
    name.push(".");
    name.push(SIDECAR_EXT);
    PathBuf::from(name)
}

pub fn is_sidecar(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == SIDECAR_EXT)
}

/// the data file a sidecar belongs to
pub fn data_file(sidecar: &Path) -> PathBuf {
    sidecar.with_extension("")
}

/// Reads the records in `sidecar` that are fully backed by a data file of
/// `data_len` bytes. Stops at the first torn or dangling record, anything
/// after it was never acknowledged.
pub fn read_records(sidecar: &Path, data_len: u64) -> io::Result<Vec<Record>> {
    let buf = match fs::read(sidecar) {
        Ok(buf) => buf,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut records = Vec::with_capacity(buf.len() / RECORD_LEN);
    let mut expected_offset = 0;
    for chunk in buf.chunks_exact(RECORD_LEN) {
        let record = match Record::from_bytes(chunk) {
            Ok(record) => record,
            Err(e) => {
                warn!("undecodable record in {sidecar:?}: {e}");
                break;
            }
        };
        if record.offset != expected_offset || record.end() > data_len {
            break;
        }
        expected_offset = record.end();
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use mktemp::Temp;

    use super::*;

    fn record(seq: Seq, offset: u64, size: u64) -> Record {
        Record { seq, offset, size }
    }

    #[test]
    fn encoded_length_is_fixed() {
        let bytes = record(u64::MAX, 12, 0).to_bytes().unwrap();
        assert_eq!(bytes.len(), RECORD_LEN);
        assert_eq!(Record::from_bytes(&bytes).unwrap(), record(u64::MAX, 12, 0));
    }

    #[test]
    fn sidecar_naming() {
        let data = Path::new("/data/logs/f.log");
        let side = sidecar(data);
        assert_eq!(side, PathBuf::from("/data/logs/f.log.rd"));
        assert!(is_sidecar(&side));
        assert!(!is_sidecar(data));
        assert_eq!(data_file(&side), data);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = Temp::new_dir().unwrap();
        let path = dir.join("f.rd");
        let mut file = fs::File::create(&path).unwrap();
        for r in [record(1, 0, 10), record(2, 10, 5), record(3, 15, 20)] {
            file.write_all(&r.to_bytes().unwrap()).unwrap();
        }
        // half a record
        file.write_all(&[7; RECORD_LEN / 2]).unwrap();
        drop(file);

        // data for the third record never made it to disk
        let records = read_records(&path, 20).unwrap();
        assert_eq!(records, vec![record(1, 0, 10), record(2, 10, 5)]);
    }

    #[test]
    fn missing_sidecar_has_no_records() {
        let dir = Temp::new_dir().unwrap();
        assert!(read_records(&dir.join("none.rd"), 0).unwrap().is_empty());
    }
}
