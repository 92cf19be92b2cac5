use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::Seq;
use tracing::debug;

/// How far a replica got writing a file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    pub seq: Seq,
    pub length: u64,
}

/// Last acknowledged sequence number and byte length per (file, replica).
///
/// Lives only as long as the writers do, after a restart it is filled again
/// by rebuilding the writers from disk.
#[derive(Debug, Default)]
pub struct SequenceCache {
    positions: DashMap<(String, String), Position>,
}

impl SequenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a write. Returns false and leaves the cache as is if `seq`
    /// is not ahead of what was recorded before.
    pub fn record_write(&self, file: &str, replica: &str, seq: Seq, length: u64) -> bool {
        match self.positions.entry(key(file, replica)) {
            Entry::Vacant(entry) => {
                entry.insert(Position { seq, length });
                true
            }
            Entry::Occupied(mut entry) => {
                let pos = entry.get_mut();
                if seq <= pos.seq {
                    debug!("ignoring seq {seq} for {file}, already at {}", pos.seq);
                    return false;
                }
                *pos = Position { seq, length };
                true
            }
        }
    }

    /// Record bytes that landed without moving the sequence number, for
    /// example an older record pulled in during recovery.
    pub fn grow_length(&self, file: &str, replica: &str, length: u64) {
        let mut pos = self.positions.entry(key(file, replica)).or_default();
        pos.length = pos.length.max(length);
    }

    pub fn get_position(&self, file: &str, replica: &str) -> Option<Position> {
        self.positions.get(&key(file, replica)).map(|pos| *pos)
    }

    /// Like [`get_position`](Self::get_position) with absent read as zero
    pub fn position(&self, file: &str, replica: &str) -> Position {
        self.get_position(file, replica).unwrap_or_default()
    }

    /// forget every replica of `file`
    pub fn remove_file(&self, file: &str) {
        self.positions.retain(|(f, _), _| f != file);
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

fn key(file: &str, replica: &str) -> (String, String) {
    (file.to_owned(), replica.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_is_zero() {
        let cache = SequenceCache::new();
        assert_eq!(cache.get_position("/f", "a"), None);
        assert_eq!(cache.position("/f", "a"), Position::default());
    }

    #[test]
    fn sequence_never_regresses() {
        let cache = SequenceCache::new();
        assert!(cache.record_write("/f", "a", 7, 70));
        assert!(!cache.record_write("/f", "a", 5, 120));
        assert!(!cache.record_write("/f", "a", 7, 120));
        assert_eq!(cache.position("/f", "a"), Position { seq: 7, length: 70 });

        assert!(cache.record_write("/f", "a", 8, 80));
        assert_eq!(cache.position("/f", "a").seq, 8);
    }

    #[test]
    fn replicas_are_tracked_apart() {
        let cache = SequenceCache::new();
        cache.record_write("/f", "a", 3, 30);
        cache.record_write("/f", "b", 1, 10);
        cache.record_write("/g", "a", 9, 90);
        assert_eq!(cache.position("/f", "b").seq, 1);

        cache.remove_file("/f");
        assert_eq!(cache.get_position("/f", "a"), None);
        assert_eq!(cache.get_position("/f", "b"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn growing_keeps_the_sequence() {
        let cache = SequenceCache::new();
        cache.record_write("/f", "a", 4, 40);
        cache.grow_length("/f", "a", 55);
        cache.grow_length("/f", "a", 50);
        assert_eq!(cache.position("/f", "a"), Position { seq: 4, length: 55 });
    }
}
