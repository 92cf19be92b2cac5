use std::time::{Duration, Instant};

use crate::coordinator::FileNode;

/// Tracks a file being written until it should be closed, which is when
/// it is full or has not been written to for a while.
#[derive(Debug, Clone)]
pub struct FileLimiter {
    node: FileNode,
    last_write: Instant,
    idle_timeout: Duration,
}

impl FileLimiter {
    pub fn new(node: FileNode, idle_timeout: Duration) -> Self {
        Self {
            node,
            last_write: Instant::now(),
            idle_timeout,
        }
    }

    pub fn file_node(&self) -> &FileNode {
        &self.node
    }

    pub fn into_file_node(self) -> FileNode {
        self.node
    }

    pub fn remaining(&self) -> u64 {
        self.node.capacity.saturating_sub(self.node.length)
    }

    /// Account for a write of `size` bytes at `now`. Returns false, and
    /// changes nothing, if the write does not fit.
    pub fn apply_write(&mut self, size: u64, now: Instant) -> bool {
        if size > self.remaining() {
            return false;
        }
        self.node.length += size;
        self.last_write = now;
        true
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_write) >= self.idle_timeout
    }

    pub fn ready_to_close(&self, now: Instant) -> bool {
        self.is_full() || self.is_idle(now)
    }
}

#[cfg(test)]
mod tests {
    use protocol::DuplicateNode;

    use super::*;

    fn limiter(capacity: u64) -> FileLimiter {
        let node = FileNode::new("f", 1, "logs", "dup_1", capacity, vec![DuplicateNode::new("g", "1")]);
        FileLimiter::new(node, Duration::from_secs(10))
    }

    #[test]
    fn fills_up() {
        let mut limiter = limiter(10);
        let now = Instant::now();
        assert!(limiter.apply_write(6, now));
        assert!(!limiter.apply_write(5, now));
        assert_eq!(limiter.remaining(), 4);
        assert!(!limiter.ready_to_close(now));

        assert!(limiter.apply_write(4, now));
        assert!(limiter.is_full());
        assert!(limiter.ready_to_close(now));
        assert_eq!(limiter.into_file_node().length, 10);
    }

    #[test]
    fn goes_idle() {
        let mut limiter = limiter(100);
        let start = Instant::now();
        limiter.apply_write(1, start);
        assert!(!limiter.is_idle(start + Duration::from_secs(9)));
        assert!(limiter.is_idle(start + Duration::from_secs(10)));
        // a write resets the clock
        limiter.apply_write(1, start + Duration::from_secs(9));
        assert!(!limiter.ready_to_close(start + Duration::from_secs(10)));
    }
}
