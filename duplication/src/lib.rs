//! Keeps track of which logical files exist, where their replicas live and
//! brings those replicas to a consistent, closed state once a file is done.

mod closer;
mod coordinator;
pub mod db;
mod ids;
mod limiter;
mod path;
mod sync;

pub use closer::{CloseEvent, CloseState, FileLimiterCloser};
pub use coordinator::{FileCoordinator, FileNode};
pub use db::{DbError, TypedSled};
pub use ids::ServerIdManager;
pub use limiter::FileLimiter;
pub use path::FilePathBuilder;
pub use sync::{
    plan_recovery, synchronize_with, FileSynchronizer, ReplicaSeqs, SyncError, SyncOutcome,
    Synchronize,
};
