use core::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod connection;
mod route;

pub use route::{Method, Route};

pub type RequestId = u64;
/// per file, per replica write order
pub type Seq = u64;

/// Replicas in this group are placeholders, nothing is ever written to them
pub const VIRTUAL_SERVICE_GROUP: &str = "virtual_group";

/// Encoding used for every request and response body
pub trait Payload: Serialize + DeserializeOwned {
    fn to_body(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }
    fn from_body(buf: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(buf)
    }
}

/// One physical copy of a logical file, identified by the disk node
/// service hosting it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DuplicateNode {
    pub group: String,
    pub id: String,
}

impl DuplicateNode {
    pub fn new(group: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            id: id.into(),
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.group == VIRTUAL_SERVICE_GROUP
    }
}

impl fmt::Display for DuplicateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub offset: Option<u64>,
    pub size: Option<u64>,
    pub seq: Option<Seq>,
    pub capacity: Option<u64>,
    /// delete files that are still being written and whole directories
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// set by the client connection, echoed in the response
    pub id: RequestId,
    pub method: Method,
    pub route: Route,
    pub path: String,
    pub query: Query,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, route: Route, path: impl Into<String>) -> Self {
        Self {
            id: 0,
            method,
            route,
            path: path.into(),
            query: Query::default(),
            body: Vec::new(),
        }
    }

    pub fn with_query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn uri(&self) -> String {
        format!("{}{}", self.route.root(), self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    BadRequest,
    NotFound,
    /// the request collides with the current file state, for example a
    /// write whose sequence number is not ahead of the replica
    Conflict,
    InternalError,
    NotImplemented,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Ok
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub status: Status,
    pub body: Vec<u8>,
}

impl Response {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            id: 0,
            status: Status::Ok,
            body,
        }
    }

    pub fn empty(status: Status) -> Self {
        Self {
            id: 0,
            status,
            body: Vec::new(),
        }
    }

    /// success/failure answer, always carries `Status::Ok`
    pub fn flag(value: bool) -> Self {
        // bincode encodes a bool as a single 0 or 1 byte
        Self::ok(vec![u8::from(value)])
    }

    pub fn error(status: Status, msg: impl fmt::Display) -> Self {
        Self {
            id: 0,
            status,
            body: msg.to_string().into_bytes(),
        }
    }

    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self
    }

    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Where a write landed on a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub seq: Seq,
    pub offset: u64,
    pub size: u64,
}

/// Sequence numbers a replica holds for a file being written
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceInfo {
    /// ascending
    pub seqs: Vec<Seq>,
    /// highest sequence number acknowledged, zero if nothing was written
    pub last_seq: Seq,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordBytes {
    pub seq: Seq,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub path: String,
    pub length: u64,
    pub last_seq: Option<Seq>,
    pub records: usize,
    /// a writer is still open for the file
    pub writing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// A peer replica to pull missing records from, `path` is the file path
/// on that peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverSource {
    pub node: DuplicateNode,
    pub path: String,
}

/// Sent to a lagging replica: the full set of sequence numbers it should
/// end up with and the peers that hold them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverPlan {
    pub seqs: Vec<Seq>,
    pub sources: Vec<RecoverSource>,
}

impl Payload for bool {}
impl Payload for String {}
impl Payload for WriteResult {}
impl Payload for SequenceInfo {}
impl Payload for FileMeta {}
impl Payload for RecoverPlan {}
impl Payload for Vec<Seq> {}
impl Payload for Vec<RecordBytes> {}
impl Payload for Vec<FileInfo> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_decodes_as_bool() {
        assert!(bool::from_body(&Response::flag(true).body).unwrap());
        assert!(!bool::from_body(&Response::flag(false).body).unwrap());
    }

    #[test]
    fn virtual_group() {
        assert!(DuplicateNode::new(VIRTUAL_SERVICE_GROUP, "3").is_virtual());
        assert!(!DuplicateNode::new("disk_group", "3").is_virtual());
    }

    #[test]
    fn uri_joins_route_and_path() {
        let req = Request::new(Method::Close, Route::DiskNode, "/logs/1/f");
        assert_eq!(req.uri(), "/disk/logs/1/f");
    }
}
