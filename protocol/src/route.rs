use core::fmt;

use serde::{Deserialize, Serialize};

/// Verbs understood by a disk node. `Close` is not an http verb, it
/// finalizes a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
    Close,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Close => "CLOSE",
        };
        f.write_str(name)
    }
}

/// Context roots a disk node serves, every request path hangs below one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Route {
    DiskNode,
    Flush,
    Sequence,
    SequenceBytes,
    Meta,
    Copy,
    List,
    Recover,
    Ping,
}

impl Route {
    pub const ALL: [Route; 9] = [
        Route::DiskNode,
        Route::Flush,
        Route::Sequence,
        Route::SequenceBytes,
        Route::Meta,
        Route::Copy,
        Route::List,
        Route::Recover,
        Route::Ping,
    ];

    pub const fn root(&self) -> &'static str {
        match self {
            Route::DiskNode => "/disk",
            Route::Flush => "/flush",
            Route::Sequence => "/seq",
            Route::SequenceBytes => "/bytes",
            Route::Meta => "/meta",
            Route::Copy => "/copy",
            Route::List => "/list",
            Route::Recover => "/recover",
            Route::Ping => "/ping",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn roots_are_unique() {
        let roots: HashSet<_> = Route::ALL.iter().map(Route::root).collect();
        assert_eq!(roots.len(), Route::ALL.len());
    }

    #[test]
    fn close_is_its_own_verb() {
        assert_eq!(Method::Close.to_string(), "CLOSE");
    }
}
