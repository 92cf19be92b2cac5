use std::path::{Component, Path, PathBuf};

use crate::writer::SIDECAR_EXT;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("not a valid logical path: {0}")]
pub struct InvalidPath(pub String);

/// Maps the logical paths clients use onto files below the data root
#[derive(Debug, Clone)]
pub struct DiskContext {
    root: PathBuf,
}

impl DiskContext {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical form of a logical path: a leading slash, no empty or `.`
    /// segments. Refuses `..` so nothing outside the root is reachable, and
    /// names with the record sidecar extension, those belong to the node.
    pub fn normalize(&self, logical: &str) -> Result<String, InvalidPath> {
        let mut normalized = String::with_capacity(logical.len() + 1);
        for segment in logical.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(InvalidPath(logical.to_owned())),
                segment if is_reserved(segment) => return Err(InvalidPath(logical.to_owned())),
                segment => {
                    normalized.push('/');
                    normalized.push_str(segment);
                }
            }
        }
        if normalized.is_empty() {
            normalized.push('/');
        }
        Ok(normalized)
    }

    pub fn concrete_path(&self, logical: &str) -> Result<PathBuf, InvalidPath> {
        let normalized = self.normalize(logical)?;
        Ok(self.root.join(normalized.trim_start_matches('/')))
    }

    /// inverse of [`concrete_path`](Self::concrete_path), None if `concrete`
    /// is not below the root
    pub fn logical_path(&self, concrete: &Path) -> Option<String> {
        let relative = concrete.strip_prefix(&self.root).ok()?;
        let mut logical = String::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    logical.push('/');
                    logical.push_str(&part.to_string_lossy());
                }
                _ => return None,
            }
        }
        if logical.is_empty() {
            logical.push('/');
        }
        Some(logical)
    }
}

fn is_reserved(segment: &str) -> bool {
    Path::new(segment)
        .extension()
        .map_or(false, |ext| ext == SIDECAR_EXT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_slashes() {
        let ctx = DiskContext::new("/data");
        assert_eq!(ctx.normalize("logs//1/./f").unwrap(), "/logs/1/f");
        assert_eq!(ctx.normalize("").unwrap(), "/");
        assert_eq!(ctx.normalize("/").unwrap(), "/");
    }

    #[test]
    fn parent_segments_are_refused() {
        let ctx = DiskContext::new("/data");
        assert!(ctx.concrete_path("/logs/../../etc/passwd").is_err());
    }

    #[test]
    fn sidecar_names_are_reserved() {
        let ctx = DiskContext::new("/data");
        assert!(ctx.normalize("/logs/x.rd").is_err());
        assert!(ctx.normalize("/logs/x.rd/f").is_err());
        assert_eq!(ctx.normalize("/logs/x.rdb").unwrap(), "/logs/x.rdb");
        assert_eq!(ctx.normalize("/logs/.rd").unwrap(), "/logs/.rd");
    }

    #[test]
    fn concrete_and_back() {
        let ctx = DiskContext::new("/data");
        let concrete = ctx.concrete_path("/logs/1/f").unwrap();
        assert_eq!(concrete, PathBuf::from("/data/logs/1/f"));
        assert_eq!(ctx.logical_path(&concrete).unwrap(), "/logs/1/f");
        assert_eq!(ctx.logical_path(Path::new("/elsewhere/f")), None);
    }
}
