//! In-memory filesystem private to one execution context.
//!
//! Paths are absolute and `/`-separated. The root directory always exists.
//! Nothing here is shared: each context owns its own [`MemoryFs`], and it is
//! dropped together with the context.

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors that can occur during filesystem operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    /// File or directory not found
    #[error("file not found: {0}")]
    NotFound(String),
    /// Something already exists at the path
    #[error("file exists: {0}")]
    AlreadyExists(String),
    /// Path is not a directory
    #[error("not a directory: {0}")]
    NotADirectory(String),
    /// Path is not a file
    #[error("not a file: {0}")]
    NotAFile(String),
    /// Directory still has entries
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),
    /// Invalid path format
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// File contents are not valid UTF-8
    #[error("file is not valid UTF-8: {0}")]
    InvalidUtf8(String),
}

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Dir,
}

/// Flat map from normalized path to node.
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    nodes: BTreeMap<String, Node>,
}

impl MemoryFs {
    /// Create an empty filesystem containing only `/`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a file's raw bytes.
    pub fn read(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let path = normalize(path)?;
        match self.nodes.get(&path) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir) => Err(FsError::NotAFile(path)),
            None if path == "/" => Err(FsError::NotAFile(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    /// Read a file as UTF-8 text.
    pub fn read_to_string(&self, path: &str) -> Result<String, FsError> {
        let data = self.read(path)?;
        String::from_utf8(data).map_err(|_| FsError::InvalidUtf8(path.to_string()))
    }

    /// Create or replace a file. The parent directory must exist.
    pub fn write(&mut self, path: &str, data: impl Into<Vec<u8>>) -> Result<(), FsError> {
        let path = normalize(path)?;
        if path == "/" {
            return Err(FsError::NotAFile(path));
        }
        self.require_parent(&path)?;
        if let Some(Node::Dir) = self.nodes.get(&path) {
            return Err(FsError::NotAFile(path));
        }
        self.nodes.insert(path, Node::File(data.into()));
        Ok(())
    }

    /// Create a directory. The parent must exist and the path must be free.
    pub fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        let path = normalize(path)?;
        if path == "/" || self.nodes.contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        self.require_parent(&path)?;
        self.nodes.insert(path, Node::Dir);
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<(), FsError> {
        let path = normalize(path)?;
        if path == "/" {
            return Err(FsError::InvalidPath(path));
        }
        match self.nodes.get(&path) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => return Err(FsError::NotADirectory(path)),
            None => return Err(FsError::NotFound(path)),
        }
        if self.children(&path).next().is_some() {
            return Err(FsError::DirectoryNotEmpty(path));
        }
        self.nodes.remove(&path);
        Ok(())
    }

    /// Remove a file.
    pub fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        let path = normalize(path)?;
        match self.nodes.get(&path) {
            Some(Node::File(_)) => {
                self.nodes.remove(&path);
                Ok(())
            }
            Some(Node::Dir) => Err(FsError::NotAFile(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    /// Whether anything exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        match normalize(path) {
            Ok(path) => path == "/" || self.nodes.contains_key(&path),
            Err(_) => false,
        }
    }

    /// Whether `path` is a directory.
    pub fn is_dir(&self, path: &str) -> bool {
        match normalize(path) {
            Ok(path) => path == "/" || matches!(self.nodes.get(&path), Some(Node::Dir)),
            Err(_) => false,
        }
    }

    /// Names of the direct children of a directory, sorted.
    pub fn read_dir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let path = normalize(path)?;
        if !self.is_dir(&path) {
            return match self.nodes.get(&path) {
                Some(_) => Err(FsError::NotADirectory(path)),
                None => Err(FsError::NotFound(path)),
            };
        }
        let start = prefix_len(&path);
        Ok(self
            .children(&path)
            .map(|child| child[start..].to_string())
            .collect())
    }

    fn children<'a>(&'a self, dir: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .map(|(k, _)| k)
            .take_while(move |k| k.starts_with(&prefix))
            .filter(move |k| !k[prefix_len(dir)..].contains('/'))
    }

    fn require_parent(&self, path: &str) -> Result<(), FsError> {
        let parent = parent_of(path);
        if parent == "/" {
            return Ok(());
        }
        match self.nodes.get(parent) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => Err(FsError::NotADirectory(parent.to_string())),
            None => Err(FsError::NotFound(parent.to_string())),
        }
    }
}

fn prefix_len(dir: &str) -> usize {
    if dir == "/" { 1 } else { dir.len() + 1 }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Collapse `.`, `..` and repeated separators. Rejects relative paths and NUL.
fn normalize(path: &str) -> Result<String, FsError> {
    if !path.starts_with('/') || path.contains('\0') {
        return Err(FsError::InvalidPath(path.to_string()));
    }
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let mut fs = MemoryFs::new();
        fs.write("/a.txt", "hello").unwrap();
        assert_eq!(fs.read_to_string("/a.txt").unwrap(), "hello");
    }

    #[test]
    fn test_write_replaces_contents() {
        let mut fs = MemoryFs::new();
        fs.write("/a.txt", "one").unwrap();
        fs.write("/a.txt", "two").unwrap();
        assert_eq!(fs.read_to_string("/a.txt").unwrap(), "two");
    }

    #[test]
    fn test_write_requires_parent() {
        let mut fs = MemoryFs::new();
        assert_eq!(
            fs.write("/missing/a.txt", "x"),
            Err(FsError::NotFound("/missing".to_string()))
        );

        fs.mkdir("/missing").unwrap();
        fs.write("/missing/a.txt", "x").unwrap();
        assert!(fs.exists("/missing/a.txt"));
    }

    #[test]
    fn test_read_missing_file() {
        let fs = MemoryFs::new();
        assert_eq!(
            fs.read("/nope"),
            Err(FsError::NotFound("/nope".to_string()))
        );
    }

    #[test]
    fn test_read_directory_is_not_a_file() {
        let mut fs = MemoryFs::new();
        fs.mkdir("/dir").unwrap();
        assert_eq!(fs.read("/dir"), Err(FsError::NotAFile("/dir".to_string())));
    }

    #[test]
    fn test_mkdir_existing_fails() {
        let mut fs = MemoryFs::new();
        fs.mkdir("/dir").unwrap();
        assert_eq!(
            fs.mkdir("/dir"),
            Err(FsError::AlreadyExists("/dir".to_string()))
        );
        assert_eq!(fs.mkdir("/"), Err(FsError::AlreadyExists("/".to_string())));
    }

    #[test]
    fn test_rmdir_requires_empty() {
        let mut fs = MemoryFs::new();
        fs.mkdir("/dir").unwrap();
        fs.write("/dir/file", "x").unwrap();

        assert_eq!(
            fs.rmdir("/dir"),
            Err(FsError::DirectoryNotEmpty("/dir".to_string()))
        );

        fs.unlink("/dir/file").unwrap();
        fs.rmdir("/dir").unwrap();
        assert!(!fs.exists("/dir"));
    }

    #[test]
    fn test_rmdir_on_file() {
        let mut fs = MemoryFs::new();
        fs.write("/file", "x").unwrap();
        assert_eq!(
            fs.rmdir("/file"),
            Err(FsError::NotADirectory("/file".to_string()))
        );
    }

    #[test]
    fn test_sibling_prefix_is_not_a_child() {
        let mut fs = MemoryFs::new();
        fs.mkdir("/dir").unwrap();
        fs.write("/dir2", "x").unwrap();
        fs.write("/dir-file", "x").unwrap();

        fs.rmdir("/dir").unwrap();
    }

    #[test]
    fn test_read_dir_lists_direct_children() {
        let mut fs = MemoryFs::new();
        fs.mkdir("/pkg").unwrap();
        fs.mkdir("/pkg/sub").unwrap();
        fs.write("/pkg/a.py", "").unwrap();
        fs.write("/pkg/sub/b.py", "").unwrap();
        fs.write("/top.py", "").unwrap();

        assert_eq!(fs.read_dir("/pkg").unwrap(), vec!["a.py", "sub"]);
        assert_eq!(fs.read_dir("/").unwrap(), vec!["pkg", "top.py"]);
    }

    #[test]
    fn test_normalize_paths() {
        assert_eq!(normalize("/a//b/./c/../d").unwrap(), "/a/b/d");
        assert_eq!(normalize("/..").unwrap(), "/");
        assert!(normalize("relative").is_err());
        assert!(normalize("/nul\0byte").is_err());
    }
}
