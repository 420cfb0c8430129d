use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{IndexError, Result};

/// Async filesystem access used by imports and rescans.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn path_exists(&self, path: &Path) -> bool;

    /// Open a directory for iteration.
    async fn read_dir(&self, path: &Path) -> Result<Box<dyn ReadDirStream + Send>>;

    async fn metadata(&self, path: &Path) -> Result<FsMetadata>;
}

#[derive(Debug, Clone, Copy)]
pub struct FsMetadata {
    pub is_dir: bool,
    pub is_file: bool,
    pub len: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ReadDirStream {
    /// Next entry's path, or `None` when exhausted.
    async fn next_entry(&mut self) -> Result<Option<PathBuf>>;
}

/// Collect a whole directory listing.
pub async fn list_dir(fs: &dyn FileSystem, path: &Path) -> Result<Vec<PathBuf>> {
    let mut stream = fs.read_dir(path).await?;
    let mut entries = Vec::new();
    while let Some(entry) = stream.next_entry().await? {
        entries.push(entry);
    }
    entries.sort();
    Ok(entries)
}

/// Dot-files and dot-directories.
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

fn with_path(err: io::Error, op: &str, path: &Path) -> IndexError {
    IndexError::Io(io::Error::new(
        err.kind(),
        format!("{op} failed for {}: {err}", path.display()),
    ))
}

/// Filesystem backed by `tokio::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for RealFs {
    async fn path_exists(&self, path: &Path) -> bool {
        // Permission problems count as absent.
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn read_dir(&self, path: &Path) -> Result<Box<dyn ReadDirStream + Send>> {
        let inner = tokio::fs::read_dir(path)
            .await
            .map_err(|err| with_path(err, "read_dir", path))?;
        Ok(Box::new(RealReadDir { inner }))
    }

    async fn metadata(&self, path: &Path) -> Result<FsMetadata> {
        let md = tokio::fs::metadata(path)
            .await
            .map_err(|err| with_path(err, "metadata", path))?;
        Ok(FsMetadata {
            is_dir: md.is_dir(),
            is_file: md.is_file(),
            len: md.len(),
            modified: md.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

struct RealReadDir {
    inner: tokio::fs::ReadDir,
}

#[async_trait]
impl ReadDirStream for RealReadDir {
    async fn next_entry(&mut self) -> Result<Option<PathBuf>> {
        Ok(self.inner.next_entry().await?.map(|entry| entry.path()))
    }
}

#[derive(Clone, Debug)]
enum Node {
    Dir {
        children: Vec<PathBuf>,
        modified: Option<DateTime<Utc>>,
    },
    File {
        len: u64,
        modified: Option<DateTime<Utc>>,
    },
}

/// In-memory filesystem for tests. Paths are taken literally.
///
/// Mutations go through `&self` so a test can change the tree while a content
/// manager holds a reference to it.
#[derive(Debug, Default)]
pub struct InMemoryFs {
    nodes: RwLock<HashMap<PathBuf, Node>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir<P: Into<PathBuf>>(&self, path: P) {
        let path = path.into();
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&path) {
            return;
        }
        ensure_parent_link(&mut nodes, &path);
        nodes.insert(
            path,
            Node::Dir {
                children: Vec::new(),
                modified: None,
            },
        );
    }

    pub fn add_file<P: Into<PathBuf>>(&self, path: P, len: u64, modified: Option<DateTime<Utc>>) {
        let path = path.into();
        let mut nodes = self.nodes.write();
        ensure_parent_link(&mut nodes, &path);
        nodes.insert(path, Node::File { len, modified });
    }

    /// Set the modification time of an existing node.
    pub fn touch(&self, path: &Path, at: DateTime<Utc>) -> bool {
        match self.nodes.write().get_mut(path) {
            Some(Node::Dir { modified, .. }) | Some(Node::File { modified, .. }) => {
                *modified = Some(at);
                true
            }
            None => false,
        }
    }

    /// Remove `path` and everything below it.
    pub fn remove(&self, path: &Path) {
        let mut nodes = self.nodes.write();
        nodes.retain(|candidate, _| !candidate.starts_with(path));
        if let Some(parent) = path.parent()
            && let Some(Node::Dir { children, .. }) = nodes.get_mut(parent)
        {
            children.retain(|child| child != path);
        }
    }
}

fn ensure_parent_link(nodes: &mut HashMap<PathBuf, Node>, path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };
    if !nodes.contains_key(parent) {
        nodes.insert(
            parent.to_path_buf(),
            Node::Dir {
                children: Vec::new(),
                modified: None,
            },
        );
        ensure_parent_link(nodes, parent);
    }
    if let Some(Node::Dir { children, .. }) = nodes.get_mut(parent)
        && !children.iter().any(|child| child.as_path() == path)
    {
        children.push(path.to_path_buf());
    }
}

fn not_found(op: &str, path: &Path) -> IndexError {
    IndexError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("{op} on missing path {}", path.display()),
    ))
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn path_exists(&self, path: &Path) -> bool {
        self.nodes.read().contains_key(path)
    }

    async fn read_dir(&self, path: &Path) -> Result<Box<dyn ReadDirStream + Send>> {
        match self.nodes.read().get(path) {
            Some(Node::Dir { children, .. }) => Ok(Box::new(InMemReadDir {
                queue: children.clone().into(),
            })),
            Some(Node::File { .. }) => Err(IndexError::Io(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("read_dir on file {}", path.display()),
            ))),
            None => Err(not_found("read_dir", path)),
        }
    }

    async fn metadata(&self, path: &Path) -> Result<FsMetadata> {
        match self.nodes.read().get(path) {
            Some(Node::Dir { modified, .. }) => Ok(FsMetadata {
                is_dir: true,
                is_file: false,
                len: 0,
                modified: *modified,
            }),
            Some(Node::File { len, modified }) => Ok(FsMetadata {
                is_dir: false,
                is_file: true,
                len: *len,
                modified: *modified,
            }),
            None => Err(not_found("metadata", path)),
        }
    }
}

struct InMemReadDir {
    queue: VecDeque<PathBuf>,
}

#[async_trait]
impl ReadDirStream for InMemReadDir {
    async fn next_entry(&mut self) -> Result<Option<PathBuf>> {
        Ok(self.queue.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_tree_links_parents() {
        let fs = InMemoryFs::new();
        fs.add_file("/media/a/song.mp3", 10, None);
        fs.add_file("/media/b.mkv", 20, None);

        assert!(fs.path_exists(Path::new("/media/a")).await);
        let listing = list_dir(&fs, Path::new("/media")).await.unwrap();
        assert_eq!(
            listing,
            vec![PathBuf::from("/media/a"), PathBuf::from("/media/b.mkv")]
        );

        fs.remove(Path::new("/media/a"));
        assert!(!fs.path_exists(Path::new("/media/a/song.mp3")).await);
        let listing = list_dir(&fs, Path::new("/media")).await.unwrap();
        assert_eq!(listing, vec![PathBuf::from("/media/b.mkv")]);
    }

    #[tokio::test]
    async fn real_fs_reports_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clip.mp4");
        std::fs::write(&file, b"data").unwrap();

        let fs = RealFs::new();
        let md = fs.metadata(&file).await.unwrap();
        assert!(md.is_file);
        assert_eq!(md.len, 4);
        assert!(md.modified.is_some());

        let listing = list_dir(&fs, dir.path()).await.unwrap();
        assert_eq!(listing, vec![file]);
        assert!(fs.metadata(&dir.path().join("missing")).await.is_err());
    }

    #[test]
    fn hidden_names() {
        assert!(is_hidden(Path::new("/media/.cache")));
        assert!(!is_hidden(Path::new("/media/cache")));
    }
}
