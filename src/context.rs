//! Run-scoped source tree snapshot
//!
//! Discovery produces one immutable [`DirectoryContext`] tree per run.
//! Later stages borrow it read-only; state transitions produce new
//! instances rather than mutating in place.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Lifecycle of a discovered file within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Discovered,
    Cached,
    Analyzed,
    Skipped,
    Failed,
}

/// Lifecycle of a discovered directory within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirStatus {
    Discovered,
    Fresh,
    Rebuilt,
    Skipped,
}

/// Snapshot of one source file: path, size, and modification time are
/// recorded exactly once, at discovery
#[derive(Debug, Clone)]
pub struct FileContext {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: SystemTime,
    pub status: FileStatus,
}

impl FileContext {
    pub fn new(path: PathBuf, size: u64, mtime: SystemTime) -> Self {
        Self {
            path,
            size,
            mtime,
            status: FileStatus::Discovered,
        }
    }

    /// New instance with a different status
    pub fn with_status(&self, status: FileStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// Snapshot of one source directory and everything beneath it
///
/// Children are always contained under `path`; the tree is acyclic and
/// traversable leaves-first.
#[derive(Debug, Clone)]
pub struct DirectoryContext {
    pub path: PathBuf,
    pub files: Vec<FileContext>,
    pub subdirs: Vec<DirectoryContext>,
    /// Where this directory's knowledge file lives (or would live)
    pub knowledge_path: PathBuf,
    pub status: DirStatus,
}

impl DirectoryContext {
    pub fn new(path: PathBuf, knowledge_path: PathBuf) -> Self {
        Self {
            path,
            files: Vec::new(),
            subdirs: Vec::new(),
            knowledge_path,
            status: DirStatus::Discovered,
        }
    }

    /// Whether this directory or any descendant has a processable file
    pub fn has_content(&self) -> bool {
        !self.files.is_empty() || self.subdirs.iter().any(DirectoryContext::has_content)
    }

    /// Total files in this subtree
    pub fn total_files(&self) -> usize {
        self.files.len() + self.subdirs.iter().map(DirectoryContext::total_files).sum::<usize>()
    }

    /// Total directories in this subtree, including self
    pub fn total_dirs(&self) -> usize {
        1 + self.subdirs.iter().map(DirectoryContext::total_dirs).sum::<usize>()
    }

    /// Visit every directory leaves-first (children before parents)
    pub fn visit_leaves_first<'a>(&'a self, visit: &mut impl FnMut(&'a DirectoryContext)) {
        for sub in &self.subdirs {
            sub.visit_leaves_first(visit);
        }
        visit(self);
    }

    /// Find the context for an exact directory path in this subtree
    pub fn find_dir(&self, path: &Path) -> Option<&DirectoryContext> {
        if self.path == path {
            return Some(self);
        }
        self.subdirs.iter().find_map(|sub| sub.find_dir(path))
    }

    /// Iterate every file in this subtree
    pub fn all_files<'a>(&'a self, out: &mut Vec<&'a FileContext>) {
        out.extend(self.files.iter());
        for sub in &self.subdirs {
            sub.all_files(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str) -> FileContext {
        FileContext::new(PathBuf::from(path), 10, SystemTime::UNIX_EPOCH)
    }

    fn tree() -> DirectoryContext {
        let mut root = DirectoryContext::new("/s".into(), "/o/root_kb.md".into());
        root.files.push(file("/s/a.txt"));
        let mut sub = DirectoryContext::new("/s/sub".into(), "/s/sub_kb.md".into());
        sub.files.push(file("/s/sub/c.txt"));
        root.subdirs.push(sub);
        root
    }

    #[test]
    fn test_counts() {
        let root = tree();
        assert_eq!(root.total_files(), 2);
        assert_eq!(root.total_dirs(), 2);
        assert!(root.has_content());
    }

    #[test]
    fn test_leaves_first_order() {
        let root = tree();
        let mut order = Vec::new();
        root.visit_leaves_first(&mut |d| order.push(d.path.clone()));
        assert_eq!(order, vec![PathBuf::from("/s/sub"), PathBuf::from("/s")]);
    }

    #[test]
    fn test_empty_subtree_has_no_content() {
        let root = DirectoryContext::new("/s".into(), "/o/root_kb.md".into());
        assert!(!root.has_content());
    }

    #[test]
    fn test_status_transition_is_a_new_instance() {
        let f = file("/s/a.txt");
        let analyzed = f.with_status(FileStatus::Analyzed);
        assert_eq!(f.status, FileStatus::Discovered);
        assert_eq!(analyzed.status, FileStatus::Analyzed);
    }

    #[test]
    fn test_find_dir() {
        let root = tree();
        assert!(root.find_dir(Path::new("/s/sub")).is_some());
        assert!(root.find_dir(Path::new("/s/missing")).is_none());
    }
}
