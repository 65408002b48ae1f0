//! Analysis artifact cache
//!
//! Stores one artifact per source file under the mirrored output tree,
//! with an HTML-comment metadata header that `read` strips back off.
//! Freshness is a pure timestamp comparison: a cached artifact is fresh
//! iff its filesystem mtime is at or after the source file's mtime. No
//! tolerance window is applied; `timestamp_tolerance_seconds` exists in
//! the schema only.

use crate::context::DirectoryContext;
use crate::error::{IndexError, Result};
use crate::paths::PathMapper;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Opens the metadata block at the top of every artifact
pub const CACHE_METADATA_START: &str = "<!-- CACHE_METADATA_START -->";

/// Closes the metadata block; `read` strips through this marker
pub const CACHE_METADATA_END: &str = "<!-- CACHE_METADATA_END -->";

/// Current artifact format version
pub const CACHE_FORMAT_VERSION: &str = "1.0";

/// Footer comment the renderer appends to every knowledge file
pub const KB_METADATA_PREFIX: &str = "<!-- KB_METADATA:";

static KB_METADATA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<!-- KB_METADATA: generated=(\S+) files=(\d+) subdirs=(\d+) -->")
        .expect("valid regex")
});

/// Membership counts recorded in a knowledge file footer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KbMembership {
    pub files: usize,
    pub subdirs: usize,
}

/// Reads and writes per-file analysis artifacts
#[derive(Debug, Clone)]
pub struct AnalysisCache {
    mapper: PathMapper,
}

impl AnalysisCache {
    pub fn new(mapper: PathMapper) -> Self {
        Self { mapper }
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    /// Read an artifact with the metadata header stripped
    ///
    /// Missing file is `None`. A malformed artifact without the end marker
    /// is returned as-is for backward compatibility.
    pub fn read(&self, path: &Path) -> Option<String> {
        let raw = fs::read_to_string(path).ok()?;
        match raw.find(CACHE_METADATA_END) {
            Some(pos) => {
                let body = &raw[pos + CACHE_METADATA_END.len()..];
                Some(body.trim_start().to_string())
            }
            None => Some(raw),
        }
    }

    /// Read the cached analysis for a source file, if present
    pub fn read_for_source(&self, source: &Path) -> Option<String> {
        let artifact = self.mapper.analysis_path(source).ok()?;
        self.read(&artifact)
    }

    /// Write an artifact for `source`: metadata header plus `body`,
    /// written to a temporary file and renamed into place
    pub fn write(&self, source: &Path, body: &str) -> Result<PathBuf> {
        let artifact = self.mapper.analysis_path(source)?;
        let parent = artifact
            .parent()
            .ok_or_else(|| IndexError::task_io(&artifact, "artifact has no parent directory"))?;
        fs::create_dir_all(parent).map_err(|e| IndexError::task_io(parent, e))?;

        let source_mtime = fs::metadata(source)
            .and_then(|m| m.modified())
            .map_err(|e| IndexError::task_io(source, e))?;

        let mut content = String::new();
        content.push_str(CACHE_METADATA_START);
        content.push('\n');
        content.push_str(&format!(
            "<!-- source: {} -->\n",
            self.mapper.portable(source)
        ));
        content.push_str(&format!("<!-- cached_at: {} -->\n", iso8601(SystemTime::now())));
        content.push_str(&format!(
            "<!-- source_mtime: {} -->\n",
            iso8601(source_mtime)
        ));
        content.push_str(&format!("<!-- version: {} -->\n", CACHE_FORMAT_VERSION));
        content.push_str(CACHE_METADATA_END);
        content.push_str("\n\n");
        content.push_str(body);

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| IndexError::task_io(parent, e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| IndexError::task_io(&artifact, e))?;
        tmp.persist(&artifact)
            .map_err(|e| IndexError::task_io(&artifact, e))?;

        debug!("Cached analysis for {}", source.display());
        Ok(artifact)
    }

    /// Whether the cached artifact for `source` is fresh
    ///
    /// Fresh means the artifact exists and `cache_mtime >= source_mtime`.
    /// Any filesystem error during the comparison is reported as stale.
    pub fn is_fresh(&self, source: &Path) -> (bool, String) {
        let artifact = match self.mapper.analysis_path(source) {
            Ok(p) => p,
            Err(e) => return (false, e.to_string()),
        };
        if !artifact.exists() {
            return (false, "missing_cache".into());
        }
        let cache_mtime = match fs::metadata(&artifact).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => return (false, format!("cannot stat cache: {}", e)),
        };
        let source_mtime = match fs::metadata(source).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => return (false, format!("cannot stat source: {}", e)),
        };
        if cache_mtime >= source_mtime {
            (true, "cache_mtime >= source_mtime".into())
        } else {
            (false, "source_newer".into())
        }
    }

    /// Whether a directory's knowledge file must be rebuilt
    ///
    /// Stale when the knowledge file is missing, when any source file in
    /// the directory is newer than it, when any child knowledge file is
    /// newer than it, or when its recorded membership no longer matches
    /// the current constituents. Cached analysis files are deliberately
    /// not consulted; their mtimes move on every rebuild and would loop.
    /// Directory mtimes are never read.
    pub fn is_knowledge_file_stale(&self, dir: &DirectoryContext) -> (bool, String) {
        let kb_path = &dir.knowledge_path;
        if !kb_path.exists() {
            return (true, "missing_knowledge_file".into());
        }
        let kb_mtime = match fs::metadata(kb_path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => return (true, format!("cannot stat knowledge file: {}", e)),
        };

        for file in &dir.files {
            if file.mtime > kb_mtime {
                return (true, format!("source_newer: {}", file.file_name()));
            }
        }

        for sub in &dir.subdirs {
            if let Ok(child_mtime) = fs::metadata(&sub.knowledge_path).and_then(|m| m.modified()) {
                if child_mtime > kb_mtime {
                    return (true, format!("child_kb_newer: {}", sub.path.display()));
                }
            }
        }

        let with_content = dir.subdirs.iter().filter(|s| s.has_content()).count();
        match self.read_kb_membership(kb_path) {
            Some(recorded)
                if recorded.files != dir.files.len() || recorded.subdirs != with_content =>
            {
                (true, "constituents_changed".into())
            }
            Some(_) => (false, "fresh_against_constituents".into()),
            None => {
                warn!("No membership footer in {}", kb_path.display());
                (true, "missing_membership_footer".into())
            }
        }
    }

    /// Parse the membership footer out of a knowledge file
    pub fn read_kb_membership(&self, kb_path: &Path) -> Option<KbMembership> {
        let content = fs::read_to_string(kb_path).ok()?;
        let caps = KB_METADATA.captures(&content)?;
        Some(KbMembership {
            files: caps[2].parse().ok()?,
            subdirs: caps[3].parse().ok()?,
        })
    }

    /// Pre-create every analysis-cache directory for the tree so
    /// concurrent writers never race on `mkdir`
    pub fn prepare_cache_structure(&self, root: &DirectoryContext) -> Result<()> {
        let mut created = 0usize;
        let mut visit = |dir: &DirectoryContext| -> Result<()> {
            if dir.files.is_empty() {
                return Ok(());
            }
            let artifact = self.mapper.analysis_path(&dir.files[0].path)?;
            if let Some(parent) = artifact.parent() {
                fs::create_dir_all(parent).map_err(|e| IndexError::task_io(parent, e))?;
                created += 1;
            }
            Ok(())
        };
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            visit(dir)?;
            stack.extend(dir.subdirs.iter());
        }
        debug!("Prepared {} cache directories", created);
        Ok(())
    }
}

fn iso8601(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandlerType;
    use filetime_shim::set_mtime_forward;
    use tempfile::TempDir;

    /// Test helper: bump a file's mtime forward by rewriting it after a
    /// delay long enough for second-granularity filesystems
    mod filetime_shim {
        use std::fs;
        use std::path::Path;
        use std::time::Duration;

        pub fn set_mtime_forward(path: &Path, by: Duration) {
            std::thread::sleep(by);
            let content = fs::read(path).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    fn setup(temp: &TempDir) -> (PathBuf, AnalysisCache) {
        let source_root = temp.path().join("src");
        fs::create_dir_all(&source_root).unwrap();
        let mapper = PathMapper::new(
            source_root.clone(),
            temp.path().join("out"),
            HandlerType::ProjectBase,
        )
        .unwrap();
        (source_root, AnalysisCache::new(mapper))
    }

    #[test]
    fn test_metadata_round_trip() {
        let temp = TempDir::new().unwrap();
        let (root, cache) = setup(&temp);
        let source = root.join("a.txt");
        fs::write(&source, "alpha").unwrap();

        let body = "## Analysis\n\nThis file defines alpha.";
        let artifact = cache.write(&source, body).unwrap();
        assert_eq!(cache.read(&artifact).unwrap(), body);

        let raw = fs::read_to_string(&artifact).unwrap();
        assert!(raw.starts_with(CACHE_METADATA_START));
        assert!(raw.contains("{PROJECT_ROOT}/a.txt"));
        assert!(raw.contains(CACHE_FORMAT_VERSION));
    }

    #[test]
    fn test_read_missing_is_none() {
        let temp = TempDir::new().unwrap();
        let (_, cache) = setup(&temp);
        assert!(cache.read(Path::new("/nope/missing.analysis.md")).is_none());
    }

    #[test]
    fn test_read_without_end_marker_returns_original() {
        let temp = TempDir::new().unwrap();
        let (_, cache) = setup(&temp);
        let legacy = temp.path().join("legacy.analysis.md");
        fs::write(&legacy, "pre-metadata era content").unwrap();
        assert_eq!(cache.read(&legacy).unwrap(), "pre-metadata era content");
    }

    #[test]
    fn test_freshness_follows_mtimes() {
        let temp = TempDir::new().unwrap();
        let (root, cache) = setup(&temp);
        let source = root.join("a.txt");
        fs::write(&source, "alpha").unwrap();

        let (fresh, reason) = cache.is_fresh(&source);
        assert!(!fresh);
        assert_eq!(reason, "missing_cache");

        cache.write(&source, "analysis").unwrap();
        let (fresh, _) = cache.is_fresh(&source);
        assert!(fresh);

        // Touching the source makes the cache stale again
        set_mtime_forward(&source, std::time::Duration::from_millis(1100));
        let (fresh, reason) = cache.is_fresh(&source);
        assert!(!fresh);
        assert_eq!(reason, "source_newer");
    }

    #[test]
    fn test_missing_source_is_stale() {
        let temp = TempDir::new().unwrap();
        let (root, cache) = setup(&temp);
        let (fresh, _) = cache.is_fresh(&root.join("ghost.txt"));
        assert!(!fresh);
    }

    #[test]
    fn test_prepare_cache_structure_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let (root, cache) = setup(&temp);
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/c.txt"), "gamma").unwrap();

        let mapper = cache.mapper().clone();
        let config = crate::config::IndexingConfig::default_for(HandlerType::ProjectBase);
        let ctx = crate::discovery::Discovery::new(&config, &mapper)
            .discover()
            .unwrap();

        cache.prepare_cache_structure(&ctx).unwrap();
        cache.prepare_cache_structure(&ctx).unwrap();
        assert!(temp.path().join("out/project-base/sub").is_dir());
    }

    #[test]
    fn test_kb_membership_parse() {
        let temp = TempDir::new().unwrap();
        let (_, cache) = setup(&temp);
        let kb = temp.path().join("sub_kb.md");
        fs::write(
            &kb,
            "# KB\n\nbody\n\n<!-- KB_METADATA: generated=2026-01-01T00:00:00Z files=3 subdirs=1 -->\n",
        )
        .unwrap();
        assert_eq!(
            cache.read_kb_membership(&kb).unwrap(),
            KbMembership { files: 3, subdirs: 1 }
        );
    }
}
