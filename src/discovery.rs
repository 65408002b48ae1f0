//! Source tree discovery
//!
//! Walks the source tree depth-first applying the configured exclusions
//! and produces the immutable [`DirectoryContext`] tree for the run.
//! Size and mtime are read exactly once per file. Discovery never calls
//! the LLM and never reads file contents; a permission error on a
//! directory skips only that directory.

use crate::config::IndexingConfig;
use crate::context::{DirectoryContext, FileContext};
use crate::error::{IndexError, Result};
use crate::paths::PathMapper;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Exclusion-aware source tree walker
pub struct Discovery<'a> {
    config: &'a IndexingConfig,
    mapper: &'a PathMapper,
}

impl<'a> Discovery<'a> {
    pub fn new(config: &'a IndexingConfig, mapper: &'a PathMapper) -> Self {
        Self { config, mapper }
    }

    /// Walk the source root and build the context tree
    pub fn discover(&self) -> Result<DirectoryContext> {
        let root = self.mapper.source_root();
        if !root.is_dir() {
            return Err(IndexError::Discovery {
                path: root.to_path_buf(),
                message: "source root is not a directory".into(),
            });
        }
        let mut ctx = DirectoryContext::new(root.to_path_buf(), self.mapper.knowledge_path(root)?);
        self.walk(root, &mut ctx)?;
        debug!(
            "Discovered {} files in {} directories under {}",
            ctx.total_files(),
            ctx.total_dirs(),
            root.display()
        );
        Ok(ctx)
    }

    fn walk(&self, dir: &Path, ctx: &mut DirectoryContext) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                // Skip just this directory; the rest of the walk continues
                warn!("Skipping unreadable directory {}: {}", dir.display(), e);
                return Ok(());
            }
        };

        let mut names: Vec<_> = entries
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.path()),
                Err(e) => {
                    warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                    None
                }
            })
            .collect();
        names.sort();

        for path in names {
            // The output tree can live inside the source root; never descend
            if path == self.mapper.out_root() {
                continue;
            }

            let metadata = match fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            if metadata.is_dir() {
                if !self.config.should_process_directory(&path) {
                    debug!("Excluded directory {}", path.display());
                    continue;
                }
                let mut sub =
                    DirectoryContext::new(path.clone(), self.mapper.knowledge_path(&path)?);
                self.walk(&path, &mut sub)?;
                ctx.subdirs.push(sub);
            } else if metadata.is_file() {
                if !self.config.should_process_file(&path, metadata.len()) {
                    debug!("Excluded file {}", path.display());
                    continue;
                }
                let mtime = match metadata.modified() {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("No mtime for {}: {}", path.display(), e);
                        continue;
                    }
                };
                ctx.files
                    .push(FileContext::new(path, metadata.len(), mtime));
            }
            // Symlinks and other entry kinds are ignored
        }

        Ok(())
    }
}
