//! Path mapping between source, analysis-cache, and knowledge trees
//!
//! Pure functions over `(source_root, out_root)`. The analysis tree under
//! `out_root/<handler>/` exactly mirrors the source tree; knowledge files
//! sit adjacent to their source directory, except the handler root whose
//! knowledge file is `root_kb.md` inside the output tree.

use crate::config::HandlerType;
use crate::error::{IndexError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Suffix appended to a mirrored source file to form its analysis artifact
pub const ANALYSIS_SUFFIX: &str = ".analysis.md";

/// Suffix appended to a directory name to form its knowledge file
pub const KNOWLEDGE_SUFFIX: &str = "_kb.md";

/// Knowledge file name for a handler root
pub const ROOT_KNOWLEDGE_FILE: &str = "root_kb.md";

/// Placeholder used in portable path rendering
pub const PORTABLE_ROOT: &str = "{PROJECT_ROOT}";

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9]+").expect("valid regex"));
static UNDERSCORE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"_{2,}").expect("valid regex"));

/// Maps source paths to analysis-cache and knowledge-file paths
#[derive(Debug, Clone)]
pub struct PathMapper {
    source_root: PathBuf,
    out_root: PathBuf,
    handler: HandlerType,
}

impl PathMapper {
    pub fn new(
        source_root: impl Into<PathBuf>,
        out_root: impl Into<PathBuf>,
        handler: HandlerType,
    ) -> Result<Self> {
        let source_root = source_root.into();
        let out_root = out_root.into();
        if source_root == out_root {
            return Err(IndexError::PathMapping(format!(
                "source root and output root collide: {}",
                source_root.display()
            )));
        }
        Ok(Self {
            source_root,
            out_root,
            handler,
        })
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn out_root(&self) -> &Path {
        &self.out_root
    }

    pub fn handler(&self) -> HandlerType {
        self.handler
    }

    /// Output directory owned by this handler
    pub fn handler_root_output(&self) -> PathBuf {
        self.out_root.join(self.handler.dir_name())
    }

    /// Whether `dir` is the top of this handler's source tree
    pub fn is_handler_root(&self, dir: &Path) -> bool {
        dir == self.source_root
    }

    /// Path of `path` relative to the source root
    pub fn relative(&self, path: &Path) -> Result<PathBuf> {
        path.strip_prefix(&self.source_root)
            .map(Path::to_path_buf)
            .map_err(|_| {
                IndexError::PathMapping(format!(
                    "{} is not under source root {}",
                    path.display(),
                    self.source_root.display()
                ))
            })
    }

    /// Analysis artifact path for a source file
    ///
    /// `out_root/<handler>/<relpath>.analysis.md`; the tree under the
    /// handler output directory exactly mirrors the source tree.
    pub fn analysis_path(&self, source_file: &Path) -> Result<PathBuf> {
        let rel = self.relative(source_file)?;
        let mut mirrored = self.handler_root_output().join(rel);
        let name = mirrored
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                IndexError::PathMapping(format!("no file name in {}", source_file.display()))
            })?
            .to_string();
        mirrored.set_file_name(format!("{}{}", name, ANALYSIS_SUFFIX));
        Ok(mirrored)
    }

    /// Inverse of [`analysis_path`]: the source file an artifact mirrors
    pub fn source_for_analysis(&self, artifact: &Path) -> Result<PathBuf> {
        let rel = artifact
            .strip_prefix(self.handler_root_output())
            .map_err(|_| {
                IndexError::PathMapping(format!(
                    "{} is not under the handler output tree",
                    artifact.display()
                ))
            })?;
        let name = rel
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(ANALYSIS_SUFFIX))
            .ok_or_else(|| {
                IndexError::PathMapping(format!("{} is not an analysis artifact", artifact.display()))
            })?;
        let mut source = self.source_root.join(rel);
        source.set_file_name(name);
        Ok(source)
    }

    /// Knowledge file path for a source directory
    ///
    /// `D.parent/<D.name>_kb.md`, except the handler root whose knowledge
    /// file lives inside the output tree as `root_kb.md`.
    pub fn knowledge_path(&self, dir: &Path) -> Result<PathBuf> {
        if self.is_handler_root(dir) {
            return Ok(self.handler_root_output().join(ROOT_KNOWLEDGE_FILE));
        }
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                IndexError::PathMapping(format!("no directory name in {}", dir.display()))
            })?;
        let parent = dir.parent().ok_or_else(|| {
            IndexError::PathMapping(format!("no parent for {}", dir.display()))
        })?;
        Ok(parent.join(format!("{}{}", name, KNOWLEDGE_SUFFIX)))
    }

    /// Portable rendering of a path: `{PROJECT_ROOT}/rel/path`
    ///
    /// Uses forward slashes regardless of platform so knowledge files stay
    /// diffable across machines.
    pub fn portable(&self, path: &Path) -> String {
        match path.strip_prefix(&self.source_root) {
            Ok(rel) if rel.as_os_str().is_empty() => PORTABLE_ROOT.to_string(),
            Ok(rel) => {
                let joined = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                format!("{}/{}", PORTABLE_ROOT, joined)
            }
            Err(_) => path.to_string_lossy().into_owned(),
        }
    }

    /// Sanitised identifier for a path: separators and non-word characters
    /// become `_`, runs collapse, edges are trimmed
    pub fn sanitize(&self, path: &Path) -> String {
        let rel = path
            .strip_prefix(&self.source_root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        sanitize_identifier(&rel)
    }
}

/// Sanitise an arbitrary string into a `[A-Za-z0-9_]` identifier
pub fn sanitize_identifier(raw: &str) -> String {
    let replaced = NON_WORD.replace_all(raw, "_");
    let collapsed = UNDERSCORE_RUNS.replace_all(&replaced, "_");
    let trimmed = collapsed.trim_matches('_');
    if trimmed.is_empty() {
        "root".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> PathMapper {
        PathMapper::new("/work/src", "/work/out", HandlerType::ProjectBase).unwrap()
    }

    #[test]
    fn test_analysis_path_mirrors_source_tree() {
        let m = mapper();
        let path = m
            .analysis_path(Path::new("/work/src/sub/c.txt"))
            .unwrap();
        assert_eq!(
            path,
            PathBuf::from("/work/out/project-base/sub/c.txt.analysis.md")
        );
    }

    #[test]
    fn test_analysis_path_roundtrip() {
        let m = mapper();
        let source = Path::new("/work/src/sub/c.txt");
        let artifact = m.analysis_path(source).unwrap();
        assert_eq!(m.source_for_analysis(&artifact).unwrap(), source);
    }

    #[test]
    fn test_knowledge_path_adjacent_to_directory() {
        let m = mapper();
        let path = m.knowledge_path(Path::new("/work/src/sub")).unwrap();
        assert_eq!(path, PathBuf::from("/work/src/sub_kb.md"));
    }

    #[test]
    fn test_handler_root_knowledge_path() {
        let m = mapper();
        let path = m.knowledge_path(Path::new("/work/src")).unwrap();
        assert_eq!(path, PathBuf::from("/work/out/project-base/root_kb.md"));
    }

    #[test]
    fn test_outside_root_is_an_error() {
        let m = mapper();
        assert!(m.analysis_path(Path::new("/elsewhere/a.txt")).is_err());
    }

    #[test]
    fn test_root_collision_rejected() {
        assert!(PathMapper::new("/work/src", "/work/src", HandlerType::ProjectBase).is_err());
    }

    #[test]
    fn test_portable_paths() {
        let m = mapper();
        assert_eq!(
            m.portable(Path::new("/work/src/sub/c.txt")),
            "{PROJECT_ROOT}/sub/c.txt"
        );
        assert_eq!(m.portable(Path::new("/work/src")), "{PROJECT_ROOT}");
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("src/sub/c.txt"), "src_sub_c_txt");
        assert_eq!(sanitize_identifier("a//b..c"), "a_b_c");
        assert_eq!(sanitize_identifier(""), "root");
    }
}
