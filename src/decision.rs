//! Rebuild decision engine
//!
//! Single source of truth for rebuild-or-skip. Runs in four phases:
//! file-level decisions, directory-level decisions (leaves first),
//! orphan deletion, and cascade propagation. The engine reads only
//! filesystem metadata, never file bodies, and never the LLM.

use crate::cache::AnalysisCache;
use crate::config::{IndexingConfig, IndexingMode};
use crate::context::DirectoryContext;
use crate::error::{IndexError, Result};
use crate::paths::{KNOWLEDGE_SUFFIX, ROOT_KNOWLEDGE_FILE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};
use walkdir::WalkDir;

// ============================================================================
// Decision Types
// ============================================================================

/// What to do with one file or directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildOutcome {
    AnalyzeFile,
    SkipFileCached,
    CreateDirectoryKb,
    SkipDirectoryFresh,
}

/// Why the outcome was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildReason {
    NewSource,
    SourceNewerThanCache,
    MissingCache,
    CacheFresh,
    NewKnowledgeFile,
    SelfStale,
    CascadedFromChild,
    HandlerRoot,
    FreshAgainstConstituents,
    ForcedRebuild,
    NoProcessableContent,
}

/// One rebuild-or-skip decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildDecision {
    pub target: PathBuf,
    pub outcome: RebuildOutcome,
    pub reason: RebuildReason,
    /// Free-form detail from the staleness check, for diagnostics
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl RebuildDecision {
    fn new(target: PathBuf, outcome: RebuildOutcome, reason: RebuildReason, detail: String) -> Self {
        Self {
            target,
            outcome,
            reason,
            detail,
            timestamp: Utc::now(),
        }
    }

    pub fn is_rebuild(&self) -> bool {
        matches!(
            self.outcome,
            RebuildOutcome::AnalyzeFile | RebuildOutcome::CreateDirectoryKb
        )
    }
}

/// Kind of orphaned artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionKind {
    OrphanedAnalysis,
    OrphanedKnowledge,
    OrphanedDirectory,
}

/// Decision to delete an artifact whose source no longer exists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionDecision {
    pub target: PathBuf,
    pub kind: DeletionKind,
    pub is_safe_to_delete: bool,
}

/// Aggregate of all decisions for one run
#[derive(Debug, Default)]
pub struct DecisionReport {
    pub files: BTreeMap<PathBuf, RebuildDecision>,
    pub dirs: BTreeMap<PathBuf, RebuildDecision>,
    pub deletions: Vec<DeletionDecision>,
}

impl DecisionReport {
    pub fn files_to_analyze(&self) -> usize {
        self.files
            .values()
            .filter(|d| d.outcome == RebuildOutcome::AnalyzeFile)
            .count()
    }

    pub fn dirs_to_rebuild(&self) -> usize {
        self.dirs
            .values()
            .filter(|d| d.outcome == RebuildOutcome::CreateDirectoryKb)
            .count()
    }

    /// Internal consistency: every directory rebuild must be justified by
    /// a child rebuild or its own staleness, and every rebuilt directory's
    /// ancestors must also rebuild. A violation is a bug.
    pub fn validate(&self, root: &DirectoryContext) -> Result<()> {
        let mut problem = None;
        root.visit_leaves_first(&mut |dir| {
            if problem.is_some() {
                return;
            }
            let Some(decision) = self.dirs.get(&dir.path) else {
                problem = Some(format!("no decision for directory {}", dir.path.display()));
                return;
            };
            if decision.outcome != RebuildOutcome::CreateDirectoryKb {
                return;
            }
            if !dir.has_content() {
                problem = Some(format!(
                    "empty directory {} scheduled for a knowledge file",
                    dir.path.display()
                ));
                return;
            }
            let child_file_rebuild = dir.files.iter().any(|f| {
                self.files
                    .get(&f.path)
                    .map(|d| d.outcome == RebuildOutcome::AnalyzeFile)
                    .unwrap_or(false)
            });
            let child_dir_rebuild = dir.subdirs.iter().any(|s| {
                self.dirs
                    .get(&s.path)
                    .map(|d| d.outcome == RebuildOutcome::CreateDirectoryKb)
                    .unwrap_or(false)
            });
            let self_stale = matches!(
                decision.reason,
                RebuildReason::SelfStale
                    | RebuildReason::NewKnowledgeFile
                    | RebuildReason::ForcedRebuild
                    | RebuildReason::HandlerRoot
            );
            if !child_file_rebuild && !child_dir_rebuild && !self_stale {
                problem = Some(format!(
                    "unjustified rebuild of {}",
                    dir.path.display()
                ));
            }
        });
        match problem {
            Some(msg) => Err(IndexError::Decision(msg)),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Decision Engine
// ============================================================================

/// Emits rebuild and deletion decisions for a discovered tree
pub struct DecisionEngine<'a> {
    config: &'a IndexingConfig,
    cache: &'a AnalysisCache,
}

impl<'a> DecisionEngine<'a> {
    pub fn new(config: &'a IndexingConfig, cache: &'a AnalysisCache) -> Self {
        Self { config, cache }
    }

    /// Run all four phases and validate the resulting report
    pub fn evaluate(&self, root: &DirectoryContext) -> Result<DecisionReport> {
        let mode = self.config.change_detection.indexing_mode;
        let mut report = DecisionReport::default();

        self.decide_files(root, mode, &mut report);
        self.decide_dir(root, mode, &mut report);
        self.scan_orphans(root, &mut report);
        self.propagate_cascades(root, &mut report);

        report.validate(root)?;
        info!(
            "Decisions: {} files to analyze, {} directories to rebuild, {} deletions",
            report.files_to_analyze(),
            report.dirs_to_rebuild(),
            report.deletions.len()
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Phase 1: file-level decisions
    // ------------------------------------------------------------------

    fn decide_files(&self, dir: &DirectoryContext, mode: IndexingMode, report: &mut DecisionReport) {
        for file in &dir.files {
            let decision = if mode == IndexingMode::Full {
                RebuildDecision::new(
                    file.path.clone(),
                    RebuildOutcome::AnalyzeFile,
                    RebuildReason::ForcedRebuild,
                    "full mode".into(),
                )
            } else {
                let (fresh, detail) = self.cache.is_fresh(&file.path);
                if fresh {
                    RebuildDecision::new(
                        file.path.clone(),
                        RebuildOutcome::SkipFileCached,
                        RebuildReason::CacheFresh,
                        detail,
                    )
                } else {
                    let reason = match detail.as_str() {
                        "missing_cache" => RebuildReason::NewSource,
                        "source_newer" => RebuildReason::SourceNewerThanCache,
                        _ => RebuildReason::MissingCache,
                    };
                    RebuildDecision::new(
                        file.path.clone(),
                        RebuildOutcome::AnalyzeFile,
                        reason,
                        detail,
                    )
                }
            };
            debug!(
                "File {} -> {:?} ({:?})",
                file.path.display(),
                decision.outcome,
                decision.reason
            );
            report.files.insert(file.path.clone(), decision);
        }
        for sub in &dir.subdirs {
            self.decide_files(sub, mode, report);
        }
    }

    // ------------------------------------------------------------------
    // Phase 2: directory-level decisions, leaves first
    // ------------------------------------------------------------------

    fn decide_dir(
        &self,
        dir: &DirectoryContext,
        mode: IndexingMode,
        report: &mut DecisionReport,
    ) -> bool {
        let mut any_child_rebuild = false;
        for sub in &dir.subdirs {
            any_child_rebuild |= self.decide_dir(sub, mode, report);
        }

        // A directory with nothing processable never gets a knowledge
        // file; emitting one would make it perpetually stale.
        if !dir.has_content() {
            report.dirs.insert(
                dir.path.clone(),
                RebuildDecision::new(
                    dir.path.clone(),
                    RebuildOutcome::SkipDirectoryFresh,
                    RebuildReason::NoProcessableContent,
                    String::new(),
                ),
            );
            return false;
        }

        let forced = matches!(mode, IndexingMode::Full | IndexingMode::FullKbRebuild);
        let any_file_rebuild = dir.files.iter().any(|f| {
            report
                .files
                .get(&f.path)
                .map(|d| d.outcome == RebuildOutcome::AnalyzeFile)
                .unwrap_or(false)
        });

        let decision = if forced {
            let reason = if self.cache.mapper().is_handler_root(&dir.path) {
                RebuildReason::HandlerRoot
            } else {
                RebuildReason::ForcedRebuild
            };
            RebuildDecision::new(
                dir.path.clone(),
                RebuildOutcome::CreateDirectoryKb,
                reason,
                format!("{:?} mode", mode),
            )
        } else if any_file_rebuild || any_child_rebuild {
            RebuildDecision::new(
                dir.path.clone(),
                RebuildOutcome::CreateDirectoryKb,
                RebuildReason::CascadedFromChild,
                String::new(),
            )
        } else {
            let (stale, detail) = self.cache.is_knowledge_file_stale(dir);
            if stale {
                let reason = if detail == "missing_knowledge_file" {
                    RebuildReason::NewKnowledgeFile
                } else {
                    RebuildReason::SelfStale
                };
                RebuildDecision::new(
                    dir.path.clone(),
                    RebuildOutcome::CreateDirectoryKb,
                    reason,
                    detail,
                )
            } else {
                RebuildDecision::new(
                    dir.path.clone(),
                    RebuildOutcome::SkipDirectoryFresh,
                    RebuildReason::FreshAgainstConstituents,
                    detail,
                )
            }
        };

        debug!(
            "Dir {} -> {:?} ({:?})",
            dir.path.display(),
            decision.outcome,
            decision.reason
        );
        let rebuild = decision.outcome == RebuildOutcome::CreateDirectoryKb;
        report.dirs.insert(dir.path.clone(), decision);
        rebuild
    }

    // ------------------------------------------------------------------
    // Phase 3: orphan deletion, leaves first
    // ------------------------------------------------------------------

    fn scan_orphans(&self, root: &DirectoryContext, report: &mut DecisionReport) {
        let mapper = self.cache.mapper();
        let handler_out = mapper.handler_root_output();

        // Orphaned analysis artifacts and mirrored directories. Walking
        // contents-first lets a fully-orphaned directory swallow its files
        // into a single directory deletion.
        let mut orphan_dirs: Vec<PathBuf> = Vec::new();
        if handler_out.is_dir() {
            for entry in WalkDir::new(&handler_out)
                .contents_first(true)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if orphan_dirs.iter().any(|d| path.starts_with(d)) && path != handler_out {
                    continue;
                }
                if entry.file_type().is_file() {
                    let name = entry.file_name().to_string_lossy();
                    if name == ROOT_KNOWLEDGE_FILE {
                        continue;
                    }
                    if !name.ends_with(crate::paths::ANALYSIS_SUFFIX) {
                        continue;
                    }
                    let orphaned = match mapper.source_for_analysis(path) {
                        Ok(source) => !source.is_file(),
                        Err(_) => true,
                    };
                    if orphaned {
                        report.deletions.push(DeletionDecision {
                            target: path.to_path_buf(),
                            kind: DeletionKind::OrphanedAnalysis,
                            is_safe_to_delete: true,
                        });
                    }
                } else if entry.file_type().is_dir() && path != handler_out {
                    // The handler root itself is never deleted
                    let rel = match path.strip_prefix(&handler_out) {
                        Ok(r) => r,
                        Err(_) => continue,
                    };
                    let source_dir = mapper.source_root().join(rel);
                    let has_live_source = root
                        .find_dir(&source_dir)
                        .map(DirectoryContext::has_content)
                        .unwrap_or(false);
                    if !has_live_source {
                        // Swallow any file deletions already queued below
                        report.deletions.retain(|d| !d.target.starts_with(path));
                        report.deletions.push(DeletionDecision {
                            target: path.to_path_buf(),
                            kind: DeletionKind::OrphanedDirectory,
                            is_safe_to_delete: true,
                        });
                        orphan_dirs.push(path.to_path_buf());
                    }
                }
            }
        }

        // Orphaned knowledge files adjacent to vanished source directories
        for entry in WalkDir::new(mapper.source_root())
            .into_iter()
            .filter_entry(|e| e.path() != mapper.out_root())
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let Some(dir_name) = name.strip_suffix(KNOWLEDGE_SUFFIX) else {
                continue;
            };
            if dir_name.is_empty() {
                continue;
            }
            let dir = entry.path().with_file_name(dir_name);
            let alive = root
                .find_dir(&dir)
                .map(DirectoryContext::has_content)
                .unwrap_or(false);
            if !alive {
                report.deletions.push(DeletionDecision {
                    target: entry.path().to_path_buf(),
                    kind: DeletionKind::OrphanedKnowledge,
                    is_safe_to_delete: true,
                });
            }
        }

        for deletion in &report.deletions {
            debug!("Orphan {:?}: {}", deletion.kind, deletion.target.display());
        }
    }

    // ------------------------------------------------------------------
    // Phase 4: cascade propagation
    // ------------------------------------------------------------------

    fn propagate_cascades(&self, root: &DirectoryContext, report: &mut DecisionReport) {
        // Leaves-first directory decisions already cascade through
        // immediate children; this pass closes the transitive gap for
        // ancestors decided before a deep descendant flipped.
        let rebuilt: Vec<PathBuf> = report
            .dirs
            .iter()
            .filter(|(_, d)| d.outcome == RebuildOutcome::CreateDirectoryKb)
            .map(|(p, _)| p.clone())
            .collect();

        for path in rebuilt {
            let mut current = path.as_path();
            while let Some(parent) = current.parent() {
                if !parent.starts_with(root.path.as_path()) || parent == current {
                    break;
                }
                if let Some(decision) = report.dirs.get_mut(parent) {
                    if decision.outcome == RebuildOutcome::SkipDirectoryFresh
                        && decision.reason != RebuildReason::NoProcessableContent
                    {
                        *decision = RebuildDecision::new(
                            parent.to_path_buf(),
                            RebuildOutcome::CreateDirectoryKb,
                            RebuildReason::CascadedFromChild,
                            format!("descendant {}", path.display()),
                        );
                    }
                }
                if parent == root.path {
                    break;
                }
                current = parent;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HandlerType, IndexingConfig};
    use crate::discovery::Discovery;
    use crate::paths::PathMapper;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        config: IndexingConfig,
        cache: AnalysisCache,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("src");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), "alpha").unwrap();
        fs::write(root.join("b.txt"), "beta").unwrap();
        fs::write(root.join("sub/c.txt"), "gamma").unwrap();
        let mapper = PathMapper::new(
            root.clone(),
            temp.path().join("out"),
            HandlerType::ProjectBase,
        )
        .unwrap();
        Fixture {
            _temp: temp,
            root,
            config: IndexingConfig::default_for(HandlerType::ProjectBase),
            cache: AnalysisCache::new(mapper),
        }
    }

    fn discover(f: &Fixture) -> DirectoryContext {
        Discovery::new(&f.config, f.cache.mapper()).discover().unwrap()
    }

    #[test]
    fn test_cold_run_analyzes_everything() {
        let f = fixture();
        let ctx = discover(&f);
        let report = DecisionEngine::new(&f.config, &f.cache)
            .evaluate(&ctx)
            .unwrap();
        assert_eq!(report.files_to_analyze(), 3);
        assert_eq!(report.dirs_to_rebuild(), 2);
        assert!(report.deletions.is_empty());
    }

    #[test]
    fn test_empty_directory_never_gets_a_kb() {
        let f = fixture();
        fs::create_dir_all(f.root.join("empty")).unwrap();
        let ctx = discover(&f);
        let report = DecisionEngine::new(&f.config, &f.cache)
            .evaluate(&ctx)
            .unwrap();
        let decision = report.dirs.get(&f.root.join("empty")).unwrap();
        assert_eq!(decision.outcome, RebuildOutcome::SkipDirectoryFresh);
        assert_eq!(decision.reason, RebuildReason::NoProcessableContent);
    }

    #[test]
    fn test_full_mode_bypasses_cache() {
        let mut f = fixture();
        let ctx = discover(&f);
        // Seed caches so incremental mode would skip
        for file in ["a.txt", "b.txt", "sub/c.txt"] {
            f.cache.write(&f.root.join(file), "analysis").unwrap();
        }
        f.config.change_detection.indexing_mode = IndexingMode::Full;
        let report = DecisionEngine::new(&f.config, &f.cache)
            .evaluate(&ctx)
            .unwrap();
        assert_eq!(report.files_to_analyze(), 3);
        assert_eq!(report.dirs_to_rebuild(), 2);
    }

    #[test]
    fn test_full_kb_rebuild_respects_file_cache() {
        let mut f = fixture();
        let ctx = discover(&f);
        for file in ["a.txt", "b.txt", "sub/c.txt"] {
            f.cache.write(&f.root.join(file), "analysis").unwrap();
        }
        f.config.change_detection.indexing_mode = IndexingMode::FullKbRebuild;
        let report = DecisionEngine::new(&f.config, &f.cache)
            .evaluate(&ctx)
            .unwrap();
        assert_eq!(report.files_to_analyze(), 0);
        assert_eq!(report.dirs_to_rebuild(), 2);
    }

    #[test]
    fn test_orphaned_analysis_detected() {
        let f = fixture();
        // Cache an analysis, then delete its source
        f.cache.write(&f.root.join("b.txt"), "analysis").unwrap();
        fs::remove_file(f.root.join("b.txt")).unwrap();

        let ctx = discover(&f);
        let report = DecisionEngine::new(&f.config, &f.cache)
            .evaluate(&ctx)
            .unwrap();
        assert_eq!(report.deletions.len(), 1);
        assert_eq!(report.deletions[0].kind, DeletionKind::OrphanedAnalysis);
        assert!(report.deletions[0]
            .target
            .to_string_lossy()
            .ends_with("b.txt.analysis.md"));
    }

    #[test]
    fn test_orphaned_subtree_collapses_to_one_directory_deletion() {
        let f = fixture();
        f.cache.write(&f.root.join("sub/c.txt"), "analysis").unwrap();
        fs::remove_file(f.root.join("sub/c.txt")).unwrap();
        fs::remove_dir(f.root.join("sub")).unwrap();

        let ctx = discover(&f);
        let report = DecisionEngine::new(&f.config, &f.cache)
            .evaluate(&ctx)
            .unwrap();
        let dir_deletions: Vec<_> = report
            .deletions
            .iter()
            .filter(|d| d.kind == DeletionKind::OrphanedDirectory)
            .collect();
        assert_eq!(dir_deletions.len(), 1);
        assert!(dir_deletions[0].target.ends_with("project-base/sub"));
        // The analysis file inside was swallowed by the directory deletion
        assert!(!report
            .deletions
            .iter()
            .any(|d| d.kind == DeletionKind::OrphanedAnalysis));
    }

    #[test]
    fn test_orphaned_knowledge_file_detected() {
        let f = fixture();
        fs::write(f.root.join("gone_kb.md"), "stale knowledge").unwrap();

        let ctx = discover(&f);
        let report = DecisionEngine::new(&f.config, &f.cache)
            .evaluate(&ctx)
            .unwrap();
        assert!(report
            .deletions
            .iter()
            .any(|d| d.kind == DeletionKind::OrphanedKnowledge
                && d.target.to_string_lossy().ends_with("gone_kb.md")));
    }

    #[test]
    fn test_cascade_reaches_the_root() {
        let f = fixture();
        let ctx = discover(&f);
        let report = DecisionEngine::new(&f.config, &f.cache)
            .evaluate(&ctx)
            .unwrap();
        // Every ancestor of a rebuilt directory is itself rebuilt
        for (path, decision) in &report.dirs {
            if decision.outcome == RebuildOutcome::CreateDirectoryKb && path != &f.root {
                let parent = path.parent().unwrap();
                let parent_decision = report.dirs.get(parent).unwrap();
                assert_eq!(parent_decision.outcome, RebuildOutcome::CreateDirectoryKb);
            }
        }
    }
}
