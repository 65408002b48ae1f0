//! End-to-end pipeline tests against a stubbed LLM provider
//!
//! Cold run, unchanged re-run, single-file touch, source deletion,
//! truncation handling, and plan cycle rejection.

use async_trait::async_trait;
use jesse_kb::cache::AnalysisCache;
use jesse_kb::config::{HandlerType, IndexingConfig};
use jesse_kb::decision::{DecisionEngine, RebuildOutcome, RebuildReason};
use jesse_kb::discovery::Discovery;
use jesse_kb::error::{IndexError, Result};
use jesse_kb::executor::ExecutionResults;
use jesse_kb::indexer::{exit_code_for, Indexer};
use jesse_kb::llm::{AnalysisProvider, CompletedAnalysis};
use jesse_kb::paths::PathMapper;
use jesse_kb::plan::{AtomicTask, ExecutionPlan, TaskType};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

// ============================================================================
// Harness
// ============================================================================

/// Stub provider: deterministic analyses, optional truncation per path
struct StubProvider {
    truncate: HashSet<PathBuf>,
}

impl StubProvider {
    fn clean() -> Self {
        Self {
            truncate: HashSet::new(),
        }
    }

    fn truncating(paths: &[&Path]) -> Self {
        Self {
            truncate: paths.iter().map(|p| p.to_path_buf()).collect(),
        }
    }
}

#[async_trait]
impl AnalysisProvider for StubProvider {
    async fn analyze_file(&self, path: &Path, content: &str) -> Result<CompletedAnalysis> {
        if self.truncate.contains(path) {
            return Err(IndexError::TruncationDetected {
                target: path.to_path_buf(),
                attempts: 3,
            });
        }
        Ok(CompletedAnalysis {
            text: format!(
                "## Purpose\n\nAnalysis of {} ({} bytes).\n\n## Contents\n\nStub.",
                path.display(),
                content.len()
            ),
            reviewer_compliant: true,
            continuation_attempts: 0,
        })
    }

    async fn summarize_directory(&self, path: &Path, _digest: &str) -> Result<CompletedAnalysis> {
        Ok(CompletedAnalysis {
            text: format!("Directory {} holds stub content.", path.display()),
            reviewer_compliant: true,
            continuation_attempts: 0,
        })
    }
}

struct Harness {
    _temp: TempDir,
    root: PathBuf,
    out: PathBuf,
    config: Arc<IndexingConfig>,
}

impl Harness {
    /// Source tree `src/{a.txt, b.txt, sub/c.txt}`, empty output
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("src");
        let out = temp.path().join("out");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), "alpha").unwrap();
        fs::write(root.join("b.txt"), "beta").unwrap();
        fs::write(root.join("sub/c.txt"), "gamma").unwrap();
        Self {
            _temp: temp,
            root,
            out,
            config: Arc::new(IndexingConfig::default_for(HandlerType::ProjectBase)),
        }
    }

    fn mapper(&self) -> PathMapper {
        PathMapper::new(self.root.clone(), self.out.clone(), HandlerType::ProjectBase).unwrap()
    }

    fn indexer(&self, provider: Arc<dyn AnalysisProvider>) -> Indexer {
        Indexer::with_provider(self.config.clone(), self.mapper(), provider)
    }

    async fn run(&self, provider: Arc<dyn AnalysisProvider>) -> ExecutionResults {
        self.indexer(provider).run().await.unwrap()
    }

    fn analysis_path(&self, rel: &str) -> PathBuf {
        self.out
            .join("project-base")
            .join(format!("{}.analysis.md", rel))
    }

    fn root_kb(&self) -> PathBuf {
        self.out.join("project-base/root_kb.md")
    }

    /// Bump a source file's mtime past its cached artifact's
    fn touch(&self, rel: &str) {
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let path = self.root.join(rel);
        let content = fs::read(&path).unwrap();
        fs::write(&path, content).unwrap();
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn s1_cold_run_builds_everything() {
    let h = Harness::new();
    let results = h.run(Arc::new(StubProvider::clean())).await;

    assert!(results.is_clean());
    assert_eq!(results.llm_calls_made, 5);
    assert_eq!(results.files_processed, 3);
    assert_eq!(results.dirs_processed, 2);

    for rel in ["a.txt", "b.txt", "sub/c.txt"] {
        assert!(h.analysis_path(rel).is_file(), "missing artifact for {}", rel);
    }
    assert!(h.root.join("sub_kb.md").is_file());
    assert!(h.root_kb().is_file());

    let kb = fs::read_to_string(h.root_kb()).unwrap();
    assert!(kb.contains("{PROJECT_ROOT}/a.txt"));
    assert!(kb.contains("{PROJECT_ROOT}/sub"));
    assert_eq!(exit_code_for(&results), 0);
}

#[tokio::test]
async fn s2_rerun_unchanged_makes_no_llm_calls() {
    let h = Harness::new();
    h.run(Arc::new(StubProvider::clean())).await;

    let results = h.run(Arc::new(StubProvider::clean())).await;
    assert!(results.is_clean());
    assert_eq!(results.llm_calls_made, 0);
    assert_eq!(results.files_processed, 0);
    assert_eq!(results.dirs_processed, 0);
    let count = |task_type: TaskType| {
        results
            .completed
            .iter()
            .filter(|t| t.task_type == task_type)
            .count()
    };
    assert_eq!(count(TaskType::SkipFileCached), 3);
    assert_eq!(count(TaskType::SkipDirectoryFresh), 2);
}

#[tokio::test]
async fn s3_touching_one_file_rebuilds_its_ancestry_only() {
    let h = Harness::new();
    h.run(Arc::new(StubProvider::clean())).await;
    h.touch("a.txt");

    // Decisions first, then the run
    let mapper = h.mapper();
    let cache = AnalysisCache::new(mapper.clone());
    let ctx = Discovery::new(&h.config, &mapper).discover().unwrap();
    let report = DecisionEngine::new(&h.config, &cache).evaluate(&ctx).unwrap();

    let a = report.files.get(&h.root.join("a.txt")).unwrap();
    assert_eq!(a.outcome, RebuildOutcome::AnalyzeFile);
    assert_eq!(a.reason, RebuildReason::SourceNewerThanCache);
    for rel in ["b.txt", "sub/c.txt"] {
        let decision = report.files.get(&h.root.join(rel)).unwrap();
        assert_eq!(decision.outcome, RebuildOutcome::SkipFileCached);
    }
    let root_decision = report.dirs.get(&h.root).unwrap();
    assert_eq!(root_decision.outcome, RebuildOutcome::CreateDirectoryKb);
    assert_eq!(root_decision.reason, RebuildReason::CascadedFromChild);
    let sub_decision = report.dirs.get(&h.root.join("sub")).unwrap();
    assert_eq!(sub_decision.outcome, RebuildOutcome::SkipDirectoryFresh);

    let results = h.run(Arc::new(StubProvider::clean())).await;
    assert!(results.is_clean());
    assert_eq!(results.llm_calls_made, 2);
}

#[tokio::test]
async fn s4_deleting_a_source_removes_its_artifact_and_rebuilds_the_parent() {
    let h = Harness::new();
    h.run(Arc::new(StubProvider::clean())).await;
    assert!(h.analysis_path("b.txt").is_file());

    fs::remove_file(h.root.join("b.txt")).unwrap();
    let results = h.run(Arc::new(StubProvider::clean())).await;

    assert!(results.is_clean());
    assert_eq!(results.llm_calls_made, 1);
    assert_eq!(results.dirs_processed, 1);
    assert_eq!(results.files_deleted, 1);
    assert!(!h.analysis_path("b.txt").exists());

    let kb = fs::read_to_string(h.root_kb()).unwrap();
    assert!(!kb.contains("/b.txt"));
    assert!(kb.contains("{PROJECT_ROOT}/a.txt"));
}

#[tokio::test]
async fn s5_truncation_withholds_the_artifact_and_spares_the_parent() {
    let h = Harness::new();
    let a_path = h.root.join("a.txt");
    let results = h
        .indexer(Arc::new(StubProvider::truncating(&[&a_path])))
        .run()
        .await
        .unwrap();

    assert_eq!(results.truncations, 1);
    assert_eq!(results.failed.len(), 1);
    assert_eq!(results.failed[0].task_type, TaskType::AnalyzeFileLlm);
    assert!(!h.analysis_path("a.txt").exists());

    // The parent knowledge file was still built, from {b, c} only
    let kb = fs::read_to_string(h.root_kb()).unwrap();
    assert!(!kb.contains("/a.txt"));
    assert!(kb.contains("{PROJECT_ROOT}/b.txt"));
    assert!(kb.contains("{PROJECT_ROOT}/sub"));

    // Its verification was skipped, not failed
    assert!(results
        .skipped
        .iter()
        .any(|t| t.task_type == TaskType::VerifyCacheFreshness));
    assert_eq!(exit_code_for(&results), 2);
}

#[tokio::test]
async fn s6_synthetic_cycle_fails_validation_before_dispatch() {
    let first = AtomicTask {
        id: "first".into(),
        task_type: TaskType::SkipFileCached,
        target: "/x".into(),
        dependencies: vec!["second".into()],
        priority: 50,
        estimated_duration_secs: 0.01,
        metadata: Default::default(),
    };
    let second = AtomicTask {
        id: "second".into(),
        task_type: TaskType::SkipFileCached,
        target: "/y".into(),
        dependencies: vec!["first".into()],
        priority: 50,
        estimated_duration_secs: 0.01,
        metadata: Default::default(),
    };

    let err = ExecutionPlan::build(vec![first, second]).unwrap_err();
    assert!(matches!(err, IndexError::PlanValidation(_)));
    assert_eq!(err.exit_code(), 1);
}

// ============================================================================
// Cross-cutting invariants
// ============================================================================

#[tokio::test]
async fn truncated_file_recovers_on_the_next_run() {
    let h = Harness::new();
    let a_path = h.root.join("a.txt");
    h.indexer(Arc::new(StubProvider::truncating(&[&a_path])))
        .run()
        .await
        .unwrap();
    assert!(!h.analysis_path("a.txt").exists());

    // A clean provider on the next run fills the gap and repairs the KB
    let results = h.run(Arc::new(StubProvider::clean())).await;
    assert!(results.is_clean());
    assert!(h.analysis_path("a.txt").is_file());
    let kb = fs::read_to_string(h.root_kb()).unwrap();
    assert!(kb.contains("{PROJECT_ROOT}/a.txt"));
}

#[tokio::test]
async fn no_two_tasks_write_the_same_output_path() {
    let h = Harness::new();
    let mapper = h.mapper();
    let cache = AnalysisCache::new(mapper.clone());
    let ctx = Discovery::new(&h.config, &mapper).discover().unwrap();
    let report = DecisionEngine::new(&h.config, &cache).evaluate(&ctx).unwrap();
    let plan = jesse_kb::plan::PlanGenerator::new(&mapper)
        .generate(&report, &ctx)
        .unwrap();

    let mut outputs: HashSet<PathBuf> = HashSet::new();
    for task in &plan.tasks {
        let written = match task.task_type {
            TaskType::AnalyzeFileLlm => Some(mapper.analysis_path(&task.target).unwrap()),
            TaskType::CreateDirectoryKb => Some(mapper.knowledge_path(&task.target).unwrap()),
            _ => None,
        };
        if let Some(path) = written {
            assert!(outputs.insert(path), "duplicate writer in plan");
        }
    }
}

#[tokio::test]
async fn empty_directories_never_produce_knowledge_files() {
    let h = Harness::new();
    fs::create_dir_all(h.root.join("hollow/inner")).unwrap();

    let results = h.run(Arc::new(StubProvider::clean())).await;
    assert!(results.is_clean());
    assert!(!h.root.join("hollow_kb.md").exists());
    assert!(!h.root.join("hollow/inner_kb.md").exists());

    // And a second run still makes no LLM calls for them
    let results = h.run(Arc::new(StubProvider::clean())).await;
    assert_eq!(results.llm_calls_made, 0);
}
