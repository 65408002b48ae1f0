//! Execution planning
//!
//! Converts a [`DecisionReport`](crate::decision::DecisionReport) into a
//! validated DAG of atomic tasks. Five phases emit tasks in priority
//! classes: cleanup (100), cache structure (90), file tasks (50),
//! directory tasks (30), verification (10). Task ids are sanitised
//! relative paths; a collision is a bug and fails the plan.

use crate::context::DirectoryContext;
use crate::decision::{DecisionReport, DeletionKind, RebuildOutcome};
use crate::error::{IndexError, Result};
use crate::paths::{sanitize_identifier, PathMapper};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::debug;

// ============================================================================
// Task Types
// ============================================================================

/// Everything the executor knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    AnalyzeFileLlm,
    SkipFileCached,
    CreateDirectoryKb,
    SkipDirectoryFresh,
    DeleteOrphanedFile,
    DeleteOrphanedDirectory,
    CreateCacheStructure,
    VerifyCacheFreshness,
    VerifyKbFreshness,
}

impl TaskType {
    /// Priority class of the plan phase this task belongs to
    pub fn priority(&self) -> u8 {
        match self {
            TaskType::DeleteOrphanedFile | TaskType::DeleteOrphanedDirectory => 100,
            TaskType::CreateCacheStructure => 90,
            TaskType::AnalyzeFileLlm | TaskType::SkipFileCached => 50,
            TaskType::CreateDirectoryKb | TaskType::SkipDirectoryFresh => 30,
            TaskType::VerifyCacheFreshness | TaskType::VerifyKbFreshness => 10,
        }
    }

    /// Rough duration estimate in seconds, used for scheduling order and
    /// the plan-level estimate; LLM-bound tasks dominate
    pub fn estimated_duration_secs(&self) -> f64 {
        match self {
            TaskType::AnalyzeFileLlm => 30.0,
            TaskType::CreateDirectoryKb => 20.0,
            TaskType::DeleteOrphanedFile | TaskType::DeleteOrphanedDirectory => 0.1,
            TaskType::CreateCacheStructure => 0.05,
            TaskType::VerifyCacheFreshness | TaskType::VerifyKbFreshness => 0.05,
            TaskType::SkipFileCached | TaskType::SkipDirectoryFresh => 0.01,
        }
    }

    /// Whether running this task spends an LLM call
    pub fn is_llm(&self) -> bool {
        matches!(self, TaskType::AnalyzeFileLlm | TaskType::CreateDirectoryKb)
    }
}

/// Typed metadata attached to each task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Decision reason, for reporting
    pub reason: String,
    /// Set on deletion tasks; deletion is refused unless true
    pub is_safe_to_delete: bool,
}

/// Smallest executable unit: typed target, dependencies, side effects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicTask {
    pub id: String,
    pub task_type: TaskType,
    pub target: PathBuf,
    pub dependencies: Vec<String>,
    pub priority: u8,
    pub estimated_duration_secs: f64,
    pub metadata: TaskMetadata,
}

impl AtomicTask {
    fn new(id: String, task_type: TaskType, target: PathBuf) -> Self {
        Self {
            id,
            priority: task_type.priority(),
            estimated_duration_secs: task_type.estimated_duration_secs(),
            task_type,
            target,
            dependencies: Vec::new(),
            metadata: TaskMetadata::default(),
        }
    }

    fn with_deps(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.metadata.reason = reason.into();
        self
    }
}

// ============================================================================
// Execution Plan
// ============================================================================

/// Validated, acyclic, dependency-closed collection of tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub tasks: Vec<AtomicTask>,
    pub expected_llm_calls: usize,
    pub estimated_duration_secs: f64,
}

impl ExecutionPlan {
    /// Validate and seal a task list into a plan
    ///
    /// Checks id uniqueness, dependency closure, and acyclicity; computes
    /// the expected LLM call count and the duration estimate.
    pub fn build(tasks: Vec<AtomicTask>) -> Result<Self> {
        let mut ids = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            if !ids.insert(task.id.as_str()) {
                return Err(IndexError::PlanValidation(format!(
                    "task id collision: {}",
                    task.id
                )));
            }
        }
        for task in &tasks {
            for dep in &task.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(IndexError::PlanValidation(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
            }
        }

        let plan = Self {
            expected_llm_calls: tasks.iter().filter(|t| t.task_type.is_llm()).count(),
            estimated_duration_secs: tasks
                .iter()
                .map(|t| t.estimated_duration_secs)
                .sum(),
            tasks,
        };
        plan.execution_waves()?;
        Ok(plan)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task count per type, for previews and summaries
    pub fn counts_by_type(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for task in &self.tasks {
            *counts
                .entry(format!("{:?}", task.task_type))
                .or_insert(0usize) += 1;
        }
        counts
    }

    /// Topological waves: every task in wave `n` depends only on tasks in
    /// earlier waves. Fails with a cycle error if the graph is not a DAG.
    pub fn execution_waves(&self) -> Result<Vec<Vec<&AtomicTask>>> {
        let index: HashMap<&str, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.tasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for (i, task) in self.tasks.iter().enumerate() {
            in_degree[i] = task.dependencies.len();
            for dep in &task.dependencies {
                dependents[index[dep.as_str()]].push(i);
            }
        }

        let mut current: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut waves = Vec::new();
        let mut visited = 0usize;

        while !current.is_empty() {
            let mut wave = Vec::with_capacity(current.len());
            let mut next = VecDeque::new();
            while let Some(i) = current.pop_front() {
                visited += 1;
                wave.push(&self.tasks[i]);
                for &dep in &dependents[i] {
                    in_degree[dep] -= 1;
                    if in_degree[dep] == 0 {
                        next.push_back(dep);
                    }
                }
            }
            waves.push(wave);
            current = next;
        }

        if visited != self.tasks.len() {
            return Err(IndexError::PlanValidation(format!(
                "dependency cycle among {} tasks",
                self.tasks.len() - visited
            )));
        }
        Ok(waves)
    }
}

// ============================================================================
// Plan Generator
// ============================================================================

/// Builds an [`ExecutionPlan`] from a decision report
pub struct PlanGenerator<'a> {
    mapper: &'a PathMapper,
}

impl<'a> PlanGenerator<'a> {
    pub fn new(mapper: &'a PathMapper) -> Self {
        Self { mapper }
    }

    /// Five phases, in order; the output is validated before handoff
    pub fn generate(
        &self,
        report: &DecisionReport,
        root: &DirectoryContext,
    ) -> Result<ExecutionPlan> {
        let mut tasks: Vec<AtomicTask> = Vec::new();

        // Phase 1: cleanup
        let mut cleanup_ids: Vec<(PathBuf, String)> = Vec::new();
        for deletion in &report.deletions {
            let task_type = match deletion.kind {
                DeletionKind::OrphanedDirectory => TaskType::DeleteOrphanedDirectory,
                _ => TaskType::DeleteOrphanedFile,
            };
            let id = format!("cleanup_{}", self.ident(&deletion.target));
            let mut task = AtomicTask::new(id.clone(), task_type, deletion.target.clone())
                .with_reason(format!("{:?}", deletion.kind));
            task.metadata.is_safe_to_delete = deletion.is_safe_to_delete;
            cleanup_ids.push((deletion.target.clone(), id));
            tasks.push(task);
        }

        // Phase 2: cache structure, one task per unique analysis directory
        // that will receive writes
        let mut mkdir_for_dir: HashMap<PathBuf, String> = HashMap::new();
        for (path, decision) in &report.files {
            if decision.outcome != RebuildOutcome::AnalyzeFile {
                continue;
            }
            let artifact = self.mapper.analysis_path(path)?;
            let cache_dir = artifact
                .parent()
                .ok_or_else(|| IndexError::PlanValidation("artifact without parent".into()))?
                .to_path_buf();
            if mkdir_for_dir.contains_key(&cache_dir) {
                continue;
            }
            let id = format!("mkdir_{}", self.ident(&cache_dir));
            // A deletion that frees this namespace must land first
            let deps: Vec<String> = cleanup_ids
                .iter()
                .filter(|(target, _)| {
                    cache_dir.starts_with(target) || target.starts_with(&cache_dir)
                })
                .map(|(_, id)| id.clone())
                .collect();
            tasks.push(
                AtomicTask::new(id.clone(), TaskType::CreateCacheStructure, cache_dir.clone())
                    .with_deps(deps),
            );
            mkdir_for_dir.insert(cache_dir, id);
        }

        // Phase 3: file tasks
        let mut file_task_ids: HashMap<PathBuf, String> = HashMap::new();
        for (path, decision) in &report.files {
            let (task_type, prefix) = match decision.outcome {
                RebuildOutcome::AnalyzeFile => (TaskType::AnalyzeFileLlm, "analyze"),
                RebuildOutcome::SkipFileCached => (TaskType::SkipFileCached, "skipfile"),
                _ => continue,
            };
            let id = format!("{}_{}", prefix, self.ident(path));
            let mut task = AtomicTask::new(id.clone(), task_type, path.clone())
                .with_reason(format!("{:?}", decision.reason));
            if task_type == TaskType::AnalyzeFileLlm {
                let artifact = self.mapper.analysis_path(path)?;
                if let Some(parent) = artifact.parent() {
                    if let Some(mkdir_id) = mkdir_for_dir.get(parent) {
                        task.dependencies.push(mkdir_id.clone());
                    }
                }
            }
            file_task_ids.insert(path.clone(), id);
            tasks.push(task);
        }

        // Phase 4: directory tasks, leaves first so child ids exist
        let mut dir_task_ids: HashMap<PathBuf, String> = HashMap::new();
        root.visit_leaves_first(&mut |dir| {
            let Some(decision) = report.dirs.get(&dir.path) else {
                return;
            };
            let (task_type, prefix) = match decision.outcome {
                RebuildOutcome::CreateDirectoryKb => (TaskType::CreateDirectoryKb, "kb"),
                RebuildOutcome::SkipDirectoryFresh => (TaskType::SkipDirectoryFresh, "skipdir"),
                _ => return,
            };
            let id = format!("{}_{}", prefix, self.ident(&dir.path));
            let mut deps: Vec<String> = dir
                .files
                .iter()
                .filter_map(|f| file_task_ids.get(&f.path).cloned())
                .collect();
            deps.extend(
                dir.subdirs
                    .iter()
                    .filter_map(|s| dir_task_ids.get(&s.path).cloned()),
            );
            dir_task_ids.insert(dir.path.clone(), id.clone());
            tasks.push(
                AtomicTask::new(id, task_type, dir.path.clone())
                    .with_deps(deps)
                    .with_reason(format!("{:?}", decision.reason)),
            );
        });

        // Phase 5: verification
        for (path, decision) in &report.files {
            if decision.outcome != RebuildOutcome::AnalyzeFile {
                continue;
            }
            let analyze_id = file_task_ids[path].clone();
            tasks.push(
                AtomicTask::new(
                    format!("verify_{}", self.ident(path)),
                    TaskType::VerifyCacheFreshness,
                    path.clone(),
                )
                .with_deps(vec![analyze_id]),
            );
        }
        for (path, decision) in &report.dirs {
            if decision.outcome != RebuildOutcome::CreateDirectoryKb {
                continue;
            }
            let kb_id = dir_task_ids[path].clone();
            tasks.push(
                AtomicTask::new(
                    format!("verifykb_{}", self.ident(path)),
                    TaskType::VerifyKbFreshness,
                    path.clone(),
                )
                .with_deps(vec![kb_id]),
            );
        }

        debug!("Generated {} tasks", tasks.len());
        ExecutionPlan::build(tasks)
    }

    /// Identifier from a path, relative to whichever root contains it
    fn ident(&self, path: &Path) -> String {
        let rel = path
            .strip_prefix(self.mapper.out_root())
            .or_else(|_| path.strip_prefix(self.mapper.source_root()))
            .unwrap_or(path);
        sanitize_identifier(&rel.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AnalysisCache;
    use crate::config::{HandlerType, IndexingConfig};
    use crate::decision::DecisionEngine;
    use crate::discovery::Discovery;
    use std::fs;
    use tempfile::TempDir;

    fn plan_for_cold_tree() -> (TempDir, ExecutionPlan) {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("src");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), "alpha").unwrap();
        fs::write(root.join("b.txt"), "beta").unwrap();
        fs::write(root.join("sub/c.txt"), "gamma").unwrap();

        let config = IndexingConfig::default_for(HandlerType::ProjectBase);
        let mapper = PathMapper::new(
            root,
            temp.path().join("out"),
            HandlerType::ProjectBase,
        )
        .unwrap();
        let cache = AnalysisCache::new(mapper.clone());
        let ctx = Discovery::new(&config, &mapper).discover().unwrap();
        let report = DecisionEngine::new(&config, &cache).evaluate(&ctx).unwrap();
        let plan = PlanGenerator::new(&mapper).generate(&report, &ctx).unwrap();
        (temp, plan)
    }

    #[test]
    fn test_cold_plan_shape() {
        let (_temp, plan) = plan_for_cold_tree();
        let counts = plan.counts_by_type();
        assert_eq!(counts["AnalyzeFileLlm"], 3);
        assert_eq!(counts["CreateDirectoryKb"], 2);
        assert_eq!(counts["CreateCacheStructure"], 2);
        assert_eq!(counts["VerifyCacheFreshness"], 3);
        assert_eq!(counts["VerifyKbFreshness"], 2);
        assert_eq!(plan.expected_llm_calls, 5);
    }

    #[test]
    fn test_parent_kb_waits_for_every_descendant() {
        let (_temp, plan) = plan_for_cold_tree();
        let root_kb = plan
            .tasks
            .iter()
            .find(|t| t.task_type == TaskType::CreateDirectoryKb && t.id == "kb_root")
            .expect("root kb task");
        // Depends on both root files and the sub directory task
        assert!(root_kb.dependencies.iter().any(|d| d.contains("a_txt")));
        assert!(root_kb.dependencies.iter().any(|d| d.contains("b_txt")));
        assert!(root_kb.dependencies.iter().any(|d| d == "kb_sub"));
        // But never on the grandchild file directly
        assert!(!root_kb.dependencies.iter().any(|d| d.contains("c_txt")));
    }

    #[test]
    fn test_analyze_depends_on_cache_structure() {
        let (_temp, plan) = plan_for_cold_tree();
        let analyze = plan
            .tasks
            .iter()
            .find(|t| t.id == "analyze_sub_c_txt")
            .unwrap();
        assert!(analyze.dependencies.iter().any(|d| d.starts_with("mkdir_")));
    }

    #[test]
    fn test_waves_respect_dependencies() {
        let (_temp, plan) = plan_for_cold_tree();
        let waves = plan.execution_waves().unwrap();
        let wave_of = |id: &str| {
            waves
                .iter()
                .position(|w| w.iter().any(|t| t.id == id))
                .unwrap()
        };
        assert!(wave_of("analyze_sub_c_txt") < wave_of("kb_sub"));
        assert!(wave_of("kb_sub") < wave_of("kb_root"));
    }

    #[test]
    fn test_unknown_dependency_fails_validation() {
        let task = AtomicTask::new("a".into(), TaskType::SkipFileCached, "/x".into())
            .with_deps(vec!["ghost".into()]);
        let err = ExecutionPlan::build(vec![task]).unwrap_err();
        assert!(matches!(err, IndexError::PlanValidation(_)));
    }

    #[test]
    fn test_id_collision_fails_validation() {
        let a = AtomicTask::new("dup".into(), TaskType::SkipFileCached, "/x".into());
        let b = AtomicTask::new("dup".into(), TaskType::SkipFileCached, "/y".into());
        let err = ExecutionPlan::build(vec![a, b]).unwrap_err();
        assert!(matches!(err, IndexError::PlanValidation(_)));
    }

    #[test]
    fn test_cycle_fails_validation() {
        let a = AtomicTask::new("a".into(), TaskType::SkipFileCached, "/x".into())
            .with_deps(vec!["b".into()]);
        let b = AtomicTask::new("b".into(), TaskType::SkipFileCached, "/y".into())
            .with_deps(vec!["a".into()]);
        let err = ExecutionPlan::build(vec![a, b]).unwrap_err();
        assert!(matches!(err, IndexError::PlanValidation(_)));
    }

    #[test]
    fn test_estimated_duration_is_summed() {
        let (_temp, plan) = plan_for_cold_tree();
        let expected: f64 = plan
            .tasks
            .iter()
            .map(|t| t.estimated_duration_secs)
            .sum();
        assert!((plan.estimated_duration_secs - expected).abs() < f64::EPSILON);
    }
}
