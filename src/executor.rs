//! Plan execution
//!
//! Consumes a validated [`ExecutionPlan`] and runs it with bounded
//! concurrency in dependency-respecting order. A task is ready when all
//! of its dependencies completed; within the ready set tasks are
//! dispatched by priority (descending), then estimated duration
//! (ascending). Dispatch is not preemptive.
//!
//! Failure policy: a technical failure marks the task failed and skips
//! its dependents transitively (or aborts the run when
//! `continue_on_file_errors` is off). A truncated LLM response is a task
//! failure that writes no artifact, but its dependents still run: the
//! parent summary is simply built without the missing file.

use crate::cache::AnalysisCache;
use crate::config::IndexingConfig;
use crate::context::DirectoryContext;
use crate::error::{IndexError, Result};
use crate::llm::AnalysisProvider;
use crate::plan::{AtomicTask, ExecutionPlan, TaskType};
use crate::renderer::{self, FileSection, SubdirSection};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

// ============================================================================
// Results & Progress
// ============================================================================

/// Outcome record for one task
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub id: String,
    pub task_type: TaskType,
    pub target: PathBuf,
    pub message: String,
}

/// Aggregate results of one run
#[derive(Debug, Default)]
pub struct ExecutionResults {
    pub completed: Vec<TaskOutcome>,
    pub failed: Vec<TaskOutcome>,
    pub skipped: Vec<TaskOutcome>,
    pub duration: Duration,
    pub llm_calls_made: usize,
    pub files_processed: usize,
    pub dirs_processed: usize,
    pub files_deleted: usize,
    /// Analyses accepted despite a non-compliant reviewer verdict
    pub non_compliant: usize,
    /// Tasks that failed with a truncated LLM response
    pub truncations: usize,
}

impl ExecutionResults {
    pub fn total(&self) -> usize {
        self.completed.len() + self.failed.len() + self.skipped.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Observable scheduler state, cloneable for host polling
#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub running: usize,
    pub ready: usize,
    pub current: Vec<String>,
}

/// Side-effect-free description of how a plan would execute
#[derive(Debug)]
pub struct PlanPreview {
    /// Task ids in dispatch order, wave by wave
    pub order: Vec<String>,
    pub total_waves: usize,
    pub counts_by_type: BTreeMap<String, usize>,
    pub expected_llm_calls: usize,
    pub estimated_duration_secs: f64,
}

// ============================================================================
// Engine
// ============================================================================

/// Shared context handed to every spawned task
struct TaskCtx {
    config: Arc<IndexingConfig>,
    cache: AnalysisCache,
    provider: Arc<dyn AnalysisProvider>,
    root: Arc<DirectoryContext>,
    llm_calls: AtomicUsize,
    non_compliant: AtomicUsize,
}

/// Dependency-respecting bounded-concurrency task scheduler
pub struct ExecutionEngine {
    ctx: Arc<TaskCtx>,
    progress: Arc<RwLock<ProgressSnapshot>>,
}

impl ExecutionEngine {
    pub fn new(
        config: Arc<IndexingConfig>,
        cache: AnalysisCache,
        provider: Arc<dyn AnalysisProvider>,
        root: Arc<DirectoryContext>,
    ) -> Self {
        Self {
            ctx: Arc::new(TaskCtx {
                config,
                cache,
                provider,
                root,
                llm_calls: AtomicUsize::new(0),
                non_compliant: AtomicUsize::new(0),
            }),
            progress: Arc::new(RwLock::new(ProgressSnapshot::default())),
        }
    }

    /// Current scheduler state
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.read().expect("progress poisoned").clone()
    }

    /// Walk the plan without dispatching anything
    pub fn preview(&self, plan: &ExecutionPlan) -> Result<PlanPreview> {
        let waves = plan.execution_waves()?;
        let mut order = Vec::with_capacity(plan.len());
        for wave in &waves {
            let mut ids: Vec<&AtomicTask> = wave.clone();
            ids.sort_by(|a, b| {
                b.priority.cmp(&a.priority).then(
                    a.estimated_duration_secs
                        .partial_cmp(&b.estimated_duration_secs)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
            });
            order.extend(ids.iter().map(|t| t.id.clone()));
        }
        Ok(PlanPreview {
            order,
            total_waves: waves.len(),
            counts_by_type: plan.counts_by_type(),
            expected_llm_calls: plan.expected_llm_calls,
            estimated_duration_secs: plan.estimated_duration_secs,
        })
    }

    /// Execute the plan to completion
    pub async fn execute(&self, plan: ExecutionPlan) -> Result<ExecutionResults> {
        let started = Instant::now();
        let total = plan.len();
        let continue_on_errors = self.ctx.config.error_handling.continue_on_file_errors;
        let semaphore = Arc::new(Semaphore::new(
            self.ctx.config.file_processing.max_concurrent_operations,
        ));

        let mut pending: HashMap<String, AtomicTask> =
            plan.tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        let mut completed: HashSet<String> = HashSet::new();
        // Truncation failures satisfy dependents; the artifact is simply
        // absent downstream
        let mut satisfied_failures: HashSet<String> = HashSet::new();
        let mut blocked: HashSet<String> = HashSet::new();

        let mut results = ExecutionResults::default();
        let mut join_set: JoinSet<(AtomicTask, Result<String>)> = JoinSet::new();
        let mut abort: Option<IndexError> = None;

        {
            let mut progress = self.progress.write().expect("progress poisoned");
            *progress = ProgressSnapshot {
                total,
                ..ProgressSnapshot::default()
            };
        }

        loop {
            if abort.is_none() {
                // Transitively skip tasks whose dependencies failed. A
                // truncated dependency blocks only its verification task;
                // everything else downstream still runs.
                loop {
                    let newly_skipped: Vec<String> = pending
                        .values()
                        .filter(|t| {
                            t.dependencies.iter().any(|d| blocked.contains(d))
                                || (matches!(
                                    t.task_type,
                                    TaskType::VerifyCacheFreshness | TaskType::VerifyKbFreshness
                                ) && t
                                    .dependencies
                                    .iter()
                                    .any(|d| satisfied_failures.contains(d)))
                        })
                        .map(|t| t.id.clone())
                        .collect();
                    if newly_skipped.is_empty() {
                        break;
                    }
                    for id in newly_skipped {
                        let task = pending.remove(&id).expect("skipped task pending");
                        warn!("Skipping {} (ancestor failed)", task.id);
                        blocked.insert(task.id.clone());
                        results.skipped.push(TaskOutcome {
                            id: task.id,
                            task_type: task.task_type,
                            target: task.target,
                            message: "ancestor_failed".into(),
                        });
                    }
                }

                // Dispatch everything ready, priority first; the semaphore
                // is FIFO so acquisition follows spawn order
                let mut ready: Vec<String> = pending
                    .values()
                    .filter(|t| {
                        t.dependencies
                            .iter()
                            .all(|d| completed.contains(d) || satisfied_failures.contains(d))
                    })
                    .map(|t| t.id.clone())
                    .collect();
                ready.sort_by(|a, b| {
                    let (ta, tb) = (&pending[a], &pending[b]);
                    tb.priority.cmp(&ta.priority).then(
                        ta.estimated_duration_secs
                            .partial_cmp(&tb.estimated_duration_secs)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                });

                {
                    let mut progress = self.progress.write().expect("progress poisoned");
                    progress.ready = ready.len();
                }

                for id in ready {
                    let task = pending.remove(&id).expect("ready task pending");
                    let ctx = self.ctx.clone();
                    let semaphore = semaphore.clone();
                    debug!("Dispatching {} ({:?})", task.id, task.task_type);
                    {
                        let mut progress = self.progress.write().expect("progress poisoned");
                        progress.running += 1;
                        progress.current.push(task.id.clone());
                    }
                    join_set.spawn(async move {
                        let _permit = semaphore
                            .acquire()
                            .await
                            .expect("semaphore closed while executing");
                        let outcome = run_task(&ctx, &task).await;
                        (task, outcome)
                    });
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            let (task, outcome) = match joined {
                Ok(pair) => pair,
                Err(join_err) => {
                    error!("Task panicked: {}", join_err);
                    if !continue_on_errors && abort.is_none() {
                        abort = Some(IndexError::other(format!("task panicked: {}", join_err)));
                    }
                    continue;
                }
            };

            {
                let mut progress = self.progress.write().expect("progress poisoned");
                progress.running = progress.running.saturating_sub(1);
                progress.current.retain(|id| id != &task.id);
            }

            match outcome {
                Ok(message) => {
                    completed.insert(task.id.clone());
                    let done = {
                        let mut progress = self.progress.write().expect("progress poisoned");
                        progress.completed += 1;
                        progress.completed
                    };
                    let batch = self.ctx.config.file_processing.batch_size.max(1);
                    if done % batch == 0 || done == total {
                        info!("Progress: {}/{} tasks completed", done, total);
                    }
                    match task.task_type {
                        TaskType::AnalyzeFileLlm => results.files_processed += 1,
                        TaskType::CreateDirectoryKb => results.dirs_processed += 1,
                        TaskType::DeleteOrphanedFile | TaskType::DeleteOrphanedDirectory => {
                            results.files_deleted += 1
                        }
                        _ => {}
                    }
                    results.completed.push(TaskOutcome {
                        id: task.id,
                        task_type: task.task_type,
                        target: task.target,
                        message,
                    });
                }
                Err(err) => {
                    let truncation = err.is_truncation();
                    error!("Task {} failed: {}", task.id, err);
                    {
                        let mut progress = self.progress.write().expect("progress poisoned");
                        progress.failed += 1;
                    }
                    if truncation {
                        results.truncations += 1;
                        satisfied_failures.insert(task.id.clone());
                    } else {
                        blocked.insert(task.id.clone());
                        if !continue_on_errors && abort.is_none() {
                            abort = Some(err_for_abort(&err, &task));
                        }
                    }
                    results.failed.push(TaskOutcome {
                        id: task.id,
                        task_type: task.task_type,
                        target: task.target,
                        message: err.to_string(),
                    });
                }
            }
        }

        // Anything still pending when we stop dispatching is recorded as
        // skipped so the summary accounts for every task
        for (_, task) in pending.drain() {
            results.skipped.push(TaskOutcome {
                id: task.id,
                task_type: task.task_type,
                target: task.target,
                message: if abort.is_some() {
                    "run_aborted".into()
                } else {
                    "ancestor_failed".into()
                },
            });
        }

        {
            let mut progress = self.progress.write().expect("progress poisoned");
            progress.skipped = results.skipped.len();
            progress.ready = 0;
            progress.current.clear();
        }

        results.duration = started.elapsed();
        results.llm_calls_made = self.ctx.llm_calls.load(Ordering::Relaxed);
        results.non_compliant = self.ctx.non_compliant.load(Ordering::Relaxed);

        info!(
            "Run finished in {:?}: {} completed, {} failed, {} skipped, {} LLM calls",
            results.duration,
            results.completed.len(),
            results.failed.len(),
            results.skipped.len(),
            results.llm_calls_made
        );

        match abort {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }
}

fn err_for_abort(err: &IndexError, task: &AtomicTask) -> IndexError {
    IndexError::TaskIo {
        target: task.target.clone(),
        message: format!("fatal failure in {}: {}", task.id, err),
    }
}

// ============================================================================
// Task Dispatch
// ============================================================================

/// Type → handler dispatch; every handler is idempotent
async fn run_task(ctx: &TaskCtx, task: &AtomicTask) -> Result<String> {
    match task.task_type {
        TaskType::AnalyzeFileLlm => analyze_file(ctx, task).await,
        TaskType::SkipFileCached => Ok("cache fresh".into()),
        TaskType::CreateDirectoryKb => create_directory_kb(ctx, task).await,
        TaskType::SkipDirectoryFresh => Ok("knowledge file fresh".into()),
        TaskType::DeleteOrphanedFile => delete_orphaned_file(task).await,
        TaskType::DeleteOrphanedDirectory => delete_orphaned_directory(task).await,
        TaskType::CreateCacheStructure => create_cache_structure(task).await,
        TaskType::VerifyCacheFreshness => verify_cache_freshness(ctx, task),
        TaskType::VerifyKbFreshness => verify_kb_freshness(ctx, task),
    }
}

async fn analyze_file(ctx: &TaskCtx, task: &AtomicTask) -> Result<String> {
    let bytes = tokio::fs::read(&task.target)
        .await
        .map_err(|e| IndexError::task_io(&task.target, e))?;
    let content = String::from_utf8_lossy(&bytes).into_owned();

    ctx.llm_calls.fetch_add(1, Ordering::Relaxed);
    let analysis = ctx.provider.analyze_file(&task.target, &content).await?;
    if !analysis.reviewer_compliant {
        // Best-effort artifact is still cached to avoid repeated spend
        ctx.non_compliant.fetch_add(1, Ordering::Relaxed);
    }

    let artifact = ctx.cache.write(&task.target, &analysis.text)?;
    Ok(format!("analysis cached at {}", artifact.display()))
}

async fn create_directory_kb(ctx: &TaskCtx, task: &AtomicTask) -> Result<String> {
    let dir = ctx
        .root
        .find_dir(&task.target)
        .ok_or_else(|| IndexError::task_io(&task.target, "directory missing from context tree"))?;
    let mapper = ctx.cache.mapper();

    // Files whose analysis artifact exists; a truncated analysis left no
    // artifact and is therefore absent from the summary
    let mut files = Vec::new();
    for file in &dir.files {
        match ctx.cache.read_for_source(&file.path) {
            Some(analysis) => files.push(FileSection {
                name: file.file_name().to_string(),
                portable_path: mapper.portable(&file.path),
                analysis,
            }),
            None => warn!(
                "No analysis artifact for {}; omitting from {}",
                file.path.display(),
                task.target.display()
            ),
        }
    }

    let mut subdirs = Vec::new();
    for sub in dir.subdirs.iter().filter(|s| s.has_content()) {
        let summary = std::fs::read_to_string(&sub.knowledge_path)
            .ok()
            .and_then(|content| renderer::extract_summary(&content))
            .unwrap_or_default();
        subdirs.push(SubdirSection {
            name: sub
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string(),
            portable_path: mapper.portable(&sub.path),
            summary,
        });
    }

    let digest = directory_digest(&files, &subdirs);
    ctx.llm_calls.fetch_add(1, Ordering::Relaxed);
    let summary = ctx.provider.summarize_directory(&task.target, &digest).await?;
    if !summary.reviewer_compliant {
        ctx.non_compliant.fetch_add(1, Ordering::Relaxed);
    }

    let content = renderer::render_knowledge_file(
        &mapper.portable(&task.target),
        &summary.text,
        files,
        subdirs,
    );
    write_atomic(&dir.knowledge_path, &content)?;
    Ok(format!("knowledge file at {}", dir.knowledge_path.display()))
}

async fn delete_orphaned_file(task: &AtomicTask) -> Result<String> {
    if !task.metadata.is_safe_to_delete {
        return Err(IndexError::task_io(
            &task.target,
            "deletion not marked safe",
        ));
    }
    match tokio::fs::remove_file(&task.target).await {
        Ok(()) => Ok("deleted".into()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok("already gone".into()),
        Err(e) => Err(IndexError::task_io(&task.target, e)),
    }
}

async fn delete_orphaned_directory(task: &AtomicTask) -> Result<String> {
    if !task.metadata.is_safe_to_delete {
        return Err(IndexError::task_io(
            &task.target,
            "deletion not marked safe",
        ));
    }
    match tokio::fs::remove_dir_all(&task.target).await {
        Ok(()) => Ok("deleted".into()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok("already gone".into()),
        Err(e) => Err(IndexError::task_io(&task.target, e)),
    }
}

async fn create_cache_structure(task: &AtomicTask) -> Result<String> {
    tokio::fs::create_dir_all(&task.target)
        .await
        .map_err(|e| IndexError::task_io(&task.target, e))?;
    Ok("cache directory ready".into())
}

fn verify_cache_freshness(ctx: &TaskCtx, task: &AtomicTask) -> Result<String> {
    let (fresh, reason) = ctx.cache.is_fresh(&task.target);
    if fresh {
        Ok("verified fresh".into())
    } else {
        Err(IndexError::task_io(
            &task.target,
            format!("cache not fresh after analysis: {}", reason),
        ))
    }
}

fn verify_kb_freshness(ctx: &TaskCtx, task: &AtomicTask) -> Result<String> {
    let kb = ctx.cache.mapper().knowledge_path(&task.target)?;
    if kb.is_file() {
        Ok("verified present".into())
    } else {
        Err(IndexError::task_io(
            &task.target,
            format!("knowledge file missing at {}", kb.display()),
        ))
    }
}

/// Digest of constituent analyses fed to the directory summary prompt
fn directory_digest(files: &[FileSection], subdirs: &[SubdirSection]) -> String {
    let mut digest = String::new();
    for file in files {
        digest.push_str(&format!("=== File: {} ===\n{}\n\n", file.portable_path, file.analysis));
    }
    for sub in subdirs {
        digest.push_str(&format!(
            "=== Subdirectory: {} ===\n{}\n\n",
            sub.portable_path, sub.summary
        ));
    }
    digest
}

/// Write-to-temp-then-rename; the destination never holds partial content
fn write_atomic(path: &std::path::Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| IndexError::task_io(path, "no parent directory"))?;
    std::fs::create_dir_all(parent).map_err(|e| IndexError::task_io(parent, e))?;
    let mut tmp =
        tempfile::NamedTempFile::new_in(parent).map_err(|e| IndexError::task_io(parent, e))?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| IndexError::task_io(path, e))?;
    tmp.persist(path).map_err(|e| IndexError::task_io(path, e))?;
    Ok(())
}
