//! Run orchestration
//!
//! Wires the pipeline end to end: discovery → decisions → plan →
//! execution. Each invocation is atomic at the task level, not the run
//! level; all in-memory state dies with the run.

use crate::cache::AnalysisCache;
use crate::config::{ConfigLoader, HandlerType, IndexingConfig, IndexingMode};
use crate::decision::DecisionEngine;
use crate::discovery::Discovery;
use crate::error::Result;
use crate::executor::{ExecutionEngine, ExecutionResults, PlanPreview};
use crate::llm::{AnalysisProvider, ChatClient, DebugReplay, LlmAdapter};
use crate::paths::PathMapper;
use crate::plan::PlanGenerator;
use async_trait::async_trait;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Per-invocation inputs, CLI overrides included
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub source_root: PathBuf,
    pub handler: HandlerType,
    /// Override for the configuration directory (defaults to `~/.jesse`)
    pub config_dir: Option<PathBuf>,
    pub mode_override: Option<IndexingMode>,
    pub concurrency_override: Option<usize>,
    pub out_root_override: Option<PathBuf>,
}

/// One configured indexing run
pub struct Indexer {
    config: Arc<IndexingConfig>,
    mapper: PathMapper,
    cache: AnalysisCache,
    provider: Arc<dyn AnalysisProvider>,
}

impl Indexer {
    /// Build a run from options, constructing the LLM adapter from the
    /// environment
    pub fn new(options: &RunOptions) -> Result<Self> {
        let config = Self::load_config(options)?;
        let out_root = options
            .out_root_override
            .clone()
            .unwrap_or_else(|| config.resolve_out_root(&options.source_root));
        let mapper = PathMapper::new(options.source_root.clone(), out_root, options.handler)?;

        let replay_root = config
            .debug_config
            .debug_output_directory
            .clone()
            .unwrap_or_else(|| mapper.out_root().join("llm_debug"));
        let replay = DebugReplay::new(
            replay_root,
            config.debug_config.debug_enabled,
            config.replay_enabled(),
        );

        let client = ChatClient::from_env(&config.llm_config)?;
        let provider = Arc::new(LlmAdapter::new(
            client,
            config.llm_config.clone(),
            replay,
            config.file_processing.chunk_size,
        ));

        Ok(Self::with_provider(config, mapper, provider))
    }

    /// Build a run for previewing only; no LLM credentials are required
    /// because preview never dispatches
    pub fn for_preview(options: &RunOptions) -> Result<Self> {
        let config = Self::load_config(options)?;
        let out_root = options
            .out_root_override
            .clone()
            .unwrap_or_else(|| config.resolve_out_root(&options.source_root));
        let mapper = PathMapper::new(options.source_root.clone(), out_root, options.handler)?;
        Ok(Self::with_provider(config, mapper, Arc::new(UnconfiguredProvider)))
    }

    /// Build a run with an injected provider; the seam tests use
    pub fn with_provider(
        config: Arc<IndexingConfig>,
        mapper: PathMapper,
        provider: Arc<dyn AnalysisProvider>,
    ) -> Self {
        let cache = AnalysisCache::new(mapper.clone());
        Self {
            config,
            mapper,
            cache,
            provider,
        }
    }

    fn load_config(options: &RunOptions) -> Result<Arc<IndexingConfig>> {
        let loaded = ConfigLoader::load(options.handler, options.config_dir.as_deref())?;
        if options.mode_override.is_none() && options.concurrency_override.is_none() {
            return Ok(loaded);
        }
        let mut config = (*loaded).clone();
        if let Some(mode) = options.mode_override {
            config.change_detection.indexing_mode = mode;
        }
        if let Some(concurrency) = options.concurrency_override {
            config.file_processing.max_concurrent_operations = concurrency.max(1);
        }
        config.validate()?;
        Ok(Arc::new(config))
    }

    pub fn config(&self) -> &IndexingConfig {
        &self.config
    }

    /// Full pipeline: discover, decide, plan, execute
    pub async fn run(&self) -> Result<ExecutionResults> {
        info!(
            "Indexing {} ({} mode) -> {}",
            self.mapper.source_root().display(),
            self.config.handler.dir_name(),
            self.mapper.out_root().display()
        );

        let ctx = Arc::new(Discovery::new(&self.config, &self.mapper).discover()?);
        let report = DecisionEngine::new(&self.config, &self.cache).evaluate(&ctx)?;
        let plan = PlanGenerator::new(&self.mapper).generate(&report, &ctx)?;

        // Skeleton first: concurrent writers never race on mkdir
        self.cache.prepare_cache_structure(&ctx)?;

        let engine = ExecutionEngine::new(
            self.config.clone(),
            self.cache.clone(),
            self.provider.clone(),
            ctx,
        );
        engine.execute(plan).await
    }

    /// Side-effect-free preview of what a run would execute
    pub fn preview(&self) -> Result<PlanPreview> {
        let ctx = Arc::new(Discovery::new(&self.config, &self.mapper).discover()?);
        let report = DecisionEngine::new(&self.config, &self.cache).evaluate(&ctx)?;
        let plan = PlanGenerator::new(&self.mapper).generate(&report, &ctx)?;
        let engine = ExecutionEngine::new(
            self.config.clone(),
            self.cache.clone(),
            self.provider.clone(),
            ctx,
        );
        engine.preview(&plan)
    }
}

/// Provider placeholder behind [`Indexer::for_preview`]; any dispatch
/// through it is a configuration error
struct UnconfiguredProvider;

#[async_trait]
impl crate::llm::AnalysisProvider for UnconfiguredProvider {
    async fn analyze_file(
        &self,
        _path: &Path,
        _content: &str,
    ) -> Result<crate::llm::CompletedAnalysis> {
        Err(crate::error::IndexError::Configuration(
            "LLM provider not configured for this run".into(),
        ))
    }

    async fn summarize_directory(
        &self,
        _path: &Path,
        _digest: &str,
    ) -> Result<crate::llm::CompletedAnalysis> {
        Err(crate::error::IndexError::Configuration(
            "LLM provider not configured for this run".into(),
        ))
    }
}

/// Exit code for a run that returned results: 0 clean, 2 with failures
pub fn exit_code_for(results: &ExecutionResults) -> i32 {
    if results.failed.is_empty() {
        0
    } else {
        2
    }
}

/// Human-readable end-of-run summary on stderr
pub fn print_summary(results: &ExecutionResults, max_failures: usize) {
    eprintln!();
    eprintln!("{}", "Index run summary".bold());
    eprintln!(
        "  {} {} completed, {} failed, {} skipped ({} tasks in {:.1?})",
        "tasks:".dimmed(),
        results.completed.len().to_string().green(),
        results.failed.len().to_string().red(),
        results.skipped.len().to_string().yellow(),
        results.total(),
        results.duration
    );
    eprintln!(
        "  {} {} LLM calls, {} files analysed, {} directories rebuilt, {} artifacts deleted",
        "work:".dimmed(),
        results.llm_calls_made,
        results.files_processed,
        results.dirs_processed,
        results.files_deleted
    );
    if results.truncations > 0 {
        // Truncations intentionally elide output; call them out apart
        // from ordinary failures
        eprintln!(
            "  {} {} response(s) truncated; artifacts withheld",
            "truncated:".red().bold(),
            results.truncations
        );
    }
    if results.non_compliant > 0 {
        eprintln!(
            "  {} {} analysis(es) accepted best-effort after review",
            "review:".yellow(),
            results.non_compliant
        );
    }
    for failure in results.failed.iter().take(max_failures) {
        eprintln!(
            "  {} {:?} {} - {}",
            "failed:".red(),
            failure.task_type,
            failure.target.display(),
            failure.message
        );
    }
    if results.failed.len() > max_failures {
        eprintln!(
            "  ... and {} more failures",
            results.failed.len() - max_failures
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let mut results = ExecutionResults::default();
        assert_eq!(exit_code_for(&results), 0);
        results.failed.push(crate::executor::TaskOutcome {
            id: "x".into(),
            task_type: crate::plan::TaskType::AnalyzeFileLlm,
            target: "/x".into(),
            message: "boom".into(),
        });
        assert_eq!(exit_code_for(&results), 2);
    }
}
