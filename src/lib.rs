//! # jesse-kb - Hierarchical Knowledge Base Indexer
//!
//! Builds and maintains a markdown knowledge base mirroring a source
//! tree: one LLM analysis artifact per file, one knowledge file per
//! directory. The core is the incremental rebuild engine deciding,
//! correctly and cheaply, which expensive artifacts must be rebuilt on
//! each run, and executing those rebuilds in dependency order with
//! bounded concurrency.
//!
//! ## Architecture
//!
//! - Discovery walks the source tree into an immutable context snapshot
//! - The decision engine runs a timestamp-based staleness calculus with
//!   cascade propagation and orphan detection
//! - The plan generator turns decisions into a validated task DAG
//! - The execution engine schedules the DAG under a concurrency bound
//! - The LLM adapter owns truncation detection, continuation retry, and
//!   the reviewer loop
//!
//! Data flows strictly forward: discovery → decisions → plan → execute.

pub mod cache;
pub mod config;
pub mod context;
pub mod decision;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod indexer;
pub mod llm;
pub mod paths;
pub mod plan;
pub mod renderer;

pub use cache::{AnalysisCache, KbMembership};
pub use config::{ConfigLoader, HandlerType, IndexingConfig, IndexingMode};
pub use context::{DirectoryContext, DirStatus, FileContext, FileStatus};
pub use decision::{
    DecisionEngine, DecisionReport, DeletionDecision, DeletionKind, RebuildDecision,
    RebuildOutcome, RebuildReason,
};
pub use discovery::Discovery;
pub use error::{IndexError, Result};
pub use executor::{
    ExecutionEngine, ExecutionResults, PlanPreview, ProgressSnapshot, TaskOutcome,
};
pub use indexer::{exit_code_for, print_summary, Indexer, RunOptions};
pub use llm::{
    AnalysisProvider, ChatClient, ChatMessage, CompletedAnalysis, DebugReplay, DebugStage,
    LlmAdapter, END_SENTINEL,
};
pub use paths::PathMapper;
pub use plan::{AtomicTask, ExecutionPlan, PlanGenerator, TaskType};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::AnalysisCache;
    pub use crate::config::{ConfigLoader, HandlerType, IndexingConfig, IndexingMode};
    pub use crate::context::{DirectoryContext, FileContext};
    pub use crate::decision::{DecisionEngine, DecisionReport};
    pub use crate::discovery::Discovery;
    pub use crate::error::{IndexError, Result};
    pub use crate::executor::{ExecutionEngine, ExecutionResults};
    pub use crate::indexer::{Indexer, RunOptions};
    pub use crate::llm::{AnalysisProvider, LlmAdapter};
    pub use crate::paths::PathMapper;
    pub use crate::plan::{ExecutionPlan, PlanGenerator};
}
