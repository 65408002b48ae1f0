//! Indexing configuration
//!
//! Per-handler-type validated settings loaded from JSON config files.
//! The loader auto-generates a default configuration file when one is
//! missing and memoizes parsed instances for the life of the process.
//!
//! # Example
//!
//! ```rust,no_run
//! use jesse_kb::config::{ConfigLoader, HandlerType};
//!
//! # fn example() -> jesse_kb::error::Result<()> {
//! let config = ConfigLoader::load(HandlerType::ProjectBase, None)?;
//! assert!(config.file_processing.max_concurrent_operations >= 1);
//! # Ok(())
//! # }
//! ```

use crate::error::{IndexError, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Directories skipped for every handler type
pub const UNIVERSAL_EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "dist",
    "build",
    "vendor",
    "__pycache__",
    ".next",
    "coverage",
    ".cache",
    ".venv",
];

/// File extensions skipped for every handler type
pub const UNIVERSAL_EXCLUDED_EXTENSIONS: &[&str] = &[
    ".min.js",
    ".min.css",
    ".min.mjs",
    ".bundle.js",
    ".chunk.js",
    ".map",
    ".lock",
    ".d.ts",
    ".pyc",
    ".so",
    ".dylib",
    ".dll",
    ".exe",
    ".bin",
    ".png",
    ".jpg",
    ".jpeg",
    ".gif",
    ".ico",
    ".woff",
    ".woff2",
    ".zip",
    ".tar",
    ".gz",
];

/// Suffixes of artifacts this tool itself produces; never re-ingested
const OUTPUT_ARTIFACT_SUFFIXES: &[&str] = &["_kb.md", ".analysis.md"];

// ============================================================================
// Handler Types & Modes
// ============================================================================

/// Indexing handler type; each owns one source tree and one output subtree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum HandlerType {
    ProjectBase,
    GitClones,
    PdfKnowledge,
}

impl HandlerType {
    /// Directory name under the output root for this handler
    pub fn dir_name(&self) -> &'static str {
        match self {
            HandlerType::ProjectBase => "project-base",
            HandlerType::GitClones => "git-clones",
            HandlerType::PdfKnowledge => "pdf-knowledge",
        }
    }

    /// Configuration file name for this handler
    pub fn config_file_name(&self) -> String {
        format!("{}.indexing-config.json", self.dir_name())
    }
}

impl std::fmt::Display for HandlerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// How much of the knowledge tree is rebuilt on a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IndexingMode {
    /// Full staleness calculus; only stale artifacts are rebuilt
    Incremental,
    /// Every directory KB is rebuilt, file-level cache freshness respected
    FullKbRebuild,
    /// All freshness checks bypassed; everything is rebuilt
    Full,
}

// ============================================================================
// Configuration Sections
// ============================================================================

/// File processing limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProcessingConfig {
    /// Maximum source file size in bytes; larger files are not indexed
    pub max_file_size: u64,
    /// Files grouped per progress batch
    pub batch_size: usize,
    /// Semaphore bound on in-flight tasks
    pub max_concurrent_operations: usize,
    /// Characters per content chunk handed to the LLM
    pub chunk_size: usize,
    /// Overlap between consecutive chunks; must be below `chunk_size`
    pub chunk_overlap: usize,
}

/// Exclusion sets composed on top of the universal base set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentFilteringConfig {
    pub excluded_extensions: Vec<String>,
    pub excluded_directories: Vec<String>,
}

/// LLM request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: usize,
    pub extended_thinking: bool,
    /// Continuation prompts sent before giving up on a truncated response
    pub max_continuation_attempts: usize,
    /// Reviewer round-trips before the best attempt is accepted as-is
    pub max_review_iterations: usize,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

/// Change detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDetectionConfig {
    pub indexing_mode: IndexingMode,
    /// Kept in the schema for compatibility; the staleness comparison is
    /// exact (`cache_mtime >= source_mtime`) and never applies a tolerance.
    pub timestamp_tolerance_seconds: u64,
}

/// Error handling policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// When true, a failed task skips its dependents and the run continues
    pub continue_on_file_errors: bool,
    /// Failure messages included in the final summary
    pub max_reported_failures: usize,
}

/// Output locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output root; `JESSE_OUT_ROOT` overrides, default is
    /// `.jesse-kb` inside the source root
    pub out_root: Option<PathBuf>,
}

/// Debug record/replay settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Record every (prompt, response) pair under the debug directory
    pub debug_enabled: bool,
    /// Serve recorded responses instead of calling the network;
    /// `JESSE_DEBUG_REPLAY=1` forces this on
    pub debug_replay: bool,
    /// Override for the debug artifact directory
    pub debug_output_directory: Option<PathBuf>,
}

// ============================================================================
// IndexingConfig
// ============================================================================

/// Complete validated configuration for one handler type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    pub handler: HandlerType,
    pub file_processing: FileProcessingConfig,
    pub content_filtering: ContentFilteringConfig,
    pub llm_config: LlmConfig,
    pub change_detection: ChangeDetectionConfig,
    pub error_handling: ErrorHandlingConfig,
    pub output_config: OutputConfig,
    pub debug_config: DebugConfig,
}

impl IndexingConfig {
    /// Default configuration for a handler type (the defaults registry)
    pub fn default_for(handler: HandlerType) -> Self {
        let content_filtering = match handler {
            HandlerType::ProjectBase => ContentFilteringConfig {
                excluded_extensions: vec![".log".into(), ".tmp".into()],
                excluded_directories: vec![".idea".into(), ".vscode".into()],
            },
            HandlerType::GitClones => ContentFilteringConfig {
                excluded_extensions: vec![".log".into()],
                excluded_directories: vec![".github".into()],
            },
            HandlerType::PdfKnowledge => ContentFilteringConfig::default(),
        };

        Self {
            handler,
            file_processing: FileProcessingConfig {
                max_file_size: 100 * 1024,
                batch_size: 16,
                max_concurrent_operations: 4,
                chunk_size: 16_000,
                chunk_overlap: 500,
            },
            content_filtering,
            llm_config: LlmConfig {
                model: "claude-sonnet-4-5".to_string(),
                temperature: 0.2,
                max_tokens: 8192,
                extended_thinking: false,
                max_continuation_attempts: 3,
                max_review_iterations: 2,
                request_timeout_secs: 300,
            },
            change_detection: ChangeDetectionConfig {
                indexing_mode: IndexingMode::Incremental,
                timestamp_tolerance_seconds: 0,
            },
            error_handling: ErrorHandlingConfig {
                continue_on_file_errors: true,
                max_reported_failures: 10,
            },
            output_config: OutputConfig::default(),
            debug_config: DebugConfig::default(),
        }
    }

    /// Cross-field validation; rejects configs the pipeline cannot honor
    pub fn validate(&self) -> Result<()> {
        let fp = &self.file_processing;
        if fp.max_concurrent_operations == 0 {
            return Err(IndexError::Configuration(
                "max_concurrent_operations must be at least 1".into(),
            ));
        }
        if fp.chunk_overlap >= fp.chunk_size {
            return Err(IndexError::Configuration(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                fp.chunk_overlap, fp.chunk_size
            )));
        }
        if !(0.0..=2.0).contains(&self.llm_config.temperature) {
            return Err(IndexError::Configuration(format!(
                "temperature {} outside [0.0, 2.0]",
                self.llm_config.temperature
            )));
        }
        if self.handler == HandlerType::ProjectBase
            && self.content_filtering.excluded_directories.is_empty()
        {
            return Err(IndexError::Configuration(
                "project-base requires a non-empty directory exclusion list".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the output root: env override, then config, then a
    /// `.jesse-kb` directory inside the source root
    pub fn resolve_out_root(&self, source_root: &Path) -> PathBuf {
        if let Ok(env_root) = std::env::var("JESSE_OUT_ROOT") {
            if !env_root.is_empty() {
                return PathBuf::from(env_root);
            }
        }
        self.output_config
            .out_root
            .clone()
            .unwrap_or_else(|| source_root.join(".jesse-kb"))
    }

    /// Whether replay mode is in effect (config flag or env force)
    pub fn replay_enabled(&self) -> bool {
        if matches!(std::env::var("JESSE_DEBUG_REPLAY").as_deref(), Ok("1")) {
            return true;
        }
        self.debug_config.debug_replay
    }

    /// Whether a file should be indexed, given its name and size
    pub fn should_process_file(&self, path: &Path, size: u64) -> bool {
        if size > self.file_processing.max_file_size {
            return false;
        }
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => return false,
        };
        if name.starts_with('.') {
            return false;
        }
        // Never re-ingest our own artifacts living in the source tree
        if OUTPUT_ARTIFACT_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            return false;
        }
        let lower = name.to_lowercase();
        if UNIVERSAL_EXCLUDED_EXTENSIONS
            .iter()
            .any(|ext| lower.ends_with(ext))
        {
            return false;
        }
        !self
            .content_filtering
            .excluded_extensions
            .iter()
            .any(|ext| lower.ends_with(&ext.to_lowercase()))
    }

    /// Whether a directory should be descended into
    pub fn should_process_directory(&self, path: &Path) -> bool {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => return false,
        };
        if name.starts_with('.') {
            return false;
        }
        if UNIVERSAL_EXCLUDED_DIRS.contains(&name) {
            return false;
        }
        !self
            .content_filtering
            .excluded_directories
            .iter()
            .any(|d| d == name)
    }
}

// ============================================================================
// Loader
// ============================================================================

type ConfigCache = HashMap<(HandlerType, PathBuf), Arc<IndexingConfig>>;

static CONFIG_CACHE: Lazy<RwLock<ConfigCache>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Loads per-handler configuration files, generating defaults when missing
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load (and memoize) the configuration for a handler type
    ///
    /// `config_dir` defaults to `~/.jesse`. A missing file is generated
    /// from the defaults registry before loading.
    pub fn load(handler: HandlerType, config_dir: Option<&Path>) -> Result<Arc<IndexingConfig>> {
        let dir = match config_dir {
            Some(d) => d.to_path_buf(),
            None => Self::default_config_dir()?,
        };

        let cache_key = (handler, dir.clone());
        if let Some(cached) = CONFIG_CACHE
            .read()
            .expect("config cache poisoned")
            .get(&cache_key)
        {
            debug!("Config cache hit for {}", handler);
            return Ok(cached.clone());
        }

        let config = Arc::new(Self::load_uncached(handler, &dir)?);
        CONFIG_CACHE
            .write()
            .expect("config cache poisoned")
            .insert(cache_key, config.clone());
        Ok(config)
    }

    /// Drop all memoized configurations (used after `config init`)
    pub fn invalidate() {
        CONFIG_CACHE
            .write()
            .expect("config cache poisoned")
            .clear();
    }

    fn default_config_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|h| h.join(".jesse"))
            .ok_or_else(|| IndexError::Configuration("cannot determine home directory".into()))
    }

    fn load_uncached(handler: HandlerType, dir: &Path) -> Result<IndexingConfig> {
        let path = dir.join(handler.config_file_name());

        if !path.exists() {
            let default = IndexingConfig::default_for(handler);
            fs::create_dir_all(dir).map_err(|e| {
                IndexError::Configuration(format!(
                    "cannot create config directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let json = serde_json::to_string_pretty(&default)?;
            fs::write(&path, json).map_err(|e| {
                IndexError::Configuration(format!("cannot write {}: {}", path.display(), e))
            })?;
            info!("Generated default configuration at {}", path.display());
        }

        let content = fs::read_to_string(&path).map_err(|e| {
            IndexError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: IndexingConfig = serde_json::from_str(&content).map_err(|e| {
            IndexError::Configuration(format!("invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        debug!("Loaded configuration for {} from {}", handler, path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_validates() {
        for handler in [
            HandlerType::ProjectBase,
            HandlerType::GitClones,
            HandlerType::PdfKnowledge,
        ] {
            IndexingConfig::default_for(handler).validate().unwrap();
        }
    }

    #[test]
    fn test_chunk_overlap_must_be_below_chunk_size() {
        let mut config = IndexingConfig::default_for(HandlerType::ProjectBase);
        config.file_processing.chunk_overlap = config.file_processing.chunk_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_project_base_requires_directory_exclusions() {
        let mut config = IndexingConfig::default_for(HandlerType::ProjectBase);
        config.content_filtering.excluded_directories.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_loader_generates_missing_config() {
        let temp = TempDir::new().unwrap();
        let config = ConfigLoader::load(HandlerType::GitClones, Some(temp.path())).unwrap();
        assert_eq!(config.handler, HandlerType::GitClones);
        assert!(temp
            .path()
            .join("git-clones.indexing-config.json")
            .exists());

        // Second load must come from the memoized cache
        let again = ConfigLoader::load(HandlerType::GitClones, Some(temp.path())).unwrap();
        assert!(Arc::ptr_eq(&config, &again));
    }

    #[test]
    fn test_file_exclusions() {
        let config = IndexingConfig::default_for(HandlerType::ProjectBase);
        assert!(config.should_process_file(Path::new("src/main.rs"), 100));
        assert!(!config.should_process_file(Path::new("app.min.js"), 100));
        assert!(!config.should_process_file(Path::new(".hidden"), 100));
        assert!(!config.should_process_file(Path::new("big.rs"), 10 * 1024 * 1024));
        // Own artifacts are never re-ingested
        assert!(!config.should_process_file(Path::new("src_kb.md"), 100));
        assert!(!config.should_process_file(Path::new("main.rs.analysis.md"), 100));
    }

    #[test]
    fn test_directory_exclusions() {
        let config = IndexingConfig::default_for(HandlerType::ProjectBase);
        assert!(config.should_process_directory(Path::new("src")));
        assert!(!config.should_process_directory(Path::new("node_modules")));
        assert!(!config.should_process_directory(Path::new(".git")));
        assert!(!config.should_process_directory(Path::new(".idea")));
    }
}
