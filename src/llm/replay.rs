//! Debug record and replay for LLM calls
//!
//! When recording, every (prompt, response) pair is serialised under
//! `<debug_root>/<stage>/` together with a `meta.json`. When replaying,
//! the saved response is returned and the network is never touched.
//! Replay keys are deterministic from (stage, task path).

use crate::error::{IndexError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Pipeline stage a debug artifact belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugStage {
    FileAnalysis,
    DirectorySummary,
    Continuation,
    Review,
}

impl DebugStage {
    pub fn dir_name(&self) -> &'static str {
        match self {
            DebugStage::FileAnalysis => "file_analysis",
            DebugStage::DirectorySummary => "directory_summary",
            DebugStage::Continuation => "continuation",
            DebugStage::Review => "review",
        }
    }
}

/// Sidecar metadata for one recorded exchange
#[derive(Debug, Serialize, Deserialize)]
struct DebugMeta {
    stage: DebugStage,
    task_path: String,
    conversation_id: String,
    recorded_at: String,
}

/// Records or replays LLM exchanges under a debug directory
#[derive(Debug, Clone)]
pub struct DebugReplay {
    root: PathBuf,
    record: bool,
    replay: bool,
}

impl DebugReplay {
    pub fn new(root: PathBuf, record: bool, replay: bool) -> Self {
        Self { root, record, replay }
    }

    /// A store that neither records nor replays
    pub fn disabled() -> Self {
        Self {
            root: PathBuf::new(),
            record: false,
            replay: false,
        }
    }

    pub fn is_replay(&self) -> bool {
        self.replay
    }

    /// Deterministic key for (stage, task path); the same pair always
    /// resolves to the same artifact files
    fn key(stage: DebugStage, task_path: &Path) -> String {
        let mut hasher = Sha256::new();
        hasher.update(stage.dir_name().as_bytes());
        hasher.update(b"\0");
        hasher.update(task_path.to_string_lossy().as_bytes());
        let digest = hex::encode(hasher.finalize());
        let stem = crate::paths::sanitize_identifier(&task_path.to_string_lossy());
        format!("{}_{}", stem, &digest[..12])
    }

    fn base(&self, stage: DebugStage, task_path: &Path) -> PathBuf {
        self.root
            .join(stage.dir_name())
            .join(Self::key(stage, task_path))
    }

    /// Look up a recorded response; `None` when replay is off or the
    /// exchange was never recorded
    pub fn lookup(&self, stage: DebugStage, task_path: &Path) -> Option<String> {
        if !self.replay {
            return None;
        }
        let path = self.base(stage, task_path).with_extension("response");
        match fs::read_to_string(&path) {
            Ok(response) => {
                debug!("Replay hit for {} ({})", task_path.display(), stage.dir_name());
                Some(response)
            }
            Err(_) => {
                warn!(
                    "Replay miss for {} ({})",
                    task_path.display(),
                    stage.dir_name()
                );
                None
            }
        }
    }

    /// Record one exchange; a no-op unless recording is enabled
    pub fn record(
        &self,
        stage: DebugStage,
        task_path: &Path,
        conversation_id: &str,
        prompt: &str,
        response: &str,
    ) -> Result<()> {
        if !self.record {
            return Ok(());
        }
        let base = self.base(stage, task_path);
        let dir = base
            .parent()
            .ok_or_else(|| IndexError::other("debug base without parent"))?;
        fs::create_dir_all(dir).map_err(|e| IndexError::task_io(dir, e))?;

        fs::write(base.with_extension("prompt"), prompt)
            .map_err(|e| IndexError::task_io(&base, e))?;
        fs::write(base.with_extension("response"), response)
            .map_err(|e| IndexError::task_io(&base, e))?;
        let meta = DebugMeta {
            stage,
            task_path: task_path.to_string_lossy().into_owned(),
            conversation_id: conversation_id.to_string(),
            recorded_at: Utc::now().to_rfc3339(),
        };
        fs::write(
            base.with_extension("meta.json"),
            serde_json::to_string_pretty(&meta)?,
        )
        .map_err(|e| IndexError::task_io(&base, e))?;
        debug!("Recorded {} exchange for {}", stage.dir_name(), task_path.display());
        Ok(())
    }
}
