//! Knowledge file rendering
//!
//! Pure template assembly: LLM prose is inserted verbatim, never parsed
//! or reformatted. Files and subdirectories are ordered case-insensitively
//! by name, paths are rendered in portable form, and a metadata footer
//! records the generation timestamp and membership counts.

use crate::cache::KB_METADATA_PREFIX;
use chrono::Utc;

/// Placeholder rendered for an empty summary, keeping structure stable
pub const EMPTY_PLACEHOLDER: &str = "*No content available*";

/// Header discouraging manual edits
const WARNING_HEADER: &str =
    "<!-- GENERATED KNOWLEDGE FILE - DO NOT EDIT. Regenerated on every index run. -->";

/// One file entry in a knowledge file
#[derive(Debug, Clone)]
pub struct FileSection {
    pub name: String,
    pub portable_path: String,
    /// Verbatim cached analysis
    pub analysis: String,
}

/// One subdirectory entry in a knowledge file
#[derive(Debug, Clone)]
pub struct SubdirSection {
    pub name: String,
    pub portable_path: String,
    /// Verbatim summary pulled from the child knowledge file
    pub summary: String,
}

/// Assemble a knowledge file for one directory
pub fn render_knowledge_file(
    portable_dir: &str,
    global_summary: &str,
    mut files: Vec<FileSection>,
    mut subdirs: Vec<SubdirSection>,
) -> String {
    files.sort_by_key(|f| f.name.to_lowercase());
    subdirs.sort_by_key(|s| s.name.to_lowercase());

    let mut md = String::new();

    md.push_str(WARNING_HEADER);
    md.push_str("\n\n");
    md.push_str(&format!("# Knowledge Base: {}\n\n", portable_dir));

    md.push_str("## Summary\n\n");
    md.push_str(non_empty_or_placeholder(global_summary));
    md.push_str("\n\n");

    if !files.is_empty() {
        md.push_str("## Files\n\n");
        for file in &files {
            md.push_str(&format!("### {}\n\n", file.portable_path));
            md.push_str(non_empty_or_placeholder(&file.analysis));
            md.push_str("\n\n");
        }
    }

    if !subdirs.is_empty() {
        md.push_str("## Subdirectories\n\n");
        for subdir in &subdirs {
            md.push_str(&format!("### {}\n\n", subdir.portable_path));
            md.push_str(non_empty_or_placeholder(&subdir.summary));
            md.push_str("\n\n");
        }
    }

    md.push_str(&format!(
        "{} generated={} files={} subdirs={} -->\n",
        KB_METADATA_PREFIX,
        Utc::now().to_rfc3339(),
        files.len(),
        subdirs.len()
    ));

    md
}

/// Pull the global summary back out of a rendered knowledge file
///
/// Used to roll a child directory's summary up into its parent. Returns
/// `None` when the file has no summary section.
pub fn extract_summary(kb_content: &str) -> Option<String> {
    let start = kb_content.find("## Summary")? + "## Summary".len();
    let rest = &kb_content[start..];
    let end = rest
        .find("\n## ")
        .or_else(|| rest.find(KB_METADATA_PREFIX))
        .unwrap_or(rest.len());
    let summary = rest[..end].trim();
    if summary.is_empty() {
        None
    } else {
        Some(summary.to_string())
    }
}

fn non_empty_or_placeholder(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        EMPTY_PLACEHOLDER
    } else {
        trimmed
    }
}
