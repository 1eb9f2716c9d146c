//! BENCHSHEET path utilities

use std::path::{Path, PathBuf};

/// LabRelay data directory (~/.labrelay)
///
/// Falls back to a relative `.labrelay` when no home directory can be located.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".labrelay"))
        .unwrap_or_else(|| PathBuf::from(".labrelay"))
}

/// Configuration file location
pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// Working directory handed to the agent
pub fn workspace_path() -> PathBuf {
    data_dir().join("bench")
}

/// Conversation transcripts
pub fn sessions_dir() -> PathBuf {
    data_dir().join("logbook")
}

/// Shared plan store
pub fn plans_path() -> PathBuf {
    data_dir().join("plans").join("plans.json")
}

/// Ensure directory exists
pub async fn ensure_dir(path: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(path).await
}

/// Expand a leading `~` against the home directory
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Sanitize a key so it can be used as a file name
pub fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            _ => c,
        })
        .collect()
}
