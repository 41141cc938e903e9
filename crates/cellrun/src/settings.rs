//! Runner settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/cellrun/settings.json
//! - Linux: ~/.config/cellrun/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\cellrun\settings.json

use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where engines run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackend {
    /// A dedicated OS thread per cell; shares memory, so supports soft interrupts
    #[default]
    Thread,
    /// A `cellrun worker` child process per cell; cancelled by killing it
    Process,
}

impl std::fmt::Display for EngineBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineBackend::Thread => write!(f, "thread"),
            EngineBackend::Process => write!(f, "process"),
        }
    }
}

impl std::str::FromStr for EngineBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "thread" => Ok(EngineBackend::Thread),
            "process" => Ok(EngineBackend::Process),
            other => Err(format!("unknown backend '{}' (expected thread or process)", other)),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_init_timeout_ms() -> u64 {
    30_000
}

/// Settings that shape how cells are executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunnerSettings {
    /// Engine backend used for new cells
    #[serde(default)]
    pub backend: EngineBackend,

    /// Use the shared interrupt signal when the backend supports it.
    /// When off, every cancel restarts the engine.
    #[serde(default = "default_true")]
    pub shared_interrupt: bool,

    /// How long an engine may take to report `init-complete`
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,

    /// Escalate an unanswered soft cancel to a restart after this long
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_after_ms: Option<u64>,

    /// Code run once when an engine boots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_code: Option<String>,

    /// Boot engines when a cell is registered instead of on first run
    #[serde(default)]
    pub eager_init: bool,

    /// Binary used for process engines (default: the current executable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<PathBuf>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            backend: EngineBackend::Thread,
            shared_interrupt: true,
            init_timeout_ms: default_init_timeout_ms(),
            escalate_after_ms: None,
            startup_code: None,
            eager_init: false,
            worker_program: None,
        }
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cellrun")
        .join("settings.json")
}

/// Load settings from disk, returning defaults if the file is missing or unreadable
pub fn load_settings(path: &Path) -> RunnerSettings {
    if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    } else {
        RunnerSettings::default()
    }
}

/// Save settings to disk
pub fn save_settings(path: &Path, settings: &RunnerSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

/// JSON Schema for the settings file
pub fn settings_schema() -> Result<String> {
    let schema = schemars::schema_for!(RunnerSettings);
    Ok(serde_json::to_string_pretty(&schema)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = RunnerSettings::default();
        assert_eq!(settings.backend, EngineBackend::Thread);
        assert!(settings.shared_interrupt);
        assert_eq!(settings.init_timeout_ms, 30_000);
        assert!(settings.escalate_after_ms.is_none());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: RunnerSettings = serde_json::from_str(r#"{"backend":"process"}"#).unwrap();
        assert_eq!(settings.backend, EngineBackend::Process);
        assert!(settings.shared_interrupt);
        assert_eq!(settings.init_timeout_ms, 30_000);
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = RunnerSettings {
            backend: EngineBackend::Process,
            shared_interrupt: false,
            escalate_after_ms: Some(500),
            startup_code: Some("x = 1".into()),
            ..Default::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(load_settings(&path), RunnerSettings::default());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("Process".parse::<EngineBackend>(), Ok(EngineBackend::Process));
        assert!("fork".parse::<EngineBackend>().is_err());
    }

    #[test]
    fn test_schema_lists_fields() {
        let schema = settings_schema().unwrap();
        assert!(schema.contains("shared_interrupt"));
        assert!(schema.contains("init_timeout_ms"));
    }
}
