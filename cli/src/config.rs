use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use mealplan_core::session::BackendConfig;

pub struct Config {
    pub db_path: PathBuf,
    pub session_path: PathBuf,
    pub backend: BackendConfig,
}

impl Config {
    pub fn load(backend_url: Option<String>, backend_key: Option<String>) -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "mealplan").context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        Ok(Self::in_dir(&data_dir, backend_url, backend_key))
    }

    fn in_dir(data_dir: &Path, backend_url: Option<String>, backend_key: Option<String>) -> Self {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Config {
            db_path: data_dir.join("local.db"),
            session_path: data_dir.join("session.json"),
            backend: BackendConfig {
                url: non_empty(backend_url),
                key: non_empty(backend_key),
            },
        }
    }
}

/// Settings served to the front end at `/api/config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiSettings {
    pub api_key: Option<String>,
    pub provider: String,
    pub model: String,
}

pub const DEFAULT_AI_PROVIDER: &str = "openrouter";
pub const DEFAULT_AI_MODEL: &str = "google/gemini-flash-1.5";

impl AiSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        AiSettings {
            api_key: get("OPENROUTER_API_KEY"),
            provider: get("AI_PROVIDER").unwrap_or_else(|| DEFAULT_AI_PROVIDER.to_string()),
            model: get("AI_MODEL").unwrap_or_else(|| DEFAULT_AI_MODEL.to_string()),
        }
    }
}
