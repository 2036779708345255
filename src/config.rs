use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_data_dir() -> PathBuf {
    home_dir().join(".runa").join("data")
}

fn default_skills_dir() -> PathBuf {
    home_dir().join(".runa").join("skills")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Provider tag stamped onto newly created tasks.
    pub provider: String,
    pub model: String,
    pub api_key: String,
    /// Override for OpenAI-compatible endpoints (local LLMs, proxies).
    pub base_url: Option<String>,
    /// Wall-clock budget for a single run. Exceeding it fails the run.
    pub run_timeout_secs: u64,
    /// How long a cancel waits for the backend before the run is
    /// force-marked cancelled locally.
    pub cancel_grace_secs: u64,
    /// Tools the model may call during a run. Empty disables tools.
    pub allowed_tools: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            api_key: String::new(),
            base_url: None,
            run_timeout_secs: 300,
            cancel_grace_secs: 2,
            allowed_tools: ["bash", "read", "write", "grep", "web_fetch"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSettings {
    pub token: String,
    /// User-id allowlist. Empty list denies everyone.
    pub allowed_users: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub data_dir: PathBuf,
    /// Completed runs per task before history is folded into a summary.
    pub compress_after_turns: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            compress_after_turns: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillsSettings {
    pub skills_dir: PathBuf,
}

impl Default for SkillsSettings {
    fn default() -> Self {
        Self {
            skills_dir: default_skills_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub poll_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentSettings,
    pub telegram: TelegramSettings,
    pub store: StoreSettings,
    pub skills: SkillsSettings,
    pub scheduler: SchedulerSettings,
}

impl Config {
    pub fn config_path() -> PathBuf {
        home_dir().join(".runa").join("config.json")
    }

    /// Load from ~/.runa/config.json (missing file means defaults),
    /// then apply environment overrides for secrets.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("RUNA_TELEGRAM_TOKEN") {
            self.telegram.token = token;
        }
        if let Ok(key) = std::env::var("RUNA_API_KEY").or_else(|_| std::env::var("OPENAI_API_KEY"))
        {
            if self.agent.api_key.is_empty() {
                self.agent.api_key = key;
            }
        }
        if let Ok(model) = std::env::var("RUNA_MODEL") {
            self.agent.model = model;
        }
        if let Ok(dir) = std::env::var("RUNA_DATA_DIR") {
            self.store.data_dir = PathBuf::from(dir);
        }
    }
}
