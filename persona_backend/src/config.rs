use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "persona_config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Persona identity
    #[serde(default = "default_persona_name")]
    pub persona_name: String,

    // LLM configuration (OpenAI-compatible chat completions)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    /// Larger-context model used when the newest user turn carries video.
    #[serde(default)]
    pub llm_video_model: Option<String>,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // Remote key-value store. Missing url or token disables persistence.
    #[serde(default)]
    pub kv_rest_url: Option<String>,
    #[serde(default)]
    pub kv_rest_token: Option<String>,

    // Autonomous cadence
    #[serde(default = "default_decay_interval_secs")]
    pub decay_interval_secs: u64,
    #[serde(default = "default_decay_amount")]
    pub decay_amount: f64,
    #[serde(default = "default_reflection_interval_secs")]
    pub reflection_interval_secs: u64,
    #[serde(default = "default_true")]
    pub enable_reflection: bool,

    // Backups
    #[serde(default = "default_backup_interval_secs")]
    pub backup_interval_secs: u64,
    #[serde(default = "default_backup_cap")]
    pub backup_cap: usize,

    // Orchestrator
    #[serde(default = "default_max_turn_iterations")]
    pub max_turn_iterations: usize,
    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,

    // Integrations (tools report "disabled" when unset)
    #[serde(default)]
    pub search_api_url: Option<String>,
    #[serde(default)]
    pub search_api_key: Option<String>,
    #[serde(default)]
    pub commerce_api_url: Option<String>,
    #[serde(default)]
    pub commerce_api_token: Option<String>,
    #[serde(default)]
    pub image_api_url: Option<String>,
    #[serde(default)]
    pub image_api_key: Option<String>,
}

fn default_persona_name() -> String {
    "Persona".to_string()
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_decay_interval_secs() -> u64 {
    60
}

fn default_decay_amount() -> f64 {
    1.0
}

fn default_reflection_interval_secs() -> u64 {
    900
}

fn default_true() -> bool {
    true
}

fn default_backup_interval_secs() -> u64 {
    3600
}

fn default_backup_cap() -> usize {
    20
}

fn default_max_turn_iterations() -> usize {
    16
}

fn default_save_debounce_ms() -> u64 {
    1000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            persona_name: default_persona_name(),
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_video_model: None,
            llm_api_key: None,
            kv_rest_url: None,
            kv_rest_token: None,
            decay_interval_secs: default_decay_interval_secs(),
            decay_amount: default_decay_amount(),
            reflection_interval_secs: default_reflection_interval_secs(),
            enable_reflection: true,
            backup_interval_secs: default_backup_interval_secs(),
            backup_cap: default_backup_cap(),
            max_turn_iterations: default_max_turn_iterations(),
            save_debounce_ms: default_save_debounce_ms(),
            search_api_url: None,
            search_api_key: None,
            commerce_api_url: None,
            commerce_api_token: None,
            image_api_url: None,
            image_api_key: None,
        }
    }
}

impl AgentConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join(CONFIG_FILE_NAME)
    }

    /// Load config from persona_config.toml (next to executable), falling back
    /// to defaults + env vars.
    pub fn load() -> Self {
        let path = Self::config_path();
        match Self::load_from(&path) {
            Some(config) => config,
            None => {
                tracing::warn!("No config file found, using defaults + env vars");
                Self::from_env()
            }
        }
    }

    pub fn load_from(path: &Path) -> Option<Self> {
        let contents = fs::read_to_string(path).ok()?;
        match toml::from_str::<AgentConfig>(&contents) {
            Ok(config) => {
                tracing::info!("Loaded config from {:?}", path);
                Some(config)
            }
            Err(e) => {
                tracing::error!("Failed to parse {:?}: {}", path, e);
                None
            }
        }
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn persistence_configured(&self) -> bool {
        is_set(&self.kv_rest_url) && is_set(&self.kv_rest_token)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = env::var("PERSONA_NAME") {
            if !name.trim().is_empty() {
                config.persona_name = name;
            }
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(model) = env::var("LLM_VIDEO_MODEL") {
            config.llm_video_model = Some(model);
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(url) = env::var("PERSONA_KV_URL") {
            config.kv_rest_url = Some(url);
        }

        if let Ok(token) = env::var("PERSONA_KV_TOKEN") {
            config.kv_rest_token = Some(token);
        }

        if let Ok(enabled) = env::var("PERSONA_ENABLE_REFLECTION") {
            config.enable_reflection = parse_flag(&enabled);
        }

        if let Ok(limit) = env::var("PERSONA_MAX_TURN_ITERATIONS") {
            if let Ok(limit) = limit.parse::<usize>() {
                config.max_turn_iterations = limit.max(1);
            }
        }

        if let Ok(url) = env::var("PERSONA_SEARCH_API_URL") {
            config.search_api_url = Some(url);
        }

        if let Ok(key) = env::var("PERSONA_SEARCH_API_KEY") {
            config.search_api_key = Some(key);
        }

        if let Ok(url) = env::var("PERSONA_COMMERCE_API_URL") {
            config.commerce_api_url = Some(url);
        }

        if let Ok(token) = env::var("PERSONA_COMMERCE_API_TOKEN") {
            config.commerce_api_token = Some(token);
        }

        if let Ok(url) = env::var("PERSONA_IMAGE_API_URL") {
            config.image_api_url = Some(url);
        }

        if let Ok(key) = env::var("PERSONA_IMAGE_API_KEY") {
            config.image_api_key = Some(key);
        }

        config
    }
}

pub(crate) fn is_set(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("1")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            "persona_name = \"Ada\"\nkv_rest_url = \"https://kv.example.com\"\n",
        )
        .unwrap();

        let config = AgentConfig::load_from(&path).unwrap();
        assert_eq!(config.persona_name, "Ada");
        assert_eq!(config.backup_cap, 20);
        assert_eq!(config.max_turn_iterations, 16);
        assert_eq!(config.save_debounce_ms, 1000);
        assert!(config.enable_reflection);
        assert!(!config.persistence_configured());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = AgentConfig::default();
        config.kv_rest_url = Some("https://kv.example.com".to_string());
        config.kv_rest_token = Some("secret".to_string());
        config.decay_amount = 2.5;
        config.save_to(&path).unwrap();

        let loaded = AgentConfig::load_from(&path).unwrap();
        assert!(loaded.persistence_configured());
        assert_eq!(loaded.decay_amount, 2.5);
    }

    #[test]
    fn unparseable_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "backup_cap = \"lots\"").unwrap();
        assert!(AgentConfig::load_from(&path).is_none());
    }

    #[test]
    fn flags_accept_common_truthy_spellings() {
        assert!(parse_flag("YES"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("off"));
    }
}
