use convo_core::{ConvoError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

mod env_substitution;

pub use env_substitution::substitute_env_vars;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent: AgentSettings,
    #[serde(default)]
    pub aws: AwsSettings,
    /// Omitting the section keeps tool pairs intact by protecting recent
    /// messages; an explicit section without `protect_recent_messages` uses
    /// the flat `keep_recent_items` slice.
    #[serde(default = "default_compression")]
    pub compression: CompressorConfig,
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub name: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Upper bound on follow-up turns triggered by tool calls within one chat.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsSettings {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

/// History compression policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressorConfig {
    #[serde(default = "default_summarize_after_items")]
    pub summarize_after_items: usize,
    #[serde(default = "default_keep_recent_items")]
    pub keep_recent_items: usize,
    /// Advisory; only passed to the summarizer as an instruction.
    #[serde(default = "default_max_summary_length")]
    pub max_summary_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_watermark: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protect_recent_messages: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,
}

impl AgentConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConvoError::ConfigError(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut raw: serde_json::Value = serde_yaml::from_str(yaml)
            .map_err(|e| ConvoError::ConfigError(format!("Failed to parse YAML: {}", e)))?;

        substitute_env_vars(&mut raw)?;

        let mut config: AgentConfig = serde_json::from_value(raw)
            .map_err(|e| ConvoError::ConfigError(format!("Invalid configuration: {}", e)))?;

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    fn expand_env_vars(&mut self) {
        if let Ok(home_dir) = env::var("HOME_DIR") {
            self.storage.home_dir = PathBuf::from(home_dir);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.agent.name.is_empty() {
            return Err(ConvoError::ConfigError("Agent name cannot be empty".into()));
        }
        if self.agent.model.is_empty() {
            return Err(ConvoError::ConfigError("Model cannot be empty".into()));
        }
        if self.aws.region.is_empty() {
            return Err(ConvoError::ConfigError("AWS region cannot be empty".into()));
        }
        if self.agent.temperature < 0.0 || self.agent.temperature > 1.0 {
            return Err(ConvoError::ConfigError("Temperature must be between 0.0 and 1.0".into()));
        }
        if self.agent.max_tool_rounds == 0 {
            return Err(ConvoError::ConfigError("max_tool_rounds must be at least 1".into()));
        }
        if self.compression.keep_recent_items == 0 && self.compression.protect_recent_messages.is_none() {
            return Err(ConvoError::ConfigError(
                "keep_recent_items must be at least 1 when protect_recent_messages is unset".into(),
            ));
        }
        Ok(())
    }

    pub fn default_config_path() -> PathBuf {
        default_home_dir().join(".convo-agent").join("agent.yaml")
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent: AgentSettings {
                name: "convo-agent".to_string(),
                model: "anthropic.claude-3-5-sonnet-20240620-v1:0".to_string(),
                temperature: default_temperature(),
                max_tokens: default_max_tokens(),
                system_prompt: None,
                max_tool_rounds: default_max_tool_rounds(),
            },
            aws: AwsSettings::default(),
            compression: default_compression(),
            storage: StorageSettings::default(),
        }
    }
}

impl AgentSettings {
    pub fn get_system_prompt(&self) -> String {
        self.system_prompt.clone().unwrap_or_else(|| {
            "You are a helpful assistant. Use the available tools when they help answer the user."
                .to_string()
        })
    }
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            region: default_region(),
            profile: None,
        }
    }
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            summarize_after_items: default_summarize_after_items(),
            keep_recent_items: default_keep_recent_items(),
            max_summary_length: default_max_summary_length(),
            token_watermark: None,
            protect_recent_messages: None,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            home_dir: default_home_dir(),
        }
    }
}

fn default_temperature() -> f32 { 0.7 }
fn default_max_tokens() -> usize { 4096 }
fn default_max_tool_rounds() -> usize { 10 }
fn default_region() -> String { "us-east-1".to_string() }
fn default_summarize_after_items() -> usize { 20 }
fn default_keep_recent_items() -> usize { 10 }
fn default_max_summary_length() -> usize { 500 }
fn default_protect_recent_messages() -> usize { 6 }
fn default_backend() -> StorageBackend { StorageBackend::File }

fn default_compression() -> CompressorConfig {
    CompressorConfig {
        protect_recent_messages: Some(default_protect_recent_messages()),
        ..CompressorConfig::default()
    }
}

fn default_home_dir() -> PathBuf {
    env::var("HOME_DIR")
        .unwrap_or_else(|_| env::var("HOME").unwrap_or_else(|_| ".".to_string()))
        .into()
}
