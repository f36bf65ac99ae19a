use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GateflowError, Result};

/// Top-level gateflow configuration (`gateflow.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub human_gate: HumanGateConfig,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

/// Execution engine limits and defaults applied to every flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Recycle loops allowed per gate visit before the gate aborts.
    #[serde(default = "default_max_recycles")]
    pub max_recycles: u32,
    /// Episodic examples handed to an agent when a node asks for them without a count.
    #[serde(default = "default_episodic_top_k")]
    pub episodic_top_k: usize,
    /// Per-attempt agent timeout used when a node sets none.
    #[serde(default)]
    pub default_agent_timeout_secs: Option<u64>,
    /// Worker concurrency used when an orchestrator_workers node sets none.
    #[serde(default = "default_max_workers")]
    pub default_max_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_recycles: default_max_recycles(),
            episodic_top_k: default_episodic_top_k(),
            default_agent_timeout_secs: None,
            default_max_workers: default_max_workers(),
        }
    }
}

fn default_max_recycles() -> u32 { 3 }
fn default_episodic_top_k() -> usize { 3 }
fn default_max_workers() -> usize { 4 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file. `~/` is expanded.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String { "gateflow.db".to_string() }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1 = execution + gate decisions, 2 = + node visits and halts, 3 = everything.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "logs".to_string() }
fn default_log_level() -> u8 { 2 }

/// Human gate defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanGateConfig {
    /// Deadline applied to human gates that declare none. `None` waits forever.
    #[serde(default)]
    pub default_deadline_secs: Option<u64>,
    /// Actor name recorded for decisions entered on the terminal.
    #[serde(default = "default_actor")]
    pub actor: String,
}

impl Default for HumanGateConfig {
    fn default() -> Self {
        Self {
            default_deadline_secs: None,
            actor: default_actor(),
        }
    }
}

fn default_actor() -> String { "operator".to_string() }

/// An external agent process registered with the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Capability tags used to route tasks by `required_tags`.
    #[serde(default)]
    pub tags: Vec<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
}

fn default_agent_timeout() -> u64 { 120 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| GateflowError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| GateflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(log) = &self.log {
            if !(1..=3).contains(&log.level) {
                return Err(GateflowError::Config(format!(
                    "log.level must be 1, 2 or 3 (got {})",
                    log.level
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.as_str()) {
                return Err(GateflowError::Config(format!(
                    "duplicate agent id '{}'",
                    agent.id
                )));
            }
        }
        Ok(())
    }

    /// Resolve the database path (expand ~).
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    /// Resolve the run log directory, if run logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log
            .as_ref()
            .filter(|l| l.enabled)
            .map(|l| expand_home(&l.log_dir))
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // unset variables stay literal
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
