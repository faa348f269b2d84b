//! Configuration for the memory daemon
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.claude-mem/config.toml)
//! 3. Built-in defaults (lowest priority)
//!
//! The recognized environment keys are the `CLAUDE_MEM_*` family the hook
//! scripts also read, so one settings surface drives both sides.

use crate::llm::LlmSettings;
use crate::procs::ReaperConfig;
use crate::workers::{EventWorkerSettings, SummaryWorkerSettings};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the intake server binds to (loopback only by default)
    pub bind_addr: SocketAddr,

    /// Path to the embedded store (queue + memory tables share one file)
    pub db_path: PathBuf,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// LLM provider settings
    pub llm: LlmSettings,

    /// Event summarizer tuning
    pub event_worker: EventWorkerSettings,

    /// Summary summarizer tuning
    pub summary_worker: SummaryWorkerSettings,

    /// Orphan reaper tuning
    pub reaper: ReaperConfig,

    /// Override for the event-summarization preamble (mode fragment)
    pub mode_preamble: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:37777".parse().unwrap(),
            db_path: Self::default_db_path(),
            logging: LoggingConfig::default(),
            llm: LlmSettings::default(),
            event_worker: EventWorkerSettings::default(),
            summary_worker: SummaryWorkerSettings::default(),
            reaper: ReaperConfig::default(),
            mode_preamble: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Enable rolling file logging in addition to stdout
    pub file_enabled: bool,
    /// Directory for log files
    pub file_dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_enabled: false, // Opt-in feature
            file_dir: Config::home_dir().join("logs"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,
    pub db_path: Option<String>,
    pub mode_preamble: Option<String>,

    /// Optional [logging] section
    pub logging: Option<FileLogging>,

    /// Optional [llm] section
    pub llm: Option<FileLlm>,

    /// Optional [workers] section
    pub workers: Option<FileWorkers>,

    /// Optional [reaper] section
    pub reaper: Option<FileReaper>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileLogging {
    pub level: Option<String>,
    pub file_enabled: Option<bool>,
    pub file_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileLlm {
    pub provider: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileWorkers {
    pub event_tick_ms: Option<u64>,
    pub event_batch_size: Option<usize>,
    pub summary_tick_ms: Option<u64>,
    pub summary_batch_size: Option<usize>,
    pub stall_threshold_ms: Option<u64>,
    pub retention_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileReaper {
    pub scan_interval_secs: Option<u64>,
    pub max_age_secs: Option<u64>,
    pub pattern: Option<String>,
    pub graceful_timeout_ms: Option<u64>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// State directory: ~/.claude-mem
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude-mem")
    }

    /// Config file path: ~/.claude-mem/config.toml
    pub fn config_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    fn default_db_path() -> PathBuf {
        Self::home_dir().join("memory.db")
    }

    /// Create config file with defaults if it doesn't exist
    /// Called during startup to help users discover configuration options
    pub fn ensure_config_exists() {
        let path = Self::config_path();
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return; // Config is optional
            }
        }
        let _ = std::fs::write(&path, Self::default().to_toml());
    }

    /// Render the effective configuration as a TOML template.
    pub fn to_toml(&self) -> String {
        format!(
            r#"# claude-mem configuration
# Values commented out fall back to built-in defaults.
# Environment variables (CLAUDE_MEM_*) override everything here.

bind_addr = "{bind_addr}"
db_path = "{db_path}"

[logging]
level = "{log_level}"
file_enabled = {file_enabled}
file_dir = "{file_dir}"

[llm]
# provider: "openrouter" or "gemini"
provider = "{provider}"
openrouter_model = "{openrouter_model}"
gemini_model = "{gemini_model}"
# API keys belong in the environment:
#   CLAUDE_MEM_OPENROUTER_API_KEY / CLAUDE_MEM_GEMINI_API_KEY

[workers]
event_tick_ms = {event_tick_ms}
event_batch_size = {event_batch_size}
summary_tick_ms = {summary_tick_ms}
summary_batch_size = {summary_batch_size}
stall_threshold_ms = {stall_threshold_ms}
retention_ms = {retention_ms}

[reaper]
scan_interval_secs = {scan_interval_secs}
max_age_secs = {max_age_secs}
pattern = "{pattern}"
graceful_timeout_ms = {graceful_timeout_ms}
"#,
            bind_addr = self.bind_addr,
            db_path = self.db_path.display(),
            log_level = self.logging.level,
            file_enabled = self.logging.file_enabled,
            file_dir = self.logging.file_dir.display(),
            provider = self.llm.provider,
            openrouter_model = self.llm.openrouter_model,
            gemini_model = self.llm.gemini_model,
            event_tick_ms = self.event_worker.tick_interval.as_millis(),
            event_batch_size = self.event_worker.batch_size,
            summary_tick_ms = self.summary_worker.tick_interval.as_millis(),
            summary_batch_size = self.summary_worker.batch_size,
            stall_threshold_ms = self.event_worker.stall_threshold.as_millis(),
            retention_ms = self.event_worker.retention.as_millis(),
            scan_interval_secs = self.reaper.scan_interval.as_secs(),
            max_age_secs = self.reaper.max_age.as_secs(),
            pattern = self.reaper.pattern,
            graceful_timeout_ms = self.reaper.graceful_timeout.as_millis(),
        )
    }

    /// Load file config if it exists
    ///
    /// A config file that exists but cannot be parsed is a fatal error -
    /// failing fast beats silently running on defaults while the user
    /// debugs the wrong thing.
    fn load_file_config() -> FileConfig {
        let path = Self::config_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to parse config file {}:\n  {}", path.display(), e);
                    eprintln!("To reset, delete the file and restart claude-mem.");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("Cannot read config file {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env vars > file > defaults
    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        Self::merge(file)
    }

    pub(crate) fn merge(file: FileConfig) -> Self {
        let defaults = Self::default();

        let bind_addr = std::env::var("CLAUDE_MEM_BIND")
            .ok()
            .or(file.bind_addr)
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.bind_addr);

        let db_path = std::env::var("CLAUDE_MEM_DB")
            .ok()
            .or(file.db_path)
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let logging = {
            let section = file.logging.unwrap_or_default();
            let base = LoggingConfig::default();
            LoggingConfig {
                level: std::env::var("CLAUDE_MEM_LOG")
                    .ok()
                    .or(section.level)
                    .unwrap_or(base.level),
                file_enabled: section.file_enabled.unwrap_or(base.file_enabled),
                file_dir: section.file_dir.map(PathBuf::from).unwrap_or(base.file_dir),
            }
        };

        let llm = {
            let section = file.llm.unwrap_or_default();
            let base = LlmSettings::default();
            LlmSettings {
                provider: std::env::var("CLAUDE_MEM_PROVIDER")
                    .ok()
                    .or(section.provider)
                    .unwrap_or(base.provider),
                openrouter_api_key: std::env::var("CLAUDE_MEM_OPENROUTER_API_KEY")
                    .ok()
                    .or(section.openrouter_api_key),
                openrouter_model: std::env::var("CLAUDE_MEM_OPENROUTER_MODEL")
                    .ok()
                    .or(section.openrouter_model)
                    .unwrap_or(base.openrouter_model),
                gemini_api_key: std::env::var("CLAUDE_MEM_GEMINI_API_KEY")
                    .ok()
                    .or(section.gemini_api_key),
                gemini_model: std::env::var("CLAUDE_MEM_GEMINI_MODEL")
                    .ok()
                    .or(section.gemini_model)
                    .unwrap_or(base.gemini_model),
            }
        };

        let workers = file.workers.unwrap_or_default();
        let event_worker = {
            let base = EventWorkerSettings::default();
            EventWorkerSettings {
                tick_interval: workers
                    .event_tick_ms
                    .map(Duration::from_millis)
                    .unwrap_or(base.tick_interval),
                batch_size: workers.event_batch_size.unwrap_or(base.batch_size),
                stall_threshold: workers
                    .stall_threshold_ms
                    .map(Duration::from_millis)
                    .unwrap_or(base.stall_threshold),
                retention: workers
                    .retention_ms
                    .map(Duration::from_millis)
                    .unwrap_or(base.retention),
                ..base
            }
        };
        let summary_worker = {
            let base = SummaryWorkerSettings::default();
            SummaryWorkerSettings {
                tick_interval: workers
                    .summary_tick_ms
                    .map(Duration::from_millis)
                    .unwrap_or(base.tick_interval),
                batch_size: workers.summary_batch_size.unwrap_or(base.batch_size),
                stall_threshold: workers
                    .stall_threshold_ms
                    .map(Duration::from_millis)
                    .unwrap_or(base.stall_threshold),
                retention: workers
                    .retention_ms
                    .map(Duration::from_millis)
                    .unwrap_or(base.retention),
                ..base
            }
        };

        let reaper = {
            let section = file.reaper.unwrap_or_default();
            let base = ReaperConfig::default();
            ReaperConfig {
                scan_interval: section
                    .scan_interval_secs
                    .map(Duration::from_secs)
                    .unwrap_or(base.scan_interval),
                max_age: section
                    .max_age_secs
                    .map(Duration::from_secs)
                    .unwrap_or(base.max_age),
                pattern: section.pattern.unwrap_or(base.pattern),
                graceful_timeout: section
                    .graceful_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(base.graceful_timeout),
            }
        };

        Self {
            bind_addr,
            db_path,
            logging,
            llm,
            event_worker,
            summary_worker,
            reaper,
            mode_preamble: file.mode_preamble,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_addr.port(), 37777);
        assert!(config.bind_addr.ip().is_loopback());
        assert_eq!(config.llm.provider, "openrouter");
        assert_eq!(config.event_worker.batch_size, 10);
        assert_eq!(config.summary_worker.batch_size, 5);
        assert_eq!(config.reaper.max_age, Duration::from_secs(30 * 60));
    }

    /// Default config must round-trip through the TOML template.
    #[test]
    fn test_config_roundtrip_default() {
        let toml_str = Config::default().to_toml();
        let parsed: Result<FileConfig, _> = toml::from_str(&toml_str);
        assert!(
            parsed.is_ok(),
            "Default config should round-trip.\nTOML:\n{}\nError: {:?}",
            toml_str,
            parsed.err()
        );
    }

    #[test]
    fn test_file_values_override_defaults() {
        let file: FileConfig = toml::from_str(
            r#"
            bind_addr = "127.0.0.1:4242"

            [llm]
            provider = "gemini"
            gemini_model = "gemini-1.5-pro"

            [workers]
            event_tick_ms = 500
            event_batch_size = 3

            [reaper]
            pattern = "my-agent"
            max_age_secs = 60
            "#,
        )
        .unwrap();

        let config = Config::merge(file);
        assert_eq!(config.bind_addr.port(), 4242);
        assert_eq!(config.llm.provider, "gemini");
        assert_eq!(config.llm.gemini_model, "gemini-1.5-pro");
        // Untouched llm field keeps its default
        assert_eq!(config.llm.openrouter_model, "openai/gpt-4o-mini");
        assert_eq!(config.event_worker.tick_interval, Duration::from_millis(500));
        assert_eq!(config.event_worker.batch_size, 3);
        // Summary worker untouched by event overrides
        assert_eq!(config.summary_worker.batch_size, 5);
        assert_eq!(config.reaper.pattern, "my-agent");
        assert_eq!(config.reaper.max_age, Duration::from_secs(60));
    }

    #[test]
    fn test_empty_file_config_is_all_defaults() {
        let file: FileConfig = toml::from_str("").unwrap();
        let config = Config::merge(file);
        let defaults = Config::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.llm.provider, defaults.llm.provider);
        assert_eq!(
            config.event_worker.tick_interval,
            defaults.event_worker.tick_interval
        );
    }

    #[test]
    fn test_stall_threshold_applies_to_both_workers() {
        let file: FileConfig = toml::from_str(
            r#"
            [workers]
            stall_threshold_ms = 1234
            "#,
        )
        .unwrap();
        let config = Config::merge(file);
        assert_eq!(
            config.event_worker.stall_threshold,
            Duration::from_millis(1234)
        );
        assert_eq!(
            config.summary_worker.stall_threshold,
            Duration::from_millis(1234)
        );
    }
}
