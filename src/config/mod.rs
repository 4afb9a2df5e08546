use crate::codegen::ExposureMode;
use crate::error::{Error, Result};
use crate::mcp::ProviderSpec;
use crate::session::SessionSettings;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,

    /// Tool providers, keyed by name.
    pub providers: BTreeMap<String, ProviderSpec>,

    pub mcp: McpSettings,
    pub session: SessionConfig,
    pub orchestrator: OrchestratorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    /// Default for providers without their own override.
    pub tool_exposure_mode: ExposureMode,
    pub invoke_timeout_secs: u64,
    /// Serve the loopback invocation bridge for generated modules.
    pub bridge: bool,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            tool_exposure_mode: ExposureMode::Summary,
            invoke_timeout_secs: 60,
            bridge: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Where local environments live. Default: `<data_dir>/environments`.
    pub backend_root: Option<PathBuf>,
    pub interpreter: String,
    pub code_extension: String,
    pub run_timeout_secs: u64,
    pub max_output_bytes: usize,
    pub max_code_length: usize,
    /// Regexes; matching code is rejected before it runs.
    pub blocked_patterns: Vec<String>,
    /// Largest file the file tools may write, in bytes. 0 disables the check.
    pub max_file_size: usize,
    /// Keep the primary environment between runs.
    pub persist: bool,
    pub max_age_hours: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let defaults = SessionSettings::default();
        Self {
            backend_root: None,
            interpreter: defaults.interpreter,
            code_extension: defaults.code_extension,
            run_timeout_secs: defaults.default_timeout.as_secs(),
            max_output_bytes: defaults.max_output_bytes,
            max_code_length: defaults.max_code_length,
            blocked_patterns: Vec::new(),
            max_file_size: defaults.max_file_size,
            persist: false,
            max_age_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrent_tasks: usize,
    pub wait_timeout_secs: u64,
    /// Directory of YAML role files. Default: `<config_dir>/ptc/roles`.
    pub roles_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            wait_timeout_secs: 300,
            roles_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when neither `PTC_LOG` nor `RUST_LOG` is set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|d| d.join("ptc"))
            .unwrap_or_else(|| PathBuf::from(".ptc"));

        Self {
            data_dir,
            providers: BTreeMap::new(),
            mcp: McpSettings::default(),
            session: SessionConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("ptc"))
        .unwrap_or_else(|| PathBuf::from(".ptc"))
}

impl Config {
    /// Default location of the config file.
    pub fn config_path() -> PathBuf {
        config_dir().join("config.toml")
    }

    /// Loads the default config file, or defaults if there is none.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&content).map_err(|e| match e {
            Error::Config(message) => Error::Config(format!("{}: {message}", path.display())),
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Path to the sessions `SQLite` database.
    pub fn sessions_db_path(&self) -> PathBuf {
        self.data_dir.join("sessions.db")
    }

    pub fn backend_root(&self) -> PathBuf {
        self.session
            .backend_root
            .clone()
            .unwrap_or_else(|| self.data_dir.join("environments"))
    }

    pub fn roles_dir(&self) -> PathBuf {
        self.orchestrator
            .roles_dir
            .clone()
            .unwrap_or_else(|| config_dir().join("roles"))
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.mcp.invoke_timeout_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestrator.wait_timeout_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.session.max_age_hours * 60 * 60)
    }

    /// Provider specs with names filled from their table keys.
    pub fn provider_specs(&self) -> BTreeMap<String, ProviderSpec> {
        self.providers
            .iter()
            .map(|(key, spec)| {
                let mut spec = spec.clone();
                if spec.name.is_empty() {
                    spec.name.clone_from(key);
                }
                (spec.name.clone(), spec)
            })
            .collect()
    }

    /// Session settings with blocked patterns compiled.
    pub fn session_settings(&self) -> Result<SessionSettings> {
        let blocked_patterns = self
            .session
            .blocked_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| Error::Config(format!("blocked pattern `{p}`: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SessionSettings {
            interpreter: self.session.interpreter.clone(),
            code_extension: self.session.code_extension.clone(),
            default_timeout: Duration::from_secs(self.session.run_timeout_secs),
            max_output_bytes: self.session.max_output_bytes,
            max_code_length: self.session.max_code_length,
            blocked_patterns,
            max_file_size: self.session.max_file_size,
        })
    }

    /// Short hash of the settings a persisted environment depends on.
    /// A change means the environment is rebuilt instead of reattached.
    pub fn config_hash(&self) -> String {
        #[derive(Serialize)]
        struct Shape<'a> {
            providers: BTreeMap<String, ProviderSpec>,
            backend_root: PathBuf,
            interpreter: &'a str,
            code_extension: &'a str,
        }
        let shape = Shape {
            providers: self.provider_specs(),
            backend_root: self.backend_root(),
            interpreter: &self.session.interpreter,
            code_extension: &self.session.code_extension,
        };
        let encoded = serde_json::to_vec(&shape).unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        format!("{digest:x}")[..8].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::TransportKind;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
data_dir = "/tmp/ptc-data"

[providers.search]
command = "search-server"
args = ["--stdio"]
description = "Web search"

[providers.docs]
transport = "http"
url = "http://127.0.0.1:9000/rpc"
tool_exposure_mode = "detailed"
enabled = false

[mcp]
tool_exposure_mode = "summary"
invoke_timeout_secs = 30

[session]
interpreter = "python3.12"
blocked_patterns = ["rm\\s+-rf"]
max_file_size = 2048
persist = true

[orchestrator]
max_concurrent_tasks = 5
"#;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.providers.is_empty());
        assert_eq!(config.mcp.invoke_timeout_secs, 60);
        assert!(config.mcp.bridge);
        assert_eq!(config.session.interpreter, "python3");
        assert_eq!(config.session.run_timeout_secs, 120);
        assert_eq!(config.session.max_file_size, 10 * 1024 * 1024);
        assert_eq!(config.orchestrator.max_concurrent_tasks, 3);
        assert_eq!(config.max_age(), Duration::from_secs(24 * 3600));
        assert_eq!(config.backend_root(), config.data_dir.join("environments"));
    }

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/ptc-data"));
        assert_eq!(config.invoke_timeout(), Duration::from_secs(30));
        assert_eq!(config.orchestrator.max_concurrent_tasks, 5);
        // Unset fields keep their defaults.
        assert_eq!(config.orchestrator.wait_timeout_secs, 300);
        assert!(config.session.persist);

        let specs = config.provider_specs();
        let search = &specs["search"];
        assert_eq!(search.name, "search");
        assert_eq!(search.transport, TransportKind::Stdio);
        assert_eq!(search.command.as_deref(), Some("search-server"));
        assert!(search.enabled);
        let docs = &specs["docs"];
        assert_eq!(docs.transport, TransportKind::Http);
        assert!(!docs.enabled);
        assert_eq!(docs.tool_exposure_mode, Some(ExposureMode::Detailed));
    }

    #[test]
    fn test_session_settings() {
        let config = Config::parse(SAMPLE).unwrap();
        let settings = config.session_settings().unwrap();
        assert_eq!(settings.interpreter, "python3.12");
        assert_eq!(settings.blocked_patterns.len(), 1);
        assert!(settings.blocked_patterns[0].is_match("rm  -rf /"));
        assert_eq!(settings.max_file_size, 2048);

        let mut bad = config;
        bad.session.blocked_patterns = vec!["(".to_string()];
        assert!(matches!(bad.session_settings(), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_hash() {
        let config = Config::parse(SAMPLE).unwrap();
        let hash = config.config_hash();
        assert_eq!(hash.len(), 8);
        assert_eq!(hash, Config::parse(SAMPLE).unwrap().config_hash());

        // Limits do not invalidate an environment; the interpreter does.
        let mut limits = config.clone();
        limits.session.max_output_bytes = 1;
        assert_eq!(limits.config_hash(), hash);
        let mut interpreter = config;
        interpreter.session.interpreter = "pypy3".to_string();
        assert_ne!(interpreter.config_hash(), hash);
    }

    #[test]
    fn test_load_from() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.providers.len(), 2);

        std::fs::write(&path, "providers = 3").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
        assert!(matches!(
            Config::load_from(&dir.path().join("missing.toml")),
            Err(Error::Config(_))
        ));
    }
}
