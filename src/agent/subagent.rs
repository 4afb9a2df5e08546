//! Sub-agent roles: named configurations background tasks run under.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Configuration for a role loaded from YAML files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleConfig {
    pub name: String,
    pub description: String,
    /// Tool whitelist; empty allows every tool.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Additional system prompt context for the decision-maker.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Decision steps before the runner should stop (default 10).
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

fn default_max_iterations() -> usize {
    10
}

impl RoleConfig {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            tools: Vec::new(),
            system_prompt: None,
            max_iterations: default_max_iterations(),
        }
    }

    #[must_use]
    pub fn allows_tool(&self, tool: &str) -> bool {
        self.tools.is_empty() || self.tools.iter().any(|t| t == tool)
    }
}

/// Summary of an available role (for listing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleSummary {
    pub name: String,
    pub description: String,
}

/// Registry of available roles.
#[derive(Debug, Clone, Default)]
pub struct RoleRegistry {
    configs: BTreeMap<String, RoleConfig>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the `general` and `research` roles.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(RoleConfig::new(
            "general",
            "General-purpose worker for multi-step sub-tasks",
        ));
        let mut research = RoleConfig::new(
            "research",
            "Gathers information with the available tools and reports a summary",
        );
        research.system_prompt = Some(
            "Write intermediate data to data/ and keep only a short summary in the report."
                .to_string(),
        );
        registry.register(research);
        registry
    }

    /// Adds or replaces a role.
    pub fn register(&mut self, config: RoleConfig) {
        self.configs.insert(config.name.clone(), config);
    }

    /// Load role configs from a directory. Unreadable or malformed files are
    /// skipped with a warning.
    pub fn load_directory(&mut self, dir: &Path) -> Result<usize> {
        let mut count = 0;

        if !dir.exists() {
            return Ok(0);
        }

        for entry in std::fs::read_dir(dir)?.flatten() {
            let path = entry.path();

            // Look for .yaml or .yml files
            if !path.extension().is_some_and(|e| e == "yaml" || e == "yml") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|content| Ok(serde_yaml::from_str::<RoleConfig>(&content)?));
            match parsed {
                Ok(config) => {
                    tracing::debug!(role = %config.name, path = %path.display(), "Loaded role");
                    self.register(config);
                    count += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Skipping role file: {}", e);
                }
            }
        }

        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<&RoleConfig> {
        self.configs.get(name)
    }

    /// All roles, by name.
    pub fn list(&self) -> Vec<RoleSummary> {
        self.configs
            .values()
            .map(|c| RoleSummary {
                name: c.name.clone(),
                description: c.description.clone(),
            })
            .collect()
    }
}
