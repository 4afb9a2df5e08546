use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use super::GeneratedModule;
use crate::mcp::ProviderSpec;

/// How much of a provider's interface goes into the decision-maker's prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureMode {
    /// Module path, tool count and where the docs live.
    #[default]
    Summary,
    /// Every stub signature inline.
    Detailed,
}

impl std::str::FromStr for ExposureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(Self::Summary),
            "detailed" => Ok(Self::Detailed),
            other => Err(format!("unknown exposure mode: {other}")),
        }
    }
}

/// Prompt-facing description of one generated module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderSummary {
    pub provider: String,
    pub module_path: String,
    pub import_path: String,
    pub docs_path: String,
    pub tool_count: usize,
    pub purpose: String,
}

impl ProviderSummary {
    #[must_use]
    pub fn one_line(&self) -> String {
        format!(
            "{} ({}, {} tool(s)): {}",
            self.provider, self.module_path, self.tool_count, self.purpose
        )
    }
}

const GUIDANCE: &str = "IMPORTANT: Signatures for the modules above are not listed here. \
Before calling a tool, read its documentation under tools/docs/<module>/ or the module \
source in tools/<module>.py. Call tools from your code, keep large results in data/ or \
results/, and print only the compact values you need.";

/// Renders the tool section of the decision-maker's prompt.
///
/// `specs` supplies provider descriptions, instructions and per-provider
/// exposure overrides; modules without a spec fall back to `default_mode`.
#[must_use]
pub fn render_summaries(
    modules: &[GeneratedModule],
    specs: &BTreeMap<String, ProviderSpec>,
    default_mode: ExposureMode,
) -> String {
    if modules.is_empty() {
        return "No tool providers available.".to_string();
    }

    let mut out = String::from("Available tool modules:\n");
    let mut needs_guidance = false;
    for module in modules {
        let spec = specs.get(&module.provider);
        let mode = spec
            .and_then(|s| s.tool_exposure_mode)
            .unwrap_or(default_mode);
        let description = spec
            .map(|s| s.description.trim())
            .filter(|d| !d.is_empty())
            .unwrap_or(module.summary.purpose.as_str());

        let _ = write!(out, "\n{}: {}\n", module.provider, description);
        if let Some(instruction) = spec
            .map(|s| s.instruction.trim())
            .filter(|i| !i.is_empty())
        {
            let _ = writeln!(out, "  Instructions: {instruction}");
        }
        let _ = writeln!(out, "  - Module: {}", module.summary.module_path);
        match mode {
            ExposureMode::Summary => {
                needs_guidance = true;
                let _ = writeln!(
                    out,
                    "  - Tools: {} tool(s) available",
                    module.summary.tool_count
                );
                let _ = writeln!(
                    out,
                    "  - Import: from {} import <tool_name>",
                    module.summary.import_path
                );
                let _ = writeln!(out, "  - Documentation: {}*.md", module.summary.docs_path);
            }
            ExposureMode::Detailed => {
                let _ = writeln!(
                    out,
                    "  - Import: from {} import <tool_name>",
                    module.summary.import_path
                );
                let _ = writeln!(out, "  - Tools:");
                for stub in &module.stubs {
                    let _ = writeln!(out, "    - {}", stub.listing());
                }
            }
        }
    }

    if needs_guidance {
        out.push('\n');
        out.push_str(GUIDANCE);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::generate;
    use crate::mcp::{McpToolDef, ToolDescriptor};
    use serde_json::json;

    fn module(provider: &str) -> GeneratedModule {
        let def: McpToolDef = serde_json::from_value(json!({
            "name": "search",
            "description": "Search documents.",
            "inputSchema": {
                "properties": {"query": {"type": "string"}, "limit": {"type": "integer", "default": 5}},
                "required": ["query"]
            }
        }))
        .unwrap();
        generate(provider, &[ToolDescriptor::from_def(provider, &def)]).unwrap()
    }

    #[test]
    fn test_empty_summary() {
        assert_eq!(
            render_summaries(&[], &BTreeMap::new(), ExposureMode::Summary),
            "No tool providers available."
        );
    }

    #[test]
    fn test_summary_mode_lists_paths_and_guidance() {
        let mut specs = BTreeMap::new();
        specs.insert(
            "alpha".to_string(),
            ProviderSpec {
                description: "Document search".into(),
                instruction: "Prefer narrow queries.".into(),
                ..ProviderSpec::stdio("alpha", "alpha-server")
            },
        );
        let text = render_summaries(&[module("alpha")], &specs, ExposureMode::Summary);
        assert!(text.contains("alpha: Document search"));
        assert!(text.contains("  Instructions: Prefer narrow queries."));
        assert!(text.contains("  - Module: tools/alpha.py"));
        assert!(text.contains("  - Tools: 1 tool(s) available"));
        assert!(text.contains("  - Import: from tools.alpha import <tool_name>"));
        assert!(text.contains("  - Documentation: tools/docs/alpha/*.md"));
        assert!(text.contains("IMPORTANT:"));
        assert!(!text.contains("search(query"));
    }

    #[test]
    fn test_detailed_override_lists_signatures() {
        let mut specs = BTreeMap::new();
        specs.insert(
            "alpha".to_string(),
            ProviderSpec {
                tool_exposure_mode: Some(ExposureMode::Detailed),
                ..ProviderSpec::stdio("alpha", "alpha-server")
            },
        );
        let text = render_summaries(&[module("alpha")], &specs, ExposureMode::Summary);
        assert!(text.contains("    - search(query: str, limit: int = 5) -> Any: Search documents."));
        assert!(!text.contains("IMPORTANT:"));
    }

    #[test]
    fn test_exposure_mode_parse() {
        assert_eq!("Detailed".parse::<ExposureMode>(), Ok(ExposureMode::Detailed));
        assert!("verbose".parse::<ExposureMode>().is_err());
    }
}
