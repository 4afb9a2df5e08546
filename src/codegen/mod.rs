//! Interface generator: compiles tool descriptors into Python modules whose
//! functions forward to the invocation bridge.
//!
//! Generation is pure. The same descriptor set always yields byte-identical
//! output, which is what makes installation idempotent.

mod naming;
mod render;
mod summary;

pub use naming::{function_name, identifier, module_name, param_name};
pub use render::{python_literal, python_type};
pub use summary::{ExposureMode, ProviderSummary, render_summaries};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

use crate::mcp::{ParamType, ToolDescriptor};

/// Root of the generated package inside a session.
pub const TOOLS_DIR: &str = "tools";

/// Environment variable the generated bridge module reads its endpoint from.
pub const BRIDGE_URL_VAR: &str = "PTC_BRIDGE_URL";

const INIT_SOURCE: &str = r#""""Generated tool modules, one submodule per provider.

Import functions from the provider modules, for example:

    from tools.<provider> import <tool_name>
"""
"#;

const BRIDGE_SOURCE: &str = r#""""Client side of the tool invocation bridge.

Generated; do not edit.
"""
import json
import os
import urllib.error
import urllib.request


class ToolError(RuntimeError):
    """Raised when a tool call fails. `kind` is e.g. "timeout" or "remote_fault"."""

    def __init__(self, kind, provider, tool, message):
        super().__init__(f"{provider}.{tool} failed ({kind}): {message}")
        self.kind = kind
        self.provider = provider
        self.tool = tool
        self.message = message


def invoke(provider, tool, arguments):
    url = os.environ.get("PTC_BRIDGE_URL")
    if not url:
        raise ToolError("bridge_unavailable", provider, tool, "PTC_BRIDGE_URL is not set")
    payload = json.dumps(
        {"provider": provider, "tool": tool, "arguments": arguments}
    ).encode("utf-8")
    request = urllib.request.Request(
        url.rstrip("/") + "/invoke",
        data=payload,
        headers={"Content-Type": "application/json"},
        method="POST",
    )
    try:
        with urllib.request.urlopen(request) as response:
            reply = json.loads(response.read().decode("utf-8"))
    except urllib.error.HTTPError as e:
        reply = json.loads(e.read().decode("utf-8") or "{}")
    except urllib.error.URLError as e:
        raise ToolError("bridge_unavailable", provider, tool, str(e.reason)) from None
    if "error" in reply:
        error = reply["error"]
        raise ToolError(
            error.get("kind", "remote_fault"),
            error.get("provider") or provider,
            error.get("tool") or tool,
            error.get("message", ""),
        )
    return reply.get("result")
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationErrorKind {
    DuplicateName,
    Render,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("provider `{provider}` declares tool `{name}` more than once")]
    DuplicateName { provider: String, name: String },

    #[error("`{first}` and `{second}` in provider `{provider}` both map to `{identifier}`")]
    IdentifierCollision {
        provider: String,
        first: String,
        second: String,
        identifier: String,
    },

    #[error("failed to render module for provider `{provider}`: {message}")]
    Render { provider: String, message: String },
}

impl GenerationError {
    #[must_use]
    pub fn kind(&self) -> GenerationErrorKind {
        match self {
            Self::DuplicateName { .. } | Self::IdentifierCollision { .. } => {
                GenerationErrorKind::DuplicateName
            }
            Self::Render { .. } => GenerationErrorKind::Render,
        }
    }

    #[must_use]
    pub fn provider(&self) -> &str {
        match self {
            Self::DuplicateName { provider, .. }
            | Self::IdentifierCollision { provider, .. }
            | Self::Render { provider, .. } => provider,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StubParam {
    /// Wire name, as sent to the provider.
    pub name: String,
    /// Python identifier in the stub signature.
    pub ident: String,
    pub ty: ParamType,
    pub required: bool,
    pub default: Option<Value>,
    pub description: String,
}

impl StubParam {
    fn rendered(&self) -> String {
        let hint = python_type(self.ty);
        match (self.required, &self.default) {
            (true, _) => format!("{}: {hint}", self.ident),
            (false, Some(default)) => {
                format!("{}: {hint} = {}", self.ident, python_literal(default))
            }
            (false, None) => format!("{}: Optional[{hint}] = None", self.ident),
        }
    }
}

/// One callable function in a generated module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stub {
    pub tool: String,
    pub function: String,
    /// Required parameters first, then optional ones; name order within each.
    pub params: Vec<StubParam>,
    pub returns: ParamType,
    pub description: String,
}

impl Stub {
    fn from_descriptor(
        descriptor: &ToolDescriptor,
        function: String,
    ) -> Result<Self, GenerationError> {
        let mut seen: HashMap<String, &str> = HashMap::new();
        let mut params = Vec::with_capacity(descriptor.params.len());
        for spec in descriptor
            .required_params()
            .chain(descriptor.optional_params())
        {
            let ident = param_name(&spec.name);
            if let Some(first) = seen.insert(ident.clone(), &spec.name) {
                return Err(GenerationError::IdentifierCollision {
                    provider: descriptor.provider.clone(),
                    first: format!("{}.{first}", descriptor.name),
                    second: format!("{}.{}", descriptor.name, spec.name),
                    identifier: ident,
                });
            }
            params.push(StubParam {
                name: spec.name.clone(),
                ident,
                ty: spec.ty,
                required: spec.required,
                default: spec.default.clone().filter(|d| !d.is_null()),
                description: spec.description.clone(),
            });
        }

        Ok(Self {
            tool: descriptor.name.clone(),
            function,
            params,
            returns: descriptor.returns.unwrap_or(ParamType::Any),
            description: descriptor.description.clone(),
        })
    }

    /// Parameter list without parentheses.
    #[must_use]
    pub fn signature(&self) -> String {
        self.params
            .iter()
            .map(StubParam::rendered)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// First sentence of the description.
    #[must_use]
    pub fn summary(&self) -> &str {
        let line = self.description.lines().next().unwrap_or_default();
        match line.find(". ") {
            Some(idx) => &line[..=idx],
            None => line,
        }
    }

    /// `name(sig) -> ret: summary`, as listed in detailed prompts.
    #[must_use]
    pub fn listing(&self) -> String {
        let mut line = format!(
            "{}({}) -> {}",
            self.function,
            self.signature(),
            python_type(self.returns)
        );
        if !self.summary().is_empty() {
            line.push_str(": ");
            line.push_str(self.summary());
        }
        line
    }
}

/// Stubs and documentation for one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedModule {
    pub provider: String,
    pub module_name: String,
    pub source: String,
    /// File name under [`GeneratedModule::docs_dir`] to markdown content.
    pub docs: BTreeMap<String, String>,
    pub stubs: Vec<Stub>,
    pub summary: ProviderSummary,
    /// SHA-256 over the source and docs, hex encoded.
    pub fingerprint: String,
}

impl GeneratedModule {
    #[must_use]
    pub fn module_path(&self) -> String {
        format!("{TOOLS_DIR}/{}.py", self.module_name)
    }

    #[must_use]
    pub fn docs_dir(&self) -> String {
        format!("{TOOLS_DIR}/docs/{}", self.module_name)
    }

    /// Every file of the module as `(session-relative path, content)`.
    #[must_use]
    pub fn files(&self) -> Vec<(String, &str)> {
        let mut files = vec![(self.module_path(), self.source.as_str())];
        let docs_dir = self.docs_dir();
        files.extend(
            self.docs
                .iter()
                .map(|(name, content)| (format!("{docs_dir}/{name}"), content.as_str())),
        );
        files
    }

    #[must_use]
    pub fn stub(&self, tool: &str) -> Option<&Stub> {
        self.stubs.iter().find(|s| s.tool == tool)
    }
}

/// Shared support files every session gets, as `(path, content)`.
#[must_use]
pub fn support_files() -> [(&'static str, &'static str); 2] {
    [
        ("tools/__init__.py", INIT_SOURCE),
        ("tools/_bridge.py", BRIDGE_SOURCE),
    ]
}

fn purpose(stubs: &[Stub]) -> String {
    const SHOWN: usize = 4;
    if stubs.is_empty() {
        return "no tools".to_string();
    }
    let names: Vec<&str> = stubs.iter().take(SHOWN).map(|s| s.function.as_str()).collect();
    let more = if stubs.len() > SHOWN { ", ..." } else { "" };
    format!("tools {}{more}", names.join(", "))
}

/// Compiles one provider's descriptors into a module.
pub fn generate(
    provider: &str,
    descriptors: &[ToolDescriptor],
) -> Result<GeneratedModule, GenerationError> {
    let module = module_name(provider);

    let mut ordered: Vec<&ToolDescriptor> = descriptors.iter().collect();
    ordered.sort_by(|a, b| a.name.cmp(&b.name));

    let mut tool_names = HashSet::new();
    let mut functions: HashMap<String, &str> = HashMap::new();
    let mut stubs = Vec::with_capacity(ordered.len());
    for descriptor in ordered {
        if !tool_names.insert(descriptor.name.as_str()) {
            return Err(GenerationError::DuplicateName {
                provider: provider.to_string(),
                name: descriptor.name.clone(),
            });
        }
        let function = function_name(&descriptor.name);
        if let Some(first) = functions.insert(function.clone(), &descriptor.name) {
            return Err(GenerationError::IdentifierCollision {
                provider: provider.to_string(),
                first: first.to_string(),
                second: descriptor.name.clone(),
                identifier: function,
            });
        }
        stubs.push(Stub::from_descriptor(descriptor, function)?);
    }

    let render_err = |e: minijinja::Error| GenerationError::Render {
        provider: provider.to_string(),
        message: e.to_string(),
    };
    let source = render::module_source(provider, &stubs).map_err(render_err)?;
    let mut docs = BTreeMap::new();
    docs.insert(
        "README.md".to_string(),
        render::index_doc(provider, &module, &stubs).map_err(render_err)?,
    );
    for stub in &stubs {
        docs.insert(
            format!("{}.md", stub.function),
            render::tool_doc(provider, &module, stub).map_err(render_err)?,
        );
    }

    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    for (name, content) in &docs {
        hasher.update(name.as_bytes());
        hasher.update(content.as_bytes());
    }
    let fingerprint = format!("{:x}", hasher.finalize());

    let summary = ProviderSummary {
        provider: provider.to_string(),
        module_path: format!("{TOOLS_DIR}/{module}.py"),
        import_path: format!("{TOOLS_DIR}.{module}"),
        docs_path: format!("{TOOLS_DIR}/docs/{module}/"),
        tool_count: stubs.len(),
        purpose: purpose(&stubs),
    };

    Ok(GeneratedModule {
        provider: provider.to_string(),
        module_name: module,
        source,
        docs,
        stubs,
        summary,
        fingerprint,
    })
}

/// Generates every provider; a failing provider is reported, not fatal.
/// Providers whose names collide as modules keep only the first.
pub fn generate_all(
    tools: &BTreeMap<String, Vec<ToolDescriptor>>,
) -> (Vec<GeneratedModule>, BTreeMap<String, GenerationError>) {
    let mut modules: Vec<GeneratedModule> = Vec::new();
    let mut failures = BTreeMap::new();
    for (provider, descriptors) in tools {
        match generate(provider, descriptors) {
            Ok(module) => {
                if let Some(existing) = modules.iter().find(|m| m.module_name == module.module_name)
                {
                    failures.insert(
                        provider.clone(),
                        GenerationError::IdentifierCollision {
                            provider: provider.clone(),
                            first: existing.provider.clone(),
                            second: provider.clone(),
                            identifier: module.module_name,
                        },
                    );
                } else {
                    modules.push(module);
                }
            }
            Err(e) => {
                tracing::error!(provider = %provider, "Failed to generate tool module: {}", e);
                failures.insert(provider.clone(), e);
            }
        }
    }
    (modules, failures)
}
