use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::Value;

use super::Stub;
use crate::mcp::ParamType;

const MODULE_TEMPLATE: &str = r#""""Tools provided by `{{ provider }}`.

Generated from the provider's tool descriptors and regenerated when they change.
Each function forwards its arguments to the provider and returns the raw result.
"""
from typing import Any, Optional

from tools._bridge import invoke as _ptc_invoke

_PTC_PROVIDER = {{ provider_literal }}

__all__ = [{{ exports }}]
{% for stub in stubs %}


def {{ stub.function }}({{ stub.signature }}) -> {{ stub.returns }}:
    """{{ stub.doc }}"""
    _ptc_args = {}
{% for param in stub.params %}
{% if param.required %}
    _ptc_args[{{ param.wire_literal }}] = {{ param.ident }}
{% else %}
    if {{ param.ident }} is not None:
        _ptc_args[{{ param.wire_literal }}] = {{ param.ident }}
{% endif %}
{% endfor %}
    return _ptc_invoke(_PTC_PROVIDER, {{ stub.tool_literal }}, _ptc_args)
{% endfor %}
"#;

const TOOL_DOC_TEMPLATE: &str = r#"# {{ provider }}.{{ tool }}

{{ description }}

```python
from tools.{{ module }} import {{ function }}

{{ function }}({{ signature }}) -> {{ returns }}
```

## Parameters

{% if params %}
| Name | Type | Required | Default | Description |
|------|------|----------|---------|-------------|
{% for p in params %}
| `{{ p.name }}` | {{ p.ty }} | {{ "yes" if p.required else "no" }} | {{ p.default }} | {{ p.description }} |
{% endfor %}
{% else %}
This tool takes no parameters.
{% endif %}
"#;

const INDEX_TEMPLATE: &str = r"# {{ provider }}

Module: `tools/{{ module }}.py`

| Function | Description |
|----------|-------------|
{% for stub in stubs %}
| [`{{ stub.function }}`]({{ stub.tool_file }}) | {{ stub.summary }} |
{% endfor %}
";

/// Python type hint for a parameter type tag.
#[must_use]
pub fn python_type(ty: ParamType) -> &'static str {
    match ty {
        ParamType::String => "str",
        ParamType::Integer => "int",
        ParamType::Number => "float",
        ParamType::Boolean => "bool",
        ParamType::Array => "list",
        ParamType::Object => "dict",
        ParamType::Null => "None",
        ParamType::Any => "Any",
    }
}

/// Renders a JSON value as a Python literal.
#[must_use]
pub fn python_literal(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => string_literal(s),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(python_literal).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", string_literal(k), python_literal(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

/// JSON string escaping is a valid Python string literal.
fn string_literal(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("{s:?}"))
}

fn docstring_escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace("\"\"\"", "\\\"\\\"\\\"")
}

fn table_cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\n', '\r'], " ")
}

fn environment() -> Result<Environment<'static>, minijinja::Error> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("module.py", MODULE_TEMPLATE)?;
    env.add_template("tool.md", TOOL_DOC_TEMPLATE)?;
    env.add_template("index.md", INDEX_TEMPLATE)?;
    Ok(env)
}

#[derive(Serialize)]
struct ParamView {
    ident: String,
    wire_literal: String,
    required: bool,
}

#[derive(Serialize)]
struct StubView {
    function: String,
    tool_literal: String,
    signature: String,
    returns: &'static str,
    doc: String,
    params: Vec<ParamView>,
}

fn docstring(stub: &Stub) -> String {
    let mut lines: Vec<String> = Vec::new();
    if stub.description.is_empty() {
        lines.push(format!("Call `{}`.", stub.tool));
    } else {
        lines.extend(stub.description.lines().map(|l| l.trim_end().to_string()));
    }
    if !stub.params.is_empty() {
        lines.push(String::new());
        lines.push("Args:".to_string());
        for param in &stub.params {
            let mut head = format!("    {} ({}", param.ident, python_type(param.ty));
            match (&param.default, param.required) {
                (_, true) => head.push_str(", required"),
                (Some(default), false) => {
                    head.push_str(&format!(", default {}", python_literal(default)));
                }
                (None, false) => head.push_str(", optional"),
            }
            head.push(')');
            if !param.description.is_empty() {
                head.push_str(": ");
                head.push_str(&param.description.replace('\n', " "));
            }
            lines.push(head);
        }
    }
    lines.push(String::new());
    lines.push("Returns:".to_string());
    lines.push(format!("    {}", python_type(stub.returns)));

    let body = docstring_escape(&lines.join("\n"));
    // Indent continuation lines to the function body and close on its own line.
    let indented: Vec<String> = body
        .lines()
        .enumerate()
        .map(|(i, line)| {
            if i == 0 || line.is_empty() {
                line.to_string()
            } else {
                format!("    {line}")
            }
        })
        .collect();
    format!("{}\n    ", indented.join("\n"))
}

pub(super) fn module_source(
    provider: &str,
    stubs: &[Stub],
) -> Result<String, minijinja::Error> {
    let env = environment()?;
    let views: Vec<StubView> = stubs
        .iter()
        .map(|stub| StubView {
            function: stub.function.clone(),
            tool_literal: string_literal(&stub.tool),
            signature: stub.signature(),
            returns: python_type(stub.returns),
            doc: docstring(stub),
            params: stub
                .params
                .iter()
                .map(|p| ParamView {
                    ident: p.ident.clone(),
                    wire_literal: string_literal(&p.name),
                    required: p.required,
                })
                .collect(),
        })
        .collect();
    let exports = stubs
        .iter()
        .map(|s| string_literal(&s.function))
        .collect::<Vec<_>>()
        .join(", ");

    env.get_template("module.py")?.render(context! {
        provider => provider,
        provider_literal => string_literal(provider),
        exports => exports,
        stubs => views,
    })
}

pub(super) fn tool_doc(
    provider: &str,
    module: &str,
    stub: &Stub,
) -> Result<String, minijinja::Error> {
    let env = environment()?;
    let params: Vec<_> = stub
        .params
        .iter()
        .map(|p| {
            context! {
                name => p.name,
                ty => p.ty.as_str(),
                required => p.required,
                default => p.default.as_ref().map(python_literal).unwrap_or_default(),
                description => table_cell(&p.description),
            }
        })
        .collect();
    let description = if stub.description.is_empty() {
        "No description provided."
    } else {
        stub.description.as_str()
    };

    env.get_template("tool.md")?.render(context! {
        provider => provider,
        tool => stub.tool,
        module => module,
        function => stub.function,
        signature => stub.signature(),
        returns => python_type(stub.returns),
        description => description,
        params => params,
    })
}

pub(super) fn index_doc(
    provider: &str,
    module: &str,
    stubs: &[Stub],
) -> Result<String, minijinja::Error> {
    let env = environment()?;
    let rows: Vec<_> = stubs
        .iter()
        .map(|s| {
            context! {
                function => s.function,
                tool_file => format!("{}.md", s.function),
                summary => table_cell(s.summary()),
            }
        })
        .collect();
    env.get_template("index.md")?.render(context! {
        provider => provider,
        module => module,
        stubs => rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_python_literal() {
        assert_eq!(python_literal(&json!(null)), "None");
        assert_eq!(python_literal(&json!(true)), "True");
        assert_eq!(python_literal(&json!(10)), "10");
        assert_eq!(python_literal(&json!("a\"b")), r#""a\"b""#);
        assert_eq!(python_literal(&json!([1, false])), "[1, False]");
        assert_eq!(python_literal(&json!({"k": null})), r#"{"k": None}"#);
    }

    #[test]
    fn test_docstring_escape() {
        assert_eq!(docstring_escape(r#"say """hi""""#), r#"say \"\"\"hi\"\"\""#);
        assert_eq!(docstring_escape(r"C:\tmp"), r"C:\\tmp");
    }

    #[test]
    fn test_templates_parse() {
        assert!(environment().is_ok());
    }
}
