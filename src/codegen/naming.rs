use once_cell::sync::Lazy;
use std::collections::HashSet;

static PYTHON_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
        "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
        "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
        "try", "while", "with", "yield",
    ]
    .into_iter()
    .collect()
});

/// Names the generated module binds itself, at top level or in stub bodies.
const RESERVED: &[&str] = &[
    "Any",
    "Optional",
    "_PTC_PROVIDER",
    "_ptc_invoke",
    "_ptc_args",
];

fn avoid_reserved(mut ident: String) -> String {
    while RESERVED.contains(&ident.as_str()) {
        ident.push('_');
    }
    ident
}

/// Turns a wire name into a Python identifier.
///
/// Non-alphanumeric characters become `_`, a leading digit gets a `_`
/// prefix, and keywords get a `_` suffix.
#[must_use]
pub fn identifier(name: &str) -> String {
    let mut ident: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if ident.is_empty() {
        return "_".to_string();
    }
    if ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    if PYTHON_KEYWORDS.contains(ident.as_str()) {
        ident.push('_');
    }
    ident
}

/// Function name for a tool stub; also avoids the module's own names.
#[must_use]
pub fn function_name(tool: &str) -> String {
    avoid_reserved(identifier(tool))
}

/// Parameter name in a stub signature. A parameter must not shadow the
/// names the stub body forwards through.
#[must_use]
pub fn param_name(param: &str) -> String {
    avoid_reserved(identifier(param))
}

/// Module name for a provider, lowercased.
#[must_use]
pub fn module_name(provider: &str) -> String {
    let ident = identifier(&provider.to_lowercase());
    if ident.trim_start_matches('_').is_empty() {
        return "provider_".to_string();
    }
    // `tools._bridge` is taken by the support module.
    if ident == "_bridge" {
        return "_bridge_".to_string();
    }
    ident
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier() {
        assert_eq!(identifier("get-weather"), "get_weather");
        assert_eq!(identifier("files.read"), "files_read");
        assert_eq!(identifier("2fa"), "_2fa");
        assert_eq!(identifier("from"), "from_");
        assert_eq!(identifier("class"), "class_");
        assert_eq!(identifier(""), "_");
    }

    #[test]
    fn test_function_name_avoids_module_names() {
        assert_eq!(function_name("_ptc_invoke"), "_ptc_invoke_");
        assert_eq!(function_name("Optional"), "Optional_");
        assert_eq!(function_name("invoke"), "invoke");
        assert_eq!(function_name("search"), "search");
    }

    #[test]
    fn test_param_name_avoids_body_locals() {
        assert_eq!(param_name("_ptc_args"), "_ptc_args_");
        assert_eq!(param_name("arguments"), "arguments");
        assert_eq!(param_name("PROVIDER"), "PROVIDER");
        assert_eq!(param_name("class"), "class_");
    }

    #[test]
    fn test_module_name() {
        assert_eq!(module_name("GitHub"), "github");
        assert_eq!(module_name("web-search"), "web_search");
        assert_eq!(module_name("---"), "provider_");
        assert_eq!(module_name("_bridge"), "_bridge_");
    }
}
