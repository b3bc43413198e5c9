//! Template rendering for scripts and template files.
//!
//! Rendering is a collaborator: the orchestrator and tar builder only see
//! [`TemplateRenderer`]. The default [`MustacheRenderer`] substitutes
//! `{{ name }}` placeholders and refuses to render a placeholder it has no
//! value for, so a typo in a bootstrap script fails provisioning instead of
//! running with an empty string.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern is valid")
});

/// Template rendering errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Unknown template variable '{name}'")]
    UnknownVariable { name: String },

    #[error("Template render failed: {0}")]
    Render(String),
}

/// Variables available to a template.
pub type Variables = HashMap<String, String>;

/// Renders a script or file body against a set of variables.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, source: &str, variables: &Variables) -> Result<String, TemplateError>;
}

/// `{{ name }}` substitution with strict unknown-variable handling.
#[derive(Debug, Clone, Copy, Default)]
pub struct MustacheRenderer;

impl TemplateRenderer for MustacheRenderer {
    fn render(&self, source: &str, variables: &Variables) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(source.len());
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(source) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let value = variables
                .get(name.as_str())
                .ok_or_else(|| TemplateError::UnknownVariable {
                    name: name.as_str().to_string(),
                })?;
            out.push_str(&source[last..whole.start()]);
            out.push_str(value);
            last = whole.end();
        }

        out.push_str(&source[last..]);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_substitutes_with_and_without_spaces() {
        let out = MustacheRenderer
            .render(
                "DATABASE_URL={{database_url}}\nPORT={{ port }}\n",
                &vars(&[("database_url", "postgres://db/app"), ("port", "4000")]),
            )
            .unwrap();
        assert_eq!(out, "DATABASE_URL=postgres://db/app\nPORT=4000\n");
    }

    #[test]
    fn test_unknown_variable_fails() {
        let err = MustacheRenderer
            .render("echo {{ missing }}", &Variables::new())
            .unwrap_err();
        assert!(matches!(err, TemplateError::UnknownVariable { name } if name == "missing"));
    }

    #[test]
    fn test_leaves_non_placeholders_alone() {
        let source = "echo ${HOME} {{ }} {not} {{1abc}}";
        let out = MustacheRenderer.render(source, &Variables::new()).unwrap();
        assert_eq!(out, source);
    }

    #[test]
    fn test_values_are_not_re_rendered() {
        let out = MustacheRenderer
            .render("{{ a }}", &vars(&[("a", "{{ b }}")]))
            .unwrap();
        assert_eq!(out, "{{ b }}");
    }
}
