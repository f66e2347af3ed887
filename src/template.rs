use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::{
    error::TemplateError,
    models::template::{RenderedContent, Template, TemplateContext},
};

const DELIMITERS: [&str; 6] = ["{{", "}}", "{%", "%}", "{#", "#}"];

struct BuiltinTemplate {
    name: &'static str,
    subject: &'static str,
    body_text: &'static str,
    body_html: &'static str,
    variables: &'static [&'static str],
}

const BUILTIN_TEMPLATES: &[BuiltinTemplate] = &[
    BuiltinTemplate {
        name: "document_approved",
        subject: include_str!("../templates/document_approved/subject.tmpl"),
        body_text: include_str!("../templates/document_approved/body.md.tmpl"),
        body_html: include_str!("../templates/document_approved/body.html.tmpl"),
        variables: &[
            "approver_name",
            "document_short_name",
            "document_title",
            "document_url",
        ],
    },
    BuiltinTemplate {
        name: "review_requested",
        subject: include_str!("../templates/review_requested/subject.tmpl"),
        body_text: include_str!("../templates/review_requested/body.md.tmpl"),
        body_html: include_str!("../templates/review_requested/body.html.tmpl"),
        variables: &[
            "requester_name",
            "document_short_name",
            "document_title",
            "document_url",
        ],
    },
    BuiltinTemplate {
        name: "new_owner",
        subject: include_str!("../templates/new_owner/subject.tmpl"),
        body_text: include_str!("../templates/new_owner/body.md.tmpl"),
        body_html: include_str!("../templates/new_owner/body.html.tmpl"),
        variables: &[
            "owner_name",
            "previous_owner_name",
            "document_short_name",
            "document_title",
            "document_url",
        ],
    },
    BuiltinTemplate {
        name: "document_published",
        subject: include_str!("../templates/document_published/subject.tmpl"),
        body_text: include_str!("../templates/document_published/body.md.tmpl"),
        body_html: include_str!("../templates/document_published/body.html.tmpl"),
        variables: &[
            "author_name",
            "document_short_name",
            "document_title",
            "document_url",
            "product",
        ],
    },
    BuiltinTemplate {
        name: "generic_email",
        subject: include_str!("../templates/generic_email/subject.tmpl"),
        body_text: include_str!("../templates/generic_email/body.md.tmpl"),
        body_html: include_str!("../templates/generic_email/body.html.tmpl"),
        variables: &["subject", "body", "from"],
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    Plain,
    Html,
}

/// Registry of named templates plus the sanitizer and renderer that go with
/// them. Cheap to clone and share read-only between tasks.
#[derive(Debug, Clone, Default)]
pub struct TemplateEngine {
    templates: HashMap<String, Template>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine preloaded with the templates embedded from `templates/`.
    pub fn with_builtin_templates() -> Self {
        let mut engine = Self::new();

        for builtin in BUILTIN_TEMPLATES {
            engine.register(Template {
                name: builtin.name.to_string(),
                subject: builtin.subject.trim_end().to_string(),
                body_text: builtin.body_text.to_string(),
                body_html: builtin.body_html.to_string(),
                variables: builtin.variables.iter().map(|v| v.to_string()).collect(),
            });
        }

        engine
    }

    pub fn register(&mut self, template: Template) {
        self.templates.insert(template.name.clone(), template);
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    fn lookup(&self, name: &str) -> Result<&Template, TemplateError> {
        self.get(name)
            .ok_or_else(|| TemplateError::UnknownTemplate(name.to_string()))
    }

    /// Checks every key against the template's allow-list and strips template
    /// delimiters out of every string value, nested ones included.
    pub fn sanitize(
        &self,
        template_name: &str,
        context: &TemplateContext,
    ) -> Result<TemplateContext, TemplateError> {
        let template = self.lookup(template_name)?;

        context
            .iter()
            .map(|(key, value)| {
                if !template.allows(key) {
                    return Err(TemplateError::DisallowedKey {
                        template: template.name.clone(),
                        key: key.clone(),
                    });
                }
                Ok((key.clone(), sanitize_value(value)))
            })
            .collect()
    }

    pub fn render(
        &self,
        template_name: &str,
        context: &TemplateContext,
    ) -> Result<RenderedContent, TemplateError> {
        let template = self.lookup(template_name)?;

        debug!(
            template = %template.name,
            variable_count = context.len(),
            "Rendering template"
        );

        Ok(RenderedContent {
            subject: interpolate(template, &template.subject, context, Escape::Plain)?,
            body_text: interpolate(template, &template.body_text, context, Escape::Plain)?,
            body_html: interpolate(template, &template.body_html, context, Escape::Html)?,
        })
    }
}

fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(strip_delimiters(s)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Removes delimiter pairs until none are left, so `{{{{` style nesting
/// cannot reassemble into a working delimiter.
pub fn strip_delimiters(input: &str) -> String {
    let mut current = input.to_string();

    loop {
        let mut next = current.clone();
        for delimiter in DELIMITERS {
            next = next.replace(delimiter, "");
        }

        if next == current {
            return current;
        }
        current = next;
    }
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());

    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '/' => out.push_str("&#x2F;"),
            other => out.push(other),
        }
    }

    out
}

/// Single left-to-right pass over the source. Substituted text goes straight
/// to the output and is never scanned again.
fn interpolate(
    template: &Template,
    source: &str,
    context: &TemplateContext,
    escape: Escape,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);

        let after_open = &rest[start + 2..];
        let end = after_open.find("}}").ok_or_else(|| TemplateError::Syntax {
            template: template.name.clone(),
        })?;

        let key = after_open[..end].trim();
        let value = context
            .get(key)
            .ok_or_else(|| TemplateError::MissingVariable {
                template: template.name.clone(),
                key: key.to_string(),
            })?;

        let text = scalar_to_string(key, value)?;
        match escape {
            Escape::Plain => out.push_str(&text),
            Escape::Html => out.push_str(&escape_html(&text)),
        }

        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

fn scalar_to_string(key: &str, value: &Value) -> Result<String, TemplateError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        Value::Array(_) | Value::Object(_) => Err(TemplateError::UnsupportedValue {
            key: key.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn context(pairs: &[(&str, Value)]) -> TemplateContext {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn approved_context() -> TemplateContext {
        context(&[
            ("approver_name", json!("Ana")),
            ("document_short_name", json!("RFC-042")),
            ("document_title", json!("Outbox relay")),
            ("document_url", json!("https://docs.example.com/rfc-042")),
        ])
    }

    #[test]
    fn builtins_are_registered() {
        let engine = TemplateEngine::with_builtin_templates();
        for name in [
            "document_approved",
            "review_requested",
            "new_owner",
            "document_published",
            "generic_email",
        ] {
            assert!(engine.contains(name), "missing {}", name);
        }
    }

    #[test]
    fn renders_all_three_parts() {
        let engine = TemplateEngine::with_builtin_templates();
        let rendered = engine
            .render("document_approved", &approved_context())
            .unwrap();

        assert_eq!(rendered.subject, "Ana approved RFC-042");
        assert!(rendered.body_text.contains("**RFC-042: Outbox relay**"));
        assert!(
            rendered
                .body_html
                .contains("https:&#x2F;&#x2F;docs.example.com&#x2F;rfc-042")
        );
    }

    #[test]
    fn strip_delimiters_handles_nesting() {
        assert_eq!(strip_delimiters("{{{{ secret }}}}"), " secret ");
        assert_eq!(strip_delimiters("{{{ x }}}"), "{ x }");
        assert_eq!(strip_delimiters("{{{%%}}}"), "");
        assert_eq!(strip_delimiters("plain text"), "plain text");
    }

    #[test]
    fn sanitize_rejects_unknown_keys() {
        let engine = TemplateEngine::with_builtin_templates();
        let mut ctx = approved_context();
        ctx.insert("api_key".into(), json!("x"));

        let err = engine.sanitize("document_approved", &ctx).unwrap_err();
        assert_eq!(
            err,
            TemplateError::DisallowedKey {
                template: "document_approved".into(),
                key: "api_key".into(),
            }
        );
    }

    #[test]
    fn injected_syntax_renders_literally() {
        let engine = TemplateEngine::with_builtin_templates();
        let ctx = context(&[
            ("subject", json!("Hello {{ from }}")),
            ("body", json!("{% if x %}<b>{{ body }}</b>")),
            ("from", json!("ops")),
        ]);

        let sanitized = engine.sanitize("generic_email", &ctx).unwrap();
        let rendered = engine.render("generic_email", &sanitized).unwrap();

        assert_eq!(rendered.subject, "Hello  from ");
        assert!(rendered.body_html.contains("&lt;b&gt; body &lt;&#x2F;b&gt;"));
    }

    #[test]
    fn unsanitized_values_are_not_rescanned() {
        let engine = TemplateEngine::with_builtin_templates();
        let ctx = context(&[
            ("subject", json!("{{ from }}")),
            ("body", json!("b")),
            ("from", json!("ops")),
        ]);

        let rendered = engine.render("generic_email", &ctx).unwrap();
        assert_eq!(rendered.subject, "{{ from }}");
    }

    #[test]
    fn missing_variable_is_an_error() {
        let engine = TemplateEngine::with_builtin_templates();
        let mut ctx = approved_context();
        ctx.remove("document_url");

        assert!(matches!(
            engine.render("document_approved", &ctx),
            Err(TemplateError::MissingVariable { key, .. }) if key == "document_url"
        ));
    }

    #[test]
    fn structured_values_are_rejected() {
        let engine = TemplateEngine::with_builtin_templates();
        let ctx = context(&[
            ("subject", json!(["a", "b"])),
            ("body", json!("b")),
            ("from", json!("ops")),
        ]);

        assert!(matches!(
            engine.render("generic_email", &ctx),
            Err(TemplateError::UnsupportedValue { .. })
        ));
    }

    #[test]
    fn unterminated_placeholder_is_a_syntax_error() {
        let mut engine = TemplateEngine::new();
        engine.register(Template {
            name: "broken".into(),
            subject: "Hi {{ name".into(),
            body_text: String::new(),
            body_html: String::new(),
            variables: vec!["name".into()],
        });

        let ctx = context(&[("name", json!("x"))]);
        assert!(matches!(
            engine.render("broken", &ctx),
            Err(TemplateError::Syntax { .. })
        ));
    }

    #[test]
    fn unknown_template() {
        let engine = TemplateEngine::new();
        assert!(matches!(
            engine.render("nope", &TemplateContext::new()),
            Err(TemplateError::UnknownTemplate(_))
        ));
    }
}
