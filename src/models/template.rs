use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Template variables. Ordered so the serialized form is canonical.
pub type TemplateContext = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    /// Context keys this template accepts. Anything else is rejected.
    pub variables: Vec<String>,
}

impl Template {
    pub fn allows(&self, key: &str) -> bool {
        self.variables.iter().any(|v| v == key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedContent {
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
}
