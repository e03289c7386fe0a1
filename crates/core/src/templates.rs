use crate::error::IngestError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

pub const GENERIC_TYPE: &str = "generic";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentTemplate {
    pub type_name: String,
    pub chip_fields: Vec<String>,
    #[serde(default)]
    pub extraction_prompt: Option<String>,
}

impl DocumentTemplate {
    pub fn new<I, S>(type_name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let chip_fields = fields
            .into_iter()
            .map(Into::into)
            .filter(|field: &String| !field.trim().is_empty() && seen.insert(field.clone()))
            .collect();

        Self {
            type_name: type_name.into(),
            chip_fields,
            extraction_prompt: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.extraction_prompt = Some(hint.into());
        self
    }

    pub fn lease() -> Self {
        Self::new(
            "lease",
            [
                "property_address",
                "tenant_name",
                "landlord_name",
                "lease_start_date",
                "lease_end_date",
                "monthly_rent",
                "security_deposit",
            ],
        )
        .with_hint("residential or commercial lease agreements and amendments")
    }

    pub fn generic() -> Self {
        Self::new(GENERIC_TYPE, ["title", "document_date", "parties", "summary"])
    }
}

pub fn builtin_templates() -> Vec<DocumentTemplate> {
    vec![DocumentTemplate::lease(), DocumentTemplate::generic()]
}

#[async_trait]
pub trait TemplateProvider: Send + Sync {
    async fn templates(&self) -> Result<Vec<DocumentTemplate>, IngestError>;
}

#[derive(Debug, Clone)]
pub struct StaticTemplates {
    templates: Vec<DocumentTemplate>,
}

impl StaticTemplates {
    pub fn new(templates: Vec<DocumentTemplate>) -> Self {
        Self { templates }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, IngestError> {
        let raw = std::fs::read_to_string(path)?;
        let templates: Vec<DocumentTemplate> = serde_json::from_str(&raw).map_err(|error| {
            IngestError::InvalidArgument(format!(
                "template file {} is not valid JSON: {error}",
                path.display()
            ))
        })?;
        Ok(Self::new(
            templates
                .into_iter()
                .map(|template| {
                    let hint = template.extraction_prompt.clone();
                    let mut normalized = DocumentTemplate::new(template.type_name, template.chip_fields);
                    normalized.extraction_prompt = hint;
                    normalized
                })
                .collect(),
        ))
    }
}

impl Default for StaticTemplates {
    fn default() -> Self {
        Self::new(builtin_templates())
    }
}

#[async_trait]
impl TemplateProvider for StaticTemplates {
    async fn templates(&self) -> Result<Vec<DocumentTemplate>, IngestError> {
        Ok(self.templates.clone())
    }
}

pub fn with_fallback(templates: Vec<DocumentTemplate>) -> Vec<DocumentTemplate> {
    let mut seen = HashSet::new();
    let mut result: Vec<DocumentTemplate> = templates
        .into_iter()
        .filter(|template| {
            !template.type_name.trim().is_empty() && seen.insert(template.type_name.clone())
        })
        .collect();

    if result.is_empty() {
        return builtin_templates();
    }
    if !result.iter().any(|template| template.type_name == GENERIC_TYPE) {
        result.push(DocumentTemplate::generic());
    }
    result
}
