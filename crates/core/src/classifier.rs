use crate::config::ClassificationConfig;
use crate::models::{ChipSet, ClassificationResult};
use crate::prompts::{classification_prompt, CLASSIFICATION_SYSTEM_PROMPT};
use crate::services::{ChatMessage, CompletionService};
use crate::templates::{with_fallback, DocumentTemplate, GENERIC_TYPE};
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub const PARSE_FAILURE_REASONING: &str = "parse failure";

const SNIFFED_CONFIDENCE: f32 = 0.2;
const PARSE_FAILURE_CONFIDENCE: f32 = 0.1;

pub struct Classifier {
    completion: Arc<dyn CompletionService>,
    config: ClassificationConfig,
}

impl Classifier {
    pub fn new(completion: Arc<dyn CompletionService>, config: ClassificationConfig) -> Self {
        Self { completion, config }
    }

    pub async fn classify(&self, text: &str, templates: &[DocumentTemplate]) -> ClassificationResult {
        let templates = with_fallback(templates.to_vec());
        let excerpt = truncate_chars(text, self.config.max_chars);
        let messages = [
            ChatMessage::system(CLASSIFICATION_SYSTEM_PROMPT),
            ChatMessage::user(classification_prompt(excerpt, &templates, GENERIC_TYPE)),
        ];

        debug!(
            excerpt_chars = excerpt.chars().count(),
            templates = templates.len(),
            "Requesting classification"
        );

        match self.completion.complete(&messages).await {
            Ok(response) => parse_classification(&response, &templates),
            Err(error) => {
                warn!(error = %error, "Classification service failed, using generic template");
                ClassificationResult {
                    file_type: GENERIC_TYPE.to_string(),
                    confidence: 0.0,
                    chips: empty_chips(&find_template(&templates, GENERIC_TYPE)),
                    reasoning: Some(format!("classification service unavailable: {error}")),
                }
            }
        }
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((offset, _)) => &text[..offset],
        None => text,
    }
}

pub fn parse_classification(raw: &str, templates: &[DocumentTemplate]) -> ClassificationResult {
    let templates = with_fallback(templates.to_vec());

    let parsed = extract_json_object(raw).and_then(|json| match json {
        Value::Object(map) => Some(map),
        _ => None,
    });

    let Some(object) = parsed else {
        warn!("Classification response was not a JSON object");
        return parse_failure(raw, &templates);
    };

    let requested = object
        .get("file_type")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    let template = match templates.iter().find(|template| template.type_name == requested) {
        Some(template) => template.clone(),
        None => {
            if !requested.is_empty() {
                warn!(file_type = requested, "Unknown document type, using generic");
            }
            find_template(&templates, GENERIC_TYPE)
        }
    };

    let confidence = object
        .get("confidence")
        .and_then(|value| match value {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        })
        .map(|value| value as f32)
        .map(clamp_confidence)
        .unwrap_or(0.0);

    let returned = object.get("chips").and_then(Value::as_object);
    let chips = template
        .chip_fields
        .iter()
        .map(|field| {
            let value = returned
                .and_then(|chips| chips.get(field))
                .map(chip_value)
                .unwrap_or_default();
            (field.clone(), value)
        })
        .collect();

    let reasoning = object
        .get("reasoning")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string);

    ClassificationResult {
        file_type: template.type_name,
        confidence,
        chips,
        reasoning,
    }
}

fn clamp_confidence(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn chip_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.trim().to_string(),
        other => other.to_string(),
    }
}

fn extract_json_object(raw: &str) -> Option<Value> {
    let unfenced = strip_code_fences(raw);
    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&unfenced[start..=end]).ok()
}

fn strip_code_fences(raw: &str) -> String {
    raw.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_failure(raw: &str, templates: &[DocumentTemplate]) -> ClassificationResult {
    let (template, confidence) = match sniff_type(raw, templates) {
        Some(template) => (template.clone(), SNIFFED_CONFIDENCE),
        None => (find_template(templates, GENERIC_TYPE), PARSE_FAILURE_CONFIDENCE),
    };

    ClassificationResult {
        chips: empty_chips(&template),
        file_type: template.type_name,
        confidence,
        reasoning: Some(PARSE_FAILURE_REASONING.to_string()),
    }
}

/// Finds the longest specific type name mentioned as a whole word.
fn sniff_type<'a>(raw: &str, templates: &'a [DocumentTemplate]) -> Option<&'a DocumentTemplate> {
    let lowered = raw.to_lowercase();
    templates
        .iter()
        .filter(|template| template.type_name != GENERIC_TYPE)
        .filter(|template| {
            let pattern = format!(r"\b{}\b", regex::escape(&template.type_name.to_lowercase()));
            Regex::new(&pattern)
                .map(|regex| regex.is_match(&lowered))
                .unwrap_or(false)
        })
        .max_by_key(|template| template.type_name.len())
}

fn find_template(templates: &[DocumentTemplate], type_name: &str) -> DocumentTemplate {
    templates
        .iter()
        .find(|template| template.type_name == type_name)
        .cloned()
        .unwrap_or_else(DocumentTemplate::generic)
}

fn empty_chips(template: &DocumentTemplate) -> ChipSet {
    template
        .chip_fields
        .iter()
        .map(|field| (field.clone(), String::new()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::services::Role;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn templates() -> Vec<DocumentTemplate> {
        vec![
            DocumentTemplate::new("lease", ["property_address", "tenant_name", "monthly_rent"]),
            DocumentTemplate::generic(),
        ]
    }

    #[test]
    fn confidence_is_clamped_and_chips_restricted() {
        let raw = r#"{"file_type":"lease","confidence":1.1,"chips":{"tenant_name":"Acme","pet_policy":"none"}}"#;
        let result = parse_classification(raw, &templates());

        assert_eq!(result.file_type, "lease");
        assert_eq!(result.confidence, 1.0);
        let keys: Vec<_> = result.chips.iter().map(|chip| chip.key.as_str()).collect();
        assert_eq!(keys, vec!["property_address", "tenant_name", "monthly_rent"]);
        assert_eq!(result.chips.get("tenant_name"), Some("Acme"));
        assert_eq!(result.chips.get("property_address"), Some(""));
        assert_eq!(result.chips.get("pet_policy"), None);
    }

    #[test]
    fn fenced_json_is_accepted() {
        let raw = "```json\n{\"file_type\":\"lease\",\"confidence\":0.8,\"chips\":{\"monthly_rent\":1200},\"reasoning\":\"mentions rent\"}\n```";
        let result = parse_classification(raw, &templates());

        assert_eq!(result.file_type, "lease");
        assert_eq!(result.chips.get("monthly_rent"), Some("1200"));
        assert_eq!(result.reasoning.as_deref(), Some("mentions rent"));
    }

    #[test]
    fn unknown_type_falls_back_to_generic() {
        let raw = r#"{"file_type":"invoice","confidence":-0.5,"chips":{"title":"Bill"}}"#;
        let result = parse_classification(raw, &templates());

        assert_eq!(result.file_type, GENERIC_TYPE);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.chips.get("title"), Some("Bill"));
        assert_eq!(result.chips.len(), DocumentTemplate::generic().chip_fields.len());
    }

    #[test]
    fn parse_failure_sniffs_type_name() {
        let sniffed = parse_classification("This looks like a Lease agreement to me.", &templates());
        assert_eq!(sniffed.file_type, "lease");
        assert_eq!(sniffed.confidence, SNIFFED_CONFIDENCE);
        assert_eq!(sniffed.reasoning.as_deref(), Some(PARSE_FAILURE_REASONING));
        assert!(sniffed.chips.iter().all(|chip| chip.value.is_empty()));

        let unknown = parse_classification("no idea", &templates());
        assert_eq!(unknown.file_type, GENERIC_TYPE);
        assert_eq!(unknown.confidence, PARSE_FAILURE_CONFIDENCE);
        assert_eq!(unknown.reasoning.as_deref(), Some(PARSE_FAILURE_REASONING));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    struct FakeCompletion {
        reply: Result<String, u16>,
        seen: Mutex<Vec<ChatMessage>>,
    }

    #[async_trait]
    impl CompletionService for FakeCompletion {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ServiceError> {
            self.seen
                .lock()
                .expect("lock")
                .extend(messages.iter().cloned());
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(status) => Err(ServiceError::Status {
                    service: "fake".to_string(),
                    status: *status,
                    body: String::new(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn service_failure_degrades_to_generic() {
        let completion = Arc::new(FakeCompletion {
            reply: Err(503),
            seen: Mutex::new(Vec::new()),
        });
        let classifier = Classifier::new(completion, ClassificationConfig::default());

        let result = classifier.classify("Some text", &templates()).await;

        assert_eq!(result.file_type, GENERIC_TYPE);
        assert_eq!(result.confidence, 0.0);
        assert!(result.chips.iter().all(|chip| chip.value.is_empty()));
        assert!(!result.chips.is_empty());
    }

    #[tokio::test]
    async fn prompt_is_truncated_and_lists_templates() {
        let completion = Arc::new(FakeCompletion {
            reply: Ok(r#"{"file_type":"lease","confidence":0.9,"chips":{}}"#.to_string()),
            seen: Mutex::new(Vec::new()),
        });
        let classifier = Classifier::new(
            completion.clone(),
            ClassificationConfig { max_chars: 10 },
        );

        let result = classifier
            .classify("0123456789SHOULD-NOT-BE-SENT", &[DocumentTemplate::lease()])
            .await;

        assert_eq!(result.file_type, "lease");
        let seen = completion.seen.lock().expect("lock");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].role, Role::System);
        assert!(seen[1].content.contains("0123456789"));
        assert!(!seen[1].content.contains("SHOULD-NOT-BE-SENT"));
        assert!(seen[1].content.contains("- generic: fields"));
    }
}
