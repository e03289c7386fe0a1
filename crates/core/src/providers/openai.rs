use crate::config::ConfigError;
use crate::error::ServiceError;
use crate::services::{
    ChatMessage, CompletionService, EmbeddingService, IndexedEmbedding, PageImage,
    PageTextService,
};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const SERVICE: &str = "openai";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: Url,
    pub chat_model: String,
    pub vision_model: String,
    pub embedding_model: String,
    pub embedding_dimensions: Option<usize>,
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_key = read("OPENAI_API_KEY")
            .ok_or_else(|| ConfigError::MissingVariable("OPENAI_API_KEY".to_string()))?;
        let base_url_raw = read("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(&base_url_raw).map_err(|_| ConfigError::InvalidValue {
            key: "OPENAI_BASE_URL".to_string(),
            value: base_url_raw.clone(),
        })?;

        let timeout = match read("DOCCHIP_HTTP_TIMEOUT_SECS") {
            Some(value) => Duration::from_secs(value.parse().map_err(|_| {
                ConfigError::InvalidValue {
                    key: "DOCCHIP_HTTP_TIMEOUT_SECS".to_string(),
                    value,
                }
            })?),
            None => Duration::from_secs(120),
        };

        Ok(Self {
            api_key,
            base_url,
            chat_model: read("DOCCHIP_CHAT_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            vision_model: read("DOCCHIP_VISION_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            embedding_model: read("DOCCHIP_EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            embedding_dimensions: None,
            timeout,
        })
    }
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, ServiceError> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ServiceError> {
        endpoint(&self.config.base_url, path)
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Response, ServiceError> {
        let response = self
            .http
            .post(self.endpoint(path)?)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await?;
        check_status(response).await
    }

    async fn chat(&self, model: &str, messages: Vec<WireMessage<'_>>) -> Result<String, ServiceError> {
        let request = ChatRequest {
            model,
            messages,
            temperature: Some(0.0),
            max_tokens: None,
        };
        let parsed: ChatResponse = self.post("chat/completions", &request).await?.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ServiceError::InvalidResponse {
                service: SERVICE.to_string(),
                details: "chat response had no content".to_string(),
            })
    }
}

#[async_trait]
impl PageTextService for OpenAiClient {
    async fn extract_page(&self, page: &PageImage, instruction: &str) -> Result<String, ServiceError> {
        self.chat(&self.config.vision_model, vision_messages(page, instruction))
            .await
    }
}

#[async_trait]
impl CompletionService for OpenAiClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ServiceError> {
        let messages = messages
            .iter()
            .map(|message| WireMessage {
                role: message.role,
                content: WireContent::Text(&message.content),
            })
            .collect();
        self.chat(&self.config.chat_model, messages).await
    }
}

#[async_trait]
impl EmbeddingService for OpenAiClient {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<IndexedEmbedding>, ServiceError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbeddingRequest {
            model: &self.config.embedding_model,
            input: inputs,
            dimensions: self.config.embedding_dimensions,
        };
        let parsed: EmbeddingResponse = self.post("embeddings", &request).await?.json().await?;
        Ok(parsed
            .data
            .into_iter()
            .map(|entry| IndexedEmbedding {
                index: entry.index,
                vector: entry.embedding,
            })
            .collect())
    }

    fn name(&self) -> &str {
        &self.config.embedding_model
    }
}

fn endpoint(base: &Url, path: &str) -> Result<Url, ServiceError> {
    Ok(Url::parse(&format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    ))?)
}

async fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        return Err(ServiceError::RateLimited {
            service: SERVICE.to_string(),
            retry_after_secs,
        });
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    Err(ServiceError::Status {
        service: SERVICE.to_string(),
        status: status.as_u16(),
        body,
    })
}

fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    value
        .parse::<u64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().map(|secs| secs.ceil().max(0.0) as u64))
}

fn vision_messages<'a>(page: &'a PageImage, instruction: &'a str) -> Vec<WireMessage<'a>> {
    vec![WireMessage {
        role: crate::services::Role::User,
        content: WireContent::Parts(vec![
            ContentPart::Text { text: instruction },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{};base64,{}", page.mime_type, page.base64_data),
                    detail: "high",
                },
            },
        ]),
    }]
}

#[serde_with::skip_serializing_none]
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: crate::services::Role,
    content: WireContent<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
    detail: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[serde_with::skip_serializing_none]
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_requires_api_key() {
        let error = OpenAiConfig::from_lookup(lookup(&[])).expect_err("key is required");
        assert_eq!(error, ConfigError::MissingVariable("OPENAI_API_KEY".to_string()));

        let config = OpenAiConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_BASE_URL", "http://localhost:8080/v1/"),
        ]))
        .expect("config should load");
        assert_eq!(config.chat_model, "gpt-4o-mini");
        assert_eq!(config.timeout, Duration::from_secs(120));
        assert_eq!(
            endpoint(&config.base_url, "embeddings").expect("valid endpoint").as_str(),
            "http://localhost:8080/v1/embeddings"
        );
    }

    #[test]
    fn invalid_base_url_is_reported() {
        let error = OpenAiConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_BASE_URL", "not a url"),
        ]))
        .expect_err("bad url must fail");
        assert!(matches!(error, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn vision_request_embeds_data_uri() {
        let page = PageImage {
            page_number: 1,
            mime_type: "image/png".to_string(),
            base64_data: "aGVsbG8=".to_string(),
        };
        let request = ChatRequest {
            model: "gpt-4o",
            messages: vision_messages(&page, "Extract all text"),
            temperature: None,
            max_tokens: None,
        };
        let json = serde_json::to_value(&request).expect("request serializes");

        assert!(json.get("temperature").is_none());
        let parts = &json["messages"][0]["content"];
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,aGVsbG8=");
        assert_eq!(parts[1]["image_url"]["detail"], "high");
    }

    #[test]
    fn retry_after_accepts_integer_and_fractional_seconds() {
        assert_eq!(parse_retry_after("7"), Some(7));
        assert_eq!(parse_retry_after("1.5"), Some(2));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
