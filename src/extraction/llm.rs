//! LLM 추출기 - OpenAI 호환 chat completions
//!
//! 1단계: 개체명 인식 → `{"named_entities": [...]}`
//! 2단계: 인식된 엔티티를 주고 RDF 트리플 추출 → `{"triples": [[s, p, o], ...]}`
//!
//! 모델 출력은 코드 펜스나 앞뒤 설명이 붙어도 첫 JSON 객체만 꺼내 파싱합니다.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Extraction, InfoExtractor, Triple};
use crate::config::ExtractionConfig;
use crate::embedding::get_api_key;
use crate::error::{LpmmError, Result};

const PROVIDER: &str = "llm";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const API_KEY_ENVS: &[&str] = &["OPENAI_API_KEY"];

const NER_PROMPT: &str = "You extract named entities from a paragraph.\n\
Return only a JSON object of the form {\"named_entities\": [\"entity\", ...]}.\n\
Keep each entity as it appears in the text. Do not explain.";

const RDF_PROMPT: &str = "You build an RDF graph from a paragraph and its named entities.\n\
Return only a JSON object of the form {\"triples\": [[\"subject\", \"predicate\", \"object\"], ...]}.\n\
Each triple must contain at least one of the named entities. Use short snake_case predicates. Do not explain.";

/// LLM 기반 엔티티/트리플 추출기
#[derive(Debug)]
pub struct LlmExtractor {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

impl LlmExtractor {
    pub fn new(api_key: String, model: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LpmmError::unavailable(PROVIDER, format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            api_key,
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            temperature: 0.2,
        })
    }

    /// `[extraction]` 설정으로 생성 (API 키: `api_key_env` > OPENAI_API_KEY)
    pub fn from_config(config: &ExtractionConfig) -> Result<Self> {
        let api_key = get_api_key(config.api_key_env.as_deref(), API_KEY_ENVS)?;
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        let mut extractor = Self::new(api_key, model, config.timeout_secs)?;
        extractor.temperature = config.temperature;
        if let Some(base_url) = &config.base_url {
            extractor = extractor.with_base_url(base_url);
        }
        Ok(extractor)
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| LpmmError::unavailable(PROVIDER, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LpmmError::unavailable(PROVIDER, format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(LpmmError::response(PROVIDER, format!("{}: {}", status, body)));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| LpmmError::response(PROVIDER, format!("failed to parse chat response: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LpmmError::response(PROVIDER, "empty chat completion"))
    }

    async fn named_entities(&self, text: &str) -> Result<Vec<String>> {
        let reply = self.chat(NER_PROMPT, text).await?;
        let value = parse_json_object(&reply)?;
        Ok(string_list(value.get("named_entities")))
    }

    async fn triples(&self, text: &str, entities: &[String]) -> Result<Vec<Triple>> {
        let prompt = format!(
            "Paragraph:\n{}\n\nNamed entities: {}",
            text,
            serde_json::to_string(entities)?
        );
        let reply = self.chat(RDF_PROMPT, &prompt).await?;
        let value = parse_json_object(&reply)?;

        let triples = value
            .get("triples")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(parse_triple).collect())
            .unwrap_or_default();
        Ok(triples)
    }
}

#[async_trait]
impl InfoExtractor for LlmExtractor {
    async fn extract(&self, text: &str) -> Result<Extraction> {
        if text.trim().is_empty() {
            return Ok(Extraction::default());
        }

        let entities = self.named_entities(text).await?;
        let triples = if entities.is_empty() {
            Vec::new()
        } else {
            self.triples(text, &entities).await?
        };

        tracing::debug!(
            "Extracted {} entities, {} triples",
            entities.len(),
            triples.len()
        );
        Ok(Extraction { entities, triples })
    }

    fn name(&self) -> &str {
        PROVIDER
    }
}

// ============================================================================
// Lenient JSON Parsing
// ============================================================================

/// 모델 출력에서 첫 JSON 객체 추출 (``` 펜스, 앞뒤 문장 허용)
fn parse_json_object(reply: &str) -> Result<Value> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&reply[start..=end])
            .map_err(|e| LpmmError::response(PROVIDER, format!("malformed JSON in model output: {}", e))),
        _ => Err(LpmmError::response(PROVIDER, "model output contains no JSON object")),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// `["s", "p", "o"]` 또는 `{"subject", "predicate", "object"}`
fn parse_triple(value: &Value) -> Option<Triple> {
    match value {
        Value::Array(parts) if parts.len() == 3 => Some(Triple::new(
            parts[0].as_str()?,
            parts[1].as_str()?,
            parts[2].as_str()?,
        )),
        Value::Object(map) => Some(Triple::new(
            map.get("subject")?.as_str()?,
            map.get("predicate")?.as_str()?,
            map.get("object")?.as_str()?,
        )),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================
