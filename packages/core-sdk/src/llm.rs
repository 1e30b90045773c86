use anyhow::{anyhow, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::Stream;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use std::pin::Pin;

use crate::models::{Message, Provider, Role};
use crate::registry::{EmbeddingModel, LanguageModel, ProviderClient};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 4096;

/**
 * \brief Input of one generation call: system prompt plus ordered history.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub system: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

/**
 * \brief Streamed output. `Finish` is always the last event of a successful stream.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Finish(Usage),
}

pub type TextStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/**
 * \brief Text generation capability the chat pipeline is written against.
 */
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn stream(&self, model: &LanguageModel, request: &GenerationRequest)
        -> Result<TextStream>;
}

/**
 * \brief Turns texts into vectors with an embedding model.
 */
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, model: &EmbeddingModel, inputs: &[String]) -> Result<Vec<Vec<f32>>>;
}

/**
 * \brief Talks to the vendor HTTP APIs with reqwest.
 * \details OpenAI and OpenRouter stream SSE; Anthropic and Gemini degrade to one delta.
 */
#[derive(Debug, Clone, Default)]
pub struct HttpGenerator {
    client: reqwest::Client,
}

impl HttpGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Embedder for HttpGenerator {
    async fn embed(&self, model: &EmbeddingModel, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = require_key(&model.client)?;
        match model.client.provider {
            Provider::OpenAI => {
                let url = format!("{}/v1/embeddings", model.client.api_base.trim_end_matches('/'));
                let resp = self
                    .client
                    .post(url)
                    .header(AUTHORIZATION, format!("Bearer {}", api_key))
                    .json(&json!({ "model": model.model_id, "input": inputs }))
                    .send()
                    .await?;
                let v = read_json(resp, "openai embeddings").await?;
                parse_openai_embeddings(&v)
            }
            Provider::Google => {
                let base = normalize_gemini_base(&model.client.api_base);
                let url = format!("{}/models/{}:batchEmbedContents", base, model.model_id);
                let requests: Vec<Value> = inputs
                    .iter()
                    .map(|text| {
                        json!({
                            "model": format!("models/{}", model.model_id),
                            "content": { "parts": [{ "text": text }] }
                        })
                    })
                    .collect();
                let resp = self
                    .client
                    .post(url)
                    .query(&[("key", api_key)])
                    .json(&json!({ "requests": requests }))
                    .send()
                    .await?;
                let v = read_json(resp, "gemini embeddings").await?;
                parse_gemini_embeddings(&v)
            }
            other => Err(anyhow!("provider {} does not support embedding models", other)),
        }
    }
}

#[async_trait]
impl TextGenerator for HttpGenerator {
    async fn stream(
        &self,
        model: &LanguageModel,
        request: &GenerationRequest,
    ) -> Result<TextStream> {
        match model.provider() {
            Provider::OpenAI | Provider::OpenRouter => {
                stream_openai(&self.client, model, request).await
            }
            Provider::Anthropic => {
                let (text, usage) = chat_once_claude(&self.client, model, request).await?;
                Ok(single_shot(text, usage))
            }
            Provider::Google => {
                let (text, usage) = chat_once_gemini(&self.client, model, request).await?;
                Ok(single_shot(text, usage))
            }
        }
    }
}

fn single_shot(text: String, usage: Usage) -> TextStream {
    let mut events: Vec<Result<StreamEvent>> = Vec::with_capacity(2);
    if !text.is_empty() {
        events.push(Ok(StreamEvent::Delta(text)));
    }
    events.push(Ok(StreamEvent::Finish(usage)));
    Box::pin(futures_util::stream::iter(events))
}

fn require_key(client: &ProviderClient) -> Result<&str> {
    client
        .api_key
        .as_deref()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| anyhow!("no api key configured for provider {}", client.provider))
}

async fn read_json(resp: reqwest::Response, what: &str) -> Result<Value> {
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("{} request failed: {} -> {}", what, status, text));
    }
    Ok(resp.json().await?)
}

fn openai_messages(request: &GenerationRequest) -> Vec<Value> {
    let mut out = Vec::with_capacity(request.messages.len() + 1);
    if !request.system.is_empty() {
        out.push(json!({ "role": "system", "content": request.system }));
    }
    out.extend(
        request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content })),
    );
    out
}

async fn stream_openai(
    client: &reqwest::Client,
    model: &LanguageModel,
    request: &GenerationRequest,
) -> Result<TextStream> {
    let api_key = require_key(&model.client)?;
    let url = format!(
        "{}/v1/chat/completions",
        model.client.api_base.trim_end_matches('/')
    );
    let body = json!({
        "model": model.model_id,
        "messages": openai_messages(request),
        "stream": true,
        "stream_options": { "include_usage": true }
    });

    let resp = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", api_key))
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("request failed: {} -> {}", status, text));
    }

    let mut stream = resp.bytes_stream();
    let mut buf = Vec::<u8>::new();

    let out = try_stream! {
        use futures_util::StreamExt;
        let mut usage = Usage::default();
        let mut done = false;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buf.extend_from_slice(&chunk);
            while let Some(pos) = find_double_newline(&buf) {
                let block = buf.drain(..pos + 2).collect::<Vec<u8>>();
                if let Some(line) = extract_data_line(&block) {
                    if line.trim() == "[DONE]" {
                        done = true;
                        break;
                    }
                    if let Some(u) = parse_openai_usage(&line) {
                        usage = u;
                    }
                    if let Some(delta) = parse_openai_delta(&line) {
                        yield StreamEvent::Delta(delta);
                    }
                }
            }
            if done {
                break;
            }
        }
        if !done && !buf.is_empty() {
            if let Some(line) = extract_data_line(&buf) {
                if line.trim() != "[DONE]" {
                    if let Some(u) = parse_openai_usage(&line) {
                        usage = u;
                    }
                    if let Some(delta) = parse_openai_delta(&line) {
                        yield StreamEvent::Delta(delta);
                    }
                }
            }
        }
        yield StreamEvent::Finish(usage);
    };

    Ok(Box::pin(out))
}

async fn chat_once_claude(
    client: &reqwest::Client,
    model: &LanguageModel,
    request: &GenerationRequest,
) -> Result<(String, Usage)> {
    let api_key = require_key(&model.client)?;
    let url = format!("{}/v1/messages", model.client.api_base.trim_end_matches('/'));

    let mut body = json!({
        "model": model.model_id,
        "max_tokens": ANTHROPIC_MAX_TOKENS,
        "messages": anthropic_messages(&request.messages),
    });
    if !request.system.is_empty() {
        body["system"] = json!(request.system);
    }

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("x-api-key", HeaderValue::from_str(api_key)?);
    headers.insert(
        "anthropic-version",
        HeaderValue::from_static(ANTHROPIC_VERSION),
    );

    let resp = client.post(url).headers(headers).json(&body).send().await?;
    let v = read_json(resp, "claude").await?;
    Ok((extract_anthropic_content(&v), extract_anthropic_usage(&v)))
}

async fn chat_once_gemini(
    client: &reqwest::Client,
    model: &LanguageModel,
    request: &GenerationRequest,
) -> Result<(String, Usage)> {
    let api_key = require_key(&model.client)?;
    let base = normalize_gemini_base(&model.client.api_base);
    let url = format!("{}/models/{}:generateContent", base, model.model_id);

    let mut body = json!({
        "contents": gemini_contents(&request.messages),
    });
    if !request.system.is_empty() {
        body["system_instruction"] = json!({
            "parts": [{"text": request.system}]
        });
    }

    let resp = client
        .post(url)
        .query(&[("key", api_key)])
        .json(&body)
        .send()
        .await?;
    let v = read_json(resp, "gemini").await?;
    Ok((extract_gemini_content(&v), extract_gemini_usage(&v)))
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn extract_data_line(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    for line in text.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix("data:") {
            return Some(rest.trim().to_string());
        }
    }
    None
}

fn parse_openai_delta(line: &str) -> Option<String> {
    let v: Value = serde_json::from_str(line).ok()?;
    v.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn parse_openai_usage(line: &str) -> Option<Usage> {
    let v: Value = serde_json::from_str(line).ok()?;
    let usage = v.get("usage").filter(|u| !u.is_null())?;
    Some(Usage {
        prompt_tokens: usage.get("prompt_tokens")?.as_i64()?,
        completion_tokens: usage.get("completion_tokens")?.as_i64()?,
    })
}

fn extract_anthropic_content(v: &Value) -> String {
    v.get("content")
        .and_then(|arr| arr.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn extract_anthropic_usage(v: &Value) -> Usage {
    let usage = v.get("usage");
    let field = |name: &str| {
        usage
            .and_then(|u| u.get(name))
            .and_then(|n| n.as_i64())
            .unwrap_or(0)
    };
    Usage {
        prompt_tokens: field("input_tokens"),
        completion_tokens: field("output_tokens"),
    }
}

fn extract_gemini_content(v: &Value) -> String {
    if let Some(first) = v
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    {
        if let Some(parts) = first
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(|p| p.as_array())
        {
            return parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("");
        }
    }
    String::new()
}

fn extract_gemini_usage(v: &Value) -> Usage {
    let meta = v.get("usageMetadata");
    let field = |name: &str| {
        meta.and_then(|m| m.get(name))
            .and_then(|n| n.as_i64())
            .unwrap_or(0)
    };
    Usage {
        prompt_tokens: field("promptTokenCount"),
        completion_tokens: field("candidatesTokenCount"),
    }
}

fn anthropic_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            json!({
                "role": msg.role.as_str(),
                "content": [{"type": "text", "text": msg.content}]
            })
        })
        .collect()
}

fn gemini_contents(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            let role = match msg.role {
                Role::Assistant => "model",
                Role::User => "user",
            };
            json!({
                "role": role,
                "parts": [{"text": msg.content}]
            })
        })
        .collect()
}

fn parse_openai_embeddings(v: &Value) -> Result<Vec<Vec<f32>>> {
    let data = v
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("unexpected embeddings payload: {}", v))?;
    data.iter()
        .map(|item| {
            item.get("embedding")
                .and_then(|e| e.as_array())
                .map(|e| e.iter().filter_map(|x| x.as_f64()).map(|x| x as f32).collect())
                .ok_or_else(|| anyhow!("embedding entry without vector"))
        })
        .collect()
}

fn parse_gemini_embeddings(v: &Value) -> Result<Vec<Vec<f32>>> {
    let data = v
        .get("embeddings")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("unexpected gemini embeddings payload: {}", v))?;
    data.iter()
        .map(|item| {
            item.get("values")
                .and_then(|e| e.as_array())
                .map(|e| e.iter().filter_map(|x| x.as_f64()).map(|x| x as f32).collect())
                .ok_or_else(|| anyhow!("embedding entry without values"))
        })
        .collect()
}

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_block_parsing() {
        let buf = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\ndata: [DONE]\n\n";
        let pos = find_double_newline(buf).unwrap();
        let line = extract_data_line(&buf[..pos]).unwrap();
        assert_eq!(parse_openai_delta(&line).as_deref(), Some("Hel"));
        assert!(parse_openai_usage(&line).is_none());
    }

    #[test]
    fn openai_usage_chunk() {
        let line = r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}"#;
        assert_eq!(
            parse_openai_usage(line),
            Some(Usage {
                prompt_tokens: 12,
                completion_tokens: 3
            })
        );
        assert!(parse_openai_delta(line).is_none());
    }

    #[test]
    fn system_prompt_leads_openai_messages() {
        let request = GenerationRequest {
            system: "sys".into(),
            messages: vec![Message::new(Role::User, "Hi")],
        };
        let msgs = openai_messages(&request);
        assert_eq!(msgs[0], json!({"role": "system", "content": "sys"}));
        assert_eq!(msgs[1], json!({"role": "user", "content": "Hi"}));
    }

    #[test]
    fn anthropic_response_parsing() {
        let v = json!({
            "content": [{"type": "text", "text": "Hello"}, {"type": "text", "text": " there"}],
            "usage": {"input_tokens": 9, "output_tokens": 2}
        });
        assert_eq!(extract_anthropic_content(&v), "Hello there");
        assert_eq!(
            extract_anthropic_usage(&v),
            Usage {
                prompt_tokens: 9,
                completion_tokens: 2
            }
        );
    }

    #[test]
    fn gemini_response_parsing() {
        let v = json!({
            "candidates": [{"content": {"parts": [{"text": "Bonjour"}]}}],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 1}
        });
        assert_eq!(extract_gemini_content(&v), "Bonjour");
        assert_eq!(extract_gemini_usage(&v).prompt_tokens, 5);
    }

    #[test]
    fn gemini_roles_map_assistant_to_model() {
        let contents = gemini_contents(&[
            Message::new(Role::User, "a"),
            Message::new(Role::Assistant, "b"),
        ]);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn gemini_base_gets_version_suffix() {
        assert_eq!(
            normalize_gemini_base("https://generativelanguage.googleapis.com/"),
            "https://generativelanguage.googleapis.com/v1beta"
        );
        assert_eq!(
            normalize_gemini_base("http://localhost:8080/v1"),
            "http://localhost:8080/v1"
        );
    }

    #[test]
    fn embeddings_payloads() {
        let v = json!({"data": [{"embedding": [0.5, 1.0]}]});
        assert_eq!(parse_openai_embeddings(&v).unwrap(), vec![vec![0.5f32, 1.0]]);
        let v = json!({"embeddings": [{"values": [0.25]}]});
        assert_eq!(parse_gemini_embeddings(&v).unwrap(), vec![vec![0.25f32]]);
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let model = LanguageModel {
            client: ProviderClient {
                provider: Provider::OpenAI,
                api_key: None,
                api_base: "http://127.0.0.1:1".into(),
            },
            model_id: "gpt-4o".into(),
        };
        let request = GenerationRequest {
            system: String::new(),
            messages: vec![],
        };
        let err = HttpGenerator::new()
            .stream(&model, &request)
            .await
            .err()
            .expect("missing key error");
        assert!(err.to_string().contains("no api key"));
    }

    #[tokio::test]
    async fn embed_without_key_fails_before_any_request() {
        let model = EmbeddingModel {
            client: ProviderClient {
                provider: Provider::Google,
                api_key: Some("  ".into()),
                api_base: "http://127.0.0.1:1".into(),
            },
            model_id: "text-embedding-004".into(),
        };
        let err = HttpGenerator::new()
            .embed(&model, &["hello".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no api key"));
    }
}
