//! Model provider client.
//!
//! Talks to an OpenAI-compatible `/v1/chat/completions` endpoint. The SSE
//! parsing boundary turns every `data:` line into typed `ProviderEvent`s so the
//! stream relay never inspects raw JSON.
use async_trait::async_trait;
use futures_util::StreamExt;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{JsonCompletion, ModelProvider, ProviderEvent, ProviderStream};
use crate::config::Config;
use crate::message::Message;
use crate::session_store::UsageInfo;

lazy_static! {
    static ref CODE_FENCE: Regex =
        Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)\s*```\s*$").expect("valid fence regex");
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<UsagePayload>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<ChatDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl From<UsagePayload> for UsageInfo {
    fn from(payload: UsagePayload) -> Self {
        let total = if payload.total_tokens == 0 {
            payload.prompt_tokens + payload.completion_tokens
        } else {
            payload.total_tokens
        };
        UsageInfo {
            prompt_tokens: payload.prompt_tokens,
            completion_tokens: payload.completion_tokens,
            total_tokens: total,
        }
    }
}

/// Events parsed from one SSE `data:` line.
#[derive(Debug, Default, PartialEq)]
pub struct SseData {
    pub events: Vec<ProviderEvent>,
    /// A choice reported a `finish_reason`; the answer is complete even if
    /// `[DONE]` never arrives.
    pub finished: bool,
}

/// Parse the payload of one SSE `data:` line.
pub fn parse_sse_data(data: &str) -> SseData {
    let data = data.trim();
    if data == "[DONE]" {
        return SseData { events: vec![ProviderEvent::Done], finished: true };
    }

    let chunk: StreamChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            debug!("Skipping unparseable stream chunk: {}", e);
            return SseData::default();
        }
    };

    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return SseData { events: vec![ProviderEvent::ProviderError(message)], finished: false };
    }

    let finished = chunk.choices.iter().any(|c| c.finish_reason.is_some());
    let mut events: Vec<ProviderEvent> = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.and_then(|d| d.content))
        .filter(|text| !text.is_empty())
        .map(ProviderEvent::Delta)
        .collect();

    if let Some(usage) = chunk.usage {
        events.push(ProviderEvent::UsageOnly(usage.into()));
    }
    SseData { events, finished }
}

/// Remove a surrounding Markdown code fence, if any.
pub fn strip_code_fences(text: &str) -> String {
    match CODE_FENCE.captures(text) {
        Some(caps) => caps.get(1).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
        None => text.trim().to_string(),
    }
}

pub struct LLMClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    temperature: f32,
    http_client: reqwest::Client,
}

impl LLMClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!("LLM client initialized with backend: {}", base_url);
        Self {
            base_url,
            api_key: None,
            model: model.into(),
            max_tokens: 2000,
            temperature: 0.7,
            http_client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let mut client = Self::new(cfg.llm_base_url.clone(), cfg.llm_model.clone())
            .with_generation(cfg.max_tokens, cfg.temperature);
        client.api_key = cfg.llm_api_key.clone();
        client
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_generation(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    async fn post(&self, request: &ChatCompletionRequest<'_>) -> anyhow::Result<reqwest::Response> {
        let mut builder = self.http_client.post(self.completions_url()).json(request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("LLM backend request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("LLM backend returned {}: {}", status, body));
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelProvider for LLMClient {
    async fn stream_chat(&self, messages: Vec<Message>) -> anyhow::Result<ProviderStream> {
        debug!("LLM client starting streaming response ({} messages)", messages.len());
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: &messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: true,
            stream_options: Some(StreamOptions { include_usage: true }),
        };
        let response = self.post(&request).await?;
        let byte_stream = response.bytes_stream();

        let events = async_stream::try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut finished = false;
            futures_util::pin_mut!(byte_stream);

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = chunk_result
                    .map_err(|e| anyhow::anyhow!("Stream read error: {}", e))?;
                buffer.extend_from_slice(&chunk);

                while let Some(newline_pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line_bytes: Vec<u8> = buffer.drain(..=newline_pos).collect();
                    let line = String::from_utf8_lossy(&line_bytes);
                    let Some(data) = line.trim().strip_prefix("data:") else {
                        continue;
                    };
                    let parsed = parse_sse_data(data);
                    finished |= parsed.finished;
                    for event in parsed.events {
                        let done = event == ProviderEvent::Done;
                        yield event;
                        if done {
                            return;
                        }
                    }
                }
            }

            let tail = String::from_utf8_lossy(&buffer).trim().to_string();
            if let Some(data) = tail.strip_prefix("data:") {
                let parsed = parse_sse_data(data);
                finished |= parsed.finished;
                for event in parsed.events {
                    let done = event == ProviderEvent::Done;
                    yield event;
                    if done {
                        return;
                    }
                }
            }

            if !finished {
                Err::<(), _>(anyhow::anyhow!("stream ended before completion"))?;
            }
            yield ProviderEvent::Done;
        };

        Ok(events.boxed())
    }

    async fn complete_json(&self, messages: Vec<Message>) -> anyhow::Result<JsonCompletion> {
        debug!("LLM client requesting structured answer ({} messages)", messages.len());
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: &messages,
            max_tokens: self.max_tokens,
            temperature: 0.0,
            stream: false,
            stream_options: None,
        };
        let response = self.post(&request).await?;
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse LLM response: {}", e))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| anyhow::anyhow!("LLM response contained no message content"))?;

        Ok(JsonCompletion {
            json_text: strip_code_fences(&content),
            usage: completion.usage.map(UsageInfo::from),
        })
    }
}
