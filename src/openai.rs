//! Authoring-service client.
//!
//! `GenerationClient` is the seam the pool depends on; `OpenAI` is the
//! production implementation over an OpenAI-compatible chat.completions API.
//! Calls are instrumented and log model names, latencies and response sizes (not contents).
//!
//! NOTE: We never log the API key and we keep payload truncations short to avoid PII leaks.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{instrument, info, warn};

use crate::config::Prompts;
use crate::domain::{Difficulty, ExerciseContent, TemplateId};
use crate::error::GenerationError;
use crate::util::{extract_json_object, fill_template, trunc_for_log};

/// What the pool asks the authoring service for.
#[derive(Clone, Debug)]
pub struct GenerationRequest {
  pub template_id: TemplateId,
  pub difficulty: Difficulty,
  /// Fully rendered template prompt.
  pub prompt: String,
}

/// Validated content plus the model that produced it.
#[derive(Clone, Debug)]
pub struct GeneratedContent {
  pub content: ExerciseContent,
  pub model: String,
}

/// Opaque, slow, possibly failing content generator.
#[async_trait]
pub trait GenerationClient: Send + Sync {
  async fn generate(&self, req: &GenerationRequest) -> Result<GeneratedContent, GenerationError>;

  /// Model name reported in statistics.
  fn model(&self) -> &str;
}

#[derive(Clone)]
pub struct OpenAI {
  pub client: reqwest::Client,
  pub api_key: String,
  pub base_url: String,
  pub model: String,
  pub temperature: f32,
  prompts: Prompts,
}

impl OpenAI {
  /// Construct the client if we find OPENAI_API_KEY; otherwise return None.
  pub fn from_env(prompts: Prompts, temperature: f32, timeout: Duration) -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty())?;
    let base_url =
      std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let model =
      std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());

    // The generator wraps each call in its own timeout; this one guards the socket.
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .connect_timeout(Duration::from_secs(10))
      .build()
      .ok()?;

    Some(Self { client, api_key, base_url, model, temperature, prompts })
  }

  /// JSON-object chat completion returning the raw assistant text.
  #[instrument(level = "info", skip(self, system, user), fields(model = %self.model))]
  async fn chat_json_text(&self, system: &str, user: &str) -> Result<String, GenerationError> {
    let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
    let req = ChatCompletionRequest {
      model: self.model.clone(),
      messages: vec![
        ChatMessageReq { role: "system".into(), content: system.into() },
        ChatMessageReq { role: "user".into(), content: user.into() },
      ],
      temperature: self.temperature,
      response_format: Some(ResponseFormat { r#type: "json_object".into() }),
      max_tokens: Some(4000),
    };

    let res = self.client.post(&url)
      .header(USER_AGENT, "exercise-pool/0.1")
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(&req).send().await.map_err(classify_transport)?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let msg = extract_openai_error(&body).unwrap_or_else(|| trunc_for_log(&body, 200));
      return Err(classify_status(status, msg));
    }

    let body: ChatCompletionResponse = res.json().await
      .map_err(|e| GenerationError::Transient(format!("unreadable response body: {e}")))?;
    if let Some(usage) = &body.usage {
      info!(prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "OpenAI usage");
    }
    Ok(body.choices.first()
      .and_then(|c| c.message.content.clone())
      .unwrap_or_default())
  }
}

#[async_trait]
impl GenerationClient for OpenAI {
  #[instrument(level = "info", skip(self, req), fields(template_id = %req.template_id, difficulty = %req.difficulty, prompt_len = req.prompt.len()))]
  async fn generate(&self, req: &GenerationRequest) -> Result<GeneratedContent, GenerationError> {
    let difficulty = req.difficulty.as_str();
    let system = fill_template(&self.prompts.exercise_system, &[("difficulty", difficulty)]);
    let suffix = fill_template(&self.prompts.exercise_user_suffix, &[("difficulty", difficulty)]);
    let user = format!("{}\n\n{}", req.prompt.trim(), suffix);

    let text = self.chat_json_text(&system, &user).await?;
    let content = parse_exercise_content(&text)?;
    info!(template_id = %req.template_id, response_len = text.len(), "Exercise content received");
    Ok(GeneratedContent { content, model: self.model.clone() })
  }

  fn model(&self) -> &str { &self.model }
}

/// Stand-in when no API key is configured: every call fails permanently, so
/// the pool serves existing stock and the HTTP layer falls back to seeds.
pub struct OfflineClient;

#[async_trait]
impl GenerationClient for OfflineClient {
  async fn generate(&self, req: &GenerationRequest) -> Result<GeneratedContent, GenerationError> {
    warn!(template_id = %req.template_id, "Generation requested but OPENAI_API_KEY is not set");
    Err(GenerationError::Permanent("no authoring service configured".into()))
  }

  fn model(&self) -> &str { "offline" }
}

/// Turn a model reply into validated exercise content.
pub fn parse_exercise_content(text: &str) -> Result<ExerciseContent, GenerationError> {
  let value = extract_json_object(text).ok_or_else(|| {
    warn!(target: "generation", preview = %trunc_for_log(text, 80), "Model reply has no JSON object");
    GenerationError::Permanent("model reply contained no JSON object".into())
  })?;
  let content = ExerciseContent(value);
  if content.question().map(str::trim).unwrap_or_default().is_empty() {
    return Err(GenerationError::Permanent("content is missing 'question'".into()));
  }
  if content.correct_answer().is_none() {
    return Err(GenerationError::Permanent("content is missing 'correct_answer'".into()));
  }
  Ok(content)
}

fn classify_transport(e: reqwest::Error) -> GenerationError {
  if e.is_builder() {
    GenerationError::Permanent(e.to_string())
  } else {
    GenerationError::Transient(e.to_string())
  }
}

fn classify_status(status: StatusCode, msg: String) -> GenerationError {
  let msg = format!("OpenAI HTTP {}: {}", status, msg);
  if status.is_server_error()
    || status == StatusCode::TOO_MANY_REQUESTS
    || status == StatusCode::REQUEST_TIMEOUT
  {
    GenerationError::Transient(msg)
  } else {
    GenerationError::Permanent(msg)
  }
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_format: Option<ResponseFormat>,
  #[serde(skip_serializing_if = "Option::is_none")]
  max_tokens: Option<u32>,
}
#[derive(Serialize)]
struct ChatMessageReq { role: String, content: String }
#[derive(Serialize)]
struct ResponseFormat { #[serde(rename = "type")] r#type: String }

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp { content: Option<String> }
#[derive(Deserialize)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u32>,
  #[serde(default)] completion_tokens: Option<u32>,
  #[serde(default)] total_tokens: Option<u32>,
}

/// Try to extract a clean error message from OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  match serde_json::from_str::<EWrap>(body) {
    Ok(w) => Some(w.error.message),
    Err(_) => None,
  }
}
