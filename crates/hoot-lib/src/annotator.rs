//! Text annotation through an OpenAI-compatible chat completion endpoint.
//!
//! The model is asked to insert `[CODE,seconds]` markers into the text. Some
//! models answer with a JSON object of parallel `speech` / `movements` lists
//! instead; [`classify_reply`] accepts both.

use futures_util::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, warn};

use hoot_core::annotate::{AnnotatorOutput, StructuredSegments};
use hoot_core::types::AnnotatorConfig;

use crate::error::AnnotationError;

/// Produces marker text (or structured lists) for plain input text.
pub trait Annotator: Send + Sync {
    fn annotate<'a>(&'a self, text: &'a str)
    -> BoxFuture<'a, Result<AnnotatorOutput, AnnotationError>>;
}

const SYSTEM_PROMPT: &str =
    "You add owl movement markers to text. Return ONLY the text with markers inserted.";

fn user_prompt(text: &str) -> String {
    format!(
        "Analyze the following text for an owl robot and add appropriate movement markers \
to create a natural, expressive delivery.

AVAILABLE MOVEMENTS:
- [TLTFRONT,duration] - Tilt forward (like nodding)
- [TLTBACK,duration] - Tilt backward (like looking up)
- [ROTRIGHT,duration] - Rotate head right
- [ROTLEFT,duration] - Rotate head left
- [TLTRIGHT,duration] - Tilt head right
- [TLTLEFT,duration] - Tilt head left

GUIDELINES:
- Insert movements at natural pauses (commas, periods)
- Use durations between 0.5 and 1.5 seconds
- Match movements to emotional content
- Use 1-2 movements per sentence
- Return ONLY the text with markers inserted

TEXT TO ENHANCE:
{text}"
    )
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

const STRUCTURED_KEYS: [&str; 4] = ["speech", "movements", "speech_segments", "movement_segments"];

/// Decide whether a model reply is marker text or a structured JSON object.
pub fn classify_reply(reply: &str) -> Option<AnnotatorOutput> {
    let trimmed = strip_code_fence(reply.trim());
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.starts_with('{')
        && let Ok(serde_json::Value::Object(map)) = serde_json::from_str(trimmed)
        && STRUCTURED_KEYS.iter().any(|k| map.contains_key(*k))
    {
        match serde_json::from_value::<StructuredSegments>(serde_json::Value::Object(map)) {
            Ok(lists) => return Some(AnnotatorOutput::Structured(lists)),
            Err(e) => warn!("annotator: malformed structured reply, treating as text: {e}"),
        }
    }

    Some(AnnotatorOutput::Marked(trimmed.to_string()))
}

/// Drop a surrounding ```/```json fence if the model added one.
fn strip_code_fence(reply: &str) -> &str {
    let Some(body) = reply.strip_prefix("```") else {
        return reply;
    };
    let body = body.strip_suffix("```").unwrap_or(body);
    let body = match body.find('\n') {
        Some(nl) if !body[..nl].contains(' ') => &body[nl + 1..],
        _ => body,
    };
    body.trim()
}

/// Annotator backed by a chat completion API.
#[derive(Clone)]
pub struct OpenAiAnnotator {
    client: reqwest::Client,
    config: AnnotatorConfig,
}

impl OpenAiAnnotator {
    pub fn new(config: AnnotatorConfig) -> Result<Self, AnnotationError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    async fn complete(&self, text: &str) -> Result<AnnotatorOutput, AnnotationError> {
        let key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| AnnotationError::Unavailable("no API key configured".into()))?;

        let body = serde_json::json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_prompt(text) },
            ],
        });

        let resp = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(AnnotationError::Unavailable(format!(
                "completion endpoint returned {status}: {detail}"
            )));
        }

        let chat: ChatResponse = resp.json().await?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        debug!("annotator: {} chars in, {} chars out", text.len(), content.len());
        classify_reply(&content).ok_or(AnnotationError::Empty)
    }
}

impl Annotator for OpenAiAnnotator {
    fn annotate<'a>(
        &'a self,
        text: &'a str,
    ) -> BoxFuture<'a, Result<AnnotatorOutput, AnnotationError>> {
        Box::pin(self.complete(text))
    }
}
