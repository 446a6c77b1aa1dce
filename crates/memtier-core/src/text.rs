//! Pluggable text processors used by the policy executor.
//!
//! Trimming is a cheap synchronous cut; summarization may call out to a
//! remote service and is therefore async. Both have a no-op variant so lossy
//! processing can be switched off entirely. Lengths are counted in `char`s.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{SummarizerConfig, SummarizerKind, TrimmerConfig, TrimmerKind};

const ELLIPSIS: char = '…';

/// Shortens text to at most `max_chars` characters.
pub trait Trimmer: Send + Sync {
    fn trim(&self, text: &str, max_chars: usize) -> String;

    fn name(&self) -> &'static str;
}

/// Condenses text toward `target_chars` characters.
///
/// Implementations never fail: transient errors must fall back to a local
/// heuristic and return its output.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str, target_chars: usize) -> String;

    fn name(&self) -> &'static str;
}

fn take_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ---------------------------------------------------------------------------
// Trimmers
// ---------------------------------------------------------------------------

/// Returns the input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTrimmer;

impl Trimmer for NoOpTrimmer {
    fn trim(&self, text: &str, _max_chars: usize) -> String {
        text.to_string()
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Cuts to `max_chars - 1` characters, strips trailing whitespace and
/// appends an ellipsis.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleTrimmer;

impl Trimmer for SimpleTrimmer {
    fn trim(&self, text: &str, max_chars: usize) -> String {
        if max_chars == 0 {
            return String::new();
        }
        if text.chars().count() <= max_chars {
            return text.to_string();
        }
        let head = take_chars(text, max_chars - 1).trim_end();
        if head.is_empty() {
            return take_chars(text, max_chars).to_string();
        }
        let mut out = String::with_capacity(head.len() + ELLIPSIS.len_utf8());
        out.push_str(head);
        out.push(ELLIPSIS);
        out
    }

    fn name(&self) -> &'static str {
        "simple"
    }
}

// ---------------------------------------------------------------------------
// Summarizers
// ---------------------------------------------------------------------------

/// Returns the input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSummarizer;

#[async_trait]
impl Summarizer for NoOpSummarizer {
    async fn summarize(&self, text: &str, _target_chars: usize) -> String {
        text.to_string()
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Keeps the first sentence when it fits, otherwise trims.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleSummarizer;

impl SimpleSummarizer {
    pub fn summarize_sync(&self, text: &str, target_chars: usize) -> String {
        if target_chars == 0 {
            return String::new();
        }
        if text.chars().count() <= target_chars {
            return text.to_string();
        }
        if let Some(pos) = text.chars().position(|c| c == '.') {
            if pos > 0 && pos < target_chars {
                return take_chars(text, pos + 1).to_string();
            }
        }
        SimpleTrimmer.trim(text, target_chars)
    }
}

#[async_trait]
impl Summarizer for SimpleSummarizer {
    async fn summarize(&self, text: &str, target_chars: usize) -> String {
        self.summarize_sync(text, target_chars)
    }

    fn name(&self) -> &'static str {
        "simple"
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
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
    content: Option<String>,
}

/// Summarizer backed by an OpenAI-compatible chat-completions endpoint.
///
/// Any failure (missing key, transport error, non-success status, malformed
/// or empty answer) falls back to [`SimpleSummarizer`]. Answers longer than
/// the target are trimmed.
#[derive(Debug, Clone)]
pub struct EnrichmentSummarizer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl EnrichmentSummarizer {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        })
    }

    /// Build from config, reading the key from `api_key_env`.
    pub fn from_config(config: &SummarizerConfig) -> Result<Self, reqwest::Error> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        Self::new(
            config.endpoint.clone(),
            config.model.clone(),
            api_key,
            Duration::from_secs(config.timeout_secs.max(1)),
        )
    }

    async fn request(&self, text: &str, target_chars: usize) -> anyhow::Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no API key configured"))?;
        let instruction = format!(
            "Summarize the user's text in at most {target_chars} characters. \
             Keep names, numbers and decisions. Reply with the summary only."
        );
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &instruction,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
            temperature: 0.2,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let parsed: ChatResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| anyhow::anyhow!("empty completion"))?;
        Ok(content)
    }
}

#[async_trait]
impl Summarizer for EnrichmentSummarizer {
    async fn summarize(&self, text: &str, target_chars: usize) -> String {
        if target_chars == 0 || text.chars().count() <= target_chars {
            return SimpleSummarizer.summarize_sync(text, target_chars);
        }
        match self.request(text, target_chars).await {
            Ok(summary) => {
                debug!(chars = summary.chars().count(), "enrichment summary received");
                SimpleTrimmer.trim(&summary, target_chars)
            }
            Err(e) => {
                warn!(event = "summarizer.fallback", summarizer = "enrichment", error = %e);
                SimpleSummarizer.summarize_sync(text, target_chars)
            }
        }
    }

    fn name(&self) -> &'static str {
        "enrichment"
    }
}

// ---------------------------------------------------------------------------
// Factories
// ---------------------------------------------------------------------------

pub fn build_trimmer(config: &TrimmerConfig) -> Arc<dyn Trimmer> {
    match config.kind {
        TrimmerKind::Simple => Arc::new(SimpleTrimmer),
        TrimmerKind::Noop => Arc::new(NoOpTrimmer),
    }
}

pub fn build_summarizer(config: &SummarizerConfig) -> Arc<dyn Summarizer> {
    match config.kind {
        SummarizerKind::Simple => Arc::new(SimpleSummarizer),
        SummarizerKind::Noop => Arc::new(NoOpSummarizer),
        SummarizerKind::Enrichment => match EnrichmentSummarizer::from_config(config) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!(error = %e, "enrichment summarizer unavailable, using simple");
                Arc::new(SimpleSummarizer)
            }
        },
    }
}
