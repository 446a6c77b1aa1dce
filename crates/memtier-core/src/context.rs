//! Turns retrieval results into prompt-ready context.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MemtierError;
use crate::retriever::ScoredMemory;

/// Compact rendering keeps at most this many lines.
const COMPACT_MAX_ITEMS: usize = 10;

/// Role assumed for chat output when a record has none.
const DEFAULT_ROLE: &str = "user";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextFormat {
    /// Current thread and related history, split
    #[default]
    Structured,
    /// Flat list of lines
    Simple,
    /// Role-tagged messages
    Chat,
}

impl FromStr for ContextFormat {
    type Err = MemtierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "structured" => Ok(Self::Structured),
            "simple" => Ok(Self::Simple),
            "chat" => Ok(Self::Chat),
            other => Err(MemtierError::Config(format!(
                "unknown context format {other:?} (expected structured, simple or chat)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStyle {
    #[default]
    Conversational,
    Bullet,
    Compact,
}

impl FromStr for ContextStyle {
    type Err = MemtierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conversational" => Ok(Self::Conversational),
            "bullet" => Ok(Self::Bullet),
            "compact" => Ok(Self::Compact),
            other => Err(MemtierError::Config(format!(
                "unknown context style {other:?} (expected conversational, bullet or compact)"
            ))),
        }
    }
}

/// Most common metadata values across the assembled records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextScores {
    pub thread_avg: Option<f64>,
    pub related_avg: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Output of [`ContextAssembler::assemble`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum AssembledContext {
    Structured {
        thread_context: Vec<String>,
        related_history: Vec<String>,
        metadata: ContextMetadata,
        #[serde(skip_serializing_if = "Option::is_none")]
        scores: Option<ContextScores>,
    },
    Simple {
        memories: Vec<String>,
        count: usize,
    },
    Chat {
        messages: Vec<ChatMessage>,
        thread: Option<String>,
        count: usize,
    },
}

impl AssembledContext {
    /// (current thread lines, related lines)
    fn sections(&self) -> (Vec<String>, Vec<String>) {
        match self {
            Self::Structured {
                thread_context,
                related_history,
                ..
            } => (thread_context.clone(), related_history.clone()),
            Self::Simple { memories, .. } => (Vec::new(), memories.clone()),
            Self::Chat { messages, .. } => (
                messages
                    .iter()
                    .map(|m| format!("{}: {}", capitalize(&m.role), m.content))
                    .collect(),
                Vec::new(),
            ),
        }
    }
}

/// Formats scored memories for a language-model context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextAssembler {
    pub include_metadata: bool,
    pub include_scores: bool,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self {
            include_metadata: true,
            include_scores: false,
        }
    }
}

impl ContextAssembler {
    pub fn new(include_metadata: bool, include_scores: bool) -> Self {
        Self {
            include_metadata,
            include_scores,
        }
    }

    pub fn assemble(
        &self,
        memories: &[ScoredMemory],
        thread: Option<&str>,
        owner: Option<&str>,
        format: ContextFormat,
    ) -> AssembledContext {
        match format {
            ContextFormat::Structured => self.structured(memories, thread, owner),
            ContextFormat::Simple => AssembledContext::Simple {
                memories: memories.iter().map(line).collect(),
                count: memories.len(),
            },
            ContextFormat::Chat => AssembledContext::Chat {
                messages: memories
                    .iter()
                    .map(|m| ChatMessage {
                        role: m.record.metadata.role().unwrap_or(DEFAULT_ROLE).to_string(),
                        content: m.record.content.clone(),
                    })
                    .collect(),
                thread: thread.map(str::to_string),
                count: memories.len(),
            },
        }
    }

    fn structured(
        &self,
        memories: &[ScoredMemory],
        thread: Option<&str>,
        owner: Option<&str>,
    ) -> AssembledContext {
        let (current, related): (Vec<&ScoredMemory>, Vec<&ScoredMemory>) = memories
            .iter()
            .partition(|m| thread.is_some() && m.record.thread.as_deref() == thread);

        let metadata = if self.include_metadata && !memories.is_empty() {
            ContextMetadata {
                thread: thread.map(str::to_string),
                owner: owner.map(str::to_string),
                topic: most_common(memories.iter().filter_map(|m| m.record.metadata.topic())),
                category: most_common(memories.iter().filter_map(|m| m.record.metadata.category())),
                importance: most_common(
                    memories
                        .iter()
                        .filter(|m| m.record.metadata.get("importance").is_some())
                        .map(|m| m.record.metadata.importance().as_str()),
                ),
            }
        } else {
            ContextMetadata::default()
        };

        let scores = self.include_scores.then(|| ContextScores {
            thread_avg: avg(&current),
            related_avg: avg(&related),
        });

        AssembledContext::Structured {
            thread_context: current.into_iter().map(line).collect(),
            related_history: related.into_iter().map(line).collect(),
            metadata,
            scores,
        }
    }

    /// Render assembled context as plain text.
    pub fn render(&self, context: &AssembledContext, style: ContextStyle) -> String {
        let (current, related) = context.sections();
        let mut parts = Vec::new();
        match style {
            ContextStyle::Conversational => {
                if !current.is_empty() {
                    parts.push("Current Conversation:".to_string());
                    parts.extend(current.iter().map(|l| format!("  {l}")));
                }
                if !related.is_empty() {
                    parts.push("\nRelated Context:".to_string());
                    parts.extend(related.iter().map(|l| format!("  {l}")));
                }
            }
            ContextStyle::Bullet => {
                if !current.is_empty() {
                    parts.push("• Current Thread:".to_string());
                    parts.extend(current.iter().map(|l| format!("  - {l}")));
                }
                if !related.is_empty() {
                    parts.push("• Related History:".to_string());
                    parts.extend(related.iter().map(|l| format!("  - {l}")));
                }
            }
            ContextStyle::Compact => {
                return current
                    .into_iter()
                    .chain(related)
                    .take(COMPACT_MAX_ITEMS)
                    .collect::<Vec<_>>()
                    .join(" | ");
            }
        }
        parts.join("\n")
    }
}

impl fmt::Display for ContextStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Conversational => "conversational",
            Self::Bullet => "bullet",
            Self::Compact => "compact",
        })
    }
}

fn line(memory: &ScoredMemory) -> String {
    match memory.record.metadata.role() {
        Some(role) => format!("{}: {}", capitalize(role), memory.record.content),
        None => memory.record.content.clone(),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Most frequent value; ties go to the lexicographically smallest.
fn most_common<'a>(values: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }
    let max = counts.values().copied().max()?;
    counts
        .into_iter()
        .find(|(_, c)| *c == max)
        .map(|(v, _)| v.to_string())
}

fn avg(memories: &[&ScoredMemory]) -> Option<f64> {
    if memories.is_empty() {
        return None;
    }
    Some(memories.iter().map(|m| f64::from(m.score)).sum::<f64>() / memories.len() as f64)
}
