//! Canonical, provider-agnostic message representation
//!
//! Every wire codec translates to and from these types. The shapes cover the
//! fields the supported provider formats share: roles, ordered text/image
//! content parts, generation parameters and token usage. Provider-specific
//! extras do not survive translation.

use serde::{Deserialize, Serialize};

/// Conversation role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System / instruction turn
    System,
    /// End-user turn
    User,
    /// Model turn
    Assistant,
}

impl Role {
    /// Wire name shared by the OpenAI and Anthropic schemas
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One content part of a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentPart {
    /// Plain text
    Text { text: String },
    /// Image referenced by URL
    ImageUrl {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Inline base64 image data
    ImageInline { media_type: String, data: String },
}

impl ContentPart {
    /// Text content of this part, if any
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Whether this part is an image of either encoding
    pub fn is_image(&self) -> bool {
        matches!(
            self,
            ContentPart::ImageUrl { .. } | ContentPart::ImageInline { .. }
        )
    }
}

/// One turn of the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Turn {
    /// Create a text-only turn
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// Concatenated text content of this turn
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(ContentPart::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Generation parameters shared across the supported formats
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub stream: bool,
}

/// Canonical inbound request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub model: String,
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub params: GenerationParams,
}

impl CanonicalRequest {
    /// All text content across turns, for token estimation
    pub fn joined_text(&self) -> String {
        self.turns
            .iter()
            .map(Turn::joined_text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Number of image parts across all turns
    pub fn image_count(&self) -> u64 {
        self.turns
            .iter()
            .flat_map(|t| t.parts.iter())
            .filter(|p| p.is_image())
            .count() as u64
    }
}

/// Token usage counters reported by an upstream, when present
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl UsageCounters {
    /// Whether no counter carries a value
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0
            && self.completion_tokens == 0
            && self.cache_read_tokens == 0
            && self.cache_write_tokens == 0
    }

    /// Merge counters, preferring non-zero values from `other`
    pub fn merge(&mut self, other: &UsageCounters) {
        if other.prompt_tokens > 0 {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens > 0 {
            self.completion_tokens = other.completion_tokens;
        }
        if other.cache_read_tokens > 0 {
            self.cache_read_tokens = other.cache_read_tokens;
        }
        if other.cache_write_tokens > 0 {
            self.cache_write_tokens = other.cache_write_tokens;
        }
    }
}

/// Why the model stopped generating
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolUse,
    Other(String),
}

/// Canonical upstream response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResponse {
    /// Upstream response identifier, if supplied
    pub id: Option<String>,
    /// Model the upstream reports having used
    pub model: Option<String>,
    /// Output turns (a single assistant turn for all supported formats)
    pub turns: Vec<Turn>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<UsageCounters>,
}

impl CanonicalResponse {
    /// Concatenated output text, for token estimation
    pub fn joined_text(&self) -> String {
        self.turns
            .iter()
            .map(Turn::joined_text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One canonical delta of a streamed response
///
/// Chunk boundaries need not map 1:1 onto wire chunks; ordering of text is
/// what codecs must preserve.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalChunk {
    pub id: Option<String>,
    pub model: Option<String>,
    /// Text appended by this delta (may be empty for control events)
    pub text: String,
    pub finish_reason: Option<FinishReason>,
    /// Usage counters, typically only on the final delta
    pub usage: Option<UsageCounters>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joined_text_spans_turns() {
        let req = CanonicalRequest {
            model: "gpt-4o".to_string(),
            turns: vec![
                Turn::text(Role::System, "Be helpful."),
                Turn::text(Role::User, "Hello"),
            ],
            params: GenerationParams::default(),
        };
        assert_eq!(req.joined_text(), "Be helpful.\nHello");
    }

    #[test]
    fn test_image_count() {
        let req = CanonicalRequest {
            model: "gpt-4o".to_string(),
            turns: vec![Turn {
                role: Role::User,
                parts: vec![
                    ContentPart::Text {
                        text: "what is this".to_string(),
                    },
                    ContentPart::ImageUrl {
                        url: "https://example.com/cat.png".to_string(),
                        detail: None,
                    },
                    ContentPart::ImageInline {
                        media_type: "image/png".to_string(),
                        data: "aGVsbG8=".to_string(),
                    },
                ],
            }],
            params: GenerationParams::default(),
        };
        assert_eq!(req.image_count(), 2);
    }

    #[test]
    fn test_usage_merge_prefers_nonzero() {
        let mut base = UsageCounters {
            prompt_tokens: 10,
            ..Default::default()
        };
        base.merge(&UsageCounters {
            completion_tokens: 5,
            cache_read_tokens: 3,
            ..Default::default()
        });
        assert_eq!(base.prompt_tokens, 10);
        assert_eq!(base.completion_tokens, 5);
        assert_eq!(base.cache_read_tokens, 3);
    }

    #[test]
    fn test_empty_usage() {
        assert!(UsageCounters::default().is_empty());
        assert!(!UsageCounters {
            prompt_tokens: 1,
            ..Default::default()
        }
        .is_empty());
    }
}
