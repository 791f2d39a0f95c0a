//! OpenAI chat-completions wire codec
//!
//! Covers the request/response JSON schema and the streamed
//! `chat.completion.chunk` SSE form, including cached-token usage details.

use super::{sse, SseEvent, StreamDecoder, StreamEncoder, StreamItem, WireCodec};
use crate::canonical::{
    CanonicalChunk, CanonicalRequest, CanonicalResponse, ContentPart, FinishReason,
    GenerationParams, Role, Turn, UsageCounters,
};
use crate::error::{GatewayError, Result};
use crate::provider::WireFormat;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// OpenAI chat codec
pub struct OpenAiCodec;

#[derive(Debug, Serialize, Deserialize)]
struct WireRequest {
    model: String,
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<WireContent>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum WirePart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Debug, Serialize, Deserialize)]
struct WireImageUrl {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: Option<WireMessage>,
    delta: Option<WireDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    prompt_tokens_details: Option<WirePromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct WirePromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

fn parse_role(role: &str) -> Result<Role> {
    match role {
        "system" | "developer" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        other => Err(GatewayError::RequestTransform(format!(
            "unsupported message role '{}'",
            other
        ))),
    }
}

fn parse_image_url(image_url: WireImageUrl) -> ContentPart {
    // Data URIs become inline images so they survive translation to
    // providers that take base64 sources
    if let Some(rest) = image_url.url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return ContentPart::ImageInline {
                media_type: media_type.to_string(),
                data: data.to_string(),
            };
        }
    }
    ContentPart::ImageUrl {
        url: image_url.url,
        detail: image_url.detail,
    }
}

fn content_to_parts(content: WireContent) -> Vec<ContentPart> {
    match content {
        WireContent::Text(text) => vec![ContentPart::Text { text }],
        WireContent::Parts(parts) => parts
            .into_iter()
            .map(|part| match part {
                WirePart::Text { text } => ContentPart::Text { text },
                WirePart::ImageUrl { image_url } => parse_image_url(image_url),
            })
            .collect(),
    }
}

fn parts_to_content(parts: &[ContentPart]) -> WireContent {
    // A lone text part round-trips as the plain string form
    if let [ContentPart::Text { text }] = parts {
        return WireContent::Text(text.clone());
    }
    WireContent::Parts(
        parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => WirePart::Text { text: text.clone() },
                ContentPart::ImageUrl { url, detail } => WirePart::ImageUrl {
                    image_url: WireImageUrl {
                        url: url.clone(),
                        detail: detail.clone(),
                    },
                },
                ContentPart::ImageInline { media_type, data } => WirePart::ImageUrl {
                    image_url: WireImageUrl {
                        url: format!("data:{};base64,{}", media_type, data),
                        detail: None,
                    },
                },
            })
            .collect(),
    )
}

fn parse_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        "tool_calls" | "function_call" => FinishReason::ToolUse,
        other => FinishReason::Other(other.to_string()),
    }
}

fn encode_finish_reason(reason: &FinishReason) -> String {
    match reason {
        FinishReason::Stop => "stop".to_string(),
        FinishReason::Length => "length".to_string(),
        FinishReason::ContentFilter => "content_filter".to_string(),
        FinishReason::ToolUse => "tool_calls".to_string(),
        FinishReason::Other(other) => other.clone(),
    }
}

fn parse_usage(usage: &WireUsage) -> UsageCounters {
    UsageCounters {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        cache_read_tokens: usage
            .prompt_tokens_details
            .as_ref()
            .map(|d| d.cached_tokens)
            .unwrap_or(0),
        cache_write_tokens: 0,
    }
}

fn encode_usage(usage: &UsageCounters) -> serde_json::Value {
    json!({
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
        "total_tokens": usage.prompt_tokens + usage.completion_tokens,
        "prompt_tokens_details": { "cached_tokens": usage.cache_read_tokens },
    })
}

impl WireCodec for OpenAiCodec {
    fn format(&self) -> WireFormat {
        WireFormat::OpenAiChat
    }

    fn upstream_path(&self, _request: &CanonicalRequest) -> String {
        "/v1/chat/completions".to_string()
    }

    fn parse_request(&self, body: &[u8]) -> Result<CanonicalRequest> {
        let wire: WireRequest = serde_json::from_slice(body)
            .map_err(|e| GatewayError::RequestTransform(format!("invalid chat request: {}", e)))?;

        if wire.model.is_empty() {
            return Err(GatewayError::RequestTransform(
                "request is missing a model".to_string(),
            ));
        }

        let mut turns = Vec::with_capacity(wire.messages.len());
        for message in wire.messages {
            let role = parse_role(&message.role)?;
            let parts = message.content.map(content_to_parts).unwrap_or_default();
            turns.push(Turn { role, parts });
        }

        Ok(CanonicalRequest {
            model: wire.model,
            turns,
            params: GenerationParams {
                temperature: wire.temperature,
                top_p: wire.top_p,
                max_tokens: wire.max_tokens,
                stop: wire.stop,
                stream: wire.stream,
            },
        })
    }

    fn encode_request(&self, request: &CanonicalRequest) -> Result<Bytes> {
        let messages: Vec<WireMessage> = request
            .turns
            .iter()
            .map(|turn| WireMessage {
                role: turn.role.as_str().to_string(),
                content: Some(parts_to_content(&turn.parts)),
            })
            .collect();

        let wire = WireRequest {
            model: request.model.clone(),
            messages,
            temperature: request.params.temperature,
            top_p: request.params.top_p,
            max_tokens: request.params.max_tokens,
            stop: request.params.stop.clone(),
            stream: request.params.stream,
        };

        let body = serde_json::to_vec(&wire)
            .map_err(|e| GatewayError::Internal(format!("failed to serialize request: {}", e)))?;
        Ok(Bytes::from(body))
    }

    fn parse_response(&self, body: &[u8]) -> Result<CanonicalResponse> {
        let wire: WireResponse = serde_json::from_slice(body).map_err(|e| {
            GatewayError::ResponseTransform(format!("invalid chat response: {}", e))
        })?;

        let choice = wire.choices.into_iter().next().ok_or_else(|| {
            GatewayError::ResponseTransform("response carries no choices".to_string())
        })?;

        let text = choice
            .message
            .and_then(|m| m.content)
            .map(|content| match content {
                WireContent::Text(text) => text,
                WireContent::Parts(parts) => parts
                    .into_iter()
                    .filter_map(|p| match p {
                        WirePart::Text { text } => Some(text),
                        WirePart::ImageUrl { .. } => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            })
            .unwrap_or_default();

        Ok(CanonicalResponse {
            id: wire.id,
            model: wire.model,
            turns: vec![Turn::text(Role::Assistant, text)],
            finish_reason: choice.finish_reason.as_deref().map(parse_finish_reason),
            usage: wire.usage.as_ref().map(parse_usage),
        })
    }

    fn encode_response(&self, response: &CanonicalResponse) -> Result<Bytes> {
        let body = json!({
            "id": response.id.clone().unwrap_or_else(generated_id),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": response.model.clone().unwrap_or_default(),
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": response.joined_text(),
                },
                "finish_reason": response
                    .finish_reason
                    .as_ref()
                    .map(encode_finish_reason)
                    .unwrap_or_else(|| "stop".to_string()),
            }],
            "usage": response.usage.as_ref().map(encode_usage),
        });

        Ok(Bytes::from(body.to_string()))
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(OpenAiStreamDecoder)
    }

    fn stream_encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(OpenAiStreamEncoder::new())
    }
}

fn generated_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

/// Decoder for `chat.completion.chunk` SSE events
struct OpenAiStreamDecoder;

impl StreamDecoder for OpenAiStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<StreamItem>> {
        if event.is_done() {
            return Ok(vec![StreamItem::Done]);
        }

        let wire: WireResponse = serde_json::from_str(&event.data).map_err(|e| {
            GatewayError::ResponseTransform(format!("invalid stream chunk: {}", e))
        })?;

        let mut chunk = CanonicalChunk {
            id: wire.id,
            model: wire.model,
            usage: wire.usage.as_ref().map(parse_usage),
            ..Default::default()
        };

        for choice in &wire.choices {
            if let Some(delta) = &choice.delta {
                if let Some(content) = &delta.content {
                    chunk.text.push_str(content);
                }
            }
            if let Some(reason) = &choice.finish_reason {
                chunk.finish_reason = Some(parse_finish_reason(reason));
            }
        }

        Ok(vec![StreamItem::Delta(chunk)])
    }
}

/// Encoder producing `chat.completion.chunk` SSE events
struct OpenAiStreamEncoder {
    id: Option<String>,
    model: Option<String>,
    created: i64,
    role_sent: bool,
    done_sent: bool,
}

impl OpenAiStreamEncoder {
    fn new() -> Self {
        Self {
            id: None,
            model: None,
            created: chrono::Utc::now().timestamp(),
            role_sent: false,
            done_sent: false,
        }
    }

    fn chunk_json(&self, delta: serde_json::Value, finish_reason: Option<&FinishReason>) -> serde_json::Value {
        json!({
            "id": self.id.clone().unwrap_or_else(generated_id),
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model.clone().unwrap_or_default(),
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason.map(encode_finish_reason),
            }],
        })
    }
}

impl StreamEncoder for OpenAiStreamEncoder {
    fn encode(&mut self, item: &StreamItem) -> Bytes {
        let mut out = String::new();

        match item {
            StreamItem::Delta(chunk) => {
                if self.id.is_none() {
                    self.id = chunk.id.clone();
                }
                if self.model.is_none() {
                    self.model = chunk.model.clone();
                }

                if !self.role_sent {
                    self.role_sent = true;
                    let prelude =
                        self.chunk_json(json!({"role": "assistant", "content": ""}), None);
                    out.push_str(&sse::format_data(&prelude.to_string()));
                }

                if !chunk.text.is_empty() {
                    let body = self.chunk_json(json!({"content": chunk.text}), None);
                    out.push_str(&sse::format_data(&body.to_string()));
                }

                if chunk.finish_reason.is_some() || chunk.usage.is_some() {
                    let mut tail = self.chunk_json(json!({}), chunk.finish_reason.as_ref());
                    if let Some(usage) = &chunk.usage {
                        tail["usage"] = encode_usage(usage);
                    }
                    out.push_str(&sse::format_data(&tail.to_string()));
                }
            }
            StreamItem::Done => {
                if !self.done_sent {
                    self.done_sent = true;
                    out.push_str(sse::format_done());
                }
            }
        }

        Bytes::from(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_round_trip() {
        let body = br#"{
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "Be terse."},
                {"role": "user", "content": [
                    {"type": "text", "text": "Describe this"},
                    {"type": "image_url", "image_url": {"url": "https://x.test/a.png", "detail": "low"}}
                ]}
            ],
            "temperature": 0.2,
            "max_tokens": 128,
            "stream": true
        }"#;

        let canonical = OpenAiCodec.parse_request(body).unwrap();
        assert_eq!(canonical.model, "gpt-4o");
        assert_eq!(canonical.turns.len(), 2);
        assert_eq!(canonical.turns[0].role, Role::System);
        assert_eq!(canonical.image_count(), 1);
        assert!(canonical.params.stream);
        assert_eq!(canonical.params.max_tokens, Some(128));

        let encoded = OpenAiCodec.encode_request(&canonical).unwrap();
        let reparsed = OpenAiCodec.parse_request(&encoded).unwrap();
        assert_eq!(canonical, reparsed);
    }

    #[test]
    fn test_parse_request_rejects_garbage() {
        assert!(matches!(
            OpenAiCodec.parse_request(b"not json"),
            Err(GatewayError::RequestTransform(_))
        ));
        assert!(matches!(
            OpenAiCodec.parse_request(br#"{"model": "", "messages": []}"#),
            Err(GatewayError::RequestTransform(_))
        ));
        assert!(matches!(
            OpenAiCodec.parse_request(
                br#"{"model": "m", "messages": [{"role": "tool", "content": "x"}]}"#
            ),
            Err(GatewayError::RequestTransform(_))
        ));
    }

    #[test]
    fn test_data_uri_becomes_inline_image() {
        let body = br#"{
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,aGk="}}
            ]}]
        }"#;
        let canonical = OpenAiCodec.parse_request(body).unwrap();
        assert_eq!(
            canonical.turns[0].parts[0],
            ContentPart::ImageInline {
                media_type: "image/png".to_string(),
                data: "aGk=".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_response_extracts_usage() {
        let body = br#"{
            "id": "chatcmpl-1",
            "model": "gpt-4o-2024-11-20",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hi."}, "finish_reason": "stop"}],
            "usage": {
                "prompt_tokens": 20,
                "completion_tokens": 4,
                "total_tokens": 24,
                "prompt_tokens_details": {"cached_tokens": 12}
            }
        }"#;

        let canonical = OpenAiCodec.parse_response(body).unwrap();
        assert_eq!(canonical.joined_text(), "Hi.");
        assert_eq!(canonical.finish_reason, Some(FinishReason::Stop));
        let usage = canonical.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 20);
        assert_eq!(usage.completion_tokens, 4);
        assert_eq!(usage.cache_read_tokens, 12);
    }

    #[test]
    fn test_parse_response_soft_fails_on_garbage() {
        assert!(matches!(
            OpenAiCodec.parse_response(b"<html>bad gateway</html>"),
            Err(GatewayError::ResponseTransform(_))
        ));
    }

    #[test]
    fn test_stream_decode_and_reencode() {
        let mut decoder = OpenAiCodec.stream_decoder();
        let mut encoder = OpenAiCodec.stream_encoder();

        let events = [
            r#"{"id":"c1","object":"chat.completion.chunk","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"},"finish_reason":null}]}"#,
            r#"{"id":"c1","object":"chat.completion.chunk","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":null}]}"#,
            r#"{"id":"c1","object":"chat.completion.chunk","model":"gpt-4o","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        ];

        let mut text = String::new();
        let mut out = Vec::new();
        for data in events {
            let event = SseEvent {
                event_type: None,
                data: data.to_string(),
                raw: String::new(),
            };
            for item in decoder.decode(&event).unwrap() {
                if let StreamItem::Delta(chunk) = &item {
                    text.push_str(&chunk.text);
                }
                out.push(encoder.encode(&item));
            }
        }
        out.push(encoder.encode(&StreamItem::Done));

        assert_eq!(text, "Hello");
        let wire: String = out
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect();
        assert!(wire.contains("\"content\":\"Hel\""));
        assert!(wire.contains("\"finish_reason\":\"stop\""));
        assert!(wire.ends_with("data: [DONE]\n\n"));
    }

    #[test]
    fn test_stream_decoder_rejects_bad_chunk() {
        let mut decoder = OpenAiCodec.stream_decoder();
        let event = SseEvent {
            event_type: None,
            data: "{broken".to_string(),
            raw: String::new(),
        };
        assert!(matches!(
            decoder.decode(&event),
            Err(GatewayError::ResponseTransform(_))
        ));
    }
}
