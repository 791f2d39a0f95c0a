//! Anthropic Messages wire codec
//!
//! Covers the Messages request/response JSON and the typed event stream
//! (`message_start` .. `message_stop`). Cache counters map onto the
//! canonical cache-read/cache-write fields.

use super::{sse, SseEvent, StreamDecoder, StreamEncoder, StreamItem, WireCodec};
use crate::canonical::{
    CanonicalChunk, CanonicalRequest, CanonicalResponse, ContentPart, FinishReason,
    GenerationParams, Role, Turn, UsageCounters,
};
use crate::error::{GatewayError, Result};
use crate::provider::WireFormat;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;

const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic Messages codec
pub struct AnthropicCodec;

#[derive(Debug, Deserialize)]
struct WireRequest {
    model: String,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(default)]
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    top_p: Option<f64>,
    stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    role: String,
    content: WireContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Blocks(Vec<WireBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: WireImageSource },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireImageSource {
    #[serde(rename = "base64")]
    Base64 { media_type: String, data: String },
    #[serde(rename = "url")]
    Url { url: String },
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    content: Vec<WireBlock>,
    stop_reason: Option<String>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

fn parse_usage(usage: &WireUsage) -> UsageCounters {
    UsageCounters {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        cache_read_tokens: usage.cache_read_input_tokens,
        cache_write_tokens: usage.cache_creation_input_tokens,
    }
}

fn parse_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "refusal" => FinishReason::ContentFilter,
        "tool_use" => FinishReason::ToolUse,
        other => FinishReason::Other(other.to_string()),
    }
}

fn encode_stop_reason(reason: &FinishReason) -> String {
    match reason {
        FinishReason::Stop => "end_turn".to_string(),
        FinishReason::Length => "max_tokens".to_string(),
        FinishReason::ContentFilter => "refusal".to_string(),
        FinishReason::ToolUse => "tool_use".to_string(),
        FinishReason::Other(other) => other.clone(),
    }
}

fn blocks_to_parts(content: WireContent) -> Vec<ContentPart> {
    match content {
        WireContent::Text(text) => vec![ContentPart::Text { text }],
        WireContent::Blocks(blocks) => blocks
            .into_iter()
            .map(|block| match block {
                WireBlock::Text { text } => ContentPart::Text { text },
                WireBlock::Image { source } => match source {
                    WireImageSource::Base64 { media_type, data } => {
                        ContentPart::ImageInline { media_type, data }
                    }
                    WireImageSource::Url { url } => ContentPart::ImageUrl { url, detail: None },
                },
            })
            .collect(),
    }
}

fn parts_to_blocks(parts: &[ContentPart]) -> serde_json::Value {
    let blocks: Vec<serde_json::Value> = parts
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => json!({"type": "text", "text": text}),
            ContentPart::ImageUrl { url, .. } => json!({
                "type": "image",
                "source": {"type": "url", "url": url},
            }),
            ContentPart::ImageInline { media_type, data } => json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data},
            }),
        })
        .collect();
    serde_json::Value::Array(blocks)
}

impl WireCodec for AnthropicCodec {
    fn format(&self) -> WireFormat {
        WireFormat::AnthropicMessages
    }

    fn upstream_path(&self, _request: &CanonicalRequest) -> String {
        "/v1/messages".to_string()
    }

    fn parse_request(&self, body: &[u8]) -> Result<CanonicalRequest> {
        let wire: WireRequest = serde_json::from_slice(body).map_err(|e| {
            GatewayError::RequestTransform(format!("invalid messages request: {}", e))
        })?;

        if wire.model.is_empty() {
            return Err(GatewayError::RequestTransform(
                "request is missing a model".to_string(),
            ));
        }

        let mut turns = Vec::with_capacity(wire.messages.len() + 1);
        if let Some(system) = wire.system {
            turns.push(Turn::text(Role::System, system));
        }
        for message in wire.messages {
            let role = match message.role.as_str() {
                "user" => Role::User,
                "assistant" => Role::Assistant,
                other => {
                    return Err(GatewayError::RequestTransform(format!(
                        "unsupported message role '{}'",
                        other
                    )))
                }
            };
            turns.push(Turn {
                role,
                parts: blocks_to_parts(message.content),
            });
        }

        Ok(CanonicalRequest {
            model: wire.model,
            turns,
            params: GenerationParams {
                temperature: wire.temperature,
                top_p: wire.top_p,
                max_tokens: wire.max_tokens,
                stop: wire.stop_sequences,
                stream: wire.stream,
            },
        })
    }

    fn encode_request(&self, request: &CanonicalRequest) -> Result<Bytes> {
        // System turns move into the dedicated top-level field
        let system: Vec<String> = request
            .turns
            .iter()
            .filter(|t| t.role == Role::System)
            .map(Turn::joined_text)
            .filter(|t| !t.is_empty())
            .collect();

        let messages: Vec<serde_json::Value> = request
            .turns
            .iter()
            .filter(|t| t.role != Role::System)
            .map(|turn| {
                json!({
                    "role": turn.role.as_str(),
                    "content": parts_to_blocks(&turn.parts),
                })
            })
            .collect();

        let mut wire = json!({
            "model": request.model,
            "max_tokens": request.params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
        });

        if !system.is_empty() {
            wire["system"] = json!(system.join("\n"));
        }
        if let Some(temperature) = request.params.temperature {
            wire["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.params.top_p {
            wire["top_p"] = json!(top_p);
        }
        if let Some(stop) = &request.params.stop {
            wire["stop_sequences"] = json!(stop);
        }
        if request.params.stream {
            wire["stream"] = json!(true);
        }

        Ok(Bytes::from(wire.to_string()))
    }

    fn parse_response(&self, body: &[u8]) -> Result<CanonicalResponse> {
        let wire: WireResponse = serde_json::from_slice(body).map_err(|e| {
            GatewayError::ResponseTransform(format!("invalid messages response: {}", e))
        })?;

        let text = wire
            .content
            .into_iter()
            .filter_map(|block| match block {
                WireBlock::Text { text } => Some(text),
                WireBlock::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(CanonicalResponse {
            id: wire.id,
            model: wire.model,
            turns: vec![Turn::text(Role::Assistant, text)],
            finish_reason: wire.stop_reason.as_deref().map(parse_stop_reason),
            usage: wire.usage.as_ref().map(parse_usage),
        })
    }

    fn encode_response(&self, response: &CanonicalResponse) -> Result<Bytes> {
        let usage = response.usage.unwrap_or_default();
        let wire = json!({
            "id": response
                .id
                .clone()
                .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
            "type": "message",
            "role": "assistant",
            "model": response.model.clone().unwrap_or_default(),
            "content": [{"type": "text", "text": response.joined_text()}],
            "stop_reason": response
                .finish_reason
                .as_ref()
                .map(encode_stop_reason)
                .unwrap_or_else(|| "end_turn".to_string()),
            "stop_sequence": null,
            "usage": {
                "input_tokens": usage.prompt_tokens,
                "output_tokens": usage.completion_tokens,
                "cache_read_input_tokens": usage.cache_read_tokens,
                "cache_creation_input_tokens": usage.cache_write_tokens,
            },
        });
        Ok(Bytes::from(wire.to_string()))
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(AnthropicStreamDecoder)
    }

    fn stream_encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(AnthropicStreamEncoder::new())
    }
}

/// Decoder for the typed Anthropic event stream
struct AnthropicStreamDecoder;

impl StreamDecoder for AnthropicStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<StreamItem>> {
        if event.is_done() {
            return Ok(vec![StreamItem::Done]);
        }

        let value: serde_json::Value = serde_json::from_str(&event.data).map_err(|e| {
            GatewayError::ResponseTransform(format!("invalid stream event: {}", e))
        })?;

        let event_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| GatewayError::ResponseTransform("event has no type".to_string()))?;

        match event_type {
            "message_start" => {
                let message = value.get("message").cloned().unwrap_or_default();
                let usage: WireUsage = message
                    .get("usage")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| {
                        GatewayError::ResponseTransform(format!("invalid usage: {}", e))
                    })?
                    .unwrap_or_default();

                Ok(vec![StreamItem::Delta(CanonicalChunk {
                    id: message.get("id").and_then(|v| v.as_str()).map(String::from),
                    model: message
                        .get("model")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    usage: Some(parse_usage(&usage)),
                    ..Default::default()
                })])
            }
            "content_block_delta" => {
                let text = value
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(|t| t.as_str())
                    .unwrap_or("");
                Ok(vec![StreamItem::Delta(CanonicalChunk {
                    text: text.to_string(),
                    ..Default::default()
                })])
            }
            "message_delta" => {
                let finish = value
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|r| r.as_str())
                    .map(parse_stop_reason);
                let output_tokens = value
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(|t| t.as_u64())
                    .unwrap_or(0);

                Ok(vec![StreamItem::Delta(CanonicalChunk {
                    finish_reason: finish,
                    usage: (output_tokens > 0).then_some(UsageCounters {
                        completion_tokens: output_tokens,
                        ..Default::default()
                    }),
                    ..Default::default()
                })])
            }
            "message_stop" => Ok(vec![StreamItem::Done]),
            // ping, content_block_start, content_block_stop carry nothing we meter
            _ => Ok(vec![]),
        }
    }
}

/// Encoder producing the typed Anthropic event stream
struct AnthropicStreamEncoder {
    id: Option<String>,
    model: Option<String>,
    started: bool,
    block_open: bool,
    stopped: bool,
    output_tokens: u64,
}

impl AnthropicStreamEncoder {
    fn new() -> Self {
        Self {
            id: None,
            model: None,
            started: false,
            block_open: false,
            stopped: false,
            output_tokens: 0,
        }
    }

    fn start_events(&mut self, chunk: &CanonicalChunk) -> String {
        self.started = true;
        self.block_open = true;

        let usage = chunk.usage.unwrap_or_default();
        let start = json!({
            "type": "message_start",
            "message": {
                "id": self
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
                "type": "message",
                "role": "assistant",
                "model": self.model.clone().unwrap_or_default(),
                "content": [],
                "stop_reason": null,
                "usage": {
                    "input_tokens": usage.prompt_tokens,
                    "output_tokens": 0,
                    "cache_read_input_tokens": usage.cache_read_tokens,
                    "cache_creation_input_tokens": usage.cache_write_tokens,
                },
            },
        });
        let block_start = json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": {"type": "text", "text": ""},
        });

        sse::format_event("message_start", &start.to_string())
            + &sse::format_event("content_block_start", &block_start.to_string())
    }

    fn stop_events(&mut self, finish: Option<&FinishReason>) -> String {
        self.stopped = true;
        let mut out = String::new();

        if self.block_open {
            self.block_open = false;
            let block_stop = json!({"type": "content_block_stop", "index": 0});
            out.push_str(&sse::format_event(
                "content_block_stop",
                &block_stop.to_string(),
            ));
        }

        let delta = json!({
            "type": "message_delta",
            "delta": {
                "stop_reason": encode_stop_reason(finish.unwrap_or(&FinishReason::Stop)),
                "stop_sequence": null,
            },
            "usage": {"output_tokens": self.output_tokens},
        });
        out.push_str(&sse::format_event("message_delta", &delta.to_string()));

        let stop = json!({"type": "message_stop"});
        out.push_str(&sse::format_event("message_stop", &stop.to_string()));
        out
    }
}

impl StreamEncoder for AnthropicStreamEncoder {
    fn encode(&mut self, item: &StreamItem) -> Bytes {
        if self.stopped {
            return Bytes::new();
        }

        let mut out = String::new();
        match item {
            StreamItem::Delta(chunk) => {
                if self.id.is_none() {
                    self.id = chunk.id.clone();
                }
                if self.model.is_none() {
                    self.model = chunk.model.clone();
                }
                if let Some(usage) = &chunk.usage {
                    if usage.completion_tokens > 0 {
                        self.output_tokens = usage.completion_tokens;
                    }
                }

                if !self.started {
                    out.push_str(&self.start_events(chunk));
                }

                if !chunk.text.is_empty() {
                    let delta = json!({
                        "type": "content_block_delta",
                        "index": 0,
                        "delta": {"type": "text_delta", "text": chunk.text},
                    });
                    out.push_str(&sse::format_event(
                        "content_block_delta",
                        &delta.to_string(),
                    ));
                }

                if chunk.finish_reason.is_some() {
                    let finish = chunk.finish_reason.clone();
                    out.push_str(&self.stop_events(finish.as_ref()));
                }
            }
            StreamItem::Done => {
                if self.started {
                    out.push_str(&self.stop_events(None));
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
    fn test_parse_request_lifts_system_field() {
        let body = br#"{
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 256,
            "system": "Answer in French.",
            "messages": [{"role": "user", "content": "Hello"}]
        }"#;

        let canonical = AnthropicCodec.parse_request(body).unwrap();
        assert_eq!(canonical.turns.len(), 2);
        assert_eq!(canonical.turns[0].role, Role::System);
        assert_eq!(canonical.turns[0].joined_text(), "Answer in French.");
        assert_eq!(canonical.turns[1].role, Role::User);
    }

    #[test]
    fn test_encode_request_restores_system_field() {
        let canonical = CanonicalRequest {
            model: "claude-3-5-sonnet-20241022".to_string(),
            turns: vec![
                Turn::text(Role::System, "Be brief."),
                Turn::text(Role::User, "Hi"),
            ],
            params: GenerationParams {
                max_tokens: Some(100),
                stream: true,
                ..Default::default()
            },
        };

        let body = AnthropicCodec.encode_request(&canonical).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["system"], "Be brief.");
        assert_eq!(value["max_tokens"], 100);
        assert_eq!(value["stream"], true);
        assert_eq!(value["messages"].as_array().unwrap().len(), 1);
        assert_eq!(value["messages"][0]["role"], "user");
    }

    #[test]
    fn test_encode_request_defaults_max_tokens() {
        let canonical = CanonicalRequest {
            model: "claude-3-haiku-20240307".to_string(),
            turns: vec![Turn::text(Role::User, "Hi")],
            params: GenerationParams::default(),
        };
        let body = AnthropicCodec.encode_request(&canonical).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_parse_response_maps_cache_counters() {
        let body = br#"{
            "id": "msg_01",
            "type": "message",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "Bonjour."}],
            "stop_reason": "end_turn",
            "usage": {
                "input_tokens": 30,
                "output_tokens": 6,
                "cache_read_input_tokens": 10,
                "cache_creation_input_tokens": 20
            }
        }"#;

        let canonical = AnthropicCodec.parse_response(body).unwrap();
        assert_eq!(canonical.joined_text(), "Bonjour.");
        assert_eq!(canonical.finish_reason, Some(FinishReason::Stop));
        let usage = canonical.usage.unwrap();
        assert_eq!(usage.cache_read_tokens, 10);
        assert_eq!(usage.cache_write_tokens, 20);
    }

    #[test]
    fn test_stream_decoder_walks_event_sequence() {
        let mut decoder = AnthropicCodec.stream_decoder();
        let events = [
            (
                "message_start",
                r#"{"type":"message_start","message":{"id":"msg_01","model":"claude-3-5-sonnet-20241022","usage":{"input_tokens":25,"output_tokens":1}}}"#,
            ),
            (
                "content_block_start",
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
            ),
            (
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
            ),
            (
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":12}}"#,
            ),
            ("message_stop", r#"{"type":"message_stop"}"#),
        ];

        let mut text = String::new();
        let mut usage = UsageCounters::default();
        let mut done = false;
        for (event_type, data) in events {
            let event = SseEvent {
                event_type: Some(event_type.to_string()),
                data: data.to_string(),
                raw: String::new(),
            };
            for item in decoder.decode(&event).unwrap() {
                match item {
                    StreamItem::Delta(chunk) => {
                        text.push_str(&chunk.text);
                        if let Some(u) = chunk.usage {
                            usage.merge(&u);
                        }
                    }
                    StreamItem::Done => done = true,
                }
            }
        }

        assert_eq!(text, "Hello");
        assert_eq!(usage.prompt_tokens, 25);
        assert_eq!(usage.completion_tokens, 12);
        assert!(done);
    }

    #[test]
    fn test_stream_encoder_emits_event_envelope() {
        let mut encoder = AnthropicCodec.stream_encoder();

        let first = encoder.encode(&StreamItem::Delta(CanonicalChunk {
            id: Some("msg_01".to_string()),
            model: Some("claude-3-5-sonnet-20241022".to_string()),
            text: "Hi".to_string(),
            usage: Some(UsageCounters {
                prompt_tokens: 9,
                ..Default::default()
            }),
            ..Default::default()
        }));
        let first = String::from_utf8_lossy(&first);
        assert!(first.contains("event: message_start"));
        assert!(first.contains("event: content_block_start"));
        assert!(first.contains("text_delta"));

        let tail = encoder.encode(&StreamItem::Done);
        let tail = String::from_utf8_lossy(&tail);
        assert!(tail.contains("event: content_block_stop"));
        assert!(tail.contains("event: message_delta"));
        assert!(tail.contains("event: message_stop"));

        // Nothing after the stream has stopped
        assert!(encoder.encode(&StreamItem::Done).is_empty());
    }
}
