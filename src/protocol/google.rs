//! Google generateContent wire codec
//!
//! Covers the Gemini request/response JSON and its streamed form. The model
//! identifier travels in the URL path rather than the body, so callers fill
//! it in from the path; `model_from_path` does the extraction.

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

/// Google generateContent codec
pub struct GoogleCodec;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    #[serde(default)]
    contents: Vec<WireContent>,
    system_instruction: Option<WireSystemInstruction>,
    generation_config: Option<WireGenerationConfig>,
}

#[derive(Debug, Deserialize)]
struct WireSystemInstruction {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    text: Option<String>,
    inline_data: Option<WireInlineData>,
    file_data: Option<WireFileData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFileData {
    #[serde(default)]
    mime_type: Option<String>,
    file_uri: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    temperature: Option<f64>,
    top_p: Option<f64>,
    max_output_tokens: Option<u32>,
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    usage_metadata: Option<WireUsageMetadata>,
    model_version: Option<String>,
    response_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    content: Option<WireContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    cached_content_token_count: u64,
}

fn parse_usage(usage: &WireUsageMetadata) -> UsageCounters {
    UsageCounters {
        prompt_tokens: usage.prompt_token_count,
        completion_tokens: usage.candidates_token_count,
        cache_read_tokens: usage.cached_content_token_count,
        cache_write_tokens: 0,
    }
}

fn parse_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => {
            FinishReason::ContentFilter
        }
        other => FinishReason::Other(other.to_string()),
    }
}

fn encode_finish_reason(reason: &FinishReason) -> String {
    match reason {
        FinishReason::Stop => "STOP".to_string(),
        FinishReason::Length => "MAX_TOKENS".to_string(),
        FinishReason::ContentFilter => "SAFETY".to_string(),
        FinishReason::ToolUse => "STOP".to_string(),
        FinishReason::Other(other) => other.clone(),
    }
}

fn wire_parts_to_canonical(parts: Vec<WirePart>) -> Vec<ContentPart> {
    parts
        .into_iter()
        .filter_map(|part| {
            if let Some(text) = part.text {
                Some(ContentPart::Text { text })
            } else if let Some(inline) = part.inline_data {
                Some(ContentPart::ImageInline {
                    media_type: inline.mime_type,
                    data: inline.data,
                })
            } else {
                part.file_data.map(|file| ContentPart::ImageUrl {
                    url: file.file_uri,
                    detail: None,
                })
            }
        })
        .collect()
}

fn canonical_parts_to_wire(parts: &[ContentPart]) -> Vec<serde_json::Value> {
    parts
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => json!({"text": text}),
            ContentPart::ImageInline { media_type, data } => json!({
                "inlineData": {"mimeType": media_type, "data": data},
            }),
            ContentPart::ImageUrl { url, .. } => json!({
                "fileData": {"fileUri": url},
            }),
        })
        .collect()
}

fn candidate_text(candidate: &WireCandidate) -> String {
    candidate
        .content
        .as_ref()
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

/// Extract the model identifier from a generateContent path, e.g.
/// `/v1beta/models/gemini-1.5-pro:generateContent`
pub fn model_from_path(path: &str) -> Option<String> {
    let start = path.find("/models/")? + "/models/".len();
    let rest = &path[start..];
    let end = rest.find(':').unwrap_or(rest.len());
    let model = &rest[..end];
    (!model.is_empty()).then(|| model.to_string())
}

/// Whether the path names the streaming variant of the call
pub fn is_stream_path(path: &str) -> bool {
    path.contains(":streamGenerateContent")
}

impl WireCodec for GoogleCodec {
    fn format(&self) -> WireFormat {
        WireFormat::GoogleGenerateContent
    }

    fn upstream_path(&self, request: &CanonicalRequest) -> String {
        if request.params.stream {
            format!(
                "/v1beta/models/{}:streamGenerateContent?alt=sse",
                request.model
            )
        } else {
            format!("/v1beta/models/{}:generateContent", request.model)
        }
    }

    fn parse_request(&self, body: &[u8]) -> Result<CanonicalRequest> {
        let wire: WireRequest = serde_json::from_slice(body).map_err(|e| {
            GatewayError::RequestTransform(format!("invalid generateContent request: {}", e))
        })?;

        let mut turns = Vec::with_capacity(wire.contents.len() + 1);
        if let Some(system) = wire.system_instruction {
            turns.push(Turn {
                role: Role::System,
                parts: wire_parts_to_canonical(system.parts),
            });
        }

        for content in wire.contents {
            let role = match content.role.as_deref() {
                Some("user") | None => Role::User,
                Some("model") => Role::Assistant,
                Some(other) => {
                    return Err(GatewayError::RequestTransform(format!(
                        "unsupported content role '{}'",
                        other
                    )))
                }
            };
            turns.push(Turn {
                role,
                parts: wire_parts_to_canonical(content.parts),
            });
        }

        let config = wire.generation_config;
        Ok(CanonicalRequest {
            // The model rides in the URL path; the caller fills it in
            model: String::new(),
            turns,
            params: GenerationParams {
                temperature: config.as_ref().and_then(|c| c.temperature),
                top_p: config.as_ref().and_then(|c| c.top_p),
                max_tokens: config.as_ref().and_then(|c| c.max_output_tokens),
                stop: config.and_then(|c| c.stop_sequences),
                stream: false,
            },
        })
    }

    fn encode_request(&self, request: &CanonicalRequest) -> Result<Bytes> {
        let system: Vec<serde_json::Value> = request
            .turns
            .iter()
            .filter(|t| t.role == Role::System)
            .flat_map(|t| canonical_parts_to_wire(&t.parts))
            .collect();

        let contents: Vec<serde_json::Value> = request
            .turns
            .iter()
            .filter(|t| t.role != Role::System)
            .map(|turn| {
                let role = match turn.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                json!({"role": role, "parts": canonical_parts_to_wire(&turn.parts)})
            })
            .collect();

        let mut config = serde_json::Map::new();
        if let Some(temperature) = request.params.temperature {
            config.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = request.params.top_p {
            config.insert("topP".to_string(), json!(top_p));
        }
        if let Some(max_tokens) = request.params.max_tokens {
            config.insert("maxOutputTokens".to_string(), json!(max_tokens));
        }
        if let Some(stop) = &request.params.stop {
            config.insert("stopSequences".to_string(), json!(stop));
        }

        let mut wire = json!({"contents": contents});
        if !system.is_empty() {
            wire["systemInstruction"] = json!({"parts": system});
        }
        if !config.is_empty() {
            wire["generationConfig"] = serde_json::Value::Object(config);
        }

        Ok(Bytes::from(wire.to_string()))
    }

    fn parse_response(&self, body: &[u8]) -> Result<CanonicalResponse> {
        let wire: WireResponse = serde_json::from_slice(body).map_err(|e| {
            GatewayError::ResponseTransform(format!("invalid generateContent response: {}", e))
        })?;

        let candidate = wire.candidates.first().ok_or_else(|| {
            GatewayError::ResponseTransform("response carries no candidates".to_string())
        })?;

        Ok(CanonicalResponse {
            id: wire.response_id.clone(),
            model: wire.model_version.clone(),
            turns: vec![Turn::text(Role::Assistant, candidate_text(candidate))],
            finish_reason: candidate.finish_reason.as_deref().map(parse_finish_reason),
            usage: wire.usage_metadata.as_ref().map(parse_usage),
        })
    }

    fn encode_response(&self, response: &CanonicalResponse) -> Result<Bytes> {
        let mut wire = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{"text": response.joined_text()}],
                },
                "finishReason": response
                    .finish_reason
                    .as_ref()
                    .map(encode_finish_reason)
                    .unwrap_or_else(|| "STOP".to_string()),
                "index": 0,
            }],
        });

        if let Some(usage) = &response.usage {
            wire["usageMetadata"] = json!({
                "promptTokenCount": usage.prompt_tokens,
                "candidatesTokenCount": usage.completion_tokens,
                "totalTokenCount": usage.prompt_tokens + usage.completion_tokens,
                "cachedContentTokenCount": usage.cache_read_tokens,
            });
        }
        if let Some(model) = &response.model {
            wire["modelVersion"] = json!(model);
        }

        Ok(Bytes::from(wire.to_string()))
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(GoogleStreamDecoder)
    }

    fn stream_encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(GoogleStreamEncoder)
    }
}

/// Decoder for streamed generateContent responses.
///
/// Each SSE event is a full GenerateContentResponse; usage metadata is
/// cumulative, so later values replace earlier ones.
struct GoogleStreamDecoder;

impl StreamDecoder for GoogleStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<StreamItem>> {
        if event.is_done() {
            return Ok(vec![StreamItem::Done]);
        }

        let wire: WireResponse = serde_json::from_str(&event.data).map_err(|e| {
            GatewayError::ResponseTransform(format!("invalid stream chunk: {}", e))
        })?;

        let mut chunk = CanonicalChunk {
            id: wire.response_id.clone(),
            model: wire.model_version.clone(),
            usage: wire.usage_metadata.as_ref().map(parse_usage),
            ..Default::default()
        };

        if let Some(candidate) = wire.candidates.first() {
            chunk.text = candidate_text(candidate);
            chunk.finish_reason = candidate.finish_reason.as_deref().map(parse_finish_reason);
        }

        Ok(vec![StreamItem::Delta(chunk)])
    }
}

/// Encoder producing streamed generateContent responses
struct GoogleStreamEncoder;

impl StreamEncoder for GoogleStreamEncoder {
    fn encode(&mut self, item: &StreamItem) -> Bytes {
        match item {
            StreamItem::Delta(chunk) => {
                if chunk.text.is_empty() && chunk.finish_reason.is_none() && chunk.usage.is_none()
                {
                    return Bytes::new();
                }

                let mut wire = json!({
                    "candidates": [{
                        "content": {"role": "model", "parts": [{"text": chunk.text}]},
                        "index": 0,
                    }],
                });
                if let Some(finish) = &chunk.finish_reason {
                    wire["candidates"][0]["finishReason"] = json!(encode_finish_reason(finish));
                }
                if let Some(usage) = &chunk.usage {
                    wire["usageMetadata"] = json!({
                        "promptTokenCount": usage.prompt_tokens,
                        "candidatesTokenCount": usage.completion_tokens,
                        "totalTokenCount": usage.prompt_tokens + usage.completion_tokens,
                    });
                }
                if let Some(model) = &chunk.model {
                    wire["modelVersion"] = json!(model);
                }

                Bytes::from(sse::format_data(&wire.to_string()))
            }
            // The Google stream has no terminator event
            StreamItem::Done => Bytes::new(),
        }
    }
}
