//! Integration tests for the Tollgate gateway
//!
//! Exercises the pieces a proxied request flows through: provider
//! resolution, protocol translation in both directions, pricing and the
//! usage pipeline, without a live upstream.

use bytes::Bytes;
use http::header::HeaderMap;
use std::io::Write;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tollgate::canonical::{FinishReason, Role};
use tollgate::config::{load_config, load_pricing};
use tollgate::pricing::{CostEngine, Usage};
use tollgate::protocol::{codec_for, pump_stream, google, SseEvent, StreamItem, WireCodec};
use tollgate::provider::{resolve, ProviderRegistry, WireFormat, TARGET_PROVIDER_HEADER};
use std::sync::Arc;

fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.insert(
            name.parse::<http::header::HeaderName>().unwrap(),
            value.parse().unwrap(),
        );
    }
    map
}

// ============================================================================
// Provider resolution
// ============================================================================

#[test]
fn resolves_every_builtin_provider_by_host() {
    let registry = ProviderRegistry::builtin().unwrap();
    let cases = [
        ("api.openai.com", "openai"),
        ("myresource.openai.azure.com", "azure"),
        ("us-central1-aiplatform.googleapis.com", "google-vertex-ai"),
        ("generativelanguage.googleapis.com", "google-vertex-ai"),
        ("api.anthropic.com", "anthropic"),
        ("api.fireworks.ai", "fireworks"),
        ("api.together.xyz", "together"),
        ("openrouter.ai", "openrouter"),
        ("qstash.upstash.io", "qstash"),
    ];

    for (host, expected) in cases {
        let path = if expected == "google-vertex-ai" {
            "/v1beta/models/gemini-1.5-pro:generateContent"
        } else if expected == "anthropic" {
            "/v1/messages"
        } else {
            "/v1/chat/completions"
        };
        let resolution = resolve(&registry, Some(host), path, &HeaderMap::new()).unwrap();
        assert_eq!(resolution.provider.name, expected, "host {}", host);
    }
}

#[test]
fn override_header_reaches_any_provider_from_one_entry_path() {
    let registry = ProviderRegistry::builtin().unwrap();
    for name in [
        "openai",
        "azure",
        "google-vertex-ai",
        "anthropic",
        "fireworks",
        "together",
        "openrouter",
        "qstash",
    ] {
        let hdrs = headers(&[(TARGET_PROVIDER_HEADER, name)]);
        let resolution =
            resolve(&registry, Some("gateway.internal"), "/v1/chat/completions", &hdrs).unwrap();
        assert_eq!(resolution.provider.name, name);
    }
}

// ============================================================================
// Round-trip translation (OpenAI client against a Google backend)
// ============================================================================

#[test]
fn openai_request_translates_to_google_and_back() {
    let openai = codec_for(WireFormat::OpenAiChat);
    let google_codec = codec_for(WireFormat::GoogleGenerateContent);

    // Client speaks OpenAI
    let client_request = br#"{
        "model": "gemini-1.5-pro",
        "messages": [
            {"role": "system", "content": "Answer briefly."},
            {"role": "user", "content": "What is the capital of France?"}
        ],
        "temperature": 0.3,
        "max_tokens": 50
    }"#;

    let canonical = openai.parse_request(client_request).unwrap();
    assert_eq!(canonical.turns[0].role, Role::System);

    // Request direction: canonical -> Google
    let google_request = google_codec.encode_request(&canonical).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&google_request).unwrap();
    assert_eq!(
        value["systemInstruction"]["parts"][0]["text"],
        "Answer briefly."
    );
    assert_eq!(value["contents"][0]["role"], "user");
    assert_eq!(value["generationConfig"]["maxOutputTokens"], 50);

    // Upstream answers in Google's schema
    let upstream_response = br#"{
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": "Paris."}]},
            "finishReason": "STOP"
        }],
        "usageMetadata": {
            "promptTokenCount": 21,
            "candidatesTokenCount": 3,
            "totalTokenCount": 24
        },
        "modelVersion": "gemini-1.5-pro-002"
    }"#;

    // Response direction: Google -> canonical -> OpenAI
    let canonical_response = google_codec.parse_response(upstream_response).unwrap();
    let client_response = openai.encode_response(&canonical_response).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&client_response).unwrap();

    // Role, text content and token usage survive the round trip
    assert_eq!(value["choices"][0]["message"]["role"], "assistant");
    assert_eq!(value["choices"][0]["message"]["content"], "Paris.");
    assert_eq!(value["choices"][0]["finish_reason"], "stop");
    assert_eq!(value["usage"]["prompt_tokens"], 21);
    assert_eq!(value["usage"]["completion_tokens"], 3);
    assert_eq!(value["usage"]["total_tokens"], 24);
}

#[test]
fn anthropic_client_reaches_openai_backend() {
    let anthropic = codec_for(WireFormat::AnthropicMessages);
    let openai = codec_for(WireFormat::OpenAiChat);

    let client_request = br#"{
        "model": "gpt-4o",
        "max_tokens": 128,
        "system": "Be terse.",
        "messages": [{"role": "user", "content": "hello"}]
    }"#;

    let canonical = anthropic.parse_request(client_request).unwrap();
    let upstream = openai.encode_request(&canonical).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&upstream).unwrap();

    assert_eq!(value["model"], "gpt-4o");
    assert_eq!(value["messages"][0]["role"], "system");
    assert_eq!(value["messages"][0]["content"], "Be terse.");
    assert_eq!(value["messages"][1]["role"], "user");
    assert_eq!(value["max_tokens"], 128);
}

// ============================================================================
// Streaming equivalence
// ============================================================================

/// Transforming N streamed chunks yields the same client-visible text as
/// transforming the single concatenated response
#[tokio::test]
async fn streamed_chunks_equal_concatenated_transform() {
    let anthropic_events = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-3-5-sonnet-20241022\",\"usage\":{\"input_tokens\":12,\"output_tokens\":1}}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"The capital \"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"is Paris.\"}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":7}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    async fn text_through_pipeline(chunks: Vec<Bytes>) -> (String, String) {
        let upstream =
            futures::stream::iter(chunks.into_iter().map(Ok::<_, std::convert::Infallible>));
        let decoder = codec_for(WireFormat::AnthropicMessages).stream_decoder();
        let encoder = Some(codec_for(WireFormat::OpenAiChat).stream_encoder());
        let (tx, mut rx) = mpsc::channel(64);

        let pump = tokio::spawn(async move { pump_stream(upstream, decoder, encoder, tx).await });
        let mut wire = String::new();
        while let Some(bytes) = rx.recv().await {
            wire.push_str(&String::from_utf8_lossy(&bytes));
        }
        let outcome = pump.await.unwrap();
        (outcome.text, wire)
    }

    // Whole payload in one chunk
    let (text_whole, _) = text_through_pipeline(vec![Bytes::from_static(
        anthropic_events.as_bytes(),
    )])
    .await;

    // Same payload split at awkward 13-byte boundaries
    let resplit: Vec<Bytes> = anthropic_events
        .as_bytes()
        .chunks(13)
        .map(Bytes::copy_from_slice)
        .collect();
    let (text_split, wire) = text_through_pipeline(resplit).await;

    assert_eq!(text_whole, "The capital is Paris.");
    assert_eq!(text_whole, text_split);
    // The OpenAI-format client stream terminates properly
    assert!(wire.ends_with("data: [DONE]\n\n"));
}

/// The decoded text of a stream equals the text of the equivalent unary
/// response for the same content
#[test]
fn stream_decode_matches_unary_text() {
    let mut decoder = codec_for(WireFormat::GoogleGenerateContent).stream_decoder();
    let chunks = [
        r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}]}"#,
        r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"lo."}]},"finishReason":"STOP"}]}"#,
    ];

    let mut streamed_text = String::new();
    for data in chunks {
        let event = SseEvent {
            event_type: None,
            data: data.to_string(),
            raw: String::new(),
        };
        for item in decoder.decode(&event).unwrap() {
            if let StreamItem::Delta(chunk) = item {
                streamed_text.push_str(&chunk.text);
            }
        }
    }

    let unary = codec_for(WireFormat::GoogleGenerateContent)
        .parse_response(
            br#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hello."}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();

    assert_eq!(streamed_text, unary.joined_text());
    assert_eq!(unary.finish_reason, Some(FinishReason::Stop));
}

// ============================================================================
// Pricing end to end
// ============================================================================

#[test]
fn azure_gpt4o_scenario_prices_through_loaded_table() {
    let pricing_content = r#"
azure:
  - model:
      operator: equals
      value: gpt-4o
    cost:
      prompt_token: 0.000005
      completion_token: 0.000015
"#;
    let mut pricing_file = NamedTempFile::with_suffix(".yaml").unwrap();
    pricing_file.write_all(pricing_content.as_bytes()).unwrap();

    let table = tollgate::pricing::PricingTable::load(pricing_file.path()).unwrap();
    let engine = CostEngine::new(Arc::new(table));

    let usage = Usage {
        prompt_tokens: 1000,
        completion_tokens: 500,
        calls: 1,
        ..Default::default()
    };
    let outcome = engine.cost("azure", "gpt-4o", &usage);
    assert!(!outcome.unpriced);
    assert!((outcome.amount - 0.0125).abs() < 1e-12);
}

#[test]
fn flux_schnell_prices_per_image_from_builtin_table() {
    let engine = CostEngine::new(Arc::new(tollgate::pricing::builtin_table()));

    let usage = Usage {
        prompt_tokens: 9999,
        completion_tokens: 0,
        images: 1,
        calls: 1,
        ..Default::default()
    };
    let outcome = engine.cost("fireworks", "black-forest-labs/flux-schnell", &usage);
    assert!((outcome.amount - 0.0013).abs() < 1e-15);
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn full_config_round_trip() {
    let config_content = r#"
listener:
  address: "127.0.0.1:8787"
  shutdown_timeout_secs: 10

proxy:
  request_timeout_secs: 90
  streaming_enabled: true

tokenizer:
  workers: 4
  queue_depth: 128

buffer:
  enabled: true
  command: ["sleep", "600"]
  port: 9444
  threshold_bytes: 1048576
  idle_timeout_secs: 300

emitter:
  endpoint: "http://127.0.0.1:8123/ingest"
  queue_depth: 256
  max_attempts: 5
  backoff_ms: 100

observability:
  access_log: false
"#;
    let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
    file.write_all(config_content.as_bytes()).unwrap();

    let config = load_config(file.path()).unwrap();
    assert_eq!(config.tokenizer.workers, 4);
    assert_eq!(config.buffer.threshold_bytes, 1048576);
    assert_eq!(config.emitter.max_attempts, 5);
    assert!(!config.observability.access_log);

    // No pricing path configured: the built-in table loads and validates
    let table = load_pricing(&config).unwrap();
    assert!(!table.is_empty());
}

// ============================================================================
// Google path handling
// ============================================================================

#[test]
fn google_model_and_stream_come_from_the_path() {
    let registry = ProviderRegistry::builtin().unwrap();
    let path = "/v1beta/models/gemini-1.5-flash:streamGenerateContent";
    let resolution = resolve(
        &registry,
        Some("generativelanguage.googleapis.com"),
        path,
        &HeaderMap::new(),
    )
    .unwrap();

    assert_eq!(resolution.client_format, WireFormat::GoogleGenerateContent);
    assert_eq!(
        google::model_from_path(path).as_deref(),
        Some("gemini-1.5-flash")
    );
    assert!(google::is_stream_path(path));
}
