//! Request handler: the per-request proxy pipeline
//!
//! Resolver -> (optional body buffer) -> request-direction normalize ->
//! upstream call -> response-direction normalize (streaming-aware) ->
//! token counting + cost -> usage emission. Failures that affect the
//! client-visible response surface synchronously; metering failures
//! degrade and never delay the proxied response.

use crate::buffer::BodyBuffer;
use crate::canonical::{CanonicalRequest, UsageCounters};
use crate::config::ProxyConfig;
use crate::emitter::{UsageEmitter, UsageRecord};
use crate::error::{ErrorResponse, GatewayError, Result};
use crate::observability::{AccessLogBuilder, Observability};
use crate::pricing::{CostEngine, Usage};
use crate::protocol::{codec_for, google, pump_stream};
use crate::provider::{resolve, ProviderRegistry, WireFormat};
use crate::tokenizer::TokenCounter;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use http::header::{self, HeaderMap, HeaderName};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, BodyStream, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Response body: buffered bytes or a channel-fed stream
pub enum GatewayBody {
    Full(Full<Bytes>),
    Streaming(mpsc::Receiver<Bytes>),
}

impl GatewayBody {
    pub fn bytes(bytes: Bytes) -> Self {
        GatewayBody::Full(Full::new(bytes))
    }

    pub fn empty() -> Self {
        GatewayBody::Full(Full::new(Bytes::new()))
    }

    /// Channel pair for streaming; the sender side feeds the client
    pub fn channel(depth: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(depth);
        (tx, GatewayBody::Streaming(rx))
    }
}

impl Body for GatewayBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            GatewayBody::Full(body) => Pin::new(body).poll_frame(cx),
            GatewayBody::Streaming(rx) => match rx.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            GatewayBody::Full(body) => body.is_end_stream(),
            GatewayBody::Streaming(_) => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            GatewayBody::Full(body) => body.size_hint(),
            GatewayBody::Streaming(_) => SizeHint::default(),
        }
    }
}

/// Shared, read-only per-process context, built once at startup
pub struct GatewayContext {
    pub registry: ProviderRegistry,
    pub cost: CostEngine,
    pub tokens: TokenCounter,
    pub buffer: BodyBuffer,
    pub emitter: UsageEmitter,
    pub observability: Arc<Observability>,
    pub http: reqwest::Client,
    pub proxy: ProxyConfig,
}

/// What a proxied request looked like, for logging and metrics
struct Proxied {
    response: Response<GatewayBody>,
    provider: String,
    model: String,
    streamed: bool,
    buffered: bool,
    upstream_duration: Duration,
}

/// Handle one inbound request
pub async fn handle_request(
    req: Request<Incoming>,
    client_ip: String,
    state: Arc<GatewayContext>,
) -> std::result::Result<Response<GatewayBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    // Admin surface
    if method == Method::GET {
        match path.as_str() {
            "/metrics" => return Ok(metrics_response(&state)),
            "/healthz" => return Ok(text_response(StatusCode::OK, "ok")),
            _ => {}
        }
    }

    let request_id = uuid::Uuid::new_v4().to_string();
    let timer = Instant::now();
    let log = AccessLogBuilder::new(request_id.clone(), client_ip)
        .request(method.as_str(), &path);

    let outcome = proxy(req, &request_id, state.clone()).await;

    let (response, log) = match outcome {
        Ok(proxied) => {
            state.observability.metrics.record_request(
                &proxied.provider,
                &proxied.model,
                proxied.response.status().as_u16(),
                timer.elapsed(),
            );
            let log = log
                .provider(&proxied.provider, &proxied.model)
                .response(proxied.response.status().as_u16())
                .upstream_duration(proxied.upstream_duration)
                .streamed(proxied.streamed)
                .buffered(proxied.buffered);
            (proxied.response, log)
        }
        Err(err) => {
            let kind = error_kind(&err);
            state.observability.metrics.record_error(kind);
            state
                .observability
                .metrics
                .record_request("unknown", "unknown", ErrorResponse::from(&err).status, timer.elapsed());
            let err_text = err.to_string();
            debug!(request_id = %request_id, "request failed: {}", err_text);
            let ErrorResponse { status, message } = ErrorResponse::from(&err);
            let log = log.response(status).error(Some(&err_text));
            (
                error_response(
                    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                    &message,
                ),
                log,
            )
        }
    };

    state.observability.access_logger.log(&log.build());

    let mut response = response;
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    Ok(response)
}

/// The proxy pipeline proper; errors here become client-visible error
/// responses
async fn proxy(
    req: Request<Incoming>,
    request_id: &str,
    state: Arc<GatewayContext>,
) -> Result<Proxied> {
    let started_at = Utc::now();

    // Cancelled when the client abandons the request and this future is
    // dropped; tokenizer jobs hang off it
    let cancel = CancellationToken::new();
    let _cancel_guard = cancel.clone().drop_guard();

    let path = req.uri().path().to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let host = req
        .uri()
        .host()
        .map(String::from)
        .or_else(|| {
            req.headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        });

    // 1. Resolve the provider; pure function of URL and headers
    let resolution = resolve(&state.registry, host.as_deref(), &path, req.headers())?;
    let provider_name = resolution.provider.name.to_string();
    let provider_format = resolution.provider.wire_format;
    let client_format = resolution.client_format;
    let target_url = resolution.target_url.clone();
    let translate = client_format != provider_format;
    let client_codec = codec_for(client_format);
    let provider_codec = codec_for(provider_format);

    let content_length = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let inbound_headers = req.headers().clone();
    let body = req.into_body();

    // 2. Ingest the body. Oversized same-format bodies go through the
    // sidecar and reach the upstream as a stream; translation requires the
    // bytes in hand, so cross-format requests are always materialized.
    let mut buffered = false;
    let mut buffer_id: Option<String> = None;
    let mut canonical: Option<CanonicalRequest> = None;

    let (upstream_body, upstream_path) = if !translate && state.buffer.should_buffer(content_length)
    {
        buffered = true;
        state.observability.metrics.buffered_bodies_total.inc();

        let data_stream = BodyStream::new(body)
            .try_filter_map(|frame| futures::future::ok(frame.into_data().ok()));
        let id = state.buffer.stash(data_stream).await?;
        let retrieved = state.buffer.retrieve(&id).await?;
        buffer_id = Some(id);
        (reqwest::Body::wrap_stream(retrieved), path_and_query.clone())
    } else {
        let bytes = body
            .collect()
            .await
            .map_err(|e| GatewayError::Http(format!("failed to read request body: {}", e)))?
            .to_bytes();

        // Request-direction transform fails hard: no meaningful call can
        // be made from a malformed payload
        let mut parsed = client_codec.parse_request(&bytes)?;
        if client_format == WireFormat::GoogleGenerateContent {
            if parsed.model.is_empty() {
                if let Some(model) = google::model_from_path(&path) {
                    parsed.model = model;
                }
            }
            parsed.params.stream = google::is_stream_path(&path);
        }

        let (body_bytes, up_path) = if translate {
            let encoded = provider_codec.encode_request(&parsed)?;
            (encoded, provider_codec.upstream_path(&parsed))
        } else {
            (bytes, path_and_query.clone())
        };
        canonical = Some(parsed);
        (reqwest::Body::from(body_bytes), up_path)
    };

    let model = canonical
        .as_ref()
        .map(|c| c.model.clone())
        .unwrap_or_default();
    let stream_requested = canonical.as_ref().map(|c| c.params.stream).unwrap_or(false);

    // 3. Dispatch upstream
    let url = format!("{}{}", target_url, upstream_path);
    let mut upstream_req = state.http.post(&url).body(upstream_body);

    for (name, value) in inbound_headers.iter() {
        if forward_header(name) {
            upstream_req = upstream_req.header(name, value);
        }
    }
    if translate {
        upstream_req = upstream_req.header(header::CONTENT_TYPE, "application/json");
    }
    // Streamed responses outlive any whole-request deadline
    if !stream_requested && !buffered {
        upstream_req =
            upstream_req.timeout(Duration::from_secs(state.proxy.request_timeout_secs));
    }

    let upstream_timer = Instant::now();
    let upstream_resp = upstream_req.send().await.map_err(|e| {
        if e.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Upstream(format!("request to {} failed: {}", provider_name, e))
        }
    });

    let upstream_resp = match upstream_resp {
        Ok(resp) => resp,
        Err(e) => {
            if let Some(id) = &buffer_id {
                state.buffer.release(id).await;
            }
            // The call never completed; record it as errored with no usage
            emit_record(
                &state,
                request_id,
                &provider_name,
                &model,
                UsageCounters::default(),
                0,
                false,
                true,
                started_at,
            );
            return Err(e);
        }
    };

    let status = upstream_resp.status();
    let upstream_headers = upstream_resp.headers().clone();

    // 4a. Upstream error: propagate status and body verbatim
    if !status.is_success() {
        let bytes = upstream_resp.bytes().await.unwrap_or_default();
        if let Some(id) = &buffer_id {
            state.buffer.release(id).await;
        }
        emit_record(
            &state,
            request_id,
            &provider_name,
            &model,
            UsageCounters::default(),
            0,
            false,
            true,
            started_at,
        );

        let mut builder = Response::builder().status(status);
        copy_response_headers(&mut builder, &upstream_headers);
        let response = builder
            .body(GatewayBody::bytes(bytes))
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        return Ok(Proxied {
            response,
            provider: provider_name,
            model,
            streamed: false,
            buffered,
            upstream_duration: upstream_timer.elapsed(),
        });
    }

    let is_event_stream = upstream_headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false);

    // 4b. Streaming response: a pull-based pipeline feeds the client while
    // metering happens after the stream ends, off the response path
    if is_event_stream && state.proxy.streaming_enabled {
        let decoder = provider_codec.stream_decoder();
        let encoder = translate.then(|| client_codec.stream_encoder());
        let (tx, body) = GatewayBody::channel(16);

        let finalize_state = state.clone();
        let finalize_provider = provider_name.clone();
        let finalize_model = model.clone();
        let finalize_request_id = request_id.to_string();
        let finalize_canonical = canonical;
        let finalize_buffer_id = buffer_id;
        let upstream_stream = upstream_resp.bytes_stream();

        tokio::spawn(async move {
            let outcome = pump_stream(upstream_stream, decoder, encoder, tx).await;

            if let Some(id) = &finalize_buffer_id {
                finalize_state.buffer.release(id).await;
            }
            if outcome.passthrough_events > 0 {
                finalize_state
                    .observability
                    .metrics
                    .stream_passthrough_total
                    .inc_by(outcome.passthrough_events);
            }

            // Usage reported in-stream wins; otherwise estimate from text
            let model = if finalize_model.is_empty() {
                outcome.model.clone().unwrap_or_default()
            } else {
                finalize_model
            };
            let mut counters = outcome.usage;
            let mut estimated = false;
            if counters.is_empty() {
                estimated = true;
                counters = estimate_usage(
                    &finalize_state.tokens,
                    finalize_canonical.as_ref(),
                    &outcome.text,
                    CancellationToken::new(),
                )
                .await;
            }
            let images = finalize_canonical
                .as_ref()
                .map(|c| c.image_count())
                .unwrap_or(0);

            emit_record(
                &finalize_state,
                &finalize_request_id,
                &finalize_provider,
                &model,
                counters,
                images,
                estimated,
                outcome.upstream_error.is_some(),
                started_at,
            );
        });

        let mut builder = Response::builder().status(status);
        copy_response_headers(&mut builder, &upstream_headers);
        let response = builder
            .body(body)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        return Ok(Proxied {
            response,
            provider: provider_name,
            model,
            streamed: true,
            buffered,
            upstream_duration: upstream_timer.elapsed(),
        });
    }

    // 4c. Unary response
    let bytes = upstream_resp
        .bytes()
        .await
        .map_err(|e| GatewayError::Upstream(format!("failed to read response: {}", e)))?;
    let upstream_duration = upstream_timer.elapsed();
    if let Some(id) = &buffer_id {
        state.buffer.release(id).await;
    }

    let mut transform_failed = false;
    let (client_bytes, parsed_response) = if translate {
        match provider_codec.parse_response(&bytes) {
            Ok(parsed) => match client_codec.encode_response(&parsed) {
                Ok(encoded) => (encoded, Some(parsed)),
                Err(e) => {
                    warn!("response encode failed, passing upstream bytes through: {}", e);
                    transform_failed = true;
                    (bytes.clone(), Some(parsed))
                }
            },
            Err(e) => {
                // Fail soft: the client gets the upstream payload untouched
                warn!("response transform failed, passing upstream bytes through: {}", e);
                state.observability.metrics.record_error("response_transform");
                transform_failed = true;
                (bytes.clone(), None)
            }
        }
    } else {
        // Same format: the client-visible boundary stays bit-exact; the
        // parse below is metering-only
        match provider_codec.parse_response(&bytes) {
            Ok(parsed) => (bytes.clone(), Some(parsed)),
            Err(e) => {
                debug!("metering parse failed on passthrough response: {}", e);
                (bytes.clone(), None)
            }
        }
    };

    let model = if model.is_empty() {
        parsed_response
            .as_ref()
            .and_then(|r| r.model.clone())
            .unwrap_or_default()
    } else {
        model
    };

    let mut counters = parsed_response
        .as_ref()
        .and_then(|r| r.usage)
        .unwrap_or_default();
    let mut estimated = false;
    if counters.is_empty() {
        estimated = true;
        let response_text = parsed_response
            .as_ref()
            .map(|r| r.joined_text())
            .unwrap_or_default();
        counters = estimate_usage(&state.tokens, canonical.as_ref(), &response_text, cancel).await;
    }
    let images = canonical.as_ref().map(|c| c.image_count()).unwrap_or(0);

    emit_record(
        &state,
        request_id,
        &provider_name,
        &model,
        counters,
        images,
        estimated,
        transform_failed,
        started_at,
    );

    let mut builder = Response::builder().status(status);
    copy_response_headers(&mut builder, &upstream_headers);
    let response = builder
        .body(GatewayBody::bytes(client_bytes))
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    Ok(Proxied {
        response,
        provider: provider_name,
        model,
        streamed: false,
        buffered,
        upstream_duration,
    })
}

/// Estimate token usage from text when the upstream reported none.
///
/// A failed count stays at zero but the record is flagged estimated, so
/// downstream consumers know the cost is approximate rather than exact.
async fn estimate_usage(
    tokens: &TokenCounter,
    canonical: Option<&CanonicalRequest>,
    response_text: &str,
    cancel: CancellationToken,
) -> UsageCounters {
    let mut counters = UsageCounters::default();

    if let Some(request) = canonical {
        match tokens.count(request.joined_text(), cancel.clone()).await {
            Ok(count) => counters.prompt_tokens = count as u64,
            Err(e) => warn!("prompt token estimate unavailable: {}", e),
        }
    }
    if !response_text.is_empty() {
        match tokens.count(response_text.to_string(), cancel).await {
            Ok(count) => counters.completion_tokens = count as u64,
            Err(e) => warn!("completion token estimate unavailable: {}", e),
        }
    }

    counters
}

/// Compute cost and hand the usage record to the emitter. Never fails and
/// never blocks the response path.
#[allow(clippy::too_many_arguments)]
fn emit_record(
    state: &GatewayContext,
    request_id: &str,
    provider: &str,
    model: &str,
    counters: UsageCounters,
    images: u64,
    estimated: bool,
    error: bool,
    started_at: DateTime<Utc>,
) {
    let usage = Usage::from_counters(&counters, 1, images);
    let outcome = state.cost.cost(provider, model, &usage);

    if outcome.unpriced {
        state
            .observability
            .metrics
            .unpriced_requests_total
            .with_label_values(&[provider, model])
            .inc();
    }
    if estimated {
        state
            .observability
            .metrics
            .estimated_usage_total
            .with_label_values(&[provider])
            .inc();
    }
    state.observability.metrics.record_usage(
        provider,
        usage.prompt_tokens,
        usage.completion_tokens,
        outcome.amount,
    );

    let record = UsageRecord {
        request_id: request_id.to_string(),
        provider: provider.to_string(),
        model: model.to_string(),
        usage,
        cost: 0.0,
        unpriced: false,
        estimated,
        error,
        started_at,
        finished_at: Utc::now(),
    }
    .with_cost(&outcome);

    if !state.emitter.emit(record) {
        state
            .observability
            .metrics
            .usage_records_dropped_total
            .inc();
    }
}

/// Headers forwarded to the upstream. Hop-by-hop headers, entity framing
/// and the gateway's own override headers stay behind.
fn forward_header(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "host"
            | "content-length"
            | "transfer-encoding"
            | "connection"
            | "keep-alive"
            | "accept-encoding"
            | "x-gateway-target-provider"
            | "x-gateway-target-url"
    )
}

/// Copy upstream response headers, dropping framing that no longer holds
fn copy_response_headers(builder: &mut http::response::Builder, headers: &HeaderMap) {
    if let Some(out) = builder.headers_mut() {
        for (name, value) in headers.iter() {
            if matches!(
                name.as_str(),
                "content-length" | "transfer-encoding" | "connection" | "keep-alive"
            ) {
                continue;
            }
            out.append(name.clone(), value.clone());
        }
    }
}

fn error_kind(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::ProviderResolution(_) => "provider_resolution",
        GatewayError::RequestTransform(_) => "request_transform",
        GatewayError::ResponseTransform(_) => "response_transform",
        GatewayError::Upstream(_) => "upstream",
        GatewayError::Timeout => "timeout",
        GatewayError::BufferSidecar(_) => "buffer_sidecar",
        GatewayError::TokenCount(_) => "token_count",
        GatewayError::CostCalculation(_) => "cost",
        GatewayError::Emitter(_) => "emitter",
        _ => "internal",
    }
}

/// JSON error body in the shape chat clients expect
fn error_response(status: StatusCode, message: &str) -> Response<GatewayBody> {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": if status.is_client_error() {
                "invalid_request_error"
            } else {
                "upstream_error"
            },
            "code": status.as_u16(),
        }
    });

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(GatewayBody::bytes(Bytes::from(body.to_string())))
        .expect("static response must build")
}

fn text_response(status: StatusCode, message: &str) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(GatewayBody::bytes(Bytes::from(message.to_string())))
        .expect("static response must build")
}

fn metrics_response(state: &GatewayContext) -> Response<GatewayBody> {
    match state.observability.metrics.export() {
        Ok(text) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(GatewayBody::bytes(Bytes::from(text)))
            .expect("static response must build"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gateway_body_full_collects() {
        let body = GatewayBody::bytes(Bytes::from_static(b"hello"));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello");
    }

    #[tokio::test]
    async fn test_gateway_body_channel_streams() {
        let (tx, body) = GatewayBody::channel(4);
        tx.send(Bytes::from_static(b"a")).await.unwrap();
        tx.send(Bytes::from_static(b"b")).await.unwrap();
        drop(tx);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"ab");
    }

    #[test]
    fn test_forward_header_filters() {
        assert!(forward_header(&header::AUTHORIZATION));
        assert!(forward_header(&HeaderName::from_static("x-api-key")));
        assert!(forward_header(&HeaderName::from_static("anthropic-version")));
        assert!(!forward_header(&header::HOST));
        assert!(!forward_header(&header::CONTENT_LENGTH));
        assert!(!forward_header(&HeaderName::from_static(
            "x-gateway-target-provider"
        )));
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response(StatusCode::BAD_REQUEST, "bad model");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_copy_response_headers_drops_framing() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        upstream.insert(header::CONTENT_LENGTH, "42".parse().unwrap());
        upstream.insert("x-ratelimit-remaining", "99".parse().unwrap());

        let mut builder = Response::builder();
        copy_response_headers(&mut builder, &upstream);
        let response = builder.body(()).unwrap();

        assert!(response.headers().contains_key(header::CONTENT_TYPE));
        assert!(response.headers().contains_key("x-ratelimit-remaining"));
        assert!(!response.headers().contains_key(header::CONTENT_LENGTH));
    }
}
