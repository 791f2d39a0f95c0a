//! Streaming response pipeline
//!
//! Pulls upstream chunks only as fast as the client consumes transformed
//! output: the bounded channel to the client propagates backpressure
//! upstream, and a dropped receiver (client disconnect) stops the upstream
//! read immediately. Chunks that fail transformation are forwarded in their
//! original wire form at their original position; nothing is dropped or
//! reordered.

use super::{SseParser, StreamDecoder, StreamEncoder, StreamItem};
use crate::canonical::{FinishReason, UsageCounters};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What a completed (or aborted) stream observed
#[derive(Debug, Default)]
pub struct StreamOutcome {
    /// Accumulated output text, for token estimation
    pub text: String,
    /// Usage counters reported in-stream, if any
    pub usage: UsageCounters,
    pub id: Option<String>,
    pub model: Option<String>,
    pub finish_reason: Option<FinishReason>,
    /// Decoded delta count
    pub chunk_count: u64,
    /// Events forwarded raw after a transform failure
    pub passthrough_events: u64,
    /// The client went away before the stream finished
    pub client_disconnected: bool,
    /// The upstream transport failed mid-stream
    pub upstream_error: Option<String>,
}

impl StreamOutcome {
    fn absorb(&mut self, item: &StreamItem) {
        if let StreamItem::Delta(chunk) = item {
            self.chunk_count += 1;
            self.text.push_str(&chunk.text);
            if self.id.is_none() {
                self.id = chunk.id.clone();
            }
            if self.model.is_none() {
                self.model = chunk.model.clone();
            }
            if let Some(usage) = &chunk.usage {
                self.usage.merge(usage);
            }
            if let Some(finish) = &chunk.finish_reason {
                self.finish_reason = Some(finish.clone());
            }
        }
    }
}

/// Drive one upstream stream to completion.
///
/// `encoder` is `None` when client and provider speak the same wire format:
/// bytes are forwarded untouched and decoding feeds metering only. With an
/// encoder, each decoded item is re-encoded into the client's format.
pub async fn pump_stream<S, E>(
    mut upstream: S,
    mut decoder: Box<dyn StreamDecoder>,
    mut encoder: Option<Box<dyn StreamEncoder>>,
    tx: mpsc::Sender<Bytes>,
) -> StreamOutcome
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut parser = SseParser::new();
    let mut outcome = StreamOutcome::default();

    'upstream: while let Some(next) = upstream.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("upstream stream failed mid-response: {}", e);
                outcome.upstream_error = Some(e.to_string());
                break;
            }
        };

        let events = parser.feed(&bytes);

        // Same-format: forward the raw bytes, meter from a parsed copy
        let encoder = match encoder.as_mut() {
            Some(encoder) => encoder,
            None => {
                for event in &events {
                    if let Ok(items) = decoder.decode(event) {
                        for item in &items {
                            outcome.absorb(item);
                        }
                    }
                }
                if tx.send(bytes).await.is_err() {
                    debug!("client disconnected, cancelling upstream read");
                    outcome.client_disconnected = true;
                    break;
                }
                continue;
            }
        };

        for event in events {
            match decoder.decode(&event) {
                Ok(items) => {
                    for item in items {
                        outcome.absorb(&item);
                        let encoded = encoder.encode(&item);
                        if !encoded.is_empty() && tx.send(encoded).await.is_err() {
                            debug!("client disconnected, cancelling upstream read");
                            outcome.client_disconnected = true;
                            break 'upstream;
                        }
                    }
                }
                Err(e) => {
                    // Fail soft: the event goes out in its original wire
                    // form at its original position
                    warn!("stream transform failed, passing chunk through: {}", e);
                    outcome.passthrough_events += 1;
                    if tx.send(Bytes::from(event.raw.clone())).await.is_err() {
                        outcome.client_disconnected = true;
                        break 'upstream;
                    }
                }
            }
        }
    }

    // Streams without an explicit terminator end at upstream EOF; give the
    // client-format encoder the chance to close out (e.g. `[DONE]`).
    // Encoders that already emitted their terminator return nothing here.
    if let Some(encoder) = encoder.as_mut() {
        if !outcome.client_disconnected {
            let tail = encoder.encode(&StreamItem::Done);
            if !tail.is_empty() {
                let _ = tx.send(tail).await;
            }
        }
    }

    outcome
}
