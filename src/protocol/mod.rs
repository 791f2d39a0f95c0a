//! Protocol normalization between provider wire schemas and the canonical form
//!
//! One codec per wire format, each implementing both directions for request
//! and response bodies plus the streaming pair. Request-direction failures
//! are hard errors (no meaningful upstream call can be made); response-
//! direction failures are soft — the caller logs and passes the original
//! upstream bytes through unmodified.

mod anthropic;
pub mod google;
mod openai;
pub mod sse;
mod stream;

pub use anthropic::AnthropicCodec;
pub use google::GoogleCodec;
pub use openai::OpenAiCodec;
pub use sse::{SseEvent, SseParser};
pub use stream::{pump_stream, StreamOutcome};

use crate::canonical::{CanonicalChunk, CanonicalRequest, CanonicalResponse};
use crate::error::Result;
use crate::provider::WireFormat;
use bytes::Bytes;

/// One item of a canonical stream
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// A delta carrying text and/or usage
    Delta(CanonicalChunk),
    /// End of stream
    Done,
}

/// Decoder from provider-native stream events to canonical items.
///
/// Stateful: one decoder per response stream.
pub trait StreamDecoder: Send {
    fn decode(&mut self, event: &SseEvent) -> Result<Vec<StreamItem>>;
}

/// Encoder from canonical items to client-native stream bytes.
///
/// Stateful: one encoder per response stream. Chunk boundaries need not be
/// preserved 1:1; text ordering must be.
pub trait StreamEncoder: Send {
    fn encode(&mut self, item: &StreamItem) -> Bytes;
}

/// Bidirectional transform between one wire schema and the canonical form
pub trait WireCodec: Send + Sync {
    fn format(&self) -> WireFormat;

    /// Path the provider expects for a generation call
    fn upstream_path(&self, request: &CanonicalRequest) -> String;

    /// Client payload -> canonical. Failure rejects the request.
    fn parse_request(&self, body: &[u8]) -> Result<CanonicalRequest>;

    /// Canonical -> provider payload
    fn encode_request(&self, request: &CanonicalRequest) -> Result<Bytes>;

    /// Provider payload -> canonical. Failure degrades to pass-through.
    fn parse_response(&self, body: &[u8]) -> Result<CanonicalResponse>;

    /// Canonical -> client payload
    fn encode_response(&self, response: &CanonicalResponse) -> Result<Bytes>;

    /// Fresh decoder for one provider-native response stream
    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;

    /// Fresh encoder for one client-native response stream
    fn stream_encoder(&self) -> Box<dyn StreamEncoder>;
}

static OPENAI: OpenAiCodec = OpenAiCodec;
static ANTHROPIC: AnthropicCodec = AnthropicCodec;
static GOOGLE: GoogleCodec = GoogleCodec;

/// Codec for a wire format tag
pub fn codec_for(format: WireFormat) -> &'static dyn WireCodec {
    match format {
        WireFormat::OpenAiChat => &OPENAI,
        WireFormat::AnthropicMessages => &ANTHROPIC,
        WireFormat::GoogleGenerateContent => &GOOGLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_dispatch() {
        assert_eq!(
            codec_for(WireFormat::OpenAiChat).format(),
            WireFormat::OpenAiChat
        );
        assert_eq!(
            codec_for(WireFormat::AnthropicMessages).format(),
            WireFormat::AnthropicMessages
        );
        assert_eq!(
            codec_for(WireFormat::GoogleGenerateContent).format(),
            WireFormat::GoogleGenerateContent
        );
    }
}
