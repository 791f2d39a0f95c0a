//! Upstream provider descriptors and resolution
//!
//! Each supported upstream is a static descriptor: a name, an ordered list
//! of host patterns for detection, a wire-format tag selecting the codec
//! pair, and the base URL used to rebuild the outbound request target. The
//! registry is built once at startup and never mutates.

mod resolver;

pub use resolver::{
    detect_client_format, resolve, Resolution, TARGET_PROVIDER_HEADER, TARGET_URL_HEADER,
};

use crate::error::{GatewayError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Wire format tag identifying which codec pair a provider speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireFormat {
    /// OpenAI chat-completions JSON (+ SSE chunks)
    OpenAiChat,
    /// Anthropic Messages JSON (+ event stream)
    AnthropicMessages,
    /// Google generateContent JSON (+ streamed responses)
    GoogleGenerateContent,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::OpenAiChat => "openai-chat",
            WireFormat::AnthropicMessages => "anthropic-messages",
            WireFormat::GoogleGenerateContent => "google-generate-content",
        }
    }
}

/// Static description of one upstream provider
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    /// Unique provider identifier, also the pricing-table key
    pub name: &'static str,
    /// Ordered patterns tested against the inbound URL host
    pub host_patterns: Vec<Regex>,
    /// Which codec pair this provider's API speaks
    pub wire_format: WireFormat,
    /// Default upstream base URL
    pub base_url: &'static str,
}

impl ProviderDescriptor {
    fn new(
        name: &'static str,
        patterns: &[&str],
        wire_format: WireFormat,
        base_url: &'static str,
    ) -> Result<Self> {
        let host_patterns = patterns
            .iter()
            .map(|p| Regex::new(p).map_err(GatewayError::from))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name,
            host_patterns,
            wire_format,
            base_url,
        })
    }

    /// Whether any host pattern matches the given host
    pub fn matches_host(&self, host: &str) -> bool {
        self.host_patterns.iter().any(|p| p.is_match(host))
    }
}

/// Registry of all known providers, in fixed resolution order
pub struct ProviderRegistry {
    providers: Vec<ProviderDescriptor>,
}

impl ProviderRegistry {
    /// Build the registry of supported upstreams.
    ///
    /// Pattern order is the documented resolution order; patterns for
    /// different providers must not overlap on a real provider host (a
    /// configuration invariant held by the uniqueness test below).
    pub fn builtin() -> Result<Self> {
        let providers = vec![
            ProviderDescriptor::new(
                "openai",
                &[r"^api\.openai\.com$"],
                WireFormat::OpenAiChat,
                "https://api.openai.com",
            )?,
            ProviderDescriptor::new(
                "azure",
                &[r"\.openai\.azure\.com$", r"\.azure-api\.net$"],
                WireFormat::OpenAiChat,
                "https://openai.azure.com",
            )?,
            ProviderDescriptor::new(
                "google-vertex-ai",
                &[
                    r"-aiplatform\.googleapis\.com$",
                    r"^generativelanguage\.googleapis\.com$",
                ],
                WireFormat::GoogleGenerateContent,
                "https://generativelanguage.googleapis.com",
            )?,
            ProviderDescriptor::new(
                "anthropic",
                &[r"^api\.anthropic\.com$"],
                WireFormat::AnthropicMessages,
                "https://api.anthropic.com",
            )?,
            ProviderDescriptor::new(
                "fireworks",
                &[r"^api\.fireworks\.ai$"],
                WireFormat::OpenAiChat,
                "https://api.fireworks.ai/inference",
            )?,
            ProviderDescriptor::new(
                "together",
                &[r"^api\.together\.xyz$"],
                WireFormat::OpenAiChat,
                "https://api.together.xyz",
            )?,
            ProviderDescriptor::new(
                "openrouter",
                &[r"^openrouter\.ai$"],
                WireFormat::OpenAiChat,
                "https://openrouter.ai/api",
            )?,
            ProviderDescriptor::new(
                "qstash",
                &[r"^qstash\.upstash\.io$"],
                WireFormat::OpenAiChat,
                "https://qstash.upstash.io/llm",
            )?,
        ];

        Ok(Self { providers })
    }

    /// Look a provider up by name (the override-header path)
    pub fn by_name(&self, name: &str) -> Option<&ProviderDescriptor> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// First provider whose host patterns match, in registry order
    pub fn by_host(&self, host: &str) -> Option<&ProviderDescriptor> {
        self.providers.iter().find(|p| p.matches_host(host))
    }

    /// All registered providers, in resolution order
    pub fn providers(&self) -> &[ProviderDescriptor] {
        &self.providers
    }
}
