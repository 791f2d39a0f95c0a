//! Provider resolution
//!
//! Pure function of the inbound URL and headers. The explicit override
//! header takes precedence over host-pattern detection so a single
//! canonical entry path can reach any provider; otherwise host patterns
//! are tested in registry order and the first match wins.

use super::{ProviderDescriptor, ProviderRegistry, WireFormat};
use crate::error::{GatewayError, Result};
use http::HeaderMap;

/// Header forcing a specific provider by name
pub const TARGET_PROVIDER_HEADER: &str = "x-gateway-target-provider";

/// Header overriding the upstream base URL (e.g. a regional Azure resource)
pub const TARGET_URL_HEADER: &str = "x-gateway-target-url";

/// Outcome of resolving an inbound request
#[derive(Debug, Clone)]
pub struct Resolution<'a> {
    /// The upstream this request targets
    pub provider: &'a ProviderDescriptor,
    /// Base URL to dial, after any override
    pub target_url: String,
    /// Wire format the client is speaking, detected from the request path
    pub client_format: WireFormat,
}

/// Resolve an inbound request to a provider descriptor.
///
/// No side effects; safe to call concurrently against the shared registry.
pub fn resolve<'a>(
    registry: &'a ProviderRegistry,
    host: Option<&str>,
    path: &str,
    headers: &HeaderMap,
) -> Result<Resolution<'a>> {
    let provider = match header_value(headers, TARGET_PROVIDER_HEADER) {
        Some(name) => registry
            .by_name(name)
            .ok_or_else(|| GatewayError::ProviderResolution(format!("unknown provider '{}'", name)))?,
        None => {
            let host = host.ok_or_else(|| {
                GatewayError::ProviderResolution("request carries no host to resolve".to_string())
            })?;
            // Strip any port before pattern matching
            let bare_host = host.split(':').next().unwrap_or(host);
            registry.by_host(bare_host).ok_or_else(|| {
                GatewayError::ProviderResolution(format!("no provider matches host '{}'", host))
            })?
        }
    };

    let target_url = header_value(headers, TARGET_URL_HEADER)
        .map(|u| u.trim_end_matches('/').to_string())
        .unwrap_or_else(|| provider.base_url.to_string());

    let client_format = detect_client_format(path)?;

    Ok(Resolution {
        provider,
        target_url,
        client_format,
    })
}

/// Recognize the wire format the client is speaking from the request path
pub fn detect_client_format(path: &str) -> Result<WireFormat> {
    if path.contains("/chat/completions") || path.contains("/completions") {
        Ok(WireFormat::OpenAiChat)
    } else if path.contains("/messages") {
        Ok(WireFormat::AnthropicMessages)
    } else if path.contains(":generateContent") || path.contains(":streamGenerateContent") {
        Ok(WireFormat::GoogleGenerateContent)
    } else {
        Err(GatewayError::ProviderResolution(format!(
            "unrecognized API path '{}'",
            path
        )))
    }
}

fn header_value<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
