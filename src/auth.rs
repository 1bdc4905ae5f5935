use axum::http::{HeaderMap, header};
use base64::Engine as _;
use serde_json::Value;

use crate::config::UpstreamConfig;
use crate::error::GatewayError;

pub const OPENAI_JWT_CLAIM_PATH: &str = "https://api.openai.com/auth";

/// Supplies the `Authorization` header for upstream calls.
///
/// A key configured for the gateway (literal or via environment variable)
/// always wins; otherwise the client's own credential is forwarded.
#[derive(Debug, Clone, Default)]
pub struct CredentialProvider {
    configured: Option<String>,
}

impl CredentialProvider {
    pub fn new(api_key: Option<String>) -> Self {
        let configured = api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .map(|key| bearer(&key));
        Self { configured }
    }

    /// Resolve once at startup: `api_key`, then the `api_key_env` variable
    pub fn from_config(config: &UpstreamConfig) -> Self {
        let key = config
            .api_key
            .clone()
            .or_else(|| std::env::var(&config.api_key_env).ok());
        Self::new(key)
    }

    /// Gateway-owned header value, if one was configured
    pub fn configured(&self) -> Option<&str> {
        self.configured.as_deref()
    }

    /// Header value for this request, or `MissingCredential` before any
    /// network call is attempted
    pub fn resolve(&self, headers: &HeaderMap) -> Result<String, GatewayError> {
        self.configured
            .clone()
            .or_else(|| extract_auth_header(headers))
            .ok_or(GatewayError::MissingCredential)
    }
}

fn bearer(key: &str) -> String {
    if strip_bearer_prefix(key).is_some() {
        key.to_string()
    } else {
        format!("Bearer {}", key)
    }
}

/// Client credential from `Authorization` or `x-api-key`
pub fn extract_auth_header(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(text) = value.to_str()
        && !text.trim().is_empty()
    {
        return Some(text.trim().to_string());
    }

    let text = headers.get("x-api-key")?.to_str().ok()?.trim();
    if text.is_empty() {
        return None;
    }
    Some(bearer(text))
}

pub fn strip_bearer_prefix(auth: &str) -> Option<&str> {
    let (scheme, rest) = auth.trim().split_at_checked(6)?;
    if scheme.eq_ignore_ascii_case("bearer") && rest.starts_with(|c: char| c.is_ascii_whitespace()) {
        return Some(rest.trim());
    }
    None
}

/// Pull the ChatGPT account id out of an access token's JWT claims
pub fn decode_chatgpt_account_id(access_token: &str) -> Option<String> {
    let payload_b64 = access_token.split('.').nth(1)?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64)
        .ok()
        .or_else(|| base64::engine::general_purpose::STANDARD.decode(payload_b64).ok())?;
    let json: Value = serde_json::from_slice(&decoded).ok()?;
    json.get(OPENAI_JWT_CLAIM_PATH)?
        .get("chatgpt_account_id")?
        .as_str()
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn configured_key_wins_over_client_header() {
        let provider = CredentialProvider::new(Some("sk-gateway".to_string()));
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-client"));
        assert_eq!(provider.resolve(&headers).unwrap(), "Bearer sk-gateway");
    }

    #[test]
    fn client_headers_are_forwarded() {
        let provider = CredentialProvider::new(None);

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static(" sk-client "));
        assert_eq!(provider.resolve(&headers).unwrap(), "Bearer sk-client");

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-auth"));
        assert_eq!(provider.resolve(&headers).unwrap(), "Bearer sk-auth");
    }

    #[test]
    fn missing_credential_is_an_error() {
        let provider = CredentialProvider::new(Some("   ".to_string()));
        assert_eq!(provider.configured(), None);
        assert!(matches!(
            provider.resolve(&HeaderMap::new()),
            Err(GatewayError::MissingCredential)
        ));
    }

    #[test]
    fn strip_bearer_prefix_is_case_insensitive() {
        assert_eq!(strip_bearer_prefix("bearer abc"), Some("abc"));
        assert_eq!(strip_bearer_prefix("Bearer  abc "), Some("abc"));
        assert_eq!(strip_bearer_prefix("Basic abc"), None);
        assert_eq!(strip_bearer_prefix("abc"), None);
    }

    #[test]
    fn decodes_account_id_from_jwt() {
        let claims = serde_json::json!({
            "https://api.openai.com/auth": {"chatgpt_account_id": "acct_123"}
        });
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&claims).unwrap());
        let token = format!("header.{payload}.sig");

        assert_eq!(decode_chatgpt_account_id(&token).as_deref(), Some("acct_123"));
        assert_eq!(decode_chatgpt_account_id("not-a-jwt"), None);
    }
}
