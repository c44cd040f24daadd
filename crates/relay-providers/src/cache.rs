use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use relay_types::Provider;

/// Prompt-cache request fields injected into a provider call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMutation {
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl CacheMutation {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheTelemetry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_cache_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_cache_retention: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_miss_reason: Option<String>,
}

/// Cache request fed to an adapter: the stable-prefix cache key plus an
/// optional retention hint.
#[derive(Debug, Clone)]
pub struct CacheRequest<'a> {
    pub cache_key: &'a str,
    pub retention: Option<&'a str>,
}

/// Provider-native prompt-cache behavior. The provider set is closed, so
/// adapters are enum variants rather than a plugin table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderCacheAdapter {
    /// The OpenAI-compatible router (codex): understands
    /// `prompt_cache_key` and 24h retention, and reports cached/written
    /// token counts in usage details.
    OpenAiRouter,
    /// Providers without prompt caching.
    Unsupported,
}

pub fn cache_adapter_for(provider: Provider) -> ProviderCacheAdapter {
    match provider {
        Provider::Codex => ProviderCacheAdapter::OpenAiRouter,
        Provider::Claude | Provider::Gemini | Provider::Opencode => {
            ProviderCacheAdapter::Unsupported
        }
    }
}

impl ProviderCacheAdapter {
    /// Cache hints to merge into the outgoing request. Empty for
    /// providers without prompt caching.
    pub fn apply(&self, request: &CacheRequest<'_>) -> CacheMutation {
        match self {
            ProviderCacheAdapter::Unsupported => CacheMutation::default(),
            ProviderCacheAdapter::OpenAiRouter => {
                let mut fields = Map::new();
                fields.insert(
                    "prompt_cache_key".to_string(),
                    Value::String(request.cache_key.to_string()),
                );
                if request.retention == Some("24h") {
                    fields.insert(
                        "prompt_cache_retention".to_string(),
                        Value::String("24h".to_string()),
                    );
                }
                CacheMutation { fields }
            }
        }
    }

    /// Pull cache telemetry out of a provider usage block.
    pub fn extract_telemetry(&self, usage: &Value, request: &CacheRequest<'_>) -> CacheTelemetry {
        match self {
            ProviderCacheAdapter::Unsupported => CacheTelemetry {
                cache_miss_reason: Some("provider_not_supported".to_string()),
                ..CacheTelemetry::default()
            },
            ProviderCacheAdapter::OpenAiRouter => {
                let cached_input_tokens = usage
                    .pointer("/prompt_tokens_details/cached_tokens")
                    .and_then(Value::as_u64);
                let cache_write_tokens = usage
                    .get("cache_creation_input_tokens")
                    .and_then(Value::as_u64);
                let miss = match cached_input_tokens {
                    Some(0) | None => Some("no_cached_prefix".to_string()),
                    Some(_) => None,
                };
                CacheTelemetry {
                    prompt_cache_key: Some(request.cache_key.to_string()),
                    prompt_cache_retention: request.retention.map(str::to_string),
                    cached_input_tokens,
                    cache_write_tokens,
                    cache_miss_reason: miss,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unsupported_providers_apply_nothing() {
        let adapter = cache_adapter_for(Provider::Claude);
        let request = CacheRequest {
            cache_key: "abc",
            retention: Some("24h"),
        };
        assert!(adapter.apply(&request).is_empty());
        let telemetry = adapter.extract_telemetry(&json!({}), &request);
        assert_eq!(
            telemetry.cache_miss_reason.as_deref(),
            Some("provider_not_supported")
        );
    }

    #[test]
    fn router_sets_cache_key_and_24h_retention() {
        let adapter = cache_adapter_for(Provider::Codex);
        let request = CacheRequest {
            cache_key: "abc",
            retention: Some("24h"),
        };
        let mutation = adapter.apply(&request);
        assert_eq!(mutation.fields["prompt_cache_key"], json!("abc"));
        assert_eq!(mutation.fields["prompt_cache_retention"], json!("24h"));

        let short = CacheRequest {
            cache_key: "abc",
            retention: None,
        };
        let mutation = adapter.apply(&short);
        assert!(!mutation.fields.contains_key("prompt_cache_retention"));
    }

    #[test]
    fn router_parses_usage_token_details() {
        let adapter = cache_adapter_for(Provider::Codex);
        let request = CacheRequest {
            cache_key: "abc",
            retention: Some("24h"),
        };
        let usage = json!({
            "prompt_tokens_details": {"cached_tokens": 1024},
            "cache_creation_input_tokens": 256
        });
        let telemetry = adapter.extract_telemetry(&usage, &request);
        assert_eq!(telemetry.cached_input_tokens, Some(1024));
        assert_eq!(telemetry.cache_write_tokens, Some(256));
        assert_eq!(telemetry.prompt_cache_key.as_deref(), Some("abc"));
        assert!(telemetry.cache_miss_reason.is_none());
    }

    #[test]
    fn zero_cached_tokens_reports_a_miss() {
        let adapter = cache_adapter_for(Provider::Codex);
        let request = CacheRequest {
            cache_key: "abc",
            retention: None,
        };
        let usage = json!({"prompt_tokens_details": {"cached_tokens": 0}});
        let telemetry = adapter.extract_telemetry(&usage, &request);
        assert_eq!(
            telemetry.cache_miss_reason.as_deref(),
            Some("no_cached_prefix")
        );
    }
}
