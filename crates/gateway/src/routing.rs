//! Model classification and alias rewriting.
//!
//! Alias mapping runs before validation; the rewritten name must itself
//! satisfy the prefix whitelist, so an alias cannot smuggle an arbitrary
//! model past classification.

use std::collections::BTreeMap;

use crate::error::{GatewayError, GatewayResult};

/// Where a request is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The local OpenAI-compatible endpoint.
    Local,
    /// The Cloud-Code account pool.
    CloudCode,
}

const LOCAL_PREFIXES: &[&str] = &["local-", "gemma-"];

const CLOUD_PREFIXES: &[&str] = &[
    "claude-", "gemini-", "gpt-os-", "gpt-4-", "lmstudio-", "deepseek-", "qwen-",
];

/// Models the Cloud-Code backend serves, exposed through `GET /v1/models`.
pub const CLOUD_MODEL_CATALOG: &[&str] = &[
    "claude-sonnet-4-5",
    "claude-opus-4-1",
    "claude-3-5-haiku",
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    "gpt-os-120b",
];

/// Classify a model name by prefix, case-insensitively.
pub fn classify(model: &str) -> Option<Route> {
    let lowered = model.to_ascii_lowercase();

    if LOCAL_PREFIXES.iter().any(|prefix| lowered.starts_with(prefix)) {
        return Some(Route::Local);
    }

    if CLOUD_PREFIXES.iter().any(|prefix| lowered.starts_with(prefix)) {
        return Some(Route::CloudCode);
    }

    None
}

/// Rewrite the model through the alias map, then classify. The mapping is
/// transparent to callers and observable only in logs.
pub fn resolve(model: &str, mapping: &BTreeMap<String, String>) -> GatewayResult<(String, Route)> {
    let resolved = match mapping.get(model) {
        Some(canonical) => {
            log::info!("Model mapping applied: {model} -> {canonical}");
            canonical.clone()
        }
        None => model.to_string(),
    };

    match classify(&resolved) {
        Some(route) => Ok((resolved, route)),
        None => Err(GatewayError::InvalidRequest(format!(
            "model '{resolved}' is not allowed; expected a local-*, gemma-*, claude-*, gemini-*, gpt-os-*, gpt-4-*, lmstudio-*, deepseek-* or qwen-* model"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_table() {
        assert_eq!(classify("local-gemma"), Some(Route::Local));
        assert_eq!(classify("gemma-7b"), Some(Route::Local));
        assert_eq!(classify("claude-3-5-sonnet"), Some(Route::CloudCode));
        assert_eq!(classify("gemini-2.5-pro"), Some(Route::CloudCode));
        assert_eq!(classify("gpt-os-120b"), Some(Route::CloudCode));
        assert_eq!(classify("gpt-4-turbo"), Some(Route::CloudCode));
        assert_eq!(classify("lmstudio-llama"), Some(Route::CloudCode));
        assert_eq!(classify("deepseek-v3"), Some(Route::CloudCode));
        assert_eq!(classify("qwen-72b"), Some(Route::CloudCode));
        assert_eq!(classify("mystery-model"), None);
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(classify("Claude-3-Haiku"), Some(Route::CloudCode));
        assert_eq!(classify("LOCAL-GEMMA"), Some(Route::Local));
    }

    #[test]
    fn mapping_rewrites_before_classification() {
        let mapping = BTreeMap::from([("claude-3-haiku-20240307".to_string(), "gemini-2.5-flash".to_string())]);

        let (model, route) = resolve("claude-3-haiku-20240307", &mapping).unwrap();
        assert_eq!(model, "gemini-2.5-flash");
        assert_eq!(route, Route::CloudCode);
    }

    #[test]
    fn alias_cannot_bypass_the_whitelist() {
        let mapping = BTreeMap::from([("claude-3-haiku-20240307".to_string(), "backdoor-model".to_string())]);

        let error = resolve("claude-3-haiku-20240307", &mapping).unwrap_err();
        assert!(error.client_message().contains("not allowed"));
    }

    #[test]
    fn unknown_unmapped_model_is_rejected() {
        assert!(resolve("backdoor-model", &BTreeMap::new()).is_err());
    }
}
