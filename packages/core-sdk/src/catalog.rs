use serde::Serialize;

use crate::models::Provider;
use crate::registry::ProviderRegistry;

/**
 * \brief A selectable chat model.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub provider: Provider,
    pub id: &'static str,
    pub name: &'static str,
}

impl ModelInfo {
    /** \brief Identifier accepted by `ProviderRegistry::language_model`. */
    pub fn identifier(&self) -> String {
        format!("{}:{}", self.provider, self.id)
    }
}

const fn model(provider: Provider, id: &'static str, name: &'static str) -> ModelInfo {
    ModelInfo { provider, id, name }
}

pub const DEFAULT_MODEL: ModelInfo = model(Provider::Google, "gemini-1.5-flash", "Gemini 1.5 Flash");

pub const MODELS: &[ModelInfo] = &[
    DEFAULT_MODEL,
    model(Provider::Google, "gemini-1.5-flash-8b", "Gemini 1.5 Flash 8B"),
    model(Provider::Google, "gemini-1.5-pro", "Gemini 1.5 Pro"),
    model(Provider::Google, "gemini-2.0-flash", "Gemini 2.0 Flash"),
    model(Provider::Google, "gemini-2.0-flash-lite", "Gemini 2.0 Flash Lite"),
    model(Provider::Google, "gemini-2.5-flash-preview-04-17", "Gemini 2.5 Flash (Preview)"),
    model(Provider::Google, "gemini-2.5-pro-preview-05-06", "Gemini 2.5 Pro (Preview 05-06)"),
    model(Provider::OpenAI, "gpt-4o", "GPT-4o"),
    model(Provider::OpenAI, "gpt-4o-mini", "GPT-4o mini"),
    model(Provider::OpenAI, "gpt-3.5-turbo", "GPT-3.5 Turbo"),
    model(Provider::Anthropic, "claude-4-opus-20250514", "Claude 4 Opus (2025-05-14)"),
    model(Provider::Anthropic, "claude-4-sonnet-20250514", "Claude 4 Sonnet (2025-05-14)"),
    model(Provider::Anthropic, "claude-3-7-sonnet-20250219", "Claude 3.7 Sonnet (2025-02-19)"),
    model(Provider::Anthropic, "claude-3-5-sonnet-latest", "Claude 3.5 Sonnet (Latest)"),
    model(Provider::Anthropic, "claude-3-5-haiku-latest", "Claude 3.5 Haiku (Latest)"),
    model(Provider::Anthropic, "claude-3-haiku-20240307", "Claude 3 Haiku (2024-03-07)"),
    model(Provider::OpenRouter, "qwen/qwen3-30b-a3b:free", "Qwen 3 30B"),
    model(Provider::OpenRouter, "anthropic/claude-3-haiku", "Claude 3 Haiku"),
    model(Provider::OpenRouter, "anthropic/claude-3-sonnet", "Claude 3 Sonnet"),
];

/**
 * \brief Catalog entries whose provider has a usable key in this registry.
 */
pub fn available_models(registry: &ProviderRegistry) -> Vec<ModelInfo> {
    let enabled = registry.enabled_providers();
    MODELS
        .iter()
        .filter(|m| enabled.contains(&m.provider))
        .copied()
        .collect()
}

pub fn find_model(identifier: &str) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|m| m.identifier() == identifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultCredentials;

    #[test]
    fn every_catalog_entry_resolves() {
        let registry = ProviderRegistry::for_user(&DefaultCredentials::default(), &[]);
        for m in MODELS {
            let resolved = registry.language_model(&m.identifier()).expect("resolve");
            assert_eq!(resolved.model_id, m.id);
        }
    }

    #[test]
    fn availability_follows_enabled_providers() {
        let defaults = DefaultCredentials::default().with_key(Provider::OpenAI, "sk");
        let registry = ProviderRegistry::for_user(&defaults, &[]);
        let models = available_models(&registry);
        assert!(!models.is_empty());
        assert!(models.iter().all(|m| m.provider == Provider::OpenAI));

        let none = ProviderRegistry::for_user(&DefaultCredentials::default(), &[]);
        assert!(available_models(&none).is_empty());
    }

    #[test]
    fn find_model_by_identifier() {
        let m = find_model("openrouter:qwen/qwen3-30b-a3b:free").expect("present");
        assert_eq!(m.name, "Qwen 3 30B");
        assert!(find_model("openai:nope").is_none());
    }
}
