//! Per-request provider registry: default credentials overlaid with a user's BYOK keys.

use std::collections::BTreeMap;

use anyhow::Result;
use rusqlite::Connection;
use tracing::warn;

use crate::{
    config::DefaultCredentials,
    db,
    error::{ChatError, ChatResult},
    models::{CredentialRecord, Provider},
};

pub const OPENAI_API_BASE: &str = "https://api.openai.com";
pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
pub const GOOGLE_API_BASE: &str = "https://generativelanguage.googleapis.com";
pub const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api";

fn vendor_api_base(provider: Provider) -> &'static str {
    match provider {
        Provider::OpenAI => OPENAI_API_BASE,
        Provider::Anthropic => ANTHROPIC_API_BASE,
        Provider::Google => GOOGLE_API_BASE,
        Provider::OpenRouter => OPENROUTER_API_BASE,
    }
}

/**
 * \brief BYOK records owned by `user`; unauthenticated callers get none.
 */
pub fn resolve_user_keys(conn: &Connection, user: Option<&str>) -> Result<Vec<CredentialRecord>> {
    match user {
        Some(user_id) => db::get_user_keys(conn, user_id),
        None => Ok(Vec::new()),
    }
}

/**
 * \brief Connection settings for one vendor.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderClient {
    pub provider: Provider,
    pub api_key: Option<String>,
    pub api_base: String,
}

impl ProviderClient {
    pub fn has_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

/**
 * \brief A chat model bound to a configured provider client.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageModel {
    pub client: ProviderClient,
    pub model_id: String,
}

impl LanguageModel {
    pub fn provider(&self) -> Provider {
        self.client.provider
    }

    /** \brief `provider:modelId` form stored in message metadata. */
    pub fn identifier(&self) -> String {
        format!("{}:{}", self.client.provider, self.model_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingModel {
    pub client: ProviderClient,
    pub model_id: String,
}

/**
 * \brief Split `provider:modelId` on the first colon.
 */
pub fn parse_model_id(identifier: &str) -> ChatResult<(Provider, &str)> {
    let not_found = || ChatError::ModelNotFound(identifier.to_string());
    let (tag, model_id) = identifier.split_once(':').ok_or_else(not_found)?;
    if model_id.is_empty() {
        return Err(not_found());
    }
    let provider = tag.parse::<Provider>().map_err(|_| not_found())?;
    Ok((provider, model_id))
}

/**
 * \brief Accumulates per-provider keys before building a registry.
 */
#[derive(Debug, Clone)]
pub struct ProviderRegistryBuilder {
    slots: BTreeMap<Provider, ProviderClient>,
}

impl ProviderRegistryBuilder {
    pub fn new(defaults: &DefaultCredentials) -> Self {
        let slots = Provider::ALL
            .into_iter()
            .map(|provider| {
                let d = defaults.get(provider);
                let client = ProviderClient {
                    provider,
                    api_key: d.api_key.clone(),
                    api_base: d
                        .api_base
                        .clone()
                        .unwrap_or_else(|| vendor_api_base(provider).to_string()),
                };
                (provider, client)
            })
            .collect();
        ProviderRegistryBuilder { slots }
    }

    /**
     * \brief Override one provider's key. Blank keys leave the default in place.
     */
    pub fn with_key(mut self, provider: Provider, api_key: &str) -> Self {
        if api_key.trim().is_empty() {
            return self;
        }
        if let Some(slot) = self.slots.get_mut(&provider) {
            slot.api_key = Some(api_key.to_string());
        }
        self
    }

    /**
     * \brief Apply stored BYOK records; unknown provider tags are logged and skipped.
     */
    pub fn with_user_keys(self, records: &[CredentialRecord]) -> Self {
        records.iter().fold(self, |builder, record| {
            match record.provider.parse::<Provider>() {
                Ok(provider) => builder.with_key(provider, &record.config.api_key),
                Err(_) => {
                    warn!(
                        user_id = %record.user_id,
                        provider = %record.provider,
                        "unknown provider in byok record, skipping"
                    );
                    builder
                }
            }
        })
    }

    pub fn build(self) -> ProviderRegistry {
        ProviderRegistry { clients: self.slots }
    }
}

/**
 * \brief Immutable provider → client map for the lifetime of one request.
 */
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    clients: BTreeMap<Provider, ProviderClient>,
}

impl ProviderRegistry {
    /**
     * \brief Shorthand for the usual request path: defaults plus the user's keys.
     */
    pub fn for_user(defaults: &DefaultCredentials, keys: &[CredentialRecord]) -> Self {
        ProviderRegistryBuilder::new(defaults)
            .with_user_keys(keys)
            .build()
    }

    pub fn client(&self, provider: Provider) -> Option<&ProviderClient> {
        self.clients.get(&provider)
    }

    /**
     * \brief Resolve `provider:modelId` to a chat model; never falls back to another provider.
     */
    pub fn language_model(&self, identifier: &str) -> ChatResult<LanguageModel> {
        let (provider, model_id) = parse_model_id(identifier)?;
        let client = self
            .clients
            .get(&provider)
            .ok_or_else(|| ChatError::ModelNotFound(identifier.to_string()))?;
        Ok(LanguageModel {
            client: client.clone(),
            model_id: model_id.to_string(),
        })
    }

    pub fn embedding_model(&self, identifier: &str) -> ChatResult<EmbeddingModel> {
        let (provider, model_id) = parse_model_id(identifier)?;
        if !provider.supports_embeddings() {
            return Err(ChatError::EmbeddingUnsupported(provider));
        }
        let client = self
            .clients
            .get(&provider)
            .ok_or_else(|| ChatError::ModelNotFound(identifier.to_string()))?;
        Ok(EmbeddingModel {
            client: client.clone(),
            model_id: model_id.to_string(),
        })
    }

    /** \brief Providers that ended up with a non-blank key. */
    pub fn enabled_providers(&self) -> Vec<Provider> {
        self.clients
            .values()
            .filter(|c| c.has_key())
            .map(|c| c.provider)
            .collect()
    }
}
