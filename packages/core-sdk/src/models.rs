use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ChatError;

/**
 * \brief Closed set of LLM vendors a model identifier may name.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Anthropic,
    Google,
    OpenRouter,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::OpenAI,
        Provider::Anthropic,
        Provider::Google,
        Provider::OpenRouter,
    ];

    /** \brief Canonical tag used in model identifiers and in storage. */
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::OpenRouter => "openrouter",
        }
    }

    /** \brief Human readable vendor name. */
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::OpenAI => "OpenAI",
            Provider::Anthropic => "Anthropic",
            Provider::Google => "Google",
            Provider::OpenRouter => "OpenRouter",
        }
    }

    /**
     * \brief Whether the vendor exposes a text embedding endpoint.
     * \details OpenRouter routes chat completions only; Anthropic has no embedding API.
     */
    pub fn supports_embeddings(&self) -> bool {
        matches!(self, Provider::OpenAI | Provider::Google)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Provider::OpenAI),
            "anthropic" => Ok(Provider::Anthropic),
            // legacy BYOK tag written by older clients
            "google" | "google-gemini" => Ok(Provider::Google),
            "openrouter" => Ok(Provider::OpenRouter),
            other => Err(ChatError::UnknownProvider(other.to_string())),
        }
    }
}

/**
 * \brief BYOK payload stored as JSON next to the provider tag.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialConfig {
    pub api_key: String,
}

impl CredentialConfig {
    /**
     * \brief Validate a user-supplied key: surrounding whitespace is trimmed, blank keys are rejected.
     */
    pub fn from_input(api_key: &str) -> Result<Self, ChatError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(ChatError::InvalidInput("api_key must not be blank".into()));
        }
        Ok(CredentialConfig {
            api_key: api_key.to_string(),
        })
    }
}

/**
 * \brief One stored BYOK credential.
 * \details `provider` keeps the raw stored tag so the registry can skip tags it does not know.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialRecord {
    pub user_id: String,
    pub provider: String,
    pub config: CredentialConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(ChatError::InvalidInput(format!("unknown message role: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /** \brief Model identifier that produced the message (assistant messages only). */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/**
 * \brief A single turn of a thread.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /** \brief Unix epoch milliseconds. */
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    /**
     * \brief Fresh message with a generated `msgs-` id and the current timestamp.
     */
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Message {
            id: new_message_id(),
            role,
            content: content.into(),
            timestamp: now_millis(),
            metadata: MessageMetadata::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.metadata.model = Some(model.into());
        self
    }
}

/** \brief `msgs-` followed by 16 lowercase alphanumerics. */
pub fn new_message_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("msgs-{}", &raw[..16])
}

/** \brief Current wall clock as unix epoch milliseconds. */
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Space {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub prompt: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Thread {
    pub id: String,
    pub space_id: String,
    pub title: String,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/**
 * \brief Per-user profile fed into the system prompt.
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub user_id: String,
    pub name: String,
    pub profession: String,
    pub custom_instructions: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub thread_id: String,
    pub message_id: String,
    pub token_number: i64,
    pub created_at: i64,
}
