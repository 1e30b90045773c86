use std::path::PathBuf;

use crate::models::Provider;

pub const DEFAULT_DB_PATH: &str = "threadspace.db";
pub const DEFAULT_ADDR: &str = "127.0.0.1:5173";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/**
 * \brief Process-level fallback credentials and endpoints, one slot per provider.
 * \details Loaded once at the entrypoint and injected into the registry builder.
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultCredentials {
    pub openai: ProviderDefaults,
    pub anthropic: ProviderDefaults,
    pub google: ProviderDefaults,
    pub openrouter: ProviderDefaults,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderDefaults {
    pub api_key: Option<String>,
    /** \brief Overrides the vendor base URL (gateways, local mocks). */
    pub api_base: Option<String>,
}

impl DefaultCredentials {
    pub fn get(&self, provider: Provider) -> &ProviderDefaults {
        match provider {
            Provider::OpenAI => &self.openai,
            Provider::Anthropic => &self.anthropic,
            Provider::Google => &self.google,
            Provider::OpenRouter => &self.openrouter,
        }
    }

    pub fn get_mut(&mut self, provider: Provider) -> &mut ProviderDefaults {
        match provider {
            Provider::OpenAI => &mut self.openai,
            Provider::Anthropic => &mut self.anthropic,
            Provider::Google => &mut self.google,
            Provider::OpenRouter => &mut self.openrouter,
        }
    }

    /** \brief Convenience constructor used by tests and the CLI. */
    pub fn with_key(mut self, provider: Provider, api_key: &str) -> Self {
        self.get_mut(provider).api_key = Some(api_key.to_string());
        self
    }

    /**
     * \brief Read `<PROVIDER>_API_KEY` / `<PROVIDER>_BASE_URL` through the given lookup.
     */
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut defaults = DefaultCredentials::default();
        for provider in Provider::ALL {
            let prefix = env_prefix(provider);
            let slot = defaults.get_mut(provider);
            slot.api_key = lookup(&format!("{}_API_KEY", prefix)).filter(|v| !v.trim().is_empty());
            slot.api_base = lookup(&format!("{}_BASE_URL", prefix)).filter(|v| !v.trim().is_empty());
        }
        defaults
    }
}

fn env_prefix(provider: Provider) -> &'static str {
    match provider {
        Provider::OpenAI => "OPENAI",
        Provider::Anthropic => "ANTHROPIC",
        Provider::Google => "GOOGLE",
        Provider::OpenRouter => "OPENROUTER",
    }
}

/**
 * \brief Runtime settings for the server and CLI.
 */
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub addr: String,
    pub ui_dir: Option<PathBuf>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub defaults: DefaultCredentials,
}

impl AppConfig {
    /**
     * \brief Load `.env` (if present) and read settings from the process environment.
     */
    pub fn from_env() -> Self {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                eprintln!("ignoring unreadable .env: {}", err);
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        AppConfig {
            database_path: lookup("THREADSPACE_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            addr: lookup("THREADSPACE_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            ui_dir: lookup("THREADSPACE_UI_DIR").map(PathBuf::from),
            log_level: lookup("THREADSPACE_LOG").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            log_file: lookup("THREADSPACE_LOG_FILE").map(PathBuf::from),
            defaults: DefaultCredentials::from_lookup(&lookup),
        }
    }
}
