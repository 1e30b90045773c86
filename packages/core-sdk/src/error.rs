use thiserror::Error;

use crate::models::Provider;

/**
 * \brief Failures surfaced by the chat pipeline.
 * \details Store helpers return `anyhow::Result`; the pipeline wraps those as `Datastore`.
 */
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("provider {0} does not support embedding models")]
    EmbeddingUnsupported(Provider),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("datastore error: {0}")]
    Datastore(#[from] anyhow::Error),
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_not_found_mentions_identifier() {
        let e = ChatError::ModelNotFound("unknown:foo".into());
        assert_eq!(e.to_string(), "model not found: unknown:foo");
    }

    #[test]
    fn embedding_unsupported_names_provider() {
        let e = ChatError::EmbeddingUnsupported(Provider::OpenRouter);
        assert!(e.to_string().contains("openrouter"));
    }

    #[test]
    fn anyhow_converts_to_datastore() {
        let e: ChatError = anyhow::anyhow!("database is locked").into();
        assert!(matches!(e, ChatError::Datastore(_)));
        assert!(e.to_string().contains("database is locked"));
    }
}
