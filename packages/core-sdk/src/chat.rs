//! One chat turn: resolve credentials, locate the model, compose the system
//! prompt, persist the user message, generate, then record the reply.
//!
//! The turn is split so that no SQLite connection is held across the
//! generation await: `prepare_turn` and `record_generation` take a
//! connection, `generate` does not.

use futures_util::StreamExt;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
    config::DefaultCredentials,
    db,
    error::{ChatError, ChatResult},
    llm::{GenerationRequest, StreamEvent, TextGenerator, Usage},
    models::{Message, Role, Thread, UsageRecord},
    prompt::{title_prompt, SystemPrompt},
    registry::{resolve_user_keys, LanguageModel, ProviderRegistry},
};

/**
 * \brief A user message addressed to a thread with a chosen model.
 */
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRequest {
    pub thread_id: String,
    pub model: String,
    pub content: String,
}

/**
 * \brief Everything `generate` needs; the user message is already stored.
 */
#[derive(Debug, Clone)]
pub struct PreparedTurn {
    pub user_id: String,
    pub thread: Thread,
    pub model: LanguageModel,
    pub user_message: Message,
    pub request: GenerationRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub content: String,
    pub usage: Usage,
}

/**
 * \brief Result of a recorded turn.
 */
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub thread_id: String,
    pub user_message_id: String,
    pub assistant_message: Message,
    pub usage: Vec<UsageRecord>,
}

/**
 * \brief Steps up to and including the write-ahead of the user message.
 * \details Fails with `Unauthenticated` before any store or provider work.
 */
pub fn prepare_turn(
    conn: &Connection,
    defaults: &DefaultCredentials,
    user: Option<&str>,
    request: &ChatRequest,
) -> ChatResult<PreparedTurn> {
    let user_id = user.ok_or(ChatError::Unauthenticated)?;
    if request.content.trim().is_empty() {
        return Err(ChatError::InvalidInput("message content is empty".into()));
    }

    let thread = db::get_thread(conn, &request.thread_id)?
        .filter(|t| t.user_id == user_id)
        .ok_or_else(|| ChatError::NotFound(format!("thread {}", request.thread_id)))?;
    let space = db::get_space(conn, user_id, &thread.space_id)?;
    let prefs = db::get_preferences(conn, user_id)?;

    let keys = resolve_user_keys(conn, Some(user_id))?;
    let registry = ProviderRegistry::for_user(defaults, &keys);
    let model = registry.language_model(&request.model)?;

    let user_message = Message::new(Role::User, request.content.clone());
    db::insert_message(conn, &thread.id, &user_message)?;

    let messages = db::load_messages(conn, &thread.id)?;
    let system = SystemPrompt::from_records(space.as_ref(), prefs.as_ref()).compose();

    info!(
        user_id,
        thread_id = %thread.id,
        model = %model.identifier(),
        history = messages.len(),
        "chat turn prepared"
    );

    Ok(PreparedTurn {
        user_id: user_id.to_string(),
        thread,
        model,
        user_message,
        request: GenerationRequest { system, messages },
    })
}

/**
 * \brief Drive the generator to completion, forwarding each delta.
 * \details Failures are logged and surfaced as `Generation`; nothing is rolled back.
 */
pub async fn generate<F>(
    generator: &dyn TextGenerator,
    prepared: &PreparedTurn,
    mut on_delta: F,
) -> ChatResult<Generation>
where
    F: FnMut(&str) + Send,
{
    let fail = |e: anyhow::Error| {
        error!(
            thread_id = %prepared.thread.id,
            model = %prepared.model.identifier(),
            error = %e,
            "generation failed"
        );
        ChatError::Generation(e.to_string())
    };

    let mut stream = generator
        .stream(&prepared.model, &prepared.request)
        .await
        .map_err(fail)?;

    let mut content = String::new();
    let mut usage = None;
    while let Some(event) = stream.next().await {
        match event.map_err(fail)? {
            StreamEvent::Delta(delta) => {
                on_delta(&delta);
                content.push_str(&delta);
            }
            StreamEvent::Finish(u) => {
                usage = Some(u);
                break;
            }
        }
    }

    let usage = usage.ok_or_else(|| fail(anyhow::anyhow!("stream ended without finish event")))?;
    Ok(Generation { content, usage })
}

/**
 * \brief Append the assistant reply and its two usage rows.
 */
pub fn record_generation(
    conn: &Connection,
    prepared: &PreparedTurn,
    generation: &Generation,
) -> ChatResult<TurnOutcome> {
    let thread_id = &prepared.thread.id;
    let assistant = Message::new(Role::Assistant, generation.content.clone())
        .with_model(prepared.model.identifier());
    db::insert_message(conn, thread_id, &assistant)?;

    let prompt = db::record_message_token_usage(
        conn,
        thread_id,
        &prepared.user_message.id,
        generation.usage.prompt_tokens,
    )?;
    let completion = db::record_message_token_usage(
        conn,
        thread_id,
        &assistant.id,
        generation.usage.completion_tokens,
    )?;

    info!(
        thread_id = %thread_id,
        assistant_id = %assistant.id,
        prompt_tokens = generation.usage.prompt_tokens,
        completion_tokens = generation.usage.completion_tokens,
        "chat turn recorded"
    );

    Ok(TurnOutcome {
        thread_id: thread_id.clone(),
        user_message_id: prepared.user_message.id.clone(),
        assistant_message: assistant,
        usage: vec![prompt, completion],
    })
}

/**
 * \brief Whole turn on one connection, for callers that are not spawning.
 */
pub async fn run_turn<F>(
    conn: &Connection,
    defaults: &DefaultCredentials,
    generator: &dyn TextGenerator,
    user: Option<&str>,
    request: &ChatRequest,
    on_delta: F,
) -> ChatResult<TurnOutcome>
where
    F: FnMut(&str) + Send,
{
    let prepared = prepare_turn(conn, defaults, user, request)?;
    let generation = generate(generator, &prepared, on_delta).await?;
    record_generation(conn, &prepared, &generation)
}

/**
 * \brief Ask the model for a short title describing `conversation`.
 */
pub async fn generate_title(
    generator: &dyn TextGenerator,
    model: &LanguageModel,
    conversation: &str,
) -> ChatResult<String> {
    let request = GenerationRequest {
        system: String::new(),
        messages: vec![Message::new(Role::User, title_prompt(conversation))],
    };
    let mut stream = generator
        .stream(model, &request)
        .await
        .map_err(|e| ChatError::Generation(e.to_string()))?;

    let mut raw = String::new();
    while let Some(event) = stream.next().await {
        match event.map_err(|e| ChatError::Generation(e.to_string()))? {
            StreamEvent::Delta(delta) => raw.push_str(&delta),
            StreamEvent::Finish(_) => break,
        }
    }
    Ok(clean_title(&raw))
}

fn clean_title(raw: &str) -> String {
    let line = raw.trim().lines().next().unwrap_or_default();
    let line = line.strip_prefix("Title:").unwrap_or(line);
    line.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '*')
        .trim()
        .to_string()
}
