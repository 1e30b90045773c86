use std::{convert::Infallible, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, get_service, post},
    Json, Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::{
    catalog,
    chat::{self, ChatRequest},
    config::AppConfig,
    db,
    error::ChatError,
    llm::{Embedder, HttpGenerator, TextGenerator},
    models::{CredentialConfig, Preferences, Provider},
    registry::{resolve_user_keys, ProviderRegistry},
};

/** \brief Header carrying the authenticated user id, set by the upstream auth proxy. */
pub const USER_HEADER: &str = "x-user-id";

/**
 * \brief Shared handler state. Each request opens its own SQLite connection.
 */
#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    generator: Arc<dyn TextGenerator>,
    embedder: Arc<dyn Embedder>,
}

impl AppState {
    pub fn new(config: AppConfig, generator: Arc<dyn TextGenerator>) -> Self {
        AppState {
            config: Arc::new(config),
            generator,
            embedder: Arc::new(HttpGenerator::new()),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    fn conn(&self) -> ApiResult<Connection> {
        Ok(db::open(&self.config.database_path)?)
    }
}

/**
 * \brief Start the HTTP server: API routes plus the optional static UI.
 */
pub async fn run(config: AppConfig) -> Result<()> {
    let conn = db::open(&config.database_path)?;
    db::migrate(&conn)?;
    drop(conn);

    let addr = config.addr.clone();
    let ui_dir = config.ui_dir.clone();
    let state = AppState::new(config, Arc::new(HttpGenerator::new()));

    let mut app = router(state);
    match ui_dir {
        Some(dir) if dir.exists() => {
            info!(ui_dir = %dir.display(), "serving static ui");
            let static_handler = ServeDir::new(dir).append_index_html_on_directories(true);
            app = app.fallback_service(get_service(static_handler));
        }
        Some(dir) => warn!(ui_dir = %dir.display(), "ui directory missing, serving api only"),
        None => {}
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief API routes without the static fallback.
 */
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/spaces", get(list_spaces).post(create_space))
        .route(
            "/api/spaces/{id}",
            get(get_space).put(update_space).delete(remove_space),
        )
        .route(
            "/api/spaces/{id}/threads",
            get(list_space_threads).post(create_thread),
        )
        .route("/api/threads", get(list_threads))
        .route(
            "/api/threads/{id}",
            get(get_thread).put(rename_thread).delete(remove_thread),
        )
        .route("/api/profile", get(get_profile).put(put_profile))
        .route("/api/byok", get(list_keys).put(put_key))
        .route("/api/byok/{provider}", delete(remove_key))
        .route("/api/models", get(list_models))
        .route("/api/usage", get(get_usage))
        .route("/api/chat", post(chat_sse))
        .route("/api/generate-title", post(generate_title))
        .route("/api/embeddings", post(embeddings))
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError(pub ChatError);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        ApiError(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError(ChatError::Datastore(e))
    }
}

pub fn status_for(err: &ChatError) -> StatusCode {
    match err {
        ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
        ChatError::ModelNotFound(_) | ChatError::NotFound(_) => StatusCode::NOT_FOUND,
        ChatError::InvalidInput(_)
        | ChatError::UnknownProvider(_)
        | ChatError::EmbeddingUnsupported(_) => StatusCode::BAD_REQUEST,
        ChatError::Generation(_) => StatusCode::BAD_GATEWAY,
        ChatError::Datastore(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn header_user(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/**
 * \brief Authenticated user; rejects with 401 when the header is absent.
 */
pub struct AuthUser(pub String);

impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> ApiResult<Self> {
        header_user(parts)
            .map(AuthUser)
            .ok_or(ApiError(ChatError::Unauthenticated))
    }
}

/** \brief Identity as seen by the chat pipeline, which does its own check. */
pub struct MaybeUser(pub Option<String>);

impl<S: Send + Sync> FromRequestParts<S> for MaybeUser {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Infallible> {
        Ok(MaybeUser(header_user(parts)))
    }
}

#[derive(Deserialize, Debug, Default)]
struct SpaceInput {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ThreadInput {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RenameThreadRequest {
    title: String,
}

#[derive(Deserialize, Debug, Default)]
struct ProfileInput {
    #[serde(default)]
    name: String,
    #[serde(default)]
    profession: String,
    #[serde(default)]
    custom_instructions: String,
}

#[derive(Deserialize, Debug)]
struct KeyInput {
    provider: String,
    api_key: String,
}

#[derive(Serialize, Debug)]
struct KeyItem {
    provider: String,
    api_key: String,
}

#[derive(Deserialize, Debug)]
struct UsageQuery {
    thread_id: String,
    message_id: String,
}

#[derive(Deserialize, Debug)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct TitleRequest {
    model: String,
    text: String,
    #[serde(default)]
    thread_id: Option<String>,
}

async fn health_check() -> Json<Value> {
    Json(json!({ "ok": true, "version": env!("CARGO_PKG_VERSION") }))
}

async fn list_spaces(State(state): State<AppState>, AuthUser(user): AuthUser) -> ApiResult<Json<Value>> {
    let conn = state.conn()?;
    let spaces = db::list_spaces(&conn, &user)?;
    Ok(Json(json!({ "spaces": spaces })))
}

async fn create_space(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(input): Json<SpaceInput>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let conn = state.conn()?;
    let space = db::create_space(&conn, &user, input.name.as_deref(), input.prompt.as_deref())?;
    info!(user_id = %user, space_id = %space.id, "space created");
    Ok((StatusCode::CREATED, Json(json!(space))))
}

async fn get_space(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let conn = state.conn()?;
    let space = db::get_space(&conn, &user, &id)?
        .ok_or_else(|| ChatError::NotFound(format!("space {}", id)))?;
    Ok(Json(json!(space)))
}

async fn update_space(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(input): Json<SpaceInput>,
) -> ApiResult<Json<Value>> {
    let conn = state.conn()?;
    let existing = db::get_space(&conn, &user, &id)?
        .ok_or_else(|| ChatError::NotFound(format!("space {}", id)))?;
    let name = input
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(existing.name);
    let space = db::update_space(&conn, &user, &id, &name, input.prompt.as_deref())?;
    Ok(Json(json!(space)))
}

async fn remove_space(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let conn = state.conn()?;
    if !db::delete_space(&conn, &user, &id)? {
        return Err(ChatError::NotFound(format!("space {}", id)).into());
    }
    info!(user_id = %user, space_id = %id, "space deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_space_threads(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let conn = state.conn()?;
    if db::get_space(&conn, &user, &id)?.is_none() {
        return Err(ChatError::NotFound(format!("space {}", id)).into());
    }
    let threads = db::list_threads_by_space(&conn, &id)?;
    Ok(Json(json!({ "threads": threads })))
}

async fn create_thread(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(input): Json<ThreadInput>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let conn = state.conn()?;
    if db::get_space(&conn, &user, &id)?.is_none() {
        return Err(ChatError::NotFound(format!("space {}", id)).into());
    }
    let thread = db::create_thread(&conn, &user, &id, input.title.as_deref())?;
    Ok((StatusCode::CREATED, Json(json!(thread))))
}

async fn list_threads(State(state): State<AppState>, AuthUser(user): AuthUser) -> ApiResult<Json<Value>> {
    let conn = state.conn()?;
    let threads = db::list_threads(&conn, &user)?;
    Ok(Json(json!({ "threads": threads })))
}

fn owned_thread(conn: &Connection, user: &str, id: &str) -> ApiResult<crate::models::Thread> {
    db::get_thread(conn, id)?
        .filter(|t| t.user_id == user)
        .ok_or_else(|| ChatError::NotFound(format!("thread {}", id)).into())
}

async fn get_thread(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let conn = state.conn()?;
    let thread = owned_thread(&conn, &user, &id)?;
    let messages = db::load_messages(&conn, &id)?;
    Ok(Json(json!({ "thread": thread, "messages": messages })))
}

async fn rename_thread(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(req): Json<RenameThreadRequest>,
) -> ApiResult<Json<Value>> {
    let title = req.title.trim();
    if title.is_empty() {
        return Err(ChatError::InvalidInput("title must not be empty".into()).into());
    }
    let conn = state.conn()?;
    owned_thread(&conn, &user, &id)?;
    db::update_thread_title(&conn, &id, title)?;
    Ok(Json(json!({ "id": id, "title": title })))
}

async fn remove_thread(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let conn = state.conn()?;
    let thread = owned_thread(&conn, &user, &id)?;
    db::delete_thread(&conn, &thread.id, &thread.space_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_profile(State(state): State<AppState>, AuthUser(user): AuthUser) -> ApiResult<Json<Preferences>> {
    let conn = state.conn()?;
    let prefs = db::get_preferences(&conn, &user)?.unwrap_or_else(|| Preferences {
        user_id: user.clone(),
        ..Default::default()
    });
    Ok(Json(prefs))
}

async fn put_profile(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(input): Json<ProfileInput>,
) -> ApiResult<Json<Preferences>> {
    let conn = state.conn()?;
    let prefs = Preferences {
        user_id: user,
        name: input.name,
        profession: input.profession,
        custom_instructions: input.custom_instructions,
    };
    db::upsert_preferences(&conn, &prefs)?;
    Ok(Json(prefs))
}

fn mask_key(key: &str) -> String {
    let tail: String = key.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    if key.chars().count() <= 8 {
        "****".to_string()
    } else {
        format!("****{}", tail)
    }
}

async fn list_keys(State(state): State<AppState>, AuthUser(user): AuthUser) -> ApiResult<Json<Value>> {
    let conn = state.conn()?;
    let keys: Vec<KeyItem> = resolve_user_keys(&conn, Some(user.as_str()))?
        .into_iter()
        .map(|r| KeyItem {
            provider: r.provider,
            api_key: mask_key(&r.config.api_key),
        })
        .collect();
    Ok(Json(json!({ "keys": keys })))
}

async fn put_key(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(input): Json<KeyInput>,
) -> ApiResult<StatusCode> {
    let provider: Provider = input.provider.parse()?;
    let config = CredentialConfig::from_input(&input.api_key)?;
    let conn = state.conn()?;
    db::add_user_key(&conn, &user, provider, &config)?;
    info!(user_id = %user, %provider, "byok key stored");
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_key(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(provider): Path<String>,
) -> ApiResult<StatusCode> {
    let provider: Provider = provider.parse()?;
    let conn = state.conn()?;
    if !db::delete_user_key(&conn, &user, provider)? {
        return Err(ChatError::NotFound(format!("key for {}", provider)).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_models(State(state): State<AppState>, AuthUser(user): AuthUser) -> ApiResult<Json<Value>> {
    let conn = state.conn()?;
    let keys = resolve_user_keys(&conn, Some(user.as_str()))?;
    let registry = ProviderRegistry::for_user(&state.config.defaults, &keys);
    let models: Vec<Value> = catalog::available_models(&registry)
        .into_iter()
        .map(|m| {
            json!({
                "identifier": m.identifier(),
                "provider": m.provider,
                "id": m.id,
                "name": m.name,
            })
        })
        .collect();
    Ok(Json(json!({ "models": models })))
}

async fn get_usage(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(q): Query<UsageQuery>,
) -> ApiResult<Json<Value>> {
    let conn = state.conn()?;
    owned_thread(&conn, &user, &q.thread_id)?;
    let usage = db::get_usage(&conn, &q.thread_id, &q.message_id)?
        .ok_or_else(|| ChatError::NotFound(format!("usage for message {}", q.message_id)))?;
    Ok(Json(json!(usage)))
}

/**
 * \brief Chat turn as SSE: `meta`, unnamed delta events, then `finish` or `error`.
 * \details Generation and the final write run in a spawned task so the reply is
 *          stored even if the client goes away.
 */
async fn chat_sse(
    State(state): State<AppState>,
    MaybeUser(user): MaybeUser,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Sse<impl tokio_stream::Stream<Item = std::result::Result<Event, Infallible>>>> {
    let prepared = {
        let conn = state.conn()?;
        chat::prepare_turn(&conn, &state.config.defaults, user.as_deref(), &req)?
    };

    let (tx, rx) = mpsc::unbounded_channel::<std::result::Result<Event, Infallible>>();
    let _ = tx.send(Ok(Event::default().event("meta").data(
        json!({
            "thread_id": prepared.thread.id,
            "user_message_id": prepared.user_message.id,
            "model": prepared.model.identifier(),
        })
        .to_string(),
    )));

    let generator = state.generator.clone();
    let db_path = state.config.database_path.clone();
    tokio::spawn(async move {
        let delta_tx = tx.clone();
        let result = chat::generate(generator.as_ref(), &prepared, move |delta| {
            let _ = delta_tx.send(Ok(Event::default().data(delta)));
        })
        .await;

        let generation = match result {
            Ok(g) => g,
            Err(e) => {
                let _ = tx.send(Ok(Event::default().event("error").data(e.to_string())));
                return;
            }
        };

        let recorded = db::open(&db_path)
            .map_err(ChatError::from)
            .and_then(|conn| chat::record_generation(&conn, &prepared, &generation));
        match recorded {
            Ok(outcome) => {
                let _ = tx.send(Ok(Event::default().event("finish").data(
                    json!({
                        "assistant_message_id": outcome.assistant_message.id,
                        "usage": {
                            "prompt_tokens": generation.usage.prompt_tokens,
                            "completion_tokens": generation.usage.completion_tokens,
                        }
                    })
                    .to_string(),
                )));
            }
            Err(e) => {
                error!(thread_id = %prepared.thread.id, error = %e, "failed to store assistant reply");
                let _ = tx.send(Ok(Event::default().event("error").data(e.to_string())));
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
}

async fn generate_title(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<TitleRequest>,
) -> ApiResult<Json<Value>> {
    let model = {
        let conn = state.conn()?;
        if let Some(thread_id) = req.thread_id.as_deref() {
            owned_thread(&conn, &user, thread_id)?;
        }
        let keys = resolve_user_keys(&conn, Some(user.as_str()))?;
        ProviderRegistry::for_user(&state.config.defaults, &keys).language_model(&req.model)?
    };

    let title = chat::generate_title(state.generator.as_ref(), &model, &req.text).await?;

    if let Some(thread_id) = req.thread_id.as_deref() {
        if !title.is_empty() {
            let conn = state.conn()?;
            db::update_thread_title(&conn, thread_id, &title)?;
        }
    }
    Ok(Json(json!({ "title": title })))
}

/**
 * \brief Embed `input` with `provider:modelId`; chat-only vendors are refused with 400.
 */
async fn embeddings(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<EmbedRequest>,
) -> ApiResult<Json<Value>> {
    if req.input.is_empty() {
        return Err(ChatError::InvalidInput("input must not be empty".into()).into());
    }
    let model = {
        let conn = state.conn()?;
        let keys = resolve_user_keys(&conn, Some(user.as_str()))?;
        ProviderRegistry::for_user(&state.config.defaults, &keys).embedding_model(&req.model)?
    };

    let vectors = state
        .embedder
        .embed(&model, &req.input)
        .await
        .map_err(|e| {
            error!(model = %req.model, error = %e, "embedding failed");
            ChatError::Generation(e.to_string())
        })?;
    Ok(Json(json!({ "model": req.model, "embeddings": vectors })))
}
