use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use rusqlite::Connection;
use threadspace_core_sdk::{
    chat::{self, ChatRequest},
    config::DefaultCredentials,
    db,
    error::ChatError,
    llm::{GenerationRequest, StreamEvent, TextGenerator, TextStream, Usage},
    models::{CredentialConfig, Provider, Role},
    registry::LanguageModel,
};

/// Replays a fixed reply and remembers every call.
struct Scripted {
    reply: Option<Vec<&'static str>>,
    calls: Mutex<Vec<(String, GenerationRequest)>>,
}

impl Scripted {
    fn replying(parts: Vec<&'static str>) -> Self {
        Scripted {
            reply: Some(parts),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Scripted {
            reply: None,
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TextGenerator for Scripted {
    async fn stream(
        &self,
        model: &LanguageModel,
        request: &GenerationRequest,
    ) -> anyhow::Result<TextStream> {
        self.calls
            .lock()
            .unwrap()
            .push((model.identifier(), request.clone()));
        let parts = self
            .reply
            .clone()
            .ok_or_else(|| anyhow!("upstream returned 503"))?;
        let mut events: Vec<anyhow::Result<StreamEvent>> = parts
            .into_iter()
            .map(|p| Ok(StreamEvent::Delta(p.to_string())))
            .collect();
        events.push(Ok(StreamEvent::Finish(Usage {
            prompt_tokens: 11,
            completion_tokens: 4,
        })));
        Ok(Box::pin(futures_util::stream::iter(events)))
    }
}

fn store() -> (tempfile::TempDir, Connection) {
    let dir = tempfile::tempdir().unwrap();
    let conn = db::open(dir.path().join("chat.db")).unwrap();
    db::migrate(&conn).unwrap();
    (dir, conn)
}

#[tokio::test]
async fn gemini_turn_with_space_prompt() {
    let (_dir, conn) = store();
    let space = db::create_space(&conn, "u1", Some("Notes"), Some("You are terse.")).unwrap();
    let thread = db::create_thread(&conn, "u1", &space.id, None).unwrap();

    let defaults = DefaultCredentials::default().with_key(Provider::Google, "env-google");
    let generator = Scripted::replying(vec!["Hello", "!"]);
    let request = ChatRequest {
        thread_id: thread.id.clone(),
        model: "google:gemini-1.5-flash".into(),
        content: "Hi".into(),
    };

    let outcome = chat::run_turn(&conn, &defaults, &generator, Some("u1"), &request, |_| {})
        .await
        .expect("turn succeeds");

    let calls = generator.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let (model, sent) = &calls[0];
    assert_eq!(model, "google:gemini-1.5-flash");
    assert!(sent
        .system
        .starts_with("You are a general assistant. The user might give you several roles"));
    assert!(sent
        .system
        .contains("<SPACE_PROMPT>You are terse.</SPACE_PROMPT>"));
    assert_eq!(sent.messages.len(), 1);
    assert_eq!(sent.messages[0].role, Role::User);
    assert_eq!(sent.messages[0].content, "Hi");

    let messages = db::load_messages(&conn, &thread.id).unwrap();
    let assistants: Vec<_> = messages.iter().filter(|m| m.role == Role::Assistant).collect();
    assert_eq!(assistants.len(), 1);
    assert_eq!(assistants[0].content, "Hello!");
    assert_eq!(
        assistants[0].metadata.model.as_deref(),
        Some("google:gemini-1.5-flash")
    );

    assert_eq!(outcome.usage.len(), 2);
    let usage_rows: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM usage WHERE thread_id=?1",
            [&thread.id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(usage_rows, 2);
}

#[tokio::test]
async fn failed_generation_keeps_user_message() {
    let (_dir, conn) = store();
    let space = db::create_space(&conn, "u1", None, None).unwrap();
    let thread = db::create_thread(&conn, "u1", &space.id, None).unwrap();
    let generator = Scripted::failing();
    let request = ChatRequest {
        thread_id: thread.id.clone(),
        model: "openai:gpt-4o".into(),
        content: "Are you there?".into(),
    };

    let err = chat::run_turn(
        &conn,
        &DefaultCredentials::default(),
        &generator,
        Some("u1"),
        &request,
        |_| {},
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ChatError::Generation(ref m) if m.contains("503")));

    let messages = db::load_messages(&conn, &thread.id).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "Are you there?");
}

#[tokio::test]
async fn byok_key_reaches_generation_boundary() {
    let (_dir, conn) = store();
    let space = db::create_space(&conn, "u1", None, None).unwrap();
    let thread = db::create_thread(&conn, "u1", &space.id, None).unwrap();
    db::add_user_key(
        &conn,
        "u1",
        Provider::OpenRouter,
        &CredentialConfig {
            api_key: "or-user".into(),
        },
    )
    .unwrap();

    let defaults = DefaultCredentials::default().with_key(Provider::OpenRouter, "or-env");
    let request = ChatRequest {
        thread_id: thread.id.clone(),
        model: "openrouter:qwen/qwen3-30b-a3b:free".into(),
        content: "Hi".into(),
    };
    let prepared = chat::prepare_turn(&conn, &defaults, Some("u1"), &request).unwrap();
    assert_eq!(prepared.model.model_id, "qwen/qwen3-30b-a3b:free");
    assert_eq!(prepared.model.client.api_key.as_deref(), Some("or-user"));

    let generator = Scripted::replying(vec!["ok"]);
    let generation = chat::generate(&generator, &prepared, |_| {}).await.unwrap();
    let outcome = chat::record_generation(&conn, &prepared, &generation).unwrap();
    assert_eq!(outcome.usage[0].message_id, prepared.user_message.id);
    assert_eq!(outcome.usage[0].token_number, 11);
    assert_eq!(outcome.usage[1].message_id, outcome.assistant_message.id);
    assert_eq!(outcome.usage[1].token_number, 4);
}

#[test]
fn byok_upsert_keeps_one_record() {
    let (_dir, conn) = store();
    for key in ["first", "second"] {
        db::add_user_key(
            &conn,
            "u1",
            Provider::Google,
            &CredentialConfig {
                api_key: key.into(),
            },
        )
        .unwrap();
    }
    let keys = db::get_user_keys(&conn, "u1").unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].provider, "google");
    assert_eq!(keys[0].config.api_key, "second");
}
