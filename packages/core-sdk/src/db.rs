use anyhow::{anyhow, bail, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::{path::Path, thread, time::Duration};
use uuid::Uuid;

use crate::models::{
    now_millis, CredentialConfig, CredentialRecord, Message, MessageMetadata, Preferences,
    Provider, Space, Thread, UsageRecord,
};

pub const DEFAULT_SPACE_NAME: &str = "Default Space";
pub const DEFAULT_THREAD_TITLE: &str = "New Thread";

/**
 * \brief Open the SQLite file at `path` with foreign keys enforced.
 */
pub fn open(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

/**
 * \brief Create the tables used by the chat store (idempotent).
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS spaces (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT 'Default Space',
            prompt TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS space_user_idx ON spaces(user_id);

        CREATE TABLE IF NOT EXISTS threads (
            id TEXT PRIMARY KEY,
            space_id TEXT NOT NULL REFERENCES spaces(id) ON DELETE CASCADE,
            title TEXT NOT NULL DEFAULT 'New Thread',
            user_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS thread_user_idx ON threads(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            model TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS preferences (
            user_id TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            profession TEXT NOT NULL DEFAULT '',
            custom_instructions TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS byok (
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            config TEXT NOT NULL,
            PRIMARY KEY (user_id, provider)
        );

        CREATE TABLE IF NOT EXISTS usage (
            thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            message_id TEXT NOT NULL,
            token_number INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS usage_thread_message_idx ON usage(thread_id, message_id);
        "#,
        )
    })?;
    Ok(())
}

fn map_space(row: &Row<'_>) -> rusqlite::Result<Space> {
    Ok(Space {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        prompt: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn map_thread(row: &Row<'_>) -> rusqlite::Result<Thread> {
    Ok(Thread {
        id: row.get(0)?,
        space_id: row.get(1)?,
        title: row.get(2)?,
        user_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/**
 * \brief Create a space owned by `user_id`.
 */
pub fn create_space(
    conn: &Connection,
    user_id: &str,
    name: Option<&str>,
    prompt: Option<&str>,
) -> Result<Space> {
    let now = now_millis();
    let space = Space {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        name: name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(DEFAULT_SPACE_NAME)
            .to_string(),
        prompt: prompt.unwrap_or_default().to_string(),
        created_at: now,
        updated_at: now,
    };
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO spaces (id, user_id, name, prompt, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![space.id, space.user_id, space.name, space.prompt, now, now],
        )
    })?;
    Ok(space)
}

/**
 * \brief Fetch a space only if it belongs to `user_id`.
 */
pub fn get_space(conn: &Connection, user_id: &str, space_id: &str) -> Result<Option<Space>> {
    conn.query_row(
        "SELECT id, user_id, name, prompt, created_at, updated_at FROM spaces WHERE id=?1 AND user_id=?2",
        params![space_id, user_id],
        map_space,
    )
    .optional()
    .map_err(Into::into)
}

pub fn list_spaces(conn: &Connection, user_id: &str) -> Result<Vec<Space>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, name, prompt, created_at, updated_at FROM spaces WHERE user_id=?1 ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt
        .query_map(params![user_id], map_space)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief Rename a space and optionally replace its prompt.
 */
pub fn update_space(
    conn: &Connection,
    user_id: &str,
    space_id: &str,
    name: &str,
    prompt: Option<&str>,
) -> Result<Space> {
    let now = now_millis();
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE spaces SET name=?1, prompt=COALESCE(?2, prompt), updated_at=?3 WHERE id=?4 AND user_id=?5",
            params![name, prompt, now, space_id, user_id],
        )
    })?;
    if rows == 0 {
        bail!("space {} not found", space_id);
    }
    get_space(conn, user_id, space_id)?.ok_or_else(|| anyhow!("space {} not found", space_id))
}

/**
 * \brief Delete a space owned by `user_id`; its threads, messages and usage cascade.
 */
pub fn delete_space(conn: &Connection, user_id: &str, space_id: &str) -> Result<bool> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "DELETE FROM spaces WHERE id=?1 AND user_id=?2",
            params![space_id, user_id],
        )
    })?;
    Ok(rows > 0)
}

/**
 * \brief Create an empty thread inside a space owned by `user_id`.
 */
pub fn create_thread(
    conn: &Connection,
    user_id: &str,
    space_id: &str,
    title: Option<&str>,
) -> Result<Thread> {
    if get_space(conn, user_id, space_id)?.is_none() {
        bail!("space {} not found", space_id);
    }
    let now = now_millis();
    let thread = Thread {
        id: Uuid::new_v4().to_string(),
        space_id: space_id.to_string(),
        title: title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(DEFAULT_THREAD_TITLE)
            .to_string(),
        user_id: user_id.to_string(),
        created_at: now,
        updated_at: now,
    };
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO threads (id, space_id, title, user_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![thread.id, thread.space_id, thread.title, thread.user_id, now, now],
        )
    })?;
    Ok(thread)
}

pub fn get_thread(conn: &Connection, thread_id: &str) -> Result<Option<Thread>> {
    conn.query_row(
        "SELECT id, space_id, title, user_id, created_at, updated_at FROM threads WHERE id=?1",
        params![thread_id],
        map_thread,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief Threads of a space, most recently updated first.
 */
pub fn list_threads_by_space(conn: &Connection, space_id: &str) -> Result<Vec<Thread>> {
    let mut stmt = conn.prepare(
        "SELECT id, space_id, title, user_id, created_at, updated_at FROM threads WHERE space_id=?1 ORDER BY updated_at DESC, rowid DESC",
    )?;
    let rows = stmt
        .query_map(params![space_id], map_thread)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief All threads of a user across spaces, most recently updated first.
 */
pub fn list_threads(conn: &Connection, user_id: &str) -> Result<Vec<Thread>> {
    let mut stmt = conn.prepare(
        "SELECT id, space_id, title, user_id, created_at, updated_at FROM threads WHERE user_id=?1 ORDER BY updated_at DESC, rowid DESC",
    )?;
    let rows = stmt
        .query_map(params![user_id], map_thread)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn update_thread_title(conn: &Connection, thread_id: &str, title: &str) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE threads SET title=?1, updated_at=?2 WHERE id=?3",
            params![title, now_millis(), thread_id],
        )
    })?;
    if rows == 0 {
        bail!("thread {} not found", thread_id);
    }
    Ok(())
}

/**
 * \brief Delete a thread (messages and usage cascade). Returns false when nothing matched.
 */
pub fn delete_thread(conn: &Connection, thread_id: &str, space_id: &str) -> Result<bool> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "DELETE FROM threads WHERE id=?1 AND space_id=?2",
            params![thread_id, space_id],
        )
    })?;
    Ok(rows > 0)
}

/**
 * \brief Append a message to a thread and bump the thread's `updated_at`.
 */
pub fn insert_message(conn: &Connection, thread_id: &str, message: &Message) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO messages (id, thread_id, role, content, model, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id,
                thread_id,
                message.role.as_str(),
                message.content,
                message.metadata.model,
                message.timestamp
            ],
        )
    })?;
    retry_on_locked(|| {
        conn.execute(
            "UPDATE threads SET updated_at=?1 WHERE id=?2",
            params![now_millis(), thread_id],
        )
    })?;
    Ok(())
}

/**
 * \brief Messages of a thread in insertion order.
 */
pub fn load_messages(conn: &Connection, thread_id: &str) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT id, role, content, model, created_at FROM messages WHERE thread_id=?1 ORDER BY seq ASC",
    )?;
    let rows = stmt
        .query_map(params![thread_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, role, content, model, timestamp)| -> Result<Message> {
            Ok(Message {
                id,
                role: role.parse()?,
                content,
                timestamp,
                metadata: MessageMetadata { model },
            })
        })
        .collect()
}

pub fn get_preferences(conn: &Connection, user_id: &str) -> Result<Option<Preferences>> {
    conn.query_row(
        "SELECT user_id, name, profession, custom_instructions FROM preferences WHERE user_id=?1",
        params![user_id],
        |row| {
            Ok(Preferences {
                user_id: row.get(0)?,
                name: row.get(1)?,
                profession: row.get(2)?,
                custom_instructions: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief Insert or replace the profile of `prefs.user_id`.
 */
pub fn upsert_preferences(conn: &Connection, prefs: &Preferences) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO preferences (user_id, name, profession, custom_instructions) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id) DO UPDATE SET name=excluded.name, profession=excluded.profession, custom_instructions=excluded.custom_instructions",
            params![
                prefs.user_id,
                prefs.name,
                prefs.profession,
                prefs.custom_instructions
            ],
        )
    })?;
    Ok(())
}

/**
 * \brief All BYOK credentials stored for a user (possibly empty).
 */
pub fn get_user_keys(conn: &Connection, user_id: &str) -> Result<Vec<CredentialRecord>> {
    let mut stmt = conn
        .prepare("SELECT user_id, provider, config FROM byok WHERE user_id=?1 ORDER BY provider ASC")?;
    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(user_id, provider, config)| -> Result<CredentialRecord> {
            let config: CredentialConfig = serde_json::from_str(&config)
                .map_err(|e| anyhow!("corrupt byok config for {}/{}: {}", user_id, provider, e))?;
            Ok(CredentialRecord {
                user_id,
                provider,
                config,
            })
        })
        .collect()
}

/**
 * \brief Store a BYOK credential; a second write for the same provider replaces the first.
 */
pub fn add_user_key(
    conn: &Connection,
    user_id: &str,
    provider: Provider,
    config: &CredentialConfig,
) -> Result<()> {
    let payload = serde_json::to_string(config)?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO byok (user_id, provider, config) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id, provider) DO UPDATE SET config=excluded.config",
            params![user_id, provider.as_str(), payload],
        )
    })?;
    Ok(())
}

pub fn delete_user_key(conn: &Connection, user_id: &str, provider: Provider) -> Result<bool> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "DELETE FROM byok WHERE user_id=?1 AND provider=?2",
            params![user_id, provider.as_str()],
        )
    })?;
    Ok(rows > 0)
}

/**
 * \brief Record a token count against one message of a thread.
 */
pub fn record_message_token_usage(
    conn: &Connection,
    thread_id: &str,
    message_id: &str,
    token_number: i64,
) -> Result<UsageRecord> {
    let record = UsageRecord {
        thread_id: thread_id.to_string(),
        message_id: message_id.to_string(),
        token_number,
        created_at: now_millis(),
    };
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO usage (thread_id, message_id, token_number, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.thread_id,
                record.message_id,
                record.token_number,
                record.created_at
            ],
        )
    })?;
    Ok(record)
}

pub fn get_usage(conn: &Connection, thread_id: &str, message_id: &str) -> Result<Option<UsageRecord>> {
    conn.query_row(
        "SELECT thread_id, message_id, token_number, created_at FROM usage WHERE thread_id=?1 AND message_id=?2 ORDER BY rowid ASC LIMIT 1",
        params![thread_id, message_id],
        |row| {
            Ok(UsageRecord {
                thread_id: row.get(0)?,
                message_id: row.get(1)?,
                token_number: row.get(2)?,
                created_at: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief Retry helper for SQLite lock contention.
 * \details Retries `database is locked` / `database table is locked` with linear backoff, at most 6 attempts.
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .expect("enable foreign keys");
        migrate(&conn).expect("migrate");
        conn
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = mem_conn();
        migrate(&conn).expect("second migrate");
    }

    #[test]
    fn test_space_crud_scoped_to_owner() {
        let conn = mem_conn();
        let space = create_space(&conn, "u1", None, None).expect("create space");
        assert_eq!(space.name, DEFAULT_SPACE_NAME);
        assert_eq!(space.prompt, "");

        assert!(get_space(&conn, "u2", &space.id).expect("get").is_none());

        let updated = update_space(&conn, "u1", &space.id, "Work", Some("Be terse"))
            .expect("update space");
        assert_eq!(updated.name, "Work");
        assert_eq!(updated.prompt, "Be terse");

        let renamed = update_space(&conn, "u1", &space.id, "Work 2", None).expect("rename");
        assert_eq!(renamed.prompt, "Be terse");

        assert!(update_space(&conn, "u2", &space.id, "stolen", None).is_err());

        create_space(&conn, "u1", Some("Second"), None).expect("create second");
        let spaces = list_spaces(&conn, "u1").expect("list spaces");
        assert_eq!(spaces.len(), 2);
        assert_eq!(spaces[0].id, space.id);
    }

    #[test]
    fn test_thread_and_messages() {
        let conn = mem_conn();
        let space = create_space(&conn, "u1", Some("s"), None).expect("create space");
        let thread = create_thread(&conn, "u1", &space.id, None).expect("create thread");
        assert_eq!(thread.title, DEFAULT_THREAD_TITLE);

        let hello = Message::new(Role::User, "hello");
        let reply = Message::new(Role::Assistant, "hi").with_model("openai:gpt-4o");
        insert_message(&conn, &thread.id, &hello).expect("insert msg");
        insert_message(&conn, &thread.id, &reply).expect("insert msg");

        let msgs = load_messages(&conn, &thread.id).expect("load msgs");
        assert_eq!(msgs, vec![hello, reply]);

        update_thread_title(&conn, &thread.id, "Greetings").expect("rename");
        let loaded = get_thread(&conn, &thread.id).expect("get").expect("exists");
        assert_eq!(loaded.title, "Greetings");

        assert_eq!(list_threads_by_space(&conn, &space.id).expect("list").len(), 1);
        assert_eq!(list_threads(&conn, "u1").expect("list").len(), 1);
        assert!(list_threads(&conn, "u2").expect("list").is_empty());
    }

    #[test]
    fn test_create_thread_in_foreign_space_fails() {
        let conn = mem_conn();
        let space = create_space(&conn, "u1", None, None).expect("create space");
        assert!(create_thread(&conn, "u2", &space.id, None).is_err());
    }

    #[test]
    fn test_delete_thread_cascades() {
        let conn = mem_conn();
        let space = create_space(&conn, "u1", None, None).expect("create space");
        let thread = create_thread(&conn, "u1", &space.id, None).expect("create thread");
        let msg = Message::new(Role::User, "hello");
        insert_message(&conn, &thread.id, &msg).expect("insert");
        record_message_token_usage(&conn, &thread.id, &msg.id, 12).expect("usage");

        assert!(!delete_thread(&conn, &thread.id, "other-space").expect("noop delete"));
        assert!(delete_thread(&conn, &thread.id, &space.id).expect("delete"));

        assert!(get_thread(&conn, &thread.id).expect("get").is_none());
        assert!(load_messages(&conn, &thread.id).expect("load").is_empty());
        assert!(get_usage(&conn, &thread.id, &msg.id).expect("usage").is_none());
    }

    #[test]
    fn test_delete_space_cascades_to_threads() {
        let conn = mem_conn();
        let space = create_space(&conn, "u1", None, None).expect("create space");
        let thread = create_thread(&conn, "u1", &space.id, None).expect("create thread");
        let msg = Message::new(Role::User, "hello");
        insert_message(&conn, &thread.id, &msg).expect("insert");
        record_message_token_usage(&conn, &thread.id, &msg.id, 3).expect("usage");

        assert!(!delete_space(&conn, "u2", &space.id).expect("foreign delete"));
        assert!(get_space(&conn, "u1", &space.id).expect("get").is_some());

        assert!(delete_space(&conn, "u1", &space.id).expect("delete"));
        assert!(get_space(&conn, "u1", &space.id).expect("get").is_none());
        assert!(get_thread(&conn, &thread.id).expect("get").is_none());
        assert!(load_messages(&conn, &thread.id).expect("load").is_empty());
        assert!(get_usage(&conn, &thread.id, &msg.id).expect("usage").is_none());
    }

    #[test]
    fn test_preferences_upsert() {
        let conn = mem_conn();
        assert!(get_preferences(&conn, "u1").expect("get").is_none());
        let mut prefs = Preferences {
            user_id: "u1".into(),
            name: "Ann".into(),
            ..Default::default()
        };
        upsert_preferences(&conn, &prefs).expect("insert");
        prefs.profession = "Engineer".into();
        upsert_preferences(&conn, &prefs).expect("update");
        let loaded = get_preferences(&conn, "u1").expect("get").expect("exists");
        assert_eq!(loaded, prefs);
    }

    #[test]
    fn test_add_user_key_upserts_single_record() {
        let conn = mem_conn();
        assert!(get_user_keys(&conn, "u1").expect("empty").is_empty());

        add_user_key(
            &conn,
            "u1",
            Provider::OpenAI,
            &CredentialConfig {
                api_key: "sk-old".into(),
            },
        )
        .expect("add");
        add_user_key(
            &conn,
            "u1",
            Provider::OpenAI,
            &CredentialConfig {
                api_key: "sk-new".into(),
            },
        )
        .expect("update");

        let keys = get_user_keys(&conn, "u1").expect("keys");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].provider, "openai");
        assert_eq!(keys[0].config.api_key, "sk-new");
    }

    #[test]
    fn test_user_keys_are_per_user_and_per_provider() {
        let conn = mem_conn();
        let cfg = |k: &str| CredentialConfig { api_key: k.into() };
        add_user_key(&conn, "u1", Provider::OpenAI, &cfg("a")).expect("add");
        add_user_key(&conn, "u1", Provider::Google, &cfg("b")).expect("add");
        add_user_key(&conn, "u2", Provider::OpenAI, &cfg("c")).expect("add");

        assert_eq!(get_user_keys(&conn, "u1").expect("keys").len(), 2);
        assert_eq!(get_user_keys(&conn, "u2").expect("keys").len(), 1);

        assert!(delete_user_key(&conn, "u1", Provider::Google).expect("delete"));
        assert!(!delete_user_key(&conn, "u1", Provider::Google).expect("delete again"));
        assert_eq!(get_user_keys(&conn, "u1").expect("keys").len(), 1);
    }

    #[test]
    fn test_usage_lookup() {
        let conn = mem_conn();
        let space = create_space(&conn, "u1", None, None).expect("space");
        let thread = create_thread(&conn, "u1", &space.id, None).expect("thread");
        record_message_token_usage(&conn, &thread.id, "msgs-a", 40).expect("usage a");
        record_message_token_usage(&conn, &thread.id, "msgs-b", 7).expect("usage b");

        let a = get_usage(&conn, &thread.id, "msgs-a").expect("get").expect("exists");
        assert_eq!(a.token_number, 40);
        assert!(get_usage(&conn, &thread.id, "msgs-c").expect("get").is_none());
    }
}
