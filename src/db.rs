use crate::models::{
    Activity, Call, FriendRequestView, Session, SessionRequestView, User, UserSummary,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};

/// One SQLite connection behind a mutex, shared by the HTTP layer and the
/// background sweepers. Serialized writes are the concurrency model.
#[derive(Clone)]
pub struct Db {
    pub conn: Arc<Mutex<Connection>>,
}

/// Auth token: `tok_<32 hex chars>`
pub fn generate_token() -> String {
    format!("tok_{:032x}", uuid::Uuid::new_v4().as_u128())
}

/// Invite code: 16 hex chars (8 random bytes).
pub fn generate_invite_code() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}

/// sha256 of the sorted user-id pair; at most one direct session per pair.
pub fn participants_hash(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    hex::encode(Sha256::digest(format!("{first}:{second}").as_bytes()))
}

impl Db {
    pub fn new(path: &str) -> Self {
        let conn = Connection::open(path).expect("Failed to open database");
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )
        .expect("Failed to set pragmas");
        let db = Db {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate();
        db
    }

    fn migrate(&self) {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                display_name TEXT NOT NULL,
                avatar_url TEXT,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS auth_tokens (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                device_info TEXT,
                created_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tokens_user ON auth_tokens(user_id);
            CREATE INDEX IF NOT EXISTS idx_tokens_expiry ON auth_tokens(expires_at_ms);

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                participants_hash TEXT UNIQUE,
                user1_id TEXT NOT NULL,
                user2_id TEXT NOT NULL,
                source TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'direct',
                status TEXT NOT NULL DEFAULT 'active',
                last_message_text TEXT,
                last_message_at_ms INTEGER,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user1 ON sessions(user1_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_user2 ON sessions(user2_id);

            CREATE TABLE IF NOT EXISTS session_hidden (
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                PRIMARY KEY (session_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS session_participants (
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'member',
                status TEXT NOT NULL DEFAULT 'active',
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                PRIMARY KEY (session_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_participants_user ON session_participants(user_id);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                sender_id TEXT NOT NULL,
                msg_type TEXT NOT NULL DEFAULT 'text',
                text TEXT,
                meta_json TEXT,
                created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session_created ON messages(session_id, created_at_ms);

            CREATE TABLE IF NOT EXISTS burn_messages (
                message_id TEXT PRIMARY KEY REFERENCES messages(id) ON DELETE CASCADE,
                session_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                burn_after_ms INTEGER NOT NULL,
                opened_at_ms INTEGER,
                burn_at_ms INTEGER,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_burn_due ON burn_messages(burn_at_ms);
            CREATE INDEX IF NOT EXISTS idx_burn_session ON burn_messages(session_id);

            CREATE TABLE IF NOT EXISTS session_requests (
                id TEXT PRIMARY KEY,
                requester_id TEXT NOT NULL,
                addressee_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                source TEXT NOT NULL,
                verification_message TEXT,
                last_opened_at_ms INTEGER NOT NULL,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                UNIQUE (requester_id, addressee_id)
            );
            CREATE INDEX IF NOT EXISTS idx_session_requests_addressee ON session_requests(addressee_id);

            CREATE TABLE IF NOT EXISTS friend_requests (
                id TEXT PRIMARY KEY,
                requester_id TEXT NOT NULL,
                addressee_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                verification_message TEXT,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                UNIQUE (requester_id, addressee_id)
            );
            CREATE INDEX IF NOT EXISTS idx_friend_requests_addressee ON friend_requests(addressee_id);

            CREATE TABLE IF NOT EXISTS friends (
                user_id TEXT NOT NULL,
                friend_id TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                PRIMARY KEY (user_id, friend_id)
            );

            CREATE TABLE IF NOT EXISTS session_invites (
                owner_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                code TEXT NOT NULL UNIQUE,
                expires_at_ms INTEGER,
                geo_lat_e7 INTEGER,
                geo_lng_e7 INTEGER,
                geo_radius_m INTEGER,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS friend_invites (
                owner_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                code TEXT NOT NULL UNIQUE,
                expires_at_ms INTEGER,
                geo_lat_e7 INTEGER,
                geo_lng_e7 INTEGER,
                geo_radius_m INTEGER,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS activities (
                id TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
                creator_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                start_at_ms INTEGER,
                end_at_ms INTEGER,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_activities_end ON activities(end_at_ms);

            CREATE TABLE IF NOT EXISTS activity_invites (
                activity_id TEXT PRIMARY KEY REFERENCES activities(id) ON DELETE CASCADE,
                code TEXT NOT NULL UNIQUE,
                expires_at_ms INTEGER,
                geo_lat_e7 INTEGER,
                geo_lng_e7 INTEGER,
                geo_radius_m INTEGER,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS activity_reminders (
                activity_id TEXT NOT NULL REFERENCES activities(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                remind_at_ms INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                sent_at_ms INTEGER,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                PRIMARY KEY (activity_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_reminders_due ON activity_reminders(status, remind_at_ms);

            CREATE TABLE IF NOT EXISTS home_bases (
                user_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                lat_e7 INTEGER NOT NULL,
                lng_e7 INTEGER NOT NULL,
                last_updated_ymd INTEGER NOT NULL,
                daily_update_count INTEGER NOT NULL DEFAULT 1,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS local_feed_posts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                text TEXT,
                radius_m INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL,
                is_pinned INTEGER NOT NULL DEFAULT 0,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_feed_user ON local_feed_posts(user_id, expires_at_ms);

            CREATE TABLE IF NOT EXISTS local_feed_post_images (
                id TEXT PRIMARY KEY,
                post_id TEXT NOT NULL REFERENCES local_feed_posts(id) ON DELETE CASCADE,
                url TEXT NOT NULL,
                sort_order INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_feed_images_post ON local_feed_post_images(post_id);

            CREATE TABLE IF NOT EXISTS wechat_bindings (
                user_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                openid TEXT NOT NULL UNIQUE,
                session_key TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS relationship_groups (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                UNIQUE (user_id, name)
            );

            CREATE TABLE IF NOT EXISTS session_user_meta (
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                group_id TEXT REFERENCES relationship_groups(id) ON DELETE SET NULL,
                alias TEXT,
                notes TEXT,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                PRIMARY KEY (session_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS user_profiles (
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                view TEXT NOT NULL,
                nickname TEXT,
                avatar_url TEXT,
                fields_json TEXT NOT NULL DEFAULT '{}',
                updated_at_ms INTEGER NOT NULL,
                PRIMARY KEY (user_id, view)
            );

            CREATE TABLE IF NOT EXISTS calls (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                caller_id TEXT NOT NULL,
                callee_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'ringing',
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_calls_session ON calls(session_id);
            ",
        )
        .expect("Failed to run migrations");

        // Later schema additions (idempotent — .ok() ignores duplicate-column errors)
        conn.execute_batch("ALTER TABLE sessions ADD COLUMN reactivated_at_ms INTEGER;")
            .ok();
        conn.execute_batch("ALTER TABLE activity_reminders ADD COLUMN last_error TEXT;")
            .ok();
        conn.execute_batch("ALTER TABLE wechat_bindings ADD COLUMN unionid TEXT;")
            .ok();
    }
}

// --- Shared SELECT column lists and row mappers ---
// Column order is part of the contract between these constants and mappers.

pub const USER_COLS: &str = "id, username, display_name, avatar_url, created_at_ms, updated_at_ms";

pub fn map_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        avatar_url: row.get(3)?,
        created_at_ms: row.get(4)?,
        updated_at_ms: row.get(5)?,
    })
}

pub const SESSION_COLS: &str = "id, user1_id, user2_id, source, kind, status, last_message_text, \
     last_message_at_ms, reactivated_at_ms, created_at_ms, updated_at_ms";

pub fn map_session(row: &Row) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        user1_id: row.get(1)?,
        user2_id: row.get(2)?,
        source: row.get(3)?,
        kind: row.get(4)?,
        status: row.get(5)?,
        last_message_text: row.get(6)?,
        last_message_at_ms: row.get(7)?,
        reactivated_at_ms: row.get(8)?,
        created_at_ms: row.get(9)?,
        updated_at_ms: row.get(10)?,
        peer: None,
    })
}

pub const ACTIVITY_COLS: &str =
    "id, creator_id, title, description, start_at_ms, end_at_ms, created_at_ms, updated_at_ms";

pub fn map_activity(row: &Row) -> rusqlite::Result<Activity> {
    Ok(Activity {
        id: row.get(0)?,
        creator_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        start_at_ms: row.get(4)?,
        end_at_ms: row.get(5)?,
        created_at_ms: row.get(6)?,
        updated_at_ms: row.get(7)?,
    })
}

pub const CALL_COLS: &str = "id, session_id, caller_id, callee_id, status, created_at_ms, updated_at_ms";

pub fn map_call(row: &Row) -> rusqlite::Result<Call> {
    Ok(Call {
        id: row.get(0)?,
        session_id: row.get(1)?,
        caller_id: row.get(2)?,
        callee_id: row.get(3)?,
        status: row.get(4)?,
        created_at_ms: row.get(5)?,
        updated_at_ms: row.get(6)?,
    })
}

pub const SESSION_REQUEST_COLS: &str = "id, requester_id, addressee_id, status, source, \
     verification_message, last_opened_at_ms, created_at_ms, updated_at_ms";

pub fn map_session_request(row: &Row) -> rusqlite::Result<SessionRequestView> {
    Ok(SessionRequestView {
        id: row.get(0)?,
        requester_id: row.get(1)?,
        addressee_id: row.get(2)?,
        status: row.get(3)?,
        source: row.get(4)?,
        verification_message: row.get(5)?,
        last_opened_at_ms: row.get(6)?,
        created_at_ms: row.get(7)?,
        updated_at_ms: row.get(8)?,
        counterpart: None,
    })
}

pub const FRIEND_REQUEST_COLS: &str =
    "id, requester_id, addressee_id, status, verification_message, created_at_ms, updated_at_ms";

pub fn map_friend_request(row: &Row) -> rusqlite::Result<FriendRequestView> {
    Ok(FriendRequestView {
        id: row.get(0)?,
        requester_id: row.get(1)?,
        addressee_id: row.get(2)?,
        status: row.get(3)?,
        verification_message: row.get(4)?,
        created_at_ms: row.get(5)?,
        updated_at_ms: row.get(6)?,
        counterpart: None,
    })
}

// --- Lookups shared across route modules ---

pub fn get_user(conn: &Connection, id: &str) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
        params![id],
        |row| map_user(row),
    )
    .optional()
}

pub fn get_user_summary(conn: &Connection, id: &str) -> rusqlite::Result<Option<UserSummary>> {
    conn.query_row(
        "SELECT id, username, display_name, avatar_url FROM users WHERE id = ?1",
        params![id],
        |row| {
            Ok(UserSummary {
                id: row.get(0)?,
                username: row.get(1)?,
                display_name: row.get(2)?,
                avatar_url: row.get(3)?,
            })
        },
    )
    .optional()
}

pub fn get_session(conn: &Connection, id: &str) -> rusqlite::Result<Option<Session>> {
    conn.query_row(
        &format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"),
        params![id],
        |row| map_session(row),
    )
    .optional()
}

/// Direct sessions: membership via the user pair. Group sessions: an active
/// participant row is required.
pub fn is_session_participant(
    conn: &Connection,
    session: &Session,
    user_id: &str,
) -> rusqlite::Result<bool> {
    if session.kind == "direct" {
        return Ok(session.user1_id == user_id || session.user2_id == user_id);
    }
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM session_participants
         WHERE session_id = ?1 AND user_id = ?2 AND status = 'active'",
        params![session.id, user_id],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Users that should receive events about this session.
pub fn session_member_ids(conn: &Connection, session: &Session) -> rusqlite::Result<Vec<String>> {
    if session.kind == "direct" {
        if session.user1_id == session.user2_id {
            return Ok(vec![session.user1_id.clone()]);
        }
        return Ok(vec![session.user1_id.clone(), session.user2_id.clone()]);
    }
    let mut stmt = conn.prepare(
        "SELECT user_id FROM session_participants WHERE session_id = ?1 AND status = 'active'",
    )?;
    let ids = stmt
        .query_map(params![session.id], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(ids)
}

/// The peer of `user_id` in a direct session.
pub fn direct_peer_id(session: &Session, user_id: &str) -> String {
    if session.user1_id == user_id {
        session.user2_id.clone()
    } else {
        session.user1_id.clone()
    }
}

pub fn get_or_create_group(
    conn: &Connection,
    user_id: &str,
    name: &str,
    now_ms: i64,
) -> rusqlite::Result<String> {
    if let Some(id) = conn
        .query_row(
            "SELECT id FROM relationship_groups WHERE user_id = ?1 AND name = ?2",
            params![user_id, name],
            |r| r.get::<_, String>(0),
        )
        .optional()?
    {
        return Ok(id);
    }
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO relationship_groups (id, user_id, name, created_at_ms) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (user_id, name) DO NOTHING",
        params![&id, user_id, name, now_ms],
    )?;
    // Concurrent insert may have won; re-select the canonical row.
    conn.query_row(
        "SELECT id FROM relationship_groups WHERE user_id = ?1 AND name = ?2",
        params![user_id, name],
        |r| r.get(0),
    )
}

/// Assign a default relationship group for the session view, but only when
/// the user has no meta row yet (an existing assignment wins).
pub fn assign_default_group(
    conn: &Connection,
    session_id: &str,
    user_id: &str,
    group_name: &str,
    now_ms: i64,
) -> rusqlite::Result<()> {
    let has_meta: i64 = conn.query_row(
        "SELECT COUNT(*) FROM session_user_meta WHERE session_id = ?1 AND user_id = ?2",
        params![session_id, user_id],
        |r| r.get(0),
    )?;
    if has_meta > 0 {
        return Ok(());
    }
    let group_id = get_or_create_group(conn, user_id, group_name, now_ms)?;
    conn.execute(
        "INSERT INTO session_user_meta (session_id, user_id, group_id, created_at_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT (session_id, user_id) DO NOTHING",
        params![session_id, user_id, group_id, now_ms],
    )?;
    Ok(())
}
