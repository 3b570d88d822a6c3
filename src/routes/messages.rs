use crate::auth::AuthUser;
use crate::clock;
use crate::db::{self, Db};
use crate::errors::{ApiError, ApiResult};
use crate::hub::{Envelope, Hub};
use crate::models::*;
use rocket::serde::json::Json;
use rocket::{get, post, State};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{load_session_for_participant, require_json_object};

/// Session snapshot text shown for a burn message.
const BURN_SNAPSHOT: &str = "[阅后即焚]";

const BURN_AFTER_MIN_MS: i64 = 1_000;
const BURN_AFTER_MAX_MS: i64 = 30 * 24 * 3600 * 1000;

const MESSAGE_WITH_BURN_COLS: &str = "m.id, m.session_id, m.sender_id, m.msg_type, m.text, \
     m.meta_json, m.created_at_ms, b.burn_after_ms, b.opened_at_ms, b.burn_at_ms";

fn map_message_with_burn(row: &Row) -> rusqlite::Result<Message> {
    let meta_str: Option<String> = row.get(5)?;
    let burn_after_ms: Option<i64> = row.get(7)?;
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        sender_id: row.get(2)?,
        msg_type: row.get(3)?,
        text: row.get(4)?,
        meta_json: meta_str.and_then(|s| serde_json::from_str(&s).ok()),
        created_at_ms: row.get(6)?,
        burn: burn_after_ms.map(|burn_after_ms| BurnState {
            burn_after_ms,
            opened_at_ms: row.get(8).unwrap_or(None),
            burn_at_ms: row.get(9).unwrap_or(None),
        }),
    })
}

#[derive(rocket::FromForm)]
pub struct ListMessagesQuery<'r> {
    pub limit: Option<i64>,
    #[field(name = "beforeId")]
    pub before_id: Option<&'r str>,
}

#[get("/v1/sessions/<id>/messages?<q..>")]
pub fn list_messages(
    db: &State<Db>,
    user: AuthUser,
    id: &str,
    q: ListMessagesQuery<'_>,
) -> ApiResult<MessagesResponse> {
    let limit = q.limit.unwrap_or(50).clamp(1, 100);
    let before_id = q.before_id;
    let conn = db.conn.lock().unwrap();
    load_session_for_participant(&conn, id, &user.user_id)?;

    // Resolve the cursor message to its createdAt; the id breaks ties.
    let cursor: Option<(i64, String)> = match before_id {
        Some(before) => {
            let at: Option<i64> = conn
                .query_row(
                    "SELECT created_at_ms FROM messages WHERE id = ?1 AND session_id = ?2",
                    params![before, id],
                    |r| r.get(0),
                )
                .optional()?;
            match at {
                Some(at) => Some((at, before.to_string())),
                None => return Err(ApiError::validation("beforeId does not name a message here")),
            }
        }
        None => None,
    };

    // Burn rows created before this token was issued are invisible to it:
    // a fresh device never sees historical burn messages.
    let mut sql = format!(
        "SELECT {MESSAGE_WITH_BURN_COLS}
         FROM messages m LEFT JOIN burn_messages b ON b.message_id = m.id
         WHERE m.session_id = ?1
           AND (m.msg_type != 'burn' OR m.created_at_ms >= ?2)"
    );
    if cursor.is_some() {
        sql.push_str(
            " AND (m.created_at_ms < ?3 OR (m.created_at_ms = ?3 AND m.id < ?4))
              ORDER BY m.created_at_ms DESC, m.id DESC LIMIT ?5",
        );
    } else {
        sql.push_str(" ORDER BY m.created_at_ms DESC, m.id DESC LIMIT ?3");
    }

    let overfetch = limit + 1;
    let mut stmt = conn.prepare(&sql)?;
    let mut messages: Vec<Message> = match &cursor {
        Some((at, before)) => stmt
            .query_map(
                params![id, user.token_created_at_ms, at, before, overfetch],
                |row| map_message_with_burn(row),
            )?
            .filter_map(|r| r.ok())
            .collect(),
        None => stmt
            .query_map(params![id, user.token_created_at_ms, overfetch], |row| {
                map_message_with_burn(row)
            })?
            .filter_map(|r| r.ok())
            .collect(),
    };

    let has_more = messages.len() as i64 > limit;
    messages.truncate(limit as usize);
    messages.reverse();
    Ok(Json(MessagesResponse {
        messages,
        has_more,
    }))
}

#[post("/v1/sessions/<id>/messages", format = "json", data = "<body>")]
pub fn create_message(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    id: &str,
    body: Json<SendMessageRequest>,
) -> ApiResult<Message> {
    match body.msg_type.as_str() {
        "text" | "image" | "file" | "system" | "burn" => {}
        other => return Err(ApiError::validation(format!("unknown message type {other}"))),
    }
    let now = clock::now_ms();

    let (message, recipients) = {
        let conn = db.conn.lock().unwrap();
        let session = load_session_for_participant(&conn, id, &user.user_id)?;

        if session.status == "archived" {
            return Err(ApiError::session_archived());
        }

        // A group session whose activity already ended archives on touch.
        if session.kind == "group" {
            let ended: Option<i64> = conn
                .query_row(
                    "SELECT end_at_ms FROM activities WHERE id = ?1",
                    params![id],
                    |r| r.get(0),
                )
                .optional()?
                .flatten();
            if let Some(end_at_ms) = ended {
                if end_at_ms <= now {
                    conn.execute(
                        "UPDATE sessions SET status = 'archived', updated_at_ms = ?1
                         WHERE id = ?2 AND status = 'active'",
                        params![now, id],
                    )?;
                    let members = db::session_member_ids(&conn, &session)?;
                    drop(conn);
                    hub.send_to_users(
                        &members,
                        &Envelope::new(
                            "session.archived",
                            Some(id.to_string()),
                            serde_json::json!({"sessionId": id, "status": "archived"}),
                        ),
                    );
                    return Err(ApiError::session_archived());
                }
            }
        }

        let message = if body.msg_type == "burn" {
            insert_burn_message(&conn, &session, &user, &body, now)?
        } else {
            insert_plain_message(&conn, &session, &user, &body, now)?
        };
        let recipients = db::session_member_ids(&conn, &session)?;
        (message, recipients)
    };

    hub.send_to_users(
        &recipients,
        &Envelope::new(
            "message.created",
            Some(message.session_id.clone()),
            serde_json::to_value(&message).unwrap_or_default(),
        ),
    );
    Ok(Json(message))
}

fn insert_plain_message(
    conn: &Connection,
    session: &Session,
    user: &AuthUser,
    body: &SendMessageRequest,
    now: i64,
) -> Result<Message, ApiError> {
    let text = body.text.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if body.msg_type == "text" && text.is_none() {
        return Err(ApiError::validation("text is required for text messages"));
    }
    if let Some(t) = text {
        if t.chars().count() > 10_000 {
            return Err(ApiError::validation("text must be at most 10000 characters"));
        }
    }
    let meta_str = body.meta_json.as_ref().map(|v| v.to_string());

    let snapshot = match body.msg_type.as_str() {
        "text" => text.unwrap_or_default().to_string(),
        other => {
            let name = body
                .meta_json
                .as_ref()
                .and_then(|m| m.get("name"))
                .and_then(|n| n.as_str());
            match name {
                Some(name) => format!("[{other}] {name}"),
                None => format!("[{other}]"),
            }
        }
    };

    let message_id = uuid::Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO messages (id, session_id, sender_id, msg_type, text, meta_json, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            &message_id,
            &session.id,
            &user.user_id,
            &body.msg_type,
            text,
            meta_str,
            now
        ],
    )?;
    tx.execute(
        "UPDATE sessions SET last_message_text = ?1, last_message_at_ms = ?2, updated_at_ms = ?2
         WHERE id = ?3",
        params![&snapshot, now, &session.id],
    )?;
    tx.commit()?;

    Ok(Message {
        id: message_id,
        session_id: session.id.clone(),
        sender_id: user.user_id.clone(),
        msg_type: body.msg_type.clone(),
        text: text.map(String::from),
        meta_json: body.meta_json.clone(),
        created_at_ms: now,
        burn: None,
    })
}

fn insert_burn_message(
    conn: &Connection,
    session: &Session,
    user: &AuthUser,
    body: &SendMessageRequest,
    now: i64,
) -> Result<Message, ApiError> {
    if session.kind != "direct" {
        return Err(ApiError::validation(
            "burn messages are only available in direct sessions",
        ));
    }
    let meta = body
        .meta_json
        .as_ref()
        .ok_or_else(|| ApiError::validation("metaJson is required for burn messages"))?;
    // Ciphertext envelope: an opaque JSON object, stored verbatim.
    let meta_str = require_json_object(meta, "metaJson")?;
    let burn_after_ms = body
        .burn_after_ms
        .ok_or_else(|| ApiError::validation("burnAfterMs is required for burn messages"))?;
    if !(BURN_AFTER_MIN_MS..=BURN_AFTER_MAX_MS).contains(&burn_after_ms) {
        return Err(ApiError::validation(
            "burnAfterMs must be between 1 second and 30 days",
        ));
    }
    let recipient_id = db::direct_peer_id(session, &user.user_id);

    let message_id = uuid::Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO messages (id, session_id, sender_id, msg_type, meta_json, created_at_ms)
         VALUES (?1, ?2, ?3, 'burn', ?4, ?5)",
        params![&message_id, &session.id, &user.user_id, &meta_str, now],
    )?;
    tx.execute(
        "INSERT INTO burn_messages
             (message_id, session_id, sender_id, recipient_id, burn_after_ms, created_at_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            &message_id,
            &session.id,
            &user.user_id,
            &recipient_id,
            burn_after_ms,
            now
        ],
    )?;
    tx.execute(
        "UPDATE sessions SET last_message_text = ?1, last_message_at_ms = ?2, updated_at_ms = ?2
         WHERE id = ?3",
        params![BURN_SNAPSHOT, now, &session.id],
    )?;
    tx.commit()?;

    Ok(Message {
        id: message_id,
        session_id: session.id.clone(),
        sender_id: user.user_id.clone(),
        msg_type: "burn".to_string(),
        text: None,
        meta_json: body.meta_json.clone(),
        created_at_ms: now,
        burn: Some(BurnState {
            burn_after_ms,
            opened_at_ms: None,
            burn_at_ms: None,
        }),
    })
}

/// First read by the recipient starts the burn timer. The transition is a
/// compare-and-set on `opened_at_ms IS NULL`; once set, neither field ever
/// changes again.
#[post("/v1/burn-messages/<id>/read")]
pub fn read_burn_message(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    id: &str,
) -> ApiResult<BurnReadResponse> {
    let now = clock::now_ms();
    let (response, session_id, sender_id, recipient_id, started) = {
        let conn = db.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT session_id, sender_id, recipient_id, burn_after_ms, opened_at_ms, burn_at_ms
                 FROM burn_messages WHERE message_id = ?1",
                params![id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, Option<i64>>(4)?,
                        r.get::<_, Option<i64>>(5)?,
                    ))
                },
            )
            .optional()?;
        let (session_id, sender_id, recipient_id, burn_after_ms, opened_at_ms, burn_at_ms) =
            row.ok_or_else(|| ApiError::not_found("burn message"))?;

        if user.user_id == sender_id {
            return Err(ApiError::access_denied("the sender cannot open a burn message"));
        }
        if user.user_id != recipient_id {
            return Err(ApiError::access_denied("only the recipient can open this message"));
        }

        if let (Some(opened), Some(burn_at)) = (opened_at_ms, burn_at_ms) {
            (
                BurnReadResponse {
                    message_id: id.to_string(),
                    started: false,
                    opened_at_ms: opened,
                    burn_at_ms: burn_at,
                },
                session_id,
                sender_id,
                recipient_id,
                false,
            )
        } else {
            let burn_at = now + burn_after_ms;
            let updated = conn.execute(
                "UPDATE burn_messages
                 SET opened_at_ms = ?1, burn_at_ms = ?2, updated_at_ms = ?1
                 WHERE message_id = ?3 AND opened_at_ms IS NULL",
                params![now, burn_at, id],
            )?;
            if updated == 0 {
                // Lost the CAS; return the state the winner wrote.
                let (opened, burn_at): (i64, i64) = conn.query_row(
                    "SELECT opened_at_ms, burn_at_ms FROM burn_messages WHERE message_id = ?1",
                    params![id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?;
                (
                    BurnReadResponse {
                        message_id: id.to_string(),
                        started: false,
                        opened_at_ms: opened,
                        burn_at_ms: burn_at,
                    },
                    session_id,
                    sender_id,
                    recipient_id,
                    false,
                )
            } else {
                (
                    BurnReadResponse {
                        message_id: id.to_string(),
                        started: true,
                        opened_at_ms: now,
                        burn_at_ms: burn_at,
                    },
                    session_id,
                    sender_id,
                    recipient_id,
                    true,
                )
            }
        }
    };

    if started {
        hub.send_to_users(
            &[sender_id, recipient_id],
            &Envelope::new(
                "message.burn.read",
                Some(session_id.clone()),
                serde_json::json!({
                    "messageId": response.message_id,
                    "sessionId": session_id,
                    "openedAtMs": response.opened_at_ms,
                    "burnAtMs": response.burn_at_ms,
                }),
            ),
        );
    }
    Ok(Json(response))
}
