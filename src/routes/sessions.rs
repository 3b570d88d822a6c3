use crate::auth::AuthUser;
use crate::clock;
use crate::db::{self, participants_hash, Db, SESSION_COLS};
use crate::errors::{ApiError, ApiResult};
use crate::hub::{Envelope, Hub};
use crate::models::*;
use rocket::serde::json::Json;
use rocket::{get, post, put, State};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use super::load_session_for_participant as load_for_participant;

fn attach_peer(conn: &Connection, session: &mut Session, viewer_id: &str) {
    if session.kind == "direct" {
        let peer_id = db::direct_peer_id(session, viewer_id);
        session.peer = db::get_user_summary(conn, &peer_id).ok().flatten();
    }
}

fn session_payload(session: &Session) -> serde_json::Value {
    serde_json::to_value(session).unwrap_or_default()
}

#[post("/v1/sessions", format = "json", data = "<body>")]
pub fn create_session(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    body: Json<CreateSessionRequest>,
) -> ApiResult<SessionResponse> {
    let peer_id = body.peer_user_id.trim().to_string();
    if peer_id == user.user_id {
        return Err(ApiError::cannot_chat_self());
    }
    let now = clock::now_ms();

    let (session, created) = {
        let conn = db.conn.lock().unwrap();
        if db::get_user_summary(&conn, &peer_id)?.is_none() {
            return Err(ApiError::not_found("user"));
        }
        let hash = participants_hash(&user.user_id, &peer_id);
        let existing = find_by_hash(&conn, &hash)?;
        let (session, created) = match existing {
            Some(row) => (row, false),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                let inserted = conn.execute(
                    "INSERT INTO sessions (id, participants_hash, user1_id, user2_id, source, kind, status, created_at_ms, updated_at_ms)
                     VALUES (?1, ?2, ?3, ?4, 'manual', 'direct', 'active', ?5, ?5)",
                    params![&id, &hash, &user.user_id, &peer_id, now],
                );
                match inserted {
                    Ok(_) => {
                        let row = db::get_session(&conn, &id)?
                            .ok_or_else(|| ApiError::internal("session vanished"))?;
                        (row, true)
                    }
                    // Unique-constraint race: another writer created the pair
                    // first; the existing row is canonical.
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == ErrorCode::ConstraintViolation =>
                    {
                        let row = find_by_hash(&conn, &hash)?
                            .ok_or_else(|| ApiError::internal("session vanished"))?;
                        (row, false)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };
        let mut session = session;
        if session.status == "archived" {
            conn.execute(
                "UPDATE sessions SET status = 'active', reactivated_at_ms = ?1, updated_at_ms = ?1
                 WHERE id = ?2",
                params![now, &session.id],
            )?;
            session = db::get_session(&conn, &session.id)?
                .ok_or_else(|| ApiError::internal("session vanished"))?;
        }
        attach_peer(&conn, &mut session, &user.user_id);
        (session, created)
    };

    if created {
        hub.send_to_user(
            &user.user_id,
            &Envelope::new(
                "session.created",
                Some(session.id.clone()),
                session_payload(&session),
            ),
        );
    }
    Ok(Json(SessionResponse { session, created }))
}

fn find_by_hash(conn: &Connection, hash: &str) -> rusqlite::Result<Option<Session>> {
    conn.query_row(
        &format!("SELECT {SESSION_COLS} FROM sessions WHERE participants_hash = ?1"),
        params![hash],
        |row| db::map_session(row),
    )
    .optional()
}

#[get("/v1/sessions?<status>")]
pub fn list_sessions(
    db: &State<Db>,
    user: AuthUser,
    status: Option<&str>,
) -> ApiResult<Vec<Session>> {
    if let Some(s) = status {
        if s != "active" && s != "archived" {
            return Err(ApiError::validation("status must be active or archived"));
        }
    }
    let conn = db.conn.lock().unwrap();
    let mut sql = format!(
        "SELECT {SESSION_COLS} FROM sessions
         WHERE kind = 'direct' AND (user1_id = ?1 OR user2_id = ?1)
           AND id NOT IN (SELECT session_id FROM session_hidden WHERE user_id = ?1)"
    );
    if status.is_some() {
        sql.push_str(" AND status = ?2");
    }
    sql.push_str(" ORDER BY updated_at_ms DESC");

    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<Session> = match status {
        Some(s) => stmt
            .query_map(params![&user.user_id, s], |row| db::map_session(row))?
            .filter_map(|r| r.ok())
            .collect(),
        None => stmt
            .query_map(params![&user.user_id], |row| db::map_session(row))?
            .filter_map(|r| r.ok())
            .collect(),
    };
    let sessions = rows
        .into_iter()
        .map(|mut s| {
            attach_peer(&conn, &mut s, &user.user_id);
            s
        })
        .collect();
    Ok(Json(sessions))
}


#[post("/v1/sessions/<id>/archive")]
pub fn archive_session(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    id: &str,
) -> ApiResult<Session> {
    let now = clock::now_ms();
    let (session, members, changed) = {
        let conn = db.conn.lock().unwrap();
        let mut session = load_for_participant(&conn, id, &user.user_id)?;
        let changed = session.status != "archived";
        if changed {
            conn.execute(
                "UPDATE sessions SET status = 'archived', updated_at_ms = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            session = db::get_session(&conn, id)?
                .ok_or_else(|| ApiError::internal("session vanished"))?;
        }
        let members = db::session_member_ids(&conn, &session)?;
        attach_peer(&conn, &mut session, &user.user_id);
        (session, members, changed)
    };
    if changed {
        hub.send_to_users(
            &members,
            &Envelope::new(
                "session.archived",
                Some(session.id.clone()),
                session_payload(&session),
            ),
        );
    }
    Ok(Json(session))
}

#[post("/v1/sessions/<id>/reactivate")]
pub fn reactivate_session(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    id: &str,
) -> ApiResult<Session> {
    let now = clock::now_ms();
    let (session, members) = {
        let conn = db.conn.lock().unwrap();
        let mut session = load_for_participant(&conn, id, &user.user_id)?;
        if session.status != "archived" {
            return Err(ApiError::invalid_state("session is not archived"));
        }
        conn.execute(
            "UPDATE sessions SET status = 'active', reactivated_at_ms = ?1, updated_at_ms = ?1
             WHERE id = ?2",
            params![now, id],
        )?;
        session = db::get_session(&conn, id)?
            .ok_or_else(|| ApiError::internal("session vanished"))?;
        let members = db::session_member_ids(&conn, &session)?;
        attach_peer(&conn, &mut session, &user.user_id);
        (session, members)
    };
    hub.send_to_users(
        &members,
        &Envelope::new(
            "session.reactivated",
            Some(session.id.clone()),
            session_payload(&session),
        ),
    );
    Ok(Json(session))
}

/// Hide is per-user and view-only: the session stops appearing in this
/// user's listings. Idempotent.
#[post("/v1/sessions/<id>/hide")]
pub fn hide_session(db: &State<Db>, user: AuthUser, id: &str) -> ApiResult<serde_json::Value> {
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();
    load_for_participant(&conn, id, &user.user_id)?;
    conn.execute(
        "INSERT OR IGNORE INTO session_hidden (session_id, user_id, created_at_ms)
         VALUES (?1, ?2, ?3)",
        params![id, &user.user_id, now],
    )?;
    Ok(Json(serde_json::json!({"hidden": true})))
}

#[get("/v1/sessions/<id>/relationship")]
pub fn get_relationship(db: &State<Db>, user: AuthUser, id: &str) -> ApiResult<RelationshipResponse> {
    let conn = db.conn.lock().unwrap();
    load_for_participant(&conn, id, &user.user_id)?;
    let row = conn
        .query_row(
            "SELECT m.group_id, g.name, m.alias, m.notes
             FROM session_user_meta m
             LEFT JOIN relationship_groups g ON g.id = m.group_id
             WHERE m.session_id = ?1 AND m.user_id = ?2",
            params![id, &user.user_id],
            |r| {
                Ok(RelationshipResponse {
                    group_id: r.get(0)?,
                    group_name: r.get(1)?,
                    alias: r.get(2)?,
                    notes: r.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(Json(row.unwrap_or(RelationshipResponse {
        group_id: None,
        group_name: None,
        alias: None,
        notes: None,
    })))
}

#[put("/v1/sessions/<id>/relationship", format = "json", data = "<body>")]
pub fn put_relationship(
    db: &State<Db>,
    user: AuthUser,
    id: &str,
    body: Json<RelationshipRequest>,
) -> ApiResult<RelationshipResponse> {
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();
    load_for_participant(&conn, id, &user.user_id)?;

    let group_id = match body.group_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => {
            if name.chars().count() > 20 {
                return Err(ApiError::validation("groupName must be 1-20 characters"));
            }
            Some(db::get_or_create_group(&conn, &user.user_id, name, now)?)
        }
        _ => None,
    };

    conn.execute(
        "INSERT INTO session_user_meta (session_id, user_id, group_id, alias, notes, created_at_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT (session_id, user_id) DO UPDATE SET
             group_id = COALESCE(excluded.group_id, session_user_meta.group_id),
             alias = COALESCE(excluded.alias, session_user_meta.alias),
             notes = COALESCE(excluded.notes, session_user_meta.notes),
             updated_at_ms = excluded.updated_at_ms",
        params![id, &user.user_id, group_id, body.alias, body.notes, now],
    )?;

    drop(conn);
    get_relationship(db, user, id)
}
