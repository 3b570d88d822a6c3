use crate::auth::AuthUser;
use crate::clock;
use crate::db::{self, participants_hash, Db, SESSION_COLS, SESSION_REQUEST_COLS};
use crate::errors::{ApiError, ApiResult};
use crate::hub::{Envelope, Hub};
use crate::invites::{self, InviteKind};
use crate::models::*;
use rocket::serde::json::Json;
use rocket::{get, post, put, State};
use rusqlite::{params, Connection, OptionalExtension};

/// Map-sourced requests: at most this many opens per requester per
/// Shanghai-local day.
const MAP_DAILY_OPEN_CAP: i64 = 10;

/// After a reject, the same pair cannot re-open for 3 days.
const REJECT_COOLDOWN_MS: i64 = 3 * 24 * 3600 * 1000;

fn get_request(conn: &Connection, id: &str) -> rusqlite::Result<Option<SessionRequestView>> {
    conn.query_row(
        &format!("SELECT {SESSION_REQUEST_COLS} FROM session_requests WHERE id = ?1"),
        params![id],
        |row| db::map_session_request(row),
    )
    .optional()
}

fn attach_counterpart(conn: &Connection, request: &mut SessionRequestView, viewer_id: &str) {
    let other = if request.requester_id == viewer_id {
        &request.addressee_id
    } else {
        &request.requester_id
    };
    request.counterpart = db::get_user_summary(conn, other).ok().flatten();
}

/// Open (create or re-open) a session request. Returns `created = false`
/// when an existing row was reused or re-opened.
fn open_request(
    conn: &Connection,
    requester_id: &str,
    addressee_id: &str,
    source: &str,
    verification_message: Option<&str>,
    now: i64,
) -> Result<(SessionRequestView, bool), ApiError> {
    if requester_id == addressee_id {
        return Err(ApiError::validation("cannot send a request to yourself"));
    }
    if db::get_user_summary(conn, addressee_id)?.is_none() {
        return Err(ApiError::not_found("user"));
    }

    // A pending request in the other direction means the pair is already
    // connecting; accepting that one is the way forward.
    let reverse_pending: i64 = conn.query_row(
        "SELECT COUNT(*) FROM session_requests
         WHERE requester_id = ?1 AND addressee_id = ?2 AND status = 'pending'",
        params![addressee_id, requester_id],
        |r| r.get(0),
    )?;
    if reverse_pending > 0 {
        return Err(ApiError::exists("a request from this user is already pending"));
    }

    let existing = conn
        .query_row(
            &format!(
                "SELECT {SESSION_REQUEST_COLS} FROM session_requests
                 WHERE requester_id = ?1 AND addressee_id = ?2"
            ),
            params![requester_id, addressee_id],
            |row| db::map_session_request(row),
        )
        .optional()?;

    match existing {
        Some(row) if row.status == "pending" => Ok((row, false)),
        Some(row) if row.status == "accepted" => {
            Err(ApiError::exists("request already accepted"))
        }
        Some(row) => {
            if row.status == "rejected" && now <= row.updated_at_ms + REJECT_COOLDOWN_MS {
                return Err(ApiError::cooldown(
                    "a rejected request can be re-opened after 3 days",
                ));
            }
            enforce_map_cap(conn, requester_id, source, now)?;
            conn.execute(
                "UPDATE session_requests
                 SET status = 'pending', source = ?1, verification_message = ?2,
                     last_opened_at_ms = ?3, updated_at_ms = ?3
                 WHERE id = ?4",
                params![source, verification_message, now, &row.id],
            )?;
            let row = get_request(conn, &row.id)?
                .ok_or_else(|| ApiError::internal("request vanished"))?;
            Ok((row, false))
        }
        None => {
            enforce_map_cap(conn, requester_id, source, now)?;
            let id = uuid::Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO session_requests
                     (id, requester_id, addressee_id, status, source, verification_message,
                      last_opened_at_ms, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?6, ?6)",
                params![&id, requester_id, addressee_id, source, verification_message, now],
            )?;
            let row =
                get_request(conn, &id)?.ok_or_else(|| ApiError::internal("request vanished"))?;
            Ok((row, true))
        }
    }
}

fn enforce_map_cap(
    conn: &Connection,
    requester_id: &str,
    source: &str,
    now: i64,
) -> Result<(), ApiError> {
    if source != "map" {
        return Ok(());
    }
    let (day_start, day_end) = clock::shanghai_day_bounds(now);
    let opened_today: i64 = conn.query_row(
        "SELECT COUNT(*) FROM session_requests
         WHERE requester_id = ?1 AND source = 'map'
           AND last_opened_at_ms >= ?2 AND last_opened_at_ms < ?3",
        params![requester_id, day_start, day_end],
        |r| r.get(0),
    )?;
    if opened_today >= MAP_DAILY_OPEN_CAP {
        return Err(ApiError::rate_limited(
            "at most 10 map requests can be opened per day",
        ));
    }
    Ok(())
}

#[get("/v1/session-requests")]
pub fn list_session_requests(db: &State<Db>, user: AuthUser) -> ApiResult<SessionRequestsResponse> {
    let conn = db.conn.lock().unwrap();
    let fetch = |column: &str| -> rusqlite::Result<Vec<SessionRequestView>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_REQUEST_COLS} FROM session_requests
             WHERE {column} = ?1 ORDER BY updated_at_ms DESC LIMIT 100"
        ))?;
        let rows = stmt
            .query_map(params![&user.user_id], |row| db::map_session_request(row))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    };
    let mut incoming = fetch("addressee_id")?;
    let mut outgoing = fetch("requester_id")?;
    for request in incoming.iter_mut().chain(outgoing.iter_mut()) {
        attach_counterpart(&conn, request, &user.user_id);
    }
    Ok(Json(SessionRequestsResponse { incoming, outgoing }))
}

#[post("/v1/session-requests", format = "json", data = "<body>")]
pub fn create_session_request(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    body: Json<CreateSessionRequestRequest>,
) -> ApiResult<RequestCreatedResponse> {
    let now = clock::now_ms();
    let (request, created) = {
        let conn = db.conn.lock().unwrap();
        let (mut request, created) = open_request(
            &conn,
            &user.user_id,
            body.addressee_id.trim(),
            "map",
            body.verification_message.as_deref(),
            now,
        )?;
        attach_counterpart(&conn, &mut request, &user.user_id);
        (request, created)
    };
    notify_requested(hub, &request);
    Ok(Json(RequestCreatedResponse { request, created }))
}

fn notify_requested(hub: &Hub, request: &SessionRequestView) {
    let payload = serde_json::to_value(request).unwrap_or_default();
    hub.send_to_user(
        &request.addressee_id,
        &Envelope::new("session.requested", None, payload),
    );
}

// --- Invite surface ---

#[get("/v1/session-requests/invites")]
pub fn session_invite(db: &State<Db>, user: AuthUser) -> ApiResult<InviteResponse> {
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();
    let invite = invites::get_or_create(&conn, InviteKind::Session, &user.user_id, now)?;
    Ok(Json(invite.to_response()))
}

#[put("/v1/session-requests/invites", format = "json", data = "<body>")]
pub fn update_session_invite(
    db: &State<Db>,
    user: AuthUser,
    body: Json<InviteSettingsRequest>,
) -> ApiResult<InviteResponse> {
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();
    let invite = invites::update_settings(&conn, InviteKind::Session, &user.user_id, &body, now)?;
    Ok(Json(invite.to_response()))
}

/// Consuming someone's invite code opens a wechat_code-sourced request
/// toward the code's owner, after the expiry and geo gates pass.
#[post("/v1/session-requests/invites/consume", format = "json", data = "<body>")]
pub fn consume_session_invite(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    body: Json<ConsumeInviteRequest>,
) -> ApiResult<RequestCreatedResponse> {
    let now = clock::now_ms();
    let (request, created) = {
        let conn = db.conn.lock().unwrap();
        let invite = invites::resolve_code(&conn, InviteKind::Session, body.code.trim())?;
        invites::check_gates(&invite, body.at_lat, body.at_lng, now)?;
        let (mut request, created) = open_request(
            &conn,
            &user.user_id,
            &invite.owner_id,
            "wechat_code",
            None,
            now,
        )?;
        attach_counterpart(&conn, &mut request, &user.user_id);
        (request, created)
    };
    notify_requested(hub, &request);
    Ok(Json(RequestCreatedResponse { request, created }))
}

// --- Transitions ---

#[post("/v1/session-requests/<id>/accept")]
pub fn accept_session_request(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    id: &str,
) -> ApiResult<serde_json::Value> {
    let now = clock::now_ms();
    let (request, session) = {
        let conn = db.conn.lock().unwrap();
        let request =
            get_request(&conn, id)?.ok_or_else(|| ApiError::not_found("session request"))?;
        if request.addressee_id != user.user_id {
            return Err(ApiError::access_denied("only the addressee can accept"));
        }
        if request.status != "pending" {
            return Err(ApiError::invalid_state("request is not pending"));
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE session_requests SET status = 'accepted', updated_at_ms = ?1 WHERE id = ?2",
            params![now, id],
        )?;

        let hash = participants_hash(&request.requester_id, &request.addressee_id);
        let existing = tx
            .query_row(
                &format!("SELECT {SESSION_COLS} FROM sessions WHERE participants_hash = ?1"),
                params![&hash],
                |row| db::map_session(row),
            )
            .optional()?;
        let session_id = match existing {
            Some(session) => {
                if session.status == "archived" {
                    tx.execute(
                        "UPDATE sessions
                         SET status = 'active', source = ?1, reactivated_at_ms = ?2, updated_at_ms = ?2
                         WHERE id = ?3",
                        params![&request.source, now, &session.id],
                    )?;
                }
                session.id
            }
            None => {
                let session_id = uuid::Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO sessions
                         (id, participants_hash, user1_id, user2_id, source, kind, status,
                          created_at_ms, updated_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'direct', 'active', ?6, ?6)",
                    params![
                        &session_id,
                        &hash,
                        &request.requester_id,
                        &request.addressee_id,
                        &request.source,
                        now
                    ],
                )?;
                session_id
            }
        };

        // Map contacts land in a default 「地图」 group unless the user has
        // already organized this session.
        if request.source == "map" {
            db::assign_default_group(&tx, &session_id, &request.requester_id, "地图", now)?;
            db::assign_default_group(&tx, &session_id, &request.addressee_id, "地图", now)?;
        }
        tx.commit()?;

        let request = get_request(&conn, id)?
            .ok_or_else(|| ApiError::internal("request vanished"))?;
        let session = db::get_session(&conn, &session_id)?
            .ok_or_else(|| ApiError::internal("session vanished"))?;
        (request, session)
    };

    let payload = serde_json::json!({
        "request": request,
        "session": session,
    });
    hub.send_to_users(
        &[request.requester_id.clone(), request.addressee_id.clone()],
        &Envelope::new(
            "session.request.accepted",
            Some(session.id.clone()),
            payload.clone(),
        ),
    );
    Ok(Json(payload))
}

#[post("/v1/session-requests/<id>/reject")]
pub fn reject_session_request(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    id: &str,
) -> ApiResult<SessionRequestView> {
    transition_request(db, hub, user, id, "rejected")
}

#[post("/v1/session-requests/<id>/cancel")]
pub fn cancel_session_request(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    id: &str,
) -> ApiResult<SessionRequestView> {
    transition_request(db, hub, user, id, "canceled")
}

fn transition_request(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    id: &str,
    target: &str,
) -> ApiResult<SessionRequestView> {
    let now = clock::now_ms();
    let (request, notify_user) = {
        let conn = db.conn.lock().unwrap();
        let request =
            get_request(&conn, id)?.ok_or_else(|| ApiError::not_found("session request"))?;
        let (allowed, notify_user) = match target {
            "rejected" => (request.addressee_id == user.user_id, request.requester_id.clone()),
            _ => (request.requester_id == user.user_id, request.addressee_id.clone()),
        };
        if !allowed {
            return Err(ApiError::access_denied("not your transition to make"));
        }
        if request.status != "pending" {
            return Err(ApiError::invalid_state("request is not pending"));
        }
        conn.execute(
            "UPDATE session_requests SET status = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![target, now, id],
        )?;
        let mut request = get_request(&conn, id)?
            .ok_or_else(|| ApiError::internal("request vanished"))?;
        attach_counterpart(&conn, &mut request, &user.user_id);
        (request, notify_user)
    };

    let event = match target {
        "rejected" => "session.request.rejected",
        _ => "session.request.canceled",
    };
    hub.send_to_user(
        &notify_user,
        &Envelope::new(event, None, serde_json::to_value(&request).unwrap_or_default()),
    );
    Ok(Json(request))
}
