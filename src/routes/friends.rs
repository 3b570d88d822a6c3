use crate::auth::AuthUser;
use crate::clock;
use crate::db::{self, Db, FRIEND_REQUEST_COLS};
use crate::errors::{ApiError, ApiResult};
use crate::hub::{Envelope, Hub};
use crate::invites::{self, InviteKind};
use crate::models::*;
use rocket::serde::json::Json;
use rocket::{get, post, put, State};
use rusqlite::{params, Connection, OptionalExtension};

const REJECT_COOLDOWN_MS: i64 = 3 * 24 * 3600 * 1000;

fn get_request(conn: &Connection, id: &str) -> rusqlite::Result<Option<FriendRequestView>> {
    conn.query_row(
        &format!("SELECT {FRIEND_REQUEST_COLS} FROM friend_requests WHERE id = ?1"),
        params![id],
        |row| db::map_friend_request(row),
    )
    .optional()
}

fn attach_counterpart(conn: &Connection, request: &mut FriendRequestView, viewer_id: &str) {
    let other = if request.requester_id == viewer_id {
        &request.addressee_id
    } else {
        &request.requester_id
    };
    request.counterpart = db::get_user_summary(conn, other).ok().flatten();
}

fn are_friends(conn: &Connection, a: &str, b: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM friends WHERE user_id = ?1 AND friend_id = ?2",
        params![a, b],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

fn open_friend_request(
    conn: &Connection,
    requester_id: &str,
    addressee_id: &str,
    verification_message: Option<&str>,
    now: i64,
) -> Result<(FriendRequestView, bool), ApiError> {
    if requester_id == addressee_id {
        return Err(ApiError::validation("cannot add yourself as a friend"));
    }
    if db::get_user_summary(conn, addressee_id)?.is_none() {
        return Err(ApiError::not_found("user"));
    }
    if are_friends(conn, requester_id, addressee_id)? {
        return Err(ApiError::already_friends());
    }

    let reverse_pending: i64 = conn.query_row(
        "SELECT COUNT(*) FROM friend_requests
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
                "SELECT {FRIEND_REQUEST_COLS} FROM friend_requests
                 WHERE requester_id = ?1 AND addressee_id = ?2"
            ),
            params![requester_id, addressee_id],
            |row| db::map_friend_request(row),
        )
        .optional()?;

    match existing {
        Some(row) if row.status == "pending" => Ok((row, false)),
        Some(row) => {
            if row.status == "rejected" && now <= row.updated_at_ms + REJECT_COOLDOWN_MS {
                return Err(ApiError::cooldown(
                    "a rejected request can be re-opened after 3 days",
                ));
            }
            conn.execute(
                "UPDATE friend_requests
                 SET status = 'pending', verification_message = ?1, updated_at_ms = ?2
                 WHERE id = ?3",
                params![verification_message, now, &row.id],
            )?;
            let row = get_request(conn, &row.id)?
                .ok_or_else(|| ApiError::internal("request vanished"))?;
            Ok((row, false))
        }
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO friend_requests
                     (id, requester_id, addressee_id, status, verification_message,
                      created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?5)",
                params![&id, requester_id, addressee_id, verification_message, now],
            )?;
            let row =
                get_request(conn, &id)?.ok_or_else(|| ApiError::internal("request vanished"))?;
            Ok((row, true))
        }
    }
}

#[get("/v1/friends")]
pub fn list_friends(db: &State<Db>, user: AuthUser) -> ApiResult<Vec<UserSummary>> {
    let conn = db.conn.lock().unwrap();
    let mut stmt = conn.prepare(
        "SELECT u.id, u.username, u.display_name, u.avatar_url
         FROM friends f JOIN users u ON u.id = f.friend_id
         WHERE f.user_id = ?1
         ORDER BY f.created_at_ms DESC",
    )?;
    let friends: Vec<UserSummary> = stmt
        .query_map(params![&user.user_id], |row| {
            Ok(UserSummary {
                id: row.get(0)?,
                username: row.get(1)?,
                display_name: row.get(2)?,
                avatar_url: row.get(3)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Json(friends))
}

#[get("/v1/friends/requests")]
pub fn list_friend_requests(db: &State<Db>, user: AuthUser) -> ApiResult<FriendRequestsResponse> {
    let conn = db.conn.lock().unwrap();
    let fetch = |column: &str| -> rusqlite::Result<Vec<FriendRequestView>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {FRIEND_REQUEST_COLS} FROM friend_requests
             WHERE {column} = ?1 ORDER BY updated_at_ms DESC LIMIT 100"
        ))?;
        let rows = stmt
            .query_map(params![&user.user_id], |row| db::map_friend_request(row))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    };
    let mut incoming = fetch("addressee_id")?;
    let mut outgoing = fetch("requester_id")?;
    for request in incoming.iter_mut().chain(outgoing.iter_mut()) {
        attach_counterpart(&conn, request, &user.user_id);
    }
    Ok(Json(FriendRequestsResponse { incoming, outgoing }))
}

#[post("/v1/friends/requests", format = "json", data = "<body>")]
pub fn create_friend_request(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    body: Json<CreateFriendRequestRequest>,
) -> ApiResult<FriendRequestView> {
    let now = clock::now_ms();
    let request = {
        let conn = db.conn.lock().unwrap();
        let (mut request, _created) = open_friend_request(
            &conn,
            &user.user_id,
            body.addressee_id.trim(),
            body.verification_message.as_deref(),
            now,
        )?;
        attach_counterpart(&conn, &mut request, &user.user_id);
        request
    };
    hub.send_to_user(
        &request.addressee_id,
        &Envelope::new(
            "friend.requested",
            None,
            serde_json::to_value(&request).unwrap_or_default(),
        ),
    );
    Ok(Json(request))
}

#[get("/v1/friends/invites")]
pub fn friend_invite(db: &State<Db>, user: AuthUser) -> ApiResult<InviteResponse> {
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();
    let invite = invites::get_or_create(&conn, InviteKind::Friend, &user.user_id, now)?;
    Ok(Json(invite.to_response()))
}

#[put("/v1/friends/invites", format = "json", data = "<body>")]
pub fn update_friend_invite(
    db: &State<Db>,
    user: AuthUser,
    body: Json<InviteSettingsRequest>,
) -> ApiResult<InviteResponse> {
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();
    let invite = invites::update_settings(&conn, InviteKind::Friend, &user.user_id, &body, now)?;
    Ok(Json(invite.to_response()))
}

#[post("/v1/friends/invites/consume", format = "json", data = "<body>")]
pub fn consume_friend_invite(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    body: Json<ConsumeInviteRequest>,
) -> ApiResult<FriendRequestView> {
    let now = clock::now_ms();
    let request = {
        let conn = db.conn.lock().unwrap();
        let invite = invites::resolve_code(&conn, InviteKind::Friend, body.code.trim())?;
        invites::check_gates(&invite, body.at_lat, body.at_lng, now)?;
        let (mut request, _created) =
            open_friend_request(&conn, &user.user_id, &invite.owner_id, None, now)?;
        attach_counterpart(&conn, &mut request, &user.user_id);
        request
    };
    hub.send_to_user(
        &request.addressee_id,
        &Envelope::new(
            "friend.requested",
            None,
            serde_json::to_value(&request).unwrap_or_default(),
        ),
    );
    Ok(Json(request))
}

/// Accept writes the symmetric friends rows; both inserts are idempotent.
#[post("/v1/friends/requests/<id>/accept")]
pub fn accept_friend_request(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    id: &str,
) -> ApiResult<FriendRequestView> {
    let now = clock::now_ms();
    let request = {
        let conn = db.conn.lock().unwrap();
        let request =
            get_request(&conn, id)?.ok_or_else(|| ApiError::not_found("friend request"))?;
        if request.addressee_id != user.user_id {
            return Err(ApiError::access_denied("only the addressee can accept"));
        }
        if request.status != "pending" {
            return Err(ApiError::invalid_state("request is not pending"));
        }
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE friend_requests SET status = 'accepted', updated_at_ms = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO friends (user_id, friend_id, created_at_ms) VALUES (?1, ?2, ?3)",
            params![&request.requester_id, &request.addressee_id, now],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO friends (user_id, friend_id, created_at_ms) VALUES (?1, ?2, ?3)",
            params![&request.addressee_id, &request.requester_id, now],
        )?;
        tx.commit()?;
        let mut request = get_request(&conn, id)?
            .ok_or_else(|| ApiError::internal("request vanished"))?;
        attach_counterpart(&conn, &mut request, &user.user_id);
        request
    };
    hub.send_to_users(
        &[request.requester_id.clone(), request.addressee_id.clone()],
        &Envelope::new(
            "friend.accepted",
            None,
            serde_json::to_value(&request).unwrap_or_default(),
        ),
    );
    Ok(Json(request))
}

#[post("/v1/friends/requests/<id>/reject")]
pub fn reject_friend_request(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    id: &str,
) -> ApiResult<FriendRequestView> {
    transition_friend_request(db, hub, user, id, "rejected")
}

#[post("/v1/friends/requests/<id>/cancel")]
pub fn cancel_friend_request(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    id: &str,
) -> ApiResult<FriendRequestView> {
    transition_friend_request(db, hub, user, id, "canceled")
}

fn transition_friend_request(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    id: &str,
    target: &str,
) -> ApiResult<FriendRequestView> {
    let now = clock::now_ms();
    let (request, notify_user) = {
        let conn = db.conn.lock().unwrap();
        let request =
            get_request(&conn, id)?.ok_or_else(|| ApiError::not_found("friend request"))?;
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
            "UPDATE friend_requests SET status = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![target, now, id],
        )?;
        let mut request = get_request(&conn, id)?
            .ok_or_else(|| ApiError::internal("request vanished"))?;
        attach_counterpart(&conn, &mut request, &user.user_id);
        (request, notify_user)
    };
    let event = match target {
        "rejected" => "friend.rejected",
        _ => "friend.canceled",
    };
    hub.send_to_user(
        &notify_user,
        &Envelope::new(event, None, serde_json::to_value(&request).unwrap_or_default()),
    );
    Ok(Json(request))
}
