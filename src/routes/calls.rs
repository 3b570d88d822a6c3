use crate::auth::AuthUser;
use crate::clock;
use crate::db::{self, Db, CALL_COLS};
use crate::errors::{ApiError, ApiResult};
use crate::hub::{Envelope, Hub};
use crate::models::*;
use rocket::serde::json::Json;
use rocket::{get, post, State};
use rusqlite::{params, Connection, OptionalExtension};

fn get_call(conn: &Connection, id: &str) -> rusqlite::Result<Option<Call>> {
    conn.query_row(
        &format!("SELECT {CALL_COLS} FROM calls WHERE id = ?1"),
        params![id],
        |row| db::map_call(row),
    )
    .optional()
}

fn call_event(hub: &Hub, event: &str, call: &Call, target: &str) {
    hub.send_to_user(
        target,
        &Envelope::new(
            event,
            Some(call.session_id.clone()),
            serde_json::to_value(call).unwrap_or_default(),
        ),
    );
}

/// Ring the peer of a direct session. The call row is what authorizes
/// audio/video frame relay over the realtime socket.
#[post("/v1/calls", format = "json", data = "<body>")]
pub fn create_call(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    body: Json<CreateCallRequest>,
) -> ApiResult<Call> {
    let now = clock::now_ms();
    let call = {
        let conn = db.conn.lock().unwrap();
        let session = super::load_session_for_participant(&conn, &body.session_id, &user.user_id)?;
        if session.kind != "direct" {
            return Err(ApiError::validation("calls are only available in direct sessions"));
        }
        if session.status == "archived" {
            return Err(ApiError::session_archived());
        }
        let callee_id = db::direct_peer_id(&session, &user.user_id);
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO calls (id, session_id, caller_id, callee_id, status, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, 'ringing', ?5, ?5)",
            params![&id, &session.id, &user.user_id, &callee_id, now],
        )?;
        get_call(&conn, &id)?.ok_or_else(|| ApiError::internal("call vanished"))?
    };
    call_event(hub, "call.invited", &call, &call.callee_id);
    Ok(Json(call))
}

#[get("/v1/calls/<id>")]
pub fn get_call_route(db: &State<Db>, user: AuthUser, id: &str) -> ApiResult<Call> {
    let conn = db.conn.lock().unwrap();
    let call = get_call(&conn, id)?.ok_or_else(|| ApiError::not_found("call"))?;
    if call.caller_id != user.user_id && call.callee_id != user.user_id {
        return Err(ApiError::access_denied("not a party of this call"));
    }
    Ok(Json(call))
}

#[post("/v1/calls/<id>/accept")]
pub fn accept_call(db: &State<Db>, hub: &State<Hub>, user: AuthUser, id: &str) -> ApiResult<Call> {
    transition(db, hub, user, id, "accepted")
}

#[post("/v1/calls/<id>/reject")]
pub fn reject_call(db: &State<Db>, hub: &State<Hub>, user: AuthUser, id: &str) -> ApiResult<Call> {
    transition(db, hub, user, id, "rejected")
}

#[post("/v1/calls/<id>/hangup")]
pub fn hangup_call(db: &State<Db>, hub: &State<Hub>, user: AuthUser, id: &str) -> ApiResult<Call> {
    transition(db, hub, user, id, "ended")
}

fn transition(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    id: &str,
    target: &str,
) -> ApiResult<Call> {
    let now = clock::now_ms();
    let (call, notify_user) = {
        let conn = db.conn.lock().unwrap();
        let call = get_call(&conn, id)?.ok_or_else(|| ApiError::not_found("call"))?;
        match target {
            "accepted" | "rejected" => {
                if call.callee_id != user.user_id {
                    return Err(ApiError::access_denied("only the callee can answer"));
                }
                if call.status != "ringing" {
                    return Err(ApiError::invalid_state("call is not ringing"));
                }
            }
            _ => {
                if call.caller_id != user.user_id && call.callee_id != user.user_id {
                    return Err(ApiError::access_denied("not a party of this call"));
                }
                if call.status != "ringing" && call.status != "accepted" {
                    return Err(ApiError::invalid_state("call is already over"));
                }
            }
        }
        conn.execute(
            "UPDATE calls SET status = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![target, now, id],
        )?;
        let call = get_call(&conn, id)?.ok_or_else(|| ApiError::internal("call vanished"))?;
        let notify_user = if call.caller_id == user.user_id {
            call.callee_id.clone()
        } else {
            call.caller_id.clone()
        };
        (call, notify_user)
    };
    let event = match target {
        "accepted" => "call.accepted",
        "rejected" => "call.rejected",
        _ => "call.ended",
    };
    call_event(hub, event, &call, &notify_user);
    Ok(Json(call))
}
