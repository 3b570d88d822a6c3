use crate::auth::AuthUser;
use crate::clock;
use crate::db::{self, Db, ACTIVITY_COLS};
use crate::errors::{ApiError, ApiResult};
use crate::hub::{Envelope, Hub};
use crate::invites::{self, InviteKind};
use crate::models::*;
use rocket::serde::json::Json;
use rocket::{get, post, put, State};
use rusqlite::{params, Connection, OptionalExtension};

fn get_activity(conn: &Connection, id: &str) -> rusqlite::Result<Option<Activity>> {
    conn.query_row(
        &format!("SELECT {ACTIVITY_COLS} FROM activities WHERE id = ?1"),
        params![id],
        |row| db::map_activity(row),
    )
    .optional()
}

/// Opportunistic archival: reads that touch an ended activity archive its
/// session right away instead of waiting for the sweeper.
fn archive_if_expired(conn: &Connection, activity: &Activity, now: i64) -> rusqlite::Result<()> {
    if let Some(end_at_ms) = activity.end_at_ms {
        if end_at_ms <= now {
            conn.execute(
                "UPDATE sessions SET status = 'archived', updated_at_ms = ?1
                 WHERE id = ?2 AND status = 'active'",
                params![now, &activity.id],
            )?;
        }
    }
    Ok(())
}

fn validate_activity_times(
    start_at_ms: Option<i64>,
    end_at_ms: Option<i64>,
    now: i64,
) -> Result<(), ApiError> {
    if let Some(end) = end_at_ms {
        if end <= now {
            return Err(ApiError::validation("endAtMs must be in the future"));
        }
        if let Some(start) = start_at_ms {
            if end <= start {
                return Err(ApiError::validation("endAtMs must be after startAtMs"));
            }
        }
    }
    Ok(())
}

/// One transaction creates the group session (creator sentinel pair), the
/// creator's participant row, the activity, its stable invite, and the
/// creator's default 「活动」 group assignment.
#[post("/v1/activities", format = "json", data = "<body>")]
pub fn create_activity(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    body: Json<CreateActivityRequest>,
) -> ApiResult<ActivityResponse> {
    let title = body.title.trim().to_string();
    if title.is_empty() || title.chars().count() > 50 {
        return Err(ApiError::validation("title must be 1-50 characters"));
    }
    if let Some(description) = body.description.as_deref() {
        if description.chars().count() > 500 {
            return Err(ApiError::validation("description must be at most 500 characters"));
        }
    }
    let now = clock::now_ms();
    validate_activity_times(body.start_at_ms, body.end_at_ms, now)?;

    let (activity, session, invite_code) = {
        let conn = db.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let session_id = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO sessions (id, user1_id, user2_id, source, kind, status, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?2, 'activity', 'group', 'active', ?3, ?3)",
            params![&session_id, &user.user_id, now],
        )?;
        tx.execute(
            "INSERT INTO session_participants (session_id, user_id, role, status, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, 'creator', 'active', ?3, ?3)",
            params![&session_id, &user.user_id, now],
        )?;
        tx.execute(
            "INSERT INTO activities (id, creator_id, title, description, start_at_ms, end_at_ms, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                &session_id,
                &user.user_id,
                &title,
                body.description.as_deref().map(str::trim),
                body.start_at_ms,
                body.end_at_ms,
                now
            ],
        )?;
        let invite = invites::get_or_create(&tx, InviteKind::Activity, &session_id, now)?;
        db::assign_default_group(&tx, &session_id, &user.user_id, "活动", now)?;
        tx.commit()?;

        let activity = get_activity(&conn, &session_id)?
            .ok_or_else(|| ApiError::internal("activity vanished"))?;
        let session = db::get_session(&conn, &session_id)?
            .ok_or_else(|| ApiError::internal("session vanished"))?;
        (activity, session, invite.code)
    };

    hub.send_to_user(
        &user.user_id,
        &Envelope::new(
            "session.created",
            Some(session.id.clone()),
            serde_json::to_value(&session).unwrap_or_default(),
        ),
    );
    Ok(Json(ActivityResponse {
        activity,
        session,
        invite_code,
    }))
}

#[get("/v1/activities")]
pub fn list_activities(db: &State<Db>, user: AuthUser) -> ApiResult<Vec<Activity>> {
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();
    let mut stmt = conn.prepare(
        "SELECT a.id, a.creator_id, a.title, a.description, a.start_at_ms, a.end_at_ms,
                a.created_at_ms, a.updated_at_ms
         FROM activities a
         JOIN session_participants p ON p.session_id = a.id
         WHERE p.user_id = ?1 AND p.status = 'active'
         ORDER BY a.updated_at_ms DESC",
    )?;
    let activities: Vec<Activity> = stmt
        .query_map(params![&user.user_id], |row| db::map_activity(row))?
        .filter_map(|r| r.ok())
        .collect();
    for activity in &activities {
        archive_if_expired(&conn, activity, now)?;
    }
    Ok(Json(activities))
}

#[get("/v1/activities/<id>")]
pub fn get_activity_route(
    db: &State<Db>,
    user: AuthUser,
    id: &str,
) -> ApiResult<ActivityJoinResponse> {
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();
    let activity = get_activity(&conn, id)?.ok_or_else(|| ApiError::not_found("activity"))?;
    archive_if_expired(&conn, &activity, now)?;
    let session =
        db::get_session(&conn, id)?.ok_or_else(|| ApiError::not_found("session"))?;
    if !db::is_session_participant(&conn, &session, &user.user_id)? {
        return Err(ApiError::session_access_denied());
    }
    Ok(Json(ActivityJoinResponse {
        activity,
        session,
        joined: false,
    }))
}

#[get("/v1/activities/<id>/invite")]
pub fn activity_invite(db: &State<Db>, user: AuthUser, id: &str) -> ApiResult<InviteResponse> {
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();
    let session = db::get_session(&conn, id)?.ok_or_else(|| ApiError::not_found("activity"))?;
    if !db::is_session_participant(&conn, &session, &user.user_id)? {
        return Err(ApiError::session_access_denied());
    }
    let invite = invites::get_or_create(&conn, InviteKind::Activity, id, now)?;
    Ok(Json(invite.to_response()))
}

#[put("/v1/activities/<id>/invite", format = "json", data = "<body>")]
pub fn update_activity_invite(
    db: &State<Db>,
    user: AuthUser,
    id: &str,
    body: Json<InviteSettingsRequest>,
) -> ApiResult<InviteResponse> {
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();
    let activity = get_activity(&conn, id)?.ok_or_else(|| ApiError::not_found("activity"))?;
    if activity.creator_id != user.user_id {
        return Err(ApiError::access_denied("only the creator can change the invite"));
    }
    let invite = invites::update_settings(&conn, InviteKind::Activity, id, &body, now)?;
    Ok(Json(invite.to_response()))
}

#[post("/v1/activities/invites/consume", format = "json", data = "<body>")]
pub fn consume_activity_invite(
    db: &State<Db>,
    user: AuthUser,
    body: Json<ConsumeInviteRequest>,
) -> ApiResult<ActivityJoinResponse> {
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();
    let invite = invites::resolve_code(&conn, InviteKind::Activity, body.code.trim())?;
    invites::check_gates(&invite, body.at_lat, body.at_lng, now)?;

    let activity = get_activity(&conn, &invite.owner_id)?
        .ok_or_else(|| ApiError::not_found("activity"))?;
    if let Some(end_at_ms) = activity.end_at_ms {
        if end_at_ms <= now {
            archive_if_expired(&conn, &activity, now)?;
            return Err(ApiError::invalid_state("activity has ended"));
        }
    }
    let session = db::get_session(&conn, &activity.id)?
        .ok_or_else(|| ApiError::not_found("session"))?;
    if session.status == "archived" {
        return Err(ApiError::session_archived());
    }

    let existing_status: Option<String> = conn
        .query_row(
            "SELECT status FROM session_participants WHERE session_id = ?1 AND user_id = ?2",
            params![&activity.id, &user.user_id],
            |r| r.get(0),
        )
        .optional()?;
    let joined = match existing_status.as_deref() {
        Some("active") => false,
        Some(_) => {
            // A left or removed member re-enters as a plain member.
            conn.execute(
                "UPDATE session_participants
                 SET role = 'member', status = 'active', updated_at_ms = ?1
                 WHERE session_id = ?2 AND user_id = ?3",
                params![now, &activity.id, &user.user_id],
            )?;
            true
        }
        None => {
            conn.execute(
                "INSERT INTO session_participants (session_id, user_id, role, status, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, 'member', 'active', ?3, ?3)",
                params![&activity.id, &user.user_id, now],
            )?;
            true
        }
    };

    Ok(Json(ActivityJoinResponse {
        activity,
        session,
        joined,
    }))
}

#[get("/v1/activities/<id>/members")]
pub fn list_members(db: &State<Db>, user: AuthUser, id: &str) -> ApiResult<Vec<ActivityMember>> {
    let conn = db.conn.lock().unwrap();
    let session = db::get_session(&conn, id)?.ok_or_else(|| ApiError::not_found("activity"))?;
    if !db::is_session_participant(&conn, &session, &user.user_id)? {
        return Err(ApiError::session_access_denied());
    }
    let mut stmt = conn.prepare(
        "SELECT u.id, u.username, u.display_name, u.avatar_url, p.role, p.created_at_ms
         FROM session_participants p JOIN users u ON u.id = p.user_id
         WHERE p.session_id = ?1 AND p.status = 'active'
         ORDER BY p.created_at_ms ASC",
    )?;
    let members: Vec<ActivityMember> = stmt
        .query_map(params![id], |row| {
            Ok(ActivityMember {
                user: UserSummary {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    display_name: row.get(2)?,
                    avatar_url: row.get(3)?,
                },
                role: row.get(4)?,
                joined_at_ms: row.get(5)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Json(members))
}

/// Only the creator removes members, and never themselves. A removed member
/// fails the participant check from then on.
#[post("/v1/activities/<id>/members/<uid>/remove")]
pub fn remove_member(
    db: &State<Db>,
    user: AuthUser,
    id: &str,
    uid: &str,
) -> ApiResult<serde_json::Value> {
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();
    let activity = get_activity(&conn, id)?.ok_or_else(|| ApiError::not_found("activity"))?;
    if activity.creator_id != user.user_id {
        return Err(ApiError::access_denied("only the creator can remove members"));
    }
    if uid == user.user_id {
        return Err(ApiError::access_denied("the creator cannot remove themselves"));
    }
    let updated = conn.execute(
        "UPDATE session_participants
         SET status = 'removed', updated_at_ms = ?1
         WHERE session_id = ?2 AND user_id = ?3 AND status = 'active'",
        params![now, id, uid],
    )?;
    if updated == 0 {
        return Err(ApiError::not_found("member"));
    }
    Ok(Json(serde_json::json!({"removed": true})))
}

/// Extending the end time also lifts an auto-archived session back to
/// active, atomically.
#[post("/v1/activities/<id>/extend", format = "json", data = "<body>")]
pub fn extend_activity(
    db: &State<Db>,
    hub: &State<Hub>,
    user: AuthUser,
    id: &str,
    body: Json<ExtendActivityRequest>,
) -> ApiResult<ActivityJoinResponse> {
    let now = clock::now_ms();
    if body.end_at_ms <= now {
        return Err(ApiError::validation("endAtMs must be in the future"));
    }
    let (activity, session, reactivated, members) = {
        let conn = db.conn.lock().unwrap();
        let activity = get_activity(&conn, id)?.ok_or_else(|| ApiError::not_found("activity"))?;
        if activity.creator_id != user.user_id {
            return Err(ApiError::access_denied("only the creator can extend"));
        }
        let session =
            db::get_session(&conn, id)?.ok_or_else(|| ApiError::not_found("session"))?;

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE activities SET end_at_ms = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![body.end_at_ms, now, id],
        )?;
        let reactivated = session.status == "archived";
        if reactivated {
            tx.execute(
                "UPDATE sessions SET status = 'active', reactivated_at_ms = ?1, updated_at_ms = ?1
                 WHERE id = ?2",
                params![now, id],
            )?;
        }
        tx.commit()?;

        let activity = get_activity(&conn, id)?
            .ok_or_else(|| ApiError::internal("activity vanished"))?;
        let session = db::get_session(&conn, id)?
            .ok_or_else(|| ApiError::internal("session vanished"))?;
        let members = db::session_member_ids(&conn, &session)?;
        (activity, session, reactivated, members)
    };

    if reactivated {
        hub.send_to_users(
            &members,
            &Envelope::new(
                "session.reactivated",
                Some(session.id.clone()),
                serde_json::to_value(&session).unwrap_or_default(),
            ),
        );
    }
    Ok(Json(ActivityJoinResponse {
        activity,
        session,
        joined: false,
    }))
}

#[get("/v1/activities/<id>/reminders")]
pub fn get_reminder(db: &State<Db>, user: AuthUser, id: &str) -> ApiResult<ReminderView> {
    let conn = db.conn.lock().unwrap();
    let row = conn
        .query_row(
            "SELECT activity_id, remind_at_ms, status, sent_at_ms, last_error
             FROM activity_reminders WHERE activity_id = ?1 AND user_id = ?2",
            params![id, &user.user_id],
            |r| {
                Ok(ReminderView {
                    activity_id: r.get(0)?,
                    remind_at_ms: r.get(1)?,
                    status: r.get(2)?,
                    sent_at_ms: r.get(3)?,
                    last_error: r.get(4)?,
                })
            },
        )
        .optional()?;
    let row = row.ok_or_else(|| ApiError::not_found("reminder"))?;
    Ok(Json(row))
}

/// A timestamp subscribes (or re-subscribes after a failure); null cancels.
/// Reminders deliver over WeChat, so subscribing requires a binding.
#[put("/v1/activities/<id>/reminders", format = "json", data = "<body>")]
pub fn put_reminder(
    db: &State<Db>,
    user: AuthUser,
    id: &str,
    body: Json<ReminderRequest>,
) -> ApiResult<ReminderView> {
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();
    let session = db::get_session(&conn, id)?.ok_or_else(|| ApiError::not_found("activity"))?;
    if !db::is_session_participant(&conn, &session, &user.user_id)? {
        return Err(ApiError::session_access_denied());
    }
    let activity = get_activity(&conn, id)?.ok_or_else(|| ApiError::not_found("activity"))?;

    match body.remind_at_ms {
        Some(remind_at_ms) => {
            if remind_at_ms <= now {
                return Err(ApiError::validation("remindAtMs must be in the future"));
            }
            if let Some(end_at_ms) = activity.end_at_ms {
                if remind_at_ms > end_at_ms {
                    return Err(ApiError::validation(
                        "remindAtMs must be before the activity ends",
                    ));
                }
            }
            let bound: i64 = conn.query_row(
                "SELECT COUNT(*) FROM wechat_bindings WHERE user_id = ?1",
                params![&user.user_id],
                |r| r.get(0),
            )?;
            if bound == 0 {
                return Err(ApiError::wechat_not_bound());
            }
            conn.execute(
                "INSERT INTO activity_reminders
                     (activity_id, user_id, remind_at_ms, status, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?4)
                 ON CONFLICT (activity_id, user_id) DO UPDATE SET
                     remind_at_ms = excluded.remind_at_ms,
                     status = 'pending',
                     sent_at_ms = NULL,
                     last_error = NULL,
                     updated_at_ms = excluded.updated_at_ms",
                params![id, &user.user_id, remind_at_ms, now],
            )?;
        }
        None => {
            let updated = conn.execute(
                "UPDATE activity_reminders SET status = 'canceled', updated_at_ms = ?1
                 WHERE activity_id = ?2 AND user_id = ?3",
                params![now, id, &user.user_id],
            )?;
            if updated == 0 {
                return Err(ApiError::not_found("reminder"));
            }
        }
    }

    drop(conn);
    get_reminder(db, user, id)
}
