use crate::auth::{
    hash_password, validate_display_name, validate_password, verify_password, AuthUser,
};
use crate::clock;
use crate::db::{self, Db};
use crate::errors::{ApiError, ApiResult};
use crate::models::*;
use rocket::serde::json::Json;
use rocket::{get, put, State};
use rusqlite::{params, OptionalExtension};

/// Look up users by exact username (used to start a chat).
#[get("/v1/users?<username>")]
pub fn list_users(
    db: &State<Db>,
    _user: AuthUser,
    username: Option<&str>,
) -> ApiResult<Vec<UserSummary>> {
    let conn = db.conn.lock().unwrap();
    let Some(username) = username.map(str::trim).filter(|s| !s.is_empty()) else {
        return Err(ApiError::validation("username query parameter is required"));
    };
    let mut stmt = conn.prepare(
        "SELECT id, username, display_name, avatar_url FROM users WHERE username = ?1",
    )?;
    let users: Vec<UserSummary> = stmt
        .query_map(params![username], |row| {
            Ok(UserSummary {
                id: row.get(0)?,
                username: row.get(1)?,
                display_name: row.get(2)?,
                avatar_url: row.get(3)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Json(users))
}

#[get("/v1/users/me")]
pub fn get_me(db: &State<Db>, user: AuthUser) -> ApiResult<User> {
    let conn = db.conn.lock().unwrap();
    let row = db::get_user(&conn, &user.user_id)?.ok_or_else(|| ApiError::not_found("user"))?;
    Ok(Json(row))
}

#[get("/v1/users/<id>", rank = 2)]
pub fn get_user_by_id(db: &State<Db>, _user: AuthUser, id: &str) -> ApiResult<UserSummary> {
    let conn = db.conn.lock().unwrap();
    let row = db::get_user_summary(&conn, id)?.ok_or_else(|| ApiError::not_found("user"))?;
    Ok(Json(row))
}

#[put("/v1/users/me", format = "json", data = "<body>")]
pub fn update_me(db: &State<Db>, user: AuthUser, body: Json<UpdateMeRequest>) -> ApiResult<User> {
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();

    if let Some(display_name) = body.display_name.as_deref().map(str::trim) {
        validate_display_name(display_name)?;
        conn.execute(
            "UPDATE users SET display_name = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![display_name, now, &user.user_id],
        )?;
    }
    if let Some(avatar_url) = body.avatar_url.as_deref() {
        conn.execute(
            "UPDATE users SET avatar_url = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![avatar_url, now, &user.user_id],
        )?;
    }
    if let Some(new_password) = body.new_password.as_deref() {
        let old_password = body
            .old_password
            .as_deref()
            .ok_or_else(|| ApiError::validation("oldPassword is required to change password"))?;
        let current_hash: Option<String> = conn
            .query_row(
                "SELECT password_hash FROM users WHERE id = ?1",
                params![&user.user_id],
                |r| r.get(0),
            )
            .optional()?;
        let current_hash = current_hash.ok_or_else(|| ApiError::not_found("user"))?;
        if !verify_password(old_password, &current_hash) {
            return Err(ApiError::access_denied("old password does not match"));
        }
        validate_password(new_password)?;
        let new_hash = hash_password(new_password)?;
        conn.execute(
            "UPDATE users SET password_hash = ?1, updated_at_ms = ?2 WHERE id = ?3",
            params![&new_hash, now, &user.user_id],
        )?;
    }

    let row = db::get_user(&conn, &user.user_id)?.ok_or_else(|| ApiError::not_found("user"))?;
    Ok(Json(row))
}
