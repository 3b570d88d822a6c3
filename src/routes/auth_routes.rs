use crate::auth::{
    hash_password, issue_token, validate_display_name, validate_password, validate_username,
    verify_password, AuthUser,
};
use crate::clock;
use crate::db::{self, Db};
use crate::errors::{ApiError, ApiResult};
use crate::models::*;
use rocket::serde::json::Json;
use rocket::{get, post, State};
use rusqlite::{params, OptionalExtension};

#[post("/v1/auth/register", format = "json", data = "<body>")]
pub fn register(db: &State<Db>, body: Json<RegisterRequest>) -> ApiResult<AuthResponse> {
    let username = body.username.trim().to_string();
    let display_name = body.display_name.trim().to_string();
    validate_username(&username)?;
    validate_display_name(&display_name)?;
    validate_password(&body.password)?;

    let password_hash = hash_password(&body.password)?;
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();

    let taken: i64 = conn.query_row(
        "SELECT COUNT(*) FROM users WHERE username = ?1",
        params![&username],
        |r| r.get(0),
    )?;
    if taken > 0 {
        return Err(ApiError::exists("username already taken"));
    }

    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users (id, username, password_hash, display_name, created_at_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![&id, &username, &password_hash, &display_name, now],
    )?;
    let (token, expires_at_ms) = issue_token(&conn, &id, body.device_info.as_deref(), now)?;
    let user = db::get_user(&conn, &id)?.ok_or_else(|| ApiError::internal("user vanished"))?;

    Ok(Json(AuthResponse {
        token,
        expires_at_ms,
        user,
    }))
}

#[post("/v1/auth/login", format = "json", data = "<body>")]
pub fn login(db: &State<Db>, body: Json<LoginRequest>) -> ApiResult<AuthResponse> {
    let username = body.username.trim();
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();

    let row = conn
        .query_row(
            "SELECT id, password_hash FROM users WHERE username = ?1",
            params![username],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )
        .optional()?;
    let (user_id, password_hash) =
        row.ok_or_else(|| ApiError::validation("unknown username or wrong password"))?;
    if !verify_password(&body.password, &password_hash) {
        return Err(ApiError::validation("unknown username or wrong password"));
    }

    let (token, expires_at_ms) = issue_token(&conn, &user_id, body.device_info.as_deref(), now)?;
    let user =
        db::get_user(&conn, &user_id)?.ok_or_else(|| ApiError::internal("user vanished"))?;

    Ok(Json(AuthResponse {
        token,
        expires_at_ms,
        user,
    }))
}

#[post("/v1/auth/logout")]
pub fn logout(db: &State<Db>, user: AuthUser) -> ApiResult<serde_json::Value> {
    let conn = db.conn.lock().unwrap();
    conn.execute("DELETE FROM auth_tokens WHERE token = ?1", params![&user.token])?;
    Ok(Json(serde_json::json!({"loggedOut": true})))
}

#[get("/v1/auth/me")]
pub fn me(db: &State<Db>, user: AuthUser) -> ApiResult<User> {
    let conn = db.conn.lock().unwrap();
    let row = db::get_user(&conn, &user.user_id)?.ok_or_else(|| ApiError::not_found("user"))?;
    Ok(Json(row))
}
