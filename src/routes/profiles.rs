use crate::auth::AuthUser;
use crate::clock;
use crate::db::{self, Db};
use crate::errors::{ApiError, ApiResult};
use crate::models::*;
use rocket::serde::json::Json;
use rocket::{get, put, State};
use rusqlite::{params, Connection, OptionalExtension};

fn check_view(view: &str) -> Result<(), ApiError> {
    match view {
        "card" | "map" => Ok(()),
        _ => Err(ApiError::not_found("profile view")),
    }
}

fn load_profile(
    conn: &Connection,
    user: &AuthUser,
    view: &str,
) -> Result<ProfileView, ApiError> {
    let row = conn
        .query_row(
            "SELECT nickname, avatar_url, fields_json FROM user_profiles
             WHERE user_id = ?1 AND view = ?2",
            params![&user.user_id, view],
            |r| {
                Ok((
                    r.get::<_, Option<String>>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    let (nickname, avatar_url, fields_json) =
        row.unwrap_or((None, None, "{}".to_string()));

    let core = db::get_user(conn, &user.user_id)?.ok_or_else(|| ApiError::not_found("user"))?;
    let resolved_nickname = nickname.clone().unwrap_or_else(|| core.display_name.clone());
    let resolved_avatar_url = avatar_url.clone().or(core.avatar_url);

    Ok(ProfileView {
        view: view.to_string(),
        nickname,
        avatar_url,
        fields: serde_json::from_str(&fields_json).unwrap_or(serde_json::json!({})),
        resolved_nickname,
        resolved_avatar_url,
    })
}

#[get("/v1/profiles/<view>")]
pub fn get_profile(db: &State<Db>, user: AuthUser, view: &str) -> ApiResult<ProfileView> {
    check_view(view)?;
    let conn = db.conn.lock().unwrap();
    Ok(Json(load_profile(&conn, &user, view)?))
}

#[put("/v1/profiles/<view>", format = "json", data = "<body>")]
pub fn put_profile(
    db: &State<Db>,
    user: AuthUser,
    view: &str,
    body: Json<ProfileRequest>,
) -> ApiResult<ProfileView> {
    check_view(view)?;
    if let Some(nickname) = body.nickname.as_deref() {
        let len = nickname.trim().chars().count();
        if !(1..=20).contains(&len) {
            return Err(ApiError::validation("nickname must be 1-20 characters"));
        }
    }
    // Opaque per-view fields: accepted as any JSON object, stored verbatim.
    let fields_json = match &body.fields {
        Some(value) => {
            if !value.is_object() {
                return Err(ApiError::validation("fields must be a JSON object"));
            }
            Some(value.to_string())
        }
        None => None,
    };

    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();
    conn.execute(
        "INSERT INTO user_profiles (user_id, view, nickname, avatar_url, fields_json, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, COALESCE(?5, '{}'), ?6)
         ON CONFLICT (user_id, view) DO UPDATE SET
             nickname = COALESCE(excluded.nickname, user_profiles.nickname),
             avatar_url = COALESCE(excluded.avatar_url, user_profiles.avatar_url),
             fields_json = CASE WHEN ?5 IS NULL THEN user_profiles.fields_json ELSE ?5 END,
             updated_at_ms = excluded.updated_at_ms",
        params![
            &user.user_id,
            view,
            body.nickname.as_deref().map(str::trim),
            body.avatar_url.as_deref(),
            fields_json,
            now
        ],
    )?;
    Ok(Json(load_profile(&conn, &user, view)?))
}
