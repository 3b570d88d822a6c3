use crate::auth::AuthUser;
use crate::clock;
use crate::db::Db;
use crate::errors::{ApiError, ApiResult};
use crate::models::*;
use crate::wechat::WeChatClient;
use rocket::serde::json::Json;
use rocket::{post, State};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

/// Exchange a mini-program login code and bind the resulting openid to the
/// caller. Re-binding the same pair is idempotent and refreshes the session
/// key.
#[post("/v1/wechat/bind", format = "json", data = "<body>")]
pub async fn bind_wechat(
    db: &State<Db>,
    wechat: &State<Arc<WeChatClient>>,
    user: AuthUser,
    body: Json<WeChatBindRequest>,
) -> ApiResult<WeChatBindResponse> {
    if !wechat.configured() {
        return Err(ApiError::wechat_not_configured());
    }
    let session = wechat.code_to_session(body.js_code.trim()).await?;
    let now = clock::now_ms();

    let conn = db.conn.lock().unwrap();
    let other_owner: Option<String> = conn
        .query_row(
            "SELECT user_id FROM wechat_bindings WHERE openid = ?1 AND user_id != ?2",
            params![&session.openid, &user.user_id],
            |r| r.get(0),
        )
        .optional()?;
    if other_owner.is_some() {
        return Err(ApiError::exists("this WeChat account is bound to another user"));
    }
    conn.execute(
        "INSERT INTO wechat_bindings (user_id, openid, session_key, unionid, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (user_id) DO UPDATE SET
             openid = excluded.openid,
             session_key = excluded.session_key,
             unionid = excluded.unionid,
             updated_at_ms = excluded.updated_at_ms",
        params![&user.user_id, &session.openid, &session.session_key, &session.unionid, now],
    )?;

    Ok(Json(WeChatBindResponse {
        openid: session.openid,
        bound: true,
    }))
}
