use crate::clock;
use crate::db::{generate_token, Db};
use crate::errors::ApiError;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rusqlite::{params, Connection, OptionalExtension};

/// Token lifetime: 7 days.
pub const TOKEN_TTL_MS: i64 = 7 * 24 * 3600 * 1000;

/// Authenticated caller, resolved from `Authorization: Bearer <token>` or the
/// `?token=` query parameter. Carries the token's issue time: burn messages
/// created before a token's issue are hidden from that token's history view.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    pub token: String,
    pub token_created_at_ms: i64,
}

pub fn validate_username(username: &str) -> Result<(), ApiError> {
    let len = username.len();
    if !(4..=20).contains(&len)
        || !username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ApiError::validation(
            "username must be 4-20 characters of a-z, A-Z, 0-9 or _",
        ));
    }
    Ok(())
}

pub fn validate_display_name(name: &str) -> Result<(), ApiError> {
    let len = name.chars().count();
    if !(1..=20).contains(&len) {
        return Err(ApiError::validation("displayName must be 1-20 characters"));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), ApiError> {
    let len = password.len();
    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !(8..=32).contains(&len) || !has_upper || !has_lower || !has_digit {
        return Err(ApiError::validation(
            "password must be 8-32 characters with at least one upper, one lower and one digit",
        ));
    }
    Ok(())
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(|e| ApiError::internal(e.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// Insert a fresh token row for the user. Returns (token, expires_at_ms).
pub fn issue_token(
    conn: &Connection,
    user_id: &str,
    device_info: Option<&str>,
    now_ms: i64,
) -> rusqlite::Result<(String, i64)> {
    let token = generate_token();
    let expires_at_ms = now_ms + TOKEN_TTL_MS;
    conn.execute(
        "INSERT INTO auth_tokens (token, user_id, device_info, created_at_ms, expires_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![&token, user_id, device_info, now_ms, expires_at_ms],
    )?;
    Ok((token, expires_at_ms))
}

fn token_from_request(req: &Request<'_>) -> Option<String> {
    if let Some(auth) = req.headers().get_one("Authorization") {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    match req.query_value::<String>("token") {
        Some(Ok(token)) => Some(token),
        _ => None,
    }
}

fn authenticate(req: &Request<'_>) -> Result<AuthUser, ApiError> {
    let token = token_from_request(req).ok_or_else(ApiError::unauthenticated)?;
    let db = req
        .rocket()
        .state::<Db>()
        .ok_or_else(|| ApiError::internal("database not managed"))?;
    let conn = db.conn.lock().unwrap();
    let row = conn
        .query_row(
            "SELECT t.user_id, t.created_at_ms, t.expires_at_ms, u.username, u.display_name
             FROM auth_tokens t JOIN users u ON u.id = t.user_id
             WHERE t.token = ?1",
            params![&token],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .map_err(ApiError::from)?;

    let (user_id, created_at_ms, expires_at_ms, username, display_name) =
        row.ok_or_else(ApiError::token_invalid)?;
    if expires_at_ms <= clock::now_ms() {
        return Err(ApiError::token_expired());
    }
    Ok(AuthUser {
        user_id,
        username,
        display_name,
        token,
        token_created_at_ms: created_at_ms,
    })
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthUser {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match authenticate(req) {
            Ok(user) => Outcome::Success(user),
            Err(e) => {
                // The 401 catcher reads the specific error back out.
                req.local_cache(|| Some(e));
                Outcome::Error((Status::Unauthorized, ()))
            }
        }
    }
}
