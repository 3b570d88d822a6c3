use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use std::io::Cursor;

/// Every error surfaced over HTTP: a machine code, a human message, and the
/// status the code family maps to. Engines construct these with the helpers
/// below; the Responder writes the `{"error":{"code","message"}}` envelope.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub status: Status,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    fn new(status: Status, code: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(Status::BadRequest, "VALIDATION", message)
    }

    pub fn cannot_chat_self() -> Self {
        Self::new(
            Status::BadRequest,
            "CANNOT_CHAT_SELF",
            "cannot open a session with yourself",
        )
    }

    pub fn unauthenticated() -> Self {
        Self::new(Status::Unauthorized, "UNAUTHENTICATED", "missing credentials")
    }

    pub fn token_invalid() -> Self {
        Self::new(Status::Unauthorized, "TOKEN_INVALID", "token is not recognized")
    }

    pub fn token_expired() -> Self {
        Self::new(Status::Unauthorized, "TOKEN_EXPIRED", "token has expired")
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(Status::Forbidden, "ACCESS_DENIED", message)
    }

    pub fn session_access_denied() -> Self {
        Self::new(
            Status::Forbidden,
            "SESSION_ACCESS_DENIED",
            "not a participant of this session",
        )
    }

    pub fn not_found(what: &str) -> Self {
        Self::new(Status::NotFound, "NOT_FOUND", format!("{what} not found"))
    }

    pub fn exists(message: impl Into<String>) -> Self {
        Self::new(Status::Conflict, "EXISTS", message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(Status::Conflict, "INVALID_STATE", message)
    }

    pub fn session_archived() -> Self {
        Self::new(Status::Conflict, "SESSION_ARCHIVED", "session is archived")
    }

    pub fn already_friends() -> Self {
        Self::new(Status::Conflict, "ALREADY_FRIENDS", "users are already friends")
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(Status::Conflict, "RATE_LIMITED", message)
    }

    pub fn cooldown(message: impl Into<String>) -> Self {
        Self::new(Status::Conflict, "COOLDOWN", message)
    }

    pub fn home_base_limited() -> Self {
        Self::new(
            Status::Conflict,
            "HOME_BASE_LIMITED",
            "home base can be moved at most 3 times per day",
        )
    }

    pub fn invite_invalid() -> Self {
        Self::new(Status::NotFound, "INVITE_INVALID", "invite code is not recognized")
    }

    pub fn invite_expired() -> Self {
        Self::new(Status::Conflict, "INVITE_EXPIRED", "invite has expired")
    }

    pub fn geo_required() -> Self {
        Self::new(
            Status::BadRequest,
            "GEO_REQUIRED",
            "this invite requires your current coordinates",
        )
    }

    pub fn geo_forbidden() -> Self {
        Self::new(
            Status::Forbidden,
            "GEO_FORBIDDEN",
            "you are outside the invite's allowed area",
        )
    }

    pub fn wechat_not_configured() -> Self {
        Self::new(
            Status::NotImplemented,
            "WECHAT_NOT_CONFIGURED",
            "WeChat integration is not configured on this server",
        )
    }

    pub fn wechat_not_bound() -> Self {
        Self::new(
            Status::PreconditionFailed,
            "WECHAT_NOT_BOUND",
            "no WeChat account is bound to this user",
        )
    }

    pub fn wechat_api(message: impl Into<String>) -> Self {
        Self::new(Status::BadGateway, "WECHAT_API", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Status::InternalServerError, "INTERNAL", message)
    }

    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({"error": {"code": self.code, "message": self.message}})
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for ApiError {
    fn respond_to(self, _req: &'r Request<'_>) -> response::Result<'o> {
        let body = self.body().to_string();
        Response::build()
            .status(self.status)
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}

pub type ApiResult<T> = Result<rocket::serde::json::Json<T>, ApiError>;
