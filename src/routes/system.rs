use crate::db::Db;
use crate::errors::ApiError;
use rocket::http::Status;
use rocket::{catch, get, Request, State};

#[get("/healthz")]
pub fn healthz() -> &'static str {
    "ok"
}

#[get("/readyz")]
pub fn readyz(db: &State<Db>) -> (Status, &'static str) {
    let conn = db.conn.lock().unwrap();
    match conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0)) {
        Ok(_) => (Status::Ok, "ready"),
        Err(_) => (Status::ServiceUnavailable, "database unavailable"),
    }
}

// --- Catchers: every error body is the same JSON envelope ---

#[catch(400)]
pub fn bad_request() -> ApiError {
    ApiError::validation("malformed request")
}

#[catch(401)]
pub fn unauthorized(req: &Request) -> ApiError {
    // The AuthUser guard caches the specific failure (missing vs invalid vs
    // expired token) before forwarding the 401.
    req.local_cache(|| Option::<ApiError>::None)
        .clone()
        .unwrap_or_else(ApiError::unauthenticated)
}

#[catch(404)]
pub fn not_found() -> ApiError {
    ApiError::not_found("resource")
}

#[catch(405)]
pub fn method_not_allowed() -> ApiError {
    ApiError {
        status: Status::MethodNotAllowed,
        code: "METHOD_NOT_ALLOWED",
        message: "method not allowed".to_string(),
    }
}

#[catch(422)]
pub fn unprocessable() -> ApiError {
    ApiError::validation("request body failed to parse")
}

#[catch(500)]
pub fn internal_error() -> ApiError {
    ApiError::internal("internal server error")
}
