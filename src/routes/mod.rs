// Route module decomposition — each surface area in its own file.
// Shared validation helpers live here; route functions in submodules.

mod activities;
mod auth_routes;
mod calls;
mod friends;
mod home_base;
mod local_feed;
mod messages;
mod profiles;
mod requests;
mod sessions;
mod system;
#[path = "upload.rs"]
mod upload_mod;
mod users;
mod wechat_routes;
mod ws;

// --- Re-exports (all route functions used by lib.rs mount) ---

pub use activities::{
    activity_invite, consume_activity_invite, create_activity, extend_activity,
    get_activity_route, get_reminder, list_activities, list_members, put_reminder, remove_member,
    update_activity_invite,
};
pub use auth_routes::{login, logout, me, register};
pub use calls::{accept_call, create_call, get_call_route, hangup_call, reject_call};
pub use friends::{
    accept_friend_request, cancel_friend_request, consume_friend_invite, create_friend_request,
    friend_invite, list_friend_requests, list_friends, reject_friend_request,
    update_friend_invite,
};
pub use home_base::{get_home_base, put_home_base};
pub use local_feed::{
    create_post, delete_post, list_my_posts, list_pins, list_user_posts,
};
pub use messages::{create_message, list_messages, read_burn_message};
pub use profiles::{get_profile, put_profile};
pub use requests::{
    accept_session_request, cancel_session_request, consume_session_invite,
    create_session_request, list_session_requests, reject_session_request, session_invite,
    update_session_invite,
};
pub use sessions::{
    archive_session, create_session, get_relationship, hide_session, list_sessions,
    put_relationship, reactivate_session,
};
pub use system::{
    bad_request, healthz, internal_error, method_not_allowed, not_found, readyz, unauthorized,
    unprocessable,
};
pub use upload_mod::upload;
pub use users::{get_me, get_user_by_id, list_users, update_me};
pub use wechat_routes::bind_wechat;
pub use ws::ws_connect;

use crate::errors::ApiError;

/// Load a session the caller participates in, or the appropriate error.
pub(crate) fn load_session_for_participant(
    conn: &rusqlite::Connection,
    session_id: &str,
    user_id: &str,
) -> Result<crate::models::Session, ApiError> {
    let session = crate::db::get_session(conn, session_id)?
        .ok_or_else(|| ApiError::not_found("session"))?;
    if !crate::db::is_session_participant(conn, &session, user_id)? {
        return Err(ApiError::session_access_denied());
    }
    Ok(session)
}

/// Opaque JSON payloads (burn ciphertext envelopes, profile fields) must be
/// JSON objects; the server stores them verbatim and never indexes them.
pub(crate) fn require_json_object(
    value: &serde_json::Value,
    field: &str,
) -> Result<String, ApiError> {
    let map = value
        .as_object()
        .ok_or_else(|| ApiError::validation(format!("{field} must be a JSON object")))?;
    if map.is_empty() {
        return Err(ApiError::validation(format!("{field} must not be empty")));
    }
    Ok(value.to_string())
}

/// Degrees → E7, rejecting out-of-range coordinates.
pub(crate) fn coords_to_e7(lat: f64, lng: f64) -> Result<(i64, i64), ApiError> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        return Err(ApiError::validation("coordinates out of range"));
    }
    Ok((crate::geo::to_e7(lat), crate::geo::to_e7(lng)))
}
