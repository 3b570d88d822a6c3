use serde::{Deserialize, Serialize};
use serde_json::Value;

// --- Users & auth ---

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Display fields of another user, embedded in sessions, rosters, requests.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub username: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub display_name: String,
    #[serde(default)]
    pub device_info: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub device_info: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub token: String,
    pub expires_at_ms: i64,
    pub user: User,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMeRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub old_password: Option<String>,
    #[serde(default)]
    pub new_password: Option<String>,
}

// --- Sessions ---

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    /// direct | group
    pub kind: String,
    /// wechat_code | map | activity | manual
    pub source: String,
    /// active | archived
    pub status: String,
    pub user1_id: String,
    pub user2_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reactivated_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    /// The other user of a direct session, resolved for the viewer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<UserSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub peer_user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub session: Session,
    pub created: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipRequest {
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

// --- Messages ---

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BurnState {
    pub burn_after_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burn_at_ms: Option<i64>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub sender_id: String,
    /// text | image | file | system | burn
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta_json: Option<Value>,
    pub created_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burn: Option<BurnState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(rename = "type", default = "default_message_type")]
    pub msg_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub meta_json: Option<Value>,
    #[serde(default)]
    pub burn_after_ms: Option<i64>,
}

fn default_message_type() -> String {
    "text".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BurnReadResponse {
    pub message_id: String,
    /// false when the message had already been opened.
    pub started: bool,
    pub opened_at_ms: i64,
    pub burn_at_ms: i64,
}

// --- Invites / requests ---

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GeoFence {
    pub lat: f64,
    pub lng: f64,
    pub radius_m: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteResponse {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_fence: Option<GeoFence>,
}

/// PUT body for invite settings. A `null` (or omitted) field clears that gate.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteSettingsRequest {
    #[serde(default)]
    pub expires_at_ms: Option<i64>,
    #[serde(default)]
    pub geo_fence: Option<GeoFence>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeInviteRequest {
    pub code: String,
    #[serde(default)]
    pub at_lat: Option<f64>,
    #[serde(default)]
    pub at_lng: Option<f64>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequestView {
    pub id: String,
    pub requester_id: String,
    pub addressee_id: String,
    /// pending | accepted | rejected | canceled
    pub status: String,
    /// wechat_code | map
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_message: Option<String>,
    pub last_opened_at_ms: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterpart: Option<UserSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequestRequest {
    pub addressee_id: String,
    #[serde(default)]
    pub verification_message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequestsResponse {
    pub incoming: Vec<SessionRequestView>,
    pub outgoing: Vec<SessionRequestView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCreatedResponse {
    pub request: SessionRequestView,
    pub created: bool,
}

// --- Friends ---

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestView {
    pub id: String,
    pub requester_id: String,
    pub addressee_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_message: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterpart: Option<UserSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFriendRequestRequest {
    pub addressee_id: String,
    #[serde(default)]
    pub verification_message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestsResponse {
    pub incoming: Vec<FriendRequestView>,
    pub outgoing: Vec<FriendRequestView>,
}

// --- Activities ---

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: String,
    pub creator_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateActivityRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start_at_ms: Option<i64>,
    #[serde(default)]
    pub end_at_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityResponse {
    pub activity: Activity,
    pub session: Session,
    pub invite_code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityJoinResponse {
    pub activity: Activity,
    pub session: Session,
    pub joined: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityMember {
    pub user: UserSummary,
    /// creator | admin | member
    pub role: String,
    pub joined_at_ms: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendActivityRequest {
    pub end_at_ms: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderRequest {
    /// A timestamp upserts the reminder; null cancels it.
    #[serde(default)]
    pub remind_at_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderView {
    pub activity_id: String,
    pub remind_at_ms: i64,
    /// pending | sent | failed | canceled
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// --- Home base & local feed ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HomeBaseRequest {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HomeBaseView {
    pub lat: f64,
    pub lng: f64,
    pub last_updated_ymd: i64,
    pub daily_update_count: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePostRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub radius_m: Option<i64>,
    #[serde(default)]
    pub expires_at_ms: Option<i64>,
    #[serde(default)]
    pub is_pinned: bool,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PostImage {
    pub id: String,
    pub url: String,
    pub sort_order: i64,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LocalFeedPost {
    pub id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub radius_m: i64,
    pub expires_at_ms: i64,
    pub is_pinned: bool,
    pub created_at_ms: i64,
    pub images: Vec<PostImage>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MapPin {
    pub user_id: String,
    pub lat: f64,
    pub lng: f64,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

// --- Profiles ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRequest {
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Opaque JSON object; stored verbatim, never indexed.
    #[serde(default)]
    pub fields: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub view: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub fields: Value,
    /// Override if set, else the core displayName / avatar.
    pub resolved_nickname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_avatar_url: Option<String>,
}

// --- Calls ---

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub id: String,
    pub session_id: String,
    pub caller_id: String,
    pub callee_id: String,
    /// ringing | accepted | rejected | ended
    pub status: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallRequest {
    pub session_id: String,
}

// --- WeChat ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeChatBindRequest {
    pub js_code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeChatBindResponse {
    pub openid: String,
    pub bound: bool,
}

// --- Upload ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub url: String,
    pub name: String,
    pub size_bytes: u64,
}
