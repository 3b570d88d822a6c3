use crate::errors::ApiError;
use crate::geo;
use crate::models::{GeoFence, InviteResponse, InviteSettingsRequest};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

/// Largest accepted geo-fence radius: 200 km.
pub const MAX_FENCE_RADIUS_M: i64 = 200_000;

/// Collision retries when minting a fresh code.
const CODE_RETRIES: usize = 3;

/// The three invite tables share one shape: a stable code per owner plus
/// optional expiry and geo-fence gates.
#[derive(Debug, Clone, Copy)]
pub enum InviteKind {
    Session,
    Friend,
    Activity,
}

impl InviteKind {
    fn table(self) -> &'static str {
        match self {
            InviteKind::Session => "session_invites",
            InviteKind::Friend => "friend_invites",
            InviteKind::Activity => "activity_invites",
        }
    }

    fn owner_col(self) -> &'static str {
        match self {
            InviteKind::Session | InviteKind::Friend => "owner_id",
            InviteKind::Activity => "activity_id",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InviteRow {
    pub owner_id: String,
    pub code: String,
    pub expires_at_ms: Option<i64>,
    pub fence: Option<(i64, i64, i64)>, // (lat_e7, lng_e7, radius_m)
}

impl InviteRow {
    pub fn to_response(&self) -> InviteResponse {
        InviteResponse {
            code: self.code.clone(),
            expires_at_ms: self.expires_at_ms,
            geo_fence: self.fence.map(|(lat_e7, lng_e7, radius_m)| GeoFence {
                lat: geo::e7_to_degrees(lat_e7),
                lng: geo::e7_to_degrees(lng_e7),
                radius_m,
            }),
        }
    }
}

fn select_by_owner(
    conn: &Connection,
    kind: InviteKind,
    owner_id: &str,
) -> rusqlite::Result<Option<InviteRow>> {
    conn.query_row(
        &format!(
            "SELECT {owner}, code, expires_at_ms, geo_lat_e7, geo_lng_e7, geo_radius_m
             FROM {table} WHERE {owner} = ?1",
            owner = kind.owner_col(),
            table = kind.table(),
        ),
        params![owner_id],
        |row| {
            let lat: Option<i64> = row.get(3)?;
            let lng: Option<i64> = row.get(4)?;
            let radius: Option<i64> = row.get(5)?;
            Ok(InviteRow {
                owner_id: row.get(0)?,
                code: row.get(1)?,
                expires_at_ms: row.get(2)?,
                fence: match (lat, lng, radius) {
                    (Some(lat), Some(lng), Some(radius)) => Some((lat, lng, radius)),
                    _ => None,
                },
            })
        },
    )
    .optional()
}

/// Codes are stable per owner: re-reading returns the same code.
pub fn get_or_create(
    conn: &Connection,
    kind: InviteKind,
    owner_id: &str,
    now_ms: i64,
) -> Result<InviteRow, ApiError> {
    if let Some(row) = select_by_owner(conn, kind, owner_id)? {
        return Ok(row);
    }
    for _ in 0..CODE_RETRIES {
        let code = crate::db::generate_invite_code();
        let inserted = conn.execute(
            &format!(
                "INSERT INTO {table} ({owner}, code, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?3)",
                table = kind.table(),
                owner = kind.owner_col(),
            ),
            params![owner_id, &code, now_ms],
        );
        match inserted {
            Ok(_) => {
                return Ok(InviteRow {
                    owner_id: owner_id.to_string(),
                    code,
                    expires_at_ms: None,
                    fence: None,
                })
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                // Either a code collision (retry with a new one) or a
                // concurrent insert for the same owner (return it).
                if let Some(row) = select_by_owner(conn, kind, owner_id)? {
                    return Ok(row);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ApiError::internal("could not allocate a unique invite code"))
}

/// Replace the invite's gates. A null expiry or fence clears that gate.
pub fn update_settings(
    conn: &Connection,
    kind: InviteKind,
    owner_id: &str,
    settings: &InviteSettingsRequest,
    now_ms: i64,
) -> Result<InviteRow, ApiError> {
    get_or_create(conn, kind, owner_id, now_ms)?;

    if let Some(expires_at_ms) = settings.expires_at_ms {
        if expires_at_ms <= now_ms {
            return Err(ApiError::validation("expiresAtMs must be in the future"));
        }
    }
    let fence = match &settings.geo_fence {
        Some(f) => {
            if f.radius_m <= 0 || f.radius_m > MAX_FENCE_RADIUS_M {
                return Err(ApiError::validation(
                    "geoFence.radiusM must be in (0, 200000]",
                ));
            }
            if !(-90.0..=90.0).contains(&f.lat) || !(-180.0..=180.0).contains(&f.lng) {
                return Err(ApiError::validation("geoFence coordinates out of range"));
            }
            Some((geo::to_e7(f.lat), geo::to_e7(f.lng), f.radius_m))
        }
        None => None,
    };

    conn.execute(
        &format!(
            "UPDATE {table}
             SET expires_at_ms = ?1, geo_lat_e7 = ?2, geo_lng_e7 = ?3, geo_radius_m = ?4,
                 updated_at_ms = ?5
             WHERE {owner} = ?6",
            table = kind.table(),
            owner = kind.owner_col(),
        ),
        params![
            settings.expires_at_ms,
            fence.map(|f| f.0),
            fence.map(|f| f.1),
            fence.map(|f| f.2),
            now_ms,
            owner_id
        ],
    )?;
    select_by_owner(conn, kind, owner_id)?
        .ok_or_else(|| ApiError::internal("invite vanished"))
}

pub fn resolve_code(
    conn: &Connection,
    kind: InviteKind,
    code: &str,
) -> Result<InviteRow, ApiError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {owner}, code, expires_at_ms, geo_lat_e7, geo_lng_e7, geo_radius_m
                 FROM {table} WHERE code = ?1",
                owner = kind.owner_col(),
                table = kind.table(),
            ),
            params![code],
            |row| {
                let lat: Option<i64> = row.get(3)?;
                let lng: Option<i64> = row.get(4)?;
                let radius: Option<i64> = row.get(5)?;
                Ok(InviteRow {
                    owner_id: row.get(0)?,
                    code: row.get(1)?,
                    expires_at_ms: row.get(2)?,
                    fence: match (lat, lng, radius) {
                        (Some(lat), Some(lng), Some(radius)) => Some((lat, lng, radius)),
                        _ => None,
                    },
                })
            },
        )
        .optional()?;
    row.ok_or_else(ApiError::invite_invalid)
}

/// Expiry gate, then geo gate: coordinates are required whenever a fence is
/// set, and the point must fall inside it by Haversine distance.
pub fn check_gates(
    invite: &InviteRow,
    at_lat: Option<f64>,
    at_lng: Option<f64>,
    now_ms: i64,
) -> Result<(), ApiError> {
    if let Some(expires_at_ms) = invite.expires_at_ms {
        if expires_at_ms <= now_ms {
            return Err(ApiError::invite_expired());
        }
    }
    if let Some((lat_e7, lng_e7, radius_m)) = invite.fence {
        let (at_lat, at_lng) = match (at_lat, at_lng) {
            (Some(lat), Some(lng)) => (lat, lng),
            _ => return Err(ApiError::geo_required()),
        };
        let distance = geo::haversine_m(lat_e7, lng_e7, geo::to_e7(at_lat), geo::to_e7(at_lng));
        if distance > radius_m as f64 {
            return Err(ApiError::geo_forbidden());
        }
    }
    Ok(())
}
