use crate::auth::AuthUser;
use crate::clock;
use crate::db::Db;
use crate::errors::{ApiError, ApiResult};
use crate::geo;
use crate::models::*;
use rocket::serde::json::Json;
use rocket::{get, post, State};
use rusqlite::{params, Connection, OptionalExtension, Row};

const DEFAULT_RADIUS_M: i64 = 5_000;
const DEFAULT_TTL_MS: i64 = 24 * 3600 * 1000;
const LIST_LIMIT: i64 = 50;

const POST_COLS: &str =
    "id, user_id, text, radius_m, expires_at_ms, is_pinned, created_at_ms";

fn map_post(row: &Row) -> rusqlite::Result<LocalFeedPost> {
    Ok(LocalFeedPost {
        id: row.get(0)?,
        user_id: row.get(1)?,
        text: row.get(2)?,
        radius_m: row.get(3)?,
        expires_at_ms: row.get(4)?,
        is_pinned: row.get::<_, i64>(5)? != 0,
        created_at_ms: row.get(6)?,
        images: Vec::new(),
    })
}

/// One IN-query loads every listed post's images, already sorted.
fn attach_images(conn: &Connection, posts: &mut [LocalFeedPost]) -> rusqlite::Result<()> {
    if posts.is_empty() {
        return Ok(());
    }
    let placeholders: Vec<String> = (1..=posts.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT post_id, id, url, sort_order FROM local_feed_post_images
         WHERE post_id IN ({})
         ORDER BY post_id, sort_order",
        placeholders.join(",")
    );
    let ids: Vec<&str> = posts.iter().map(|p| p.id.as_str()).collect();
    let params_refs: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|s| s as &dyn rusqlite::types::ToSql).collect();
    let mut stmt = conn.prepare(&sql)?;
    let images: Vec<(String, PostImage)> = stmt
        .query_map(params_refs.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                PostImage {
                    id: row.get(1)?,
                    url: row.get(2)?,
                    sort_order: row.get(3)?,
                },
            ))
        })?
        .filter_map(|r| r.ok())
        .collect();
    for (post_id, image) in images {
        if let Some(post) = posts.iter_mut().find(|p| p.id == post_id) {
            post.images.push(image);
        }
    }
    Ok(())
}

#[post("/v1/local-feed/posts", format = "json", data = "<body>")]
pub fn create_post(
    db: &State<Db>,
    user: AuthUser,
    body: Json<CreatePostRequest>,
) -> ApiResult<LocalFeedPost> {
    let now = clock::now_ms();
    let text = body.text.as_deref().map(str::trim).filter(|t| !t.is_empty());
    if text.is_none() && body.image_urls.is_empty() {
        return Err(ApiError::validation("a post needs text or at least one image"));
    }
    if let Some(t) = text {
        if t.chars().count() > 2_000 {
            return Err(ApiError::validation("text must be at most 2000 characters"));
        }
    }
    let radius_m = body.radius_m.unwrap_or(DEFAULT_RADIUS_M);
    if radius_m <= 0 {
        return Err(ApiError::validation("radiusM must be positive"));
    }
    let expires_at_ms = body.expires_at_ms.unwrap_or(now + DEFAULT_TTL_MS);
    if expires_at_ms <= now {
        return Err(ApiError::validation("expiresAtMs must be in the future"));
    }

    let conn = db.conn.lock().unwrap();
    let post_id = uuid::Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO local_feed_posts
             (id, user_id, text, radius_m, expires_at_ms, is_pinned, created_at_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            &post_id,
            &user.user_id,
            text,
            radius_m,
            expires_at_ms,
            body.is_pinned as i64,
            now
        ],
    )?;
    for (sort_order, url) in body.image_urls.iter().enumerate() {
        tx.execute(
            "INSERT INTO local_feed_post_images (id, post_id, url, sort_order)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                uuid::Uuid::new_v4().to_string(),
                &post_id,
                url,
                sort_order as i64
            ],
        )?;
    }
    tx.commit()?;

    let mut post = conn.query_row(
        &format!("SELECT {POST_COLS} FROM local_feed_posts WHERE id = ?1"),
        params![&post_id],
        |row| map_post(row),
    )?;
    attach_images(&conn, std::slice::from_mut(&mut post))?;
    Ok(Json(post))
}

#[get("/v1/local-feed/posts")]
pub fn list_my_posts(db: &State<Db>, user: AuthUser) -> ApiResult<Vec<LocalFeedPost>> {
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();
    let mut posts = fetch_posts(&conn, &user.user_id, now)?;
    attach_images(&conn, &mut posts)?;
    Ok(Json(posts))
}

fn fetch_posts(
    conn: &Connection,
    user_id: &str,
    now: i64,
) -> rusqlite::Result<Vec<LocalFeedPost>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {POST_COLS} FROM local_feed_posts
         WHERE user_id = ?1 AND expires_at_ms > ?2
         ORDER BY is_pinned DESC, created_at_ms DESC
         LIMIT ?3",
    ))?;
    let posts = stmt
        .query_map(params![user_id, now, LIST_LIMIT], |row| map_post(row))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(posts)
}

/// Another user's feed. With viewer coordinates the posts are gated by each
/// post's radius measured from the poster's home base: no home base, nothing
/// visible from afar.
#[derive(rocket::FromForm)]
pub struct ViewerPositionQuery {
    #[field(name = "atLat")]
    pub at_lat: Option<f64>,
    #[field(name = "atLng")]
    pub at_lng: Option<f64>,
}

#[get("/v1/local-feed/users/<id>/posts?<q..>")]
pub fn list_user_posts(
    db: &State<Db>,
    _viewer: AuthUser,
    id: &str,
    q: ViewerPositionQuery,
) -> ApiResult<Vec<LocalFeedPost>> {
    let now = clock::now_ms();
    let conn = db.conn.lock().unwrap();

    let distance_m: Option<f64> = match (q.at_lat, q.at_lng) {
        (Some(lat), Some(lng)) => {
            let (viewer_lat, viewer_lng) = super::coords_to_e7(lat, lng)?;
            let base = conn
                .query_row(
                    "SELECT lat_e7, lng_e7 FROM home_bases WHERE user_id = ?1",
                    params![id],
                    |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
                )
                .optional()?;
            match base {
                Some((base_lat, base_lng)) => {
                    Some(geo::haversine_m(base_lat, base_lng, viewer_lat, viewer_lng))
                }
                None => return Ok(Json(Vec::new())),
            }
        }
        _ => None,
    };

    let mut posts = fetch_posts(&conn, id, now)?;
    if let Some(distance) = distance_m {
        posts.retain(|post| post.radius_m as f64 >= distance);
    }
    attach_images(&conn, &mut posts)?;
    Ok(Json(posts))
}

#[post("/v1/local-feed/posts/<id>/delete")]
pub fn delete_post(db: &State<Db>, user: AuthUser, id: &str) -> ApiResult<serde_json::Value> {
    let conn = db.conn.lock().unwrap();
    let owner: Option<String> = conn
        .query_row(
            "SELECT user_id FROM local_feed_posts WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )
        .optional()?;
    let owner = owner.ok_or_else(|| ApiError::not_found("post"))?;
    if owner != user.user_id {
        return Err(ApiError::access_denied("only the author can delete a post"));
    }
    conn.execute("DELETE FROM local_feed_posts WHERE id = ?1", params![id])?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

/// Home-base pins inside the viewport, nearest to the centre first (squared
/// E7 distance orders them; membership came from the bbox). Map-profile
/// overrides win over the core display name.
#[derive(rocket::FromForm)]
pub struct PinsQuery {
    #[field(name = "minLat")]
    pub min_lat: f64,
    #[field(name = "maxLat")]
    pub max_lat: f64,
    #[field(name = "minLng")]
    pub min_lng: f64,
    #[field(name = "maxLng")]
    pub max_lng: f64,
    #[field(name = "centerLat")]
    pub center_lat: f64,
    #[field(name = "centerLng")]
    pub center_lng: f64,
    pub limit: Option<i64>,
}

#[get("/v1/local-feed/pins?<q..>")]
pub fn list_pins(db: &State<Db>, _viewer: AuthUser, q: PinsQuery) -> ApiResult<Vec<MapPin>> {
    if q.min_lat > q.max_lat || q.min_lng > q.max_lng {
        return Err(ApiError::validation("bounding box is inverted"));
    }
    let (min_lat_e7, min_lng_e7) = super::coords_to_e7(q.min_lat, q.min_lng)?;
    let (max_lat_e7, max_lng_e7) = super::coords_to_e7(q.max_lat, q.max_lng)?;
    let (center_lat_e7, center_lng_e7) = super::coords_to_e7(q.center_lat, q.center_lng)?;
    let limit = q.limit.unwrap_or(LIST_LIMIT).clamp(1, 200) as usize;

    let conn = db.conn.lock().unwrap();
    let mut stmt = conn.prepare(
        "SELECT h.user_id, h.lat_e7, h.lng_e7,
                COALESCE(p.nickname, u.display_name),
                COALESCE(p.avatar_url, u.avatar_url)
         FROM home_bases h
         JOIN users u ON u.id = h.user_id
         LEFT JOIN user_profiles p ON p.user_id = h.user_id AND p.view = 'map'
         WHERE h.lat_e7 BETWEEN ?1 AND ?2 AND h.lng_e7 BETWEEN ?3 AND ?4
         LIMIT 500",
    )?;
    let mut pins: Vec<(i64, MapPin)> = stmt
        .query_map(
            params![min_lat_e7, max_lat_e7, min_lng_e7, max_lng_e7],
            |row| {
                let lat_e7: i64 = row.get(1)?;
                let lng_e7: i64 = row.get(2)?;
                Ok((
                    geo::squared_e7_distance(lat_e7, lng_e7, center_lat_e7, center_lng_e7),
                    MapPin {
                        user_id: row.get(0)?,
                        lat: geo::e7_to_degrees(lat_e7),
                        lng: geo::e7_to_degrees(lng_e7),
                        display_name: row.get(3)?,
                        avatar_url: row.get(4)?,
                    },
                ))
            },
        )?
        .filter_map(|r| r.ok())
        .collect();
    pins.sort_by_key(|(d, _)| *d);
    pins.truncate(limit);
    Ok(Json(pins.into_iter().map(|(_, pin)| pin).collect()))
}
