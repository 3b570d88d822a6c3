use crate::auth::AuthUser;
use crate::clock;
use crate::db::Db;
use crate::errors::{ApiError, ApiResult};
use crate::geo;
use crate::models::*;
use rocket::serde::json::Json;
use rocket::{get, put, State};
use rusqlite::{params, OptionalExtension};

/// Distinct coordinate updates allowed per Shanghai-local day.
const DAILY_UPDATE_CAP: i64 = 3;

fn view(lat_e7: i64, lng_e7: i64, ymd: i64, count: i64, updated_at_ms: i64) -> HomeBaseView {
    HomeBaseView {
        lat: geo::e7_to_degrees(lat_e7),
        lng: geo::e7_to_degrees(lng_e7),
        last_updated_ymd: ymd,
        daily_update_count: count,
        updated_at_ms,
    }
}

#[get("/v1/home-base")]
pub fn get_home_base(db: &State<Db>, user: AuthUser) -> ApiResult<HomeBaseView> {
    let conn = db.conn.lock().unwrap();
    let row = conn
        .query_row(
            "SELECT lat_e7, lng_e7, last_updated_ymd, daily_update_count, updated_at_ms
             FROM home_bases WHERE user_id = ?1",
            params![&user.user_id],
            |r| {
                Ok(view(
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .optional()?;
    let row = row.ok_or_else(|| ApiError::not_found("home base"))?;
    Ok(Json(row))
}

/// Re-pinning the same coordinates is idempotent and free. Moving the pin
/// consumes quota: three distinct moves per local day, reset at Shanghai
/// midnight.
#[put("/v1/home-base", format = "json", data = "<body>")]
pub fn put_home_base(
    db: &State<Db>,
    user: AuthUser,
    body: Json<HomeBaseRequest>,
) -> ApiResult<HomeBaseView> {
    let (lat_e7, lng_e7) = super::coords_to_e7(body.lat, body.lng)?;
    let now = clock::now_ms();
    let today = clock::shanghai_ymd(now);

    let conn = db.conn.lock().unwrap();
    let existing = conn
        .query_row(
            "SELECT lat_e7, lng_e7, last_updated_ymd, daily_update_count
             FROM home_bases WHERE user_id = ?1",
            params![&user.user_id],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;

    match existing {
        Some((cur_lat, cur_lng, ymd, count)) if cur_lat == lat_e7 && cur_lng == lng_e7 => {
            // Unchanged coordinates never touch the quota.
            let updated_at_ms: i64 = conn.query_row(
                "SELECT updated_at_ms FROM home_bases WHERE user_id = ?1",
                params![&user.user_id],
                |r| r.get(0),
            )?;
            Ok(Json(view(cur_lat, cur_lng, ymd, count, updated_at_ms)))
        }
        Some((_, _, ymd, count)) => {
            if ymd == today && count >= DAILY_UPDATE_CAP {
                return Err(ApiError::home_base_limited());
            }
            let new_count = if ymd == today { count + 1 } else { 1 };
            conn.execute(
                "UPDATE home_bases
                 SET lat_e7 = ?1, lng_e7 = ?2, last_updated_ymd = ?3, daily_update_count = ?4,
                     updated_at_ms = ?5
                 WHERE user_id = ?6",
                params![lat_e7, lng_e7, today, new_count, now, &user.user_id],
            )?;
            Ok(Json(view(lat_e7, lng_e7, today, new_count, now)))
        }
        None => {
            conn.execute(
                "INSERT INTO home_bases
                     (user_id, lat_e7, lng_e7, last_updated_ymd, daily_update_count,
                      created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
                params![&user.user_id, lat_e7, lng_e7, today, now],
            )?;
            Ok(Json(view(lat_e7, lng_e7, today, 1, now)))
        }
    }
}
