use chrono::{DateTime, FixedOffset, TimeZone, Utc};

/// All quota and "local day" semantics are anchored to Asia/Shanghai.
/// The product has no DST concerns, so a fixed +08:00 offset is exact.
const SHANGHAI_OFFSET_SECS: i32 = 8 * 3600;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn shanghai() -> FixedOffset {
    FixedOffset::east_opt(SHANGHAI_OFFSET_SECS).expect("valid fixed offset")
}

fn shanghai_time(ms: i64) -> DateTime<FixedOffset> {
    shanghai().timestamp_millis_opt(ms).single().unwrap_or_else(|| {
        shanghai().timestamp_millis_opt(0).single().expect("epoch is representable")
    })
}

/// YYYYMMDD of the Shanghai local day containing `ms`.
pub fn shanghai_ymd(ms: i64) -> i64 {
    let t = shanghai_time(ms);
    use chrono::Datelike;
    (t.year() as i64) * 10_000 + (t.month() as i64) * 100 + t.day() as i64
}

/// Half-open `[start, end)` millisecond bounds of the Shanghai local day
/// containing `ms`.
pub fn shanghai_day_bounds(ms: i64) -> (i64, i64) {
    let t = shanghai_time(ms);
    let day_start = t
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists")
        .and_local_timezone(shanghai())
        .single()
        .expect("fixed offset is unambiguous");
    let start = day_start.timestamp_millis();
    (start, start + 24 * 3600 * 1000)
}

/// `YYYY-MM-DD HH:MM:SS` in Shanghai local time, used in reminder payloads.
pub fn format_shanghai(ms: i64) -> String {
    shanghai_time(ms).format("%Y-%m-%d %H:%M:%S").to_string()
}
