use crate::clock;
use crate::db::Db;
use crate::wechat::WeChatClient;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;

pub const REMINDER_SWEEP_INTERVAL: Duration = Duration::from_secs(2);
pub const REMINDER_SWEEP_BATCH: i64 = 50;

struct PreparedReminder {
    activity_id: String,
    user_id: String,
    openid: Option<String>,
    /// (title, creator display name, formatted start time)
    display: Option<(String, String, String)>,
}

/// One sweep: pick up to 50 due pending reminders, resolve what each needs,
/// send through WeChat exactly once, then mark sent/failed. Per-item
/// failures record `lastError` and never stop the sweep; a failed reminder
/// can be re-subscribed by the user.
pub async fn run_reminder_sweep(db: &Db, wechat: &WeChatClient, now_ms: i64) -> usize {
    let prepared: Vec<PreparedReminder> = {
        let conn = db.conn.lock().unwrap();
        let due: Vec<(String, String)> = {
            let mut stmt = match conn.prepare(
                "SELECT activity_id, user_id FROM activity_reminders
                 WHERE status = 'pending' AND remind_at_ms <= ?1
                 ORDER BY remind_at_ms ASC
                 LIMIT ?2",
            ) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("reminder sweep query failed: {e}");
                    return 0;
                }
            };
            let query_result = stmt.query_map(params![now_ms, REMINDER_SWEEP_BATCH], |row| {
                Ok((row.get(0)?, row.get(1)?))
            });
            match query_result {
                Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
                Err(e) => {
                    tracing::warn!("reminder sweep query failed: {e}");
                    return 0;
                }
            }
        };

        due.into_iter()
            .map(|(activity_id, user_id)| {
                let openid = conn
                    .query_row(
                        "SELECT openid FROM wechat_bindings WHERE user_id = ?1",
                        params![&user_id],
                        |r| r.get::<_, String>(0),
                    )
                    .optional()
                    .ok()
                    .flatten();
                let display = conn
                    .query_row(
                        "SELECT a.title, a.start_at_ms, u.display_name
                         FROM activities a JOIN users u ON u.id = a.creator_id
                         WHERE a.id = ?1",
                        params![&activity_id],
                        |r| {
                            Ok((
                                r.get::<_, String>(0)?,
                                r.get::<_, Option<i64>>(1)?,
                                r.get::<_, String>(2)?,
                            ))
                        },
                    )
                    .optional()
                    .ok()
                    .flatten()
                    .map(|(title, start_at_ms, creator)| {
                        let start = clock::format_shanghai(start_at_ms.unwrap_or(now_ms));
                        (title, creator, start)
                    });
                PreparedReminder {
                    activity_id,
                    user_id,
                    openid,
                    display,
                }
            })
            .collect()
    };

    let mut sent = 0usize;
    for reminder in prepared {
        let outcome = dispatch(wechat, &reminder, now_ms).await;
        let conn = db.conn.lock().unwrap();
        let result = match outcome {
            Ok(()) => {
                sent += 1;
                conn.execute(
                    "UPDATE activity_reminders
                     SET status = 'sent', sent_at_ms = ?1, updated_at_ms = ?1, last_error = NULL
                     WHERE activity_id = ?2 AND user_id = ?3 AND status = 'pending'",
                    params![now_ms, &reminder.activity_id, &reminder.user_id],
                )
            }
            Err(message) => conn.execute(
                "UPDATE activity_reminders
                 SET status = 'failed', last_error = ?1, updated_at_ms = ?2
                 WHERE activity_id = ?3 AND user_id = ?4 AND status = 'pending'",
                params![&message, now_ms, &reminder.activity_id, &reminder.user_id],
            ),
        };
        if let Err(e) = result {
            tracing::warn!(
                "failed to record reminder outcome for activity {}: {e}",
                reminder.activity_id
            );
        }
    }
    sent
}

async fn dispatch(
    wechat: &WeChatClient,
    reminder: &PreparedReminder,
    now_ms: i64,
) -> Result<(), String> {
    let openid = reminder
        .openid
        .as_deref()
        .ok_or_else(|| "no wechat binding".to_string())?;
    let (title, creator, start) = reminder
        .display
        .as_ref()
        .ok_or_else(|| "activity or creator missing".to_string())?;
    let (template_id, page) = wechat
        .activity_template()
        .ok_or_else(|| "activity subscribe template not configured".to_string())?;
    let page = page.map(|p| {
        format!(
            "{p}?sessionId={}&peerName={}",
            reminder.activity_id, creator
        )
    });
    let data = serde_json::json!({
        "thing1": {"value": title},
        "thing2": {"value": creator},
        "time3":  {"value": start},
    });
    wechat
        .send_subscribe(openid, template_id, page.as_deref(), data, now_ms)
        .await
        .map_err(|e| e.message)
}

pub fn spawn_reminder_sweeper(db: Db, wechat: Arc<WeChatClient>, shutdown: rocket::Shutdown) {
    tokio::spawn(async move {
        tokio::pin!(shutdown);
        let mut tick = tokio::time::interval(REMINDER_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tick.tick() => {
                    run_reminder_sweep(&db, &wechat, clock::now_ms()).await;
                }
            }
        }
        tracing::info!("reminder sweeper stopped");
    });
}
