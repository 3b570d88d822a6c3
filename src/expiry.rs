use crate::clock;
use crate::db::{self, Db};
use crate::hub::{Envelope, Hub};
use rusqlite::params;
use std::time::Duration;

/// Burn sweep cadence and per-sweep batch cap.
pub const BURN_SWEEP_INTERVAL: Duration = Duration::from_millis(500);
pub const BURN_SWEEP_BATCH: i64 = 200;

/// Activity archival (and token cleanup) cadence.
pub const ACTIVITY_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Hard-delete burn messages whose timer has elapsed. One transaction per
/// sweep; the message delete cascades to the burn row. Emits
/// `message.burn.deleted` to sender and recipient once per removal, after
/// commit. Deleting an already-missing message is a noop, so the sweep is
/// idempotent.
pub fn expire_burn_messages(db: &Db, hub: &Hub, now_ms: i64) -> rusqlite::Result<usize> {
    let due: Vec<(String, String, String, String)> = {
        let conn = db.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let due = {
            let mut stmt = tx.prepare(
                "SELECT message_id, session_id, sender_id, recipient_id
                 FROM burn_messages
                 WHERE burn_at_ms IS NOT NULL AND burn_at_ms <= ?1
                 ORDER BY burn_at_ms ASC
                 LIMIT ?2",
            )?;
            let rows: Vec<(String, String, String, String)> = stmt
                .query_map(params![now_ms, BURN_SWEEP_BATCH], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };
        for (message_id, _, _, _) in &due {
            tx.execute("DELETE FROM messages WHERE id = ?1", params![message_id])?;
        }
        tx.commit()?;
        due
    };

    for (message_id, session_id, sender_id, recipient_id) in &due {
        let envelope = Envelope::new(
            "message.burn.deleted",
            Some(session_id.clone()),
            serde_json::json!({"messageId": message_id, "sessionId": session_id}),
        );
        hub.send_to_users(&[sender_id.clone(), recipient_id.clone()], &envelope);
    }
    Ok(due.len())
}

/// Archive active group sessions whose activity end time has passed. Emits
/// `session.archived` to the active roster after commit.
pub fn archive_expired_activity_sessions(
    db: &Db,
    hub: &Hub,
    now_ms: i64,
) -> rusqlite::Result<usize> {
    let archived: Vec<(String, Vec<String>)> = {
        let conn = db.conn.lock().unwrap();
        let expired: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT s.id FROM sessions s
                 JOIN activities a ON a.id = s.id
                 WHERE s.status = 'active' AND a.end_at_ms IS NOT NULL AND a.end_at_ms <= ?1",
            )?;
            let ids: Vec<String> = stmt
                .query_map(params![now_ms], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            ids
        };
        let mut archived = Vec::with_capacity(expired.len());
        for session_id in expired {
            conn.execute(
                "UPDATE sessions SET status = 'archived', updated_at_ms = ?1
                 WHERE id = ?2 AND status = 'active'",
                params![now_ms, &session_id],
            )?;
            let members = match db::get_session(&conn, &session_id)? {
                Some(session) => db::session_member_ids(&conn, &session)?,
                None => Vec::new(),
            };
            archived.push((session_id, members));
        }
        archived
    };

    for (session_id, members) in &archived {
        let envelope = Envelope::new(
            "session.archived",
            Some(session_id.clone()),
            serde_json::json!({"sessionId": session_id, "status": "archived"}),
        );
        hub.send_to_users(members, &envelope);
    }
    Ok(archived.len())
}

/// Drop expired auth tokens.
pub fn delete_expired_tokens(db: &Db, now_ms: i64) -> rusqlite::Result<usize> {
    let conn = db.conn.lock().unwrap();
    let n = conn.execute(
        "DELETE FROM auth_tokens WHERE expires_at_ms <= ?1",
        params![now_ms],
    )?;
    Ok(n)
}

pub fn spawn_burn_sweeper(db: Db, hub: Hub, shutdown: rocket::Shutdown) {
    tokio::spawn(async move {
        tokio::pin!(shutdown);
        let mut tick = tokio::time::interval(BURN_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tick.tick() => {
                    if let Err(e) = expire_burn_messages(&db, &hub, clock::now_ms()) {
                        tracing::warn!("burn sweep failed: {e}");
                    }
                }
            }
        }
        tracing::info!("burn sweeper stopped");
    });
}

pub fn spawn_activity_sweeper(db: Db, hub: Hub, shutdown: rocket::Shutdown) {
    tokio::spawn(async move {
        tokio::pin!(shutdown);
        let mut tick = tokio::time::interval(ACTIVITY_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tick.tick() => {
                    let now = clock::now_ms();
                    if let Err(e) = archive_expired_activity_sessions(&db, &hub, now) {
                        tracing::warn!("activity archival sweep failed: {e}");
                    }
                    if let Err(e) = delete_expired_tokens(&db, now) {
                        tracing::warn!("token cleanup failed: {e}");
                    }
                }
            }
        }
        tracing::info!("activity sweeper stopped");
    });
}
