use crate::auth::AuthUser;
use crate::db::Db;
use crate::hub::{Envelope, Hub};
use futures::{SinkExt, StreamExt};
use rocket::{get, State};
use rocket_ws as ws;
use rusqlite::{params, OptionalExtension};
use std::time::Duration;
use tokio::time::Instant;

/// Server ping cadence and how long a client may go without ponging back.
const PING_INTERVAL: Duration = Duration::from_secs(54);
const PONG_DEADLINE: Duration = Duration::from_secs(60);

/// Outbound socket writes that stall longer than this drop the client.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Largest accepted inbound frame.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// `GET /v1/ws` — token-authenticated upgrade (the AuthUser guard rejects
/// with 401 before any upgrade happens). Inbound traffic is ignored except
/// for in-call media frames, which are relayed peer-to-peer.
#[get("/v1/ws")]
pub fn ws_connect(
    ws: ws::WebSocket,
    user: AuthUser,
    hub: &State<Hub>,
    db: &State<Db>,
) -> ws::Channel<'static> {
    let ws = ws.config(ws::Config {
        max_message_size: Some(MAX_FRAME_BYTES),
        ..Default::default()
    });
    let hub = hub.inner().clone();
    let db = db.inner().clone();
    let user_id = user.user_id;

    ws.channel(move |stream| {
        Box::pin(async move {
            let (conn_id, mut outbound) = hub.register(&user_id);
            let (mut sink, mut source) = stream.split();
            let mut ping = tokio::time::interval(PING_INTERVAL);
            let mut last_pong = Instant::now();

            loop {
                tokio::select! {
                    queued = outbound.recv() => match queued {
                        Some(text) => {
                            let send = tokio::time::timeout(
                                WRITE_DEADLINE,
                                sink.send(ws::Message::Text(text)),
                            )
                            .await;
                            match send {
                                Ok(Ok(())) => {}
                                _ => break,
                            }
                        }
                        // The hub dropped us (slow consumer or shutdown):
                        // say goodbye properly.
                        None => {
                            let _ = sink.send(ws::Message::Close(None)).await;
                            break;
                        }
                    },
                    incoming = source.next() => match incoming {
                        Some(Ok(ws::Message::Text(text))) => {
                            last_pong = Instant::now();
                            relay_media_frame(&db, &hub, &user_id, &text);
                        }
                        Some(Ok(ws::Message::Pong(_))) => {
                            last_pong = Instant::now();
                        }
                        Some(Ok(ws::Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    },
                    _ = tokio::time::sleep_until(last_pong + PONG_DEADLINE) => break,
                    _ = ping.tick() => {
                        let send = tokio::time::timeout(
                            WRITE_DEADLINE,
                            sink.send(ws::Message::Ping(Vec::new())),
                        )
                        .await;
                        match send {
                            Ok(Ok(())) => {}
                            _ => break,
                        }
                    }
                }
            }

            hub.unregister(conn_id);
            let _ = sink.close().await;
            Ok(())
        })
    })
}

/// Relay `audio.frame` / `video.frame` to the other party of an accepted
/// call. Anything that doesn't check out — unknown type, missing call, call
/// not accepted, sender not a party — is silently dropped; media relay never
/// errors the sender.
fn relay_media_frame(db: &Db, hub: &Hub, sender_id: &str, text: &str) {
    let Ok(frame) = serde_json::from_str::<serde_json::Value>(text) else {
        return;
    };
    let frame_type = match frame.get("type").and_then(|t| t.as_str()) {
        Some(t @ ("audio.frame" | "video.frame")) => t.to_string(),
        _ => return,
    };
    let Some(call_id) = frame.get("callId").and_then(|c| c.as_str()) else {
        return;
    };
    let Some(data) = frame.get("data").and_then(|d| d.as_str()) else {
        return;
    };

    let call = {
        let conn = db.conn.lock().unwrap();
        conn.query_row(
            "SELECT session_id, caller_id, callee_id, status FROM calls WHERE id = ?1",
            params![call_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
        .ok()
        .flatten()
    };
    let Some((session_id, caller_id, callee_id, status)) = call else {
        return;
    };
    if status != "accepted" {
        return;
    }
    let target = if sender_id == caller_id {
        callee_id
    } else if sender_id == callee_id {
        caller_id
    } else {
        return;
    };

    let mut payload = serde_json::json!({
        "callId": call_id,
        "senderId": sender_id,
        "data": data,
    });
    // seq and sentAtMs pass through untouched when the sender set them.
    for key in ["seq", "sentAtMs"] {
        if let Some(value) = frame.get(key) {
            payload[key] = value.clone();
        }
    }
    hub.send_to_user(
        &target,
        &Envelope::new(frame_type, Some(session_id), payload),
    );
}
