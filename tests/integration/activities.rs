use crate::common::{bearer, error_code, json_body, register, test_client};
use campus_chat::{db::Db, expiry, hub::Hub};
use rocket::http::{ContentType, Status};
use rusqlite::params;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Create an activity ending two hours from now; returns (sessionId, inviteCode).
fn create_activity(
    client: &rocket::local::blocking::Client,
    token: &str,
    title: &str,
) -> (String, String) {
    let end = now_ms() + 2 * 3600 * 1000;
    let res = client
        .post("/v1/activities")
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(format!(r#"{{"title":"{title}","endAtMs":{end}}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res);
    (
        body["session"]["id"].as_str().unwrap().to_string(),
        body["inviteCode"].as_str().unwrap().to_string(),
    )
}

fn consume<'a>(
    client: &'a rocket::local::blocking::Client,
    token: &'a str,
    code: &'a str,
) -> rocket::local::blocking::LocalResponse<'a> {
    client
        .post("/v1/activities/invites/consume")
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(format!(r#"{{"code":"{code}"}}"#))
        .dispatch()
}

#[test]
fn create_activity_builds_group_session_and_roster() {
    let client = test_client();
    let (alice, alice_id) = register(&client, "alice");

    let res = client
        .post("/v1/activities")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(
            r#"{{"title":"篮球局","description":"campus court","endAtMs":{}}}"#,
            now_ms() + 3600 * 1000
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res);
    assert_eq!(body["session"]["kind"], "group");
    assert_eq!(body["session"]["source"], "activity");
    assert_eq!(body["activity"]["creatorId"], alice_id.as_str());
    let session_id = body["session"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["activity"]["id"], session_id.as_str());

    let res = client
        .get(format!("/v1/activities/{session_id}/members"))
        .header(bearer(&alice))
        .dispatch();
    let members = json_body(res);
    assert_eq!(members.as_array().unwrap().len(), 1);
    assert_eq!(members[0]["role"], "creator");

    // Creator's view lands in the default 「活动」 group.
    let res = client
        .get(format!("/v1/sessions/{session_id}/relationship"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(json_body(res)["groupName"], "活动");
}

#[test]
fn activity_time_validation() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");

    // endAt in the past.
    let res = client
        .post("/v1/activities")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"title":"x","endAtMs":{}}}"#, now_ms() - 1000))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    // endAt before startAt.
    let start = now_ms() + 7200_000;
    let end = now_ms() + 3600_000;
    let res = client
        .post("/v1/activities")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"title":"x","startAtMs":{start},"endAtMs":{end}}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    // Title too long (51 chars).
    let title = "t".repeat(51);
    let res = client
        .post("/v1/activities")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"title":"{title}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn invite_consume_joins_once_and_is_idempotent() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, _) = register(&client, "bob");
    let (_session_id, code) = create_activity(&client, &alice, "hike");

    let res = consume(&client, &bob, &code);
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res);
    assert_eq!(body["joined"], true);

    let res = consume(&client, &bob, &code);
    assert_eq!(json_body(res)["joined"], false);
}

#[test]
fn removed_member_loses_access_and_can_rejoin() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, bob_id) = register(&client, "bob");
    let (session_id, code) = create_activity(&client, &alice, "hike");
    consume(&client, &bob, &code);

    // Member can post before removal.
    let res = client
        .post(format!("/v1/sessions/{session_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(r#"{"type":"text","text":"here"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    // Non-creator cannot remove.
    let (carol, _) = register(&client, "carol");
    let res = client
        .post(format!("/v1/activities/{session_id}/members/{bob_id}/remove"))
        .header(bearer(&carol))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .post(format!("/v1/activities/{session_id}/members/{bob_id}/remove"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    // Removed member's posts are denied.
    let res = client
        .post(format!("/v1/sessions/{session_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(r#"{"type":"text","text":"still here?"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
    assert_eq!(error_code(&json_body(res)), "SESSION_ACCESS_DENIED");

    // Re-consuming the invite reactivates membership.
    let res = consume(&client, &bob, &code);
    assert_eq!(json_body(res)["joined"], true);
}

#[test]
fn creator_cannot_remove_themselves() {
    let client = test_client();
    let (alice, alice_id) = register(&client, "alice");
    let (session_id, _code) = create_activity(&client, &alice, "hike");

    let res = client
        .post(format!("/v1/activities/{session_id}/members/{alice_id}/remove"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

fn age_activity_end(db_path: &str, session_id: &str, end_at_ms: i64) {
    let conn = rusqlite::Connection::open(db_path).unwrap();
    conn.execute(
        "UPDATE activities SET end_at_ms = ?1 WHERE id = ?2",
        params![end_at_ms, session_id],
    )
    .unwrap();
}

#[test]
fn posting_into_an_ended_activity_auto_archives() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, _) = register(&client, "bob");
    let (session_id, code) = create_activity(&client, &alice, "hike");
    consume(&client, &bob, &code);

    age_activity_end(&client.db_path, &session_id, now_ms() - 1);

    let res = client
        .post(format!("/v1/sessions/{session_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(r#"{"type":"text","text":"too late"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
    assert_eq!(error_code(&json_body(res)), "SESSION_ARCHIVED");
}

#[test]
fn sweeper_archives_expired_activity_sessions() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (session_id, _code) = create_activity(&client, &alice, "hike");

    let end = now_ms() - 1;
    age_activity_end(&client.db_path, &session_id, end);

    let db = Db::new(&client.db_path);
    let hub = Hub::new();
    assert_eq!(
        expiry::archive_expired_activity_sessions(&db, &hub, now_ms()).unwrap(),
        1
    );
    // Idempotent: already archived.
    assert_eq!(
        expiry::archive_expired_activity_sessions(&db, &hub, now_ms()).unwrap(),
        0
    );

    let res = client
        .get(format!("/v1/activities/{session_id}"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(json_body(res)["session"]["status"], "archived");
}

#[test]
fn consume_after_end_is_invalid_state() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, _) = register(&client, "bob");
    let (session_id, code) = create_activity(&client, &alice, "hike");

    age_activity_end(&client.db_path, &session_id, now_ms() - 1);

    let res = consume(&client, &bob, &code);
    assert_eq!(res.status(), Status::Conflict);
    assert_eq!(error_code(&json_body(res)), "INVALID_STATE");
}

#[test]
fn extend_reactivates_an_archived_session() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, _) = register(&client, "bob");
    let (session_id, code) = create_activity(&client, &alice, "hike");

    age_activity_end(&client.db_path, &session_id, now_ms() - 1);
    let db = Db::new(&client.db_path);
    let hub = Hub::new();
    expiry::archive_expired_activity_sessions(&db, &hub, now_ms()).unwrap();

    // Only the creator extends.
    consume(&client, &bob, &code).status(); // bob is not even a member yet; ignore
    let new_end = now_ms() + 3600_000;
    let res = client
        .post(format!("/v1/activities/{session_id}/extend"))
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(format!(r#"{{"endAtMs":{new_end}}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .post(format!("/v1/activities/{session_id}/extend"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"endAtMs":{new_end}}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res);
    assert_eq!(body["session"]["status"], "active");
    assert_eq!(body["activity"]["endAtMs"].as_i64().unwrap(), new_end);

    // Joining works again after the extension.
    let res = consume(&client, &bob, &code);
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn reminders_require_a_wechat_binding() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (session_id, _code) = create_activity(&client, &alice, "hike");

    let remind_at = now_ms() + 1800_000;
    let res = client
        .put(format!("/v1/activities/{session_id}/reminders"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"remindAtMs":{remind_at}}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::PreconditionFailed);
    assert_eq!(error_code(&json_body(res)), "WECHAT_NOT_BOUND");
}

fn bind_wechat_directly(db_path: &str, user_id: &str, openid: &str) {
    let conn = rusqlite::Connection::open(db_path).unwrap();
    conn.execute(
        "INSERT INTO wechat_bindings (user_id, openid, session_key, updated_at_ms)
         VALUES (?1, ?2, 'sk', ?3)",
        params![user_id, openid, chrono::Utc::now().timestamp_millis()],
    )
    .unwrap();
}

#[test]
fn reminder_upsert_and_cancel() {
    let client = test_client();
    let (alice, alice_id) = register(&client, "alice");
    let (session_id, _code) = create_activity(&client, &alice, "hike");
    bind_wechat_directly(&client.db_path, &alice_id, "openid-alice");

    let remind_at = now_ms() + 1800_000;
    let res = client
        .put(format!("/v1/activities/{session_id}/reminders"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"remindAtMs":{remind_at}}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["remindAtMs"].as_i64().unwrap(), remind_at);

    // Past remindAt is rejected; so is one after the activity ends.
    let res = client
        .put(format!("/v1/activities/{session_id}/reminders"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"remindAtMs":{}}}"#, now_ms() - 1000))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
    let res = client
        .put(format!("/v1/activities/{session_id}/reminders"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"remindAtMs":{}}}"#, now_ms() + 48 * 3600 * 1000))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    // Null cancels.
    let res = client
        .put(format!("/v1/activities/{session_id}/reminders"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"remindAtMs":null}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    assert_eq!(json_body(res)["status"], "canceled");
}

#[test]
fn reminder_sweep_marks_failures_without_stopping() {
    let client = test_client();
    let (alice, alice_id) = register(&client, "alice");
    let (session_id, _code) = create_activity(&client, &alice, "hike");
    bind_wechat_directly(&client.db_path, &alice_id, "openid-alice");

    let remind_at = now_ms() + 1000;
    let res = client
        .put(format!("/v1/activities/{session_id}/reminders"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"remindAtMs":{remind_at}}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    // Drop the binding so dispatch cannot resolve it.
    let conn = rusqlite::Connection::open(&client.db_path).unwrap();
    conn.execute("DELETE FROM wechat_bindings", []).unwrap();
    drop(conn);

    let db = Db::new(&client.db_path);
    let wechat = campus_chat::wechat::WeChatClient::new(Default::default());
    let rt = rocket::tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let sent = rt.block_on(campus_chat::reminders::run_reminder_sweep(
        &db,
        &wechat,
        remind_at + 1,
    ));
    assert_eq!(sent, 0);

    let res = client
        .get(format!("/v1/activities/{session_id}/reminders"))
        .header(bearer(&alice))
        .dispatch();
    let body = json_body(res);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["lastError"], "no wechat binding");
}
