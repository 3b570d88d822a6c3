use crate::common::{
    bearer, error_code, json_body, open_direct_session, register, send_text, test_client,
};
use campus_chat::{db::Db, expiry, hub::Hub};
use rocket::http::{ContentType, Status};

fn send_burn(
    client: &rocket::local::blocking::Client,
    token: &str,
    session_id: &str,
    burn_after_ms: i64,
) -> serde_json::Value {
    let res = client
        .post(format!("/v1/sessions/{session_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(format!(
            r#"{{"type":"burn","metaJson":{{"ciphertext":"abc"}},"burnAfterMs":{burn_after_ms}}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    json_body(res)
}

#[test]
fn burn_message_requires_opaque_object_and_sane_timer() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (_bob, bob_id) = register(&client, "bob");
    let session_id = open_direct_session(&client, &alice, &bob_id);

    // Missing metaJson.
    let res = client
        .post(format!("/v1/sessions/{session_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"type":"burn","burnAfterMs":1000}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    // metaJson must be a JSON object.
    let res = client
        .post(format!("/v1/sessions/{session_id}/messages"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"type":"burn","metaJson":"stringy","burnAfterMs":1000}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    // Timer bounds: [1s, 30d].
    for bad in [999_i64, 30 * 24 * 3600 * 1000 + 1] {
        let res = client
            .post(format!("/v1/sessions/{session_id}/messages"))
            .header(ContentType::JSON)
            .header(bearer(&alice))
            .body(format!(
                r#"{{"type":"burn","metaJson":{{"ciphertext":"x"}},"burnAfterMs":{bad}}}"#
            ))
            .dispatch();
        assert_eq!(res.status(), Status::BadRequest, "burnAfterMs {bad}");
    }
}

#[test]
fn burn_updates_session_snapshot_to_sentinel() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (_bob, bob_id) = register(&client, "bob");
    let session_id = open_direct_session(&client, &alice, &bob_id);

    send_burn(&client, &alice, &session_id, 60_000);

    let res = client.get("/v1/sessions").header(bearer(&alice)).dispatch();
    assert_eq!(json_body(res)[0]["lastMessageText"], "[阅后即焚]");
}

#[test]
fn only_the_recipient_can_open_a_burn_message() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, bob_id) = register(&client, "bob");
    let (carol, _) = register(&client, "carol");
    let session_id = open_direct_session(&client, &alice, &bob_id);
    let message = send_burn(&client, &alice, &session_id, 1000);
    let message_id = message["id"].as_str().unwrap();

    // Sender: 403.
    let res = client
        .post(format!("/v1/burn-messages/{message_id}/read"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
    assert_eq!(error_code(&json_body(res)), "ACCESS_DENIED");

    // Unrelated user: 403.
    let res = client
        .post(format!("/v1/burn-messages/{message_id}/read"))
        .header(bearer(&carol))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    // Recipient: 200 and the timer starts.
    let res = client
        .post(format!("/v1/burn-messages/{message_id}/read"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res);
    assert_eq!(body["started"], true);
    let opened = body["openedAtMs"].as_i64().unwrap();
    let burn_at = body["burnAtMs"].as_i64().unwrap();
    assert_eq!(burn_at, opened + 1000);

    // A second read does not restart the timer.
    let res = client
        .post(format!("/v1/burn-messages/{message_id}/read"))
        .header(bearer(&bob))
        .dispatch();
    let body = json_body(res);
    assert_eq!(body["started"], false);
    assert_eq!(body["openedAtMs"].as_i64().unwrap(), opened);
    assert_eq!(body["burnAtMs"].as_i64().unwrap(), burn_at);
}

#[test]
fn expiry_hard_deletes_due_burn_messages() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, bob_id) = register(&client, "bob");
    let session_id = open_direct_session(&client, &alice, &bob_id);
    let message = send_burn(&client, &alice, &session_id, 1000);
    let message_id = message["id"].as_str().unwrap();

    let res = client
        .post(format!("/v1/burn-messages/{message_id}/read"))
        .header(bearer(&bob))
        .dispatch();
    let burn_at = json_body(res)["burnAtMs"].as_i64().unwrap();

    let db = Db::new(&client.db_path);
    let hub = Hub::new();

    // Not yet due.
    assert_eq!(expiry::expire_burn_messages(&db, &hub, burn_at - 1).unwrap(), 0);
    // Due now; idempotent afterwards.
    assert_eq!(expiry::expire_burn_messages(&db, &hub, burn_at + 1).unwrap(), 1);
    assert_eq!(expiry::expire_burn_messages(&db, &hub, burn_at + 1).unwrap(), 0);

    // Gone from history for both parties.
    for token in [&alice, &bob] {
        let res = client
            .get(format!("/v1/sessions/{session_id}/messages"))
            .header(bearer(token))
            .dispatch();
        assert!(json_body(res)["messages"].as_array().unwrap().is_empty());
    }

    // Reading a burned message is a 404.
    let res = client
        .post(format!("/v1/burn-messages/{message_id}/read"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn unopened_burn_messages_never_expire() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (_bob, bob_id) = register(&client, "bob");
    let session_id = open_direct_session(&client, &alice, &bob_id);
    send_burn(&client, &alice, &session_id, 1000);

    let db = Db::new(&client.db_path);
    let hub = Hub::new();
    let far_future = chrono::Utc::now().timestamp_millis() + 365 * 24 * 3600 * 1000;
    assert_eq!(expiry::expire_burn_messages(&db, &hub, far_future).unwrap(), 0);
}

#[test]
fn new_tokens_do_not_see_historical_burn_messages() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, bob_id) = register(&client, "bob");
    let session_id = open_direct_session(&client, &alice, &bob_id);

    send_text(&client, &alice, &session_id, "hi");
    send_burn(&client, &alice, &session_id, 60_000);

    // The pre-existing token still sees both rows.
    let res = client
        .get(format!("/v1/sessions/{session_id}/messages"))
        .header(bearer(&bob))
        .dispatch();
    let messages = json_body(res)["messages"].as_array().unwrap().clone();
    assert_eq!(messages.len(), 2);

    // A token issued after the burn was written must not see it.
    std::thread::sleep(std::time::Duration::from_millis(2));
    let res = client
        .post("/v1/auth/login")
        .header(ContentType::JSON)
        .body(r#"{"username":"alice","password":"P@ssw0rd1"}"#)
        .dispatch();
    let fresh_token = json_body(res)["token"].as_str().unwrap().to_string();

    let res = client
        .get(format!("/v1/sessions/{session_id}/messages"))
        .header(bearer(&fresh_token))
        .dispatch();
    let messages = json_body(res)["messages"].as_array().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["text"], "hi");
}
