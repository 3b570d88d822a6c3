use crate::common::{
    bearer, error_code, json_body, open_direct_session, register, send_text, test_client,
};
use rocket::http::{ContentType, Status};

#[test]
fn create_session_is_idempotent_per_pair() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (_bob_token, bob_id) = register(&client, "bob");

    let res = client
        .post("/v1/sessions")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"peerUserId":"{bob_id}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res);
    assert_eq!(body["created"], true);
    let session_id = body["session"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["session"]["kind"], "direct");
    assert_eq!(body["session"]["peer"]["username"], "bob");

    // Repeating returns the same session, created=false.
    let res = client
        .post("/v1/sessions")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"peerUserId":"{bob_id}"}}"#))
        .dispatch();
    let body = json_body(res);
    assert_eq!(body["created"], false);
    assert_eq!(body["session"]["id"], session_id.as_str());
}

#[test]
fn same_pair_from_either_side_is_one_session() {
    let client = test_client();
    let (alice, alice_id) = register(&client, "alice");
    let (bob, bob_id) = register(&client, "bob");

    let one = open_direct_session(&client, &alice, &bob_id);
    let two = open_direct_session(&client, &bob, &alice_id);
    assert_eq!(one, two);
}

#[test]
fn cannot_chat_with_yourself() {
    let client = test_client();
    let (alice, alice_id) = register(&client, "alice");
    let res = client
        .post("/v1/sessions")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"peerUserId":"{alice_id}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
    assert_eq!(error_code(&json_body(res)), "CANNOT_CHAT_SELF");
}

#[test]
fn archive_is_idempotent_and_reactivate_restores() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (_bob, bob_id) = register(&client, "bob");
    let session_id = open_direct_session(&client, &alice, &bob_id);

    let res = client
        .post(format!("/v1/sessions/{session_id}/archive"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let first = json_body(res);
    assert_eq!(first["status"], "archived");

    // Archiving again returns the same updatedAtMs.
    let res = client
        .post(format!("/v1/sessions/{session_id}/archive"))
        .header(bearer(&alice))
        .dispatch();
    let second = json_body(res);
    assert_eq!(first["updatedAtMs"], second["updatedAtMs"]);

    let res = client
        .post(format!("/v1/sessions/{session_id}/reactivate"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res);
    assert_eq!(body["status"], "active");
    assert!(body["reactivatedAtMs"].as_i64().is_some());
}

#[test]
fn reactivate_requires_archived_state() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (_bob, bob_id) = register(&client, "bob");
    let session_id = open_direct_session(&client, &alice, &bob_id);

    let res = client
        .post(format!("/v1/sessions/{session_id}/reactivate"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
    assert_eq!(error_code(&json_body(res)), "INVALID_STATE");
}

#[test]
fn creating_against_archived_pair_reactivates() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (_bob, bob_id) = register(&client, "bob");
    let session_id = open_direct_session(&client, &alice, &bob_id);

    client
        .post(format!("/v1/sessions/{session_id}/archive"))
        .header(bearer(&alice))
        .dispatch();

    let res = client
        .post("/v1/sessions")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"peerUserId":"{bob_id}"}}"#))
        .dispatch();
    let body = json_body(res);
    assert_eq!(body["created"], false);
    assert_eq!(body["session"]["id"], session_id.as_str());
    assert_eq!(body["session"]["status"], "active");
}

#[test]
fn outsiders_cannot_touch_a_session() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (_bob, bob_id) = register(&client, "bob");
    let (carol, _) = register(&client, "carol");
    let session_id = open_direct_session(&client, &alice, &bob_id);

    let res = client
        .post(format!("/v1/sessions/{session_id}/archive"))
        .header(bearer(&carol))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
    assert_eq!(error_code(&json_body(res)), "SESSION_ACCESS_DENIED");
}

#[test]
fn hide_removes_from_listing_for_that_user_only() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, bob_id) = register(&client, "bob");
    let session_id = open_direct_session(&client, &alice, &bob_id);

    // Hide twice: idempotent.
    for _ in 0..2 {
        let res = client
            .post(format!("/v1/sessions/{session_id}/hide"))
            .header(bearer(&alice))
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
    }

    let res = client.get("/v1/sessions").header(bearer(&alice)).dispatch();
    let sessions = json_body(res);
    assert!(sessions.as_array().unwrap().is_empty());

    let res = client.get("/v1/sessions").header(bearer(&bob)).dispatch();
    let sessions = json_body(res);
    assert_eq!(sessions.as_array().unwrap().len(), 1);
}

#[test]
fn listing_orders_by_recent_activity() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (_b, bob_id) = register(&client, "bob");
    let (_c, carol_id) = register(&client, "carol");
    let with_bob = open_direct_session(&client, &alice, &bob_id);
    let with_carol = open_direct_session(&client, &alice, &carol_id);

    std::thread::sleep(std::time::Duration::from_millis(2));
    send_text(&client, &alice, &with_bob, "newest");

    let res = client.get("/v1/sessions").header(bearer(&alice)).dispatch();
    let sessions = json_body(res);
    let ids: Vec<&str> = sessions
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids[0], with_bob.as_str());
    assert!(ids.contains(&with_carol.as_str()));
    assert_eq!(sessions[0]["lastMessageText"], "newest");
}

#[test]
fn relationship_meta_round_trip() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (_bob, bob_id) = register(&client, "bob");
    let session_id = open_direct_session(&client, &alice, &bob_id);

    let res = client
        .put(format!("/v1/sessions/{session_id}/relationship"))
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"groupName":"同学","alias":"Bobby","notes":"met at the library"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res);
    assert_eq!(body["groupName"], "同学");
    assert_eq!(body["alias"], "Bobby");

    let res = client
        .get(format!("/v1/sessions/{session_id}/relationship"))
        .header(bearer(&alice))
        .dispatch();
    let body = json_body(res);
    assert_eq!(body["notes"], "met at the library");
}
