use crate::common::{bearer, error_code, json_body, register, test_client};
use rocket::http::{ContentType, Status};
use rusqlite::params;

fn create_request<'a>(
    client: &'a rocket::local::blocking::Client,
    token: &'a str,
    addressee_id: &'a str,
) -> rocket::local::blocking::LocalResponse<'a> {
    client
        .post("/v1/session-requests")
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(format!(r#"{{"addresseeId":"{addressee_id}"}}"#))
        .dispatch()
}

#[test]
fn request_accept_creates_the_session_with_default_map_group() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, bob_id) = register(&client, "bob");

    let res = create_request(&client, &alice, &bob_id);
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res);
    assert_eq!(body["created"], true);
    assert_eq!(body["request"]["source"], "map");
    let request_id = body["request"]["id"].as_str().unwrap().to_string();

    // Only the addressee can accept.
    let res = client
        .post(format!("/v1/session-requests/{request_id}/accept"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .post(format!("/v1/session-requests/{request_id}/accept"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res);
    assert_eq!(body["request"]["status"], "accepted");
    let session_id = body["session"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["session"]["source"], "map");

    // Both sides got the default 「地图」 relationship group.
    for token in [&alice, &bob] {
        let res = client
            .get(format!("/v1/sessions/{session_id}/relationship"))
            .header(bearer(token))
            .dispatch();
        assert_eq!(json_body(res)["groupName"], "地图");
    }

    // Accepting twice is a state error.
    let res = client
        .post(format!("/v1/session-requests/{request_id}/accept"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
}

#[test]
fn duplicate_and_reverse_requests() {
    let client = test_client();
    let (alice, alice_id) = register(&client, "alice");
    let (bob, bob_id) = register(&client, "bob");

    let res = create_request(&client, &alice, &bob_id);
    assert_eq!(json_body(res)["created"], true);

    // Same direction again: the pending row is reused.
    let res = create_request(&client, &alice, &bob_id);
    let body = json_body(res);
    assert_eq!(body["created"], false);
    assert_eq!(body["request"]["status"], "pending");

    // Reverse direction while pending: conflict.
    let res = create_request(&client, &bob, &alice_id);
    assert_eq!(res.status(), Status::Conflict);
    assert_eq!(error_code(&json_body(res)), "EXISTS");
}

#[test]
fn reject_starts_a_three_day_cooldown() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, bob_id) = register(&client, "bob");

    let res = create_request(&client, &alice, &bob_id);
    let request_id = json_body(res)["request"]["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/v1/session-requests/{request_id}/reject"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    // Within the cooldown: blocked.
    let res = create_request(&client, &alice, &bob_id);
    assert_eq!(res.status(), Status::Conflict);
    assert_eq!(error_code(&json_body(res)), "COOLDOWN");

    // Age the rejection 3 days + 1 ms into the past: re-open succeeds.
    let conn = rusqlite::Connection::open(&client.db_path).unwrap();
    conn.execute(
        "UPDATE session_requests SET updated_at_ms = updated_at_ms - ?1 WHERE id = ?2",
        params![3 * 24 * 3600 * 1000 + 1_i64, &request_id],
    )
    .unwrap();
    drop(conn);

    let res = create_request(&client, &alice, &bob_id);
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res);
    assert_eq!(body["created"], false);
    assert_eq!(body["request"]["status"], "pending");
    assert_eq!(body["request"]["id"], request_id.as_str());
}

#[test]
fn canceled_requests_reopen_without_cooldown() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (_bob, bob_id) = register(&client, "bob");

    let res = create_request(&client, &alice, &bob_id);
    let request_id = json_body(res)["request"]["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/v1/session-requests/{request_id}/cancel"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = create_request(&client, &alice, &bob_id);
    assert_eq!(res.status(), Status::Ok);
    assert_eq!(json_body(res)["request"]["status"], "pending");
}

#[test]
fn map_requests_cap_at_ten_per_local_day() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");

    for i in 0..10 {
        let (_t, peer_id) = register(&client, &format!("peer{i:02}"));
        let res = create_request(&client, &alice, &peer_id);
        assert_eq!(res.status(), Status::Ok, "request {i}");
    }

    let (_t, eleventh) = register(&client, "peer10");
    let res = create_request(&client, &alice, &eleventh);
    assert_eq!(res.status(), Status::Conflict);
    assert_eq!(error_code(&json_body(res)), "RATE_LIMITED");
}

#[test]
fn listing_splits_incoming_and_outgoing() {
    let client = test_client();
    let (alice, alice_id) = register(&client, "alice");
    let (bob, bob_id) = register(&client, "bob");
    let (carol, _) = register(&client, "carol");

    create_request(&client, &alice, &bob_id);
    create_request(&client, &carol, &alice_id);

    let res = client
        .get("/v1/session-requests")
        .header(bearer(&alice))
        .dispatch();
    let body = json_body(res);
    assert_eq!(body["outgoing"].as_array().unwrap().len(), 1);
    assert_eq!(body["incoming"].as_array().unwrap().len(), 1);
    assert_eq!(body["outgoing"][0]["counterpart"]["username"], "bob");
    assert_eq!(body["incoming"][0]["counterpart"]["username"], "carol");

    let res = client
        .get("/v1/session-requests")
        .header(bearer(&bob))
        .dispatch();
    let body = json_body(res);
    assert_eq!(body["incoming"].as_array().unwrap().len(), 1);
    assert!(body["outgoing"].as_array().unwrap().is_empty());
}

// --- Invites ---

#[test]
fn invite_code_is_stable_per_owner() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");

    let res = client
        .get("/v1/session-requests/invites")
        .header(bearer(&alice))
        .dispatch();
    let code1 = json_body(res)["code"].as_str().unwrap().to_string();
    assert_eq!(code1.len(), 16);
    assert!(code1.chars().all(|c| c.is_ascii_hexdigit()));

    let res = client
        .get("/v1/session-requests/invites")
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(json_body(res)["code"], code1.as_str());
}

#[test]
fn consuming_an_invite_opens_a_wechat_code_request() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, _) = register(&client, "bob");

    let res = client
        .get("/v1/session-requests/invites")
        .header(bearer(&alice))
        .dispatch();
    let code = json_body(res)["code"].as_str().unwrap().to_string();

    let res = client
        .post("/v1/session-requests/invites/consume")
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(format!(r#"{{"code":"{code}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res);
    assert_eq!(body["request"]["source"], "wechat_code");
    assert_eq!(body["request"]["counterpart"]["username"], "alice");
}

#[test]
fn unknown_invite_code_404s() {
    let client = test_client();
    let (bob, _) = register(&client, "bob");
    let res = client
        .post("/v1/session-requests/invites/consume")
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(r#"{"code":"ffffffffffffffff"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
    assert_eq!(error_code(&json_body(res)), "INVITE_INVALID");
}

#[test]
fn geo_fenced_invite_gates_by_haversine_distance() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, _) = register(&client, "bob");

    let res = client
        .put("/v1/session-requests/invites")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"geoFence":{"lat":31.0,"lng":121.0,"radiusM":500}}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let code = json_body(res)["code"].as_str().unwrap().to_string();

    // No coordinates: required.
    let res = client
        .post("/v1/session-requests/invites/consume")
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(format!(r#"{{"code":"{code}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
    assert_eq!(error_code(&json_body(res)), "GEO_REQUIRED");

    // Far away (Beijing): forbidden.
    let res = client
        .post("/v1/session-requests/invites/consume")
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(format!(r#"{{"code":"{code}","atLat":39.9,"atLng":116.4}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
    assert_eq!(error_code(&json_body(res)), "GEO_FORBIDDEN");

    // ~100 m away: inside the fence.
    let res = client
        .post("/v1/session-requests/invites/consume")
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(format!(r#"{{"code":"{code}","atLat":31.0,"atLng":121.001}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn expired_invite_is_rejected() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, _) = register(&client, "bob");

    let expires = chrono::Utc::now().timestamp_millis() + 3_600_000;
    let res = client
        .put("/v1/session-requests/invites")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(format!(r#"{{"expiresAtMs":{expires}}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let code = json_body(res)["code"].as_str().unwrap().to_string();

    // Age the expiry into the past.
    let conn = rusqlite::Connection::open(&client.db_path).unwrap();
    conn.execute(
        "UPDATE session_invites SET expires_at_ms = ?1 WHERE code = ?2",
        params![chrono::Utc::now().timestamp_millis() - 1, &code],
    )
    .unwrap();
    drop(conn);

    let res = client
        .post("/v1/session-requests/invites/consume")
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(format!(r#"{{"code":"{code}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
    assert_eq!(error_code(&json_body(res)), "INVITE_EXPIRED");
}

#[test]
fn invite_settings_validate_fence_radius_and_future_expiry() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");

    let res = client
        .put("/v1/session-requests/invites")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"geoFence":{"lat":31.0,"lng":121.0,"radiusM":200001}}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    let res = client
        .put("/v1/session-requests/invites")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"expiresAtMs":1}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}
