use crate::common::{bearer, error_code, json_body, register, test_client};
use rocket::http::{ContentType, Status};

fn request_friend<'a>(
    client: &'a rocket::local::blocking::Client,
    token: &'a str,
    addressee_id: &'a str,
) -> rocket::local::blocking::LocalResponse<'a> {
    client
        .post("/v1/friends/requests")
        .header(ContentType::JSON)
        .header(bearer(token))
        .body(format!(r#"{{"addresseeId":"{addressee_id}","verificationMessage":"hi"}}"#))
        .dispatch()
}

#[test]
fn friend_request_accept_makes_both_sides_friends() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, bob_id) = register(&client, "bob");

    let res = request_friend(&client, &alice, &bob_id);
    assert_eq!(res.status(), Status::Ok);
    let request_id = json_body(res)["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/v1/friends/requests/{request_id}/accept"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    assert_eq!(json_body(res)["status"], "accepted");

    // Symmetric rows: both users list the other.
    let res = client.get("/v1/friends").header(bearer(&alice)).dispatch();
    let friends = json_body(res);
    assert_eq!(friends.as_array().unwrap().len(), 1);
    assert_eq!(friends[0]["username"], "bob");

    let res = client.get("/v1/friends").header(bearer(&bob)).dispatch();
    assert_eq!(json_body(res)[0]["username"], "alice");
}

#[test]
fn cannot_friend_yourself_or_an_existing_friend() {
    let client = test_client();
    let (alice, alice_id) = register(&client, "alice");
    let (bob, bob_id) = register(&client, "bob");

    let res = request_friend(&client, &alice, &alice_id);
    assert_eq!(res.status(), Status::BadRequest);

    let res = request_friend(&client, &alice, &bob_id);
    let request_id = json_body(res)["id"].as_str().unwrap().to_string();
    client
        .post(format!("/v1/friends/requests/{request_id}/accept"))
        .header(bearer(&bob))
        .dispatch();

    let res = request_friend(&client, &alice, &bob_id);
    assert_eq!(res.status(), Status::Conflict);
    assert_eq!(error_code(&json_body(res)), "ALREADY_FRIENDS");
}

#[test]
fn only_the_addressee_accepts_and_only_the_requester_cancels() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, bob_id) = register(&client, "bob");

    let res = request_friend(&client, &alice, &bob_id);
    let request_id = json_body(res)["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/v1/friends/requests/{request_id}/accept"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .post(format!("/v1/friends/requests/{request_id}/cancel"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .post(format!("/v1/friends/requests/{request_id}/cancel"))
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    assert_eq!(json_body(res)["status"], "canceled");
}

#[test]
fn friend_request_listing() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, bob_id) = register(&client, "bob");

    request_friend(&client, &alice, &bob_id);

    let res = client
        .get("/v1/friends/requests")
        .header(bearer(&bob))
        .dispatch();
    let body = json_body(res);
    assert_eq!(body["incoming"].as_array().unwrap().len(), 1);
    assert_eq!(body["incoming"][0]["counterpart"]["username"], "alice");
    assert_eq!(body["incoming"][0]["verificationMessage"], "hi");
}

#[test]
fn friend_invite_consume_creates_a_request() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, _) = register(&client, "bob");

    let res = client
        .get("/v1/friends/invites")
        .header(bearer(&alice))
        .dispatch();
    let code = json_body(res)["code"].as_str().unwrap().to_string();

    let res = client
        .post("/v1/friends/invites/consume")
        .header(ContentType::JSON)
        .header(bearer(&bob))
        .body(format!(r#"{{"code":"{code}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["counterpart"]["username"], "alice");
}

#[test]
fn rejecting_a_friend_request_notifies_state() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let (bob, bob_id) = register(&client, "bob");

    let res = request_friend(&client, &alice, &bob_id);
    let request_id = json_body(res)["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/v1/friends/requests/{request_id}/reject"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    assert_eq!(json_body(res)["status"], "rejected");

    // Rejecting again: no longer pending.
    let res = client
        .post(format!("/v1/friends/requests/{request_id}/reject"))
        .header(bearer(&bob))
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
}
