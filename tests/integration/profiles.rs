use crate::common::{bearer, json_body, register, test_client};
use rocket::http::{ContentType, Status};

#[test]
fn profile_defaults_resolve_to_core_identity() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");

    for view in ["card", "map"] {
        let res = client
            .get(format!("/v1/profiles/{view}"))
            .header(bearer(&alice))
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
        let body = json_body(res);
        assert_eq!(body["view"], view);
        assert!(body["nickname"].is_null());
        assert_eq!(body["resolvedNickname"], "alice");
    }
}

#[test]
fn override_wins_and_fields_are_stored_verbatim() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");

    let res = client
        .put("/v1/profiles/card")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"nickname":"Ally","fields":{"school":"SJTU","year":3,"tags":["hiking"]}}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body = json_body(res);
    assert_eq!(body["resolvedNickname"], "Ally");
    assert_eq!(body["fields"]["school"], "SJTU");
    assert_eq!(body["fields"]["tags"][0], "hiking");

    // The map view is untouched.
    let res = client
        .get("/v1/profiles/map")
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(json_body(res)["resolvedNickname"], "alice");
}

#[test]
fn fields_must_be_an_object() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let res = client
        .put("/v1/profiles/card")
        .header(ContentType::JSON)
        .header(bearer(&alice))
        .body(r#"{"fields":["not","an","object"]}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn unknown_view_is_404() {
    let client = test_client();
    let (alice, _) = register(&client, "alice");
    let res = client
        .get("/v1/profiles/billboard")
        .header(bearer(&alice))
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}
