use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use tower::ServiceExt;

use parley_api::state::AppStateInner;
use parley_core::accounts::Accounts;
use parley_core::capabilities::CapabilityGate;
use parley_core::chat::ChatService;
use parley_core::provider::{SUGGESTION_FALLBACK, UnconfiguredProvider};
use parley_core::tokens::TokenService;
use parley_db::Database;
use parley_gateway::Gateway;
use parley_gateway::assistant::Assistant;
use parley_gateway::dispatcher::Dispatcher;

const PASSWORD: &str = "correct horse battery";

struct TestApp {
    router: Router,
    accounts: Accounts,
}

fn app() -> TestApp {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let bot_id = db.ensure_bot_user(Utc::now()).unwrap().user_id().unwrap();
    let gate = CapabilityGate::new(db.clone());
    let tokens = TokenService::new(db.clone(), "test-secret", Duration::hours(1), Duration::days(30));
    let accounts = Accounts::new(db.clone(), tokens.clone(), gate.clone());
    let chat = ChatService::new(db, gate, Arc::new(UnconfiguredProvider));
    let dispatcher = Dispatcher::new();
    let assistant = Assistant::new(chat.clone(), dispatcher.clone(), bot_id, 5, StdDuration::from_secs(1));

    let state = Arc::new(AppStateInner {
        accounts: accounts.clone(),
        tokens,
        gateway: Gateway::new(chat, dispatcher, assistant),
        secure_cookies: false,
    });
    TestApp {
        router: parley_api::router(state),
        accounts,
    }
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl TestApp {
    async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        cookie: Option<&str>,
        body: Option<Value>,
    ) -> Reply {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(cookie) = cookie {
            req = req.header(header::COOKIE, cookie);
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        Reply { status, headers, body }
    }

    async fn get(&self, uri: &str, token: &str) -> Reply {
        self.call(Method::GET, uri, Some(token), None, None).await
    }

    async fn post(&self, uri: &str, token: &str, body: Value) -> Reply {
        self.call(Method::POST, uri, Some(token), None, Some(body)).await
    }

    async fn register(&self, username: &str) -> String {
        let reply = self
            .call(
                Method::POST,
                "/auth/register",
                None,
                None,
                Some(json!({
                    "username": username,
                    "email": format!("{username}@example.com"),
                    "password": PASSWORD,
                    "display_name": username.to_uppercase(),
                })),
            )
            .await;
        assert_eq!(reply.status, StatusCode::CREATED, "{}", reply.body);
        reply.body["id"].as_str().unwrap().to_string()
    }

    /// Returns the access token and the `refresh_token=...` cookie pair.
    async fn login(&self, username: &str) -> (String, String) {
        let reply = self
            .call(
                Method::POST,
                "/auth/login",
                None,
                None,
                Some(json!({ "identity": username, "password": PASSWORD })),
            )
            .await;
        assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
        (
            reply.body["access_token"].as_str().unwrap().to_string(),
            refresh_cookie(&reply.headers),
        )
    }
}

fn refresh_cookie(headers: &HeaderMap) -> String {
    let set_cookie = headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("refresh_token="))
        .expect("refresh cookie set");
    set_cookie.split(';').next().unwrap().to_string()
}

fn error_code(reply: &Reply) -> &str {
    reply.body["error"]["code"].as_str().unwrap_or_default()
}

#[tokio::test]
async fn refresh_rotates_and_rejects_replay() {
    let app = app();
    app.register("alice").await;

    let reply = app
        .call(
            Method::POST,
            "/auth/login",
            None,
            None,
            Some(json!({ "identity": "alice@example.com", "password": PASSWORD })),
        )
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    let raw = reply.headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
    assert!(raw.contains("HttpOnly"));
    assert!(raw.contains("SameSite=Strict"));
    assert!(raw.contains("Path=/"));
    let first = refresh_cookie(&reply.headers);

    let rotated = app.call(Method::POST, "/auth/refresh", None, Some(&first), None).await;
    assert_eq!(rotated.status, StatusCode::OK);
    assert!(rotated.body["access_token"].is_string());
    let second = refresh_cookie(&rotated.headers);
    assert_ne!(first, second);

    let replay = app.call(Method::POST, "/auth/refresh", None, Some(&first), None).await;
    assert_eq!(replay.status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&replay), "UNAUTHENTICATED");

    let logout = app.call(Method::POST, "/auth/logout", None, Some(&second), None).await;
    assert_eq!(logout.status, StatusCode::NO_CONTENT);
    let after = app.call(Method::POST, "/auth/refresh", None, Some(&second), None).await;
    assert_eq!(after.status, StatusCode::UNAUTHORIZED);

    let bare = app.call(Method::POST, "/auth/logout", None, None, None).await;
    assert_eq!(bare.status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn protected_routes_need_a_valid_bearer() {
    let app = app();
    let reply = app.call(Method::GET, "/conversations", None, None, None).await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&reply), "UNAUTHENTICATED");

    let reply = app.get("/auth/me", "garbage").await;
    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);

    app.register("bob").await;
    let (token, _) = app.login("bob").await;
    let me = app.get("/auth/me", &token).await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["username"], "bob");

    let sessions = app.get("/auth/sessions", &token).await;
    assert_eq!(sessions.body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn bad_credentials_and_duplicates() {
    let app = app();
    app.register("carol").await;

    let wrong = app
        .call(
            Method::POST,
            "/auth/login",
            None,
            None,
            Some(json!({ "identity": "carol", "password": "not the password" })),
        )
        .await;
    assert_eq!(wrong.status, StatusCode::UNAUTHORIZED);

    let dup = app
        .call(
            Method::POST,
            "/auth/register",
            None,
            None,
            Some(json!({
                "username": "carol",
                "email": "carol2@example.com",
                "password": PASSWORD,
                "display_name": "Carol",
            })),
        )
        .await;
    assert_eq!(dup.status, StatusCode::CONFLICT);
    assert_eq!(error_code(&dup), "CONFLICT");
}

#[tokio::test]
async fn private_conversation_is_shared_by_both_directions() {
    let app = app();
    let alice = app.register("alice").await;
    let bob = app.register("bob").await;
    let (alice_token, _) = app.login("alice").await;
    let (bob_token, _) = app.login("bob").await;

    let first = app
        .post("/conversations/private", &alice_token, json!({ "target_user_id": bob }))
        .await;
    assert_eq!(first.status, StatusCode::CREATED);
    assert_eq!(first.body["type"], "private");

    let again = app
        .post("/conversations/private", &alice_token, json!({ "target_user_id": bob }))
        .await;
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(again.body["id"], first.body["id"]);

    let reverse = app
        .post("/conversations/private", &bob_token, json!({ "target_user_id": alice }))
        .await;
    assert_eq!(reverse.body["id"], first.body["id"]);

    let listed = app.get("/conversations", &bob_token).await;
    assert_eq!(listed.body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn messages_over_rest() {
    let app = app();
    app.register("alice").await;
    let bob = app.register("bob").await;
    app.register("mallory").await;
    let (alice_token, _) = app.login("alice").await;
    let (bob_token, _) = app.login("bob").await;
    let (mallory_token, _) = app.login("mallory").await;

    let conv = app
        .post("/conversations/private", &alice_token, json!({ "target_user_id": bob }))
        .await;
    let uri = format!("/conversations/{}/messages", conv.body["id"].as_str().unwrap());

    let sent = app.post(&uri, &alice_token, json!({ "content": "  hello bob  " })).await;
    assert_eq!(sent.status, StatusCode::CREATED);
    assert_eq!(sent.body["content"], "hello bob");
    assert_eq!(sent.body["type"], "text");

    let blank = app.post(&uri, &alice_token, json!({ "content": "   " })).await;
    assert_eq!(blank.status, StatusCode::BAD_REQUEST);
    let system = app
        .post(&uri, &alice_token, json!({ "content": "fake", "type": "system" }))
        .await;
    assert_eq!(system.status, StatusCode::BAD_REQUEST);

    let history = app.get(&uri, &bob_token).await;
    assert_eq!(history.status, StatusCode::OK);
    assert_eq!(history.body.as_array().unwrap().len(), 1);

    let outsider = app.get(&uri, &mallory_token).await;
    assert_eq!(outsider.status, StatusCode::FORBIDDEN);
    let intrusion = app.post(&uri, &mallory_token, json!({ "content": "hi" })).await;
    assert_eq!(intrusion.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn recall_and_delete_for_me() {
    let app = app();
    app.register("alice").await;
    let bob = app.register("bob").await;
    let (alice_token, _) = app.login("alice").await;
    let (bob_token, _) = app.login("bob").await;

    let conv = app
        .post("/conversations/private", &alice_token, json!({ "target_user_id": bob }))
        .await;
    let uri = format!("/conversations/{}/messages", conv.body["id"].as_str().unwrap());
    let first = app.post(&uri, &alice_token, json!({ "content": "oops" })).await;
    let second = app.post(&uri, &alice_token, json!({ "content": "keep" })).await;
    let first_id = first.body["id"].as_str().unwrap();
    let second_id = second.body["id"].as_str().unwrap();

    let stolen = app
        .post(&format!("/messages/{first_id}/recall"), &bob_token, json!({}))
        .await;
    assert_eq!(stolen.status, StatusCode::FORBIDDEN);

    let recalled = app
        .call(Method::POST, &format!("/messages/{first_id}/recall"), Some(&alice_token), None, None)
        .await;
    assert_eq!(recalled.status, StatusCode::OK);
    assert_eq!(recalled.body["is_recalled"], true);
    assert_eq!(recalled.body["content"], "");

    let deleted = app
        .call(Method::DELETE, &format!("/messages/{second_id}"), Some(&bob_token), None, None)
        .await;
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);

    let bob_view = app.get(&uri, &bob_token).await;
    let bob_view = bob_view.body.as_array().unwrap();
    assert_eq!(bob_view.len(), 1);
    assert_eq!(bob_view[0]["is_recalled"], true);

    let alice_view = app.get(&uri, &alice_token).await;
    assert_eq!(alice_view.body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn group_lifecycle() {
    let app = app();
    app.register("owner").await;
    let member = app.register("member").await;
    let (owner_token, _) = app.login("owner").await;
    let (member_token, _) = app.login("member").await;

    let group = app
        .post(
            "/conversations/group",
            &owner_token,
            json!({ "title": "  Weekend  ", "member_ids": [member] }),
        )
        .await;
    assert_eq!(group.status, StatusCode::CREATED);
    assert_eq!(group.body["title"], "Weekend");
    let id = group.body["id"].as_str().unwrap().to_string();

    let toggled = app
        .call(
            Method::PATCH,
            &format!("/conversations/{id}/bot"),
            Some(&member_token),
            None,
            Some(json!({ "active": true })),
        )
        .await;
    assert_eq!(toggled.status, StatusCode::OK);
    assert_eq!(toggled.body["is_bot_active"], true);

    let denied = app
        .call(Method::DELETE, &format!("/conversations/{id}"), Some(&member_token), None, None)
        .await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);

    let read = app
        .call(Method::POST, &format!("/conversations/{id}/read"), Some(&member_token), None, None)
        .await;
    assert_eq!(read.status, StatusCode::NO_CONTENT);

    let left = app
        .call(Method::POST, &format!("/conversations/{id}/leave"), Some(&owner_token), None, None)
        .await;
    assert_eq!(left.status, StatusCode::NO_CONTENT);

    let listed = app.get("/conversations", &member_token).await;
    let listed = listed.body.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["owner_id"].as_str().unwrap(), member);

    let deleted = app
        .call(Method::DELETE, &format!("/conversations/{id}"), Some(&member_token), None, None)
        .await;
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);
    assert!(app.get("/conversations", &member_token).await.body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn suggestion_falls_back_without_a_provider() {
    let app = app();
    app.register("alice").await;
    let bob = app.register("bob").await;
    let (token, _) = app.login("alice").await;

    let conv = app
        .post("/conversations/private", &token, json!({ "target_user_id": bob }))
        .await;
    let id = conv.body["id"].as_str().unwrap();
    app.post(&format!("/conversations/{id}/messages"), &token, json!({ "content": "hi" }))
        .await;

    let reply = app.get(&format!("/conversations/{id}/suggestion"), &token).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["suggestion"], SUGGESTION_FALLBACK);
}

#[tokio::test]
async fn admins_toggle_optional_capabilities() {
    let app = app();
    app.register("root").await;
    let other = app.register("user").await;
    let (user_token, _) = app.login("user").await;

    let forbidden = app.get("/admin/features", &user_token).await;
    assert_eq!(forbidden.status, StatusCode::FORBIDDEN);

    assert!(app.accounts.promote_admin("root").await.unwrap());
    let (admin_token, _) = app.login("root").await;

    let listed = app.get("/admin/features", &admin_token).await;
    assert_eq!(listed.status, StatusCode::OK);
    assert!(listed.body.as_array().unwrap().iter().all(|c| c["type"] == "optional"));

    let off = app
        .call(
            Method::PUT,
            "/admin/features/feature_group_chat",
            Some(&admin_token),
            None,
            Some(json!({ "enabled": false })),
        )
        .await;
    assert_eq!(off.status, StatusCode::OK);
    assert_eq!(off.body["enabled"], false);

    let blocked = app
        .post("/conversations/group", &user_token, json!({ "title": "Nope", "member_ids": [other] }))
        .await;
    assert_eq!(blocked.status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&blocked), "POLICY_VIOLATION");

    let core = app
        .call(
            Method::PUT,
            "/admin/features/feature_registration",
            Some(&admin_token),
            None,
            Some(json!({ "enabled": false })),
        )
        .await;
    assert_eq!(core.status, StatusCode::FORBIDDEN);

    let unknown = app
        .call(
            Method::PUT,
            "/admin/features/feature_teleport",
            Some(&admin_token),
            None,
            Some(json!({ "enabled": true })),
        )
        .await;
    assert_eq!(unknown.status, StatusCode::NOT_FOUND);

    let public = app.get("/features", &user_token).await;
    let group = public
        .body
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["key"] == "feature_group_chat")
        .cloned()
        .unwrap();
    assert_eq!(group["enabled"], false);
}
