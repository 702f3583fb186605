//! End-to-end tests over the HTTP router: identity, presence, messages,
//! files, and cleanup flows as a client would drive them.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use roomsync::api::{create_router, AppState};
use roomsync::cleanup::ANON_USER_RETENTION_MS;
use roomsync::db::{now_ms, RoomStore};
use roomsync::files::MAX_FILE_SIZE;
use roomsync::identity::IdentityService;
use roomsync::messages::MESSAGE_RETENTION_MS;

struct TestApp {
    app: Router,
    state: AppState,
    _dir: tempfile::TempDir,
}

async fn test_app() -> TestApp {
    let store = Arc::new(RoomStore::in_memory().await.unwrap());
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::new(
        store,
        IdentityService::generate_secret(),
        Some(dir.path().to_path_buf()),
    );
    TestApp {
        app: create_router(state.clone()),
        state,
        _dir: dir,
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn upload_request(uri: &str, filename: &str, mime: &str, data: &[u8]) -> Request<Body> {
    let boundary = "------------------------roomsync";
    let mut body = format!(
        "--{b}\r\ncontent-disposition: form-data; name=\"file\"; filename=\"{f}\"\r\ncontent-type: {m}\r\n\r\n",
        b = boundary,
        f = filename,
        m = mime
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn anonymous_identity_flow() {
    let t = test_app().await;

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/auth/anonymous",
            json!({ "name": "Drifter" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    let access = body["data"]["access_token"].as_str().unwrap().to_string();
    let refresh = body["data"]["refresh_token"].as_str().unwrap().to_string();
    let user_id = body["data"]["user"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["user"]["is_anonymous"], true);

    // me
    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/auth/me")
                .header("authorization", format!("Bearer {}", access))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["id"], user_id.as_str());

    // me without a token is rejected
    let response = t
        .app
        .clone()
        .oneshot(get_request("/v1/auth/me"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    // public profile hides internal fields
    let response = t
        .app
        .clone()
        .oneshot(get_request(&format!("/v1/users/{}", user_id)))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"]["name"], "Drifter");
    assert!(body["data"].get("is_anonymous").is_none());

    // refresh rotates the token
    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/auth/refresh",
            json!({ "refresh_token": refresh }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_ne!(body["data"]["refresh_token"], refresh.as_str());

    // old refresh token is spent
    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/auth/refresh",
            json!({ "refresh_token": refresh }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn presence_heartbeat_list_leave() {
    let t = test_app().await;

    for session in ["s1", "s2"] {
        let response = t
            .app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/v1/rooms/lobby/presence",
                json!({ "data": { "name": session }, "session_id": session }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = t
        .app
        .clone()
        .oneshot(get_request("/v1/rooms/lobby/presence"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 2);

    // Leave one session; a repeated leave stays a success
    for _ in 0..2 {
        let response = t
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/v1/rooms/lobby/presence?session_id=s1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = t
        .app
        .clone()
        .oneshot(get_request("/v1/rooms/lobby/presence"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["data"][0]["session_id"], "s2");
}

#[tokio::test]
async fn message_flow_with_ownership() {
    let t = test_app().await;

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/rooms/lobby/messages",
            json!({ "content": "hello", "user_name": "Alice", "session_id": "s1" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    let message_id = body["data"]["id"].as_str().unwrap().to_string();

    // A different session's delete quietly no-ops
    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/messages/{}?session_id=s2", message_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = t
        .app
        .clone()
        .oneshot(get_request("/v1/rooms/lobby/messages"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 1);

    // The owner's delete removes it
    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/messages/{}?session_id=s1", message_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = t
        .app
        .clone()
        .oneshot(get_request("/v1/rooms/lobby/messages"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn message_validation_codes() {
    let t = test_app().await;

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/rooms/lobby/messages",
            json!({ "content": "   ", "user_name": "Alice", "session_id": "s1" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "EMPTY_MESSAGE");
    assert_eq!(body["success"], false);

    let response = t
        .app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/rooms/lobby/messages",
            json!({ "content": "x".repeat(2001), "user_name": "Alice", "session_id": "s1" }),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "MESSAGE_TOO_LONG");
}

#[tokio::test]
async fn file_upload_list_download_delete() {
    let t = test_app().await;

    let response = t
        .app
        .clone()
        .oneshot(upload_request(
            "/v1/files?session_id=s1",
            "note.txt",
            "text/plain",
            b"ephemeral note",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    let file_id = body["data"]["id"].as_str().unwrap().to_string();
    let storage_id = body["data"]["storage_id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["name"], "note.txt");
    assert_eq!(body["data"]["size"], 14);

    // Listed for the owning session only
    let response = t
        .app
        .clone()
        .oneshot(get_request("/v1/files?session_id=s1"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 1);

    let response = t
        .app
        .clone()
        .oneshot(get_request("/v1/files?session_id=s2"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 0);

    // Download round-trips the content
    let response = t
        .app
        .clone()
        .oneshot(get_request(&format!("/v1/files/{}/content", storage_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/plain"
    );
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"ephemeral note");

    // Delete, then the download 404s with a structured code
    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/files/{}?session_id=s1", file_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = t
        .app
        .clone()
        .oneshot(get_request(&format!("/v1/files/{}/content", storage_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn file_upload_size_contract() {
    let t = test_app().await;

    // Several megabytes is a valid upload, well within the cap
    let response = t
        .app
        .clone()
        .oneshot(upload_request(
            "/v1/files?session_id=s1",
            "big.bin",
            "application/octet-stream",
            &vec![7u8; 3 * 1024 * 1024],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["data"]["size"], 3 * 1024 * 1024);

    // One byte past the cap fails with the structured code
    let response = t
        .app
        .clone()
        .oneshot(upload_request(
            "/v1/files?session_id=s1",
            "huge.bin",
            "application/octet-stream",
            &vec![7u8; MAX_FILE_SIZE + 1],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "FILE_TOO_LARGE");
    assert_eq!(body["success"], false);

    // The rejected file left nothing behind
    let response = t
        .app
        .clone()
        .oneshot(get_request("/v1/files?session_id=s1"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn admin_cleanup_reports_counts() {
    let t = test_app().await;

    // Seed a message and an anonymous user, then age both past retention
    t.app
        .clone()
        .oneshot(json_request(
            "POST",
            "/v1/rooms/lobby/messages",
            json!({ "content": "old", "user_name": "Ghost", "session_id": "s1" }),
        ))
        .await
        .unwrap();
    t.app
        .clone()
        .oneshot(json_request("POST", "/v1/auth/anonymous", json!({})))
        .await
        .unwrap();

    t.state
        .store
        .execute(
            format!(
                "UPDATE messages SET created_at = {}",
                now_ms() - MESSAGE_RETENTION_MS - 1000
            ),
            vec![],
        )
        .await
        .unwrap();
    t.state
        .store
        .execute(
            format!(
                "UPDATE users SET created_at = {}",
                now_ms() - ANON_USER_RETENTION_MS - 1000
            ),
            vec![],
        )
        .await
        .unwrap();

    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/admin/cleanup")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["messages"], 1);
    assert_eq!(body["data"]["anonymous_users"], 1);

    let response = t
        .app
        .clone()
        .oneshot(get_request("/v1/rooms/lobby/messages"))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["count"], 0);
}
