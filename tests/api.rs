//! HTTP API tests driven through the router.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use image_relay::AppConfig;
use image_relay::server;
use serde_json::{Value, json};
use tower::ServiceExt;

fn app() -> (tempfile::TempDir, Router) {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig::new(dir.path().join("data"), "127.0.0.1:0");
    let state = server::build_state(config).unwrap();
    (dir, server::create_router(state))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn send_json(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(body).unwrap()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint() {
    let (_dir, app) = app();
    let response = app.oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn sync_without_source_is_bad_request() {
    let (_dir, app) = app();
    let response = app
        .oneshot(send_json("POST", "/api/tasks/sync", &json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "source_ref is required");
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let (_dir, app) = app();
    let response = app
        .oneshot(get("/api/tasks/task_missing"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("task not found"));
}

#[tokio::test]
async fn task_list_starts_empty() {
    let (_dir, app) = app();
    let response = app.oneshot(get("/api/tasks")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([]));
}

#[tokio::test]
async fn credential_lifecycle_masks_passwords() {
    let (_dir, app) = app();

    let response = app
        .clone()
        .oneshot(send_json(
            "POST",
            "/api/credentials",
            &json!({
                "name": "hub",
                "registry": "ghcr.io",
                "username": "me",
                "password": "secret"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["password"], "********");
    let id = created["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("cred_"));

    let response = app.clone().oneshot(get("/api/credentials")).await.unwrap();
    let listed = body_json(response).await;
    assert_eq!(listed[0]["password"], "********");

    // Echoing the mask back preserves the stored secret and succeeds.
    let response = app
        .clone()
        .oneshot(send_json(
            "PUT",
            &format!("/api/credentials/{}", id),
            &json!({
                "name": "hub-renamed",
                "registry": "ghcr.io",
                "username": "me",
                "password": "********"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["name"], "hub-renamed");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/credentials/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn registry_query_without_registry_is_bad_request() {
    let (_dir, app) = app();
    let response = app
        .oneshot(get("/api/registry/repositories"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "registry is required");
}

#[tokio::test]
async fn archives_list_starts_empty_and_delete_404s() {
    let (_dir, app) = app();
    let response = app.clone().oneshot(get("/api/archives")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([]));

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/archives/archive_missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Pipe autosave conflict flow: matching token succeeds, stale token
/// conflicts with the current version attached, force bypasses.
#[tokio::test]
async fn pipe_conflict_then_force() {
    let (_dir, app) = app();

    let response = app
        .clone()
        .oneshot(send_json("POST", "/api/pipes", &json!({"name": "flow"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let id = created["id"].as_str().unwrap().to_string();
    let original_token = created["updated_at"].as_str().unwrap().to_string();
    assert_eq!(created["version"], 1);

    // Autosave with the fresh token succeeds and keeps the version.
    let response = app
        .clone()
        .oneshot(send_json(
            "PUT",
            &format!(
                "/api/pipes/{}?autosave=1&base_updated_at={}",
                id, original_token
            ),
            &json!({"name": "flow", "nodes": [{"id": "n1"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let saved = body_json(response).await;
    assert_eq!(saved["version"], 1);
    let new_token = saved["updated_at"].as_str().unwrap().to_string();
    assert_ne!(new_token, original_token);

    // A second autosave still holding the original token conflicts.
    let response = app
        .clone()
        .oneshot(send_json(
            "PUT",
            &format!(
                "/api/pipes/{}?autosave=1&base_updated_at={}",
                id, original_token
            ),
            &json!({"name": "flow"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let conflict = body_json(response).await;
    assert_eq!(conflict["current_version"], 1);
    assert_eq!(conflict["current_updated_at"], new_token.as_str());
    assert!(conflict["error"].as_str().unwrap().contains("modified"));

    // Forcing bypasses the token check; autosave keeps version 1.
    let response = app
        .clone()
        .oneshot(send_json(
            "PUT",
            &format!(
                "/api/pipes/{}?autosave=1&force=1&base_updated_at={}",
                id, original_token
            ),
            &json!({"name": "flow"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let forced = body_json(response).await;
    assert_eq!(forced["version"], 1);
    assert!(forced["updated_at"].as_str().unwrap() > new_token.as_str());

    // Autosaves never created snapshots: history still holds only v1.
    let response = app
        .clone()
        .oneshot(get(&format!("/api/pipes/{}/versions", id)))
        .await
        .unwrap();
    let versions = body_json(response).await;
    assert_eq!(versions.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn pipe_update_bumps_version_and_ops_round_trip() {
    let (_dir, app) = app();

    let response = app
        .clone()
        .oneshot(send_json("POST", "/api/pipes", &json!({"name": "flow"})))
        .await
        .unwrap();
    let created = body_json(response).await;
    let id = created["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(send_json(
            "PUT",
            &format!("/api/pipes/{}", id),
            &json!({"name": "flow-2"}),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["version"], 2);

    let response = app
        .clone()
        .oneshot(get(&format!("/api/pipes/{}/versions/1", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["name"], "flow");

    let response = app
        .clone()
        .oneshot(send_json(
            "POST",
            &format!("/api/pipes/{}/ops", id),
            &json!([
                {"kind": "add_node", "data": {"id": "n1"}},
                {"kind": ""}
            ]),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["appended"], 1);

    let response = app
        .clone()
        .oneshot(get(&format!("/api/pipes/{}/ops?limit=10", id)))
        .await
        .unwrap();
    let ops = body_json(response).await;
    assert_eq!(ops.as_array().unwrap().len(), 1);
    assert_eq!(ops[0]["kind"], "add_node");

    // Delete removes the document and its history.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/pipes/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app
        .oneshot(get(&format!("/api/pipes/{}", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stats_reports_counts() {
    let (_dir, app) = app();
    app.clone()
        .oneshot(send_json("POST", "/api/pipes", &json!({"name": "flow"})))
        .await
        .unwrap();

    let response = app.oneshot(get("/api/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["pipes"], 1);
    assert_eq!(stats["tasks"], 0);
    assert_eq!(stats["credentials"], 0);
    assert!(stats["data_size_bytes"].as_u64().unwrap() > 0);
}
