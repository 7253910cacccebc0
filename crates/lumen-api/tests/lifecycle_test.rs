//! Derivation failure, deletion, ownership and the service endpoints.

mod helpers;

use axum::http::StatusCode;
use axum_test::multipart::{MultipartForm, Part};
use helpers::derivers::{FailingDeriver, GatedDeriver};
use helpers::fixtures::{solid_png, tiny_png};
use helpers::{setup_test_app, setup_test_app_with, wait_for_condition, OTHER_USER, OWNER};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[tokio::test]
async fn test_failed_derivation_is_terminal() {
    let app = setup_test_app_with(|_| {}, |r| r.with_deriver(Arc::new(FailingDeriver))).await;

    let form = MultipartForm::new()
        .add_text("uploadId", "broken-1")
        .add_part("file", Part::bytes(tiny_png()).file_name("broken.png"));
    let response = app
        .client()
        .post("/api/media/upload")
        .add_header("X-User-Id", OWNER)
        .multipart(form)
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    let id = response.json::<Value>()["uploadedMedia"][0]["id"]
        .as_str()
        .unwrap()
        .to_string();

    let failed = app.wait_for_status(&id, "failed", Duration::from_secs(10)).await;
    let reason = failed["failureReason"].as_str().unwrap();
    assert!(reason.starts_with("decode-failed"), "{}", reason);

    let progress = app
        .client()
        .get("/api/media/progress/broken-1")
        .add_header("X-User-Id", OWNER)
        .await;
    assert_eq!(progress.status_code(), StatusCode::OK);
    let snapshot: Value = progress.json();
    assert_eq!(snapshot["phase"], "failed");
    assert!(snapshot["error"].is_string());

    let report = app.state.cleanup.run_once().await;
    assert_eq!(report.requeued, 0);
    let after = app.get_media(&id).await.json::<Value>();
    assert_eq!(after["status"], "failed");

    // The original stays readable even though derivation failed.
    let original = app
        .client()
        .get(&format!("/api/media/stream/{}", id))
        .await;
    assert_eq!(original.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn test_delete_during_processing() {
    let release = Arc::new(Notify::new());
    let gate = GatedDeriver {
        release: release.clone(),
    };
    let app = setup_test_app_with(|_| {}, move |r| r.with_deriver(Arc::new(gate))).await;

    let id = app.upload_ok("held.png", tiny_png()).await;
    app.wait_for_status(&id, "processing", Duration::from_secs(10)).await;

    let stranger = app
        .client()
        .delete(&format!("/api/media/{}", id))
        .add_header("X-User-Id", OTHER_USER)
        .await;
    assert_eq!(stranger.status_code(), StatusCode::UNAUTHORIZED);

    let deleted = app
        .client()
        .delete(&format!("/api/media/{}", id))
        .add_header("X-User-Id", OWNER)
        .await;
    assert_eq!(deleted.status_code(), StatusCode::NO_CONTENT);
    assert_eq!(app.get_media(&id).await.status_code(), StatusCode::NOT_FOUND);

    release.notify_one();

    // The late thumbnail must not outlive the record.
    let store = app.store.clone();
    assert!(
        wait_for_condition(|| helpers::count_files(&store) == 0, Duration::from_secs(10)).await,
        "derivatives written after delete were not discarded"
    );

    let again = app
        .client()
        .delete(&format!("/api/media/{}", id))
        .add_header("X-User-Id", OWNER)
        .await;
    assert_eq!(again.status_code(), StatusCode::NOT_FOUND);

    let thumb = app
        .client()
        .get(&format!("/api/media/thumbnail/{}", id))
        .await;
    assert_eq!(thumb.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_update_is_owner_only() {
    let app = setup_test_app().await;
    let id = app.upload_ok("pic.png", tiny_png()).await;

    let stranger = app
        .client()
        .put(&format!("/api/media/{}", id))
        .add_header("X-User-Id", OTHER_USER)
        .json(&json!({ "title": "stolen" }))
        .await;
    assert_eq!(stranger.status_code(), StatusCode::UNAUTHORIZED);

    let owner = app
        .client()
        .put(&format!("/api/media/{}", id))
        .add_header("X-User-Id", OWNER)
        .json(&json!({ "title": "renamed", "tags": ["sea", "sun"] }))
        .await;
    assert_eq!(owner.status_code(), StatusCode::OK, "{}", owner.text());
    let body: Value = owner.json();
    assert_eq!(body["title"], "renamed");
    assert_eq!(body["tags"], json!(["sea", "sun"]));
    assert_eq!(body["originalFilename"], "pic.png");

    let anonymous = app.client().get(&format!("/api/media/{}", id)).await;
    assert_eq!(anonymous.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_list_filters_and_pagination() {
    let app = setup_test_app().await;
    let wide = app.upload_ok("wide.png", solid_png(8, 4)).await;
    app.upload_ok("square.png", tiny_png()).await;
    let other = app.upload(OTHER_USER, "theirs.png", tiny_png(), "beach day").await;
    assert_eq!(other.status_code(), StatusCode::CREATED);

    let all = app
        .client()
        .get("/api/media")
        .add_header("X-User-Id", OWNER)
        .add_query_param("limit", 2)
        .await;
    assert_eq!(all.status_code(), StatusCode::OK);
    let page: Value = all.json();
    assert_eq!(page["total"], 3);
    assert_eq!(page["media"].as_array().unwrap().len(), 2);
    assert_eq!(page["limit"], 2);

    let mine = app
        .client()
        .get("/api/media")
        .add_header("X-User-Id", OWNER)
        .add_query_param("userId", OWNER)
        .await
        .json::<Value>();
    assert_eq!(mine["total"], 2);

    let videos = app
        .client()
        .get("/api/media")
        .add_header("X-User-Id", OWNER)
        .add_query_param("type", "video")
        .await
        .json::<Value>();
    assert_eq!(videos["total"], 0);

    let search = app
        .client()
        .get("/api/media")
        .add_header("X-User-Id", OWNER)
        .add_query_param("search", "BEACH")
        .await
        .json::<Value>();
    assert_eq!(search["total"], 1);
    assert_eq!(search["media"][0]["userId"], OTHER_USER);

    let ready = app.wait_for_status(&wide, "ready", Duration::from_secs(10)).await;
    assert_eq!(ready["metadata"]["orientation"], "landscape");

    let bad = app
        .client()
        .get("/api/media")
        .add_header("X-User-Id", OWNER)
        .add_query_param("limit", "lots")
        .await;
    assert_eq!(bad.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_and_openapi() {
    let app = setup_test_app().await;

    let health = app.client().get("/health").await;
    assert_eq!(health.status_code(), StatusCode::OK);
    let body: Value = health.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "in-memory");

    let doc = app.client().get("/api/openapi.json").await;
    assert_eq!(doc.status_code(), StatusCode::OK);
    let spec: Value = doc.json();
    assert!(spec["paths"]["/api/media/upload"].is_object());
    assert!(spec["paths"]["/api/media/chunked/start"].is_object());
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = setup_test_app().await;
    let response = app
        .client()
        .get("/health")
        .add_header("X-Request-Id", "trace-me")
        .await;
    assert_eq!(response.header("x-request-id"), "trace-me");
    assert_eq!(response.header("x-content-type-options"), "nosniff");
}
