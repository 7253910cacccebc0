//! Test helpers: build AppState and router for integration tests.
//!
//! Every app gets its own temp-dir content store, in-memory records and header auth, so
//! tests run in parallel without external services.

#![allow(dead_code)]

pub mod derivers;
pub mod fixtures;

use axum_test::multipart::{MultipartForm, Part};
use axum_test::{TestResponse, TestServer};
use lumen_api::setup::routes;
use lumen_api::{build_state, AppState, ServiceDeps};
use lumen_core::{Config, UuidIdGenerator};
use lumen_db::{InMemoryMediaRepository, MediaRepository};
use lumen_processing::DeriverRegistry;
use lumen_storage::{LocalStorage, Storage};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const OWNER: &str = "u1";
pub const OTHER_USER: &str = "u2";

pub struct TestApp {
    pub server: TestServer,
    pub state: Arc<AppState>,
    pub store: PathBuf,
    _dir: TempDir,
}

/// Setup test app with local storage and the configured derivers.
pub async fn setup_test_app() -> TestApp {
    setup_test_app_with(|_| {}, |registry| registry).await
}

pub async fn setup_test_app_with(
    configure: impl FnOnce(&mut Config),
    derivers: impl FnOnce(DeriverRegistry) -> DeriverRegistry,
) -> TestApp {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let store = dir.path().join("store");

    let mut config = Config::for_tests(store.to_string_lossy());
    // No transcoder in the test environment: videos end up ready with derivatives pending.
    config.media.ffprobe_path = "/nonexistent/ffprobe".to_string();
    config.media.ffmpeg_path = "/nonexistent/ffmpeg".to_string();
    configure(&mut config);

    let storage: Arc<dyn Storage> = Arc::new(
        LocalStorage::new(store.clone(), "/media".to_string())
            .await
            .expect("Failed to create local storage"),
    );
    let repository: Arc<dyn MediaRepository> = Arc::new(InMemoryMediaRepository::new());
    let registry = derivers(DeriverRegistry::from_config(&config.media));

    let state = build_state(
        config,
        ServiceDeps {
            pool: None,
            repository,
            storage,
            derivers: registry,
            ids: Arc::new(UuidIdGenerator),
        },
    )
    .expect("Failed to build state");
    let router = routes::setup_routes(state.clone()).expect("Failed to build routes");
    let server = TestServer::new(router).expect("Failed to start test server");

    TestApp {
        server,
        state,
        store,
        _dir: dir,
    }
}

impl TestApp {
    pub fn client(&self) -> &TestServer {
        &self.server
    }

    /// Single-shot upload of one file as `user`.
    pub async fn upload(&self, user: &str, filename: &str, data: Vec<u8>, title: &str) -> TestResponse {
        let part = Part::bytes(data).file_name(filename.to_string());
        let form = MultipartForm::new()
            .add_text("title", title.to_string())
            .add_part("file", part);
        self.server
            .post("/api/media/upload")
            .add_header("X-User-Id", user)
            .multipart(form)
            .await
    }

    /// Upload and return the id of the single stored record.
    pub async fn upload_ok(&self, filename: &str, data: Vec<u8>) -> String {
        let response = self.upload(OWNER, filename, data, "t").await;
        assert_eq!(response.status_code(), 201, "{}", response.text());
        let body: Value = response.json();
        body["uploadedMedia"][0]["id"]
            .as_str()
            .expect("Expected an id in the upload response")
            .to_string()
    }

    pub async fn get_media(&self, id: &str) -> TestResponse {
        self.server
            .get(&format!("/api/media/{}", id))
            .add_header("X-User-Id", OWNER)
            .await
    }

    /// Poll the record until `status` matches or the timeout passes.
    pub async fn wait_for_status(&self, id: &str, status: &str, timeout: Duration) -> Value {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let response = self.get_media(id).await;
            if response.status_code() == 200 {
                let body: Value = response.json();
                if body["status"] == status {
                    return body;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("media {} never reached status {}", id, status);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub fn stored_files(&self) -> usize {
        count_files(&self.store)
    }
}

/// Regular files under `dir`, recursively.
pub fn count_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

/// Wait for a condition with timeout.
pub async fn wait_for_condition<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}
