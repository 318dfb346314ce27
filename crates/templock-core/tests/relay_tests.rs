//! 集成测试 - 中继客户端与文件服务
//!
//! 在本地端口上运行一个最小的中继，行为与线格式保持一致。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use templock_core::session::Session;
use templock_core::transfer::{FileState, RelayClient};
use templock_core::workflow::FileService;
use templock_core::Error;

struct StoredFile {
    id: String,
    metadata: String,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Vec<StoredFile>>,
    extra_lines: Vec<String>,
    log: Vec<String>,
    next_id: usize,
}

#[derive(Clone, Default)]
struct FakeRelay {
    inner: Arc<Mutex<Inner>>,
}

impl FakeRelay {
    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        f(&mut self.inner.lock().unwrap())
    }

    fn corrupt(&self, session_id: &str, file_id: &str) {
        self.with(|inner| {
            let file = inner
                .sessions
                .get_mut(session_id)
                .and_then(|files| files.iter_mut().find(|f| f.id == file_id))
                .unwrap();
            file.bytes[0] ^= 0xff;
        });
    }
}

fn not_found(what: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": format!("{what} not found") }))).into_response()
}

async fn create_session(State(relay): State<FakeRelay>) -> Json<serde_json::Value> {
    let id = relay.with(|inner| {
        inner.next_id += 1;
        let id = format!("room{}", inner.next_id);
        inner.sessions.insert(id.clone(), Vec::new());
        inner.log.push(format!("created {id}"));
        id
    });
    Json(json!({ "session_id": id }))
}

async fn upload(State(relay): State<FakeRelay>, mut multipart: Multipart) -> Response {
    let mut fields = HashMap::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        fields.insert(name, field.bytes().await.unwrap().to_vec());
    }
    let (Some(metadata), Some(bytes), Some(session_id)) = (
        fields.remove("metadata"),
        fields.remove("file"),
        fields.remove("session_id"),
    ) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "missing field" }))).into_response();
    };
    let session_id = String::from_utf8(session_id).unwrap();
    let metadata = String::from_utf8(metadata).unwrap();

    relay.with(|inner| {
        inner.next_id += 1;
        let id = format!("file{}", inner.next_id);
        let Some(files) = inner.sessions.get_mut(&session_id) else {
            return not_found("session");
        };
        files.push(StoredFile {
            id: id.clone(),
            metadata,
            bytes,
        });
        inner.log.push(format!("uploaded {id}"));
        Json(json!({
            "success": true,
            "message": "stored",
            "file_id": id,
            "download_url": format!("/download/{session_id}/{id}"),
        }))
        .into_response()
    })
}

async fn get_all(State(relay): State<FakeRelay>, Path(session_id): Path<String>) -> Response {
    relay.with(|inner| {
        let Some(files) = inner.sessions.get(&session_id) else {
            return not_found("session");
        };
        let mut lines: Vec<String> = files
            .iter()
            .map(|f| format!("{}: {}", f.id, f.metadata))
            .collect();
        lines.extend(inner.extra_lines.iter().cloned());
        lines.join("\n").into_response()
    })
}

async fn download(
    State(relay): State<FakeRelay>,
    Path((session_id, file_id)): Path<(String, String)>,
) -> Response {
    relay.with(|inner| {
        inner
            .sessions
            .get(&session_id)
            .and_then(|files| files.iter().find(|f| f.id == file_id))
            .map_or_else(|| not_found("file"), |f| f.bytes.clone().into_response())
    })
}

async fn remove(
    State(relay): State<FakeRelay>,
    Path((session_id, file_id)): Path<(String, String)>,
) -> Response {
    relay.with(|inner| {
        let Some(files) = inner.sessions.get_mut(&session_id) else {
            return not_found("session");
        };
        let before = files.len();
        files.retain(|f| f.id != file_id);
        if files.len() == before {
            return not_found("file");
        }
        inner.log.push(format!("deleted {file_id}"));
        StatusCode::NO_CONTENT.into_response()
    })
}

async fn logs(State(relay): State<FakeRelay>, Path(_session_id): Path<String>) -> String {
    relay.with(|inner| inner.log.join("\n"))
}

async fn spawn_relay() -> (String, FakeRelay) {
    let relay = FakeRelay::default();
    let app = Router::new()
        .route("/create-session", post(create_session))
        .route("/upload", post(upload))
        .route("/get-all/:session_id", get(get_all))
        .route("/download/:session_id/:file_id", get(download))
        .route("/delete/:session_id/:file_id", delete(remove))
        .route("/logs/:session_id", get(logs))
        .with_state(relay.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), relay)
}

async fn service() -> (FileService, FakeRelay) {
    let (url, relay) = spawn_relay().await;
    let client = RelayClient::new(&url).unwrap();
    let session = Session::generate(client.create_session().await.unwrap()).unwrap();
    (FileService::new(client, session), relay)
}

#[tokio::test]
async fn test_upload_list_download() {
    let (files, _relay) = service().await;
    let plaintext = b"the quick brown fox".repeat(100);

    let id = files.upload("fox.txt", &plaintext).await.unwrap();
    assert_eq!(files.refresh().await.unwrap(), 1);

    let records = files.snapshot().await;
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].metadata.file_name, "fox.txt");
    assert_eq!(records[0].metadata.file_size, plaintext.len() as u64);
    assert_eq!(records[0].state(), FileState::Inactive);

    let downloaded = files.download(&id).await.unwrap();
    assert_eq!(downloaded.as_deref(), Some(plaintext.as_slice()));

    let records = files.snapshot().await;
    assert_eq!(records[0].state(), FileState::Downloaded);
    assert_eq!(records[0].payload(), Some(plaintext.as_slice()));

    // 刷新保留下载状态
    files.refresh().await.unwrap();
    assert_eq!(files.snapshot().await[0].state(), FileState::Downloaded);
}

#[tokio::test]
async fn test_tampered_file_fails_only_that_file() {
    let (files, relay) = service().await;
    let good = files.upload("good.bin", &[1, 2, 3]).await.unwrap();
    let bad = files.upload("bad.bin", &[4, 5, 6]).await.unwrap();
    relay.corrupt(files.session().session_id(), &bad);

    assert!(matches!(
        files.download(&bad).await,
        Err(Error::DecryptionFailure(_))
    ));
    assert_eq!(files.download(&good).await.unwrap(), Some(vec![1, 2, 3]));

    let records = files.snapshot().await;
    let state = |id: &str| records.iter().find(|r| r.id == id).unwrap().state();
    assert_eq!(state(&bad), FileState::Inactive);
    assert_eq!(state(&good), FileState::Downloaded);
}

#[tokio::test]
async fn test_wrong_key_cannot_decrypt() {
    let (files, _relay) = service().await;
    let id = files.upload("secret.txt", b"top secret").await.unwrap();

    let stranger = FileService::new(
        files.relay().clone(),
        Session::generate(files.session().session_id()).unwrap(),
    );
    stranger.refresh().await.unwrap();
    assert!(matches!(
        stranger.download(&id).await,
        Err(Error::DecryptionFailure(_))
    ));
}

#[tokio::test]
async fn test_delete_and_logs() {
    let (files, _relay) = service().await;
    let id = files.upload("a.txt", b"a").await.unwrap();

    files.delete(&id).await.unwrap();
    assert!(files.snapshot().await.is_empty());
    assert_eq!(files.refresh().await.unwrap(), 0);

    assert!(matches!(
        files.delete(&id).await,
        Err(Error::RelayServerError { status: 404, .. })
    ));
    assert!(matches!(files.download(&id).await, Err(Error::Catalog(_))));

    let log = files.logs().await.unwrap();
    assert!(log.contains(&format!("deleted {id}")));
}

#[tokio::test]
async fn test_malformed_listing_lines_are_skipped() {
    let (files, relay) = service().await;
    files.upload("kept.txt", b"kept").await.unwrap();
    relay.with(|inner| {
        inner.extra_lines.push("no separator here".into());
        inner.extra_lines.push("broken: {not json".into());
    });

    assert_eq!(files.refresh().await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_session_reports_server_error() {
    let (url, _relay) = spawn_relay().await;
    let client = RelayClient::new(&url).unwrap();
    let files = FileService::new(client, Session::generate("nobody").unwrap());

    match files.refresh().await {
        Err(Error::RelayServerError { status, message }) => {
            assert_eq!(status, 404);
            assert_eq!(message, "session not found");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_unreachable_relay() {
    let client = RelayClient::new("http://127.0.0.1:1").unwrap();
    assert!(!client.is_reachable().await);

    let files = FileService::new(client, Session::generate("abcd").unwrap());
    let error = files.refresh().await.unwrap_err();
    assert!(matches!(error, Error::RelayUnavailable(_)));
    assert!(error.is_retryable());
}
