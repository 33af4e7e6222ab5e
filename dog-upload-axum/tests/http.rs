use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderValue, Request};
use dog_upload::{
    FolderDestinationResolver, MemoryBlobSink, MemoryObjectStore, MemoryUploadSessionStore, ObjectId,
    SessionEngine, UploadConfig,
};
use dog_upload_axum::{UploadApp, UploadState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

const BOUNDARY: &str = "dog-upload-test-boundary";

struct TestApp {
    app: UploadApp,
    remote: MemoryObjectStore,
}

fn test_app_with(config: UploadConfig) -> TestApp {
    let remote = MemoryObjectStore::new();
    let engine = SessionEngine::new(
        MemoryUploadSessionStore::new(),
        MemoryBlobSink::new(),
        remote.clone(),
        config,
    );
    let resolver = Arc::new(FolderDestinationResolver::new(Arc::new(remote.clone())));
    let state = UploadState::new(engine, resolver, Arc::new(remote.clone()));
    TestApp {
        app: UploadApp::new(state),
        remote,
    }
}

fn test_app() -> TestApp {
    test_app_with(UploadConfig::default().with_chunk_size(4))
}

enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a str, &'a [u8]),
}

fn multipart(parts: &[Part<'_>]) -> Request<Body> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n", name, value).as_bytes(),
                );
            }
            Part::File(name, file_name, data) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                        name, file_name
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/upload/chunk")
        .header("content-type", format!("multipart/form-data; boundary={}", BOUNDARY))
        .body(Body::from(body))
        .unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &UploadApp, req: Request<Body>) -> (u16, Value) {
    let res = app.router.clone().oneshot(req).await.unwrap();
    let status = res.status().as_u16();
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

async fn start(app: &UploadApp, file_size: u64) -> String {
    let (status, body) = send(
        app,
        json_request(
            "POST",
            "/api/upload/start",
            json!({
                "fileName": "photo.zip",
                "fileSize": file_size,
                "fileType": "application/zip",
                "studioName": "Bright Studio",
                "numSheets": 3,
            }),
        ),
    )
    .await;
    assert_eq!(status, 200, "{}", body);
    body["uploadId"].as_str().unwrap().to_string()
}

async fn send_chunk(app: &UploadApp, id: &str, index: &str, data: &[u8]) -> (u16, Value) {
    send(
        app,
        multipart(&[
            Part::Text("uploadId", id),
            Part::Text("chunkIndex", index),
            Part::Text("totalChunks", "3"),
            Part::File("chunk", "blob", data),
        ]),
    )
    .await
}

#[tokio::test]
async fn full_chunked_upload_round_trip() {
    let t = test_app();
    let id = start(&t.app, 12).await;

    let (status, body) = send_chunk(&t.app, &id, "1", b"bbbb").await;
    assert_eq!(status, 200);
    assert_eq!(body["isComplete"], false);
    assert_eq!(body["progress"], 33);

    let (_, body) = send_chunk(&t.app, &id, "0", b"aaaa").await;
    assert_eq!(body["progress"], 67);
    assert_eq!(body["receivedChunks"], 2);

    let (_, body) = send_chunk(&t.app, &id, "2", b"cccc").await;
    assert_eq!(body["isComplete"], true);
    assert_eq!(body["totalChunks"], 3);

    let (status, body) = send(&t.app, json_request("POST", "/api/upload/complete", json!({ "uploadId": id }))).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "uploaded");

    let object_id = ObjectId::new(body["objectId"].as_str().unwrap());
    let object = t.remote.object(&object_id).unwrap();
    assert_eq!(&object.data[..], b"aaaabbbbcccc");
    assert!(object.destination.as_str().starts_with("Bright Studio - 3 sheets - "));

    let (status, body) = send(&t.app, json_request("POST", "/api/upload/complete", json!({ "uploadId": id }))).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "already_completed");
    assert_eq!(t.remote.write_count(), 1);

    let (status, body) = send(
        &t.app,
        Request::builder()
            .uri(format!("/api/upload/{}", id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["objectId"], object_id.as_str());
}

#[tokio::test]
async fn start_rejects_missing_studio_with_feathers_shape() {
    let t = test_app();
    let (status, body) = send(
        &t.app,
        json_request(
            "POST",
            "/api/upload/start",
            json!({ "fileName": "a.zip", "fileSize": 10, "studioName": "" }),
        ),
    )
    .await;

    assert_eq!(status, 400);
    assert_eq!(body["success"], false);
    assert_eq!(body["name"], "BadRequest");
    assert_eq!(body["code"], 400);
    assert_eq!(body["className"], "bad-request");
    assert_eq!(body["data"]["kind"], "InvalidRequest");
    assert!(body["error"].as_str().unwrap().contains("Studio name"));
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let t = test_app();
    let req = Request::builder()
        .method("POST")
        .uri("/api/upload/start")
        .header("content-type", "application/json")
        .body(Body::from("{\"fileName\":\"x\""))
        .unwrap();

    let (status, body) = send(&t.app, req).await;
    assert_eq!(status, 400);
    assert_eq!(body["data"]["kind"], "InvalidRequest");
}

#[tokio::test]
async fn chunk_errors_map_to_status_codes() {
    let t = test_app();
    let id = start(&t.app, 12).await;

    let (status, body) = send_chunk(&t.app, &id, "3", b"zzzz").await;
    assert_eq!(status, 422);
    assert_eq!(body["data"]["kind"], "InvalidChunkIndex");

    let (status, _) = send_chunk(&t.app, &id, "abc", b"zzzz").await;
    assert_eq!(status, 422);

    let (status, body) = send_chunk(&t.app, "upl_nope", "0", b"zzzz").await;
    assert_eq!(status, 404);
    assert_eq!(body["name"], "NotFound");

    let (status, body) = send(
        &t.app,
        multipart(&[Part::Text("uploadId", &id), Part::Text("chunkIndex", "0")]),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["data"]["kind"], "InvalidRequest");
}

#[tokio::test]
async fn premature_complete_is_a_conflict() {
    let t = test_app();
    let id = start(&t.app, 12).await;
    send_chunk(&t.app, &id, "0", b"aaaa").await;

    let (status, body) = send(&t.app, json_request("POST", "/api/upload/complete", json!({ "uploadId": id }))).await;
    assert_eq!(status, 409);
    assert_eq!(body["data"]["kind"], "SessionNotReady");
    assert_eq!(t.remote.write_count(), 0);
}

#[tokio::test]
async fn remote_failure_is_a_bad_gateway() {
    let t = test_app();
    let id = start(&t.app, 4).await;
    send_chunk(&t.app, &id, "0", b"aaaa").await;
    t.remote.set_failing(true);

    let (status, body) = send(&t.app, json_request("POST", "/api/upload/complete", json!({ "uploadId": id }))).await;
    assert_eq!(status, 502);
    assert_eq!(body["name"], "BadGateway");

    let (_, body) = send(
        &t.app,
        Request::builder()
            .uri(format!("/api/upload/{}", id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(body["status"], "failed");
    assert!(body["error"].as_str().is_some());
}

#[tokio::test]
async fn abandoned_upload_is_gone() {
    let t = test_app();
    let id = start(&t.app, 12).await;

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("/api/upload/{}", id))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&t.app, delete).await;
    assert_eq!(status, 200);

    let (status, _) = send_chunk(&t.app, &id, "0", b"aaaa").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn auto_finalize_delivers_after_last_chunk() {
    let t = test_app_with(UploadConfig::default().with_chunk_size(4).auto_finalize());
    let id = start(&t.app, 8).await;
    send_chunk(&t.app, &id, "0", b"aaaa").await;
    let (_, body) = send_chunk(&t.app, &id, "1", b"bbbb").await;
    assert_eq!(body["isComplete"], true);

    let mut completed = false;
    for _ in 0..50 {
        if t.remote.write_count() == 1 && !t.remote.objects().is_empty() {
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(completed);
}

#[tokio::test]
async fn direct_upload_writes_each_file() {
    let t = test_app();
    let mut req = multipart(&[
        Part::Text("studioName", "Bright Studio"),
        Part::File("files", "a.jpg", b"first"),
        Part::File("files", "b.jpg", b"second"),
    ]);
    *req.uri_mut() = "/api/upload".parse().unwrap();

    let (status, body) = send(&t.app, req).await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["objects"].as_array().unwrap().len(), 2);
    assert!(body["destination"].as_str().unwrap().starts_with("Bright Studio - "));
    assert_eq!(t.remote.objects().len(), 2);
}

#[tokio::test]
async fn request_id_is_generated_and_preserved() {
    let t = test_app();

    let res = t
        .app
        .router
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(res.headers().get("x-request-id").is_some());

    let provided = HeaderValue::from_static("req-test-123");
    let res = t
        .app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-request-id", provided.clone())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.headers().get("x-request-id").unwrap(), &provided);
}

#[tokio::test]
async fn rejected_start_creates_no_remote_folder() {
    let t = test_app_with(
        UploadConfig::default()
            .with_chunk_size(4)
            .with_max_file_bytes(100)
            .with_max_chunks(10),
    );

    let requests = [
        json!({ "fileName": "big.zip", "fileSize": 1000, "studioName": "Bright Studio" }),
        json!({ "fileName": "many.zip", "fileSize": 20, "totalChunks": 50, "studioName": "Bright Studio" }),
        json!({ "fileName": "", "fileSize": 20, "studioName": "Bright Studio" }),
    ];
    for request in requests {
        let (status, body) = send(&t.app, json_request("POST", "/api/upload/start", request)).await;
        assert_eq!(status, 400, "{}", body);
        assert_eq!(body["data"]["kind"], "InvalidRequest");
    }
    assert!(t.remote.folders().is_empty());
}

#[tokio::test]
async fn oversized_chunk_is_payload_too_large() {
    let t = test_app();
    let app = UploadApp::with_body_limit(t.app.state.clone(), 1024);
    let id = start(&app, 12).await;

    let (status, body) = send_chunk(&app, &id, "0", &vec![b'x'; 4096]).await;
    assert_eq!(status, 413);
    assert_eq!(body["name"], "PayloadTooLarge");
    assert_eq!(body["className"], "payload-too-large");
    assert_eq!(body["data"]["kind"], "PayloadTooLarge");
}
