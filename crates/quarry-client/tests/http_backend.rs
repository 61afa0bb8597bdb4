use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use quarry_client::{BackendConfig, DocumentBackend, HttpBackend, KnowledgeBackend, UploadProgress};
use quarry_core::config::QueryConfig;
use quarry_core::document::{DocumentStatus, UploadFile};
use quarry_core::errors::TransportError;
use quarry_core::ids::DocumentId;
use quarry_core::messages::Message;

fn backend(server: &MockServer) -> HttpBackend {
    let config = BackendConfig {
        base_url: server.uri(),
        ..BackendConfig::default()
    };
    HttpBackend::new(config, SecretString::from("doc-token")).unwrap()
}

fn query_config() -> QueryConfig {
    let mut config = QueryConfig::new("query-token", vec!["kb-main".into()]);
    config.model = "gpt-4o".into();
    config
}

#[tokio::test]
async fn streaming_query_decodes_frames() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"tag\":\"searching\",\"content\":null}\n\n",
        "data: {\"tag\":\"seeds\",\"content\":[{\"content\":\"passage\",\"nip\":0.3}]}\n\n",
        "data: {\"tag\":\"final\",\"content\":\"Hel\"}\n\n",
        "data: {\"tag\":\"final\",\"content\":\"lo\"}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/chat/stream"))
        .and(body_partial_json(json!({
            "token": "query-token",
            "model": "gpt-4o",
            "kbList": ["kb-main"],
            "messages": [{"role": "user", "content": "hi"}],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let frames: Vec<_> = backend(&server)
        .stream_query(&[Message::user("hi")], &query_config())
        .await
        .unwrap()
        .collect()
        .await;

    let tags: Vec<_> = frames
        .iter()
        .map(|f| f.as_ref().unwrap()["tag"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(tags, vec!["searching", "seeds", "final", "final"]);
}

#[tokio::test]
async fn streaming_query_surfaces_http_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat/stream"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let result = backend(&server)
        .stream_query(&[Message::user("hi")], &query_config())
        .await;

    match result {
        Err(TransportError::Status { status, body }) => {
            assert_eq!(status, 503);
            assert_eq!(body, "overloaded");
        }
        Err(other) => panic!("expected status error, got {other:?}"),
        Ok(_) => panic!("expected status error, got a stream"),
    }
}

#[tokio::test]
async fn single_response_query_sends_stream_false() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"tag": "final", "content": "X"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let body = backend(&server)
        .query(&[Message::user("hi")], &query_config())
        .await
        .unwrap();
    assert_eq!(body, json!({"tag": "final", "content": "X"}));
}

#[tokio::test]
async fn upload_posts_multipart_with_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/documents/upload"))
        .and(header("authorization", "Bearer doc-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"documentId": "doc-42"})))
        .expect(1)
        .mount(&server)
        .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let progress = UploadProgress::new(move |p| sink.lock().push(p));
    let file = UploadFile::new("notes.txt", vec![b'x'; 200 * 1024]).with_mime_type("text/plain");

    let id = backend(&server).upload(&file, progress).await.unwrap();
    assert_eq!(id.as_str(), "doc-42");

    let seen = seen.lock().clone();
    assert_eq!(seen.first(), Some(&0));
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "not monotonic: {seen:?}");

    let requests = server.received_requests().await.unwrap();
    let body = String::from_utf8_lossy(&requests[0].body);
    assert!(body.contains("name=\"file\""));
    assert!(body.contains("filename=\"notes.txt\""));
}

#[tokio::test]
async fn upload_rejection_is_a_status_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/documents/upload"))
        .respond_with(ResponseTemplate::new(413).set_body_string("too large"))
        .mount(&server)
        .await;

    let file = UploadFile::new("big.bin", vec![0u8; 16]);
    let err = backend(&server)
        .upload(&file, UploadProgress::noop())
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(413));
}

#[tokio::test]
async fn status_passes_document_id_as_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/documents/status"))
        .and(query_param("documentId", "doc-7"))
        .and(header("authorization", "Bearer doc-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "notes.txt",
            "size": 2048,
            "status": "error",
            "error": "unsupported encoding",
        })))
        .mount(&server)
        .await;

    let report = backend(&server)
        .status(&DocumentId::from_raw("doc-7"))
        .await
        .unwrap();
    assert_eq!(report.status, DocumentStatus::Error);
    assert_eq!(report.error.as_deref(), Some("unsupported encoding"));
    assert_eq!(report.size, 2048);
}

#[tokio::test]
async fn status_with_garbage_body_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/documents/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = backend(&server)
        .status(&DocumentId::from_raw("doc-7"))
        .await
        .unwrap_err();
    assert_eq!(err.error_kind(), "invalid_response");
}

#[tokio::test]
async fn delete_sends_no_body() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/documents/delete"))
        .and(query_param("documentId", "doc-7"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    backend(&server)
        .delete(&DocumentId::from_raw("doc-7"))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].body.is_empty());
}
