//! Google Vision client against a mock server and an in-memory output store.

use std::sync::Arc;

use handbook_core::{Error, ObjectStore, OcrOperation, OcrProvider, OcrRequest, OperationState};
use handbook_inference::vision::{GoogleVisionClient, VisionConfig};
use handbook_storage::{GoogleTokenSource, MemoryObjectStore};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, store: MemoryObjectStore) -> GoogleVisionClient {
    let config = VisionConfig::default()
        .with_base_url(server.uri())
        .with_token(GoogleTokenSource::Static("ya29.test".into()));
    GoogleVisionClient::new(config, Arc::new(store)).expect("Failed to create Vision client")
}

fn request() -> OcrRequest {
    OcrRequest {
        input_uri: "gs://vision/ocr-input/j1.pdf".into(),
        output_uri: "gs://vision/ocr-output/j1/".into(),
        mime_type: "application/pdf".into(),
    }
}

#[tokio::test]
async fn test_submit_sends_document_text_detection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/files:asyncBatchAnnotate"))
        .and(header("authorization", "Bearer ya29.test"))
        .and(body_partial_json(json!({
            "requests": [{
                "inputConfig": {
                    "gcsSource": {"uri": "gs://vision/ocr-input/j1.pdf"},
                    "mimeType": "application/pdf"
                },
                "features": [{"type": "DOCUMENT_TEXT_DETECTION"}],
                "outputConfig": {"gcsDestination": {"uri": "gs://vision/ocr-output/j1/"}}
            }]
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"name": "projects/p/operations/42"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let op = client(&server, MemoryObjectStore::new())
        .submit(&request())
        .await
        .unwrap();
    assert_eq!(op.name, "projects/p/operations/42");
    assert_eq!(op.output_uri, "gs://vision/ocr-output/j1/");
}

#[tokio::test]
async fn test_poll_maps_operation_states() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/operations/running"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "operations/running",
            "metadata": {"state": "RUNNING"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/operations/done"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "operations/done",
            "done": true,
            "response": {}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/operations/failed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "operations/failed",
            "done": true,
            "error": {"code": 3, "message": "Invalid PDF"}
        })))
        .mount(&server)
        .await;

    let vision = client(&server, MemoryObjectStore::new());
    let op = |name: &str| OcrOperation {
        name: name.into(),
        output_uri: "gs://vision/ocr-output/j1/".into(),
    };

    assert_eq!(
        vision.poll(&op("operations/running")).await.unwrap(),
        OperationState::Running
    );
    assert_eq!(
        vision.poll(&op("operations/done")).await.unwrap(),
        OperationState::Done
    );
    match vision.poll(&op("operations/failed")).await.unwrap() {
        OperationState::Failed(msg) => assert!(msg.contains("Invalid PDF")),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_submit_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/files:asyncBatchAnnotate"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = client(&server, MemoryObjectStore::new())
        .submit(&request())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Upstream(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_fetch_output_reads_shards_in_page_order() {
    let server = MockServer::start().await;
    let store = MemoryObjectStore::new();
    store.insert(
        "vision",
        "ocr-output/j1/output-3-to-3.json",
        json!({"responses": [{"fullTextAnnotation": {"text": "Sida 3"}}]}).to_string(),
    );
    store.insert(
        "vision",
        "ocr-output/j1/output-1-to-2.json",
        json!({"responses": [
            {"fullTextAnnotation": {"text": "Sida 1"}},
            {"fullTextAnnotation": {"text": "Sida 2"}}
        ]})
        .to_string(),
    );
    store.insert("vision", "ocr-output/other/output-1-to-1.json", "{}");

    let vision = client(&server, store.clone());
    let text = vision
        .fetch_output(&OcrOperation {
            name: "operations/1".into(),
            output_uri: "gs://vision/ocr-output/j1/".into(),
        })
        .await
        .unwrap();
    assert_eq!(text, "Sida 1\nSida 2\nSida 3");
    assert!(store.list("vision", "ocr-output/j1/").await.unwrap().len() == 2);
}
