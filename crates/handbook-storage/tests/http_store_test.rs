//! HTTP object store clients against a mock server.

use handbook_core::{Error, ObjectStore};
use handbook_storage::{
    GcsConfig, GcsStorage, GoogleTokenSource, SupabaseStorage, SupabaseStorageConfig,
};
use serde_json::json;
use wiremock::matchers::{body_bytes, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn supabase(server: &MockServer) -> SupabaseStorage {
    SupabaseStorage::new(SupabaseStorageConfig::new(server.uri(), "service-key"))
        .expect("Failed to create Supabase client")
}

fn gcs(server: &MockServer) -> GcsStorage {
    let config = GcsConfig::default()
        .with_base_url(server.uri())
        .with_token(GoogleTokenSource::Static("ya29.test".into()))
        .with_bucket("vision");
    GcsStorage::new(config).expect("Failed to create GCS client")
}

#[tokio::test]
async fn test_supabase_download_sends_service_role_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/storage/v1/object/documents/uploads/rules.pdf"))
        .and(header("apikey", "service-key"))
        .and(header("authorization", "Bearer service-key"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.7".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let data = supabase(&server)
        .download("documents", "uploads/rules.pdf")
        .await
        .unwrap();
    assert_eq!(data, b"%PDF-1.7");
}

#[tokio::test]
async fn test_supabase_missing_object_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/storage/v1/object/documents/missing.pdf"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "statusCode": "404",
            "error": "not_found",
            "message": "Object not found"
        })))
        .mount(&server)
        .await;

    let err = supabase(&server)
        .download("documents", "missing.pdf")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {:?}", err);
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_supabase_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/storage/v1/object/documents/a.pdf"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = supabase(&server).download("documents", "a.pdf").await.unwrap_err();
    assert!(err.is_transient(), "got {:?}", err);
    assert!(err.to_string().contains("maintenance"));
}

#[tokio::test]
async fn test_supabase_list_joins_folder_and_skips_placeholders() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/storage/v1/object/list/documents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"name": "b.pdf", "id": "2"},
            {"name": "a.pdf", "id": "1"},
            {"name": "nested", "id": null},
            {"name": "other.txt", "id": "3"}
        ])))
        .mount(&server)
        .await;

    let names = supabase(&server)
        .list("documents", "tenant/")
        .await
        .unwrap();
    assert_eq!(
        names,
        vec![
            "tenant/a.pdf".to_string(),
            "tenant/b.pdf".to_string(),
            "tenant/other.txt".to_string()
        ]
    );
}

#[tokio::test]
async fn test_gcs_upload_uses_media_upload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload/storage/v1/b/vision/o"))
        .and(query_param("uploadType", "media"))
        .and(query_param("name", "ocr-input/j1.pdf"))
        .and(header("authorization", "Bearer ya29.test"))
        .and(header("content-type", "application/pdf"))
        .and(body_bytes(b"%PDF-1.4".to_vec()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "ocr-input/j1.pdf"})))
        .expect(1)
        .mount(&server)
        .await;

    gcs(&server)
        .upload("vision", "ocr-input/j1.pdf", b"%PDF-1.4", "application/pdf")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_gcs_download_encodes_object_name() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/storage/v1/b/vision/o/ocr-output%2Fj1%2Foutput-1-to-1.json"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"responses\":[]}"))
        .expect(1)
        .mount(&server)
        .await;

    let data = gcs(&server)
        .download("vision", "ocr-output/j1/output-1-to-1.json")
        .await
        .unwrap();
    assert_eq!(data, b"{\"responses\":[]}");
}

#[tokio::test]
async fn test_gcs_list_follows_page_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/storage/v1/b/vision/o"))
        .and(query_param("pageToken", "p2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"name": "ocr-output/j1/output-3-to-3.json"}]
        })))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/storage/v1/b/vision/o"))
        .and(query_param("prefix", "ocr-output/j1/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"name": "ocr-output/j1/output-1-to-2.json"}],
            "nextPageToken": "p2"
        })))
        .with_priority(2)
        .mount(&server)
        .await;

    let names = gcs(&server).list("vision", "ocr-output/j1/").await.unwrap();
    assert_eq!(
        names,
        vec![
            "ocr-output/j1/output-1-to-2.json".to_string(),
            "ocr-output/j1/output-3-to-3.json".to_string()
        ]
    );
}

#[tokio::test]
async fn test_gcs_delete_missing_is_ok() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/storage/v1/b/vision/o/ocr-input%2Fj1.pdf"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    gcs(&server).delete("vision", "ocr-input/j1.pdf").await.unwrap();
}

#[tokio::test]
async fn test_gcs_throttling_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/storage/v1/b/vision/o"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let err = gcs(&server).list("vision", "ocr-output/").await.unwrap_err();
    assert!(matches!(err, Error::RateLimited(_)), "got {:?}", err);
    assert!(err.is_transient());
}
