//! Supabase Storage backend adapter.
//!
//! Talks to the storage REST surface (`/storage/v1/object/...`) with plain
//! reqwest calls. Every request carries both `Authorization: Bearer` and
//! `apikey` headers with the same key.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response};
use serde::Deserialize;
use tracing::{debug, warn};

use clientstore_common::backend::{
    checked_key, checked_path, ListOptions, ListResponse, ListingEntry, UploadSource,
};
use clientstore_common::keys::{guess_content_type, normalize_key, normalize_path};
use clientstore_common::{StorageBackend, StorageError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const CACHE_CONTROL: &str = "3600";

#[derive(Clone)]
pub struct SupabaseConfig {
    pub base_url: String,
    pub api_key: String,
    pub bucket: String,
}

pub struct SupabaseStorage {
    config: SupabaseConfig,
    client: Client,
}

/// Successful upload body: `{"Key": "<bucket>/<key>", "Id": "..."}`.
#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(rename = "Key")]
    key: Option<String>,
}

impl SupabaseStorage {
    pub fn new(config: SupabaseConfig) -> Result<Self, StorageError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(mut config: SupabaseConfig, client: Client) -> Self {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        Self { config, client }
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.config.base_url,
            urlencoding::encode(&self.config.bucket),
            encode_key(key)
        )
    }

    fn bucket_url(&self) -> String {
        format!(
            "{}/storage/v1/object/{}",
            self.config.base_url,
            urlencoding::encode(&self.config.bucket)
        )
    }

    fn list_url(&self) -> String {
        format!(
            "{}/storage/v1/object/list/{}",
            self.config.base_url,
            urlencoding::encode(&self.config.bucket)
        )
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("apikey", &self.config.api_key)
    }

    /// Strip the `<bucket>/` prefix the store puts on returned keys.
    fn strip_bucket<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.config.bucket)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(key)
    }
}

/// Percent-encode each key segment while keeping the `/` separators.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

async fn error_from(resp: Response) -> StorageError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    StorageError::from_response(status, &body)
}

#[async_trait]
impl StorageBackend for SupabaseStorage {
    fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn upload(
        &self,
        key: &str,
        source: UploadSource,
        content_type: Option<&str>,
        upsert: bool,
    ) -> Result<String, StorageError> {
        let key = checked_key(key)?;
        let data = source.into_bytes().await?;
        let content_type = guess_content_type(&key, content_type);
        let len = data.len();

        // The API mishandles native booleans here; it wants the text form.
        let upsert = if upsert { "true" } else { "false" };

        let resp = self
            .authed(self.client.post(self.object_url(&key)))
            .header("Content-Type", &content_type)
            .header("cache-control", CACHE_CONTROL)
            .header("x-upsert", upsert)
            .body(data)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }

        let body = resp.text().await?;
        let stored = match serde_json::from_str::<UploadResponse>(&body) {
            Ok(UploadResponse { key: Some(k) }) => normalize_key(self.strip_bucket(&k)),
            _ => {
                warn!(key = %key, body = %body, "Upload succeeded without a parseable key; assuming requested key");
                key.clone()
            }
        };

        debug!(key = %stored, bytes = len, content_type = %content_type, "Upload complete");
        Ok(stored)
    }

    async fn download(&self, key: &str) -> Result<Bytes, StorageError> {
        let key = checked_path(key)?;
        let resp = self
            .authed(self.client.get(self.object_url(&key)))
            .send()
            .await?;

        if resp.status().as_u16() == 404 {
            return Err(StorageError::NotFound(key));
        }
        if !resp.status().is_success() {
            let err = error_from(resp).await;
            return match err {
                StorageError::Api { status: 404, .. } => Err(StorageError::NotFound(key)),
                other => Err(other),
            };
        }

        Ok(resp.bytes().await?)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let key = checked_path(key)?;
        let resp = self
            .authed(self.client.delete(self.bucket_url()))
            .json(&serde_json::json!({ "prefixes": [key] }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let err = error_from(resp).await;
            warn!(key = %key, error = %err, "Delete rejected by storage");
            return Ok(false);
        }

        debug!(key = %key, "Delete complete");
        Ok(true)
    }

    async fn list(
        &self,
        prefix: &str,
        options: ListOptions,
    ) -> Result<Vec<ListingEntry>, StorageError> {
        let prefix = normalize_path(prefix);
        let body = serde_json::json!({
            "prefix": prefix,
            "limit": options.limit,
            "offset": options.offset,
            "sortBy": { "column": "name", "order": "asc" },
        });

        let resp = self
            .authed(self.client.post(self.list_url()))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let text = resp.text().await?;
        if !(200..300).contains(&status) && serde_json::from_str::<serde_json::Value>(&text).is_err() {
            return Err(StorageError::from_response(status, &text));
        }
        ListResponse::decode(status, &text, &prefix)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::body::Bytes as AxumBytes;
    use axum::extract::{Path as AxumPath, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{delete, post};
    use axum::{Json, Router};

    use super::*;
    use clientstore_common::ErrorKind;

    #[derive(Default)]
    struct Seen {
        upsert: Option<String>,
        content_type: Option<String>,
        apikey: Option<String>,
        list_body: Option<serde_json::Value>,
        deleted: Vec<serde_json::Value>,
    }

    type Shared = Arc<Mutex<Seen>>;

    async fn upload_handler(
        State(seen): State<Shared>,
        AxumPath((bucket, key)): AxumPath<(String, String)>,
        headers: HeaderMap,
        _body: AxumBytes,
    ) -> axum::response::Response {
        {
            let mut s = seen.lock().unwrap();
            s.upsert = headers.get("x-upsert").and_then(|v| v.to_str().ok()).map(String::from);
            s.content_type = headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            s.apikey = headers.get("apikey").and_then(|v| v.to_str().ok()).map(String::from);
        }
        if key.ends_with("dup.pdf") {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "statusCode": "409",
                    "error": "Duplicate",
                    "message": "The resource already exists"
                })),
            )
                .into_response();
        }
        if key.ends_with("odd.pdf") {
            return (StatusCode::OK, "ok").into_response();
        }
        Json(serde_json::json!({ "Key": format!("{}/{}", bucket, key), "Id": "1" })).into_response()
    }

    async fn list_handler(
        State(seen): State<Shared>,
        Json(body): Json<serde_json::Value>,
    ) -> axum::response::Response {
        seen.lock().unwrap().list_body = Some(body);
        Json(serde_json::json!([
            { "name": "Contratos", "id": null, "metadata": null },
            { "name": "nota.pdf", "id": "x", "metadata": { "size": 3 } }
        ]))
        .into_response()
    }

    async fn delete_handler(
        State(seen): State<Shared>,
        Json(body): Json<serde_json::Value>,
    ) -> axum::response::Response {
        let denied = body["prefixes"][0].as_str() == Some("org/locked.pdf");
        seen.lock().unwrap().deleted.push(body);
        if denied {
            return (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({ "statusCode": "403", "error": "Unauthorized", "message": "denied" })),
            )
                .into_response();
        }
        Json(serde_json::json!([])).into_response()
    }

    async fn start_server() -> (String, Shared) {
        let seen: Shared = Arc::new(Mutex::new(Seen::default()));
        let app = Router::new()
            .route("/storage/v1/object/list/{bucket}", post(list_handler))
            .route("/storage/v1/object/{bucket}", delete(delete_handler))
            .route("/storage/v1/object/{bucket}/{*key}", post(upload_handler))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), seen)
    }

    fn adapter(base_url: String) -> SupabaseStorage {
        SupabaseStorage::new(SupabaseConfig {
            base_url,
            api_key: "test-key".into(),
            bucket: "clientes".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_upload_sends_textual_upsert_and_strips_bucket() {
        let (url, seen) = start_server().await;
        let storage = adapter(url);

        let key = storage
            .upload("org/cli/Relatório.pdf", Bytes::from_static(b"pdf").into(), None, true)
            .await
            .unwrap();
        assert_eq!(key, "org/cli/Relatorio.pdf");

        let s = seen.lock().unwrap();
        assert_eq!(s.upsert.as_deref(), Some("true"));
        assert_eq!(s.content_type.as_deref(), Some("application/pdf"));
        assert_eq!(s.apikey.as_deref(), Some("test-key"));
    }

    #[tokio::test]
    async fn test_upload_duplicate_is_classified() {
        let (url, seen) = start_server().await;
        let storage = adapter(url);

        let err = storage
            .upload("org/dup.pdf", Bytes::from_static(b"x").into(), None, false)
            .await
            .unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(err.kind(), ErrorKind::Duplicate);
        assert_eq!(seen.lock().unwrap().upsert.as_deref(), Some("false"));
    }

    #[tokio::test]
    async fn test_upload_unparseable_success_keeps_requested_key() {
        let (url, _) = start_server().await;
        let storage = adapter(url);

        let key = storage
            .upload("org/odd.pdf", Bytes::from_static(b"x").into(), None, true)
            .await
            .unwrap();
        assert_eq!(key, "org/odd.pdf");
    }

    #[tokio::test]
    async fn test_list_request_and_folder_heuristic() {
        let (url, seen) = start_server().await;
        let storage = adapter(url);

        let entries = storage.list("/org/cli/", ListOptions::default()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_folder());
        assert_eq!(entries[1].full_path, "org/cli/nota.pdf");

        let body = seen.lock().unwrap().list_body.clone().unwrap();
        assert_eq!(body["prefix"], "org/cli");
        assert_eq!(body["limit"], 1000);
        assert_eq!(body["sortBy"]["column"], "name");
        assert_eq!(body["sortBy"]["order"], "asc");
    }

    #[tokio::test]
    async fn test_delete_reports_backend_errors_as_false() {
        let (url, seen) = start_server().await;
        let storage = adapter(url);

        assert!(storage.delete("org/a.pdf").await.unwrap());
        assert!(!storage.delete("org/locked.pdf").await.unwrap());
        assert_eq!(seen.lock().unwrap().deleted.len(), 2);
    }

    #[tokio::test]
    async fn test_accented_folders_are_addressed_as_stored() {
        let (url, seen) = start_server().await;
        let storage = adapter(url);

        let entries = storage
            .list("org/cli/Relatórios", ListOptions::default())
            .await
            .unwrap();
        assert_eq!(entries[1].full_path, "org/cli/Relatórios/nota.pdf");
        assert_eq!(
            seen.lock().unwrap().list_body.as_ref().unwrap()["prefix"],
            "org/cli/Relatórios"
        );

        assert!(storage.delete("org/cli/Relatórios/Ação.pdf").await.unwrap());
        assert_eq!(
            seen.lock().unwrap().deleted[0]["prefixes"][0],
            "org/cli/Relatórios/Ação.pdf"
        );
    }

    #[tokio::test]
    async fn test_upload_transport_error_with_409_in_key_is_not_duplicate() {
        let storage = adapter("http://127.0.0.1:9".into());
        let err = storage
            .upload("org/NF-1409.pdf", Bytes::from_static(b"x").into(), None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Http(_)));
        assert!(!err.is_duplicate());
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_transport_error_surfaces() {
        // Nothing listens on port 9 locally.
        let storage = adapter("http://127.0.0.1:9".into());
        let err = storage.download("org/a.pdf").await.unwrap_err();
        assert!(matches!(err, StorageError::Http(_)));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_encode_key_keeps_separators() {
        assert_eq!(encode_key("org/ÁÉ Pasta/a b.pdf"), "org/%C3%81%C3%89%20Pasta/a%20b.pdf");
    }
}
