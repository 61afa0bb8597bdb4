use std::convert::Infallible;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use quarry_core::config::QueryConfig;
use quarry_core::document::{DocumentStatusReport, UploadFile};
use quarry_core::errors::TransportError;
use quarry_core::ids::DocumentId;
use quarry_core::messages::Message;

use crate::backend::{BoxFrameStream, DocumentBackend, KnowledgeBackend, QueryBody, UploadProgress};
use crate::decoder::{FrameStream, STREAM_IDLE_TIMEOUT};

const DOCUMENT_ID_PARAM: &str = "documentId";
const UPLOAD_FIELD: &str = "file";
const UPLOAD_CHUNK: usize = 64 * 1024;
const DEFAULT_MIME: &str = "application/octet-stream";

/// Where the backend lives and how long to wait for it.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub base_url: String,
    pub stream_path: String,
    pub query_path: String,
    pub upload_path: String,
    pub status_path: String,
    pub delete_path: String,
    pub connect_timeout: Duration,
    /// Whole-request limit for everything except the streaming body.
    pub request_timeout: Duration,
    /// Longest gap allowed between two chunks of a streaming body.
    pub idle_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            stream_path: "/api/chat/stream".into(),
            query_path: "/api/chat".into(),
            upload_path: "/api/documents/upload".into(),
            status_path: "/api/documents/status".into(),
            delete_path: "/api/documents/delete".into(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
            idle_timeout: STREAM_IDLE_TIMEOUT,
        }
    }
}

impl BackendConfig {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    document_id: DocumentId,
}

/// reqwest implementation of both backend contracts.
///
/// Query calls carry the credential in the JSON body; document calls send
/// it as a bearer header.
pub struct HttpBackend {
    client: Client,
    config: BackendConfig,
    token: SecretString,
}

impl HttpBackend {
    pub fn new(config: BackendConfig, token: SecretString) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| TransportError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            token,
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(
                "Authorization",
                format!("Bearer {}", self.token.expose_secret()),
            )
            .timeout(self.config.request_timeout)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, TransportError> {
        let resp = request
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status, body));
        }
        Ok(resp)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        resp: Response,
    ) -> Result<T, TransportError> {
        let body = resp.bytes().await.map_err(|e| self.request_error(e))?;
        serde_json::from_slice(&body).map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }

    fn request_error(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(self.config.request_timeout)
        } else {
            TransportError::Network(error.to_string())
        }
    }
}

#[async_trait]
impl KnowledgeBackend for HttpBackend {
    #[instrument(skip_all, fields(messages = messages.len(), model = %config.model))]
    async fn stream_query(
        &self,
        messages: &[Message],
        config: &QueryConfig,
    ) -> Result<BoxFrameStream, TransportError> {
        let body = QueryBody::new(messages, config, true);
        let request = self
            .client
            .post(self.config.url(&self.config.stream_path))
            .header("accept", "text/event-stream")
            .json(&body);
        let resp = self.send(request).await?;
        debug!(status = resp.status().as_u16(), "stream opened");

        Ok(Box::pin(FrameStream::with_idle_timeout(
            resp.bytes_stream(),
            self.config.idle_timeout,
        )))
    }

    #[instrument(skip_all, fields(messages = messages.len(), model = %config.model))]
    async fn query(
        &self,
        messages: &[Message],
        config: &QueryConfig,
    ) -> Result<Value, TransportError> {
        let body = QueryBody::new(messages, config, false);
        let request = self
            .client
            .post(self.config.url(&self.config.query_path))
            .header("accept", "application/json")
            .timeout(self.config.request_timeout)
            .json(&body);
        let resp = self.send(request).await?;
        self.read_json(resp).await
    }
}

#[async_trait]
impl DocumentBackend for HttpBackend {
    #[instrument(skip_all, fields(file = %file.name, size = file.size()))]
    async fn upload(
        &self,
        file: &UploadFile,
        progress: UploadProgress,
    ) -> Result<DocumentId, TransportError> {
        let total = file.size();
        let data = file.bytes.clone();
        let sent = progress.clone();
        sent.percent(0);

        let chunks = (0..data.len()).step_by(UPLOAD_CHUNK).map(move |start| {
            let end = (start + UPLOAD_CHUNK).min(data.len());
            sent.bytes(start as u64, total);
            Ok::<Bytes, Infallible>(data.slice(start..end))
        });
        let body = reqwest::Body::wrap_stream(futures::stream::iter(chunks));

        let part = Part::stream_with_length(body, total)
            .file_name(file.name.clone())
            .mime_str(file.mime_type.as_deref().unwrap_or(DEFAULT_MIME))
            .map_err(|e| TransportError::InvalidResponse(format!("invalid mime type: {e}")))?;
        let form = Form::new().part(UPLOAD_FIELD, part);

        let request = self
            .authorized(self.client.post(self.config.url(&self.config.upload_path)))
            .multipart(form);
        let resp = self.send(request).await?;
        let accepted: UploadResponse = self.read_json(resp).await?;

        progress.percent(100);
        info!(document_id = %accepted.document_id, "upload accepted");
        Ok(accepted.document_id)
    }

    #[instrument(skip(self), fields(document_id = %id))]
    async fn status(&self, id: &DocumentId) -> Result<DocumentStatusReport, TransportError> {
        let request = self
            .authorized(self.client.get(self.config.url(&self.config.status_path)))
            .query(&[(DOCUMENT_ID_PARAM, id.as_str())]);
        let resp = self.send(request).await?;
        self.read_json(resp).await
    }

    #[instrument(skip(self), fields(document_id = %id))]
    async fn delete(&self, id: &DocumentId) -> Result<(), TransportError> {
        let request = self
            .authorized(self.client.delete(self.config.url(&self.config.delete_path)))
            .query(&[(DOCUMENT_ID_PARAM, id.as_str())]);
        self.send(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slash() {
        let config = BackendConfig {
            base_url: "https://kb.example.com/".into(),
            ..BackendConfig::default()
        };
        assert_eq!(
            config.url(&config.status_path),
            "https://kb.example.com/api/documents/status"
        );
    }

    #[test]
    fn upload_response_uses_camel_case() {
        let parsed: UploadResponse =
            serde_json::from_str(r#"{"documentId":"doc-9","extra":true}"#).unwrap();
        assert_eq!(parsed.document_id.as_str(), "doc-9");
    }

    #[test]
    fn backend_builds_with_defaults() {
        let backend =
            HttpBackend::new(BackendConfig::default(), SecretString::from("tok")).unwrap();
        assert_eq!(backend.config().query_path, "/api/chat");
    }
}
