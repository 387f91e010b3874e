//! HTTP implementation of [`DocumentStore`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::Url;

use stitcher_shared::{AppConfig, Credential, FetchError, PublishError, Result, StitchError};

use crate::{DocumentStore, PublishRequest, USER_AGENT, endpoint, parse_base_url};

/// Body returned by the store after a successful upload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    document_uri: Option<String>,
}

/// Document store client speaking the store's REST API.
///
/// * `GET  {base}/documents/{id}/binary` downloads a document.
/// * `POST {base}/documents` uploads a new one.
#[derive(Debug, Clone)]
pub struct HttpDocumentStore {
    client: Client,
    base_url: Url,
    max_document_bytes: u64,
}

impl HttpDocumentStore {
    /// Create a client for `base_url` with a per-request `timeout`.
    pub fn new(base_url: &str, max_document_bytes: u64, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .map_err(|e| StitchError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: parse_base_url(base_url)?,
            max_document_bytes,
        })
    }

    /// Build from the `[store]` and `[pipeline]` config sections.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(
            &config.store.base_url,
            config.store.max_document_bytes,
            config.pipeline.request_timeout(),
        )
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    #[instrument(skip_all, fields(document_id = %document_id))]
    async fn fetch(
        &self,
        document_id: &str,
        credential: &Credential,
    ) -> std::result::Result<Vec<u8>, FetchError> {
        let url = endpoint(&self.base_url, &["documents", document_id, "binary"]);
        debug!(%url, "fetching document");

        let mut response = self
            .client
            .get(url)
            .bearer_auth(credential.expose())
            .send()
            .await
            .map_err(|e| fetch_transport_error(document_id, e))?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => {
                return Err(FetchError::NotFound {
                    document_id: document_id.to_string(),
                });
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(FetchError::Unauthorized {
                    document_id: document_id.to_string(),
                });
            }
            s if !s.is_success() => {
                return Err(FetchError::Transport(format!("HTTP {status}")));
            }
            _ => {}
        }

        let too_large = || FetchError::TooLarge {
            document_id: document_id.to_string(),
            limit: self.max_document_bytes,
        };

        // Check content-length if available
        if let Some(len) = response.content_length() {
            if len > self.max_document_bytes {
                return Err(too_large());
            }
        }

        let mut body = Vec::with_capacity(
            response
                .content_length()
                .map_or(0, |len| len as usize),
        );
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| fetch_transport_error(document_id, e))?
        {
            if (body.len() + chunk.len()) as u64 > self.max_document_bytes {
                warn!(limit = self.max_document_bytes, "aborting oversized download");
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        debug!(bytes = body.len(), "document fetched");
        Ok(body)
    }

    #[instrument(skip_all, fields(filename = %request.filename, bytes = bytes.len()))]
    async fn publish(
        &self,
        bytes: Vec<u8>,
        request: &PublishRequest,
    ) -> std::result::Result<String, PublishError> {
        let url = endpoint(&self.base_url, &["documents"]);
        let filename = &request.filename;

        let response = self
            .client
            .post(url)
            .bearer_auth(request.credential.expose())
            .header(header::CONTENT_TYPE, "application/pdf")
            .header("X-Filename", filename.as_str())
            .body(bytes)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PublishError::Timeout {
                        filename: filename.clone(),
                    }
                } else {
                    PublishError::Transport(format!("publish {filename}: {e}"))
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(PublishError::Unauthorized {
                filename: filename.clone(),
            });
        }
        if !status.is_success() {
            return Err(PublishError::Transport(format!("HTTP {status}")));
        }

        let body: PublishResponse = response.json().await.map_err(|e| {
            PublishError::Transport(format!("publish {filename}: unreadable response: {e}"))
        })?;

        match body.document_uri {
            Some(uri) if !uri.trim().is_empty() => {
                debug!(%uri, "artifact published");
                Ok(uri)
            }
            _ => Err(PublishError::MissingReference {
                filename: filename.clone(),
            }),
        }
    }
}

fn fetch_transport_error(document_id: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            document_id: document_id.to_string(),
        }
    } else {
        FetchError::Transport(format!("fetch {document_id}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> HttpDocumentStore {
        HttpDocumentStore::new(&server.uri(), 1024, Duration::from_secs(5)).unwrap()
    }

    fn publish_request(filename: &str) -> PublishRequest {
        PublishRequest {
            filename: filename.into(),
            credential: Credential::new("tok"),
        }
    }

    #[tokio::test]
    async fn fetch_returns_body_with_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents/doc-1/binary"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.5 body".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let bytes = store(&server)
            .fetch("doc-1", &Credential::new("tok"))
            .await
            .unwrap();
        assert_eq!(bytes, b"%PDF-1.5 body");
    }

    #[tokio::test]
    async fn fetch_maps_status_codes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents/missing/binary"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/documents/secret/binary"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/documents/broken/binary"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let store = store(&server);
        let cred = Credential::new("tok");

        assert_eq!(
            store.fetch("missing", &cred).await.unwrap_err(),
            FetchError::NotFound {
                document_id: "missing".into()
            }
        );
        assert!(matches!(
            store.fetch("secret", &cred).await.unwrap_err(),
            FetchError::Unauthorized { .. }
        ));
        let err = store.fetch("broken", &cred).await.unwrap_err();
        assert_eq!(err.to_string(), "HTTP 502 Bad Gateway");
    }

    #[tokio::test]
    async fn fetch_rejects_oversized_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents/huge/binary"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 4096]))
            .mount(&server)
            .await;

        let err = store(&server)
            .fetch("huge", &Credential::new("tok"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FetchError::TooLarge {
                document_id: "huge".into(),
                limit: 1024
            }
        );
    }

    #[tokio::test]
    async fn fetch_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents/slow/binary"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let store =
            HttpDocumentStore::new(&server.uri(), 1024, Duration::from_millis(200)).unwrap();
        let err = store
            .fetch("slow", &Credential::new("tok"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }));
    }

    #[tokio::test]
    async fn publish_returns_document_uri() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/documents"))
            .and(header("content-type", "application/pdf"))
            .and(header("x-filename", "bundle.pdf"))
            .and(header("authorization", "Bearer tok"))
            .and(body_bytes(b"%PDF merged".to_vec()))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({ "documentUri": "store://docs/42" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let uri = store(&server)
            .publish(b"%PDF merged".to_vec(), &publish_request("bundle.pdf"))
            .await
            .unwrap();
        assert_eq!(uri, "store://docs/42");
    }

    #[tokio::test]
    async fn publish_without_reference_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/documents"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "documentUri": "" })),
            )
            .mount(&server)
            .await;

        let err = store(&server)
            .publish(b"%PDF".to_vec(), &publish_request("bundle.pdf"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PublishError::MissingReference {
                filename: "bundle.pdf".into()
            }
        );
    }

    #[tokio::test]
    async fn publish_maps_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/documents"))
            .and(header("x-filename", "denied.pdf"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/documents"))
            .and(header("x-filename", "broken.pdf"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = store(&server);
        assert!(matches!(
            store
                .publish(b"%PDF".to_vec(), &publish_request("denied.pdf"))
                .await
                .unwrap_err(),
            PublishError::Unauthorized { .. }
        ));
        assert_eq!(
            store
                .publish(b"%PDF".to_vec(), &publish_request("broken.pdf"))
                .await
                .unwrap_err()
                .to_string(),
            "HTTP 500 Internal Server Error"
        );
    }
}
