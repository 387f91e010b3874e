//! HTTP implementation of [`AnnotationSource`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use stitcher_shared::{
    Annotation, AnnotationError, AnnotationSet, AppConfig, Credential, Result, StitchError,
};

use crate::{AnnotationSource, USER_AGENT, endpoint, parse_base_url};

/// `GET {base}/annotation-sets/{id}` response body.
#[derive(Debug, Deserialize)]
struct AnnotationSetBody {
    #[serde(default)]
    annotations: Vec<AnnotationRecord>,
}

/// One descriptor as the annotation service lists it.
#[derive(Debug, Deserialize)]
struct AnnotationRecord {
    page: u32,
    #[serde(flatten)]
    annotation: Annotation,
}

/// Annotation source backed by the annotation service's REST API.
#[derive(Debug, Clone)]
pub struct HttpAnnotationSource {
    client: Client,
    base_url: Url,
}

impl HttpAnnotationSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| StitchError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: parse_base_url(base_url)?,
        })
    }

    /// Build from the `[annotations]` and `[pipeline]` config sections.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(
            &config.annotations.base_url,
            config.pipeline.request_timeout(),
        )
    }
}

#[async_trait]
impl AnnotationSource for HttpAnnotationSource {
    #[instrument(skip_all, fields(document_id = %document_id))]
    async fn annotations(
        &self,
        document_id: &str,
        credential: &Credential,
    ) -> std::result::Result<AnnotationSet, AnnotationError> {
        let url = endpoint(&self.base_url, &["annotation-sets", document_id]);

        let response = self
            .client
            .get(url)
            .bearer_auth(credential.expose())
            .send()
            .await
            .map_err(|e| AnnotationError::Source(format!("{document_id}: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("no annotation set for document");
            return Ok(AnnotationSet::new());
        }
        if !status.is_success() {
            return Err(AnnotationError::Source(format!(
                "{document_id}: HTTP {status}"
            )));
        }

        let body: AnnotationSetBody = response
            .json()
            .await
            .map_err(|e| AnnotationError::Source(format!("{document_id}: malformed body: {e}")))?;

        let mut set = AnnotationSet::new();
        for record in body.annotations {
            set.push(record.page, record.annotation);
        }
        debug!(count = set.len(), "annotation set fetched");
        Ok(set)
    }
}
