//! Remote document store and annotation source adapters.
//!
//! The pipeline only sees the [`DocumentStore`] and [`AnnotationSource`]
//! capabilities; the HTTP implementations here speak the store's REST API.

mod annotations;
mod http;

use async_trait::async_trait;
use stitcher_shared::{AnnotationError, AnnotationSet, Credential, FetchError, PublishError};

pub use annotations::HttpAnnotationSource;
pub use http::HttpDocumentStore;

/// User-Agent string for store requests.
pub(crate) const USER_AGENT: &str = concat!("Stitcher/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Metadata accompanying a merged artifact upload.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    /// Filename the store records for the artifact.
    pub filename: String,
    pub credential: Credential,
}

/// Byte-level access to the remote document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Download the full binary content of `document_id`.
    async fn fetch(
        &self,
        document_id: &str,
        credential: &Credential,
    ) -> Result<Vec<u8>, FetchError>;

    /// Upload `bytes` as a new document, returning its stable reference.
    async fn publish(
        &self,
        bytes: Vec<u8>,
        request: &PublishRequest,
    ) -> Result<String, PublishError>;
}

/// Source of per-page annotation descriptors for a document.
#[async_trait]
pub trait AnnotationSource: Send + Sync {
    async fn annotations(
        &self,
        document_id: &str,
        credential: &Credential,
    ) -> Result<AnnotationSet, AnnotationError>;
}

/// Parse `base_url` and check it can carry path segments.
pub(crate) fn parse_base_url(base_url: &str) -> stitcher_shared::Result<url::Url> {
    let url = url::Url::parse(base_url).map_err(|e| {
        stitcher_shared::StitchError::config(format!("invalid base URL '{base_url}': {e}"))
    })?;
    if url.cannot_be_a_base() {
        return Err(stitcher_shared::StitchError::config(format!(
            "base URL '{base_url}' cannot carry a path"
        )));
    }
    Ok(url)
}

/// Append `segments` to `base`, percent-encoding each one.
pub(crate) fn endpoint(base: &url::Url, segments: &[&str]) -> url::Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_encodes_segments() {
        let base = parse_base_url("http://store.local:4603/api/").unwrap();
        let url = endpoint(&base, &["documents", "a b/c", "binary"]);
        assert_eq!(
            url.as_str(),
            "http://store.local:4603/api/documents/a%20b%2Fc/binary"
        );
    }

    #[test]
    fn base_url_must_be_hierarchical() {
        assert!(parse_base_url("mailto:docs@example.com").is_err());
        assert!(parse_base_url("not a url").is_err());
    }
}
