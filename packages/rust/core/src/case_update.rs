//! Typed request and response of a case-triggered stitch.
//!
//! A case-management system asks for a bundle to be stitched and, once the
//! task is done, receives the reference to store under one of its case
//! properties. The callback URL is probed when the request is accepted; it is
//! never contacted from inside the pipeline.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use stitcher_callback::ProbeOptions;
use stitcher_shared::{Bundle, Credential, DocumentTask, Result, StitchError, TaskId, TaskState};

use crate::dto::BundleDto;

/// Case property that receives the stitched document when no callback names one.
pub const DEFAULT_PROPERTY_NAME: &str = "stitchedDocument";

/// Where the case system wants to hear about the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackTarget {
    pub url: String,
    /// Case property the stitched document is written to.
    pub property_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StitchRequest {
    pub case_id: String,
    pub bundle: BundleDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackTarget>,
}

impl StitchRequest {
    /// Accept or reject the request before any task is created.
    ///
    /// Checks the bundle definition and probes the callback URL, if any.
    #[instrument(skip_all, fields(case_id = %self.case_id))]
    pub async fn validate(&self, probe: &ProbeOptions) -> Result<()> {
        if self.case_id.trim().is_empty() {
            return Err(StitchError::validation("case id is empty"));
        }
        Bundle::from(self.bundle.clone()).validate()?;

        if let Some(callback) = &self.callback {
            if callback.property_name.trim().is_empty() {
                return Err(StitchError::validation("callback property name is empty"));
            }
            stitcher_callback::probe(&callback.url, probe).await?;
        }

        debug!("stitch request accepted");
        Ok(())
    }

    /// Create the task that will stitch this request's bundle.
    pub fn into_task(self, credential: Credential) -> (CaseContext, DocumentTask) {
        let context = CaseContext {
            case_id: self.case_id,
            callback: self.callback,
        };
        let task = DocumentTask::new(Bundle::from(self.bundle), credential);
        (context, task)
    }
}

/// The parts of a request needed to answer it once the task has run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseContext {
    pub case_id: String,
    pub callback: Option<CallbackTarget>,
}

/// Value written to the case when a stitch succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseDocumentUpdate {
    pub property_name: String,
    pub document_uri: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StitchResponse {
    pub case_id: String,
    pub task_id: TaskId,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_description: Option<String>,
    /// Present only when the task is done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_update: Option<CaseDocumentUpdate>,
}

impl StitchResponse {
    pub fn new(context: &CaseContext, task: &DocumentTask) -> Self {
        let case_update = match (&task.state, &task.bundle.stitched_document_uri) {
            (TaskState::Done, Some(uri)) if !uri.is_empty() => Some(CaseDocumentUpdate {
                property_name: context
                    .callback
                    .as_ref()
                    .map_or_else(|| DEFAULT_PROPERTY_NAME.to_string(), |c| c.property_name.clone()),
                document_uri: uri.clone(),
                filename: task.bundle.artifact_filename(),
            }),
            _ => None,
        };

        Self {
            case_id: context.case_id.clone(),
            task_id: task.id,
            state: task.state,
            failure_description: task.failure_description.clone(),
            case_update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::BundleDocumentDto;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(callback: Option<CallbackTarget>) -> StitchRequest {
        StitchRequest {
            case_id: "case-42".into(),
            bundle: BundleDto {
                id: None,
                title: "Hearing Bundle".into(),
                filename: None,
                documents: vec![BundleDocumentDto {
                    sort_index: 0,
                    document_id: "doc-a".into(),
                    filename: "a.pdf".into(),
                    content_hash: None,
                    page_start: None,
                    page_end: None,
                }],
                cover_page: false,
                table_of_contents: true,
                pagination: Default::default(),
                annotations: false,
                stitched_document_uri: None,
            },
            callback,
        }
    }

    #[test]
    fn request_parses_from_json() {
        let json = r#"{
            "caseId": "case-7",
            "bundle": { "title": "B", "documents": [
                { "sortIndex": 0, "documentId": "d", "filename": "d.pdf" }
            ] },
            "callback": { "url": "http://case.local/hook", "propertyName": "bundleDoc" }
        }"#;
        let req: StitchRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.case_id, "case-7");
        assert_eq!(req.callback.unwrap().property_name, "bundleDoc");
    }

    #[tokio::test]
    async fn validate_probes_the_callback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let req = request(Some(CallbackTarget {
            url: format!("{}/hook", server.uri()),
            property_name: "bundleDoc".into(),
        }));
        req.validate(&ProbeOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn validate_rejects_failing_callback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let req = request(Some(CallbackTarget {
            url: server.uri(),
            property_name: "bundleDoc".into(),
        }));
        let err = req.validate(&ProbeOptions::default()).await.unwrap_err();
        assert!(matches!(err, StitchError::CallbackUnreachable(_)));
    }

    #[tokio::test]
    async fn validate_rejects_empty_bundle() {
        let mut req = request(None);
        req.bundle.documents.clear();
        let err = req.validate(&ProbeOptions::default()).await.unwrap_err();
        assert!(matches!(err, StitchError::Validation { .. }));
    }

    #[test]
    fn case_update_only_when_done() {
        let (context, mut task) = request(None).into_task(Credential::new("t"));
        let pending = StitchResponse::new(&context, &task);
        assert!(pending.case_update.is_none());

        task.transition(TaskState::Processing).unwrap();
        task.complete("store://docs/9".into()).unwrap();
        let done = StitchResponse::new(&context, &task);
        let update = done.case_update.unwrap();
        assert_eq!(update.property_name, DEFAULT_PROPERTY_NAME);
        assert_eq!(update.document_uri, "store://docs/9");
        assert_eq!(update.filename, "hearing-bundle.pdf");
    }

    #[test]
    fn failed_task_has_description_and_no_update() {
        let target = CallbackTarget {
            url: "http://case.local/hook".into(),
            property_name: "bundleDoc".into(),
        };
        let (context, mut task) = request(Some(target)).into_task(Credential::new("t"));
        task.transition(TaskState::Processing).unwrap();
        task.fail("404 not found").unwrap();

        let response = StitchResponse::new(&context, &task);
        assert_eq!(response.state, TaskState::Failed);
        assert_eq!(response.failure_description.as_deref(), Some("404 not found"));
        assert!(response.case_update.is_none());

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["caseId"], "case-42");
        assert!(json.get("caseUpdate").is_none());
    }
}
