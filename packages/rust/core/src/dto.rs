//! Wire representations of bundles and tasks.
//!
//! The JSON shapes are camelCase; every conversion to and from the domain
//! types is an explicit, pure `From` impl.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stitcher_shared::{
    Bundle, BundleDocument, BundleId, DocumentTask, LayoutConfig, PageRange, PaginationStyle,
    TaskId, TaskState,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDocumentDto {
    pub sort_index: u32,
    pub document_id: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_start: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_end: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDto {
    /// Assigned on conversion when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<BundleId>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub documents: Vec<BundleDocumentDto>,
    #[serde(default)]
    pub cover_page: bool,
    #[serde(default)]
    pub table_of_contents: bool,
    #[serde(default)]
    pub pagination: PaginationStyle,
    #[serde(default)]
    pub annotations: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stitched_document_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDto {
    pub id: TaskId,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_description: Option<String>,
    pub bundle: BundleDto,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Wire -> domain
// ---------------------------------------------------------------------------

impl From<BundleDocumentDto> for BundleDocument {
    fn from(dto: BundleDocumentDto) -> Self {
        let page_range = match (dto.page_start, dto.page_end) {
            (Some(start), Some(end)) => Some(PageRange::new(start, end)),
            _ => None,
        };
        Self {
            sort_index: dto.sort_index,
            document_id: dto.document_id,
            filename: dto.filename,
            content_hash: dto.content_hash,
            page_range,
        }
    }
}

impl From<BundleDto> for Bundle {
    fn from(dto: BundleDto) -> Self {
        Self {
            id: dto.id.unwrap_or_default(),
            title: dto.title,
            filename: dto.filename,
            documents: dto.documents.into_iter().map(BundleDocument::from).collect(),
            layout: LayoutConfig {
                cover_page: dto.cover_page,
                table_of_contents: dto.table_of_contents,
                pagination: dto.pagination,
                annotations: dto.annotations,
            },
            stitched_document_uri: dto.stitched_document_uri,
        }
    }
}

// ---------------------------------------------------------------------------
// Domain -> wire
// ---------------------------------------------------------------------------

impl From<&BundleDocument> for BundleDocumentDto {
    fn from(doc: &BundleDocument) -> Self {
        Self {
            sort_index: doc.sort_index,
            document_id: doc.document_id.clone(),
            filename: doc.filename.clone(),
            content_hash: doc.content_hash.clone(),
            page_start: doc.page_range.map(|r| r.start),
            page_end: doc.page_range.map(|r| r.end),
        }
    }
}

impl From<&Bundle> for BundleDto {
    fn from(bundle: &Bundle) -> Self {
        Self {
            id: Some(bundle.id),
            title: bundle.title.clone(),
            filename: bundle.filename.clone(),
            documents: bundle.documents.iter().map(BundleDocumentDto::from).collect(),
            cover_page: bundle.layout.cover_page,
            table_of_contents: bundle.layout.table_of_contents,
            pagination: bundle.layout.pagination,
            annotations: bundle.layout.annotations,
            stitched_document_uri: bundle.stitched_document_uri.clone(),
        }
    }
}

impl From<&DocumentTask> for TaskDto {
    fn from(task: &DocumentTask) -> Self {
        Self {
            id: task.id,
            state: task.state,
            failure_description: task.failure_description.clone(),
            bundle: BundleDto::from(&task.bundle),
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}
