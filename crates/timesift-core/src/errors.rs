/// Typed errors for search backend operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("network error: {0}")]
    Network(String),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("index not found: {0}")]
    IndexNotFound(String),
    #[error("document not found: {index}/{event_id}")]
    DocumentNotFound { index: String, event_id: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("bulk update rejected {failed} of {total} documents")]
    BulkRejected { failed: usize, total: usize },
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
}

impl DatastoreError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Status { .. } => "status",
            Self::IndexNotFound(_) => "index_not_found",
            Self::DocumentNotFound { .. } => "document_not_found",
            Self::MalformedResponse(_) => "malformed_response",
            Self::BulkRejected { .. } => "bulk_rejected",
            Self::InvalidUrl(_) => "invalid_url",
        }
    }

    /// Classify an HTTP status code returned by the backend.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            404 if body.contains("index_not_found_exception") => Self::IndexNotFound(body),
            _ => Self::Status { status, body },
        }
    }
}
