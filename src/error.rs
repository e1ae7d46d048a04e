//! Error types for the document assembly and signing pipeline.
//!
//! Fatal conditions (missing sources, unparseable PDFs, out-of-range field pages) abort the
//! operation. Degradations such as an undecodable signature image or a lost audit record are
//! also represented here so callers can decide, but the signing service handles them itself.

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while assembling, signing or recording a document.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input PDF or image is missing (path does not exist or buffer is empty)
    #[error("Source not found: {0}")]
    SourceNotFound(String),

    /// Input could not be parsed as a PDF, or lacks a required structure
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    /// Signature payload is not a decodable raster image
    #[error("Unsupported image format: {0}")]
    UnsupportedImageFormat(String),

    /// A field or target page lies outside the document
    #[error("Page {page} out of range for field '{field}' (document has {page_count} pages)")]
    PageIndexOutOfRange {
        /// Field name, or the operation that referenced the page
        field: String,
        /// Offending page in the caller's convention
        page: i64,
        /// Actual page count of the document
        page_count: u32,
    },

    /// Normalized coordinates violate the 0..=1 box invariant
    #[error("Invalid field area: {0}")]
    InvalidFieldArea(String),

    /// Signature metadata could not be written or read
    #[error("Metadata persistence failure: {0}")]
    MetadataPersistence(String),

    /// A record with this signature id already exists
    #[error("Duplicate signature id: {0}")]
    DuplicateSignatureId(String),

    /// The same business document is already being processed
    #[error("Operation already in progress: {0}")]
    ConcurrentOperation(String),

    /// External signing vendor rejected or failed a request
    #[error("Signing vendor error: {0}")]
    Vendor(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// A command is missing a required argument or names an unknown action
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Low-level PDF object error while editing a loaded document
    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),
}

impl Error {
    /// Stable snake_case code carried in structured results.
    pub fn code(&self) -> &'static str {
        match self {
            Error::SourceNotFound(_) => "source_not_found",
            Error::MalformedDocument(_) => "malformed_document",
            Error::UnsupportedImageFormat(_) => "unsupported_image_format",
            Error::PageIndexOutOfRange { .. } => "page_index_out_of_range",
            Error::InvalidFieldArea(_) => "invalid_field_area",
            Error::MetadataPersistence(_) => "metadata_persistence_failure",
            Error::DuplicateSignatureId(_) => "duplicate_signature_id",
            Error::ConcurrentOperation(_) => "concurrent_operation",
            Error::Vendor(_) => "vendor_error",
            Error::Config(_) => "config_error",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
            Error::Pdf(_) => "pdf_error",
        }
    }

    /// Whether the failure must abort the whole operation.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::UnsupportedImageFormat(_) | Error::MetadataPersistence(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_out_of_range_message_names_field_and_count() {
        let err = Error::PageIndexOutOfRange {
            field: "customer_signature".to_string(),
            page: 26,
            page_count: 25,
        };
        let msg = err.to_string();
        assert!(msg.contains("customer_signature"));
        assert!(msg.contains("26"));
        assert!(msg.contains("25 pages"));
        assert_eq!(err.code(), "page_index_out_of_range");
        assert!(err.is_fatal());
    }

    #[test]
    fn degradations_are_not_fatal() {
        assert!(!Error::UnsupportedImageFormat("svg".into()).is_fatal());
        assert!(!Error::MetadataPersistence("disk full".into()).is_fatal());
        assert!(Error::SourceNotFound("a.pdf".into()).is_fatal());
        assert!(Error::MalformedDocument("garbage".into()).is_fatal());
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io.into();
        assert_eq!(err.code(), "io_error");
        assert!(err.to_string().contains("boom"));
    }
}
