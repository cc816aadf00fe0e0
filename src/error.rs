use thiserror::Error;

/// Failure to turn a PDF (or one of its pages) into positioned tokens.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to read PDF: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse PDF: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("page {index} out of range ({count} pages)")]
    PageOutOfRange { index: usize, count: usize },
    #[error("page {0} timed out")]
    Timeout(usize),
    #[error("page worker failed: {0}")]
    Worker(String),
}

/// Errors that stop processing of a whole notice directory.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot read directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode {file}: {source}")]
    Document {
        file: String,
        #[source]
        source: DecodeError,
    },
}

/// Error type used by the network-facing collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
