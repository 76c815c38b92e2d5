use thiserror::Error;

pub type Result<T> = std::result::Result<T, UploadError>;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("file size and chunk size must both be non-zero (file {file_size}, chunk {chunk_size})")]
    EmptyPlan { file_size: u64, chunk_size: u64 },

    #[error("malformed object name template '{template}': {message}")]
    NameTemplate { template: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sidecar file '{path}': {message}")]
    Sidecar { path: String, message: String },

    #[error("chunk {number} ({object}): {message}")]
    Chunk {
        number: u64,
        object: String,
        message: String,
    },

    #[error("manifest invariant violated: {0}")]
    InvariantViolation(String),
}

impl UploadError {
    /// Per-chunk error helper used by stages reporting to the error sink.
    pub fn chunk(number: u64, object: &str, message: impl Into<String>) -> Self {
        UploadError::Chunk {
            number,
            object: object.to_string(),
            message: message.into(),
        }
    }
}
