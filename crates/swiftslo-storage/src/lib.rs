pub mod auth;
pub mod retry;
pub mod swift;

pub use auth::{AuthVersion, Credentials};
pub use retry::RetryConfig;
pub use swift::SwiftConnection;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SwiftError>;

#[derive(Debug, Error)]
pub enum SwiftError {
    #[error("auth URL must end in a /v1, /v2 or /v3 version suffix: '{0}'")]
    AuthVersion(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("missing credential: {0}")]
    Credentials(String),

    #[error("{op} failed: HTTP {status}")]
    Status { op: String, status: u16 },

    #[error("{op} failed: {message}")]
    Request { op: String, message: String },

    #[error("{op}: malformed response: {message}")]
    MalformedResponse { op: String, message: String },
}

impl SwiftError {
    /// Convert a post-retry `ureq` error into the crate error for `op`.
    pub(crate) fn from_ureq(op: &str, err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(status, _) => SwiftError::Status {
                op: op.to_string(),
                status,
            },
            ureq::Error::Transport(t) => SwiftError::Request {
                op: op.to_string(),
                message: t.to_string(),
            },
        }
    }
}

/// The surface the upload pipeline drives. Object-safe so the core can hold
/// an `Arc<dyn ObjectStore>` and tests can substitute an in-memory fake.
pub trait ObjectStore: Send + Sync {
    /// Upload one object body. `etag_hex` is the lowercase hex MD5 of `data`;
    /// it is sent as the `ETag` header so the server rejects corrupt transfers.
    fn put_object(&self, container: &str, object: &str, data: &[u8], etag_hex: &str)
        -> Result<()>;

    /// Upload a static-large-object manifest body (a JSON array of segment
    /// references). Uses the SLO `?multipart-manifest=put` marker.
    fn put_manifest(&self, container: &str, object: &str, body: &[u8]) -> Result<()>;

    /// Names of all objects currently in `container`.
    fn list_container(&self, container: &str) -> Result<Vec<String>>;
}
