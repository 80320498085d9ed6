use thiserror::Error;

/// Errors raised while opening or reading a capture file.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid capture format: {reason}")]
    InvalidFormat { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by a document store for a single request.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("store responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },
}
