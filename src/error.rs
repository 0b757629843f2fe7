use thiserror::Error;

/// Errors produced while acquiring a model artifact and handing it to the engine.
///
/// None of these are fatal: the attempt is logged, the model state is recorded
/// as failed, and the node keeps serving with whatever it had before.
#[derive(Error, Debug)]
pub enum AcquireError {
    #[error("Model download failed: {0}")]
    DownloadFailed(String),

    #[error("Model archive extraction failed: {0}")]
    ExtractFailed(String),

    #[error("Engine rejected model: {0}")]
    LoadRejected(String),

    #[error("Invalid model spec: {0}")]
    InvalidSpec(String),

    #[error("Model workspace error: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("Model acquisition timed out after {0}s")]
    TimedOut(u64),
}

/// Errors reported by an inference engine adapter.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Incompatible model topology: {0}")]
    Topology(String),

    #[error("Model load failed: {0}")]
    Load(String),

    #[error("Inference execution failed: {0}")]
    Execution(String),

    #[error("Annotation failed: {0}")]
    Annotation(String),
}

/// Why a scoring request could not be completed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RejectReason {
    #[error("Image decode failed: {0}")]
    Decode(String),

    #[error("Engine failure: {0}")]
    Engine(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Twin transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The configuration channel is permanently broken.
    #[error("Twin transport closed: {0}")]
    Fatal(String),

    #[error("Malformed twin payload: {0}")]
    Malformed(String),

    #[error("Twin publish failed: {0}")]
    Publish(String),
}

impl TransportError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Fatal(_))
    }
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Upload request failed: {0}")]
    Request(String),

    #[error("Upload rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}
