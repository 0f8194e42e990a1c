use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read ZIP file: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("storage object is already open elsewhere: {name}")]
    ResourceBusy { name: String },

    #[error("not a Shapefile: {0}")]
    NotAShapefile(String),

    #[error("{0} doesn't exist in the ZIP file")]
    MissingMember(String),

    #[error("refusing unsafe ZIP entry name: {0}")]
    UnsafeEntryName(String),

    #[error("Unknown encoding is found in .cpg file: {0}")]
    UnknownEncoding(String),

    #[error("invalid storage object name: {0:?}")]
    InvalidStorageName(String),

    #[error("download link is no longer valid: {0}")]
    ObjectUrlRevoked(String),

    #[error("unsupported protocol version {found} (expected {expected})")]
    UnsupportedProtocolVersion { found: u32, expected: u32 },

    #[error("unexpected response shape: {0}")]
    UnexpectedResponseShape(String),

    #[error("conversion worker is not available: {0}")]
    WorkerUnavailable(String),

    #[error("a conversion is already in progress")]
    Busy,

    #[error("conversion worker is not ready yet")]
    NotReady,

    #[error("no dataset selection is pending")]
    NoPendingSelection,

    #[error("{target} is not one of the offered candidates")]
    UnknownCandidate { target: String },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
