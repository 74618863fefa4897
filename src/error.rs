use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Variants map directly onto the RTSP status codes used at the server
/// boundary (see `rtsp::server::status_for_error`); the mapping itself
/// lives there so this type stays free of wire-format concerns.
#[derive(Error, Debug)]
pub enum RtspError {
    #[error("malformed RTSP request: {0}")]
    Protocol(String),

    #[error("unsupported RTSP method: {0}")]
    UnsupportedMethod(String),

    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("another client is already active: {0}")]
    TooManyClients(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("invalid state for this request: {0}")]
    State(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("parameter sets not yet available for stream {0}")]
    ParametersUnavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fatal startup error: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, RtspError>;
