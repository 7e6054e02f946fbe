use thiserror::Error;

/// Unified error type for the responder core.
///
/// Every failure surfaced anywhere in the pipeline, the caches, the ID-map,
/// or the provider adapter funnels through this one enum. `status_code`
/// groups variants into the wire-level categories from the external
/// protocol (not-found / invalid-input / backend-unavailable / fatal /
/// external-source).
#[derive(Debug, Clone, Error)]
pub enum ResponderError {
    #[error("entry not found")]
    NotFound,

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("persistent cache backend error: {0}")]
    Backend(String),

    #[error("provider refresh failed: {0}")]
    RefreshFailed(String),

    #[error("id-map requires an external lookup")]
    ExternalSource,

    #[error("invalid SID: {0}")]
    InvalidSid(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("no domain matches the given SID or range")]
    NoDomain,

    #[error("id-map collision: {0}")]
    Collision(String),

    #[error("no free slice available")]
    OutOfSlices,

    #[error("SID belongs to a built-in authority")]
    BuiltinSid,

    #[error("no range covers the given id")]
    NoRange,

    #[error("provider is unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("unsupported command")]
    Unsupported,

    #[error("corrupted state: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ResponderError {
    /// Maps an error onto the wire-level status categories of the client protocol.
    pub fn status_code(&self) -> i32 {
        match self {
            ResponderError::NotFound => 0,
            ResponderError::InvalidInput(_) => 1,
            ResponderError::Backend(_) | ResponderError::Io(_) => 2,
            ResponderError::RefreshFailed(_) | ResponderError::ProviderUnavailable(_) => 3,
            ResponderError::ExternalSource => 4,
            ResponderError::InvalidSid(_)
            | ResponderError::OutOfMemory
            | ResponderError::NoDomain
            | ResponderError::Collision(_)
            | ResponderError::OutOfSlices
            | ResponderError::BuiltinSid
            | ResponderError::NoRange => 1,
            ResponderError::Unsupported | ResponderError::Fatal(_) => 5,
            ResponderError::Config(_) => 5,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ResponderError::Unsupported | ResponderError::Fatal(_))
    }
}

impl From<std::io::Error> for ResponderError {
    fn from(e: std::io::Error) -> Self {
        ResponderError::Io(e.to_string())
    }
}

impl From<sled::Error> for ResponderError {
    fn from(e: sled::Error) -> Self {
        ResponderError::Backend(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for ResponderError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ResponderError::Backend(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for ResponderError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ResponderError::Backend(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ResponderError>;
