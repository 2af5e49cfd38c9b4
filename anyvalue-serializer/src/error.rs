use thiserror::Error;

/// Error types for the anyvalue-serializer crate
#[derive(Error, Debug)]
pub enum SerializerError {
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Invalid category byte: {0}")]
    InvalidCategory(u8),

    #[error("Invalid type name length: declared {declared} bytes, {available} available")]
    InvalidTypeNameLength { declared: usize, available: usize },

    #[error("Wire type name too long ({0} bytes, max 255)")]
    TypeNameTooLong(usize),

    #[error("Decryption unavailable: {0}")]
    DecryptionUnavailable(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Label '{0}' not available in current context")]
    LabelNotFound(String),

    #[error("Empty encrypted group for label '{0}'")]
    EmptyEncryptedGroup(String),

    #[error("Type mismatch: expected {expected}, found {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Unsupported category for operation: {0}")]
    UnsupportedCategory(String),

    #[error("Invalid label configuration: {0}")]
    InvalidLabelConfig(String),

    #[error("Missing wire-name registration for {0}")]
    MissingWireName(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Decoding error: {0}")]
    Decoding(String),
}

impl SerializerError {
    pub(crate) fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        SerializerError::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether this error means "the caller is not entitled to read this value"
    /// rather than "the data is broken". Such errors are recoverable by treating
    /// the value as inaccessible.
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            SerializerError::DecryptionUnavailable(_)
                | SerializerError::DecryptionFailed(_)
                | SerializerError::LabelNotFound(_)
        )
    }
}

impl From<serde_cbor::Error> for SerializerError {
    fn from(err: serde_cbor::Error) -> Self {
        SerializerError::Decoding(err.to_string())
    }
}

impl From<serde_json::Error> for SerializerError {
    fn from(err: serde_json::Error) -> Self {
        SerializerError::Decoding(format!("JSON: {err}"))
    }
}

impl From<prost::DecodeError> for SerializerError {
    fn from(err: prost::DecodeError) -> Self {
        SerializerError::Decoding(format!("envelope: {err}"))
    }
}

/// Result type for anyvalue-serializer operations
pub type Result<T> = std::result::Result<T, SerializerError>;
