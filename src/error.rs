//! Error types and handling for memscatter

/// Result type alias for memscatter operations
pub type Result<T> = std::result::Result<T, ScatterError>;

/// Errors surfaced by the scatter engine, buffer pools and refresh scheduler
///
/// Per-address transport failures are not errors: they show up as an empty
/// (`None`) materialization result for that address only.
#[derive(Debug, thiserror::Error)]
pub enum ScatterError {
    /// Invalid parameters or configuration
    #[error("Invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// The session behind this operation has been disposed
    #[error("Session {session} has been disposed")]
    SessionDisposed { session: u64 },

    /// The request set or round map has been disposed
    #[error("Scatter object disposed: {object}")]
    Disposed { object: String },

    /// Operation not valid in the current state
    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState { expected: String, actual: String },

    /// A completion receiver tried to execute the set it is running in
    #[error("Re-entrant execute on a request set that is dispatching completions")]
    ReentrantExecute,

    /// The set is in the middle of dispatching completions
    #[error("Request set busy: {operation} not allowed during completion dispatch")]
    Busy { operation: String },

    /// Access to a pooled buffer after it was released
    #[error("Pooled buffer of {length} bytes was already released")]
    BufferReleased { length: usize },

    /// A refresh scheduler already exists for this key
    #[error("Refresh scheduler already registered: session {session}, option {option}")]
    DuplicateRegistration { session: u64, option: String },

    /// No refresh scheduler exists for this key
    #[error("Refresh scheduler not registered: session {session}, option {option}")]
    NotRegistered { session: u64, option: String },

    /// The transport failed a whole call
    #[error("Transport error: {operation} - {message}")]
    Transport { operation: String, message: String },

    /// Background thread management failures
    #[error("Thread error: {message}")]
    Thread {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

impl ScatterError {
    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a disposed error for the named object
    pub fn disposed(object: impl Into<String>) -> Self {
        Self::Disposed {
            object: object.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a busy error
    pub fn busy(operation: impl Into<String>) -> Self {
        Self::Busy {
            operation: operation.into(),
        }
    }

    /// Create a transport error
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a thread error from a spawn failure
    pub fn thread(source: std::io::Error, context: &str) -> Self {
        Self::Thread {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Whether this error indicates a caller mistake rather than a transport problem
    pub fn is_usage_error(&self) -> bool {
        !matches!(self, Self::Transport { .. } | Self::Thread { .. })
    }
}
