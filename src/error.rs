//! Error types for the AMI client and the metrics layer

use thiserror::Error;

/// Errors raised by the AMI protocol client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AmiError {
    /// Transport I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or handshake failure.
    #[error("TLS error: {message}")]
    Tls { message: String },

    /// The first line sent by the server was not an AMI banner.
    #[error("server is not an Asterisk Manager Interface (banner: {banner:?})")]
    NotAmi { banner: String },

    /// Login was rejected by the server.
    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// Framing or decoding failure.
    #[error("protocol error: {message}")]
    ProtocolError { message: String },

    /// A header line without a `Name: value` shape.
    #[error("invalid header: {header}")]
    InvalidHeader { header: String },

    /// A header block that is neither a response nor an event.
    #[error("unrecognized frame with headers [{}]", .headers.join(", "))]
    UnrecognizedFrame { headers: Vec<String> },

    /// The transport was closed, locally or by the server.
    #[error("connection closed")]
    ConnectionClosed,

    /// An action was submitted while no transport is open.
    #[error("not connected")]
    NotConnected,

    /// A bounded wait expired.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A handler for this event name is already installed.
    #[error("handler already registered for event {event}")]
    AlreadyRegistered { event: String },

    /// No handler for this event name is installed.
    #[error("no handler registered for event {event}")]
    NotRegistered { event: String },

    /// An action with this ActionID is still awaiting its response.
    #[error("action {action_id} is already pending")]
    DuplicateActionId { action_id: String },

    /// The server answered an action with `Response: Error`.
    #[error("action failed: {message}")]
    ActionFailed { message: String },

    /// Events were dropped because the subscriber fell behind.
    #[error("event queue full, events dropped")]
    QueueFull,

    /// Invalid configuration value.
    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl AmiError {
    /// Build a [`AmiError::ProtocolError`].
    pub fn protocol_error(message: impl Into<String>) -> Self {
        AmiError::ProtocolError {
            message: message.into(),
        }
    }

    /// Build a [`AmiError::AuthFailed`].
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        AmiError::AuthFailed {
            reason: reason.into(),
        }
    }

    /// Build a [`AmiError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        AmiError::Config {
            message: message.into(),
        }
    }

    /// Whether this error means the current connection is unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AmiError::Io(_)
                | AmiError::Tls { .. }
                | AmiError::NotAmi { .. }
                | AmiError::AuthFailed { .. }
                | AmiError::ProtocolError { .. }
                | AmiError::InvalidHeader { .. }
                | AmiError::ConnectionClosed
                | AmiError::NotConnected
        )
    }
}

/// Result alias used across the client.
pub type AmiResult<T> = Result<T, AmiError>;

/// Errors raised by a metrics sink or the gauge registry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricsError {
    /// The sink failed to send a measurement.
    #[error("metrics transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The gauge identifier was already baselined.
    #[error("gauge {0} already registered")]
    GaugeAlreadyRegistered(String),
}
