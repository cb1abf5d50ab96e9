use thiserror::Error;

/// Errors delivered through completion sinks and returned by client calls.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The action could not be delivered because the connection was never
    /// established or was lost while the action was pending.
    #[error("not connected")]
    NotConnected,

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("mqtt provider failed")]
    Provider(#[from] ProviderError),
}

/// Errors surfaced by an MQTT provider implementation.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("mqtt client request failed: {0}")]
    Client(String),

    #[error("connection refused by the broker: {0}")]
    ConnectionRefused(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("no active mqtt session")]
    NotConnected,
}

/// Inbound topic parsing failures. These are logged and the offending
/// publish is dropped; they never propagate to user calls.
#[derive(Debug, Clone, Error)]
pub enum TopicError {
    #[error("malformed topic: {0}")]
    MalformedTopic(String),

    #[error("malformed property bag: {0}")]
    MalformedPropertyBag(String),
}

/// Credential construction and parsing failures.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("malformed connection string: {0}")]
    MalformedConnectionString(String),

    #[error("invalid shared access key: {0}")]
    InvalidKey(String),
}
