use thiserror::Error;

/// Errors surfaced from the connection/channel lifecycle and consumer setup.
///
/// Per the propagation policy: only startup errors (`Connect`) and explicit
/// setup mistakes (`NoConsumerForQueue`) are returned to callers. Everything
/// that happens after `StartConsuming` is handled by the recovery machinery
/// and never reaches application code directly.
#[derive(Error, Debug)]
pub enum EventbusError {
    #[error("dial failed: {0}")]
    DialError(String),

    #[error("channel open failed: {0}")]
    ChannelOpenError(String),

    #[error("set qos failed: {0}")]
    QosError(String),

    #[error("channel requested while not connected")]
    Disconnected,

    #[error("no consumer registered for queue: {0}")]
    NoConsumerForQueue(String),

    #[error("delivery channel init failed for queue {queue}: {source}")]
    DeliveryInit {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("broker channel closed")]
    BrokerChannelClosed,
}

/// Carried on `Message.error` when the header lookup failed during decode.
#[derive(Error, Debug, Clone)]
pub enum HeaderDecodeError {
    #[error("missing `timestamp` field on header")]
    MissingTimestamp,

    #[error("invalid `timestamp` field on header: {0}")]
    InvalidTimestamp(String),
}

/// Carried on `Message.error` when the delivery body is not valid JSON.
#[derive(Error, Debug, Clone)]
#[error("payload is not valid json")]
pub struct InvalidJson;

/// Producer-side publish failures.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("channel closed before confirmation was received")]
    ConfirmFailed,

    #[error("broker did not ack the published message")]
    NotAcked,

    #[error("message validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Lapin(#[from] lapin::Error),

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Config loading failures. The teacher's binaries panic on a missing
/// required env var; a library returns an error instead so callers decide
/// how to fail.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}
