pub mod acker;
pub mod connection_initializer;
pub mod delivery_channel_manager;
pub mod facade;
pub mod middleware;
pub mod registry;

pub use connection_initializer::ConnectionState;
pub use facade::Consumer;
pub use middleware::{
    Chain, Handler, LogFailedMessage, MessageLog, Middleware, Recover, RecoverWithRetry,
    RetryWithError, StoreTraceIdIntoContext, StoreUserIdIntoContext,
};
