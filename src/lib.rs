//! Async RabbitMQ (AMQP 0-9-1) client with two subsystems: a confirm-mode,
//! auto-reconnecting `Producer`, and a `Consumer` runtime that fans
//! deliveries out to per-queue worker pools through a composable
//! middleware chain.

pub mod config;
pub mod consumer;
pub mod context;
pub mod error;
pub mod message;
pub mod producer;
pub mod retry;

pub use config::Config;
pub use consumer::Consumer;
pub use context::MessageContext;
pub use error::{ConfigError, EventbusError, PublishError};
pub use message::{Header, Message, MessageStatus, Payload};
pub use producer::{Producer, Republish};
pub use retry::{is_retryable, retryable, RetryError};
