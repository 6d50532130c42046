use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PublishError;
use crate::message::Message;

/// A hook pair wrapped around every outbound publish. Simpler than the
/// consumer's indexed `Chain` since there is no "next" to thread through —
/// publish-side middlewares only observe the message going out and the
/// result coming back, they never alter control flow. Grounded on
/// `report-tags/src/rabbitmq/publisher.rs`'s wrapping of
/// `cleanapp_rustlib::rabbitmq::publisher::Publisher`, generalized from one
/// fixed wrapper into a registrable list.
#[async_trait]
pub trait PublishMiddleware: Send + Sync {
    async fn before_publish(&self, msg: &Message) {
        let _ = msg;
    }

    async fn after_publish(&self, msg: &Message, result: &Result<(), PublishError>) {
        let _ = (msg, result);
    }
}

/// Logs one line per outbound publish attempt and its outcome.
pub struct PublishMessageLog;

#[async_trait]
impl PublishMiddleware for PublishMessageLog {
    async fn before_publish(&self, msg: &Message) {
        log::info!(
            "message_publishing exchange={} routing_key={} event_name={} trace_id={}",
            msg.exchange,
            msg.routing_key,
            msg.header.event_name,
            msg.header.trace_id,
        );
    }

    async fn after_publish(&self, msg: &Message, result: &Result<(), PublishError>) {
        match result {
            Ok(()) => log::info!(
                "message_published routing_key={} trace_id={}",
                msg.routing_key,
                msg.header.trace_id
            ),
            Err(e) => log::error!(
                "message_publish_failed routing_key={} trace_id={} error={}",
                msg.routing_key,
                msg.header.trace_id,
                e
            ),
        }
    }
}

/// Timestamps a publish attempt and logs its wall-clock duration. Stands in
/// for a real distributed-tracing span: this crate's ambient stack uses
/// `log`, not a tracing collector, so there is nothing to export the span
/// to, but the start/elapsed timing is still useful to skim from logs.
pub struct PublishTracingSpan;

#[async_trait]
impl PublishMiddleware for PublishTracingSpan {
    async fn before_publish(&self, msg: &Message) {
        log::debug!("span_start publish routing_key={}", msg.routing_key);
    }

    async fn after_publish(&self, msg: &Message, result: &Result<(), PublishError>) {
        log::debug!(
            "span_end publish routing_key={} ok={}",
            msg.routing_key,
            result.is_ok()
        );
    }
}

pub(crate) async fn run_before(middlewares: &[Arc<dyn PublishMiddleware>], msg: &Message) {
    for mw in middlewares {
        mw.before_publish(msg).await;
    }
}

pub(crate) async fn run_after(
    middlewares: &[Arc<dyn PublishMiddleware>],
    msg: &Message,
    result: &Result<(), PublishError>,
) {
    for mw in middlewares {
        mw.after_publish(msg, result).await;
    }
}
