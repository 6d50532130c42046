use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;

use crate::context::MessageContext;
use crate::message::{Message, MessageStatus};
use crate::producer::Republish;
use crate::retry;

/// The terminal consume function a queue's handler implements. Middlewares
/// wrap this the way the teacher's `Callback::on_message` is wrapped by
/// the worker loop in `subscriber.rs`, generalized into an explicit,
/// user-extensible chain.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut MessageContext, msg: &mut Message);
}

#[async_trait]
impl<F> Handler for F
where
    F: Fn(&mut MessageContext, &mut Message) + Send + Sync,
{
    async fn handle(&self, ctx: &mut MessageContext, msg: &mut Message) {
        (self)(ctx, msg)
    }
}

/// One wrapper in the chain. `index` is this middleware's own position;
/// calling `chain.run_from(index + 1, ..)` invokes the next element (or
/// the terminal handler once the index runs past the end) — the
/// "explicit next index carried in the per-invocation state" composition
/// strategy, chosen over a per-message closure chain to keep allocation to
/// one `Chain` per queue rather than one nested closure per delivery.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut MessageContext, msg: &mut Message, index: usize, chain: &Chain);
}

/// An ordered list of middlewares composed around a terminal handler. The
/// first element in the list runs outermost: it sees the message first on
/// entry and last on exit.
pub struct Chain {
    middlewares: Vec<Arc<dyn Middleware>>,
    terminal: Arc<dyn Handler>,
}

impl Chain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>, terminal: Arc<dyn Handler>) -> Self {
        Chain {
            middlewares,
            terminal,
        }
    }

    pub async fn run(&self, ctx: &mut MessageContext, msg: &mut Message) {
        self.run_from(0, ctx, msg).await;
    }

    pub async fn run_from(&self, index: usize, ctx: &mut MessageContext, msg: &mut Message) {
        match self.middlewares.get(index) {
            Some(mw) => mw.handle(ctx, msg, index, self).await,
            None => self.terminal.handle(ctx, msg).await,
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[derive(Debug)]
struct PanicError(String);

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler panicked: {}", self.0)
    }
}

impl StdError for PanicError {}

#[derive(Debug)]
struct RetryPublishFailed(String);

impl fmt::Display for RetryPublishFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to publish retry event: {}", self.0)
    }
}

impl StdError for RetryPublishFailed {}

/// Emits one info-level log entry on entry, including all message identity
/// fields.
pub struct MessageLog;

#[async_trait]
impl Middleware for MessageLog {
    async fn handle(&self, ctx: &mut MessageContext, msg: &mut Message, index: usize, chain: &Chain) {
        log::info!(
            "message_consuming id={} exchange={} routing_key={} event_name={} publisher={} trace_id={} user_id={} x_retry_count={}",
            msg.id,
            msg.exchange,
            msg.routing_key,
            msg.header.event_name,
            msg.header.publisher,
            ctx.trace_id,
            ctx.user_id,
            msg.header.x_retry_count,
        );
        chain.run_from(index + 1, ctx, msg).await;
    }
}

/// After `next`, if `msg.error` is set, emits an error-level log entry with
/// the error and identity fields.
pub struct LogFailedMessage;

#[async_trait]
impl Middleware for LogFailedMessage {
    async fn handle(&self, ctx: &mut MessageContext, msg: &mut Message, index: usize, chain: &Chain) {
        chain.run_from(index + 1, ctx, msg).await;
        if let Some(err) = msg.error.as_ref() {
            log::error!(
                "message_failed id={} routing_key={} error={}",
                msg.id,
                msg.routing_key,
                err
            );
        }
    }
}

/// Installs a scoped panic handler around `next`; catches and logs, leaves
/// `msg.status` unchanged (the message acks, preventing a poison loop).
pub struct Recover;

#[async_trait]
impl Middleware for Recover {
    async fn handle(&self, ctx: &mut MessageContext, msg: &mut Message, index: usize, chain: &Chain) {
        let outcome = AssertUnwindSafe(chain.run_from(index + 1, ctx, msg))
            .catch_unwind()
            .await;
        if let Err(panic) = outcome {
            log::error!("recovered panic in handler: {}", panic_message(&panic));
        }
    }
}

/// Same catch as `Recover`, but rewrites `msg.error` to a retryable error
/// wrapping the panic value, so `RetryWithError` republishes it.
pub struct RecoverWithRetry;

#[async_trait]
impl Middleware for RecoverWithRetry {
    async fn handle(&self, ctx: &mut MessageContext, msg: &mut Message, index: usize, chain: &Chain) {
        let outcome = AssertUnwindSafe(chain.run_from(index + 1, ctx, msg))
            .catch_unwind()
            .await;
        if let Err(panic) = outcome {
            let text = panic_message(&panic);
            log::error!("recovered panic in handler, scheduling retry: {}", text);
            msg.error = Some(retry::retryable(PanicError(text)));
        }
    }
}

/// After `next`, if `msg.error` implements the retry marker: increments
/// `XRetryCount`; rejects once over `max_retries`; otherwise rewrites
/// `RoutingKey` to the first configured delay routing key (or appends
/// `.delayed` if none are configured and the key isn't already suffixed),
/// then republishes via the supplied producer.
pub struct RetryWithError {
    producer: Arc<dyn Republish>,
    max_retries: i16,
    delay_routing_keys: Vec<String>,
}

impl RetryWithError {
    pub fn new(producer: Arc<dyn Republish>, max_retries: i16, delay_routing_keys: Vec<String>) -> Self {
        RetryWithError {
            producer,
            max_retries,
            delay_routing_keys,
        }
    }
}

#[async_trait]
impl Middleware for RetryWithError {
    async fn handle(&self, ctx: &mut MessageContext, msg: &mut Message, index: usize, chain: &Chain) {
        chain.run_from(index + 1, ctx, msg).await;

        let should_retry = msg
            .error
            .as_deref()
            .map(retry::is_retryable)
            .unwrap_or(false);
        if !should_retry {
            return;
        }

        msg.header.x_retry_count += 1;

        if msg.header.x_retry_count > self.max_retries {
            log::error!(
                "retry budget exhausted for routing_key={}: {:?}",
                msg.routing_key,
                msg.error
            );
            msg.status = MessageStatus::Reject;
            return;
        }

        log::error!(
            "retrying routing_key={} x_retry_count={} error={:?}",
            msg.routing_key,
            msg.header.x_retry_count,
            msg.error
        );

        msg.routing_key = match self.delay_routing_keys.first() {
            Some(key) => key.clone(),
            None if !msg.routing_key.ends_with(".delayed") => format!("{}.delayed", msg.routing_key),
            None => msg.routing_key.clone(),
        };

        let republish = Message {
            id: msg.id.clone(),
            exchange: msg.exchange.clone(),
            routing_key: msg.routing_key.clone(),
            header: msg.header.clone(),
            payload: msg.payload.clone(),
            status: MessageStatus::Ack,
            error: None,
        };

        if let Err(e) = self.producer.publish(republish).await {
            msg.error = Some(Box::new(RetryPublishFailed(e.to_string())));
            msg.status = MessageStatus::Reject;
        }
    }
}

/// Enriches the outgoing context with the trace id lifted from the header.
pub struct StoreTraceIdIntoContext;

#[async_trait]
impl Middleware for StoreTraceIdIntoContext {
    async fn handle(&self, ctx: &mut MessageContext, msg: &mut Message, index: usize, chain: &Chain) {
        ctx.trace_id = msg.header.trace_id.clone();
        chain.run_from(index + 1, ctx, msg).await;
    }
}

/// Enriches the outgoing context with the user id lifted from the header.
pub struct StoreUserIdIntoContext;

#[async_trait]
impl Middleware for StoreUserIdIntoContext {
    async fn handle(&self, ctx: &mut MessageContext, msg: &mut Message, index: usize, chain: &Chain) {
        ctx.user_id = msg.header.user_id.clone();
        chain.run_from(index + 1, ctx, msg).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct RecordingHandler {
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn handle(&self, _ctx: &mut MessageContext, _msg: &mut Message) {
            self.order.lock().unwrap().push("handler");
        }
    }

    struct OrderRecorder {
        name: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Middleware for OrderRecorder {
        async fn handle(&self, ctx: &mut MessageContext, msg: &mut Message, index: usize, chain: &Chain) {
            self.order.lock().unwrap().push(self.name);
            chain.run_from(index + 1, ctx, msg).await;
        }
    }

    fn sample_message() -> Message {
        Message::new(
            "ex",
            "rk",
            crate::message::Payload {
                entity_id: "1".to_string(),
                data: json!({"a": 1}),
            },
        )
    }

    #[tokio::test]
    async fn middleware_chain_runs_entry_order_then_exit_is_implicit_reverse() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mws: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(OrderRecorder { name: "m0", order: order.clone() }),
            Arc::new(OrderRecorder { name: "m1", order: order.clone() }),
            Arc::new(OrderRecorder { name: "m2", order: order.clone() }),
        ];
        let handler = Arc::new(RecordingHandler { order: order.clone() });
        let chain = Chain::new(mws, handler);

        let mut ctx = MessageContext::default();
        let mut msg = sample_message();
        chain.run(&mut ctx, &mut msg).await;

        assert_eq!(*order.lock().unwrap(), vec!["m0", "m1", "m2", "handler"]);
    }

    #[tokio::test]
    async fn recover_suppresses_panic_and_leaves_status_ack() {
        struct Panicky;
        #[async_trait]
        impl Handler for Panicky {
            async fn handle(&self, _ctx: &mut MessageContext, _msg: &mut Message) {
                panic!("boom");
            }
        }

        let chain = Chain::new(vec![Arc::new(Recover)], Arc::new(Panicky));
        let mut ctx = MessageContext::default();
        let mut msg = sample_message();
        chain.run(&mut ctx, &mut msg).await;

        assert_eq!(msg.status, MessageStatus::Ack);
    }

    #[tokio::test]
    async fn recover_with_retry_marks_error_retryable() {
        struct Panicky;
        #[async_trait]
        impl Handler for Panicky {
            async fn handle(&self, _ctx: &mut MessageContext, _msg: &mut Message) {
                panic!("boom");
            }
        }

        let chain = Chain::new(vec![Arc::new(RecoverWithRetry)], Arc::new(Panicky));
        let mut ctx = MessageContext::default();
        let mut msg = sample_message();
        chain.run(&mut ctx, &mut msg).await;

        assert!(msg.error.is_some());
        assert!(retry::is_retryable(msg.error.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn store_trace_and_user_id_enrich_context() {
        struct Noop;
        #[async_trait]
        impl Handler for Noop {
            async fn handle(&self, _ctx: &mut MessageContext, _msg: &mut Message) {}
        }

        let chain = Chain::new(
            vec![Arc::new(StoreTraceIdIntoContext), Arc::new(StoreUserIdIntoContext)],
            Arc::new(Noop),
        );
        let mut ctx = MessageContext::default();
        let mut msg = sample_message();
        msg.header.trace_id = "trace-xyz".to_string();
        msg.header.user_id = "user-xyz".to_string();

        chain.run(&mut ctx, &mut msg).await;

        assert_eq!(ctx.trace_id, "trace-xyz");
        assert_eq!(ctx.user_id, "user-xyz");
    }

    struct FakeRepublisher {
        published: Mutex<Vec<Message>>,
    }

    impl FakeRepublisher {
        fn new() -> Self {
            FakeRepublisher { published: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl crate::producer::Republish for FakeRepublisher {
        async fn publish(&self, msg: Message) -> Result<(), crate::error::PublishError> {
            self.published.lock().unwrap().push(msg);
            Ok(())
        }
    }

    struct AlwaysRetryable;

    #[async_trait]
    impl Handler for AlwaysRetryable {
        async fn handle(&self, _ctx: &mut MessageContext, msg: &mut Message) {
            msg.error = Some(retry::retryable(std::io::Error::new(std::io::ErrorKind::Other, "transient")));
        }
    }

    #[tokio::test]
    async fn retry_with_error_increments_count_and_rewrites_routing_key() {
        let republisher = Arc::new(FakeRepublisher::new());
        let mw = RetryWithError::new(republisher.clone(), 2, Vec::new());
        let chain = Chain::new(vec![Arc::new(mw)], Arc::new(AlwaysRetryable));

        let mut ctx = MessageContext::default();
        let mut msg = sample_message();
        msg.routing_key = "k".to_string();

        chain.run(&mut ctx, &mut msg).await;

        assert_eq!(msg.header.x_retry_count, 1);
        assert_eq!(msg.routing_key, "k.delayed");
        assert_eq!(republisher.published.lock().unwrap().len(), 1);
        assert_eq!(republisher.published.lock().unwrap()[0].header.x_retry_count, 1);
    }

    #[tokio::test]
    async fn retry_with_error_rejects_once_budget_is_exhausted() {
        let republisher = Arc::new(FakeRepublisher::new());

        let mut msg = sample_message();
        msg.routing_key = "k".to_string();
        let mut observed_counts = Vec::new();

        for _ in 0..3 {
            let mw = RetryWithError::new(republisher.clone(), 2, Vec::new());
            let chain = Chain::new(vec![Arc::new(mw)], Arc::new(AlwaysRetryable));
            let mut ctx = MessageContext::default();
            msg.error = None;
            msg.status = MessageStatus::Ack;
            chain.run(&mut ctx, &mut msg).await;
            observed_counts.push(msg.header.x_retry_count);
        }

        assert_eq!(observed_counts, vec![1, 2, 3]);
        assert_eq!(msg.status, MessageStatus::Reject);
        assert_eq!(republisher.published.lock().unwrap().len(), 2);
    }
}
