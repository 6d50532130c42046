use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lapin::message::Delivery;
use log::{error, warn};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::consumer::acker::DeliveryAcker;
use crate::consumer::delivery_channel_manager::DeliveryChannelManager;
use crate::consumer::middleware::{Chain, Handler, Middleware};
use crate::context::MessageContext;
use crate::error::EventbusError;
use crate::message::{Header, Message, MessageStatus, Payload};

struct Registration {
    chain: Arc<Chain>,
    replication: usize,
}

/// Maps queue names to their composed middleware chain and worker count, and
/// spawns/owns the worker tasks that pull deliveries off the delivery
/// channel manager's internal channels. Grounded on
/// `rabbitmq-subscriber/vendor/cleanapp_rustlib/src/rabbitmq/subscriber.rs`'s
/// `process_messages`, split from connection setup the way the teacher's
/// `Subscriber::start` is split from `Subscriber::new`.
pub struct ConsumerRegistry {
    delivery_channels: Arc<DeliveryChannelManager>,
    registrations: Mutex<HashMap<String, Registration>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerRegistry {
    pub fn new(delivery_channels: Arc<DeliveryChannelManager>) -> Self {
        ConsumerRegistry {
            delivery_channels,
            registrations: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Registers the middleware-wrapped handler for a queue. Must be called
    /// before `start_consuming`.
    pub async fn assign_consumer_to_queue(
        &self,
        queue: impl Into<String>,
        handler: Arc<dyn Handler>,
        middlewares: Vec<Arc<dyn Middleware>>,
        replication: usize,
    ) {
        let chain = Arc::new(Chain::new(middlewares, handler));
        self.registrations
            .lock()
            .await
            .insert(queue.into(), Registration { chain, replication });
    }

    /// Opens the delivery channel for each named queue and spawns
    /// `replication` worker tasks per queue. Fails with `NoConsumerForQueue`
    /// if a queue was never registered.
    pub async fn start_consuming(&self, queues: &[String]) -> Result<(), EventbusError> {
        for queue in queues {
            let replication = {
                let registrations = self.registrations.lock().await;
                registrations
                    .get(queue)
                    .ok_or_else(|| EventbusError::NoConsumerForQueue(queue.clone()))?
                    .replication
            };

            self.delivery_channels
                .init_delivery_channel_for_queue(queue)
                .await?;

            let receiver = self
                .delivery_channels
                .get_delivery_chan(queue)
                .await
                .expect("just initialised");

            let chain = {
                let registrations = self.registrations.lock().await;
                registrations.get(queue).unwrap().chain.clone()
            };

            let mut workers = self.workers.lock().await;
            for _ in 0..replication.max(1) {
                let receiver = receiver.clone();
                let chain = chain.clone();
                let delivery_channels = self.delivery_channels.clone();
                let queue_name = queue.clone();
                workers.push(tokio::spawn(async move {
                    worker_loop(queue_name, receiver, chain, delivery_channels).await;
                }));
            }
        }
        Ok(())
    }

    /// Aborts every spawned worker task. Idempotent.
    pub async fn shut_down(&self) {
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            worker.abort();
        }
    }
}

async fn worker_loop(
    queue: String,
    receiver: Arc<Mutex<tokio::sync::mpsc::Receiver<Delivery>>>,
    chain: Arc<Chain>,
    delivery_channels: Arc<DeliveryChannelManager>,
) {
    loop {
        let delivery = {
            let mut rx = receiver.lock().await;
            match rx.recv().await {
                Some(d) => d,
                None => return,
            }
        };

        let mut msg = decode_delivery(&delivery);
        let mut ctx = MessageContext::from_header(&msg.header);

        chain.run(&mut ctx, &mut msg).await;

        dispose(&queue, &delivery, msg.status, &delivery_channels).await;
    }
}

/// Decodes a raw broker delivery into a `Message`. The body is decoded
/// first: a body that fails to parse as JSON produces
/// `Message::invalid_json()` rather than propagating, since the delivery
/// still needs a disposition and an unparseable body will never become
/// parseable on redelivery. A header that fails to decode does not
/// discard the body — the resulting `Message` is populated normally
/// (id/exchange/routing_key/payload all present) with the decode error
/// attached to `error` and `status = Ack`, so `LogFailedMessage` can
/// surface it instead of the delivery vanishing as an opaque invalid-json
/// placeholder.
fn decode_delivery(delivery: &Delivery) -> Message {
    let body: Value = match serde_json::from_slice(&delivery.data) {
        Ok(v) => v,
        Err(e) => {
            warn!("rabbitmq: payload is not valid json: {}", e);
            return Message::invalid_json();
        }
    };

    let entity_id = body
        .get("entityId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let data = body.get("data").cloned().unwrap_or(Value::Null);

    let (header, header_error) =
        match Header::from_field_table(&delivery.properties.headers().clone().unwrap_or_default()) {
            Ok(h) => (h, None),
            Err(e) => {
                warn!("rabbitmq: header decode failed: {}", e);
                let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(e);
                (Header::default(), Some(boxed))
            }
        };

    Message {
        id: delivery.delivery_tag.to_string(),
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        header,
        payload: Payload { entity_id, data },
        status: MessageStatus::Ack,
        error: header_error,
    }
}

/// Applies the worker's decided disposition to the broker. A failed
/// ack/nack/reject is assumed to mean the broker channel died underneath
/// us: notify the delivery channel manager so the facade's recovery loop
/// kicks in, then retry the same disposition call every 2 seconds. This
/// matches the teacher's retry-on-ack-failure loop in `process_messages`;
/// it deliberately blocks this worker slot rather than dropping the
/// delivery, since there is no way to know whether the ack reached the
/// broker.
async fn dispose(
    queue: &str,
    acker: &dyn DeliveryAcker,
    status: MessageStatus,
    delivery_channels: &DeliveryChannelManager,
) {
    loop {
        let result = match status {
            MessageStatus::Ack => acker.ack().await,
            MessageStatus::Nack => acker.nack().await,
            MessageStatus::NackRequeue => acker.nack_requeue().await,
            MessageStatus::Reject => acker.reject().await,
        };

        match result {
            Ok(()) => {
                delivery_channels.connection_error_solved();
                return;
            }
            Err(e) => {
                error!(
                    "rabbitmq: failed to apply disposition {:?} on queue {}: {}",
                    status, queue, e
                );
                delivery_channels.notified_connection_error();
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeAcker {
        ack_calls: AtomicUsize,
        nack_calls: AtomicUsize,
        reject_calls: AtomicUsize,
        fail_first_n_acks: AtomicUsize,
    }

    impl FakeAcker {
        fn new(fail_first_n_acks: usize) -> Self {
            FakeAcker {
                ack_calls: AtomicUsize::new(0),
                nack_calls: AtomicUsize::new(0),
                reject_calls: AtomicUsize::new(0),
                fail_first_n_acks: AtomicUsize::new(fail_first_n_acks),
            }
        }
    }

    #[async_trait]
    impl DeliveryAcker for FakeAcker {
        async fn ack(&self) -> Result<(), lapin::Error> {
            self.ack_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first_n_acks.load(Ordering::SeqCst) > 0 {
                self.fail_first_n_acks.fetch_sub(1, Ordering::SeqCst);
                return Err(closed_channel_error());
            }
            Ok(())
        }

        async fn nack(&self) -> Result<(), lapin::Error> {
            self.nack_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nack_requeue(&self) -> Result<(), lapin::Error> {
            self.nack_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reject(&self) -> Result<(), lapin::Error> {
            self.reject_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn closed_channel_error() -> lapin::Error {
        lapin::Error::IOError(Arc::new(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "channel closed",
        )))
    }

    fn test_config() -> crate::config::Config {
        crate::config::Config {
            host: "localhost".to_string(),
            port: "5672".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            prefetch_count: 50,
        }
    }

    #[tokio::test]
    async fn dispose_acks_once_on_success() {
        let init = Arc::new(crate::consumer::connection_initializer::ConnectionInitializer::new(
            test_config(),
        ));
        let dcm = DeliveryChannelManager::new(init);
        let acker = FakeAcker::new(0);

        dispose("q", &acker, MessageStatus::Ack, &dcm).await;

        assert_eq!(acker.ack_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispose_retries_failed_ack_and_notifies_connection_error() {
        let init = Arc::new(crate::consumer::connection_initializer::ConnectionInitializer::new(
            test_config(),
        ));
        let dcm = DeliveryChannelManager::new(init);
        let acker = FakeAcker::new(1);

        let mut rx = dcm.get_connection_error_chan().await;

        dispose("q", &acker, MessageStatus::Ack, &dcm).await;

        assert_eq!(acker.ack_calls.load(Ordering::SeqCst), 2);
        assert!(rx.try_recv().is_ok(), "a connection error notification should have fired");
    }

    #[tokio::test]
    async fn dispose_maps_nack_and_reject_to_the_right_call() {
        let init = Arc::new(crate::consumer::connection_initializer::ConnectionInitializer::new(
            test_config(),
        ));
        let dcm = DeliveryChannelManager::new(init);

        let acker = FakeAcker::new(0);
        dispose("q", &acker, MessageStatus::Nack, &dcm).await;
        assert_eq!(acker.nack_calls.load(Ordering::SeqCst), 1);

        let acker = FakeAcker::new(0);
        dispose("q", &acker, MessageStatus::Reject, &dcm).await;
        assert_eq!(acker.reject_calls.load(Ordering::SeqCst), 1);
    }
}
