use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::consumer::connection_initializer::ConnectionInitializer;
use crate::consumer::delivery_channel_manager::DeliveryChannelManager;
use crate::consumer::middleware::{Handler, Middleware};
use crate::consumer::registry::ConsumerRegistry;
use crate::error::EventbusError;

/// Top-level entry point wiring the connection, delivery channels and
/// worker registry together, and running the recovery state machine that
/// watches both the connection's and the delivery channels' error signals.
/// Grounded on `consumer/facade/facade.go`: `AddQueueAndConsumer`,
/// `Connect`, `StartConsuming`, `regainConnection`, `ShutDown`, `Wait`.
pub struct Consumer {
    initializer: Arc<ConnectionInitializer>,
    delivery_channels: Arc<DeliveryChannelManager>,
    registry: Arc<ConsumerRegistry>,
    queues: Mutex<Vec<String>>,
    reconnecting: AtomicBool,
    recovery_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Consumer {
    pub fn new(config: Config) -> Arc<Self> {
        let initializer = Arc::new(ConnectionInitializer::new(config));
        let delivery_channels = Arc::new(DeliveryChannelManager::new(initializer.clone()));
        let registry = Arc::new(ConsumerRegistry::new(delivery_channels.clone()));

        Arc::new(Consumer {
            initializer,
            delivery_channels,
            registry,
            queues: Mutex::new(Vec::new()),
            reconnecting: AtomicBool::new(false),
            recovery_task: Mutex::new(None),
        })
    }

    /// Registers `handler`, wrapped by `middlewares`, against `queue`, run
    /// by `replication` concurrent workers. Must be called before
    /// `start_consuming`.
    pub async fn add_queue_and_consumer(
        &self,
        queue: impl Into<String>,
        handler: Arc<dyn Handler>,
        middlewares: Vec<Arc<dyn Middleware>>,
        replication: usize,
    ) {
        let queue = queue.into();
        self.queues.lock().await.push(queue.clone());
        self.registry
            .assign_consumer_to_queue(queue, handler, middlewares, replication)
            .await;
    }

    /// Dials the broker and sets up QoS. Must be called before
    /// `start_consuming`.
    pub async fn connect(&self) -> Result<(), EventbusError> {
        self.initializer.connect().await
    }

    /// Opens delivery channels and spawns workers for every registered
    /// queue, then starts the background recovery watcher.
    pub async fn start_consuming(self: &Arc<Self>) -> Result<(), EventbusError> {
        let queues = self.queues.lock().await.clone();
        self.registry.start_consuming(&queues).await?;

        self.initializer.reconnect_with_connection_error();
        self.spawn_recovery_loop().await;
        Ok(())
    }

    /// Runs until the consumer is shut down. Intended for a binary's main
    /// task to `.await` after `start_consuming` returns.
    pub async fn wait(self: &Arc<Self>) {
        let task = self.recovery_task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Tears down workers and the connection. Idempotent: safe to call more
    /// than once, and tolerant of a channel/connection that is already
    /// gone.
    pub async fn shut_down(&self) {
        self.registry.shut_down().await;
        self.delivery_channels.close().await;
        if let Err(e) = self.initializer.shutdown().await {
            error!("error during shutdown: {}", e);
        }
        if let Some(task) = self.recovery_task.lock().await.take() {
            task.abort();
        }
    }

    /// Watches both the connection-initializer's reconnect-success channel
    /// and the delivery-channel-manager's connection-error channel, and
    /// runs `regain_connection` whenever either fires. The `reconnecting`
    /// flag guards against two concurrent recovery attempts racing each
    /// other when both streams fire close together.
    async fn spawn_recovery_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut reconnect_success = this.initializer.reconnect_successful_notifier_channel().await;
            let mut connection_error = this.delivery_channels.get_connection_error_chan().await;

            loop {
                tokio::select! {
                    msg = reconnect_success.recv() => {
                        if msg.is_none() {
                            return;
                        }
                        this.regain_connection().await;
                    }
                    msg = connection_error.recv() => {
                        if msg.is_none() {
                            return;
                        }
                        this.regain_connection().await;
                    }
                }
            }
        });
        *self.recovery_task.lock().await = Some(task);
    }

    /// Reinitialises every registered queue's delivery channel against the
    /// (by now reconnected) broker connection. A no-op if a recovery is
    /// already underway.
    async fn regain_connection(&self) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        info!("regaining connection: reinitialising delivery channels");
        if let Err(e) = self.delivery_channels.reconnect_delivery_channel().await {
            error!("failed to reinitialise delivery channels: {}", e);
        } else {
            self.delivery_channels.connection_error_solved();
            info!("delivery channels reinitialised");
        }

        self.reconnecting.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            host: "localhost".to_string(),
            port: "5672".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            prefetch_count: 50,
        }
    }

    #[tokio::test]
    async fn regain_connection_is_a_no_op_while_already_reconnecting() {
        let consumer = Consumer::new(test_config());
        consumer.reconnecting.store(true, Ordering::SeqCst);
        consumer.regain_connection().await;
        assert!(consumer.reconnecting.load(Ordering::SeqCst));
    }
}
