use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::BasicConsumeOptions;
use lapin::types::FieldTable;
use log::error;
use tokio::sync::{mpsc, watch, Mutex};

use crate::consumer::connection_initializer::ConnectionInitializer;
use crate::error::EventbusError;

struct QueueEntry {
    sender: mpsc::Sender<Delivery>,
    receiver: Arc<Mutex<mpsc::Receiver<Delivery>>>,
}

/// Owns a `queue-name -> internal-delivery channel` mapping. For each
/// registered queue it runs one pump task reading the broker's raw
/// delivery stream and forwarding each delivery onto the internal channel.
/// Grounded on `rustlib/rabbitmq/src/subscriber.rs`'s `consumer.for_each_*`
/// pump, split out from the worker body so the internal channel can
/// outlive a single broker-connection epoch.
///
/// The internal channel has capacity 1 rather than 0: tokio has no true
/// rendezvous channel, and a 1-slot buffer gives the same effective
/// backpressure (the pump can get at most one delivery ahead of a worker)
/// without requiring a bespoke handshake primitive.
pub struct DeliveryChannelManager {
    initializer: Arc<ConnectionInitializer>,
    channels: Mutex<HashMap<String, QueueEntry>>,
    done_tx: Mutex<watch::Sender<bool>>,
    having_connection_error: AtomicBool,
    connection_error_tx: mpsc::UnboundedSender<()>,
    connection_error_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl DeliveryChannelManager {
    pub fn new(initializer: Arc<ConnectionInitializer>) -> Self {
        let (done_tx, _) = watch::channel(false);
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        DeliveryChannelManager {
            initializer,
            channels: Mutex::new(HashMap::new()),
            done_tx: Mutex::new(done_tx),
            having_connection_error: AtomicBool::new(false),
            connection_error_tx: err_tx,
            connection_error_rx: Mutex::new(Some(err_rx)),
        }
    }

    /// Creates the internal channel if absent (it survives reconnects) and
    /// always spawns a fresh pump against the freshly obtained broker
    /// channel. Callers must invoke this only once per queue per
    /// broker-connection epoch.
    pub async fn init_delivery_channel_for_queue(&self, queue: &str) -> Result<(), EventbusError> {
        let amqp_channel = self.initializer.get_amqp_channel().await?;

        let consumer = amqp_channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| EventbusError::DeliveryInit {
                queue: queue.to_string(),
                source: e,
            })?;

        let sender = {
            let mut channels = self.channels.lock().await;
            match channels.get(queue) {
                Some(entry) => entry.sender.clone(),
                None => {
                    let (tx, rx) = mpsc::channel(1);
                    channels.insert(
                        queue.to_string(),
                        QueueEntry {
                            sender: tx.clone(),
                            receiver: Arc::new(Mutex::new(rx)),
                        },
                    );
                    tx
                }
            }
        };

        let mut done_rx = self.done_tx.lock().await.subscribe();
        let queue_name = queue.to_string();

        tokio::spawn(async move {
            let mut consumer = consumer;
            loop {
                tokio::select! {
                    changed = done_rx.changed() => {
                        if changed.is_err() || *done_rx.borrow() {
                            return;
                        }
                    }
                    item = consumer.next() => {
                        match item {
                            Some(Ok(delivery)) => {
                                if sender.send(delivery).await.is_err() {
                                    return;
                                }
                            }
                            Some(Err(e)) => {
                                error!("rabbitmq: delivery error on queue {}: {}", queue_name, e);
                            }
                            None => return,
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Read-only view of the internal channel for a queue, or `None` if it
    /// has not been initialised.
    pub async fn get_delivery_chan(&self, queue: &str) -> Option<Arc<Mutex<mpsc::Receiver<Delivery>>>> {
        self.channels
            .lock()
            .await
            .get(queue)
            .map(|entry| entry.receiver.clone())
    }

    /// Closes the current pumps and reinitialises every known queue against
    /// the freshly opened channel. Fails with the first per-queue init
    /// error. The internal channels themselves are left untouched so
    /// workers holding a handle from before the reconnect keep working.
    pub async fn reconnect_delivery_channel(&self) -> Result<(), EventbusError> {
        self.close().await;
        {
            let (tx, _rx) = watch::channel(false);
            *self.done_tx.lock().await = tx;
        }

        let queues: Vec<String> = self.channels.lock().await.keys().cloned().collect();
        for queue in queues {
            self.init_delivery_channel_for_queue(&queue).await?;
        }
        Ok(())
    }

    /// Signals the done channel observed by all pumps.
    pub async fn close(&self) {
        let tx = self.done_tx.lock().await;
        let _ = tx.send(true);
    }

    /// Single-writer notification that a worker observed a channel-closed
    /// error during ack. Coalesces repeated notifications into one
    /// pending signal.
    pub fn notified_connection_error(&self) {
        if self
            .having_connection_error
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.connection_error_tx.send(());
        }
    }

    /// Clears the outstanding-error flag, rearming the notifier.
    pub fn connection_error_solved(&self) {
        self.having_connection_error.store(false, Ordering::SeqCst);
    }

    /// The observable stream the facade watches to trigger recovery. Must
    /// be taken exactly once.
    pub async fn get_connection_error_chan(&self) -> mpsc::UnboundedReceiver<()> {
        self.connection_error_rx
            .lock()
            .await
            .take()
            .expect("get_connection_error_chan already taken")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

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
    async fn notified_connection_error_coalesces_repeated_calls() {
        let init = Arc::new(ConnectionInitializer::new(test_config()));
        let mgr = DeliveryChannelManager::new(init);
        mgr.notified_connection_error();
        mgr.notified_connection_error();
        mgr.notified_connection_error();

        let mut rx = mgr.get_connection_error_chan().await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "second notification should have been coalesced");

        mgr.connection_error_solved();
        mgr.notified_connection_error();
        assert!(rx.try_recv().is_ok(), "a fresh notification after clearing should fire again");
    }

    #[tokio::test]
    async fn unknown_queue_has_no_delivery_chan() {
        let init = Arc::new(ConnectionInitializer::new(test_config()));
        let mgr = DeliveryChannelManager::new(init);
        assert!(mgr.get_delivery_chan("nope").await.is_none());
    }
}
