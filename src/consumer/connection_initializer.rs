use std::sync::Arc;
use std::time::Duration;

use lapin::{options::BasicQosOptions, Channel, Connection, ConnectionProperties};
use log::{error, info, warn};
use tokio::sync::{mpsc, Mutex};

use crate::config::Config;
use crate::error::EventbusError;

/// `new -> connected`, `connected -> disconnected`, `disconnected ->
/// connected`, any -> `shutdown`. A shutdown connection never re-enters
/// `connected` (enforced by every transition below checking for it first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connected,
    Disconnected,
    Shutdown,
}

struct Inner {
    conn: Option<Connection>,
    channel: Option<Channel>,
    status: ConnectionState,
}

/// Owns the broker connection and its single channel. Grounded on
/// `rustlib/rabbitmq/src/subscriber.rs::Subscriber::new`'s
/// dial/create_channel/qos sequence, pulled out into a standalone
/// component so the delivery channel manager and facade can share one
/// connection across reconnects.
pub struct ConnectionInitializer {
    config: Config,
    inner: Mutex<Inner>,
    reconnect_success_tx: mpsc::UnboundedSender<()>,
    reconnect_success_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl ConnectionInitializer {
    pub fn new(config: Config) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        ConnectionInitializer {
            config,
            inner: Mutex::new(Inner {
                conn: None,
                channel: None,
                status: ConnectionState::New,
            }),
            reconnect_success_tx: tx,
            reconnect_success_rx: Mutex::new(Some(rx)),
        }
    }

    /// Idempotent when already connected. Fails with `DialError`,
    /// `ChannelOpenError` or `QosError`.
    pub async fn connect(&self) -> Result<(), EventbusError> {
        let mut inner = self.inner.lock().await;
        if inner.status == ConnectionState::Connected {
            return Ok(());
        }

        let conn = Connection::connect(&self.config.get_url(), ConnectionProperties::default())
            .await
            .map_err(|e| EventbusError::DialError(e.to_string()))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| EventbusError::ChannelOpenError(e.to_string()))?;

        channel
            .basic_qos(
                self.config.prefetch_count,
                BasicQosOptions { global: false },
            )
            .await
            .map_err(|e| EventbusError::QosError(e.to_string()))?;

        inner.conn = Some(conn);
        inner.channel = Some(channel);
        inner.status = ConnectionState::Connected;
        Ok(())
    }

    /// Safe to call from any state; no effect if already shutdown.
    pub async fn shutdown(&self) -> Result<(), EventbusError> {
        let mut inner = self.inner.lock().await;
        if inner.status == ConnectionState::Shutdown {
            return Ok(());
        }

        if let Some(channel) = inner.channel.take() {
            if let Err(e) = channel.close(200, "shutdown").await {
                warn!("channel close during shutdown failed: {}", e);
            }
        }
        if let Some(conn) = inner.conn.take() {
            if let Err(e) = conn.close(200, "shutdown").await {
                warn!("connection close during shutdown failed: {}", e);
            }
        }
        inner.status = ConnectionState::Shutdown;
        Ok(())
    }

    pub async fn status(&self) -> ConnectionState {
        self.inner.lock().await.status
    }

    /// Fails with `Disconnected` if status is not `connected`.
    pub async fn get_amqp_channel(&self) -> Result<Channel, EventbusError> {
        let inner = self.inner.lock().await;
        if inner.status != ConnectionState::Connected {
            return Err(EventbusError::Disconnected);
        }
        Ok(inner
            .channel
            .clone()
            .expect("status Connected implies a channel is present"))
    }

    /// Installs a background watcher on the connection's close
    /// notification. On observing a close while not shutdown, redials on a
    /// 1-second interval until it succeeds, then emits one event on the
    /// reconnect-success channel and re-arms itself. Requires `self` behind
    /// an `Arc` since the watcher outlives the calling stack frame.
    pub fn reconnect_with_connection_error(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let conn_closed = {
                    let inner = this.inner.lock().await;
                    if inner.status == ConnectionState::Shutdown {
                        return;
                    }
                    match inner.conn.as_ref() {
                        Some(conn) => {
                            let (tx, rx) = tokio::sync::oneshot::channel();
                            let tx = std::sync::Mutex::new(Some(tx));
                            conn.on_error(move |err| {
                                if let Some(tx) = tx.lock().unwrap().take() {
                                    let _ = tx.send(err);
                                }
                            });
                            rx
                        }
                        None => return,
                    }
                };

                let close_err = match conn_closed.await {
                    Ok(e) => e,
                    Err(_) => return,
                };
                error!("connection closed by broker: {}", close_err);

                {
                    let mut inner = this.inner.lock().await;
                    if inner.status == ConnectionState::Shutdown {
                        return;
                    }
                    inner.status = ConnectionState::Disconnected;
                    inner.conn = None;
                    inner.channel = None;
                }

                loop {
                    info!("reconnecting");
                    match this.connect().await {
                        Ok(()) => {
                            info!("reconnected");
                            let _ = this.reconnect_success_tx.send(());
                            break;
                        }
                        Err(e) => {
                            warn!("reconnect failed, reason: {}", e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });
    }

    /// The observable stream of successful reconnect events. Must be
    /// taken exactly once (by the facade); a second call panics.
    pub async fn reconnect_successful_notifier_channel(&self) -> mpsc::UnboundedReceiver<()> {
        self.reconnect_success_rx
            .lock()
            .await
            .take()
            .expect("reconnect_successful_notifier_channel already taken")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_initializer_starts_in_new_state() {
        let config = Config {
            host: "localhost".to_string(),
            port: "5672".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            prefetch_count: 50,
        };
        let init = ConnectionInitializer::new(config);
        assert_eq!(init.status().await, ConnectionState::New);
    }

    #[tokio::test]
    async fn get_channel_fails_when_not_connected() {
        let config = Config {
            host: "localhost".to_string(),
            port: "5672".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            prefetch_count: 50,
        };
        let init = ConnectionInitializer::new(config);
        let err = init.get_amqp_channel().await.unwrap_err();
        assert!(matches!(err, EventbusError::Disconnected));
    }
}
