use async_trait::async_trait;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions};

/// The broker disposition surface a worker drives after the middleware
/// chain completes. Pulled out as a trait (rather than calling
/// `lapin::message::Delivery` methods directly, the way the teacher's
/// `process_messages` does) so the worker loop's ack-mapping logic — the
/// property under test in `registry::tests` — can run against a recording
/// fake without a live broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), lapin::Error>;
    async fn nack(&self) -> Result<(), lapin::Error>;
    async fn nack_requeue(&self) -> Result<(), lapin::Error>;
    async fn reject(&self) -> Result<(), lapin::Error>;
}

#[async_trait]
impl DeliveryAcker for Delivery {
    async fn ack(&self) -> Result<(), lapin::Error> {
        self.acker.ack(BasicAckOptions { multiple: false }).await
    }

    async fn nack(&self) -> Result<(), lapin::Error> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await
    }

    async fn nack_requeue(&self) -> Result<(), lapin::Error> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: true,
            })
            .await
    }

    async fn reject(&self) -> Result<(), lapin::Error> {
        self.acker
            .reject(BasicRejectOptions { requeue: false })
            .await
    }
}
