use eventbus_client::{Config, Consumer};

fn test_config() -> Config {
    Config {
        host: "localhost".to_string(),
        port: "5672".to_string(),
        username: "guest".to_string(),
        password: "guest".to_string(),
        prefetch_count: 50,
    }
}

/// Testable property: "Idempotent shutdown. ShutDown invoked twice returns
/// without error the second time; no further messages are delivered after
/// the first." Exercised here without a broker since `shut_down` must
/// tolerate a connection that was never established.
#[tokio::test]
async fn shut_down_twice_is_a_no_op_the_second_time() {
    let consumer = Consumer::new(test_config());
    consumer.shut_down().await;
    consumer.shut_down().await;
}
