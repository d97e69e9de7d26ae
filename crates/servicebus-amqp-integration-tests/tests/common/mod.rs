//! Common utilities for the end-to-end tests
//!
//! This module provides:
//! - One-time tracing setup driven by `RUST_LOG`
//! - A namespace connected to a fresh in-memory broker
//! - Handlers reporting what they received

use chrono::{Duration as ChronoDuration, Utc};
use servicebus_amqp::{
    Handler, HandlerFunc, InMemoryBroker, Message, Namespace, OperationContext, RetryPolicy,
    ServiceBusConfig, StaticTokenProvider, Token, TokenType,
};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};

static TRACING: Once = Once::new();

/// Install a test subscriber once per test binary
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "servicebus_amqp=debug".into());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Configuration with fast retries and no background claim refresh
pub fn test_config() -> ServiceBusConfig {
    let mut config = ServiceBusConfig::new("contoso");
    config.claim_refresh_interval_seconds = None;
    config.retry.claims = RetryPolicy::new(3, Duration::from_millis(5));
    config.retry.lock_renewal = RetryPolicy::new(3, Duration::from_millis(5));
    config.retry.management = RetryPolicy::new(3, Duration::from_millis(5));
    config
}

/// Broker plus a namespace dialed through it
pub struct TestNamespace {
    pub broker: InMemoryBroker,
    pub namespace: Arc<Namespace>,
}

#[allow(dead_code)]
pub async fn connect() -> TestNamespace {
    connect_with(test_config()).await
}

#[allow(dead_code)]
pub async fn connect_with(config: ServiceBusConfig) -> TestNamespace {
    init_tracing();
    let broker = InMemoryBroker::new();
    let token = Token::new(
        TokenType::Jwt,
        "integration-token",
        Utc::now() + ChronoDuration::hours(1),
    );
    let namespace = Namespace::connect(
        &OperationContext::background(),
        config,
        &broker,
        Arc::new(StaticTokenProvider::new(token)),
    )
    .await
    .expect("namespace should connect to the in-memory broker");

    TestNamespace { broker, namespace }
}

/// Handler forwarding every message to a channel; bodies equal to "fail" are rejected
#[allow(dead_code)]
pub fn forwarding_handler() -> (Arc<dyn Handler>, UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = HandlerFunc(move |_ctx: OperationContext, message: Message| {
        let tx = tx.clone();
        async move {
            let failed = message.data.as_ref() == b"fail";
            let id = message.id.clone();
            let _ = tx.send(message);
            if failed {
                anyhow::bail!("message {} marked as failing", id);
            }
            Ok(())
        }
    });
    (Arc::new(handler), rx)
}

/// Next message from a forwarding handler, failing the test after five seconds
#[allow(dead_code)]
pub async fn next_message(rx: &mut UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("handler was not called in time")
        .expect("handler channel closed")
}
