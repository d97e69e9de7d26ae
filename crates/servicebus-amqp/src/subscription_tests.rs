//! Tests for the subscription facade.

use super::*;
use crate::amqp::{AmqpMessage, AmqpValue};
use crate::entity::subscription_path;
use crate::receiver::HandlerFunc;
use crate::testing::StubHost;
use crate::transports::{status_reply, InMemoryBroker, SettlementOutcome};

const PATH: &str = "events/Subscriptions/audit";

fn config() -> ServiceBusConfig {
    let mut config = ServiceBusConfig::new("contoso");
    config.claim_refresh_interval_seconds = None;
    config
}

fn new_subscription(
    broker: &InMemoryBroker,
    options: SubscriptionOptions,
) -> (Arc<StubHost>, Subscription) {
    let host = StubHost::new(broker);
    let subscription = Subscription::new(
        host.clone(),
        subscription_path("events", "audit"),
        &config(),
        options,
    );
    (host, subscription)
}

fn accept_all() -> impl Handler {
    HandlerFunc(|_ctx: OperationContext, _message: Message| async { Ok::<_, anyhow::Error>(()) })
}

mod receiving {
    use super::*;

    /// Verify that the receiver attaches on first use and is reused.
    #[tokio::test]
    async fn test_receiver_attaches_once() {
        // Arrange
        let broker = InMemoryBroker::new();
        let (host, subscription) = new_subscription(&broker, SubscriptionOptions::new());
        broker.enqueue(PATH, Message::new("one").to_amqp());
        broker.enqueue(PATH, Message::new("two").to_amqp());
        let ctx = OperationContext::background();

        // Act
        subscription.receive_one(&ctx, &accept_all()).await.unwrap();
        subscription.receive_one(&ctx, &accept_all()).await.unwrap();

        // Assert
        assert_eq!(host.claims(), vec![PATH.to_string()]);
        assert_eq!(broker.sessions_created(), 1);
        assert_eq!(broker.pending(PATH), 0);
    }

    #[tokio::test]
    async fn test_receive_until_cancelled() {
        let broker = InMemoryBroker::new();
        let (_host, subscription) = new_subscription(&broker, SubscriptionOptions::new());
        broker.enqueue(PATH, Message::new("only").to_amqp());
        let ctx = OperationContext::background();
        let stop = ctx.clone();
        let handler = HandlerFunc(move |_ctx: OperationContext, _message: Message| {
            let stop = stop.clone();
            async move {
                stop.cancel();
                Ok::<_, anyhow::Error>(())
            }
        });

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            subscription.receive(&ctx, Arc::new(handler)),
        )
        .await
        .unwrap();

        assert!(result.is_ok());
        assert_eq!(broker.settlements()[0].outcome, SettlementOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_dead_letter_receiver_reads_subscription_sub_queue() {
        let broker = InMemoryBroker::new();
        let (host, subscription) = new_subscription(&broker, SubscriptionOptions::new());
        let dead_letters = "events/Subscriptions/audit/$DeadLetterQueue";
        broker.enqueue(dead_letters, Message::new("poison").to_amqp());
        let ctx = OperationContext::background();

        let receiver = subscription.new_dead_letter_receiver(&ctx).await.unwrap();
        receiver.receive_one(&ctx, &accept_all()).await.unwrap();

        assert_eq!(host.claims(), vec![dead_letters.to_string()]);
        assert_eq!(broker.settlements()[0].address, dead_letters);
        receiver.close(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_transfer_dead_letter_receiver_path() {
        let broker = InMemoryBroker::new();
        let (host, subscription) = new_subscription(&broker, SubscriptionOptions::new());

        subscription
            .new_transfer_dead_letter_receiver(&OperationContext::background())
            .await
            .unwrap();

        assert_eq!(
            host.claims(),
            vec!["events/Subscriptions/audit/$Transfer/$DeadLetterQueue".to_string()]
        );
    }

    #[tokio::test]
    async fn test_accept_session_on_subscription() {
        let broker = InMemoryBroker::new();
        let (_host, subscription) = new_subscription(&broker, SubscriptionOptions::new());
        broker.enqueue(PATH, Message::new("b").with_id("b1").with_group_id("b").to_amqp());
        broker.enqueue(PATH, Message::new("a").with_id("a1").with_group_id("a").to_amqp());
        let ctx = OperationContext::background();

        let session = subscription.accept_session(&ctx, "a").await.unwrap();
        session.receive_one(&ctx, &accept_all()).await.unwrap();

        assert_eq!(session.entity_path(), PATH);
        assert_eq!(broker.settlements()[0].message.message_id(), Some("a1"));
        assert_eq!(broker.pending(PATH), 1);
        session.close(&ctx).await.unwrap();
    }
}

mod management {
    use super::*;

    #[tokio::test]
    async fn test_operations_use_subscription_management_node() {
        let broker = InMemoryBroker::new();
        broker.set_responder("events/Subscriptions/audit/$management", |_: &AmqpMessage| {
            status_reply(204, "No content")
        });
        let options = SubscriptionOptions::new().with_receive_mode(ReceiveMode::ReceiveAndDelete);
        let (_host, subscription) = new_subscription(&broker, options);

        let result = subscription
            .receive_deferred(&OperationContext::background(), &[3])
            .await;

        assert!(matches!(result, Err(ServiceBusError::NoMessages)));
        let requests = broker.sent_to("events/Subscriptions/audit/$management");
        let body = requests[0].value.as_ref().and_then(AmqpValue::as_map).unwrap();
        assert_eq!(body.get("receiver-settle-mode"), Some(&AmqpValue::UInt(0)));
    }
}

mod closing {
    use super::*;

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        // Arrange
        let broker = InMemoryBroker::new();
        let (host, subscription) = new_subscription(&broker, SubscriptionOptions::new());
        let ctx = OperationContext::background();

        // Act
        subscription.close(&ctx).await.unwrap();

        // Assert
        let received = subscription.receive_one(&ctx, &accept_all()).await;
        assert!(matches!(
            received,
            Err(ServiceBusError::LinkClosed { entity_path }) if entity_path == PATH
        ));
        let session = subscription.accept_session(&ctx, "a").await;
        assert!(matches!(session, Err(ServiceBusError::LinkClosed { .. })));
        assert!(host.claims().is_empty());
    }

    #[tokio::test]
    async fn test_close_closes_attached_receiver() {
        let broker = InMemoryBroker::new();
        let (_host, subscription) = new_subscription(&broker, SubscriptionOptions::new());
        broker.enqueue(PATH, Message::new("one").to_amqp());
        let ctx = OperationContext::background();
        subscription.receive_one(&ctx, &accept_all()).await.unwrap();
        assert_eq!(broker.open_sessions(), 1);

        subscription.close(&ctx).await.unwrap();

        assert_eq!(broker.open_sessions(), 0);
    }
}
