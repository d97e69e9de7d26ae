//! Tests for the topic facade.

use super::*;
use crate::amqp::{AmqpMessage, AmqpValue};
use crate::receiver::{Handler, HandlerFunc, MessageReceiver};
use crate::subscription::SubscriptionOptions;
use crate::testing::StubHost;
use crate::transports::{status_reply, InMemoryBroker, SettlementOutcome};

const TOPIC: &str = "events";

fn config() -> ServiceBusConfig {
    let mut config = ServiceBusConfig::new("contoso");
    config.claim_refresh_interval_seconds = None;
    config
}

fn new_topic(broker: &InMemoryBroker) -> (Arc<StubHost>, Topic) {
    let host = StubHost::new(broker);
    let topic = Topic::new(host.clone(), TOPIC, &config());
    (host, topic)
}

fn accept_all() -> impl Handler {
    HandlerFunc(|_ctx: OperationContext, _message: Message| async { Ok::<_, anyhow::Error>(()) })
}

/// Verify that the sender attaches once, to the topic path.
#[tokio::test]
async fn test_sender_attaches_on_first_send() {
    // Arrange
    let broker = InMemoryBroker::new();
    let (host, topic) = new_topic(&broker);
    assert!(host.claims().is_empty());
    let ctx = OperationContext::background();

    // Act
    topic.send(&ctx, Message::new("one"), SendOptions::new()).await.unwrap();
    topic.send(&ctx, Message::new("two"), SendOptions::new()).await.unwrap();

    // Assert
    assert_eq!(host.claims(), vec![TOPIC.to_string()]);
    assert_eq!(broker.sessions_created(), 1);
    assert_eq!(broker.pending(TOPIC), 2);
}

#[tokio::test]
async fn test_send_messages_batches_into_one_envelope() {
    let broker = InMemoryBroker::new();
    let (_host, topic) = new_topic(&broker);
    let messages = (0..3).map(|i| Message::new(format!("e{}", i))).collect();

    topic
        .send_messages(&OperationContext::background(), messages)
        .await
        .unwrap();

    assert_eq!(broker.sent_to(TOPIC).len(), 1);
    assert_eq!(broker.pending(TOPIC), 3);
}

#[tokio::test]
async fn test_trait_object_sends_to_topic() {
    let broker = InMemoryBroker::new();
    let (_host, topic) = new_topic(&broker);

    let sender: &dyn MessageSender = &topic;
    sender
        .send(&OperationContext::background(), Message::new("via trait"), SendOptions::new())
        .await
        .unwrap();

    assert_eq!(broker.pending(TOPIC), 1);
}

/// Verify that a subscription built from the topic reads beneath the topic
/// path.
#[tokio::test]
async fn test_subscription_path_is_under_topic() {
    // Arrange
    let broker = InMemoryBroker::new();
    let (host, topic) = new_topic(&broker);
    broker.enqueue("events/Subscriptions/audit", Message::new("copy").to_amqp());
    let ctx = OperationContext::background();

    // Act
    let subscription = topic.subscription("audit", SubscriptionOptions::new());
    let receiver: &dyn MessageReceiver = &subscription;
    receiver.receive_one(&ctx, &accept_all()).await.unwrap();

    // Assert
    assert_eq!(subscription.entity_path(), "events/Subscriptions/audit");
    assert_eq!(host.claims(), vec!["events/Subscriptions/audit".to_string()]);
    assert_eq!(broker.settlements()[0].outcome, SettlementOutcome::Accepted);
}

#[tokio::test]
async fn test_schedule_goes_to_topic_management_node() {
    let broker = InMemoryBroker::new();
    broker.set_responder("events/$management", |_: &AmqpMessage| {
        let mut reply = status_reply(200, "OK");
        reply.value = Some(AmqpValue::Map(
            [(
                "sequence-numbers".to_string(),
                AmqpValue::List(vec![AmqpValue::Long(42)]),
            )]
            .into_iter()
            .collect(),
        ));
        reply
    });
    let (_host, topic) = new_topic(&broker);
    let mut messages = vec![Message::new("later")];

    let sequence_numbers = topic
        .schedule_at(
            &OperationContext::background(),
            Utc::now() + chrono::Duration::minutes(10),
            &mut messages,
        )
        .await
        .unwrap();

    assert_eq!(sequence_numbers, vec![42]);
    assert_eq!(broker.sent_to("events/$management").len(), 1);
}

#[tokio::test]
async fn test_send_after_close_fails() {
    let broker = InMemoryBroker::new();
    let (host, topic) = new_topic(&broker);
    let ctx = OperationContext::background();

    topic.close(&ctx).await.unwrap();
    let result = topic.send(&ctx, Message::new("late"), SendOptions::new()).await;

    assert!(matches!(
        result,
        Err(ServiceBusError::LinkClosed { entity_path }) if entity_path == TOPIC
    ));
    assert!(host.claims().is_empty());
}

#[tokio::test]
async fn test_close_closes_attached_sender() {
    let broker = InMemoryBroker::new();
    let (_host, topic) = new_topic(&broker);
    let ctx = OperationContext::background();
    topic.send(&ctx, Message::new("one"), SendOptions::new()).await.unwrap();
    assert_eq!(broker.open_sessions(), 1);

    topic.close(&ctx).await.unwrap();

    assert_eq!(broker.open_sessions(), 0);
}
