//! End-to-end tests for sending and receiving through a namespace
//!
//! These tests verify:
//! - Session group stamping across sends
//! - Listener dispatch order and settlement
//! - Rejection, redelivery and dead-lettering
//! - Batched sends arriving as individual messages
//! - Sender recovery renegotiating the claim

mod common;

use common::{connect, forwarding_handler, next_message, TestNamespace};
use servicebus_amqp::transports::SettlementOutcome;
use servicebus_amqp::{AmqpValue, Message, OperationContext, QueueOptions, SendOptions};
use std::collections::HashSet;

/// Verify that messages sent one by one are dispatched in order, carry one
/// session group with sequence numbers from 1, and are accepted.
#[tokio::test]
async fn test_send_then_listen() {
    let TestNamespace { broker, namespace } = connect().await;
    let ctx = OperationContext::background();
    let queue = namespace.queue("orders", QueueOptions::new());

    for body in ["one", "two", "three"] {
        queue.send(&ctx, Message::new(body), SendOptions::new()).await.unwrap();
    }

    let (handler, mut rx) = forwarding_handler();
    let handle = queue.listen(&ctx, handler).await.unwrap();
    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(next_message(&mut rx).await);
    }
    handle.close().await;

    let bodies: Vec<String> = received
        .iter()
        .map(|m| String::from_utf8(m.data.to_vec()).unwrap())
        .collect();
    assert_eq!(bodies, ["one", "two", "three"]);

    let sequences: Vec<Option<u32>> = received.iter().map(|m| m.group_sequence).collect();
    assert_eq!(sequences, vec![Some(1), Some(2), Some(3)]);
    let groups: HashSet<_> = received.iter().map(|m| m.group_id.clone()).collect();
    assert_eq!(groups.len(), 1);

    let outcomes: Vec<_> = broker.settlements().iter().map(|s| s.outcome).collect();
    assert_eq!(outcomes, vec![SettlementOutcome::Accepted; 3]);
    assert_eq!(broker.pending("orders"), 0);

    queue.close(&ctx).await.unwrap();
    namespace.close(&ctx).await.unwrap();
}

/// Verify that a message failing every delivery ends up on the dead-letter
/// sub-queue, where a dead-letter receiver can read it.
#[tokio::test]
async fn test_failing_message_is_dead_lettered() {
    let TestNamespace { broker, namespace } = connect().await;
    broker.set_max_delivery_count(2);
    let ctx = OperationContext::background();
    let queue = namespace.queue("orders", QueueOptions::new());
    queue.send(&ctx, Message::new("fail"), SendOptions::new()).await.unwrap();

    let (handler, mut rx) = forwarding_handler();
    let handle = queue.listen(&ctx, handler).await.unwrap();
    let first = next_message(&mut rx).await;
    let second = next_message(&mut rx).await;
    handle.close().await;

    assert_eq!(first.id, second.id);
    assert_eq!(broker.pending("orders"), 0);
    assert_eq!(broker.pending("orders/$DeadLetterQueue"), 1);

    let dead_letters = queue.new_dead_letter_receiver(&ctx).await.unwrap();
    let (handler, mut rx) = forwarding_handler();
    let dead_letter_ctx = ctx.child();
    let listener = dead_letters.listen(&dead_letter_ctx, handler).await.unwrap();
    let dead_lettered = next_message(&mut rx).await;
    dead_letter_ctx.cancel();
    listener.done().await;

    assert_eq!(dead_lettered.id, first.id);
    assert_eq!(
        dead_lettered.user_properties.get("DeadLetterReason"),
        Some(&AmqpValue::from("MaxDeliveryCountExceeded"))
    );
    dead_letters.close(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_batched_send_arrives_as_individual_messages() {
    let TestNamespace { broker, namespace } = connect().await;
    let ctx = OperationContext::background();
    let queue = namespace.queue("orders", QueueOptions::new());
    let messages = (0..5).map(|i| Message::new(format!("item-{}", i))).collect();

    queue.send_messages(&ctx, messages).await.unwrap();

    assert_eq!(broker.sent_to("orders").len(), 1);
    let (handler, mut rx) = forwarding_handler();
    let handle = queue.listen(&ctx, handler).await.unwrap();
    let mut bodies = Vec::new();
    for _ in 0..5 {
        let message = next_message(&mut rx).await;
        bodies.push(String::from_utf8(message.data.to_vec()).unwrap());
    }
    handle.close().await;

    let expected: Vec<String> = (0..5).map(|i| format!("item-{}", i)).collect();
    assert_eq!(bodies, expected);
}

/// Verify that recovering a sender negotiates a new claim and starts a new
/// session group.
#[tokio::test]
async fn test_sender_recovery_starts_new_group() {
    let TestNamespace { broker, namespace } = connect().await;
    let ctx = OperationContext::background();
    let sender = namespace.new_sender(&ctx, "orders").await.unwrap();

    sender.send(&ctx, Message::new("before"), SendOptions::new()).await.unwrap();
    sender.recover(&ctx).await.unwrap();
    sender.send(&ctx, Message::new("after"), SendOptions::new()).await.unwrap();

    let sent = broker.sent_to("orders");
    assert_eq!(sent.len(), 2);
    assert_ne!(sent[0].properties.group_id, sent[1].properties.group_id);
    assert_eq!(sent[1].properties.group_sequence, Some(1));
    assert_eq!(broker.sent_to("$cbs").len(), 2);

    sender.close(&ctx).await.unwrap();
}

#[tokio::test]
async fn test_receive_and_delete_settles_nothing() {
    use servicebus_amqp::ReceiveMode;

    let TestNamespace { broker, namespace } = connect().await;
    let ctx = OperationContext::background();
    let options = QueueOptions::new().with_receive_mode(ReceiveMode::ReceiveAndDelete);
    let queue = namespace.queue("orders", options);
    queue.send(&ctx, Message::new("fail"), SendOptions::new()).await.unwrap();

    let (handler, mut rx) = forwarding_handler();
    queue.receive_one(&ctx, handler.as_ref()).await.unwrap();
    let message = next_message(&mut rx).await;

    assert_eq!(message.data.as_ref(), b"fail");
    assert!(broker.settlements().is_empty());
    assert_eq!(broker.pending("orders"), 0);
}
