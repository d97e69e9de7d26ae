//! End-to-end tests for management operations through a queue
//!
//! The in-memory broker has no management node of its own; each test
//! installs a responder on `orders/$management` playing the service's part.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{connect, forwarding_handler, next_message, TestNamespace};
use servicebus_amqp::transports::status_reply;
use servicebus_amqp::{
    AmqpMessage, AmqpValue, JsonMessageCodec, Message, MessageCodec, OperationContext,
    PeekOptions, QueueOptions, SendOptions, ServiceBusError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const MANAGEMENT: &str = "orders/$management";

fn operation(request: &AmqpMessage) -> String {
    request
        .application_property("operation")
        .and_then(AmqpValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn body(request: &AmqpMessage) -> HashMap<String, AmqpValue> {
    request
        .value
        .as_ref()
        .and_then(AmqpValue::as_map)
        .cloned()
        .unwrap_or_default()
}

fn reply_with(code: i32, key: &str, value: AmqpValue) -> AmqpMessage {
    let mut reply = status_reply(code, "scripted");
    let mut map = HashMap::new();
    map.insert(key.to_string(), value);
    reply.value = Some(AmqpValue::Map(map));
    reply
}

fn peeked(sequence_number: i64) -> AmqpValue {
    let mut message = Message::new(format!("peeked-{}", sequence_number)).to_amqp();
    message.annotations.insert(
        "x-opt-sequence-number".to_string(),
        AmqpValue::Long(sequence_number),
    );
    let mut entry = HashMap::new();
    entry.insert(
        "message".to_string(),
        AmqpValue::Binary(JsonMessageCodec.encode(&message).unwrap()),
    );
    AmqpValue::Map(entry)
}

/// Verify that a received peek-lock message can have its lock renewed and
/// picks up the new expiry.
#[tokio::test]
async fn test_renew_lock_of_received_message() {
    let TestNamespace { broker, namespace } = connect().await;
    let renewed_until = Utc::now() + ChronoDuration::minutes(5);
    broker.set_responder(MANAGEMENT, move |_: &AmqpMessage| {
        reply_with(
            200,
            "expirations",
            AmqpValue::List(vec![AmqpValue::Timestamp(renewed_until)]),
        )
    });
    let ctx = OperationContext::background();
    let queue = namespace.queue("orders", QueueOptions::new());
    queue.send(&ctx, Message::new("work"), SendOptions::new()).await.unwrap();

    let (handler, mut rx) = forwarding_handler();
    queue.receive_one(&ctx, handler.as_ref()).await.unwrap();
    let mut messages = vec![next_message(&mut rx).await];
    let token = messages[0].lock_token.expect("peek-lock delivery has a lock token");
    assert!(messages[0].system_properties.locked_until.is_some());

    queue.renew_locks(&ctx, &mut messages).await.unwrap();

    assert_eq!(messages[0].system_properties.locked_until, Some(renewed_until));
    let request = &broker.sent_to(MANAGEMENT)[0];
    assert_eq!(operation(request), "com.microsoft:renew-lock");
    assert_eq!(
        body(request).get("lock-tokens"),
        Some(&AmqpValue::List(vec![AmqpValue::Uuid(token)]))
    );
}

/// Verify that scheduled messages can be cancelled with the sequence numbers
/// the service assigned.
#[tokio::test]
async fn test_schedule_then_cancel() {
    let TestNamespace { broker, namespace } = connect().await;
    broker.set_responder(MANAGEMENT, |request: &AmqpMessage| {
        match operation(request).as_str() {
            "com.microsoft:schedule-message" => {
                let count = body(request)
                    .get("messages")
                    .and_then(AmqpValue::as_list)
                    .map(|messages| messages.len())
                    .unwrap_or(0) as i64;
                let numbers = (0..count).map(|i| AmqpValue::Long(100 + i)).collect();
                reply_with(200, "sequence-numbers", AmqpValue::List(numbers))
            }
            _ => status_reply(200, "OK"),
        }
    });
    let ctx = OperationContext::background();
    let queue = namespace.queue("orders", QueueOptions::new());
    let mut messages = vec![Message::new("later-1"), Message::new("later-2")];

    let sequence_numbers = queue
        .schedule_at(&ctx, Utc::now() + ChronoDuration::hours(1), &mut messages)
        .await
        .unwrap();
    assert_eq!(sequence_numbers, vec![100, 101]);

    queue.cancel_scheduled(&ctx, &sequence_numbers).await.unwrap();

    let requests = broker.sent_to(MANAGEMENT);
    assert_eq!(requests.len(), 2);
    assert_eq!(operation(&requests[1]), "com.microsoft:cancel-scheduled-message");
    assert_eq!(
        body(&requests[1]).get("sequence-numbers"),
        Some(&AmqpValue::List(vec![AmqpValue::Long(100), AmqpValue::Long(101)]))
    );
}

/// Verify that peeking yields messages in sequence order and reports an
/// exhausted entity as no messages.
#[tokio::test]
async fn test_peek_until_exhausted() {
    let TestNamespace { broker, namespace } = connect().await;
    broker.set_responder(MANAGEMENT, |request: &AmqpMessage| {
        let from = body(request)
            .get("from-sequence-number")
            .and_then(AmqpValue::as_i64)
            .unwrap_or_default();
        if from == 0 {
            reply_with(
                200,
                "messages",
                AmqpValue::List(vec![peeked(3), peeked(1), peeked(2)]),
            )
        } else {
            status_reply(204, "No messages")
        }
    });
    let ctx = OperationContext::background();
    let queue = namespace.queue("orders", QueueOptions::new());

    let mut iterator = queue.peek(PeekOptions::new()).unwrap();
    let mut sequences = Vec::new();
    for _ in 0..3 {
        let message = iterator.next(&ctx).await.unwrap();
        sequences.push(message.system_properties.sequence_number.unwrap());
    }
    let exhausted = iterator.next(&ctx).await;

    assert_eq!(sequences, vec![1, 2, 3]);
    assert!(matches!(exhausted, Err(ServiceBusError::NoMessages)));
    assert_eq!(iterator.last_sequence_number(), 4);
}

/// Verify that a bulk completion reports only the token the service refused.
#[tokio::test]
async fn test_complete_batch_reports_refused_token() {
    let TestNamespace { broker, namespace } = connect().await;
    let refused = Uuid::new_v4();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    broker.set_responder(MANAGEMENT, move |request: &AmqpMessage| {
        let tokens = body(request).get("lock-tokens").cloned();
        recorder.lock().unwrap().push(tokens.clone());
        if tokens == Some(AmqpValue::List(vec![AmqpValue::Uuid(refused)])) {
            status_reply(410, "Lock lost")
        } else {
            status_reply(200, "OK")
        }
    });
    let ctx = OperationContext::background();
    let queue = namespace.queue("orders", QueueOptions::new());
    let accepted = Uuid::new_v4();

    let errors = queue
        .complete_batch(&ctx, vec![accepted, refused])
        .await
        .unwrap_err();

    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors.get(&refused),
        Some(ServiceBusError::Rpc { code: 410, .. })
    ));
    assert_eq!(seen.lock().unwrap().len(), 2);
}
