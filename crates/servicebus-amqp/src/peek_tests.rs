//! Tests for peek pages and the peek iterator.

use super::*;
use crate::amqp::JsonMessageCodec;
use std::collections::HashMap;
use std::sync::Mutex;

/// Pager serving scripted pages and recording each request
#[derive(Default)]
struct ScriptedPager {
    pages: Mutex<VecDeque<Vec<AmqpMessage>>>,
    requests: Mutex<Vec<(i64, u32)>>,
}

impl ScriptedPager {
    fn with_pages(pages: Vec<Vec<AmqpMessage>>) -> Self {
        Self {
            pages: Mutex::new(pages.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<(i64, u32)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagePager for ScriptedPager {
    async fn peek_page(
        &self,
        _ctx: &OperationContext,
        from_sequence_number: i64,
        count: u32,
    ) -> Result<Vec<AmqpMessage>, ServiceBusError> {
        self.requests
            .lock()
            .unwrap()
            .push((from_sequence_number, count));
        Ok(self.pages.lock().unwrap().pop_front().unwrap_or_default())
    }
}

fn sequenced(sequence_number: i64) -> AmqpMessage {
    let mut message = Message::new(format!("body-{}", sequence_number)).to_amqp();
    message.annotations.insert(
        "x-opt-sequence-number".to_string(),
        AmqpValue::Long(sequence_number),
    );
    message
}

fn body(entries: Vec<AmqpValue>) -> AmqpValue {
    let mut map = HashMap::new();
    map.insert("messages".to_string(), AmqpValue::List(entries));
    AmqpValue::Map(map)
}

fn entry(value: AmqpValue) -> AmqpValue {
    let mut map = HashMap::new();
    map.insert("message".to_string(), value);
    AmqpValue::Map(map)
}

mod options {
    use super::*;

    #[test]
    fn test_default_page_size_applies() {
        let pager = ScriptedPager::default();
        let iterator =
            PeekIterator::new(&pager, PeekOptions::new(), DEFAULT_PEEK_PAGE_SIZE).unwrap();

        assert_eq!(iterator.page_size(), 10);
        assert_eq!(iterator.last_sequence_number(), 0);
        assert!(!iterator.is_done());
    }

    #[test]
    fn test_page_size_set_twice_is_rejected() {
        let pager = ScriptedPager::default();
        let options = PeekOptions::new().with_page_size(5).with_page_size(1);

        let result = PeekIterator::new(&pager, options, DEFAULT_PEEK_PAGE_SIZE);

        assert!(matches!(
            result,
            Err(ServiceBusError::Validation(ValidationError::InvalidFormat { .. }))
        ));
    }

    #[test]
    fn test_zero_page_size_is_rejected() {
        let pager = ScriptedPager::default();
        let options = PeekOptions::new().with_page_size(0);

        let result = PeekIterator::new(&pager, options, DEFAULT_PEEK_PAGE_SIZE);

        assert!(matches!(
            result,
            Err(ServiceBusError::Validation(ValidationError::OutOfRange { .. }))
        ));
    }
}

mod iteration {
    use super::*;

    /// Verify that an unordered page is yielded in sequence order and the next
    /// page starts one past its highest sequence number.
    #[tokio::test]
    async fn test_page_is_reordered() {
        let pager = ScriptedPager::with_pages(vec![
            vec![sequenced(7), sequenced(3), sequenced(5)],
            vec![sequenced(8)],
        ]);
        let options = PeekOptions::new().with_page_size(3).from_sequence_number(2);
        let mut iterator = PeekIterator::new(&pager, options, DEFAULT_PEEK_PAGE_SIZE).unwrap();
        let ctx = OperationContext::background();

        let mut sequences = Vec::new();
        for _ in 0..3 {
            let message = iterator.next(&ctx).await.unwrap();
            sequences.push(message.system_properties.sequence_number.unwrap());
        }
        assert_eq!(sequences, vec![3, 5, 7]);
        assert_eq!(iterator.last_sequence_number(), 8);

        let fourth = iterator.next(&ctx).await.unwrap();
        assert_eq!(fourth.system_properties.sequence_number, Some(8));
        assert_eq!(pager.requests(), vec![(2, 3), (8, 3)]);
    }

    #[tokio::test]
    async fn test_empty_page_is_no_messages() {
        let pager = ScriptedPager::default();
        let mut iterator = PeekIterator::new(&pager, PeekOptions::new(), 4).unwrap();

        let result = iterator.next(&OperationContext::background()).await;

        assert!(matches!(result, Err(ServiceBusError::NoMessages)));
        assert!(!iterator.is_done());
    }

    /// Verify that a page of older messages never moves the cursor back.
    #[tokio::test]
    async fn test_cursor_never_regresses() {
        let pager = ScriptedPager::with_pages(vec![vec![sequenced(4)], vec![sequenced(1)]]);
        let options = PeekOptions::new().with_page_size(1).from_sequence_number(10);
        let mut iterator = PeekIterator::new(&pager, options, DEFAULT_PEEK_PAGE_SIZE).unwrap();
        let ctx = OperationContext::background();

        iterator.next(&ctx).await.unwrap();
        assert_eq!(iterator.last_sequence_number(), 10);
        iterator.next(&ctx).await.unwrap();
        assert_eq!(iterator.last_sequence_number(), 10);
    }
}

mod decoding {
    use super::*;

    #[test]
    fn test_decodes_entries() {
        let codec = JsonMessageCodec;
        let encoded = codec.encode(&sequenced(1)).unwrap();
        let token = Uuid::new_v4();
        let mut with_token = HashMap::new();
        with_token.insert("message".to_string(), AmqpValue::Binary(encoded.clone()));
        with_token.insert("lock-token".to_string(), AmqpValue::Uuid(token));
        let value = body(vec![entry(AmqpValue::Binary(encoded)), AmqpValue::Map(with_token)]);

        let response = MessageListResponse::decode(Some(&value)).unwrap();
        let messages = response.into_messages(&codec).unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].data, Bytes::from("body-1"));
        assert_eq!(messages[1].lock_token, Some(token));
    }

    #[test]
    fn test_body_must_be_map() {
        let result = MessageListResponse::decode(Some(&AmqpValue::from("nope")));

        assert!(matches!(
            result,
            Err(ServiceBusError::IncorrectType { field, expected, actual })
                if field == "value" && expected == "map" && actual == "string"
        ));
        assert!(matches!(
            MessageListResponse::decode(None),
            Err(ServiceBusError::IncorrectType { .. })
        ));
    }

    #[test]
    fn test_missing_messages_field() {
        let result = MessageListResponse::decode(Some(&AmqpValue::Map(HashMap::new())));

        assert!(matches!(
            result,
            Err(ServiceBusError::MissingField { field }) if field == "messages"
        ));
    }

    #[test]
    fn test_messages_must_be_list() {
        let mut map = HashMap::new();
        map.insert("messages".to_string(), AmqpValue::Int(3));

        let result = MessageListResponse::decode(Some(&AmqpValue::Map(map)));

        assert!(matches!(
            result,
            Err(ServiceBusError::IncorrectType { field, actual, .. })
                if field == "messages" && actual == "int"
        ));
    }

    #[test]
    fn test_entry_must_be_map_with_message() {
        let not_a_map = body(vec![AmqpValue::from("entry")]);
        assert!(matches!(
            MessageListResponse::decode(Some(&not_a_map)),
            Err(ServiceBusError::IncorrectType { field, expected, .. })
                if field == "message" && expected == "map"
        ));

        let empty_entry = body(vec![AmqpValue::Map(HashMap::new())]);
        assert!(matches!(
            MessageListResponse::decode(Some(&empty_entry)),
            Err(ServiceBusError::MissingField { field }) if field == "message"
        ));
    }

    #[test]
    fn test_non_binary_payload_is_malformed() {
        let value = body(vec![entry(AmqpValue::from("not bytes"))]);

        let result = MessageListResponse::decode(Some(&value));

        assert!(matches!(result, Err(ServiceBusError::MalformedMessage { .. })));
    }
}
