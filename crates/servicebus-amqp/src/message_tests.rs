//! Tests for message mapping and send options.

use super::*;
use chrono::TimeZone;

fn received(tag: Option<Bytes>) -> AmqpMessage {
    let mut amqp = AmqpMessage::new();
    amqp.delivery_tag = tag;
    amqp.properties.message_id = Some("m-1".to_string());
    amqp.properties.group_id = Some("session-a".to_string());
    amqp.properties.group_sequence = Some(7);
    amqp.properties.subject = Some("invoice".to_string());
    amqp.data = vec![Bytes::from_static(b"payload")];
    amqp.header = Some(MessageHeader {
        delivery_count: 2,
        ..MessageHeader::default()
    });
    amqp
}

mod from_transport {
    use super::*;

    /// Verify that the lock token is read from a 16 byte delivery tag in
    /// little-endian GUID order.
    #[test]
    fn test_lock_token_from_delivery_tag() {
        let token = Uuid::new_v4();
        let tag = Bytes::copy_from_slice(&token.to_bytes_le());

        let message = Message::from_amqp(received(Some(tag)));

        assert_eq!(message.lock_token, Some(token));
        assert_eq!(message.id, "m-1");
        assert_eq!(message.group_id.as_deref(), Some("session-a"));
        assert_eq!(message.group_sequence, Some(7));
        assert_eq!(message.label.as_deref(), Some("invoice"));
        assert_eq!(message.delivery_count, 2);
        assert_eq!(message.data, Bytes::from_static(b"payload"));
    }

    #[test]
    fn test_lock_token_annotation_wins_over_tag() {
        let annotated = Uuid::new_v4();
        let mut amqp = received(Some(Bytes::copy_from_slice(
            &Uuid::new_v4().to_bytes_le(),
        )));
        amqp.annotations.insert(
            LOCK_TOKEN_ANNOTATION.to_string(),
            AmqpValue::Uuid(annotated),
        );

        assert_eq!(Message::from_amqp(amqp).lock_token, Some(annotated));
    }

    #[test]
    fn test_short_delivery_tag_has_no_lock_token() {
        let message = Message::from_amqp(received(Some(Bytes::from_static(b"1"))));
        assert_eq!(message.lock_token, None);
    }

    /// Verify that broker annotations populate the system properties.
    #[test]
    fn test_system_properties_from_annotations() {
        let locked_until = Utc.with_ymd_and_hms(2030, 5, 1, 12, 0, 0).unwrap();
        let mut amqp = received(None);
        amqp.annotations.insert(
            SEQUENCE_NUMBER_ANNOTATION.to_string(),
            AmqpValue::Long(99),
        );
        amqp.annotations.insert(
            LOCKED_UNTIL_ANNOTATION.to_string(),
            AmqpValue::Timestamp(locked_until),
        );
        amqp.annotations.insert(
            PARTITION_KEY_ANNOTATION.to_string(),
            AmqpValue::from("p-1"),
        );

        let message = Message::from_amqp(amqp);

        assert_eq!(message.system_properties.sequence_number, Some(99));
        assert_eq!(message.system_properties.locked_until, Some(locked_until));
        assert_eq!(
            message.system_properties.partition_key.as_deref(),
            Some("p-1")
        );
    }

    #[test]
    fn test_multiple_data_sections_are_joined() {
        let mut amqp = received(None);
        amqp.data = vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")];

        assert_eq!(Message::from_amqp(amqp).data, Bytes::from_static(b"abcd"));
    }
}

mod to_transport {
    use super::*;

    #[test]
    fn test_fields_map_onto_properties() {
        let message = Message::new("body")
            .with_id("id-1")
            .with_group_id("g")
            .with_label("l")
            .with_correlation_id("c")
            .with_ttl(Duration::from_secs(30))
            .with_property("tenant", "contoso");

        let amqp = message.to_amqp();

        assert_eq!(amqp.message_id(), Some("id-1"));
        assert_eq!(amqp.properties.group_id.as_deref(), Some("g"));
        assert_eq!(amqp.properties.subject.as_deref(), Some("l"));
        assert_eq!(amqp.properties.correlation_id.as_deref(), Some("c"));
        assert_eq!(amqp.header.and_then(|h| h.ttl_ms), Some(30_000));
        assert_eq!(
            amqp.application_properties.get("tenant"),
            Some(&AmqpValue::from("contoso"))
        );
        assert_eq!(amqp.data, vec![Bytes::from_static(b"body")]);
    }

    /// Verify that unexposed sections of a received message survive a resend,
    /// while the delivery tag does not.
    #[test]
    fn test_round_trip_keeps_raw_sections() {
        let mut amqp = received(Some(Bytes::from_static(b"tag")));
        amqp.annotations
            .insert("x-custom".to_string(), AmqpValue::from("kept"));

        let amqp = Message::from_amqp(amqp).to_amqp();

        assert_eq!(amqp.annotation("x-custom"), Some(&AmqpValue::from("kept")));
        assert!(amqp.delivery_tag.is_none());
        assert_eq!(amqp.header.map(|h| h.delivery_count), Some(2));
    }

    #[test]
    fn test_empty_id_is_not_sent() {
        assert_eq!(Message::new("x").to_amqp().message_id(), None);
    }
}

mod send_options {
    use super::*;

    #[test]
    fn test_options_override_stamped_fields() {
        let mut message = Message::new("x").with_group_id("g");
        message.group_sequence = Some(3);

        SendOptions::new()
            .with_message_id("explicit")
            .without_session_id()
            .apply(&mut message);

        assert_eq!(message.id, "explicit");
        assert_eq!(message.group_id, None);
        assert_eq!(message.group_sequence, None);
    }

    #[test]
    fn test_default_options_change_nothing() {
        let mut message = Message::new("x").with_id("kept").with_group_id("g");
        SendOptions::default().apply(&mut message);

        assert_eq!(message.id, "kept");
        assert_eq!(message.group_id.as_deref(), Some("g"));
    }
}
