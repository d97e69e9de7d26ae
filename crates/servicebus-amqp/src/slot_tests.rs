//! Tests for lazily attached link slots.

use super::*;
use std::sync::atomic::AtomicUsize;

#[tokio::test]
async fn test_link_is_built_once() {
    // Arrange
    let slot = LinkSlot::<u32>::new("orders");
    let ctx = OperationContext::background();
    let builds = AtomicUsize::new(0);

    // Act
    let first = slot
        .get_or_open(&ctx, || async {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        })
        .await
        .unwrap();
    let second = slot
        .get_or_open(&ctx, || async {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(8)
        })
        .await
        .unwrap();

    // Assert
    assert_eq!((*first, *second), (7, 7));
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_build_leaves_slot_empty() {
    let slot = LinkSlot::<u32>::new("orders");
    let ctx = OperationContext::background();

    let failed = slot
        .get_or_open(&ctx, || async { Err(ServiceBusError::retryable("attach refused")) })
        .await;
    let retried = slot.get_or_open(&ctx, || async { Ok(3) }).await.unwrap();

    assert!(failed.is_err());
    assert_eq!(*retried, 3);
}

#[tokio::test]
async fn test_close_hands_over_stored_link() {
    let slot = LinkSlot::<u32>::new("orders");
    let ctx = OperationContext::background();
    slot.get_or_open(&ctx, || async { Ok(5) }).await.unwrap();

    let closed = slot.close().await;

    assert_eq!(closed.as_deref(), Some(&5));
    assert!(slot.is_closed());
    assert!(matches!(
        slot.get_or_open(&ctx, || async { Ok(6) }).await,
        Err(ServiceBusError::LinkClosed { entity_path }) if entity_path == "orders"
    ));
}

/// Verify that a caller already waiting for the slot when close starts does
/// not build a link.
#[tokio::test]
async fn test_waiting_caller_does_not_build_after_close() {
    // Arrange
    let slot = LinkSlot::<u32>::new("orders");
    let ctx = OperationContext::background();
    let builds = AtomicUsize::new(0);
    let held = slot.link.lock().await;

    // Act
    let (opened, closed) = tokio::join!(
        slot.get_or_open(&ctx, || async {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(9)
        }),
        async {
            drop(held);
            slot.close().await
        }
    );

    // Assert
    assert!(matches!(opened, Err(ServiceBusError::LinkClosed { .. })));
    assert!(closed.is_none());
    assert_eq!(builds.load(Ordering::SeqCst), 0);
}
