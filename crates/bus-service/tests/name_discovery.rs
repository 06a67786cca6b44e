//! Integration tests for advertised-name resolution.
//!
//! Covers:
//! - Found/lost bookkeeping per transport
//! - Listener notification order per name
//! - Ownership changes and owner disconnects
//! - Loopback advertise/discover through the discovery pump

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bus_service::actors::BusEvent;
use bus_service::transport::LoopbackTransport;
use bus_service::BusError;
use bus_test_utils::{MockTransport, RecordingListener, TestAttachment};
use common::types::TransportMask;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn found(name: &str, transport: TransportMask, prefix: &str) -> BusEvent {
    BusEvent::FoundAdvertisedName {
        name: name.to_string(),
        transport,
        prefix: prefix.to_string(),
    }
}

fn lost(name: &str, transport: TransportMask, prefix: &str) -> BusEvent {
    BusEvent::LostAdvertisedName {
        name: name.to_string(),
        transport,
        prefix: prefix.to_string(),
    }
}

#[tokio::test]
async fn test_found_then_lost_over_tcp() {
    let bus = TestAttachment::new().build(MockTransport::accepting());
    let listener = RecordingListener::accepting();
    bus.register_bus_listener(listener.clone()).unwrap();

    bus.record_found("org.example.Foo", TransportMask::TCP, "org.example")
        .unwrap();
    assert_eq!(bus.lookup_name("org.example.Foo"), TransportMask::TCP);

    bus.record_lost("org.example.Foo", TransportMask::TCP, "org.example")
        .unwrap();
    assert!(bus.lookup_name("org.example.Foo").is_empty());
    assert!(bus.advertised_name("org.example.Foo").is_none());

    let events = listener.wait_for_events(2, WAIT).await;
    assert_eq!(
        events,
        vec![
            found("org.example.Foo", TransportMask::TCP, "org.example"),
            lost("org.example.Foo", TransportMask::TCP, "org.example"),
        ]
    );
}

#[tokio::test]
async fn test_loss_is_per_transport() {
    let bus = TestAttachment::new().build(MockTransport::accepting());

    bus.record_found("org.example.Multi", TransportMask::TCP, "org.")
        .unwrap();
    bus.record_found("org.example.Multi", TransportMask::UDP, "org.")
        .unwrap();
    assert_eq!(bus.lookup_name("org.example.Multi"), TransportMask::IP);

    bus.record_lost("org.example.Multi", TransportMask::TCP, "org.")
        .unwrap();
    assert_eq!(bus.lookup_name("org.example.Multi"), TransportMask::UDP);
    assert!(bus.advertised_name("org.example.Multi").is_some());

    bus.record_lost("org.example.Multi", TransportMask::UDP, "org.")
        .unwrap();
    assert!(bus.lookup_name("org.example.Multi").is_empty());
    assert!(bus.status().advertised_names.is_empty());
}

#[tokio::test]
async fn test_lost_for_unknown_name_still_notifies() {
    let bus = TestAttachment::new().build(MockTransport::accepting());
    let listener = RecordingListener::accepting();
    bus.register_bus_listener(listener.clone()).unwrap();

    bus.record_lost("org.example.Ghost", TransportMask::TCP, "org.")
        .unwrap();
    assert!(bus.lookup_name("org.example.Ghost").is_empty());

    let events = listener.wait_for_events(1, WAIT).await;
    assert_eq!(
        events,
        vec![lost("org.example.Ghost", TransportMask::TCP, "org.")]
    );
}

#[tokio::test]
async fn test_invalid_name_rejected_without_event() {
    let bus = TestAttachment::new().build(MockTransport::accepting());
    let listener = RecordingListener::accepting();
    bus.register_bus_listener(listener.clone()).unwrap();

    for bad in ["", "nodots", "org..example", "1org.example", "org.exa mple"] {
        let result = bus.record_found(bad, TransportMask::TCP, "org.");
        assert!(
            matches!(result, Err(BusError::InvalidName(_))),
            "{bad:?} should be rejected"
        );
    }

    bus.flush_events().await.unwrap();
    assert!(listener.events().is_empty());
    assert!(bus.status().advertised_names.is_empty());
}

#[tokio::test]
async fn test_owner_change_and_disconnect() {
    let bus = TestAttachment::new().build(MockTransport::accepting());
    let listener = RecordingListener::accepting();
    bus.register_bus_listener(listener.clone()).unwrap();

    bus.record_found("org.example.A", TransportMask::TCP, "org.")
        .unwrap();
    bus.record_found("org.example.B", TransportMask::LOCAL, "org.")
        .unwrap();
    bus.record_found("org.example.C", TransportMask::TCP, "org.")
        .unwrap();
    bus.owner_changed("org.example.A", None, Some(":owner.1"))
        .unwrap();
    bus.owner_changed("org.example.B", None, Some(":owner.1"))
        .unwrap();
    bus.owner_changed("org.example.C", None, Some(":other.7"))
        .unwrap();

    assert_eq!(
        bus.advertised_name("org.example.A")
            .and_then(|entry| entry.owner),
        Some(":owner.1".to_string())
    );

    let removed = bus.owner_disconnected(":owner.1").unwrap();
    assert_eq!(
        removed,
        vec!["org.example.A".to_string(), "org.example.B".to_string()]
    );
    assert!(bus.lookup_name("org.example.A").is_empty());
    assert!(bus.lookup_name("org.example.B").is_empty());
    assert_eq!(bus.lookup_name("org.example.C"), TransportMask::TCP);

    bus.flush_events().await.unwrap();
    let owner_events = listener.events_of_kind("name_owner_changed");
    assert_eq!(owner_events.len(), 3);
    assert_eq!(
        owner_events.first(),
        Some(&BusEvent::NameOwnerChanged {
            name: "org.example.A".to_string(),
            previous_owner: None,
            new_owner: Some(":owner.1".to_string()),
        })
    );

    let losses = listener.events_of_kind("lost_advertised_name");
    assert_eq!(losses.len(), 2);
    assert!(losses.contains(&lost("org.example.B", TransportMask::LOCAL, "org.")));
}

#[tokio::test]
async fn test_owner_change_for_unknown_name_is_forwarded() {
    let bus = TestAttachment::new().build(MockTransport::accepting());
    let listener = RecordingListener::accepting();
    bus.register_bus_listener(listener.clone()).unwrap();

    bus.owner_changed("org.example.Unseen", Some(":a.1"), None)
        .unwrap();
    assert!(bus.advertised_name("org.example.Unseen").is_none());

    let events = listener.wait_for_events(1, WAIT).await;
    assert_eq!(
        events,
        vec![BusEvent::NameOwnerChanged {
            name: "org.example.Unseen".to_string(),
            previous_owner: Some(":a.1".to_string()),
            new_owner: None,
        }]
    );

    assert!(matches!(
        bus.owner_changed("org.example.Unseen", Some("not a name"), None),
        Err(BusError::InvalidName(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_name_order_under_concurrency() {
    const ROUNDS: usize = 50;
    let names = ["org.example.N0", "org.example.N1", "org.example.N2", "org.example.N3"];

    let bus = TestAttachment::new()
        .with_shards(2)
        .build(MockTransport::accepting());
    let listener = RecordingListener::accepting();
    bus.register_bus_listener(listener.clone()).unwrap();

    let mut tasks = Vec::new();
    for name in names {
        let bus = Arc::clone(&bus);
        tasks.push(tokio::spawn(async move {
            for _ in 0..ROUNDS {
                bus.record_found(name, TransportMask::TCP, "org.").unwrap();
                bus.record_lost(name, TransportMask::TCP, "org.").unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    bus.flush_events().await.unwrap();

    let events = listener.events();
    assert_eq!(events.len(), names.len() * ROUNDS * 2);
    for name in names {
        let kinds: Vec<&str> = events
            .iter()
            .filter(|event| event.name() == Some(name))
            .map(BusEvent::kind)
            .collect();
        assert_eq!(kinds.len(), ROUNDS * 2);
        for pair in kinds.chunks(2) {
            assert_eq!(
                pair,
                ["found_advertised_name", "lost_advertised_name"],
                "events for {name} out of order"
            );
        }
        assert!(bus.lookup_name(name).is_empty());
    }
}

#[tokio::test]
async fn test_loopback_advertise_and_cancel() {
    let (transport, rx) = LoopbackTransport::new();
    let bus = TestAttachment::new().build(Arc::new(transport));
    let pump = bus.spawn_discovery_pump(rx);
    let listener = RecordingListener::accepting();
    bus.register_bus_listener(listener.clone()).unwrap();

    bus.find_advertised_name("org.example").await.unwrap();
    bus.advertise_name("org.example.Chat", TransportMask::ANY)
        .await
        .unwrap();

    let events = listener.wait_for_events(1, WAIT).await;
    assert_eq!(
        events.first().map(BusEvent::kind),
        Some("found_advertised_name")
    );
    assert_eq!(bus.lookup_name("org.example.Chat"), TransportMask::LOCAL);

    bus.cancel_advertise_name("org.example.Chat", TransportMask::ANY)
        .await
        .unwrap();
    let events = listener.wait_for_events(2, WAIT).await;
    assert_eq!(
        events.last().map(BusEvent::kind),
        Some("lost_advertised_name")
    );
    assert!(bus.lookup_name("org.example.Chat").is_empty());

    bus.teardown(WAIT).await.unwrap();
    pump.await.unwrap();
}

#[tokio::test]
async fn test_find_and_advertise_reach_transport() {
    let transport = MockTransport::accepting();
    let bus = TestAttachment::new().build(transport.clone());

    bus.find_advertised_name("org.example").await.unwrap();
    bus.advertise_name("org.example.Svc", TransportMask::TCP)
        .await
        .unwrap();
    assert_eq!(transport.prefixes(), vec!["org.example".to_string()]);
    assert_eq!(
        transport.advertised(),
        vec![("org.example.Svc".to_string(), TransportMask::TCP)]
    );

    bus.cancel_find_advertised_name("org.example").await.unwrap();
    bus.cancel_advertise_name("org.example.Svc", TransportMask::TCP)
        .await
        .unwrap();
    assert!(transport.prefixes().is_empty());
    assert!(transport.advertised().is_empty());

    assert!(matches!(
        bus.find_advertised_name("bad prefix").await,
        Err(BusError::InvalidName(_))
    ));
}
