use sg_bridge::event_bus::EventBus;
use sg_bridge::protocol::EngineEvent;
use sg_core::types::RunStatus;
use uuid::Uuid;

fn status_change(run_id: Uuid) -> EngineEvent {
    EngineEvent::RunStatusChanged {
        run_id,
        from: RunStatus::Running,
        to: RunStatus::PausedForGate,
    }
}

#[test]
fn test_new_bus_has_no_subscribers() {
    let bus = EventBus::new();
    assert_eq!(bus.subscriber_count(), 0);
}

#[test]
fn test_publish_delivers_to_every_subscriber() {
    let bus = EventBus::new();
    let rx1 = bus.subscribe();
    let rx2 = bus.subscribe();
    let run_id = Uuid::new_v4();

    bus.publish(status_change(run_id));

    for rx in [rx1, rx2] {
        match rx.try_recv().expect("should receive event") {
            EngineEvent::RunStatusChanged { run_id: got, to, .. } => {
                assert_eq!(got, run_id);
                assert_eq!(to, RunStatus::PausedForGate);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

#[test]
fn test_late_subscriber_misses_earlier_events() {
    let bus = EventBus::new();
    bus.publish(status_change(Uuid::new_v4()));
    let rx = bus.subscribe();
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_dropped_receiver_is_pruned() {
    let bus = EventBus::new();
    let rx1 = bus.subscribe();
    let rx2 = bus.subscribe();
    drop(rx1);

    bus.publish(status_change(Uuid::new_v4()));
    assert_eq!(bus.subscriber_count(), 1);
    assert!(rx2.try_recv().is_ok());
}

#[test]
fn test_clones_share_subscribers() {
    let bus = EventBus::new();
    let clone = bus.clone();
    let rx = bus.subscribe();
    clone.publish(status_change(Uuid::new_v4()));
    assert!(rx.try_recv().is_ok());
    assert_eq!(clone.subscriber_count(), 1);
}
