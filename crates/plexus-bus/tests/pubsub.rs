use parking_lot::Mutex;
use plexus_bus::{BusConfig, DeliveryMode, Event, Message, MessageBus, MessageHandler};
use plexus_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn recorder(log: &Arc<Mutex<Vec<i64>>>) -> MessageHandler {
    let log = Arc::clone(log);
    Arc::new(move |m: &Message| -> Result<()> {
        log.lock().push(m.payload.as_i64().unwrap_or(-1));
        Ok(())
    })
}

#[tokio::test]
async fn test_single_publisher_order_reaches_each_subscriber() {
    let bus = MessageBus::new(BusConfig::default()).unwrap();
    let a = Arc::new(Mutex::new(Vec::new()));
    let b = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("com.example.a", "T", recorder(&a), None).unwrap();
    bus.subscribe("com.example.b", "T", recorder(&b), None).unwrap();

    for n in 1..=3 {
        bus.publish(Message::new("T", "com.example.s", json!(n)), DeliveryMode::Broadcast, vec![])
            .unwrap();
    }
    // the last report arrives after everything queued before it
    let report = bus
        .publish_async(Message::new("T", "com.example.s", json!(4)), DeliveryMode::Broadcast, vec![])
        .await
        .unwrap();
    assert_eq!(report.delivered, 2);

    assert_eq!(a.lock().as_slice(), [1, 2, 3, 4]);
    assert_eq!(b.lock().as_slice(), [1, 2, 3, 4]);

    let stats = bus.statistics();
    assert_eq!(stats.published, 4);
    assert_eq!(stats.delivered, 8);
    assert_eq!(stats.subscriptions_by_type.get("T"), Some(&2));
}

#[tokio::test]
async fn test_failing_handler_does_not_stop_fan_out() {
    let bus = MessageBus::new(BusConfig::default()).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let failing: MessageHandler =
        Arc::new(|_m: &Message| -> Result<()> { Err(plexus_core::PluginError::execution_failed("bad")) });
    bus.subscribe("com.example.first", "T", failing, None).unwrap();
    bus.subscribe("com.example.second", "T", recorder(&log), None).unwrap();

    let report = bus
        .publish_async(Message::new("T", "host", json!(7)), DeliveryMode::Broadcast, vec![])
        .await
        .unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failures[0].subscriber, "com.example.first");
    assert_eq!(log.lock().as_slice(), [7]);
}

#[tokio::test]
async fn test_release_plugin_stops_delivery() {
    let bus = MessageBus::new(BusConfig::default()).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("com.example.a", "T", recorder(&log), None).unwrap();
    bus.requests()
        .register(
            "com.example.a",
            "com.example.a.echo",
            Arc::new(|v: serde_json::Value| -> Result<serde_json::Value> { Ok(v) }),
        )
        .unwrap();

    assert_eq!(bus.release_plugin("com.example.a"), (1, 1));
    let report = bus
        .publish_async(Message::new("T", "host", json!(1)), DeliveryMode::Broadcast, vec![])
        .await
        .unwrap();
    assert_eq!(report.delivered, 0);
    assert!(log.lock().is_empty());
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Tick {
    n: u32,
}

impl Event for Tick {
    const EVENT_TYPE: &'static str = "test.tick";
}

#[tokio::test]
async fn test_typed_events_and_history() {
    let config = BusConfig {
        max_event_history: 2,
        ..Default::default()
    };
    let bus = MessageBus::new(config).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.events()
        .subscribe_filtered(
            "com.example.a",
            move |t: Tick, _m: &Message| -> Result<()> {
                sink.lock().push(t.n);
                Ok(())
            },
            |t: &Tick| t.n % 2 == 1,
        )
        .unwrap();

    for n in 1..=3 {
        bus.events().publish_async("host", &Tick { n }).await.unwrap();
    }
    assert_eq!(seen.lock().as_slice(), [1, 3]);
    assert_eq!(bus.events().history_of::<Tick>(), vec![Tick { n: 2 }, Tick { n: 3 }]);
}

#[test]
fn test_shutdown_twice() {
    let config = BusConfig {
        delivery_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let bus = MessageBus::new(config).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe("com.example.a", "T", recorder(&log), None).unwrap();
    bus.publish(Message::new("T", "host", json!(1)), DeliveryMode::Broadcast, vec![])
        .unwrap();

    bus.shutdown();
    bus.shutdown();
    assert!(bus.is_shut_down());
    assert!(bus.subscriptions().is_empty());
    // queued work drains before subscriptions are cancelled
    assert_eq!(log.lock().as_slice(), [1]);
    assert!(bus
        .publish(Message::new("T", "host", json!(2)), DeliveryMode::Broadcast, vec![])
        .is_err());
}
