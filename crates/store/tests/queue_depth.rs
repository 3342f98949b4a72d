#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use datawatch_core::{ObjectMeta, Service, SyncAction, SyncEvent, WatchConfig};
use datawatch_store::{DeliveryPipeline, Enqueue, EventRouter, MemoryStorage};
use metrics::{Counter, Gauge, GaugeFn, Histogram, Key, KeyName, Recorder, SharedString, Unit};
use tokio_util::sync::CancellationToken;

type Depths = Arc<Mutex<HashMap<String, f64>>>;

struct DepthGauge {
    channel: String,
    depths: Depths,
}

impl GaugeFn for DepthGauge {
    fn increment(&self, value: f64) { *self.depths.lock().unwrap().entry(self.channel.clone()).or_default() += value; }
    fn decrement(&self, value: f64) { *self.depths.lock().unwrap().entry(self.channel.clone()).or_default() -= value; }
    fn set(&self, value: f64) { self.depths.lock().unwrap().insert(self.channel.clone(), value); }
}

struct Capture(Depths);

impl Recorder for Capture {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn register_counter(&self, _: &Key) -> Counter { Counter::noop() }
    fn register_gauge(&self, key: &Key) -> Gauge {
        if key.name() != "datawatch_queue_depth" {
            return Gauge::noop();
        }
        let channel = key.labels().find(|l| l.key() == "channel").map(|l| l.value().to_string()).unwrap_or_default();
        Gauge::from_arc(Arc::new(DepthGauge { channel, depths: self.0.clone() }))
    }
    fn register_histogram(&self, _: &Key) -> Histogram { Histogram::noop() }
}

fn svc_event(name: &str) -> SyncEvent {
    SyncEvent::of(SyncAction::Add, Service { metadata: ObjectMeta::new("ns", name), ..Default::default() })
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_depth_gauge_drains_with_the_queue() {
    let depths: Depths = Arc::default();
    metrics::set_boxed_recorder(Box::new(Capture(depths.clone()))).unwrap();

    let mut cfg = WatchConfig::new("c1");
    cfg.sweep_enabled = false;
    let storage = Arc::new(MemoryStorage::new());
    storage.pause();
    let cancel = CancellationToken::new();
    let pipeline = DeliveryPipeline::start(&cfg, storage.clone(), &cancel);
    let router = EventRouter::for_pipeline("c1", Arc::new(cfg.planner()), &pipeline);
    let ch = pipeline.channel("Service").unwrap();

    assert_eq!(router.dispatch(svc_event("a")).await, Some(Enqueue::Queued));
    for _ in 0..200 {
        if ch.depth() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    // consumer holds "a" while storage is paused
    assert_eq!(router.dispatch(svc_event("b")).await, Some(Enqueue::Queued));
    assert_eq!(router.dispatch(svc_event("c")).await, Some(Enqueue::Queued));
    assert_eq!(depths.lock().unwrap().get("Service").copied(), Some(2.0));

    storage.resume();
    assert!(storage.wait_for_ops(3, Duration::from_secs(5)).await);
    assert_eq!(ch.depth(), 0);
    assert_eq!(depths.lock().unwrap().get("Service").copied(), Some(0.0));

    cancel.cancel();
    pipeline.shutdown().await;
}
