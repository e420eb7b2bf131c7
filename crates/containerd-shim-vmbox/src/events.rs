//! Outbound event pipeline.
//!
//! Handlers enqueue `(topic, payload)` pairs on a bounded channel; a
//! forwarder task drains the queue into containerd's event bus. Publish
//! failures are logged and dropped, they never fail a task call.

use chrono::{DateTime, TimeZone};
use containerd_shim::event::Event;
use containerd_shim::protos::prost_types::{Any, Timestamp};
use containerd_shim::publisher::RemotePublisher;
use log::warn;
use tokio::sync::mpsc;

const EVENT_QUEUE_SIZE: usize = 128;

pub type EventQueue = mpsc::Sender<(String, Any)>;

/// Build the production queue: a channel drained into `publisher` under
/// `namespace`.
pub fn event_queue(publisher: RemotePublisher, namespace: impl AsRef<str>) -> EventQueue {
    let namespace = namespace.as_ref().to_string();
    let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_SIZE);
    tokio::spawn(async move {
        while let Some((topic, event)) = rx.recv().await {
            if let Err(err) = publisher.publish(&topic, &namespace, event).await {
                warn!("failed to publish event, topic: {topic}: {err}");
            }
        }
    });
    tx
}

/// Enqueue one event; the topic comes from the event type itself.
pub async fn send(queue: &EventQueue, event: impl Event) {
    let _ = queue
        .send((event.topic(), Any::from_msg(&event).unwrap()))
        .await;
}

pub trait ToTimestamp {
    fn to_timestamp(self) -> Timestamp;
}

impl<Tz: TimeZone> ToTimestamp for DateTime<Tz> {
    fn to_timestamp(self) -> Timestamp {
        Timestamp {
            seconds: self.timestamp(),
            nanos: self.timestamp_subsec_nanos() as i32,
        }
    }
}
