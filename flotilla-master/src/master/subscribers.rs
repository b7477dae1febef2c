//! Operator event stream fan-out.
//!
//! Each subscriber owns one stream; the master pushes every master-level
//! event to each subscriber in arrival order. A failed write means the
//! subscriber is gone and it is dropped on the spot. Heartbeats ride the
//! same stream on a fixed interval.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::time::Duration;

// Layer 2: Third-party crate imports
use tokio::sync::mpsc;
use tracing::debug;

// Layer 3: Internal module imports
use crate::roster::frameworks::Heartbeater;
use flotilla_model::{MasterEvent, StreamId};

struct Subscriber {
    sender: mpsc::UnboundedSender<MasterEvent>,
    _heartbeater: Heartbeater,
}

/// All connected operator subscribers.
#[derive(Default)]
pub(crate) struct Subscribers {
    streams: HashMap<StreamId, Subscriber>,
}

impl Subscribers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and hand back its stream.
    pub(crate) fn subscribe(
        &mut self,
        heartbeat_interval: Duration,
    ) -> (StreamId, mpsc::UnboundedReceiver<MasterEvent>) {
        let stream_id = StreamId::new();
        let (sender, receiver) = mpsc::unbounded_channel();

        let heartbeat_sender = sender.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_sender.send(MasterEvent::Heartbeat).is_err() {
                    break;
                }
            }
        });

        self.streams.insert(
            stream_id,
            Subscriber {
                sender,
                _heartbeater: Heartbeater::new(handle),
            },
        );
        (stream_id, receiver)
    }

    /// Push an event to every subscriber, dropping the ones whose stream
    /// closed.
    pub(crate) fn broadcast(&mut self, event: MasterEvent) {
        self.streams.retain(|stream_id, subscriber| {
            let alive = subscriber.sender.send(event.clone()).is_ok();
            if !alive {
                debug!(%stream_id, "dropping disconnected subscriber");
            }
            alive
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }
}
