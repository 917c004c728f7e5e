//! Scripted stand-ins for the radio, used by tests and demos.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::{future, stream};
use crate::device_scanner::{Discovery, PeripheralDescriptor};
use crate::error::{LinkError, ScanError};
use crate::link::{HeartRateLink, NotificationStream};

/// Test-side handle feeding one subscription's notifications.
///
/// Dropping it ends the stream, which the supervisor sees as a transport drop.
#[derive(Clone)]
pub struct NotificationFeed {
    tx: UnboundedSender<Vec<u8>>,
}

impl NotificationFeed {
    pub fn push(&self, payload: &[u8]) -> bool {
        self.tx.unbounded_send(payload.to_vec()).is_ok()
    }
}

/// Creates a notification stream and the feed that drives it
pub fn notification_feed() -> (NotificationFeed, NotificationStream) {
    let (tx, rx) = unbounded();
    (NotificationFeed { tx }, Box::pin(rx))
}

/// Counters shared between a `ScriptedLink` and the test observing it
#[derive(Debug, Clone, Default)]
pub struct LinkCounters {
    connects: Arc<AtomicUsize>,
    subscribes: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
}

impl LinkCounters {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

/// `HeartRateLink` that replays queued outcomes.
///
/// When a queue runs dry, `connect` succeeds and `subscribe` yields a stream
/// that never produces anything. A stalled call never completes.
#[derive(Default)]
pub struct ScriptedLink {
    connects: VecDeque<Result<(), LinkError>>,
    subscriptions: VecDeque<Result<NotificationStream, LinkError>>,
    stall_connect: bool,
    stall_subscribe: bool,
    counters: LinkCounters,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> LinkCounters {
        self.counters.clone()
    }

    pub fn connect_result(mut self, result: Result<(), LinkError>) -> Self {
        self.connects.push_back(result);
        self
    }

    pub fn subscription(mut self, result: Result<NotificationStream, LinkError>) -> Self {
        self.subscriptions.push_back(result);
        self
    }

    pub fn stall_connect(mut self) -> Self {
        self.stall_connect = true;
        self
    }

    pub fn stall_subscribe(mut self) -> Self {
        self.stall_subscribe = true;
        self
    }
}

#[async_trait]
impl HeartRateLink for ScriptedLink {
    async fn connect(&mut self) -> Result<(), LinkError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        if self.stall_connect {
            return future::pending().await;
        }
        self.connects.pop_front().unwrap_or(Ok(()))
    }

    async fn subscribe(&mut self) -> Result<NotificationStream, LinkError> {
        self.counters.subscribes.fetch_add(1, Ordering::SeqCst);
        if self.stall_subscribe {
            return future::pending().await;
        }
        self.subscriptions
            .pop_front()
            .unwrap_or_else(|| Ok(Box::pin(stream::pending())))
    }

    async fn disconnect(&mut self) {
        self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// `Discovery` returning a fixed result
#[derive(Debug, Clone)]
pub struct ScriptedDiscovery {
    result: Result<Vec<PeripheralDescriptor>, ScanError>,
    scans: Arc<AtomicUsize>,
}

impl ScriptedDiscovery {
    pub fn found(peripherals: Vec<PeripheralDescriptor>) -> Self {
        Self {
            result: Ok(peripherals),
            scans: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(error: ScanError) -> Self {
        Self {
            result: Err(error),
            scans: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Discovery for ScriptedDiscovery {
    async fn discover(&self) -> Result<Vec<PeripheralDescriptor>, ScanError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}
