//! # Delivery Channel
//!
//! Ordered hand-off of lifecycle events and samples from the I/O context to
//! the consumer context.
//!
//! The channel is bounded for data. `EventSender::send` never blocks: when the
//! queue is full the oldest queued sample (`SampleReceived` or
//! `SampleRejected`) is discarded to make room. Lifecycle events are never
//! discarded; they arrive at most once per state transition, so a queue with
//! no sample left to evict may grow past `capacity`. Discards are
//! counted and visible through `EventReceiver::dropped`.
//!
//! The consumer observes data only through `drain_into`, which appends every
//! sample to its `SampleBuffer` and returns the events in emission order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use crossbeam_channel::{bounded, Receiver, Sender};
use crate::error::{DecodeError, FatalReason};
use crate::heart_rate::Sample;
use crate::sample_buffer::SampleBuffer;

pub use crossbeam_channel::RecvTimeoutError;

pub const DEFAULT_CAPACITY: usize = 256;

/// Unit carried on the delivery channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Subscribed and streaming
    Connected,
    /// An established stream dropped; a retry follows
    Disconnected(String),
    SampleReceived(Sample),
    /// A notification could not be decoded; streaming continues
    SampleRejected(DecodeError),
    /// Waiting `delay` before connection attempt number `attempt`
    Retrying { attempt: u32, delay: Duration },
    /// The supervisor terminated; no further events follow
    Fatal(FatalReason),
}

impl LifecycleEvent {
    /// Short status line for a display collaborator
    pub fn status_text(&self) -> String {
        match self {
            LifecycleEvent::Connected => "Connected".to_string(),
            LifecycleEvent::Disconnected(reason) => format!("Disconnected: {}", reason),
            LifecycleEvent::SampleReceived(sample) => format!("Heart Rate: {} BPM", sample.bpm),
            LifecycleEvent::SampleRejected(e) => format!("Error: {}", e),
            LifecycleEvent::Retrying { attempt, delay } => {
                format!("Reconnecting in {}s (attempt {})", delay.as_secs(), attempt)
            }
            LifecycleEvent::Fatal(reason) => format!("Error: {}", reason),
        }
    }

    /// Whether the event may be discarded when the queue is full
    pub fn is_sample(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::SampleReceived(_) | LifecycleEvent::SampleRejected(_)
        )
    }
}

struct Shared {
    queue: Mutex<VecDeque<LifecycleEvent>>,
    capacity: usize,
    consumer_alive: AtomicBool,
    dropped: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, VecDeque<LifecycleEvent>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pop(&self) -> Option<LifecycleEvent> {
        self.lock().pop_front()
    }
}

/// Creates a delivery channel holding at most `capacity` undrained samples.
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        capacity,
        consumer_alive: AtomicBool::new(true),
        dropped: AtomicU64::new(0),
    });
    // Wake-up token only; the events themselves live in `queue`.
    let (ready_tx, ready_rx) = bounded(1);

    let sender = EventSender {
        shared: shared.clone(),
        ready: ready_tx,
    };
    let receiver = EventReceiver {
        shared,
        ready: ready_rx,
    };
    (sender, receiver)
}

/// Producer half, owned by the I/O context
#[derive(Clone)]
pub struct EventSender {
    shared: Arc<Shared>,
    ready: Sender<()>,
}

impl EventSender {
    /// Queues `event` without blocking.
    ///
    /// Returns `false` once the consumer has gone away; the event is discarded.
    pub fn send(&self, event: LifecycleEvent) -> bool {
        if !self.is_consumer_alive() {
            return false;
        }

        let evicted = {
            let mut queue = self.shared.lock();
            if queue.len() < self.shared.capacity {
                queue.push_back(event);
                false
            } else {
                let oldest_sample = queue.iter().position(LifecycleEvent::is_sample);
                match oldest_sample {
                    Some(oldest) => {
                        queue.remove(oldest);
                        queue.push_back(event);
                        true
                    }
                    // Only lifecycle events queued: the incoming sample is the oldest one left.
                    None if event.is_sample() => true,
                    None => {
                        queue.push_back(event);
                        false
                    }
                }
            }
        };

        if evicted {
            let total = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total.is_power_of_two() {
                log::warn!("Consumer is not draining events, {} samples dropped so far", total);
            }
        }

        // A token already waiting is enough to wake the consumer.
        let _ = self.ready.try_send(());
        true
    }

    pub fn is_consumer_alive(&self) -> bool {
        self.shared.consumer_alive.load(Ordering::Acquire)
    }
}

/// Consumer half, owned by the display/logging side
pub struct EventReceiver {
    shared: Arc<Shared>,
    ready: Receiver<()>,
}

impl EventReceiver {
    /// Takes every queued event, appending samples to `buffer` on the way.
    pub fn drain_into(&self, buffer: &SampleBuffer) -> Vec<LifecycleEvent> {
        let events: Vec<LifecycleEvent> = self.shared.lock().drain(..).collect();
        for event in &events {
            if let LifecycleEvent::SampleReceived(sample) = event {
                buffer.append(*sample);
            }
        }
        events
    }

    /// Waits up to `timeout` for the next event without touching any buffer.
    ///
    /// Fails with `Disconnected` once every sender is gone and the queue is empty.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<LifecycleEvent, RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.shared.pop() {
                return Ok(event);
            }
            match self.ready.recv_deadline(deadline) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Timeout) => return Err(RecvTimeoutError::Timeout),
                Err(RecvTimeoutError::Disconnected) => {
                    return self.shared.pop().ok_or(RecvTimeoutError::Disconnected)
                }
            }
        }
    }

    pub fn try_recv(&self) -> Option<LifecycleEvent> {
        self.shared.pop()
    }

    /// Number of samples discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().is_empty()
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.shared.consumer_alive.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sample(bpm: u16) -> LifecycleEvent {
        LifecycleEvent::SampleReceived(Sample {
            bpm,
            contact_detected: None,
            timestamp: Instant::now(),
        })
    }

    #[test]
    fn test_events_arrive_in_order() {
        let (tx, rx) = channel(16);
        let buffer = SampleBuffer::new(10);

        tx.send(LifecycleEvent::Connected);
        tx.send(sample(60));
        tx.send(LifecycleEvent::Disconnected("link lost".into()));
        tx.send(sample(61));

        let events = rx.drain_into(&buffer);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], LifecycleEvent::Connected);
        assert!(matches!(events[2], LifecycleEvent::Disconnected(_)));
        let bpms: Vec<u16> = buffer.snapshot().iter().map(|s| s.bpm).collect();
        assert_eq!(bpms, vec![60, 61]);
    }

    #[test]
    fn test_full_channel_drops_oldest() {
        let (tx, rx) = channel(3);
        for bpm in 1..=5 {
            assert!(tx.send(sample(bpm)));
        }

        let buffer = SampleBuffer::new(10);
        rx.drain_into(&buffer);
        let bpms: Vec<u16> = buffer.snapshot().iter().map(|s| s.bpm).collect();
        assert_eq!(bpms, vec![3, 4, 5]);
        assert_eq!(rx.dropped(), 2);
    }

    #[test]
    fn test_full_channel_keeps_lifecycle_events() {
        let (tx, rx) = channel(2);
        tx.send(LifecycleEvent::Connected);
        for bpm in [60, 61, 62] {
            tx.send(sample(bpm));
        }

        let buffer = SampleBuffer::new(10);
        let events = rx.drain_into(&buffer);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], LifecycleEvent::Connected);
        assert_eq!(buffer.latest().map(|s| s.bpm), Some(62));
        assert_eq!(rx.dropped(), 2);
    }

    #[test]
    fn test_lifecycle_events_survive_a_queue_without_samples() {
        let (tx, rx) = channel(1);
        tx.send(LifecycleEvent::Disconnected("link lost".into()));
        tx.send(LifecycleEvent::Retrying {
            attempt: 1,
            delay: Duration::from_secs(5),
        });
        tx.send(LifecycleEvent::SampleRejected(DecodeError::TooShort));
        tx.send(LifecycleEvent::Fatal(FatalReason::Cancelled));

        let events = rx.drain_into(&SampleBuffer::new(4));
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], LifecycleEvent::Disconnected(_)));
        assert!(matches!(events[1], LifecycleEvent::Retrying { attempt: 1, .. }));
        assert_eq!(events[2], LifecycleEvent::Fatal(FatalReason::Cancelled));
        assert_eq!(rx.dropped(), 1);
    }

    #[test]
    fn test_recv_timeout_wakes_on_send_from_another_thread() {
        let (tx, rx) = channel(4);
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            tx.send(LifecycleEvent::Connected);
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(LifecycleEvent::Connected));
        producer.join().unwrap();
    }

    #[test]
    fn test_send_after_consumer_dropped_does_not_panic() {
        let (tx, rx) = channel(2);
        drop(rx);
        assert!(!tx.is_consumer_alive());
        assert!(!tx.send(LifecycleEvent::Connected));
    }

    #[test]
    fn test_recv_timeout_reports_disconnect() {
        let (tx, rx) = channel(2);
        tx.send(LifecycleEvent::Connected);
        drop(tx);

        assert_eq!(
            rx.recv_timeout(Duration::from_millis(10)),
            Ok(LifecycleEvent::Connected)
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Disconnected)
        );
    }

    #[test]
    fn test_producer_thread_never_blocks_on_slow_consumer() {
        let (tx, rx) = channel(8);
        let producer = std::thread::spawn(move || {
            for bpm in 0..10_000u16 {
                tx.send(sample(bpm));
            }
        });
        producer.join().unwrap();

        let buffer = SampleBuffer::new(100);
        let events = rx.drain_into(&buffer);
        assert_eq!(events.len(), 8);
        assert_eq!(buffer.latest().map(|s| s.bpm), Some(9_999));
        assert_eq!(rx.dropped(), 10_000 - 8);
    }

    #[test]
    fn test_status_text() {
        assert_eq!(LifecycleEvent::Connected.status_text(), "Connected");
        assert_eq!(
            LifecycleEvent::Disconnected("link lost".into()).status_text(),
            "Disconnected: link lost"
        );
        assert!(LifecycleEvent::Fatal(FatalReason::Cancelled)
            .status_text()
            .starts_with("Error:"));
    }
}
