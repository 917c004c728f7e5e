//! # Connection Management Module
//!
//! Owns the I/O context and the single active monitoring session.
//!
//! ## Key Components
//! - `ConnectionManager`: runs scans and starts/stops supervisors on its own
//!   multi-threaded Tokio runtime, so the radio never waits on the consumer
//! - `MonitorSession`: the consumer's view of one session (events, rolling
//!   sample history, state, cancel)
//!
//! Only one supervisor may run at a time. `start` refuses a second session
//! until the first has been stopped or has terminated on its own.

use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use crate::config::Config;
use crate::delivery::{self, EventReceiver, LifecycleEvent};
use crate::device_scanner::{Discovery, PeripheralDescriptor, ScanSession};
use crate::error::{ConnectionError, ScanError, SessionError};
use crate::heart_rate::Sample;
use crate::link::{BtleplugLink, HeartRateLink};
use crate::sample_buffer::SampleBuffer;
use crate::state::ConnectionState;
use crate::supervisor::{ConnectionSupervisor, SupervisorHandle};

/// Consumer side of a running session
pub struct MonitorSession {
    address: String,
    events: EventReceiver,
    buffer: SampleBuffer,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl MonitorSession {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Takes all pending events, appending their samples to the history
    pub fn drain(&self) -> Vec<LifecycleEvent> {
        self.events.drain_into(&self.buffer)
    }

    /// Like `drain`, but waits up to `timeout` for the first event
    pub fn wait(&self, timeout: Duration) -> Vec<LifecycleEvent> {
        let first = match self.events.recv_timeout(timeout) {
            Ok(event) => event,
            Err(_) => return Vec::new(),
        };
        if let LifecycleEvent::SampleReceived(sample) = &first {
            self.buffer.append(*sample);
        }
        let mut events = vec![first];
        events.extend(self.drain());
        events
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.buffer.snapshot()
    }

    /// Read handle to the rolling history
    pub fn buffer(&self) -> SampleBuffer {
        self.buffer.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }
}

/// Manages the connection lifecycle for heart-rate peripherals.
pub struct ConnectionManager {
    runtime: Runtime,
    config: Config,
    buffer: SampleBuffer,
    active: Option<SupervisorHandle>,
}

impl ConnectionManager {
    /// Creates the manager and its I/O runtime.
    pub fn new(config: Config) -> Result<Self, ConnectionError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("ble-io")
            .enable_all()
            .build()
            .map_err(ConnectionError::RuntimeCreation)?;

        let buffer = SampleBuffer::new(config.buffer_capacity);
        Ok(ConnectionManager {
            runtime,
            config,
            buffer,
            active: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The rolling history shared by every session this manager starts
    pub fn buffer(&self) -> SampleBuffer {
        self.buffer.clone()
    }

    /// Runs a scan with the configured duration, blocking the caller until it ends
    pub fn scan(&self) -> Result<Vec<PeripheralDescriptor>, ScanError> {
        self.scan_with(&ScanSession::from_config(&self.config))
    }

    pub fn scan_with<D: Discovery>(&self, discovery: &D) -> Result<Vec<PeripheralDescriptor>, ScanError> {
        self.runtime.block_on(discovery.discover())
    }

    /// Starts monitoring `address` over the system's Bluetooth adapter
    pub fn start(&mut self, address: &str) -> Result<MonitorSession, SessionError> {
        let link = BtleplugLink::new(address.trim(), self.config.connect_timeout());
        self.start_with_link(address, link)
    }

    pub fn start_with_link<L: HeartRateLink + 'static>(
        &mut self,
        address: &str,
        link: L,
    ) -> Result<MonitorSession, SessionError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(SessionError::EmptyAddress);
        }

        if let Some(active) = &self.active {
            if !active.is_finished() && !active.state().is_terminated() {
                log::warn!("Refusing to monitor {} while {} is active", address, active.address());
                return Err(SessionError::AlreadyActive {
                    address: active.address().to_string(),
                });
            }
        }
        if let Some(finished) = self.active.take() {
            self.runtime.block_on(finished.join());
        }

        log::info!("Connection manager: monitoring {}", address);
        let (sender, events) = delivery::channel(self.config.channel_capacity);
        let supervisor = ConnectionSupervisor::new(address, link, self.config.retry_policy(), sender);
        let handle = supervisor.spawn(self.runtime.handle());

        let session = MonitorSession {
            address: address.to_string(),
            events,
            buffer: self.buffer.clone(),
            state: handle.watch_state(),
            cancel: handle.cancel_token(),
        };
        self.active = Some(handle);
        Ok(session)
    }

    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .map_or(false, |h| !h.is_finished() && !h.state().is_terminated())
    }

    /// Cancels the active session and waits until its transport is released.
    ///
    /// Returns the session's final state, or `None` if nothing was running.
    pub fn stop(&mut self) -> Option<ConnectionState> {
        let handle = self.active.take()?;
        log::info!("Connection manager: stopping {}", handle.address());
        handle.cancel();
        Some(self.runtime.block_on(handle.join()))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConnectError, FatalReason, LinkError};
    use crate::link_mock::{notification_feed, ScriptedDiscovery, ScriptedLink};

    fn manager() -> ConnectionManager {
        ConnectionManager::new(Config::default()).expect("runtime")
    }

    /// Collects events until one satisfies `done`
    fn events_until(
        session: &MonitorSession,
        mut done: impl FnMut(&LifecycleEvent) -> bool,
    ) -> Vec<LifecycleEvent> {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while std::time::Instant::now() < deadline {
            let batch = session.wait(Duration::from_millis(50));
            let finished = batch.iter().any(&mut done);
            seen.extend(batch);
            if finished {
                return seen;
            }
        }
        panic!("timed out waiting for event, saw {:?}", seen);
    }

    fn bpms(samples: &[Sample]) -> Vec<u16> {
        samples.iter().map(|s| s.bpm).collect()
    }

    #[test]
    fn test_scan_then_monitor_selected_device() {
        let mut manager = manager();
        let discovery = ScriptedDiscovery::found(vec![
            PeripheralDescriptor::new("AA:BB", Some("HRM-1".to_string())),
            PeripheralDescriptor::new("CC:DD", None),
        ]);

        let found = manager.scan_with(&discovery).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|p| p.address == "AA:BB" && p.label() == "HRM-1"));
        assert!(found.iter().any(|p| p.address == "CC:DD" && p.display_name.is_none()));

        // Earlier history survives into the new session.
        let (feed, stream) = notification_feed();
        let first = manager
            .start_with_link("CC:DD", ScriptedLink::new().subscription(Ok(stream)))
            .unwrap();
        events_until(&first, |e| *e == LifecycleEvent::Connected);
        feed.push(&[0x00, 0x46]);
        events_until(&first, |e| matches!(e, LifecycleEvent::SampleReceived(_)));
        manager.stop();
        let prior = bpms(&manager.buffer().snapshot());
        assert_eq!(prior, vec![70]);

        let selected = found.iter().find(|p| p.address == "AA:BB").unwrap();
        let (feed, stream) = notification_feed();
        let session = manager
            .start_with_link(&selected.address, ScriptedLink::new().subscription(Ok(stream)))
            .unwrap();
        events_until(&session, |e| *e == LifecycleEvent::Connected);
        assert_eq!(session.state(), ConnectionState::Streaming);

        feed.push(&[0x00, 0x3C]);
        feed.push(&[0x00, 0x3D]);
        feed.push(&[0x01, 0x28, 0x00]);
        let mut received = 0;
        events_until(&session, |e| {
            if matches!(e, LifecycleEvent::SampleReceived(_)) {
                received += 1;
            }
            received == 3
        });

        assert_eq!(bpms(&session.snapshot()), vec![70, 60, 61, 40]);
        assert_eq!(
            manager.stop(),
            Some(ConnectionState::Terminated(FatalReason::Cancelled))
        );
    }

    #[test]
    fn test_fifty_five_samples_keep_last_fifty() {
        let mut manager = manager();
        let (feed, stream) = notification_feed();
        let session = manager
            .start_with_link("AA:BB", ScriptedLink::new().subscription(Ok(stream)))
            .unwrap();
        events_until(&session, |e| *e == LifecycleEvent::Connected);

        for bpm in 1..=55u8 {
            feed.push(&[0x00, bpm]);
        }
        events_until(&session, |e| {
            matches!(e, LifecycleEvent::SampleReceived(s) if s.bpm == 55)
        });

        assert_eq!(bpms(&session.snapshot()), (6..=55).collect::<Vec<u16>>());
    }

    #[test]
    fn test_second_session_is_refused_while_active() {
        let mut manager = manager();
        let session = manager.start_with_link("AA:BB", ScriptedLink::new()).unwrap();
        events_until(&session, |e| *e == LifecycleEvent::Connected);

        assert_eq!(
            manager.start_with_link("CC:DD", ScriptedLink::new()).err(),
            Some(SessionError::AlreadyActive { address: "AA:BB".to_string() })
        );
        assert!(manager.is_active());

        manager.stop();
        assert!(!manager.is_active());
        assert!(manager.start_with_link("CC:DD", ScriptedLink::new()).is_ok());
    }

    #[test]
    fn test_terminated_session_frees_the_slot() {
        let mut manager = manager();
        let session = manager
            .start_with_link("AA:BB", ScriptedLink::new().connect_result(Err(LinkError::AdapterUnavailable)))
            .unwrap();
        events_until(&session, |e| matches!(e, LifecycleEvent::Fatal(_)));

        let next = manager.start_with_link(
            "AA:BB",
            ScriptedLink::new().connect_result(Err(LinkError::Connect(ConnectError::Timeout))),
        );
        assert!(next.is_ok());
    }

    #[test]
    fn test_session_cancel_is_observed() {
        let mut manager = manager();
        let session = manager.start_with_link("AA:BB", ScriptedLink::new()).unwrap();
        events_until(&session, |e| *e == LifecycleEvent::Connected);

        session.cancel();
        let events = events_until(&session, |e| matches!(e, LifecycleEvent::Fatal(_)));
        assert_eq!(events.last(), Some(&LifecycleEvent::Fatal(FatalReason::Cancelled)));
        assert_eq!(session.state(), ConnectionState::Terminated(FatalReason::Cancelled));
    }

    #[test]
    fn test_empty_address_is_rejected() {
        let mut manager = manager();
        assert_eq!(
            manager.start_with_link("   ", ScriptedLink::new()).err(),
            Some(SessionError::EmptyAddress)
        );
    }

    #[test]
    fn test_scan_errors_pass_through() {
        let manager = manager();
        let discovery = ScriptedDiscovery::failing(ScanError::AdapterUnavailable);
        assert_eq!(manager.scan_with(&discovery), Err(ScanError::AdapterUnavailable));
        assert_eq!(discovery.scans(), 1);
    }

    #[test]
    fn test_stop_without_session() {
        let mut manager = manager();
        assert_eq!(manager.stop(), None);
    }
}
