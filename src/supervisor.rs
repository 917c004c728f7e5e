//! # Connection Supervisor
//!
//! Drives one device session through the `StateMachine`: every suspension
//! point (connect, subscribe, the streaming wait, the backoff timer) is raced
//! against the operator's cancellation token, and its outcome is fed back as
//! an `Input`.
//!
//! ## Outputs
//! - `LifecycleEvent`s on the delivery channel, in the order they happen
//! - the current `ConnectionState` on a `watch` channel
//!
//! The transport is always released before `Terminated` is published.

use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use crate::delivery::{EventSender, LifecycleEvent};
use crate::error::{FatalReason, LinkError};
use crate::heart_rate::decode;
use crate::link::{HeartRateLink, NotificationStream};
use crate::state::{ConnectionState, Input, RetryPolicy, StateMachine};

/// Controls a running supervisor from the consumer side
pub struct SupervisorHandle {
    address: String,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: JoinHandle<ConnectionState>,
}

impl SupervisorHandle {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current state, without waiting
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the supervisor to terminate and returns its final state
    pub async fn join(self) -> ConnectionState {
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                log::error!("Supervisor task for {} failed: {}", self.address, e);
                ConnectionState::Terminated(FatalReason::UnrecoverableTransport(e.to_string()))
            }
        }
    }
}

pub struct ConnectionSupervisor<L> {
    address: String,
    link: L,
    machine: StateMachine,
    events: EventSender,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl<L: HeartRateLink + 'static> ConnectionSupervisor<L> {
    pub fn new(address: impl Into<String>, link: L, policy: RetryPolicy, events: EventSender) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            address: address.into(),
            link,
            machine: StateMachine::new(policy),
            events,
            state_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Starts the supervisor on `runtime` and returns its handle
    pub fn spawn(self, runtime: &Handle) -> SupervisorHandle {
        let handle_parts = (
            self.address.clone(),
            self.state_tx.subscribe(),
            self.cancel.clone(),
        );
        let task = runtime.spawn(self.run());
        let (address, state, cancel) = handle_parts;
        SupervisorHandle {
            address,
            state,
            cancel,
            task,
        }
    }

    /// Runs the session to completion
    pub async fn run(mut self) -> ConnectionState {
        let mut notifications: Option<NotificationStream> = None;
        let mut input = Input::Start;

        loop {
            let previous = self.machine.state().clone();
            let dropped = input == Input::TransportDropped;

            if releases_transport(&input) {
                notifications = None;
                self.link.disconnect().await;
            }

            let next = self.apply(input);
            self.announce(&previous, &next, dropped);

            input = match next {
                ConnectionState::Connecting => {
                    log::info!("Connecting to {}...", self.address);
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => Input::Cancel,
                        result = self.link.connect() => match result {
                            Ok(()) => Input::Connected,
                            Err(e) => failure_input(e),
                        },
                    }
                }
                ConnectionState::Subscribing => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => Input::Cancel,
                        result = self.link.subscribe() => match result {
                            Ok(stream) => {
                                notifications = Some(stream);
                                Input::Subscribed
                            }
                            Err(e) => failure_input(e),
                        },
                    }
                }
                ConnectionState::Streaming => match notifications.as_mut() {
                    Some(stream) => tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => Input::Cancel,
                        payload = stream.next() => match payload {
                            Some(payload) => {
                                self.deliver(&payload);
                                Input::Notification
                            }
                            None => Input::TransportDropped,
                        },
                    },
                    None => Input::TransportDropped,
                },
                ConnectionState::Backoff { until, .. } => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => Input::Cancel,
                        _ = tokio::time::sleep_until(until) => Input::TimerFired,
                    }
                }
                ConnectionState::Idle => Input::Start,
                ConnectionState::Terminated(reason) => return ConnectionState::Terminated(reason),
            };
        }
    }

    fn apply(&mut self, input: Input) -> ConnectionState {
        match self.machine.handle(input, Instant::now()) {
            Ok(next) => next,
            Err(invalid) => {
                log::error!("Supervisor for {}: {}", self.address, invalid);
                self.machine
                    .handle(
                        Input::Unrecoverable(FatalReason::UnrecoverableTransport(invalid.to_string())),
                        Instant::now(),
                    )
                    .unwrap_or_else(|_| self.machine.state().clone())
            }
        }
    }

    /// Publishes the consequences of a transition, oldest first
    fn announce(&self, previous: &ConnectionState, next: &ConnectionState, dropped: bool) {
        if previous == next {
            return;
        }
        // State first, so a consumer that sees an event also sees the state behind it.
        self.state_tx.send_replace(next.clone());

        if *next == ConnectionState::Streaming {
            log::info!("Streaming heart rate from {}", self.address);
            self.events.send(LifecycleEvent::Connected);
        }
        if dropped {
            log::warn!("Lost connection to {}", self.address);
            self.events
                .send(LifecycleEvent::Disconnected("notification stream closed".to_string()));
        }

        match next {
            ConnectionState::Backoff { attempt, .. } => {
                let delay = self.machine.policy().delay_for(*attempt);
                log::warn!(
                    "Retrying {} in {:.1}s (attempt {})",
                    self.address,
                    delay.as_secs_f32(),
                    attempt
                );
                self.events.send(LifecycleEvent::Retrying {
                    attempt: *attempt,
                    delay,
                });
            }
            ConnectionState::Terminated(reason) if !previous.is_terminated() => {
                match reason {
                    FatalReason::Cancelled => log::info!("Session for {} cancelled", self.address),
                    other => log::error!("Session for {} terminated: {}", self.address, other),
                }
                self.events.send(LifecycleEvent::Fatal(reason.clone()));
            }
            _ => {}
        }
    }

    // Runs on the notification path; only a decode and a non-blocking send.
    fn deliver(&self, payload: &[u8]) {
        match decode(payload) {
            Ok(sample) => {
                log::debug!("Heart rate: {} BPM", sample.bpm);
                self.events.send(LifecycleEvent::SampleReceived(sample));
            }
            Err(e) => {
                log::warn!("Discarding notification {:02x?}: {}", payload, e);
                self.events.send(LifecycleEvent::SampleRejected(e));
            }
        }
    }
}

fn failure_input(error: LinkError) -> Input {
    match error {
        LinkError::Connect(e) => {
            log::warn!("Connect failed: {}", e);
            Input::ConnectFailed(e)
        }
        LinkError::Subscribe(e) => {
            log::warn!("Subscribe failed: {}", e);
            Input::SubscribeFailed(e)
        }
        LinkError::AdapterUnavailable => Input::Unrecoverable(FatalReason::AdapterUnavailable),
        LinkError::Unrecoverable(msg) => {
            Input::Unrecoverable(FatalReason::UnrecoverableTransport(msg))
        }
    }
}

fn releases_transport(input: &Input) -> bool {
    matches!(
        input,
        Input::ConnectFailed(_)
            | Input::SubscribeFailed(_)
            | Input::TransportDropped
            | Input::Cancel
            | Input::Unrecoverable(_)
    )
}
