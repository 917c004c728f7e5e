//! # Connection State Machine
//!
//! Pure transition logic for one device session. The async driver in
//! `supervisor.rs` performs the I/O and feeds the outcome of every suspension
//! point back in as an `Input`; this module only decides the next state.
//!
//! ```text
//! Idle --start--> Connecting --ok--> Subscribing --ok--> Streaming
//!                     |                   |                  |
//!                     +------fail---------+------drop--------+
//!                                         v
//!                               Backoff{attempt, until} --timer--> Connecting
//!
//! any --cancel--> Terminated(Cancelled)
//! any --unrecoverable--> Terminated(reason)
//! ```

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use crate::error::{ConnectError, FatalReason, SubscribeError};

/// How the supervisor waits between connection attempts.
///
/// The default reproduces the long-standing behaviour: a fixed five second
/// delay and no attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// Consecutive failed attempts tolerated before giving up; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Growth factor applied per consecutive failure; 1 keeps the delay fixed
    pub multiplier: u32,
    /// Ceiling for grown delays
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: None,
            multiplier: 1,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.multiplier <= 1 {
            return self.delay;
        }
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Subscribing,
    Streaming,
    Backoff { attempt: u32, until: Instant },
    Terminated(FatalReason),
}

impl ConnectionState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, ConnectionState::Terminated(_))
    }

    fn name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Subscribing => "Subscribing",
            ConnectionState::Streaming => "Streaming",
            ConnectionState::Backoff { .. } => "Backoff",
            ConnectionState::Terminated(_) => "Terminated",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Backoff { attempt, .. } => write!(f, "Backoff(attempt {})", attempt),
            ConnectionState::Terminated(reason) => write!(f, "Terminated({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Outcome of a suspension point, or an operator command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Start,
    Connected,
    ConnectFailed(ConnectError),
    Subscribed,
    SubscribeFailed(SubscribeError),
    Notification,
    TransportDropped,
    TimerFired,
    Cancel,
    Unrecoverable(FatalReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: &'static str,
    pub input: Input,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no transition from {} on {:?}", self.from, self.input)
    }
}

impl std::error::Error for InvalidTransition {}

#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
    policy: RetryPolicy,
    // Consecutive failed attempts since the last time Streaming was reached.
    failures: u32,
}

impl StateMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            policy,
            failures: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Applies `input` at time `now` and returns the new state.
    ///
    /// Illegal inputs leave the state untouched.
    pub fn handle(&mut self, input: Input, now: Instant) -> Result<ConnectionState, InvalidTransition> {
        use ConnectionState as S;

        let next = match (self.state.clone(), input) {
            (S::Terminated(reason), Input::Cancel) => return Ok(S::Terminated(reason)),
            (S::Terminated(_), input) => {
                return Err(InvalidTransition { from: self.state.name(), input })
            }
            (_, Input::Cancel) => S::Terminated(FatalReason::Cancelled),
            (_, Input::Unrecoverable(reason)) => S::Terminated(reason),

            (S::Idle, Input::Start) => S::Connecting,
            (S::Connecting, Input::Connected) => S::Subscribing,
            (S::Connecting, Input::ConnectFailed(_)) => self.schedule_retry(now),
            (S::Subscribing, Input::Subscribed) => {
                self.failures = 0;
                S::Streaming
            }
            (S::Subscribing, Input::SubscribeFailed(_)) => self.schedule_retry(now),
            // The link can also drop while services are being discovered.
            (S::Subscribing, Input::ConnectFailed(_)) => self.schedule_retry(now),
            (S::Streaming, Input::Notification) => S::Streaming,
            (S::Streaming, Input::TransportDropped) => self.schedule_retry(now),
            (S::Backoff { .. }, Input::TimerFired) => S::Connecting,

            (state, input) => return Err(InvalidTransition { from: state.name(), input }),
        };

        if next != self.state {
            log::debug!("Connection state: {} -> {}", self.state, next);
        }
        self.state = next;
        Ok(self.state.clone())
    }

    fn schedule_retry(&mut self, now: Instant) -> ConnectionState {
        self.failures = self.failures.saturating_add(1);
        let attempt = self.failures;
        if !self.policy.allows(attempt) {
            return ConnectionState::Terminated(FatalReason::RetriesExhausted { attempts: attempt });
        }
        ConnectionState::Backoff {
            attempt,
            until: now + self.policy.delay_for(attempt),
        }
    }
}
