//! Reconnection state machine with capped exponential backoff.
//!
//! ```text
//!   IDLE ──► CONNECTING ──► CONNECTED
//!                ▲              │ unexpected close / error
//!                │ retry due    ▼
//!                └──────── RECONNECTING ──(attempts exhausted)──► DISCONNECTED
//!
//!   close() from any state ─────────────────────────────────────► DISCONNECTED
//! ```
//!
//! The machine is pure: it never sleeps or touches a socket. The
//! connection manager asks it what to do and performs the waiting.

use rand::Rng;
use std::time::Duration;

use crate::config::ReconnectConfig;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal until the caller explicitly reconnects.
    Disconnected,
}

impl ConnectionState {
    pub fn is_online(&self) -> bool {
        *self == ConnectionState::Connected
    }
}

/// Backoff parameters: `delay = min(base * 1.5^attempt + jitter, max)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter is drawn uniformly from `[0, max_jitter)`.
    pub max_jitter: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl From<&ReconnectConfig> for BackoffPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            max_jitter: config.max_jitter(),
            max_attempts: config.max_attempts,
        }
    }
}

impl BackoffPolicy {
    const GROWTH: f64 = 1.5;

    /// Delay before the retry that follows `attempt` earlier retries.
    pub fn delay_for(&self, attempt: u32, jitter: Duration) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * Self::GROWTH.powi(attempt as i32);
        let total = scaled + jitter.as_secs_f64();
        if !total.is_finite() || total >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(total)
        }
    }

    /// Draw a jitter sample in `[0, max_jitter)`.
    pub fn sample_jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let millis = self.max_jitter.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..millis.max(1)))
    }
}

/// What the caller should do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to schedule.
    Stay,
    /// Sleep `delay`, then call [`ReconnectMachine::retry_due`] and reconnect.
    Schedule { attempt: u32, delay: Duration },
    /// Attempts exhausted; the machine is now DISCONNECTED. Emitted once.
    GaveUp,
}

/// Reconnection state machine.
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    state: ConnectionState,
    attempt: u32,
    policy: BackoffPolicy,
}

impl ReconnectMachine {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Retries scheduled since the last successful connection.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Caller-initiated connect (first connect or manual retry).
    ///
    /// Returns `false` if a connection is already live or in progress.
    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Idle | ConnectionState::Disconnected => {
                self.attempt = 0;
                self.state = ConnectionState::Connecting;
                true
            }
            _ => false,
        }
    }

    /// Handshake completed.
    pub fn connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempt = 0;
    }

    /// Transport dropped without a local `close()`.
    pub fn connection_lost(&mut self) -> Transition {
        let jitter = self.policy.sample_jitter();
        self.connection_lost_with_jitter(jitter)
    }

    pub fn connection_lost_with_jitter(&mut self, jitter: Duration) -> Transition {
        if self.state != ConnectionState::Connected {
            return Transition::Stay;
        }
        self.enter_reconnecting(jitter)
    }

    /// A connect attempt failed.
    ///
    /// A failed caller-initiated connect goes straight to DISCONNECTED
    /// (the caller sees the error); a failed retry schedules the next one.
    pub fn attempt_failed(&mut self) -> Transition {
        let jitter = self.policy.sample_jitter();
        self.attempt_failed_with_jitter(jitter)
    }

    pub fn attempt_failed_with_jitter(&mut self, jitter: Duration) -> Transition {
        if self.state != ConnectionState::Connecting {
            return Transition::Stay;
        }
        if self.attempt == 0 {
            self.state = ConnectionState::Disconnected;
            return Transition::Stay;
        }
        self.enter_reconnecting(jitter)
    }

    /// The scheduled delay elapsed. Returns `false` if the retry was cancelled.
    pub fn retry_due(&mut self) -> bool {
        if self.state != ConnectionState::Reconnecting {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    /// Deliberate disconnect; never triggers a reconnect.
    pub fn close(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.attempt = 0;
    }

    fn enter_reconnecting(&mut self, jitter: Duration) -> Transition {
        if self.attempt >= self.policy.max_attempts {
            self.state = ConnectionState::Disconnected;
            return Transition::GaveUp;
        }
        let delay = self.policy.delay_for(self.attempt, jitter);
        self.attempt += 1;
        self.state = ConnectionState::Reconnecting;
        Transition::Schedule {
            attempt: self.attempt,
            delay,
        }
    }
}
