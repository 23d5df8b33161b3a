//! Connection lifecycle state machine and reconnect backoff
//!
//! The session driver feeds observed events into [`SessionFsm`] and acts on
//! the state that comes back, so every allowed transition is written down in
//! one match instead of being scattered across the I/O code. The machine is
//! pure and synchronous, which keeps the lifecycle rules testable without a
//! socket.

use rand::Rng;
use std::time::Duration;

/// Consecutive missed heartbeats tolerated before the session is degraded
pub const MAX_MISSED_HEARTBEATS: u32 = 2;

/// Jitter applied to reconnect delays, as a fraction of the delay
const BACKOFF_JITTER: f64 = 0.2;

/// Largest exponent used for the backoff doubling
const MAX_BACKOFF_SHIFT: u32 = 20;

/// Where the session currently is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dialing the hub
    Connecting,
    /// Transport open, auth handshake in progress
    Authenticating,
    /// Authenticated and subscribed; events are flowing
    Active,
    /// Heartbeats going unanswered; teardown is imminent
    Degraded,
    /// Waiting out the backoff delay before the next dial
    Reconnecting { attempt: u32 },
    /// Terminal; the session will not reconnect
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    /// Get a short label for logging and the health endpoint
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Active => "active",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Something the session driver observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// TCP/WebSocket handshake completed
    TransportOpened,
    /// Hub accepted the access token
    AuthAccepted,
    /// Hub rejected the access token; fatal
    AuthFailed,
    /// A heartbeat interval elapsed without a pong
    HeartbeatMissed,
    /// The hub answered the outstanding ping
    PongReceived,
    /// The transport failed or was closed by the hub
    TransportLost,
    /// Local shutdown was requested
    ShutdownRequested,
}

/// Session lifecycle state machine
///
/// Tracks the connection state together with the heartbeat miss count and
/// the reconnect attempt counter. A fully established session (auth
/// accepted) resets the attempt counter, so the backoff sequence starts
/// over after every recovery.
#[derive(Debug)]
pub struct SessionFsm {
    state: ConnectionState,
    missed_heartbeats: u32,
    attempts: u32,
    max_attempts: u32,
}

impl SessionFsm {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Connecting,
            missed_heartbeats: 0,
            attempts: 0,
            max_attempts,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats
    }

    /// Apply one observed event and return the resulting state
    ///
    /// Events that make no sense for the current state leave it unchanged;
    /// `Closed` absorbs everything.
    pub fn apply(&mut self, event: SessionEvent) -> ConnectionState {
        use ConnectionState::*;
        use SessionEvent::*;

        if self.state == Closed {
            return Closed;
        }

        self.state = match (self.state, event) {
            (_, ShutdownRequested) => Closed,
            (_, AuthFailed) => Closed,
            (Connecting | Reconnecting { .. }, TransportOpened) => {
                self.missed_heartbeats = 0;
                Authenticating
            }
            (Authenticating, AuthAccepted) => {
                self.attempts = 0;
                Active
            }
            (Active | Degraded, HeartbeatMissed) => {
                self.missed_heartbeats += 1;
                if self.missed_heartbeats >= MAX_MISSED_HEARTBEATS {
                    Degraded
                } else {
                    Active
                }
            }
            (Active | Degraded, PongReceived) => {
                self.missed_heartbeats = 0;
                Active
            }
            (_, TransportLost) => {
                self.attempts += 1;
                if self.attempts > self.max_attempts {
                    Closed
                } else {
                    Reconnecting {
                        attempt: self.attempts,
                    }
                }
            }
            (current, _) => current,
        };
        self.state
    }
}

/// Exponential backoff with jitter for reconnect delays
///
/// The delay doubles per attempt starting from the base, is capped, and
/// then gets a random factor in the jitter band so a fleet of clients does
/// not reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: BACKOFF_JITTER,
        }
    }

    /// Compute the delay before the given reconnect attempt (1-based)
    pub fn delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        let exponential = (self.base.as_millis() as u64)
            .saturating_mul(1u64 << shift)
            .min(self.cap.as_millis() as u64);
        let factor = rng.gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_millis((exponential as f64 * factor) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn established(fsm: &mut SessionFsm) {
        fsm.apply(SessionEvent::TransportOpened);
        fsm.apply(SessionEvent::AuthAccepted);
    }

    #[test]
    fn test_happy_path_reaches_active() {
        let mut fsm = SessionFsm::new(3);
        assert_eq!(fsm.state(), ConnectionState::Connecting);
        assert_eq!(
            fsm.apply(SessionEvent::TransportOpened),
            ConnectionState::Authenticating
        );
        assert_eq!(fsm.apply(SessionEvent::AuthAccepted), ConnectionState::Active);
    }

    #[test]
    fn test_second_missed_heartbeat_degrades() {
        let mut fsm = SessionFsm::new(3);
        established(&mut fsm);

        assert_eq!(
            fsm.apply(SessionEvent::HeartbeatMissed),
            ConnectionState::Active
        );
        assert_eq!(
            fsm.apply(SessionEvent::HeartbeatMissed),
            ConnectionState::Degraded
        );
        assert_eq!(fsm.missed_heartbeats(), 2);
    }

    #[test]
    fn test_pong_recovers_from_single_miss() {
        let mut fsm = SessionFsm::new(3);
        established(&mut fsm);

        fsm.apply(SessionEvent::HeartbeatMissed);
        assert_eq!(fsm.apply(SessionEvent::PongReceived), ConnectionState::Active);
        assert_eq!(fsm.missed_heartbeats(), 0);
    }

    #[test]
    fn test_transport_loss_cycles_through_reconnecting() {
        let mut fsm = SessionFsm::new(3);
        established(&mut fsm);

        assert_eq!(
            fsm.apply(SessionEvent::TransportLost),
            ConnectionState::Reconnecting { attempt: 1 }
        );
        assert_eq!(
            fsm.apply(SessionEvent::TransportOpened),
            ConnectionState::Authenticating
        );
        assert_eq!(fsm.apply(SessionEvent::AuthAccepted), ConnectionState::Active);
    }

    #[test]
    fn test_exhausted_attempts_close_the_session() {
        let mut fsm = SessionFsm::new(2);

        assert_eq!(
            fsm.apply(SessionEvent::TransportLost),
            ConnectionState::Reconnecting { attempt: 1 }
        );
        assert_eq!(
            fsm.apply(SessionEvent::TransportLost),
            ConnectionState::Reconnecting { attempt: 2 }
        );
        assert_eq!(fsm.apply(SessionEvent::TransportLost), ConnectionState::Closed);
        assert!(fsm.state().is_terminal());
    }

    #[test]
    fn test_successful_auth_resets_the_attempt_counter() {
        let mut fsm = SessionFsm::new(2);

        fsm.apply(SessionEvent::TransportLost);
        fsm.apply(SessionEvent::TransportLost);
        established(&mut fsm);

        // the budget is fresh again after recovery
        assert_eq!(
            fsm.apply(SessionEvent::TransportLost),
            ConnectionState::Reconnecting { attempt: 1 }
        );
    }

    #[test]
    fn test_auth_failure_is_terminal_from_any_state() {
        let mut fsm = SessionFsm::new(5);
        fsm.apply(SessionEvent::TransportOpened);

        assert_eq!(fsm.apply(SessionEvent::AuthFailed), ConnectionState::Closed);
        // closed absorbs later events
        assert_eq!(
            fsm.apply(SessionEvent::TransportOpened),
            ConnectionState::Closed
        );
    }

    #[test]
    fn test_shutdown_closes_from_any_state() {
        let mut fsm = SessionFsm::new(5);
        established(&mut fsm);
        assert_eq!(
            fsm.apply(SessionEvent::ShutdownRequested),
            ConnectionState::Closed
        );
    }

    #[test]
    fn test_out_of_place_events_leave_state_unchanged() {
        let mut fsm = SessionFsm::new(5);
        assert_eq!(
            fsm.apply(SessionEvent::PongReceived),
            ConnectionState::Connecting
        );
        assert_eq!(
            fsm.apply(SessionEvent::HeartbeatMissed),
            ConnectionState::Connecting
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::new(Duration::from_millis(1_000), Duration::from_millis(30_000));
        let mut rng = StdRng::seed_from_u64(11);

        let expectations = [
            (1, 1_000u64),
            (2, 2_000),
            (3, 4_000),
            (4, 8_000),
            (5, 16_000),
            (6, 30_000),
            (12, 30_000),
        ];
        for (attempt, expected_ms) in expectations {
            let delay = policy.delay(attempt, &mut rng).as_millis() as u64;
            let low = expected_ms * 8 / 10;
            let high = expected_ms * 12 / 10;
            assert!(
                (low..=high).contains(&delay),
                "attempt {}: delay {}ms outside [{}ms, {}ms]",
                attempt,
                delay,
                low,
                high
            );
        }
    }

    #[test]
    fn test_backoff_is_deterministic_for_a_seed() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_millis(10_000));

        let sequence = |seed: u64| {
            let mut rng = StdRng::seed_from_u64(seed);
            (1..=8).map(|a| policy.delay(a, &mut rng)).collect::<Vec<_>>()
        };

        assert_eq!(sequence(99), sequence(99));
    }

    #[test]
    fn test_backoff_survives_huge_attempt_numbers() {
        let policy = BackoffPolicy::new(Duration::from_millis(1_000), Duration::from_millis(30_000));
        let mut rng = StdRng::seed_from_u64(3);

        let delay = policy.delay(u32::MAX, &mut rng);
        assert!(delay.as_millis() as u64 <= 36_000);
    }
}
