//! Connection supervision: exponential backoff with jitter, idle
//! heartbeats, and a pong deadline that declares the wire broken.
//!
//! The machine never performs I/O; the host adapter polls [`Reconnect::on_tick`]
//! and acts on the returned [`TickAction`]. No reconnect fires without its
//! backoff delay.

use log::debug;
use rand::Rng;

pub const BACKOFF_BASE_MS: u64 = 1_000;
pub const BACKOFF_CAP_MS: u64 = 30_000;
pub const HEARTBEAT_IDLE_MS: u64 = 30_000;
pub const SEND_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Live connection; `last_activity_ms` is the last inbound frame,
    /// `ping_sent_ms` an outstanding heartbeat awaiting its pong.
    Connected {
        last_activity_ms: u64,
        ping_sent_ms: Option<u64>,
    },
    /// Waiting out a backoff window before the next attempt.
    Backoff { attempt: u32, due_at_ms: u64 },
    /// Closed for good; no further attempts.
    Closed,
}

/// What the host should do on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// The backoff window elapsed: attempt a connection now.
    Reconnect,
    /// The connection idled past the heartbeat interval: send a ping.
    Ping,
    /// An outstanding ping missed its deadline: treat the wire as broken.
    ConnectionLost,
}

#[derive(Debug)]
pub struct Reconnect {
    state: ConnState,
    heartbeat_ms: u64,
    send_timeout_ms: u64,
}

impl Default for Reconnect {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconnect {
    /// Starts disconnected with an immediate first attempt due.
    pub fn new() -> Self {
        Self {
            state: ConnState::Backoff {
                attempt: 0,
                due_at_ms: 0,
            },
            heartbeat_ms: HEARTBEAT_IDLE_MS,
            send_timeout_ms: SEND_TIMEOUT_MS,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnState::Connected { .. })
    }

    pub fn on_connected(&mut self, now_ms: u64) {
        debug!("[reconnect] connected");
        self.state = ConnState::Connected {
            last_activity_ms: now_ms,
            ping_sent_ms: None,
        };
    }

    /// Schedule the next attempt: `min(cap, base * 2^attempt)` with ±50%
    /// jitter so a fleet of replicas does not thunder back in.
    pub fn on_disconnected(&mut self, now_ms: u64) {
        if self.state == ConnState::Closed {
            return;
        }
        let attempt = match self.state {
            ConnState::Backoff { attempt, .. } => attempt + 1,
            _ => 0,
        };
        let base = BACKOFF_BASE_MS
            .saturating_mul(1u64 << attempt.min(5))
            .min(BACKOFF_CAP_MS);
        let jittered = (base as f64 * rand::rng().random_range(0.5..1.5)) as u64;
        let delay = jittered.min(BACKOFF_CAP_MS);
        debug!("[reconnect] attempt {attempt} in {delay}ms");
        self.state = ConnState::Backoff {
            attempt,
            due_at_ms: now_ms + delay,
        };
    }

    /// Any inbound frame counts as liveness and clears the pong deadline.
    pub fn note_activity(&mut self, now_ms: u64) {
        if let ConnState::Connected { .. } = self.state {
            self.state = ConnState::Connected {
                last_activity_ms: now_ms,
                ping_sent_ms: None,
            };
        }
    }

    pub fn on_tick(&mut self, now_ms: u64) -> Option<TickAction> {
        match self.state {
            ConnState::Backoff { due_at_ms, .. } if now_ms >= due_at_ms => {
                Some(TickAction::Reconnect)
            }
            ConnState::Connected {
                last_activity_ms,
                ping_sent_ms,
            } => {
                if let Some(sent) = ping_sent_ms {
                    if now_ms.saturating_sub(sent) >= self.send_timeout_ms {
                        return Some(TickAction::ConnectionLost);
                    }
                    return None;
                }
                if now_ms.saturating_sub(last_activity_ms) >= self.heartbeat_ms {
                    self.state = ConnState::Connected {
                        last_activity_ms,
                        ping_sent_ms: Some(now_ms),
                    };
                    return Some(TickAction::Ping);
                }
                None
            }
            _ => None,
        }
    }

    /// Cancel all outstanding retries; the machine never fires again.
    pub fn close(&mut self) {
        self.state = ConnState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_due_immediately() {
        let mut r = Reconnect::new();
        assert_eq!(r.on_tick(0), Some(TickAction::Reconnect));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut r = Reconnect::new();
        let mut delays = Vec::new();
        let mut now = 0;
        for _ in 0..8 {
            r.on_disconnected(now);
            let ConnState::Backoff { due_at_ms, .. } = r.state() else {
                panic!("expected backoff");
            };
            delays.push(due_at_ms - now);
            now = due_at_ms;
        }
        // Jitter keeps every delay within [base/2, 1.5*base] and under the cap.
        assert!(delays[0] >= BACKOFF_BASE_MS / 2);
        for delay in &delays {
            assert!(*delay <= BACKOFF_CAP_MS);
        }
        // Later attempts dwarf the first one despite jitter.
        assert!(delays[5] > delays[0]);
    }

    #[test]
    fn idle_connection_pings_then_times_out() {
        let mut r = Reconnect::new();
        r.on_connected(0);
        assert_eq!(r.on_tick(HEARTBEAT_IDLE_MS - 1), None);
        assert_eq!(r.on_tick(HEARTBEAT_IDLE_MS), Some(TickAction::Ping));
        // No pong: the wire is declared broken after the send timeout.
        assert_eq!(
            r.on_tick(HEARTBEAT_IDLE_MS + SEND_TIMEOUT_MS),
            Some(TickAction::ConnectionLost)
        );
    }

    #[test]
    fn activity_clears_the_pong_deadline() {
        let mut r = Reconnect::new();
        r.on_connected(0);
        assert_eq!(r.on_tick(HEARTBEAT_IDLE_MS), Some(TickAction::Ping));
        r.note_activity(HEARTBEAT_IDLE_MS + 10);
        assert_eq!(r.on_tick(HEARTBEAT_IDLE_MS + SEND_TIMEOUT_MS), None);
    }

    #[test]
    fn closed_machine_never_fires() {
        let mut r = Reconnect::new();
        r.close();
        r.on_disconnected(0);
        assert_eq!(r.on_tick(u64::MAX), None);
    }
}
