use std::time::Duration;

use crate::backoff::{BackoffState, ReconnectPolicy};
use crate::protocol::VisitorReport;

/// Transport lifecycle of one host session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Open,
    ClosedRetrying,
    /// Terminal. Reachable only from an explicit local teardown, never from
    /// a network event.
    TornDown,
}

/// What the rendering layer sees. Exactly three user-visible states;
/// transport detail stays in the logs.
#[derive(Debug, Clone, PartialEq)]
pub enum HostStatus {
    AwaitingVisitor,
    Delivered(VisitorReport),
    ConnectionError,
}

/// Discrete inputs to the state machine. The async runner translates real
/// transport callbacks into these.
#[derive(Debug)]
pub enum SessionEvent {
    /// Transport established.
    Opened,
    /// Transport closed or failed without a local teardown request.
    Closed,
    /// The scheduled reconnect timer elapsed.
    TimerFired,
    /// Local shutdown (page close, ctrl-c).
    TeardownRequested,
    /// The relay pushed a visitor report down the transport.
    Delivered(VisitorReport),
}

/// Side effects the runner must perform after feeding an event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Begin a connection attempt.
    Connect,
    /// Send the registration frame carrying the token.
    SendRegistration,
    /// Arm the reconnect timer. The timer must be cancellable by teardown.
    ScheduleRetry(Duration),
    /// Close the transport if it is still open.
    CloseTransport,
    /// Surface a status change to the rendering layer.
    Publish(HostStatus),
}

/// Per-session state machine: `Connecting -> Open -> ClosedRetrying ->
/// Connecting -> ...`, with unbounded retries and a terminal `TornDown`.
///
/// Reconnection reuses the same pairing token, so the token itself never
/// appears here; the runner owns it.
pub struct HostSession {
    phase: SessionPhase,
    backoff: BackoffState,
    delivered: bool,
}

impl HostSession {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            phase: SessionPhase::Connecting,
            backoff: BackoffState::new(policy),
            delivered: false,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn on_event(&mut self, event: SessionEvent) -> Vec<SessionAction> {
        use SessionAction as A;
        use SessionEvent as E;
        use SessionPhase as P;

        match (self.phase, event) {
            (P::TornDown, _) => Vec::new(),
            (phase, E::TeardownRequested) => {
                self.phase = P::TornDown;
                if phase == P::Open {
                    vec![A::CloseTransport]
                } else {
                    Vec::new()
                }
            }
            (P::Connecting, E::Opened) => {
                self.phase = P::Open;
                self.backoff.reset();
                let mut actions = vec![A::SendRegistration];
                // A result already shown to the user survives reconnects.
                if !self.delivered {
                    actions.push(A::Publish(HostStatus::AwaitingVisitor));
                }
                actions
            }
            (P::Connecting | P::Open, E::Closed) => {
                self.phase = P::ClosedRetrying;
                let delay = self.backoff.next_delay();
                let mut actions = Vec::new();
                if !self.delivered {
                    actions.push(A::Publish(HostStatus::ConnectionError));
                }
                actions.push(A::ScheduleRetry(delay));
                actions
            }
            (P::ClosedRetrying, E::TimerFired) => {
                self.phase = P::Connecting;
                vec![A::Connect]
            }
            (P::Open, E::Delivered(report)) => {
                self.delivered = true;
                vec![A::Publish(HostStatus::Delivered(report))]
            }
            _ => Vec::new(),
        }
    }
}
