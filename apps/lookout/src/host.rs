use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use lookout_core::{
    HostHello, HostSession, HostStatus, PairingToken, ReconnectPolicy, SessionAction,
    SessionEvent, SessionPhase, VisitorReport,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client side of one pairing: owns the websocket lifecycle, feeds transport
/// events into the `HostSession` state machine, and executes the actions it
/// hands back. Runs until teardown; transport failures never end the loop.
pub struct HostConnectionManager {
    token: PairingToken,
    socket_url: String,
    session: HostSession,
    status_tx: watch::Sender<HostStatus>,
    shutdown: watch::Receiver<bool>,
    pending_retry: Option<std::time::Duration>,
}

impl HostConnectionManager {
    pub fn new(
        token: PairingToken,
        server_url: &str,
        policy: ReconnectPolicy,
        status_tx: watch::Sender<HostStatus>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let socket_url = websocket_url(server_url, &token);
        Self {
            token,
            socket_url,
            session: HostSession::new(policy),
            status_tx,
            shutdown,
            pending_retry: None,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            match self.session.phase() {
                SessionPhase::TornDown => {
                    info!(token = %self.token, "host session torn down");
                    return Ok(());
                }
                SessionPhase::Connecting => {
                    if *self.shutdown.borrow() {
                        self.apply_all(SessionEvent::TeardownRequested);
                        continue;
                    }
                    // Teardown must not wait for a hung TCP connect.
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        connected = connect_async(&self.socket_url) => match connected {
                            Ok((stream, _)) => {
                                let actions = self.session.on_event(SessionEvent::Opened);
                                self.drive_open(stream, actions).await;
                            }
                            Err(err) => {
                                warn!(token = %self.token, error = %err, "host socket connect failed");
                                self.apply_all(SessionEvent::Closed);
                            }
                        },
                        _ = shutdown.changed() => {
                            self.apply_all(SessionEvent::TeardownRequested);
                        }
                    }
                }
                SessionPhase::ClosedRetrying => {
                    let Some(delay) = self.pending_retry.take() else {
                        self.apply_all(SessionEvent::TimerFired);
                        continue;
                    };
                    debug!(
                        token = %self.token,
                        delay_ms = delay.as_millis() as u64,
                        "reconnecting after delay"
                    );
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = sleep(delay) => {
                            self.apply_all(SessionEvent::TimerFired);
                        }
                        _ = shutdown.changed() => {
                            self.apply_all(SessionEvent::TeardownRequested);
                        }
                    }
                }
                // drive_open only returns once the phase has moved on, so an
                // Open here means a missed close event; resynchronise.
                SessionPhase::Open => self.apply_all(SessionEvent::Closed),
            }
        }
    }

    /// Services one open connection until it closes, errors, or teardown is
    /// requested.
    async fn drive_open(&mut self, stream: WsStream, open_actions: Vec<SessionAction>) {
        let (mut write, mut read) = stream.split();

        for action in open_actions {
            match action {
                SessionAction::SendRegistration => {
                    let hello = HostHello {
                        token: self.token.to_string(),
                    };
                    let payload = match serde_json::to_string(&hello) {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(token = %self.token, error = %err, "failed to encode registration");
                            continue;
                        }
                    };
                    if write.send(Message::Text(payload.into())).await.is_err() {
                        self.apply_all(SessionEvent::Closed);
                        return;
                    }
                }
                SessionAction::Publish(status) => self.publish(status),
                _ => {}
            }
        }

        info!(token = %self.token, "host connection open");

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let actions = self.session.on_event(SessionEvent::TeardownRequested);
                    if actions.contains(&SessionAction::CloseTransport) {
                        let _ = write.send(Message::Close(None)).await;
                    }
                    return;
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<VisitorReport>(&text) {
                                Ok(report) => self.apply_all(SessionEvent::Delivered(report)),
                                Err(err) => {
                                    // Protocol error: treated exactly like an
                                    // unexpected close, the retry machinery
                                    // takes it from here.
                                    warn!(token = %self.token, error = %err, "malformed frame from server; reconnecting");
                                    self.apply_all(SessionEvent::Closed);
                                    return;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(token = %self.token, "server closed the socket");
                            self.apply_all(SessionEvent::Closed);
                            return;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            warn!(token = %self.token, error = %err, "host socket error");
                            self.apply_all(SessionEvent::Closed);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn apply_all(&mut self, event: SessionEvent) {
        for action in self.session.on_event(event) {
            match action {
                SessionAction::ScheduleRetry(delay) => self.pending_retry = Some(delay),
                SessionAction::Publish(status) => self.publish(status),
                // Connect and SendRegistration are driven by the run loop;
                // CloseTransport only applies while a socket is held.
                _ => {}
            }
        }
    }

    fn publish(&self, status: HostStatus) {
        let _ = self.status_tx.send(status);
    }
}

/// Builds the host socket URL from an http(s) or ws(s) base, embedding the
/// token as the final path segment.
fn websocket_url(base: &str, token: &PairingToken) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    let ws_base = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    };
    format!("{ws_base}/host/{token}")
}
