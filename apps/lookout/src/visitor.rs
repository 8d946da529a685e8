use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header::USER_AGENT, HeaderMap},
    response::Html,
};
use chrono::Utc;
use tokio::time::{timeout, Duration};
use tracing::debug;

use lookout_core::{PairingToken, VisitorReport};

use crate::relay::Delivery;
use crate::AppState;

const SHARE_PAGE: &str = r#"<!DOCTYPE html>
<html>
  <head><title>Browser details shared</title></head>
  <body>
    <main>
      <h1>Thanks!</h1>
      <p>Your browser details were just shown to the person who sent you this link.</p>
    </main>
  </body>
</html>
"#;

/// Visitor-facing side of a pairing, served at `GET /share-with/:token`.
///
/// Builds a visitor record from the request and hands it to the relay. The
/// page looks identical whether the token was live, stale, or nonsense, so
/// the response is no oracle for token guessing.
pub async fn share_link_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Html<&'static str> {
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let ip = client_ip(&headers, remote_addr);
    let reverse_dns = match ip {
        Some(addr) if state.config.reverse_dns_enabled => state.reverse_dns(addr).await,
        _ => None,
    };

    let report = VisitorReport {
        user_agent,
        ip: ip.map(|addr| addr.to_string()),
        reverse_dns,
        observed_at: Utc::now(),
    };

    match token.parse::<PairingToken>() {
        Ok(token) => match state.relay.deliver(&token, report) {
            Delivery::Delivered => debug!(%token, "visitor event delivered"),
            Delivery::Dropped => debug!(%token, "visitor event dropped"),
        },
        Err(_) => debug!("visitor hit a malformed share link"),
    }

    Html(SHARE_PAGE)
}

/// Prefers the first `X-Forwarded-For` hop (the service runs behind a
/// proxy in production), falling back to the socket peer address.
fn client_ip(headers: &HeaderMap, remote_addr: SocketAddr) -> Option<IpAddr> {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(addr) = first.trim().parse::<IpAddr>() {
                return Some(addr);
            }
        }
    }
    Some(remote_addr.ip())
}

impl AppState {
    /// Best-effort PTR lookup, bounded by the configured timeout. Failures
    /// and timeouts degrade to `None`; the visitor record never blocks on
    /// DNS health.
    pub async fn reverse_dns(&self, addr: IpAddr) -> Option<String> {
        let resolver = self.resolver.as_ref()?;
        let deadline = Duration::from_millis(self.config.reverse_dns_timeout_ms);
        match timeout(deadline, resolver.reverse_lookup(addr)).await {
            Ok(Ok(lookup)) => lookup
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string()),
            Ok(Err(err)) => {
                debug!(%addr, error = %err, "reverse dns lookup failed");
                None
            }
            Err(_) => {
                debug!(%addr, "reverse dns lookup timed out");
                None
            }
        }
    }
}
