use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// First frame a host sends after its socket opens.
///
/// The token is already carried by the connection path, so the server
/// tolerates this frame but never requires it; it stays on the wire for
/// compatibility with hosts that still send it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostHello {
    pub token: String,
}

/// Payload relayed to the host when a visitor opens the share link.
///
/// Forwarded verbatim from the visitor-facing HTTP handler; absent fields
/// serialize as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorReport {
    pub user_agent: String,
    pub ip: Option<String>,
    pub reverse_dns: Option<String>,
    pub observed_at: DateTime<Utc>,
}
