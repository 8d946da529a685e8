use metrics::counter;
use tracing::debug;

use lookout_core::{PairingToken, VisitorReport};

use crate::registry::ConnectionRegistry;

/// Outcome of a delivery attempt. The relay is best-effort and at-most-once:
/// a report that finds no live host connection is dropped, never queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Dropped,
}

/// Matches an incoming visitor event to the host connection currently
/// registered under its token and pushes the payload exactly once.
#[derive(Clone)]
pub struct DeliveryRelay {
    registry: ConnectionRegistry,
}

impl DeliveryRelay {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn deliver(&self, token: &PairingToken, report: VisitorReport) -> Delivery {
        let Some(handle) = self.registry.lookup(token) else {
            counter!("lookout_visitor_dropped_total", 1, "reason" => "no_host");
            debug!(%token, "visitor report dropped; no live host connection");
            return Delivery::Dropped;
        };

        match handle.forward(report) {
            Ok(()) => {
                counter!("lookout_visitor_delivered_total", 1);
                debug!(%token, connection_id = %handle.connection_id(), "visitor report delivered");
                Delivery::Delivered
            }
            // The handle was superseded or its socket task already exited;
            // rejecting here keeps the race invisible to the visitor.
            Err(_) => {
                counter!("lookout_visitor_dropped_total", 1, "reason" => "superseded");
                debug!(%token, "visitor report dropped; handle no longer live");
                Delivery::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HostHandle;
    use chrono::Utc;
    use tokio::sync::mpsc;

    fn report(ua: &str) -> VisitorReport {
        VisitorReport {
            user_agent: ua.to_string(),
            ip: Some("203.0.113.5".to_string()),
            reverse_dns: None,
            observed_at: Utc::now(),
        }
    }

    fn token(s: &str) -> PairingToken {
        s.parse().unwrap()
    }

    #[test]
    fn delivery_without_a_host_is_dropped_without_side_effects() {
        let registry = ConnectionRegistry::new();
        let relay = DeliveryRelay::new(registry.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(token("abc123"), HostHandle::new(tx));

        assert_eq!(
            relay.deliver(&token("zzz999"), report("Mozilla/5.0 Test")),
            Delivery::Dropped
        );
        // The unrelated registration saw nothing.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn delivery_pushes_the_payload_exactly_once() {
        let registry = ConnectionRegistry::new();
        let relay = DeliveryRelay::new(registry.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(token("abc123"), HostHandle::new(tx));

        let sent = report("Mozilla/5.0 Test");
        assert_eq!(
            relay.deliver(&token("abc123"), sent.clone()),
            Delivery::Delivered
        );
        assert_eq!(rx.try_recv().unwrap(), sent);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn each_visit_is_delivered_independently() {
        let registry = ConnectionRegistry::new();
        let relay = DeliveryRelay::new(registry.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(token("abc123"), HostHandle::new(tx));

        relay.deliver(&token("abc123"), report("first"));
        relay.deliver(&token("abc123"), report("second"));
        assert_eq!(rx.try_recv().unwrap().user_agent, "first");
        assert_eq!(rx.try_recv().unwrap().user_agent, "second");
    }

    #[test]
    fn delivery_to_a_dead_handle_is_dropped() {
        let registry = ConnectionRegistry::new();
        let relay = DeliveryRelay::new(registry.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(token("abc123"), HostHandle::new(tx));
        drop(rx);

        assert_eq!(
            relay.deliver(&token("abc123"), report("Mozilla/5.0 Test")),
            Delivery::Dropped
        );
    }
}
