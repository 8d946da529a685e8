//! Domain logic for the Lookout pairing relay: pairing tokens, the host/relay
//! wire messages, reconnect backoff policies, and the host session state
//! machine. Everything here is transport-free so the reconnect behaviour can
//! be tested by feeding events, without a network.

pub mod backoff;
pub mod protocol;
pub mod session;
pub mod token;

pub use backoff::{BackoffState, ReconnectPolicy};
pub use protocol::{HostHello, VisitorReport};
pub use session::{HostSession, HostStatus, SessionAction, SessionEvent, SessionPhase};
pub use token::{PairingToken, TokenError};
