//! Transport negotiation (plain, TLS, SSH tunnel)

mod negotiator;

pub use negotiator::{NegotiatedTransport, TransportNegotiator};
