//! Message bus: envelopes, kinds and recipient routing.

pub mod envelope;
pub mod router;

pub use envelope::{Envelope, MessageKind, agents, meta};
pub use router::{AgentEndpoint, MessageRouter};
