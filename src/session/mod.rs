//! Per-participant negotiation sessions
//!
//! - [`negotiation`]: the offer/answer state machine
//! - [`driver`]: one tokio task per session, executing the machine's effects
//! - [`registry`]: participant id to session map, relay message routing

pub mod driver;
pub mod negotiation;
pub mod registry;
pub mod state;
pub mod track;

#[cfg(test)]
pub(crate) mod testing;

pub use driver::{SessionDriver, SessionStatus};
pub use negotiation::{Effect, NegotiationSession, SessionEvent, SessionSettings, SignalRoute};
pub use registry::{RemoteParticipant, SessionInfo, SessionRegistry};
pub use state::{Role, SignalingState};
pub use track::{MediaKind, Mid, PreferredCodec, QualityMode, TrackNegotiationRecord};
