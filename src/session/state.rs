//! Session role and signaling state

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// Glare tie-break role, fixed when the session is built
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Yields: rolls back its own offer when offers collide
    Polite,
    /// Wins: ignores a colliding remote offer
    Impolite,
}

impl Role {
    /// The side that creates the data channel is impolite.
    pub fn for_channel_creator(created_data_channel: bool) -> Self {
        if created_data_channel {
            Role::Impolite
        } else {
            Role::Polite
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Polite => write!(f, "polite"),
            Role::Impolite => write!(f, "impolite"),
        }
    }
}

/// Offer/answer state of a session
#[typeshare]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingState {
    /// Nothing exchanged yet
    #[default]
    Idle,
    HaveLocalOffer,
    HaveRemoteOffer,
    /// Rolling back the local offer to take the remote one
    RollbackPending,
    Stable,
}

impl SignalingState {
    /// No offer outstanding
    pub fn is_stable(&self) -> bool {
        matches!(self, SignalingState::Idle | SignalingState::Stable)
    }
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalingState::Idle => write!(f, "idle"),
            SignalingState::HaveLocalOffer => write!(f, "have-local-offer"),
            SignalingState::HaveRemoteOffer => write!(f, "have-remote-offer"),
            SignalingState::RollbackPending => write!(f, "rollback-pending"),
            SignalingState::Stable => write!(f, "stable"),
        }
    }
}
