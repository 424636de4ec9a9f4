//! duet - peer-to-peer call negotiation engine
//!
//! Per-participant WebRTC offer/answer with perfect-negotiation glare
//! handling, Opus format-parameter injection, statistics rate tracking and
//! loss-driven FEC adaptation.

pub mod config;
pub mod error;
pub mod events;
pub mod rtc;
pub mod sdp;
pub mod session;
pub mod stats;
pub mod utils;

pub use error::{AppError, Result};
