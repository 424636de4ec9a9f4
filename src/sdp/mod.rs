//! Session description munging
//!
//! Pure functions that rewrite the opus configuration carried inside an
//! offer or answer before it is handed to the transport.

pub mod munge;
pub mod opus;

pub use munge::{
    apply_opus_parameters, apply_track_parameters, format_fmtp_config, parse_fmtp_config,
    read_fmtp_config, read_opus_parameters,
};
pub use opus::{OpusCodecParameters, MAX_AVERAGE_BITRATE, MIN_AVERAGE_BITRATE};
